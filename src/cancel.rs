//! Cancellation and deadlines for blocking USB transfers.

use crate::error::{Error, Result};
use log::warn;
use std::sync::mpsc::{self, TryRecvError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

struct Inner {
    cancelled: Mutex<bool>,
    wakeup: Condvar,
    deadline: Option<Instant>,
}

/// Signal which aborts waiting for a device operation, either explicitly or once a deadline
/// passes.
///
/// Clones share their state: cancelling one clone cancels all of them. Cancellation only stops the
/// caller from waiting. A transfer which is already in flight on the bus is not aborted and its
/// result is dropped when it eventually arrives.
///
/// # Examples
/// ```rust
/// use fastboot::CancelToken;
/// use std::time::Duration;
///
/// let token = CancelToken::with_timeout(Duration::from_secs(5));
/// assert!(!token.is_cancelled());
///
/// token.clone().cancel();
/// assert!(token.is_cancelled());
/// ```
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .field("deadline", &self.inner.deadline)
            .finish()
    }
}

impl CancelToken {
    /// Creates a token without a deadline. It only fires when [`cancel`] is called.
    ///
    /// [`cancel`]: #method.cancel
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Creates a token which fires after the given duration.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::build(Instant::now().checked_add(timeout))
    }

    /// Creates a token which fires at the given point in time.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self::build(Some(deadline))
    }

    fn build(deadline: Option<Instant>) -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: Mutex::new(false),
                wakeup: Condvar::new(),
                deadline,
            }),
        }
    }

    /// Fires the token. Every operation currently waiting on it returns [`Error::Timeout`].
    ///
    /// [`Error::Timeout`]: enum.Error.html#variant.Timeout
    pub fn cancel(&self) {
        *self.lock() = true;
        self.inner.wakeup.notify_all();
    }

    /// Whether the token was cancelled or its deadline has passed.
    pub fn is_cancelled(&self) -> bool {
        *self.lock() || self.deadline_passed()
    }

    /// Time left until the deadline, or `None` if the token has no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    fn deadline_passed(&self) -> bool {
        self.inner
            .deadline
            .map_or(false, |deadline| Instant::now() >= deadline)
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        // Taking the lock orders the notification after the waiter's check for a result
        let _guard = self.lock();
        self.inner.wakeup.notify_all();
    }

    /// Runs a blocking operation on its own thread and waits until it completes or the token fires,
    /// whichever comes first. The operation receives a clone of the token so it can bound its own
    /// transfer timeout.
    pub(crate) fn race<T, F>(&self, operation: F) -> Result<T>
    where
        F: FnOnce(CancelToken) -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.is_cancelled() {
            return Err(Error::Timeout);
        }

        let (sender, receiver) = mpsc::channel();
        let token = self.clone();
        thread::Builder::new()
            .name("fastboot-io".into())
            .spawn(move || {
                // Wakes the waiter even if the operation panics. Declared first so it runs after
                // the sender is gone.
                let _wake = Wake(token.clone());
                let sender = sender;
                if sender.send(operation(token)).is_err() {
                    warn!("Discarding a transfer that completed after cancellation");
                }
            })?;

        let mut cancelled = self.lock();
        loop {
            let fired = *cancelled || self.deadline_passed();
            match receiver.try_recv() {
                // The transfer's own timeout may end it at the deadline, the token still wins
                Ok(_) if fired => return Err(Error::Timeout),
                Ok(result) => return Ok(result),
                Err(TryRecvError::Disconnected) => return Err(rusb::Error::Other.into()),
                Err(TryRecvError::Empty) => {}
            }
            if fired {
                return Err(Error::Timeout);
            }
            cancelled = match self.remaining() {
                Some(remaining) => {
                    self.inner
                        .wakeup
                        .wait_timeout(cancelled, remaining)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .inner
                    .wakeup
                    .wait(cancelled)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }
}

struct Wake(CancelToken);

impl Drop for Wake {
    fn drop(&mut self) {
        self.0.notify();
    }
}
