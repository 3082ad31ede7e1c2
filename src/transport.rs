//! The pair of bulk endpoints a [`Protocol`] talks through.
//!
//! [`Protocol`]: ../struct.Protocol.html

use crate::cancel::CancelToken;
use crate::TIMEOUT;
use rusb::{DeviceHandle, UsbContext};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// Endpoint the device sends its responses through.
pub trait InEndpoint: Send + Sync + 'static {
    /// Size of the largest transfer the endpoint delivers at once.
    fn max_packet_size(&self) -> usize;

    /// Reads a single transfer into `buffer`, returning its length.
    fn read(&self, buffer: &mut [u8], cancel: &CancelToken) -> rusb::Result<usize>;
}

/// Endpoint commands and download data are written to.
pub trait OutEndpoint: Send + Sync + 'static {
    /// Size of the largest packet the endpoint accepts.
    fn max_packet_size(&self) -> usize;

    /// Writes `data` in a single bulk transfer, returning the number of bytes written.
    fn write(&self, data: &[u8], cancel: &CancelToken) -> rusb::Result<usize>;
}

/// Callback releasing the USB interface the endpoints belong to. Called at most once.
pub type Release = Box<dyn FnOnce() + Send>;

/// A bulk endpoint of a claimed interface on a device opened through `rusb`.
///
/// Both endpoints of an interface share the device handle. The handle is closed once the last
/// endpoint is dropped.
pub struct UsbEndpoint<T: UsbContext> {
    handle: Arc<RwLock<DeviceHandle<T>>>,
    address: u8,
    max_packet_size: usize,
    timeout: Duration,
}

impl<T: UsbContext> UsbEndpoint<T> {
    pub(crate) fn new(
        handle: Arc<RwLock<DeviceHandle<T>>>,
        address: u8,
        max_packet_size: u16,
    ) -> Self {
        Self {
            handle,
            address,
            max_packet_size: max_packet_size as usize,
            timeout: TIMEOUT,
        }
    }

    /// Timeout used for transfers when the cancellation token has no deadline.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Picks the timeout for the next transfer. libusb treats zero as "wait forever", so a token
    /// whose deadline has already passed must not reach it.
    fn transfer_timeout(&self, cancel: &CancelToken) -> rusb::Result<Duration> {
        match cancel.remaining() {
            Some(remaining) if remaining.is_zero() => Err(rusb::Error::Timeout),
            Some(remaining) => Ok(remaining),
            None => Ok(self.timeout),
        }
    }
}

impl<T: UsbContext + 'static> InEndpoint for UsbEndpoint<T> {
    fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    fn read(&self, buffer: &mut [u8], cancel: &CancelToken) -> rusb::Result<usize> {
        let timeout = self.transfer_timeout(cancel)?;
        let handle = self.handle.read().unwrap_or_else(PoisonError::into_inner);
        handle.read_bulk(self.address, buffer, timeout)
    }
}

impl<T: UsbContext + 'static> OutEndpoint for UsbEndpoint<T> {
    fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    fn write(&self, data: &[u8], cancel: &CancelToken) -> rusb::Result<usize> {
        let timeout = self.transfer_timeout(cancel)?;
        let handle = self.handle.read().unwrap_or_else(PoisonError::into_inner);
        handle.write_bulk(self.address, data, timeout)
    }
}
