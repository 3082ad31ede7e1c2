//! Scripted stand-in for a device's endpoint pair.

use crate::cancel::CancelToken;
use crate::protocol::Protocol;
use crate::transport::{InEndpoint, OutEndpoint};
use std::collections::VecDeque;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Default)]
struct State {
    responses: VecDeque<Vec<u8>>,
    endless: Option<Vec<u8>>,
    writes: Vec<Vec<u8>>,
    write_attempts: usize,
    failing_write: Option<usize>,
    read_gate: Option<Receiver<()>>,
    reads_time_out: bool,
    write_gate: Option<Receiver<()>>,
    reads: usize,
    releases: usize,
}

#[derive(Clone, Default)]
pub(crate) struct MockDevice {
    state: Arc<Mutex<State>>,
}

impl MockDevice {
    pub(crate) fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        Self::default()
    }

    /// Wraps the mock in a connection whose release callback is counted.
    pub(crate) fn protocol(&self) -> Protocol {
        let state = Arc::clone(&self.state);
        Protocol::new(
            self.clone(),
            self.clone(),
            Box::new(move || state.lock().unwrap().releases += 1),
        )
    }

    /// Queues a raw frame for the next read.
    pub(crate) fn respond(&self, frame: &[u8]) {
        self.state.lock().unwrap().responses.push_back(frame.to_vec());
    }

    /// Frame returned by every read once the queue is exhausted.
    pub(crate) fn respond_forever(&self, frame: &[u8]) {
        self.state.lock().unwrap().endless = Some(frame.to_vec());
    }

    /// Makes the write with the given zero-based index fail.
    pub(crate) fn fail_write(&self, index: usize) {
        self.state.lock().unwrap().failing_write = Some(index);
    }

    /// Makes every read wait out the token's deadline and then fail like a libusb timeout.
    pub(crate) fn time_out_reads(&self) {
        self.state.lock().unwrap().reads_time_out = true;
    }

    /// Holds the next read until something is sent through the returned channel.
    pub(crate) fn block_next_read(&self) -> Sender<()> {
        let (sender, receiver) = channel();
        self.state.lock().unwrap().read_gate = Some(receiver);
        sender
    }

    /// Holds the next write until something is sent through the returned channel.
    pub(crate) fn block_next_write(&self) -> Sender<()> {
        let (sender, receiver) = channel();
        self.state.lock().unwrap().write_gate = Some(receiver);
        sender
    }

    /// Successful writes, in order.
    pub(crate) fn writes(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().writes.clone()
    }

    /// Completed reads.
    pub(crate) fn reads(&self) -> usize {
        self.state.lock().unwrap().reads
    }

    pub(crate) fn releases(&self) -> usize {
        self.state.lock().unwrap().releases
    }
}

impl InEndpoint for MockDevice {
    fn max_packet_size(&self) -> usize {
        512
    }

    fn read(&self, buffer: &mut [u8], cancel: &CancelToken) -> rusb::Result<usize> {
        if self.state.lock().unwrap().reads_time_out {
            thread::sleep(cancel.remaining().unwrap_or_default());
            return Err(rusb::Error::Timeout);
        }

        let gate = self.state.lock().unwrap().read_gate.take();
        if let Some(gate) = gate {
            let _ = gate.recv();
        }

        let mut state = self.state.lock().unwrap();
        state.reads += 1;
        let next = state.responses.pop_front();
        let frame = match next {
            Some(frame) => frame,
            None => {
                let endless = state.endless.clone();
                drop(state);
                match endless {
                    Some(frame) => {
                        thread::sleep(Duration::from_millis(1));
                        frame
                    }
                    None => return Err(rusb::Error::Timeout),
                }
            }
        };
        let length = frame.len().min(buffer.len());
        buffer[..length].copy_from_slice(&frame[..length]);
        Ok(length)
    }
}

impl OutEndpoint for MockDevice {
    fn max_packet_size(&self) -> usize {
        512
    }

    fn write(&self, data: &[u8], _cancel: &CancelToken) -> rusb::Result<usize> {
        let gate = self.state.lock().unwrap().write_gate.take();
        if let Some(gate) = gate {
            let _ = gate.recv();
        }

        let mut state = self.state.lock().unwrap();
        let attempt = state.write_attempts;
        state.write_attempts += 1;
        if state.failing_write == Some(attempt) {
            return Err(rusb::Error::Io);
        }
        state.writes.push(data.to_vec());
        Ok(data.len())
    }
}
