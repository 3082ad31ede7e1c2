use std::slice::Chunks;

use super::cancel::CancelToken;
use super::error::Result;
use super::protocol::{Protocol, CHUNK_SIZE};

/// A multi-step transfer which reports its progress. Each step yields the number of bytes
/// processed so far; the iterator stops after the first error.
pub trait Operation: Iterator<Item = Result<usize>> {
    /// Number of bytes the whole operation processes.
    fn total(&self) -> usize;

    /// Runs the remaining steps without progress feedback.
    fn execute(&mut self) -> Result<()> {
        if let Some(Err(error)) = self.last() {
            Err(error)
        } else {
            Ok(())
        }
    }
}

/// Data phase of a download, started by [`Protocol::download_chunks`].
///
/// Every step sends one chunk of the image. The step sending the last chunk also reads the
/// device's final response, so a successful last step means the device accepted the whole image.
///
/// [`Protocol::download_chunks`]: struct.Protocol.html#method.download_chunks
pub struct Download<'d, 'p> {
    protocol: &'p mut Protocol,
    cancel: CancelToken,
    chunks: Chunks<'d, u8>,
    length: usize,
    sent: usize,
    done: bool,
}

impl Operation for Download<'_, '_> {
    fn total(&self) -> usize {
        self.length
    }
}

impl Iterator for Download<'_, '_> {
    type Item = Result<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        // An empty image has no chunks, but the final response still has to be read
        let result = match self.chunks.next() {
            Some(chunk) => self.send_chunk(chunk),
            None => self.finish(),
        };

        if result.is_err() {
            // Ensure that the iterator is fused after an error occurs
            self.done = true;
        }
        Some(result)
    }
}

impl<'d, 'p> Download<'d, 'p> {
    pub(crate) fn new(protocol: &'p mut Protocol, cancel: CancelToken, image: &'d [u8]) -> Self {
        Self {
            protocol,
            cancel,
            chunks: image.chunks(CHUNK_SIZE),
            length: image.len(),
            sent: 0,
            done: false,
        }
    }

    fn send_chunk(&mut self, chunk: &[u8]) -> Result<usize> {
        self.protocol.send(&self.cancel, chunk)?;
        self.sent += chunk.len();
        log::trace!("Sent {}/{} bytes", self.sent, self.length);

        if self.chunks.len() == 0 {
            self.finish()
        } else {
            Ok(self.sent)
        }
    }

    fn finish(&mut self) -> Result<usize> {
        self.done = true;
        self.protocol.finish_download(&self.cancel)?;
        Ok(self.sent)
    }
}
