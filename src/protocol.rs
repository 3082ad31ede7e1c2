use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::operation::{Download, Operation};
use crate::status::{Status, STATUS_LENGTH};
use crate::transport::{InEndpoint, OutEndpoint, Release};
use log::{debug, trace, warn};
use std::io::{ErrorKind, Read};
use std::sync::Arc;

/// Largest amount of data sent in a single bulk transfer during a download.
pub const CHUNK_SIZE: usize = 0x40040;

/// Low-level connection to a fastboot device: sends raw commands and data, reads responses and
/// runs the download data phase.
///
/// Every transfer runs on its own thread and races against a [`CancelToken`]. The protocol is
/// strictly request/response, so a connection must not be used for a second exchange while a
/// response is outstanding.
///
/// [`CancelToken`]: struct.CancelToken.html
pub struct Protocol {
    /// Endpoint responses are read from. `None` once closed.
    input: Option<Arc<dyn InEndpoint>>,

    /// Endpoint commands and data are written to. `None` once closed.
    output: Option<Arc<dyn OutEndpoint>>,

    /// Releases the USB interface, taken on close.
    release: Option<Release>,

    max_packet_size: usize,
}

impl Protocol {
    /// Takes ownership of an endpoint pair. `release` is called exactly once, when the connection
    /// is closed or dropped.
    pub fn new<I, O>(input: I, output: O, release: Release) -> Self
    where
        I: InEndpoint,
        O: OutEndpoint,
    {
        Self {
            max_packet_size: input.max_packet_size(),
            input: Some(Arc::new(input)),
            output: Some(Arc::new(output)),
            release: Some(release),
        }
    }

    /// Whether [`close`] has been called.
    ///
    /// [`close`]: #method.close
    pub fn is_closed(&self) -> bool {
        self.input.is_none()
    }

    /// Size of the largest response frame, including the status token.
    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Writes `data` to the device in a single transfer.
    pub fn send(&mut self, cancel: &CancelToken, data: &[u8]) -> Result<()> {
        let output = self.output.clone().ok_or(Error::DeviceClosed)?;
        let data = data.to_vec();
        let written = cancel.race(move |cancel| output.write(&data, &cancel))??;
        trace!("Wrote {} bytes", written);
        Ok(())
    }

    /// Reads a single response frame and splits it into its status and payload.
    ///
    /// A frame too short to hold a status token is reported as [`Status::Fail`] with an empty
    /// payload.
    ///
    /// [`Status::Fail`]: enum.Status.html#variant.Fail
    pub fn read_response(&mut self, cancel: &CancelToken) -> Result<(Status, Vec<u8>)> {
        let input = self.input.clone().ok_or(Error::DeviceClosed)?;
        let length = self.max_packet_size;
        let mut frame = cancel.race(move |cancel| {
            let mut buffer = vec![0u8; length];
            input.read(&mut buffer, &cancel).map(|read| {
                buffer.truncate(read);
                buffer
            })
        })??;

        let status = Status::decode(&frame);
        if frame.len() < STATUS_LENGTH {
            warn!("Malformed response frame of {} bytes", frame.len());
            frame.clear();
        } else {
            frame.drain(..STATUS_LENGTH);
        }
        debug!(
            "Response {}: {}",
            status,
            String::from_utf8_lossy(&frame)
        );
        Ok((status, frame))
    }

    /// Transfers `image` into the device's download buffer.
    pub fn download(&mut self, cancel: &CancelToken, image: &[u8]) -> Result<()> {
        self.download_chunks(cancel, image)?.execute()
    }

    /// Announces a download of `image` and returns the data phase as an [`Operation`], which
    /// sends one chunk per step and can be used for progress feedback.
    ///
    /// # Example
    /// ```rust, no_run
    /// use fastboot::{CancelToken, Context, Operation};
    /// use std::time::Duration;
    ///
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let context = Context::new()?;
    /// let mut device = context.pick_device(None)?.open(&context)?;
    /// let cancel = CancelToken::with_timeout(Duration::from_secs(60));
    /// let image = vec![0u8; 1 << 20];
    ///
    /// let download = device.protocol().download_chunks(&cancel, &image)?;
    /// let total = download.total();
    /// for sent in download {
    ///     println!("{}/{}", sent?, total);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// [`Operation`]: trait.Operation.html
    pub fn download_chunks<'d>(
        &mut self,
        cancel: &CancelToken,
        image: &'d [u8],
    ) -> Result<Download<'d, '_>> {
        self.start_download(cancel, image.len() as u64)?;
        Ok(Download::new(self, cancel.clone(), image))
    }

    /// Transfers `size` bytes read from `reader` into the device's download buffer. The reader is
    /// not read past `size` bytes.
    pub fn download_reader<R: Read>(
        &mut self,
        cancel: &CancelToken,
        reader: R,
        size: u64,
    ) -> Result<()> {
        self.start_download(cancel, size)?;

        let mut reader = reader.take(size);
        let mut buffer = vec![0u8; CHUNK_SIZE];
        loop {
            let read = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(read) => read,
                Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                Err(error) => return Err(error.into()),
            };
            self.send(cancel, &buffer[..read])?;
        }

        self.finish_download(cancel)
    }

    /// Sends the download command and waits for the device to accept the data phase.
    fn start_download(&mut self, cancel: &CancelToken, size: u64) -> Result<()> {
        if self.is_closed() {
            return Err(Error::DeviceClosed);
        }
        if size > u64::from(u32::MAX) {
            return Err(Error::ImageTooLarge(size));
        }

        let command = format!("download:{:08x}", size);
        debug!("Sending command {}", command);
        self.send(cancel, command.as_bytes())?;

        match self.read_response(cancel)? {
            (Status::Fail, payload) => Err(Error::StatusFail(payload)),
            (Status::Data, _) => Ok(()),
            // Some bootloaders skip the DATA frame, only FAIL aborts the download
            (status, _) => {
                debug!("Expected DATA, got {}; continuing", status);
                Ok(())
            }
        }
    }

    /// Reads the response concluding the data phase.
    pub(crate) fn finish_download(&mut self, cancel: &CancelToken) -> Result<()> {
        match self.read_response(cancel)? {
            (Status::Fail, payload) => Err(Error::StatusFail(payload)),
            _ => Ok(()),
        }
    }

    /// Closes the connection: releases the USB interface and drops both endpoints, which closes
    /// the device handle. Further calls do nothing.
    pub fn close(&mut self) {
        if let Some(release) = self.release.take() {
            debug!("Closing connection");
            release();
        }
        // A transfer abandoned after a timeout keeps the handle open until it ends
        self.input = None;
        self.output = None;
    }
}

impl Drop for Protocol {
    fn drop(&mut self) {
        self.close();
    }
}
