use std::result::Result as StdResult;
use thiserror::Error as ThisError;

/// Errors which can occur during device setup and communication.
#[derive(Debug, ThisError)]
pub enum Error {
    /// An operation was attempted on a connection which has already been closed.
    #[error("connection is closed")]
    DeviceClosed,

    /// The cancellation token fired before the USB transfer completed.
    #[error("operation timed out")]
    Timeout,

    /// An error occurred during the raw USB communication.
    #[error("USB transport error: {0}")]
    Transport(#[from] rusb::Error),

    /// The device answered with `FAIL`. Contains the raw message the device sent along.
    #[error("device reported failure: {}", String::from_utf8_lossy(.0))]
    StatusFail(Vec<u8>),

    /// `getvar:all` was requested through the single variable accessor. Use
    /// [`Device::get_all_variables`] instead.
    ///
    /// [`Device::get_all_variables`]: struct.Device.html#method.get_all_variables
    #[error("use get_all_variables to query all variables")]
    UseGetVarAll,

    /// The image does not fit the eight hex digits of the download command.
    #[error("image of {0} bytes is too large to download")]
    ImageTooLarge(u64),

    /// Reading the image source or starting an I/O thread failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// It was attempted to open a connection to a device which does not exist.
    #[error("device not found")]
    DeviceNotFound,

    /// The request was not specific enough and returned in multiple matches where only a single one
    /// is supported.
    #[error("too many matches")]
    TooManyMatches,

    /// The USB device does not expose the bulk endpoints of a fastboot interface.
    #[error("device is unsupported")]
    UnsupportedDevice,
}

impl Error {
    /// Returns the message attached to a `FAIL` response, if this error is one.
    pub fn status_payload(&self) -> Option<&[u8]> {
        match self {
            Error::StatusFail(payload) => Some(payload),
            _ => None,
        }
    }
}

/// Shorthand for a Result with the crate's own Error type.
pub type Result<T> = StdResult<T, Error>;
