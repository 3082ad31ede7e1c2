//! Decoding of the status token every fastboot response starts with.

use std::fmt;

/// Length of the ASCII status token at the start of each response frame.
pub const STATUS_LENGTH: usize = 4;

/// Kind of a response frame sent by the device.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Status {
    /// The command completed successfully.
    Okay,

    /// The command failed. The payload holds a message from the device.
    Fail,

    /// The device is ready to receive the announced amount of data.
    Data,

    /// An informational line. Any number of them may precede `Okay` or `Fail`.
    Info,
}

impl Status {
    /// Maps the first four bytes of a frame to a status. Unknown tokens and frames shorter than
    /// four bytes decode as [`Status::Fail`].
    ///
    /// # Examples
    ///
    /// ```rust
    /// use fastboot::Status;
    ///
    /// assert_eq!(Status::decode(b"OKAYdone"), Status::Okay);
    /// assert_eq!(Status::decode(b"okay"), Status::Fail);
    /// assert_eq!(Status::decode(b"OK"), Status::Fail);
    /// ```
    pub fn decode(frame: &[u8]) -> Self {
        match frame.get(..STATUS_LENGTH) {
            Some(b"OKAY") => Status::Okay,
            Some(b"DATA") => Status::Data,
            Some(b"INFO") => Status::Info,
            _ => Status::Fail,
        }
    }

    /// The token as it appears on the wire.
    pub fn token(self) -> &'static str {
        match self {
            Status::Okay => "OKAY",
            Status::Fail => "FAIL",
            Status::Data => "DATA",
            Status::Info => "INFO",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}
