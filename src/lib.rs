//! This crate provides a way to talk to a device whose bootloader speaks the fastboot protocol via
//! USB. It can flash and erase partitions, query bootloader variables and reboot the device.
//!
//! # Example: Basic flashing
//! ```rust, no_run
//! use fastboot::{CancelToken, Context};
//! use std::fs::File;
//! use std::io::Read;
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Open image file and read contents
//! let mut file = File::open("boot.img")?;
//! let mut image = Vec::new();
//! file.read_to_end(&mut image)?;
//!
//! // Find a device in fastboot mode
//! let context = Context::new()?;
//! let mut device = context.pick_device(None)?.open(&context)?;
//!
//! // Every command is bounded by a cancellation token
//! let cancel = CancelToken::with_timeout(Duration::from_secs(5));
//! println!("Product: {}", device.get_variable(&cancel, "product")?);
//!
//! // Download the image and write it to the boot partition
//! let cancel = CancelToken::with_timeout(Duration::from_secs(120));
//! device.flash(&cancel, "boot", &image, |line| {
//!     println!("{}", String::from_utf8_lossy(line));
//! })?;
//!
//! // Leave the bootloader. This closes the connection.
//! device.reboot(&CancelToken::with_timeout(Duration::from_secs(5)))?;
//!
//! println!("Done!");
//! # Ok(())
//! # }
//! ```
//!
//! Devices which are not reached through `rusb` can be driven by implementing [`InEndpoint`] and
//! [`OutEndpoint`] and handing them to [`Protocol::new`]. The download phase can be run step by
//! step for progress feedback, see the [`Operation`] trait for details.
//!
//! [`InEndpoint`]: trait.InEndpoint.html
//! [`OutEndpoint`]: trait.OutEndpoint.html
//! [`Protocol::new`]: struct.Protocol.html#method.new
//! [`Operation`]: trait.Operation.html

mod cancel;
mod context;
mod device;
mod error;
#[cfg(test)]
mod mock;
mod operation;
mod protocol;
mod status;
mod transport;

pub use cancel::CancelToken;
pub use context::Context;
pub use device::{Device, DeviceInfo};
pub use error::{Error, Result};
pub use operation::{Download, Operation};
pub use protocol::{Protocol, CHUNK_SIZE};
pub use rusb::UsbContext;
pub use status::Status;
pub use transport::{InEndpoint, OutEndpoint, Release, UsbEndpoint};

/// Timeout for single USB transfers whose cancellation token has no deadline.
pub const TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Interface class of a fastboot interface (vendor specific).
pub const FASTBOOT_CLASS: u8 = 0xff;

/// Interface subclass of a fastboot interface.
pub const FASTBOOT_SUBCLASS: u8 = 0x42;

/// Interface protocol of a fastboot interface.
pub const FASTBOOT_PROTOCOL: u8 = 0x03;

/// Bulk endpoint the device sends responses through.
pub const ENDPOINT_IN: u8 = 0x81;

/// Bulk endpoint commands and data are sent to.
pub const ENDPOINT_OUT: u8 = 0x01;
