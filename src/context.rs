use super::device::{Device, DeviceInfo};
use super::error::{Error, Result};
use super::{
    ENDPOINT_IN, ENDPOINT_OUT, FASTBOOT_CLASS, FASTBOOT_PROTOCOL, FASTBOOT_SUBCLASS, TIMEOUT,
};
use log::{debug, warn};
use rusb::{Direction, TransferType, UsbContext};
use std::time::Duration;

/// Entry point for finding fastboot devices on the USB bus.
pub struct Context {
    usb_context: rusb::Context,
    timeout: Duration,
}

impl Context {
    pub fn new() -> Result<Self> {
        let usb_context = rusb::Context::new()?;
        Ok(Context {
            usb_context,
            timeout: TIMEOUT,
        })
    }

    /// The `rusb` context devices are enumerated with.
    pub fn usb_context(&self) -> &rusb::Context {
        &self.usb_context
    }

    /// Timeout for single USB transfers on devices opened from this context, used whenever the
    /// cancellation token has no deadline of its own.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Lists all devices exposing a fastboot interface.
    pub fn find_devices(&self) -> Result<Vec<DeviceInfo>> {
        let mut devices = Vec::new();

        for device in self.usb_context.devices()?.iter() {
            let interface = match find_interface(&device) {
                Ok(Some(interface)) => interface,
                Ok(None) => continue,
                Err(error) => {
                    debug!(
                        "Skipping device on bus {} address {}: {}",
                        device.bus_number(),
                        device.address(),
                        error
                    );
                    continue;
                }
            };

            devices.push(DeviceInfo {
                usb_bus_number: device.bus_number(),
                usb_bus_address: device.address(),
                interface_number: interface.number,
                serial: get_serial(&device).ok(),
            });
        }

        Ok(devices)
    }

    /// Selects a single device, optionally by its serial number.
    pub fn pick_device(&self, serial: Option<&str>) -> Result<DeviceInfo> {
        let devices = self.find_devices()?;
        if let Some(serial) = serial {
            devices
                .into_iter()
                .find(|device| device.serial.as_deref() == Some(serial))
                .ok_or(Error::DeviceNotFound)
        } else {
            let mut devices = devices.into_iter();
            match (devices.next(), devices.next()) {
                (None, _) => Err(Error::DeviceNotFound),
                (Some(device), None) => Ok(device),
                // More than one device and no serial given
                (Some(_), Some(_)) => Err(Error::TooManyMatches),
            }
        }
    }

    /// Opens every fastboot device. Devices which cannot be opened are skipped.
    pub fn open_devices(&self) -> Result<Vec<Device>> {
        let mut opened = Vec::new();
        for info in self.find_devices()? {
            match info.open(self) {
                Ok(device) => opened.push(device),
                Err(error) => warn!(
                    "Could not open device on bus {} address {}: {}",
                    info.usb_bus_number, info.usb_bus_address, error
                ),
            }
        }
        Ok(opened)
    }
}

/// Location and endpoint sizes of a fastboot interface.
pub(crate) struct FastbootInterface {
    pub(crate) number: u8,
    pub(crate) in_packet_size: u16,
    pub(crate) out_packet_size: u16,
}

/// Searches the active configuration of a device for an interface with the fastboot class,
/// subclass and protocol. Fails if such an interface lacks the bulk endpoints.
pub(crate) fn find_interface<T: UsbContext>(
    device: &rusb::Device<T>,
) -> Result<Option<FastbootInterface>> {
    let config = device.active_config_descriptor()?;

    for interface in config.interfaces() {
        for descriptor in interface.descriptors() {
            if descriptor.class_code() != FASTBOOT_CLASS
                || descriptor.sub_class_code() != FASTBOOT_SUBCLASS
                || descriptor.protocol_code() != FASTBOOT_PROTOCOL
            {
                continue;
            }

            let mut in_packet_size = None;
            let mut out_packet_size = None;
            for endpoint in descriptor.endpoint_descriptors() {
                if endpoint.transfer_type() != TransferType::Bulk {
                    continue;
                }
                match (endpoint.address(), endpoint.direction()) {
                    (ENDPOINT_IN, Direction::In) => {
                        in_packet_size = Some(endpoint.max_packet_size())
                    }
                    (ENDPOINT_OUT, Direction::Out) => {
                        out_packet_size = Some(endpoint.max_packet_size())
                    }
                    _ => {}
                }
            }

            return match (in_packet_size, out_packet_size) {
                (Some(in_packet_size), Some(out_packet_size)) => Ok(Some(FastbootInterface {
                    number: descriptor.interface_number(),
                    in_packet_size,
                    out_packet_size,
                })),
                _ => Err(Error::UnsupportedDevice),
            };
        }
    }

    Ok(None)
}

/// Reads the serial number string of a device. Requires permission to open the device.
pub(crate) fn get_serial<T: UsbContext>(device: &rusb::Device<T>) -> Result<String> {
    let descriptor = device.device_descriptor()?;
    let handle = device.open()?;
    Ok(handle.read_serial_number_string_ascii(&descriptor)?)
}
