use crate::cancel::CancelToken;
use crate::context::{find_interface, Context};
use crate::error::{Error, Result};
use crate::operation::Operation;
use crate::protocol::Protocol;
use crate::status::Status;
use crate::transport::{Release, UsbEndpoint};
use crate::{ENDPOINT_IN, ENDPOINT_OUT};
use log::{debug, info, trace, warn};
use rusb::UsbContext;
use std::sync::{Arc, PoisonError, RwLock};

/// Contains necessary information to connect to a device via USB.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceInfo {
    /// USB bus ID the device is connected to.
    pub usb_bus_number: u8,

    /// USB device address of the device.
    pub usb_bus_address: u8,

    /// Number of the interface speaking fastboot.
    pub interface_number: u8,

    /// Serial number string the device reported via its USB descriptor. `None` if the device could
    /// not be opened to read it (usually a permission problem).
    pub serial: Option<String>,
}

impl DeviceInfo {
    /// Connects to a device. Fails if the USB device is no longer present or does not expose a
    /// fastboot interface.
    pub fn open(&self, context: &Context) -> Result<Device> {
        for device in context.usb_context().devices()?.iter() {
            if device.bus_number() != self.usb_bus_number
                || device.address() != self.usb_bus_address
            {
                continue;
            }

            // Guards against a reenumeration between Context::find_devices() and open() handing
            // the address to some entirely different device
            let interface = find_interface(&device)?.ok_or(Error::UnsupportedDevice)?;
            if interface.number != self.interface_number {
                return Err(Error::DeviceNotFound);
            }

            let mut handle = device.open()?;
            handle.claim_interface(interface.number)?;
            debug!(
                "Claimed interface {} on bus {} address {}",
                interface.number, self.usb_bus_number, self.usb_bus_address
            );

            let handle = Arc::new(RwLock::new(handle));
            let mut input = UsbEndpoint::new(
                Arc::clone(&handle),
                ENDPOINT_IN,
                interface.in_packet_size,
            );
            let mut output = UsbEndpoint::new(
                Arc::clone(&handle),
                ENDPOINT_OUT,
                interface.out_packet_size,
            );
            input.set_timeout(context.timeout());
            output.set_timeout(context.timeout());

            let number = interface.number;
            let release: Release = Box::new(move || {
                let mut handle = handle.write().unwrap_or_else(PoisonError::into_inner);
                if let Err(error) = handle.release_interface(number) {
                    warn!("Could not release interface {}: {}", number, error);
                }
            });

            return Ok(Device {
                protocol: Protocol::new(input, output, release),
                info: Some(self.clone()),
            });
        }
        Err(Error::DeviceNotFound)
    }
}

/// A connected fastboot device. Runs the bootloader's commands on top of a [`Protocol`].
///
/// Errors are never retried. Each command returns as soon as the device reports `OKAY` or `FAIL`,
/// the transport fails, or the cancellation token fires.
///
/// [`Protocol`]: struct.Protocol.html
pub struct Device {
    /// Connection used for the low-level communication
    protocol: Protocol,

    /// Where the device was found, if it was opened via USB enumeration
    info: Option<DeviceInfo>,
}

impl Device {
    /// Runs commands over an existing connection.
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            info: None,
        }
    }

    /// Information about the USB device, if it was opened through a [`Context`].
    ///
    /// [`Context`]: struct.Context.html
    pub fn info(&self) -> Option<&DeviceInfo> {
        self.info.as_ref()
    }

    /// The underlying connection, for raw commands and downloads.
    pub fn protocol(&mut self) -> &mut Protocol {
        &mut self.protocol
    }

    /// Whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.protocol.is_closed()
    }

    /// Closes the connection and releases the USB interface.
    pub fn close(&mut self) {
        self.protocol.close()
    }

    /// Reboots the device. The connection is closed afterwards, since the device leaves the bus.
    pub fn reboot(&mut self, cancel: &CancelToken) -> Result<()> {
        self.command(cancel, "reboot")?;
        self.protocol.close();
        Ok(())
    }

    /// Downloads `image` and writes it to `partition`. `on_info` is called with the text of every
    /// `INFO` line the device sends while flashing.
    pub fn flash<F>(
        &mut self,
        cancel: &CancelToken,
        partition: &str,
        image: &[u8],
        on_info: F,
    ) -> Result<()>
    where
        F: FnMut(&[u8]),
    {
        self.flash_with_progress(cancel, partition, image, |_, _| {}, on_info)
    }

    /// Like [`flash`], additionally calling `progress` with the bytes sent so far and the image
    /// size after every chunk of the download.
    ///
    /// [`flash`]: #method.flash
    pub fn flash_with_progress<P, F>(
        &mut self,
        cancel: &CancelToken,
        partition: &str,
        image: &[u8],
        mut progress: P,
        on_info: F,
    ) -> Result<()>
    where
        P: FnMut(usize, usize),
        F: FnMut(&[u8]),
    {
        {
            let mut download = self.protocol.download_chunks(cancel, image)?;
            let total = download.total();
            for sent in &mut download {
                progress(sent?, total);
            }
        }

        self.command(cancel, &format!("flash:{}", partition))?;
        self.wait_for_okay(cancel, on_info).map(|_| ())
    }

    /// Erases `partition`.
    pub fn erase(&mut self, cancel: &CancelToken, partition: &str) -> Result<()> {
        self.command(cancel, &format!("erase:{}", partition))?;
        self.wait_for_okay(cancel, |line| {
            info!("{}", String::from_utf8_lossy(line));
        })
        .map(|_| ())
    }

    /// Reads a single bootloader variable, e.g. `product` or `max-download-size`.
    ///
    /// Querying `all` is refused with [`Error::UseGetVarAll`], as the device answers it with many
    /// lines. Use [`get_all_variables`] for that.
    ///
    /// [`Error::UseGetVarAll`]: enum.Error.html#variant.UseGetVarAll
    /// [`get_all_variables`]: #method.get_all_variables
    pub fn get_variable(&mut self, cancel: &CancelToken, name: &str) -> Result<String> {
        if name == "all" {
            return Err(Error::UseGetVarAll);
        }

        self.command(cancel, &format!("getvar:{}", name))?;
        let value = self.wait_for_okay(cancel, |line| {
            trace!("Ignoring {}", String::from_utf8_lossy(line));
        })?;
        Ok(String::from_utf8_lossy(&value).into_owned())
    }

    /// Reads all bootloader variables. Each entry is one line as sent by the device, usually
    /// formatted `name:value`.
    ///
    /// If the device reports `FAIL` midway, the lines received so far are discarded. Use
    /// [`read_all_variables_into`] to keep them.
    ///
    /// [`read_all_variables_into`]: #method.read_all_variables_into
    pub fn get_all_variables(&mut self, cancel: &CancelToken) -> Result<Vec<String>> {
        let mut variables = Vec::new();
        self.read_all_variables_into(cancel, &mut variables)?;
        Ok(variables)
    }

    /// Like [`get_all_variables`], but appends to `variables` as lines arrive. If the device
    /// reports `FAIL` midway, the lines received up to that point remain in `variables`.
    ///
    /// [`get_all_variables`]: #method.get_all_variables
    pub fn read_all_variables_into(
        &mut self,
        cancel: &CancelToken,
        variables: &mut Vec<String>,
    ) -> Result<()> {
        self.command(cancel, "getvar:all")?;
        loop {
            match self.protocol.read_response(cancel)? {
                (Status::Okay, _) => return Ok(()),
                (Status::Fail, payload) => return Err(Error::StatusFail(payload)),
                (Status::Data, payload) | (Status::Info, payload) => {
                    variables.push(String::from_utf8_lossy(&payload).into_owned())
                }
            }
        }
    }

    fn command(&mut self, cancel: &CancelToken, command: &str) -> Result<()> {
        debug!("Sending command {}", command);
        self.protocol.send(cancel, command.as_bytes())
    }

    /// Reads responses until `OKAY` or `FAIL` and returns the payload of the `OKAY`. Everything in
    /// between is handed to `on_other`. Only the cancellation token bounds the number of lines.
    fn wait_for_okay<F>(&mut self, cancel: &CancelToken, mut on_other: F) -> Result<Vec<u8>>
    where
        F: FnMut(&[u8]),
    {
        loop {
            match self.protocol.read_response(cancel)? {
                (Status::Okay, payload) => return Ok(payload),
                (Status::Fail, payload) => return Err(Error::StatusFail(payload)),
                (_, payload) => on_other(&payload),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDevice;
    use std::time::Duration;

    fn device(mock: &MockDevice) -> Device {
        Device::new(mock.protocol())
    }

    #[test]
    fn reboot_closes_connection() {
        let mock = MockDevice::new();
        let mut device = device(&mock);
        device.reboot(&CancelToken::new()).unwrap();

        assert_eq!(mock.writes(), vec![b"reboot".to_vec()]);
        assert!(device.is_closed());
        assert_eq!(mock.releases(), 1);
        assert!(matches!(
            device.get_variable(&CancelToken::new(), "product"),
            Err(Error::DeviceClosed)
        ));
    }

    #[test]
    fn failed_reboot_keeps_connection() {
        let mock = MockDevice::new();
        mock.fail_write(0);
        let mut device = device(&mock);
        let result = device.reboot(&CancelToken::new());

        assert!(matches!(result, Err(Error::Transport(rusb::Error::Io))));
        assert!(!device.is_closed());
        assert_eq!(mock.releases(), 0);
    }

    #[test]
    fn flash_reports_info_lines() {
        let mock = MockDevice::new();
        mock.respond(b"DATA00000010");
        mock.respond(b"OKAY");
        mock.respond(b"INFOerasing");
        mock.respond(b"INFOwriting");
        mock.respond(b"OKAY");
        let mut device = device(&mock);

        let mut lines = Vec::new();
        device
            .flash(&CancelToken::new(), "boot", &[0; 16], |line| {
                lines.push(line.to_vec())
            })
            .unwrap();

        assert_eq!(lines, vec![b"erasing".to_vec(), b"writing".to_vec()]);
        let writes = mock.writes();
        assert_eq!(writes[0], b"download:00000010");
        assert_eq!(writes[2], b"flash:boot");
        assert_eq!(writes.len(), 3);
    }

    #[test]
    fn flash_failure_carries_message() {
        let mock = MockDevice::new();
        mock.respond(b"DATA00000004");
        mock.respond(b"OKAY");
        mock.respond(b"FAILpartition table doesn't exist");
        let mut device = device(&mock);

        let error = device
            .flash(&CancelToken::new(), "vendor", &[1, 2, 3, 4], |_| {})
            .unwrap_err();
        assert_eq!(
            error.status_payload(),
            Some(&b"partition table doesn't exist"[..])
        );
    }

    #[test]
    fn flash_does_not_send_command_after_failed_download() {
        let mock = MockDevice::new();
        mock.respond(b"FAILtoo large");
        let mut device = device(&mock);

        let result = device.flash(&CancelToken::new(), "system", &[0; 8], |_| {});
        assert!(matches!(result, Err(Error::StatusFail(_))));
        assert_eq!(mock.writes(), vec![b"download:00000008".to_vec()]);
    }

    #[test]
    fn flash_progress_follows_chunks() {
        let mock = MockDevice::new();
        mock.respond(b"DATA00080080");
        mock.respond(b"OKAY");
        mock.respond(b"OKAY");
        let mut device = device(&mock);

        let image = vec![0u8; 2 * crate::CHUNK_SIZE];
        let mut steps = Vec::new();
        device
            .flash_with_progress(
                &CancelToken::new(),
                "boot",
                &image,
                |sent, total| steps.push((sent, total)),
                |_| {},
            )
            .unwrap();
        assert_eq!(
            steps,
            vec![
                (crate::CHUNK_SIZE, image.len()),
                (image.len(), image.len())
            ]
        );
    }

    #[test]
    fn endless_info_ends_at_deadline() {
        let mock = MockDevice::new();
        mock.respond(b"DATA00000001");
        mock.respond(b"OKAY");
        mock.respond_forever(b"INFOstill busy");
        let mut device = device(&mock);

        let cancel = CancelToken::with_timeout(Duration::from_millis(100));
        let result = device.flash(&cancel, "boot", &[0], |_| {});
        assert!(matches!(result, Err(Error::Timeout)));
    }

    #[test]
    fn erase_waits_for_okay() {
        let mock = MockDevice::new();
        mock.respond(b"INFOerasing userdata");
        mock.respond(b"OKAY");
        let mut device = device(&mock);
        device.erase(&CancelToken::new(), "userdata").unwrap();
        assert_eq!(mock.writes(), vec![b"erase:userdata".to_vec()]);
    }

    #[test]
    fn get_variable_returns_okay_payload() {
        let mock = MockDevice::new();
        mock.respond(b"INFOstray line");
        mock.respond(b"DATA00000000");
        mock.respond(b"OKAY0x10000000");
        let mut device = device(&mock);

        let value = device
            .get_variable(&CancelToken::new(), "max-download-size")
            .unwrap();
        assert_eq!(value, "0x10000000");
        assert_eq!(mock.writes(), vec![b"getvar:max-download-size".to_vec()]);
    }

    #[test]
    fn get_variable_failure() {
        let mock = MockDevice::new();
        mock.respond(b"FAILunknown variable");
        let mut device = device(&mock);

        let error = device
            .get_variable(&CancelToken::new(), "nonsense")
            .unwrap_err();
        assert_eq!(error.status_payload(), Some(&b"unknown variable"[..]));
    }

    #[test]
    fn get_variable_all_is_refused_without_io() {
        let mock = MockDevice::new();
        mock.respond(b"OKAY");
        let mut device = device(&mock);

        let result = device.get_variable(&CancelToken::new(), "all");
        assert!(matches!(result, Err(Error::UseGetVarAll)));
        assert!(mock.writes().is_empty());
        assert_eq!(mock.reads(), 0);
    }

    #[test]
    fn get_all_variables_collects_lines() {
        let mock = MockDevice::new();
        mock.respond(b"DATAversion:0.4");
        mock.respond(b"INFOextra");
        mock.respond(b"OKAY");
        let mut device = device(&mock);

        let variables = device.get_all_variables(&CancelToken::new()).unwrap();
        assert_eq!(variables, vec!["version:0.4", "extra"]);
        assert_eq!(mock.writes(), vec![b"getvar:all".to_vec()]);
    }

    #[test]
    fn get_all_variables_keeps_duplicates() {
        let mock = MockDevice::new();
        mock.respond(b"INFOslot-count:2");
        mock.respond(b"INFOslot-count:2");
        mock.respond(b"OKAY");
        let mut device = device(&mock);

        let variables = device.get_all_variables(&CancelToken::new()).unwrap();
        assert_eq!(variables, vec!["slot-count:2", "slot-count:2"]);
    }

    #[test]
    fn failed_get_all_variables_keeps_partial_list() {
        let mock = MockDevice::new();
        mock.respond(b"INFOproduct:sailfish");
        mock.respond(b"FAILinterrupted");
        let mut device = device(&mock);

        let mut variables = Vec::new();
        let result = device.read_all_variables_into(&CancelToken::new(), &mut variables);
        assert!(matches!(result, Err(Error::StatusFail(_))));
        assert_eq!(variables, vec!["product:sailfish"]);
    }
}
