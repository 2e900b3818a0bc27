//! [`DeviceChannel`] over a serial streaming link.
//!
//! Control commands are ASCII lines answered with a `> ` prompt. After
//! `start` the device streams raw sample rows, which are read into the
//! submitted transfer buffers in submission order.

use crate::device_channel::{
    ControlCommand, DeviceChannel, DeviceError, DeviceSettings, TransferCompletion,
    TransferStatus,
};
use crate::transfer_pool::TransferHandle;
use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::collections::{HashSet, VecDeque};
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

/// USB vendor id of DreamSourceLab devices.
pub const DSLOGIC_VID: u16 = 0x2A0E;
pub const DSLOGIC_PIDS: [u16; 7] = [0x0001, 0x0003, 0x0020, 0x0021, 0x0029, 0x002A, 0x002C];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialDeviceInfo {
    pub name: String,
    pub port: String,
}

#[derive(Debug)]
struct PendingRead {
    handle: TransferHandle,
    buffer: Vec<u8>,
    filled: usize,
    /// Set when the first byte is awaited for this transfer.
    started: Option<Instant>,
}

#[derive(Debug)]
pub struct SerialDevice {
    serial: Box<dyn SerialPort>,
    prompt: String,
    pending: VecDeque<PendingRead>,
    cancelled: HashSet<TransferHandle>,
    streaming: bool,
    transfer_timeout: Duration,
}

impl SerialDevice {
    pub const BAUD_RATE: u32 = 921_600;
    const READ_TIMEOUT: Duration = Duration::from_millis(10);
    const PROMPT_TIMEOUT: Duration = Duration::from_secs(1);

    /// Open `port` and discard anything already buffered.
    pub fn open(port: &str) -> Result<Self, DeviceError> {
        log::debug!("Opening serial device on {port}");
        let serial = serialport::new(port, Self::BAUD_RATE)
            .timeout(Self::READ_TIMEOUT)
            .open()?;
        serial.clear(serialport::ClearBuffer::All)?;
        Ok(Self {
            serial,
            prompt: "> ".to_string(),
            pending: VecDeque::new(),
            cancelled: HashSet::new(),
            streaming: false,
            transfer_timeout: Duration::from_millis(500),
        })
    }

    /// Open the first attached device, optionally matching its product name.
    pub fn connect(name: Option<&str>) -> Result<Self, DeviceError> {
        let device = available_devices(name)?
            .into_iter()
            .next()
            .ok_or_else(|| DeviceError::ControlFailed {
                command: "connect",
                reason: format!("no device {} found", name.unwrap_or("DSLogic")),
            })?;
        log::info!("Connecting to {} on {}", device.name, device.port);
        Self::open(&device.port)
    }

    /// Longest time a read transfer waits for data before completing short.
    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = timeout;
        self
    }

    fn exec(&mut self, line: &str) -> Result<String, DeviceError> {
        self.serial.write_all(format!("{line}\n").as_bytes())?;
        read_until_prompt(&mut self.serial, &self.prompt, Self::PROMPT_TIMEOUT).map_err(|reason| {
            DeviceError::ControlFailed {
                command: "exec",
                reason,
            }
        })
    }

    fn fail_pending(&mut self) -> Option<TransferCompletion> {
        let read = self.pending.pop_front()?;
        Some(TransferCompletion {
            handle: read.handle,
            buffer: read.buffer,
            actual_length: read.filled,
            status: TransferStatus::NoDevice,
        })
    }
}

/// Control line for `command`, or `None` if it carries no settings.
fn control_line(command: ControlCommand, settings: Option<&DeviceSettings>) -> String {
    match (command, settings) {
        (ControlCommand::Configure, Some(s)) => format!(
            "config {} {:#x} {} {} {}",
            s.sample_rate,
            s.channel_mask,
            s.stride,
            s.unit_bytes,
            s.mode.as_str()
        ),
        (command, _) => command.as_str().to_string(),
    }
}

/// Read byte by byte until `prompt` is seen; returns the trimmed response
/// without the prompt, or the trailing bytes on timeout.
fn read_until_prompt<R: Read + ?Sized>(
    reader: &mut R,
    prompt: &str,
    timeout: Duration,
) -> Result<String, String> {
    let prompt_bytes = prompt.as_bytes();
    let mut response = Vec::new();
    let start = Instant::now();

    loop {
        let mut byte = [0u8; 1];
        match reader.read(&mut byte) {
            Ok(1) => {
                response.push(byte[0]);
                if response.ends_with(prompt_bytes) {
                    response.truncate(response.len() - prompt_bytes.len());
                    return Ok(String::from_utf8_lossy(&response).trim().to_string());
                }
            }
            Ok(_) => {}
            Err(e) if is_retryable(&e) => {}
            Err(e) => return Err(e.to_string()),
        }
        if start.elapsed() >= timeout {
            let tail = &response[response.len().saturating_sub(prompt_bytes.len())..];
            return Err(format!(
                "expected prompt '{prompt}' but got '{}'",
                String::from_utf8_lossy(tail)
            ));
        }
    }
}

fn is_retryable(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
    )
}

/// Outcome of filling a transfer from the stream.
#[derive(Debug, PartialEq, Eq)]
enum Fill {
    Full,
    Waiting,
    Lost,
}

fn fill_from<R: Read + ?Sized>(reader: &mut R, buffer: &mut [u8], filled: &mut usize) -> Fill {
    while *filled < buffer.len() {
        match reader.read(&mut buffer[*filled..]) {
            Ok(0) => return Fill::Waiting,
            Ok(n) => *filled += n,
            Err(e) if is_retryable(&e) => return Fill::Waiting,
            Err(e) => {
                log::error!("Serial read failed: {e}");
                return Fill::Lost;
            }
        }
    }
    Fill::Full
}

impl DeviceChannel for SerialDevice {
    fn submit_read(&mut self, handle: TransferHandle, buffer: Vec<u8>) -> Result<(), DeviceError> {
        self.pending.push_back(PendingRead {
            handle,
            buffer,
            filled: 0,
            started: None,
        });
        Ok(())
    }

    fn cancel(&mut self, handle: TransferHandle) {
        if self.pending.iter().any(|read| read.handle == handle) {
            self.cancelled.insert(handle);
        }
    }

    fn send_control(&mut self, command: ControlCommand, payload: &[u8]) -> Result<(), DeviceError> {
        let settings = match command {
            ControlCommand::Configure => Some(DeviceSettings::decode(payload).ok_or_else(|| {
                DeviceError::ControlFailed {
                    command: command.as_str(),
                    reason: "malformed settings payload".into(),
                }
            })?),
            _ => None,
        };
        let line = control_line(command, settings.as_ref());
        log::debug!("Sending '{line}'");

        match command {
            ControlCommand::Configure => {
                let response = self.exec(&line)?;
                if !response.is_empty() {
                    return Err(DeviceError::ControlFailed {
                        command: command.as_str(),
                        reason: response,
                    });
                }
            }
            // The stream follows immediately, so no prompt is awaited.
            ControlCommand::Start => {
                self.serial.write_all(format!("{line}\n").as_bytes())?;
                self.streaming = true;
            }
            ControlCommand::Stop => {
                self.serial.write_all(format!("{line}\n").as_bytes())?;
                self.streaming = false;
            }
        }
        Ok(())
    }

    fn poll_completion(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<TransferCompletion>, DeviceError> {
        let Some(front) = self.pending.front() else {
            return Ok(None);
        };
        if self.cancelled.remove(&front.handle) || !self.streaming {
            let read = self.pending.pop_front().ok_or(DeviceError::Disconnected)?;
            return Ok(Some(TransferCompletion {
                handle: read.handle,
                buffer: read.buffer,
                actual_length: read.filled,
                status: TransferStatus::Cancelled,
            }));
        }

        let deadline = Instant::now() + timeout;
        loop {
            let transfer_timeout = self.transfer_timeout;
            let Some(read) = self.pending.front_mut() else {
                return Ok(None);
            };
            let started = *read.started.get_or_insert_with(Instant::now);
            match fill_from(&mut self.serial, &mut read.buffer, &mut read.filled) {
                Fill::Full => {}
                Fill::Lost => return Ok(self.fail_pending()),
                Fill::Waiting if started.elapsed() >= transfer_timeout => {}
                Fill::Waiting if Instant::now() >= deadline => return Ok(None),
                Fill::Waiting => continue,
            }

            let status = if read.filled == 0 {
                TransferStatus::TimedOut
            } else {
                TransferStatus::Completed
            };
            let read = self.pending.pop_front().ok_or(DeviceError::Disconnected)?;
            return Ok(Some(TransferCompletion {
                handle: read.handle,
                buffer: read.buffer,
                actual_length: read.filled,
                status,
            }));
        }
    }
}

fn matches_device(info: &SerialPortInfo, name: Option<&str>) -> Option<SerialDeviceInfo> {
    let SerialPortType::UsbPort(usb) = &info.port_type else {
        return None;
    };
    if usb.vid != DSLOGIC_VID || !DSLOGIC_PIDS.contains(&usb.pid) {
        return None;
    }
    let product = usb.product.clone().unwrap_or_else(|| "DSLogic".to_string());
    if name.is_some_and(|expected| expected != product) {
        return None;
    }
    Some(SerialDeviceInfo {
        name: product,
        port: info.port_name.clone(),
    })
}

/// Attached devices, optionally restricted to a product name.
pub fn available_devices(name: Option<&str>) -> Result<Vec<SerialDeviceInfo>, DeviceError> {
    let ports = serialport::available_ports()?;
    let devices: Vec<SerialDeviceInfo> = ports
        .iter()
        .filter_map(|info| matches_device(info, name))
        .collect();
    log::debug!("Found {} of {} serial ports", devices.len(), ports.len());
    Ok(devices)
}
