//! Capability interface to the acquisition hardware.
//!
//! The pipeline only submits and cancels reads and sends a handful of control
//! commands; everything about the transport stays behind [`DeviceChannel`].

use crate::acquisition_config::{AcquisitionConfig, OperationMode};
use crate::transfer_pool::TransferHandle;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Device disconnected")]
    Disconnected,

    #[error("Failed to submit transfer: {reason}")]
    SubmitFailed { reason: String },

    #[error("Control command '{command}' failed: {reason}")]
    ControlFailed {
        command: &'static str,
        reason: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Payload is an encoded [`DeviceSettings`].
    Configure,
    Start,
    Stop,
}

impl ControlCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlCommand::Configure => "config",
            ControlCommand::Start => "start",
            ControlCommand::Stop => "stop",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    TimedOut,
    Error,
    Cancelled,
    /// The device went away; fatal for the acquisition.
    NoDevice,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Completed => "completed",
            TransferStatus::TimedOut => "timed out",
            TransferStatus::Error => "error",
            TransferStatus::Cancelled => "cancelled",
            TransferStatus::NoDevice => "no device",
        }
    }
}

/// A submitted read coming back, with the buffer it was submitted with.
#[derive(Debug)]
pub struct TransferCompletion {
    pub handle: TransferHandle,
    pub buffer: Vec<u8>,
    /// Bytes of `buffer` actually filled.
    pub actual_length: usize,
    pub status: TransferStatus,
}

impl TransferCompletion {
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.actual_length.min(self.buffer.len())]
    }
}

/// Acquisition parameters the device needs before `Start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSettings {
    pub sample_rate: u64,
    pub channel_mask: u64,
    /// Bytes per sample row.
    pub stride: u16,
    pub unit_bytes: u8,
    pub mode: OperationMode,
}

impl DeviceSettings {
    pub const ENCODED_LEN: usize = 20;

    pub fn from_config(config: &AcquisitionConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            channel_mask: config.channels.channel_mask(),
            stride: config.channels.stride() as u16,
            unit_bytes: config.channels.unit_bytes() as u8,
            mode: config.mode,
        }
    }

    /// Fixed little-endian layout: rate, mask, stride, unit bytes, mode.
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(Self::ENCODED_LEN);
        payload.extend_from_slice(&self.sample_rate.to_le_bytes());
        payload.extend_from_slice(&self.channel_mask.to_le_bytes());
        payload.extend_from_slice(&self.stride.to_le_bytes());
        payload.push(self.unit_bytes);
        payload.push(match self.mode {
            OperationMode::Normal => 0,
            OperationMode::InternalTest => 1,
            OperationMode::ExternalTest => 2,
        });
        payload
    }

    pub fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() != Self::ENCODED_LEN {
            return None;
        }
        let (rate, rest) = payload.split_at(8);
        let (mask, rest) = rest.split_at(8);
        let mode = match rest[3] {
            0 => OperationMode::Normal,
            1 => OperationMode::InternalTest,
            2 => OperationMode::ExternalTest,
            _ => return None,
        };
        Some(Self {
            sample_rate: u64::from_le_bytes(rate.try_into().ok()?),
            channel_mask: u64::from_le_bytes(mask.try_into().ok()?),
            stride: u16::from_le_bytes([rest[0], rest[1]]),
            unit_bytes: rest[2],
            mode,
        })
    }
}

/// Asynchronous bulk-read transport plus device control.
///
/// Every transfer accepted by [`DeviceChannel::submit_read`] must come back
/// exactly once from [`DeviceChannel::poll_completion`], including cancelled
/// ones, so that the caller can account for all outstanding buffers.
pub trait DeviceChannel {
    /// Queue a read into `buffer`. The handle is echoed back on completion.
    fn submit_read(&mut self, handle: TransferHandle, buffer: Vec<u8>) -> Result<(), DeviceError>;

    /// Ask for a queued read to complete early with [`TransferStatus::Cancelled`].
    fn cancel(&mut self, handle: TransferHandle);

    fn send_control(&mut self, command: ControlCommand, payload: &[u8])
        -> Result<(), DeviceError>;

    /// Wait up to `timeout` for the next finished transfer.
    fn poll_completion(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<TransferCompletion>, DeviceError>;
}

impl<T: DeviceChannel + ?Sized> DeviceChannel for Box<T> {
    fn submit_read(&mut self, handle: TransferHandle, buffer: Vec<u8>) -> Result<(), DeviceError> {
        (**self).submit_read(handle, buffer)
    }

    fn cancel(&mut self, handle: TransferHandle) {
        (**self).cancel(handle);
    }

    fn send_control(
        &mut self,
        command: ControlCommand,
        payload: &[u8],
    ) -> Result<(), DeviceError> {
        (**self).send_control(command, payload)
    }

    fn poll_completion(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<TransferCompletion>, DeviceError> {
        (**self).poll_completion(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition_config::ChannelSet;

    #[test]
    fn test_settings_round_trip() {
        let config = AcquisitionConfig::new(25_000_000, ChannelSet::new(vec![1, 4], 16))
            .with_mode(OperationMode::ExternalTest);
        let settings = DeviceSettings::from_config(&config);
        assert_eq!(settings.channel_mask, 0b1_0010);
        assert_eq!(settings.stride, 4);
        assert_eq!(settings.unit_bytes, 2);

        let payload = settings.encode();
        assert_eq!(payload.len(), DeviceSettings::ENCODED_LEN);
        assert_eq!(DeviceSettings::decode(&payload), Some(settings));
    }

    #[test]
    fn test_settings_reject_bad_payload() {
        assert_eq!(DeviceSettings::decode(&[0; 3]), None);
        let mut payload = DeviceSettings::from_config(&AcquisitionConfig::default()).encode();
        payload[19] = 9;
        assert_eq!(DeviceSettings::decode(&payload), None);
    }

    #[test]
    fn test_completion_data_is_clamped() {
        let pool_handle = crate::transfer_pool::TransferPool::new(1, 4)
            .acquire()
            .map(|(handle, _)| handle)
            .unwrap();
        let completion = TransferCompletion {
            handle: pool_handle,
            buffer: vec![1, 2, 3, 4],
            actual_length: 9,
            status: TransferStatus::Completed,
        };
        assert_eq!(completion.data(), &[1, 2, 3, 4]);
        assert_eq!(TransferStatus::NoDevice.as_str(), "no device");
        assert_eq!(ControlCommand::Configure.as_str(), "config");
    }
}
