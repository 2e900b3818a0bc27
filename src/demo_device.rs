//! Software [`DeviceChannel`] that generates sample patterns.
//!
//! Transfers complete in submission order as soon as they are polled, which
//! makes the device usable both for demos and for deterministic tests. Faults
//! such as a disconnect or a silent device can be scripted.

use crate::device_channel::{
    ControlCommand, DeviceChannel, DeviceError, DeviceSettings, TransferCompletion,
    TransferStatus,
};
use crate::transfer_pool::TransferHandle;
use std::collections::{HashSet, VecDeque};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    /// Sample index in every channel.
    Counter,
    /// All bits toggling every `half_period` samples.
    Square { half_period: u64 },
    /// Xorshift noise from `seed`.
    Random { seed: u64 },
    Constant(u64),
    /// Raw bytes streamed in a loop, independent of the row layout.
    Sequence(Vec<u8>),
}

impl Pattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            Pattern::Counter => "counter",
            Pattern::Square { .. } => "square",
            Pattern::Random { .. } => "random",
            Pattern::Constant(_) => "constant",
            Pattern::Sequence(_) => "sequence",
        }
    }
}

#[derive(Debug)]
pub struct DemoDevice {
    pattern: Pattern,
    settings: Option<DeviceSettings>,
    running: bool,
    submitted: VecDeque<(TransferHandle, Vec<u8>)>,
    cancelled: HashSet<TransferHandle>,
    /// Rows produced so far.
    position: u64,
    /// Bytes produced so far, for `Sequence` and the test counters.
    byte_position: u64,
    random_state: u64,
    sample_limit: Option<u64>,
    transfer_limit: Option<usize>,
    disconnect_after: Option<usize>,
    empty_after: Option<usize>,
    submit_limit: Option<usize>,
    completed: usize,
    accepted: usize,
    controls: Vec<ControlCommand>,
}

impl DemoDevice {
    pub fn new(pattern: Pattern) -> Self {
        let random_state = match pattern {
            Pattern::Random { seed } => seed.max(1),
            _ => 1,
        };
        Self {
            pattern,
            settings: None,
            running: false,
            submitted: VecDeque::new(),
            cancelled: HashSet::new(),
            position: 0,
            byte_position: 0,
            random_state,
            sample_limit: None,
            transfer_limit: None,
            disconnect_after: None,
            empty_after: None,
            submit_limit: None,
            completed: 0,
            accepted: 0,
            controls: Vec::new(),
        }
    }

    /// Produce only `rows` sample rows in total; later transfers come back empty.
    pub fn with_sample_limit(mut self, rows: u64) -> Self {
        self.sample_limit = Some(rows);
        self
    }

    /// Fill at most `bytes` of each transfer, which need not be a whole row.
    pub fn with_transfer_limit(mut self, bytes: usize) -> Self {
        self.transfer_limit = Some(bytes);
        self
    }

    /// Report the device as gone after `transfers` completions.
    pub fn disconnect_after(mut self, transfers: usize) -> Self {
        self.disconnect_after = Some(transfers);
        self
    }

    /// Time out every transfer after `transfers` completions.
    pub fn go_silent_after(mut self, transfers: usize) -> Self {
        self.empty_after = Some(transfers);
        self
    }

    /// Reject submissions once `transfers` have been accepted.
    pub fn reject_submissions_after(mut self, transfers: usize) -> Self {
        self.submit_limit = Some(transfers);
        self
    }

    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    pub fn settings(&self) -> Option<&DeviceSettings> {
        self.settings.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Control commands received so far, in order.
    pub fn controls(&self) -> &[ControlCommand] {
        &self.controls
    }

    pub fn rows_produced(&self) -> u64 {
        self.position
    }

    fn next_random(&mut self) -> u64 {
        let mut x = self.random_state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.random_state = x;
        x
    }

    fn row_value(&mut self, row: u64) -> u64 {
        match self.pattern {
            Pattern::Counter => row,
            Pattern::Square { half_period } => {
                if (row / half_period.max(1)) % 2 == 1 {
                    u64::MAX
                } else {
                    0
                }
            }
            Pattern::Random { .. } => self.next_random(),
            Pattern::Constant(value) => value,
            Pattern::Sequence(_) => 0,
        }
    }

    /// Fill whole or partial rows into `buffer`, returning the bytes written.
    fn fill(&mut self, buffer: &mut [u8], settings: DeviceSettings) -> usize {
        let stride = usize::from(settings.stride.max(1));
        let unit_bytes = usize::from(settings.unit_bytes.max(1));
        let mut len = self.transfer_limit.map_or(buffer.len(), |l| l.min(buffer.len()));
        if let Some(limit) = self.sample_limit {
            let rows_left = limit.saturating_sub(self.position);
            len = len.min((rows_left as usize).saturating_mul(stride));
        }
        let buffer = &mut buffer[..len];

        if let Some(modulus) = settings.mode.test_modulus() {
            // Test modes stream a 16-bit counter regardless of the row layout.
            for (i, byte) in buffer.iter_mut().enumerate() {
                let offset = self.byte_position + i as u64;
                let word = (offset / 2) % u64::from(modulus);
                *byte = word.to_le_bytes()[(offset % 2) as usize];
            }
        } else if let Pattern::Sequence(bytes) = &self.pattern {
            if !bytes.is_empty() {
                for (i, byte) in buffer.iter_mut().enumerate() {
                    let offset = (self.byte_position + i as u64) % bytes.len() as u64;
                    *byte = bytes[offset as usize];
                }
            }
        } else {
            let first_row = self.byte_position / stride as u64;
            let skip = (self.byte_position % stride as u64) as usize;
            let mut row_bytes = vec![0u8; stride];
            let mut written = 0;
            let mut row = first_row;
            while written < buffer.len() {
                let value = self.row_value(row).to_le_bytes();
                for unit in row_bytes.chunks_mut(unit_bytes) {
                    let n = unit.len().min(8);
                    unit[..n].copy_from_slice(&value[..n]);
                }
                let from = if row == first_row { skip } else { 0 };
                let n = (stride - from).min(buffer.len() - written);
                buffer[written..written + n].copy_from_slice(&row_bytes[from..from + n]);
                written += n;
                row += 1;
            }
        }

        self.byte_position += len as u64;
        self.position = self.byte_position / stride as u64;
        len
    }

    fn complete(&mut self, handle: TransferHandle, mut buffer: Vec<u8>) -> TransferCompletion {
        let finished = |buffer, actual_length, status| TransferCompletion {
            handle,
            buffer,
            actual_length,
            status,
        };

        if self.cancelled.remove(&handle) {
            return finished(buffer, 0, TransferStatus::Cancelled);
        }
        self.completed += 1;
        if self
            .disconnect_after
            .is_some_and(|after| self.completed > after)
        {
            return finished(buffer, 0, TransferStatus::NoDevice);
        }
        if self.empty_after.is_some_and(|after| self.completed > after) {
            return finished(buffer, 0, TransferStatus::TimedOut);
        }
        let Some(settings) = self.settings.filter(|_| self.running) else {
            return finished(buffer, 0, TransferStatus::TimedOut);
        };
        let actual_length = self.fill(&mut buffer, settings);
        finished(buffer, actual_length, TransferStatus::Completed)
    }
}

impl DeviceChannel for DemoDevice {
    fn submit_read(&mut self, handle: TransferHandle, buffer: Vec<u8>) -> Result<(), DeviceError> {
        if self.submit_limit.is_some_and(|limit| self.accepted >= limit) {
            return Err(DeviceError::SubmitFailed {
                reason: format!("demo device accepts only {} transfers", self.accepted),
            });
        }
        self.accepted += 1;
        self.submitted.push_back((handle, buffer));
        Ok(())
    }

    fn cancel(&mut self, handle: TransferHandle) {
        if self.submitted.iter().any(|(h, _)| *h == handle) {
            self.cancelled.insert(handle);
        }
    }

    fn send_control(&mut self, command: ControlCommand, payload: &[u8]) -> Result<(), DeviceError> {
        log::debug!("Demo device received '{}'", command.as_str());
        self.controls.push(command);
        match command {
            ControlCommand::Configure => {
                let settings =
                    DeviceSettings::decode(payload).ok_or_else(|| DeviceError::ControlFailed {
                        command: command.as_str(),
                        reason: format!("malformed settings payload of {} bytes", payload.len()),
                    })?;
                self.settings = Some(settings);
            }
            ControlCommand::Start => {
                if self.settings.is_none() {
                    return Err(DeviceError::ControlFailed {
                        command: command.as_str(),
                        reason: "device not configured".into(),
                    });
                }
                self.running = true;
                self.position = 0;
                self.byte_position = 0;
            }
            ControlCommand::Stop => self.running = false,
        }
        Ok(())
    }

    fn poll_completion(
        &mut self,
        _timeout: Duration,
    ) -> Result<Option<TransferCompletion>, DeviceError> {
        Ok(self
            .submitted
            .pop_front()
            .map(|(handle, buffer)| self.complete(handle, buffer)))
    }
}

impl Default for DemoDevice {
    fn default() -> Self {
        Self::new(Pattern::Counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition_config::OperationMode;
    use crate::transfer_pool::TransferPool;

    fn test_settings(stride: u16, unit_bytes: u8, mode: OperationMode) -> DeviceSettings {
        DeviceSettings {
            sample_rate: 1_000,
            channel_mask: 1,
            stride,
            unit_bytes,
            mode,
        }
    }

    fn started(device: DemoDevice, settings: DeviceSettings) -> DemoDevice {
        let mut device = device;
        device
            .send_control(ControlCommand::Configure, &settings.encode())
            .unwrap();
        device.send_control(ControlCommand::Start, &[]).unwrap();
        device
    }

    fn read(device: &mut DemoDevice, pool: &mut TransferPool) -> TransferCompletion {
        let (handle, buffer) = pool.acquire().unwrap();
        device.submit_read(handle, buffer).unwrap();
        let completion = device.poll_completion(Duration::ZERO).unwrap().unwrap();
        assert!(pool.finish(completion.handle, completion.buffer.clone()));
        completion
    }

    #[test]
    fn test_counter_rows() {
        let mut device = started(
            DemoDevice::new(Pattern::Counter),
            test_settings(4, 2, OperationMode::Normal),
        );
        let mut pool = TransferPool::new(1, 8);
        let completion = read(&mut device, &mut pool);
        assert_eq!(completion.status, TransferStatus::Completed);
        assert_eq!(completion.data(), &[0, 0, 0, 0, 1, 0, 1, 0]);
        assert_eq!(read(&mut device, &mut pool).data(), &[2, 0, 2, 0, 3, 0, 3, 0]);
        assert_eq!(device.rows_produced(), 4);
    }

    #[test]
    fn test_partial_transfers_continue_mid_row() {
        let mut device = started(
            DemoDevice::new(Pattern::Counter).with_transfer_limit(3),
            test_settings(2, 1, OperationMode::Normal),
        );
        let mut pool = TransferPool::new(1, 8);
        assert_eq!(read(&mut device, &mut pool).data(), &[0, 0, 1]);
        assert_eq!(read(&mut device, &mut pool).data(), &[1, 2, 2]);
    }

    #[test]
    fn test_sequence_and_sample_limit() {
        let mut device = started(
            DemoDevice::new(Pattern::Sequence(vec![0, 0, 0, 0, 1])).with_sample_limit(7),
            test_settings(1, 1, OperationMode::Normal),
        );
        let mut pool = TransferPool::new(1, 4);
        assert_eq!(read(&mut device, &mut pool).data(), &[0, 0, 0, 0]);
        assert_eq!(read(&mut device, &mut pool).data(), &[1, 0, 0]);
        let empty = read(&mut device, &mut pool);
        assert_eq!(empty.status, TransferStatus::Completed);
        assert_eq!(empty.actual_length, 0);
    }

    #[test]
    fn test_external_test_counter_wraps() {
        let mut device = started(
            DemoDevice::default(),
            test_settings(2, 2, OperationMode::ExternalTest),
        );
        device.byte_position = 65_000 * 2;
        let mut pool = TransferPool::new(1, 4);
        assert_eq!(
            read(&mut device, &mut pool).data(),
            &[0xE8, 0xFD, 0x00, 0x00]
        );
    }

    #[test]
    fn test_scripted_faults() {
        let mut device = started(
            DemoDevice::default().disconnect_after(1),
            test_settings(1, 1, OperationMode::Normal),
        );
        let mut pool = TransferPool::new(1, 4);
        assert_eq!(read(&mut device, &mut pool).status, TransferStatus::Completed);
        assert_eq!(read(&mut device, &mut pool).status, TransferStatus::NoDevice);

        let mut silent = started(
            DemoDevice::default().go_silent_after(0),
            test_settings(1, 1, OperationMode::Normal),
        );
        assert_eq!(read(&mut silent, &mut pool).status, TransferStatus::TimedOut);
    }

    #[test]
    fn test_cancelled_transfers_complete() {
        let mut device = DemoDevice::default();
        let mut pool = TransferPool::new(2, 4);
        let (a, buffer) = pool.acquire().unwrap();
        device.submit_read(a, buffer).unwrap();
        device.cancel(a);
        let completion = device.poll_completion(Duration::ZERO).unwrap().unwrap();
        assert_eq!(completion.handle, a);
        assert_eq!(completion.status, TransferStatus::Cancelled);
        assert!(device.poll_completion(Duration::ZERO).unwrap().is_none());
    }

    #[test]
    fn test_start_requires_configuration() {
        let mut device = DemoDevice::default();
        assert!(matches!(
            device.send_control(ControlCommand::Start, &[]),
            Err(DeviceError::ControlFailed { command: "start", .. })
        ));
        assert!(device
            .send_control(ControlCommand::Configure, &[1, 2])
            .is_err());
    }

    #[test]
    fn test_submission_limit() {
        let mut device = DemoDevice::default().reject_submissions_after(1);
        let mut pool = TransferPool::new(2, 4);
        let (a, buffer) = pool.acquire().unwrap();
        device.submit_read(a, buffer).unwrap();
        let (b, buffer) = pool.acquire().unwrap();
        assert!(device.submit_read(b, buffer).is_err());
    }
}
