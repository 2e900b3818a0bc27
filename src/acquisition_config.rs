use crate::trigger_config::{TriggerConfig, MAX_TRIGGER_STAGES};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("No channels enabled")]
    NoChannels,

    #[error("Unit width of {bits} bits is not supported (1 to 64 bits)")]
    UnitWidth { bits: u32 },

    #[error("Sample stride of {stride} bytes exceeds the maximum of {max} bytes")]
    StrideTooLarge { stride: usize, max: usize },

    #[error("Too many trigger stages ({stages}, max {MAX_TRIGGER_STAGES})")]
    TooManyStages { stages: usize },

    #[error("Trigger position {percent}% out of range (0 to 100)")]
    TriggerPosition { percent: u8 },

    #[error("Sample rate must be non-zero")]
    ZeroSampleRate,

    #[error("Unit pitch must be non-zero")]
    ZeroPitch,
}

/// Ordered set of enabled probes sharing one sample width.
///
/// Every logical sample row stores `unit_bytes` bytes per channel, in the
/// order the probes were given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSet {
    probes: Vec<u16>,
    unit_bits: u32,
}

impl ChannelSet {
    /// Largest row the hardware can deliver.
    pub const MAX_STRIDE_BYTES: usize = 64;

    pub fn new(probes: Vec<u16>, unit_bits: u32) -> Self {
        Self { probes, unit_bits }
    }

    /// `count` consecutive probes starting at probe 0.
    pub fn first(count: u16, unit_bits: u32) -> Self {
        Self::new((0..count).collect(), unit_bits)
    }

    pub fn probes(&self) -> &[u16] {
        &self.probes
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    pub fn unit_bits(&self) -> u32 {
        self.unit_bits
    }

    pub fn unit_bytes(&self) -> usize {
        self.unit_bits.div_ceil(8) as usize
    }

    /// Bytes per logical sample row.
    pub fn stride(&self) -> usize {
        self.unit_bytes() * self.probes.len()
    }

    /// Bit mask of enabled probes.
    pub fn channel_mask(&self) -> u64 {
        self.probes
            .iter()
            .filter(|&&p| p < 64)
            .fold(0, |mask, &p| mask | (1 << p))
    }

    /// Logical column of a probe, if it is enabled.
    pub fn order_of(&self, probe: u16) -> Option<usize> {
        self.probes.iter().position(|&p| p == probe)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.probes.is_empty() {
            return Err(ConfigError::NoChannels);
        }
        if !(1..=64).contains(&self.unit_bits) {
            return Err(ConfigError::UnitWidth {
                bits: self.unit_bits,
            });
        }
        if self.stride() > Self::MAX_STRIDE_BYTES {
            return Err(ConfigError::StrideTooLarge {
                stride: self.stride(),
                max: Self::MAX_STRIDE_BYTES,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperationMode {
    #[default]
    Normal,
    /// Device streams an incrementing 16-bit counter generated on the FPGA.
    InternalTest,
    /// Counter is looped back through the probes, wrapping at 65001.
    ExternalTest,
}

impl OperationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationMode::Normal => "normal",
            OperationMode::InternalTest => "internal-test",
            OperationMode::ExternalTest => "external-test",
        }
    }

    /// Modulus of the expected test counter, if this is a test mode.
    pub fn test_modulus(&self) -> Option<u32> {
        match self {
            OperationMode::Normal => None,
            OperationMode::InternalTest => Some(1 << 16),
            OperationMode::ExternalTest => Some(65_001),
        }
    }
}

/// Everything the pipeline needs to run one acquisition.
#[derive(Debug, Clone)]
pub struct AcquisitionConfig {
    pub sample_rate: u64,
    pub channels: ChannelSet,
    pub trigger: TriggerConfig,
    /// Stop after this many samples; 0 streams until stopped.
    pub limit_samples: u64,
    /// Device ticks per logical sample.
    pub unit_pitch: u16,
    pub mode: OperationMode,
    pub max_transfers: usize,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            sample_rate: 1_000_000,
            channels: ChannelSet::first(16, 1),
            trigger: TriggerConfig::default(),
            limit_samples: 0,
            unit_pitch: 1,
            mode: OperationMode::Normal,
            max_transfers: Self::MAX_SIMULTANEOUS_TRANSFERS,
        }
    }
}

impl AcquisitionConfig {
    pub const MAX_SIMULTANEOUS_TRANSFERS: usize = 64;
    /// Rates above this are delivered at the bus limit.
    const MAX_STREAM_RATE: u64 = 100_000_000;
    const TRANSFER_MS: u64 = 20;
    const IN_FLIGHT_MS: u64 = 100;
    const TRANSFER_GRANULARITY: usize = 512;

    pub fn new(sample_rate: u64, channels: ChannelSet) -> Self {
        Self {
            sample_rate,
            channels,
            ..Self::default()
        }
    }

    pub fn with_trigger(mut self, trigger: TriggerConfig) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn with_limit_samples(mut self, limit_samples: u64) -> Self {
        self.limit_samples = limit_samples;
        self
    }

    pub fn with_unit_pitch(mut self, unit_pitch: u16) -> Self {
        self.unit_pitch = unit_pitch;
        self
    }

    pub fn with_mode(mut self, mode: OperationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_max_transfers(mut self, max_transfers: usize) -> Self {
        self.max_transfers = max_transfers;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.channels.validate()?;
        if self.sample_rate == 0 {
            return Err(ConfigError::ZeroSampleRate);
        }
        if self.unit_pitch == 0 {
            return Err(ConfigError::ZeroPitch);
        }
        self.trigger.validate()
    }

    fn bytes_per_ms(&self) -> u64 {
        let rate = self.sample_rate.min(Self::MAX_STREAM_RATE);
        (rate / 1000).max(1) * self.channels.stride() as u64
    }

    /// Size of one read transfer: about 20 ms of data, rounded up to the bus
    /// granularity and to a whole number of sample rows.
    pub fn transfer_size(&self) -> usize {
        let bytes = (Self::TRANSFER_MS * self.bytes_per_ms()) as usize;
        let bytes = bytes.div_ceil(Self::TRANSFER_GRANULARITY) * Self::TRANSFER_GRANULARITY;
        let stride = self.channels.stride().max(1);
        bytes.div_ceil(stride) * stride
    }

    /// Number of transfers kept in flight so that about 100 ms of data is queued.
    pub fn transfer_count(&self) -> usize {
        let total = (Self::IN_FLIGHT_MS * self.bytes_per_ms()) as usize;
        (total / self.transfer_size()).clamp(1, self.max_transfers.max(1))
    }

    /// Consecutive empty or failed transfers tolerated before the device is
    /// considered unresponsive.
    pub fn max_empty_transfers(&self) -> usize {
        self.transfer_count() * 2
    }

    /// Samples retained ahead of the trigger point.
    pub fn pretrigger_samples(&self) -> usize {
        let samples = u128::from(self.limit_samples) * u128::from(self.trigger.position()) / 100;
        usize::try_from(samples).unwrap_or(usize::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_set_stride_and_mask() {
        let channels = ChannelSet::new(vec![0, 3, 5], 12);
        assert_eq!(channels.unit_bytes(), 2);
        assert_eq!(channels.stride(), 6);
        assert_eq!(channels.channel_mask(), 0b10_1001);
        assert_eq!(channels.order_of(5), Some(2));
        assert_eq!(channels.order_of(1), None);
    }

    #[test]
    fn test_channel_set_validation() {
        assert!(matches!(
            ChannelSet::new(vec![], 8).validate(),
            Err(ConfigError::NoChannels)
        ));
        assert!(matches!(
            ChannelSet::new(vec![0], 0).validate(),
            Err(ConfigError::UnitWidth { bits: 0 })
        ));
        assert!(matches!(
            ChannelSet::first(16, 64).validate(),
            Err(ConfigError::StrideTooLarge { stride: 128, .. })
        ));
        assert!(ChannelSet::first(16, 16).validate().is_ok());
    }

    #[test]
    fn test_transfer_sizing() {
        // 16 probes packed into one 16-bit column at 10 MHz: 20 kB/ms.
        let config = AcquisitionConfig::new(10_000_000, ChannelSet::new(vec![0], 16));
        assert_eq!(config.transfer_size(), 400_384);
        assert_eq!(config.transfer_count(), 4);
        assert_eq!(config.max_empty_transfers(), 8);
    }

    #[test]
    fn test_transfer_count_is_clamped() {
        let slow = AcquisitionConfig::new(1_000, ChannelSet::new(vec![0], 8));
        assert_eq!(slow.transfer_size(), 512);
        assert_eq!(slow.transfer_count(), 1);

        let capped = AcquisitionConfig::new(1_000_000_000, ChannelSet::new(vec![0], 16))
            .with_max_transfers(2);
        assert_eq!(capped.transfer_count(), 2);
    }

    #[test]
    fn test_pretrigger_samples() {
        let config = AcquisitionConfig::default()
            .with_limit_samples(1000)
            .with_trigger(TriggerConfig::default().with_position(25));
        assert_eq!(config.pretrigger_samples(), 250);
    }

    #[test]
    fn test_pretrigger_samples_of_deep_capture() {
        let config = AcquisitionConfig::default()
            .with_limit_samples(u64::MAX / 2)
            .with_trigger(TriggerConfig::default().with_position(50));
        assert_eq!(config.pretrigger_samples() as u64, u64::MAX / 4);

        let full = config
            .with_limit_samples(u64::MAX)
            .with_trigger(TriggerConfig::default().with_position(100));
        assert_eq!(full.pretrigger_samples() as u64, u64::MAX);
    }

    #[test]
    fn test_zero_pitch_rejected() {
        let config = AcquisitionConfig::default().with_unit_pitch(0);
        assert!(matches!(config.validate(), Err(ConfigError::ZeroPitch)));
    }
}
