use crate::acquisition_config::ConfigError;

/// Stages a trigger can be chained through before it fires.
pub const MAX_TRIGGER_STAGES: usize = 16;

/// Bits addressable by a trigger term.
pub const MAX_TRIGGER_BITS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitState {
    High,
    Low,
    DontCare,
    Rising,
    Falling,
    /// Any change of level.
    Edge,
}

impl BitState {
    pub fn as_char(&self) -> char {
        match self {
            BitState::High => '1',
            BitState::Low => '0',
            BitState::DontCare => 'X',
            BitState::Rising => 'R',
            BitState::Falling => 'F',
            BitState::Edge => 'C',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            '1' => Some(BitState::High),
            '0' => Some(BitState::Low),
            'X' => Some(BitState::DontCare),
            'R' => Some(BitState::Rising),
            'F' => Some(BitState::Falling),
            'C' => Some(BitState::Edge),
            _ => None,
        }
    }
}

/// One mask/value condition on a sample.
///
/// Bits in `mask` must equal the corresponding bits of `value`. Bits in `edge`
/// must differ from the previous sample, so a bit in both `mask` and `edge`
/// selects a rising (`value` bit set) or falling edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TriggerTerm {
    pub mask: u64,
    pub value: u64,
    pub edge: u64,
    pub inverted: bool,
}

impl TriggerTerm {
    pub fn new(mask: u64, value: u64) -> Self {
        Self {
            mask,
            value: value & mask,
            edge: 0,
            inverted: false,
        }
    }

    pub fn from_bits(bit_states: &[BitState]) -> Self {
        let mut term = Self::default();
        for (i, state) in bit_states.iter().enumerate().take(MAX_TRIGGER_BITS) {
            let bit = 1u64 << i;
            match state {
                BitState::DontCare => {}
                BitState::Low => term.mask |= bit,
                BitState::High => {
                    term.mask |= bit;
                    term.value |= bit;
                }
                BitState::Rising => {
                    term.mask |= bit;
                    term.value |= bit;
                    term.edge |= bit;
                }
                BitState::Falling => {
                    term.mask |= bit;
                    term.edge |= bit;
                }
                BitState::Edge => term.edge |= bit,
            }
        }
        term
    }

    /// Parse a pattern written most significant bit first, e.g. `"X1R0"`.
    pub fn from_pattern(pattern: &str) -> Option<Self> {
        let bit_states = pattern
            .chars()
            .rev()
            .map(BitState::from_char)
            .collect::<Option<Vec<_>>>()?;
        if bit_states.len() > MAX_TRIGGER_BITS {
            return None;
        }
        Some(Self::from_bits(&bit_states))
    }

    pub fn inverted(mut self) -> Self {
        self.inverted = !self.inverted;
        self
    }

    pub fn is_edge_sensitive(&self) -> bool {
        self.edge != 0
    }

    pub fn matches(&self, sample: u64, previous: Option<u64>) -> bool {
        let level = sample & self.mask == self.value;
        let edge = self.edge == 0
            || previous.is_some_and(|prev| (prev ^ sample) & self.edge == self.edge);
        (level && edge) != self.inverted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StageLogic {
    #[default]
    And,
    Or,
}

impl StageLogic {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageLogic::And => "and",
            StageLogic::Or => "or",
        }
    }
}

/// One step of a serial trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerStage {
    pub primary: TriggerTerm,
    pub secondary: Option<TriggerTerm>,
    pub logic: StageLogic,
    /// Extra consecutive matching samples required before the stage is passed.
    pub count: u32,
}

impl TriggerStage {
    pub fn new(primary: TriggerTerm) -> Self {
        Self {
            primary,
            secondary: None,
            logic: StageLogic::And,
            count: 0,
        }
    }

    pub fn when() -> StageBuilder {
        StageBuilder::new()
    }

    pub fn combined(mut self, logic: StageLogic, secondary: TriggerTerm) -> Self {
        self.logic = logic;
        self.secondary = Some(secondary);
        self
    }

    pub fn repeated(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    /// Samples this stage consumes when it matches.
    pub fn span(&self) -> usize {
        self.count as usize + 1
    }

    pub fn matches(&self, sample: u64, previous: Option<u64>) -> bool {
        let primary = self.primary.matches(sample, previous);
        match (self.secondary, self.logic) {
            (None, _) => primary,
            (Some(term), StageLogic::And) => primary && term.matches(sample, previous),
            (Some(term), StageLogic::Or) => primary || term.matches(sample, previous),
        }
    }
}

#[derive(Debug)]
pub struct StageBuilder {
    bit_states: [BitState; MAX_TRIGGER_BITS],
}

impl StageBuilder {
    pub fn new() -> Self {
        Self {
            bit_states: [BitState::DontCare; MAX_TRIGGER_BITS],
        }
    }

    pub fn set_bit(mut self, bit: usize, state: BitState) -> Self {
        assert!(
            bit < MAX_TRIGGER_BITS,
            "Bit index {} out of range, must be between 0 and {}",
            bit,
            MAX_TRIGGER_BITS - 1
        );
        self.bit_states[bit] = state;
        self
    }

    pub fn high(self, bit: usize) -> Self {
        self.set_bit(bit, BitState::High)
    }

    pub fn low(self, bit: usize) -> Self {
        self.set_bit(bit, BitState::Low)
    }

    pub fn rising(self, bit: usize) -> Self {
        self.set_bit(bit, BitState::Rising)
    }

    pub fn falling(self, bit: usize) -> Self {
        self.set_bit(bit, BitState::Falling)
    }

    pub fn edge(self, bit: usize) -> Self {
        self.set_bit(bit, BitState::Edge)
    }

    pub fn term(&self) -> TriggerTerm {
        TriggerTerm::from_bits(&self.bit_states)
    }

    pub fn matches(self) -> TriggerStage {
        TriggerStage::new(self.term())
    }

    /// Stage passes once the pattern holds for `samples` consecutive samples.
    pub fn matches_for(self, samples: u32) -> TriggerStage {
        self.matches().repeated(samples.saturating_sub(1))
    }

    pub fn differs(self) -> TriggerStage {
        TriggerStage::new(self.term().inverted())
    }

    pub fn and(self, other: StageBuilder) -> TriggerStage {
        self.matches().combined(StageLogic::And, other.term())
    }

    pub fn or(self, other: StageBuilder) -> TriggerStage {
        self.matches().combined(StageLogic::Or, other.term())
    }
}

impl Default for StageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Stage list plus the share of the capture that precedes the trigger point.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TriggerConfig {
    stages: Vec<TriggerStage>,
    position: u8,
}

impl TriggerConfig {
    pub fn new(stages: Vec<TriggerStage>) -> Self {
        Self {
            stages,
            position: 0,
        }
    }

    /// No stages: capture starts with the first sample.
    pub fn free_run() -> Self {
        Self::default()
    }

    /// Single stage built from a pattern such as `"0001"`.
    pub fn pattern(pattern: &str) -> Option<Self> {
        TriggerTerm::from_pattern(pattern).map(|term| Self::new(vec![TriggerStage::new(term)]))
    }

    pub fn then(mut self, stage: TriggerStage) -> Self {
        self.stages.push(stage);
        self
    }

    /// Percentage of `limit_samples` kept from before the trigger point.
    pub fn with_position(mut self, percent: u8) -> Self {
        self.position = percent;
        self
    }

    pub fn stages(&self) -> &[TriggerStage] {
        &self.stages
    }

    pub fn position(&self) -> u8 {
        self.position
    }

    pub fn is_free_run(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stages.len() > MAX_TRIGGER_STAGES {
            return Err(ConfigError::TooManyStages {
                stages: self.stages.len(),
            });
        }
        if self.position > 100 {
            return Err(ConfigError::TriggerPosition {
                percent: self.position,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_state_chars() {
        for state in [
            BitState::High,
            BitState::Low,
            BitState::DontCare,
            BitState::Rising,
            BitState::Falling,
            BitState::Edge,
        ] {
            assert_eq!(BitState::from_char(state.as_char()), Some(state));
        }
        assert_eq!(BitState::from_char('x'), Some(BitState::DontCare));
        assert_eq!(BitState::from_char('?'), None);
    }

    #[test]
    fn test_pattern_is_msb_first() {
        let term = TriggerTerm::from_pattern("1X0").unwrap();
        assert_eq!(term.mask, 0b101);
        assert_eq!(term.value, 0b100);
        assert_eq!(term.edge, 0);
        assert!(TriggerTerm::from_pattern("10Z").is_none());
    }

    #[test]
    fn test_level_term() {
        let term = TriggerStage::when().high(0).low(2).term();
        assert!(term.matches(0b001, None));
        assert!(term.matches(0b011, None));
        assert!(!term.matches(0b101, None));
        assert!(!term.inverted().matches(0b001, None));
    }

    #[test]
    fn test_edge_terms() {
        let rising = TriggerStage::when().rising(1).term();
        assert!(rising.matches(0b10, Some(0b00)));
        assert!(!rising.matches(0b10, Some(0b10)));
        assert!(!rising.matches(0b00, Some(0b10)));
        assert!(!rising.matches(0b10, None));

        let falling = TriggerStage::when().falling(1).term();
        assert!(falling.matches(0b00, Some(0b10)));
        assert!(!falling.matches(0b10, Some(0b00)));

        let change = TriggerStage::when().edge(1).term();
        assert!(change.matches(0b00, Some(0b10)));
        assert!(change.matches(0b10, Some(0b00)));
        assert!(!change.matches(0b10, Some(0b10)));
    }

    #[test]
    fn test_stage_logic() {
        let and = TriggerStage::when().high(0).and(TriggerStage::when().high(1));
        assert!(and.matches(0b11, None));
        assert!(!and.matches(0b01, None));

        let or = TriggerStage::when().high(0).or(TriggerStage::when().high(1));
        assert!(or.matches(0b10, None));
        assert!(!or.matches(0b00, None));
    }

    #[test]
    fn test_matches_for() {
        let stage = TriggerStage::when().high(0).matches_for(3);
        assert_eq!(stage.count, 2);
        assert_eq!(stage.span(), 3);
    }

    #[test]
    fn test_config_validation() {
        let too_many = TriggerConfig::new(vec![
            TriggerStage::when().high(0).matches();
            MAX_TRIGGER_STAGES + 1
        ]);
        assert!(matches!(
            too_many.validate(),
            Err(ConfigError::TooManyStages { stages: 17 })
        ));
        assert!(matches!(
            TriggerConfig::free_run().with_position(101).validate(),
            Err(ConfigError::TriggerPosition { percent: 101 })
        ));
        assert!(TriggerConfig::pattern("01").unwrap().validate().is_ok());
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_set_bit_out_of_range() {
        StageBuilder::new().set_bit(MAX_TRIGGER_BITS, BitState::High);
    }
}
