//! Software trigger over a live stream of sample rows.
//!
//! Rows are matched against the configured stages in order. The rows matched
//! so far (the candidate) are kept across [`TriggerMatcher::feed`] calls, so a
//! mismatch can rewind to the row after the candidate's start even when that
//! row arrived in an earlier transfer.

use crate::sample_store::read_unit;
use crate::trigger_config::{TriggerConfig, TriggerStage};
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchResult {
    /// The chunk was consumed without completing the trigger.
    NoMatchYet,
    /// The last stage matched. `offset` is the first row of the chunk after the
    /// match; `pretrigger` holds the retained context rows followed by the
    /// rows that satisfied the stages.
    MatchedAt { offset: usize, pretrigger: Vec<u8> },
    /// The trigger already fired earlier in this acquisition.
    Fired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TriggerState {
    Armed { stage: usize, progress: u32 },
    Fired,
}

#[derive(Debug)]
pub struct TriggerMatcher {
    stages: Vec<TriggerStage>,
    stride: usize,
    state: TriggerState,
    /// Rows of the current candidate match.
    history: Vec<u8>,
    /// Value of the row before the one being evaluated.
    previous: Option<u64>,
    /// Most recent rows that precede the candidate.
    context: VecDeque<u8>,
    context_rows: usize,
}

impl TriggerMatcher {
    pub fn new(config: &TriggerConfig, stride: usize, context_rows: usize) -> Self {
        assert!(stride > 0, "sample stride must be > 0");
        Self {
            stages: config.stages().to_vec(),
            stride,
            state: TriggerState::Armed {
                stage: 0,
                progress: 0,
            },
            history: Vec::new(),
            previous: None,
            context: VecDeque::new(),
            // A free-running capture starts with the first row and keeps no context.
            context_rows: if config.is_free_run() { 0 } else { context_rows },
        }
    }

    /// Re-arm for a new acquisition.
    pub fn reset(&mut self) {
        self.state = TriggerState::Armed {
            stage: 0,
            progress: 0,
        };
        self.history.clear();
        self.previous = None;
        self.context.clear();
    }

    pub fn is_fired(&self) -> bool {
        self.state == TriggerState::Fired
    }

    /// Index of the stage currently waiting for a match, `None` once fired.
    pub fn stage(&self) -> Option<usize> {
        match self.state {
            TriggerState::Armed { stage, .. } => Some(stage),
            TriggerState::Fired => None,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) -> MatchResult {
        if self.is_fired() {
            return MatchResult::Fired;
        }
        if self.stages.is_empty() {
            self.state = TriggerState::Fired;
            return MatchResult::MatchedAt {
                offset: 0,
                pretrigger: Vec::new(),
            };
        }
        assert_eq!(
            chunk.len() % self.stride,
            0,
            "chunk of {} bytes is not a whole number of {}-byte rows",
            chunk.len(),
            self.stride
        );

        for (i, row) in chunk.chunks_exact(self.stride).enumerate() {
            if self.step(row) {
                let mut pretrigger: Vec<u8> = self.context.drain(..).collect();
                pretrigger.append(&mut self.history);
                return MatchResult::MatchedAt {
                    offset: i + 1,
                    pretrigger,
                };
            }
        }
        MatchResult::NoMatchYet
    }

    /// Evaluate one row; true when it completes the last stage.
    fn step(&mut self, row: &[u8]) -> bool {
        let sample = read_unit(row);
        if self.advance(row, sample) {
            return self.is_fired();
        }
        if self.history.is_empty() {
            self.retire(row, sample);
        } else {
            self.backtrack(row);
        }
        false
    }

    /// Try the current stage on `row`, recording it in the history on success.
    fn advance(&mut self, row: &[u8], sample: u64) -> bool {
        let TriggerState::Armed { stage, progress } = self.state else {
            return false;
        };
        let current = &self.stages[stage];
        if !current.matches(sample, self.previous) {
            return false;
        }

        self.previous = Some(sample);
        self.history.extend_from_slice(row);
        let progress = progress + 1;
        self.state = if progress as usize == current.span() {
            if stage + 1 == self.stages.len() {
                TriggerState::Fired
            } else {
                TriggerState::Armed {
                    stage: stage + 1,
                    progress: 0,
                }
            }
        } else {
            TriggerState::Armed { stage, progress }
        };
        true
    }

    /// `row` can no longer start a match.
    fn retire(&mut self, row: &[u8], sample: u64) {
        self.previous = Some(sample);
        if self.context_rows == 0 {
            return;
        }
        if self.context.len() >= self.context_rows.saturating_mul(self.stride) {
            self.context.drain(..self.stride);
        }
        self.context.extend(row);
    }

    /// The candidate failed on `row`: restart matching one row after the
    /// candidate's first row and rescan everything up to and including `row`.
    fn backtrack(&mut self, row: &[u8]) {
        let mut pending = std::mem::take(&mut self.history);
        pending.extend_from_slice(row);

        let mut start = 0;
        'restart: while start < pending.len() {
            let first = &pending[start..start + self.stride];
            self.retire(first, read_unit(first));
            self.state = TriggerState::Armed {
                stage: 0,
                progress: 0,
            };
            start += self.stride;

            let mut cursor = start;
            while cursor < pending.len() {
                let candidate = &pending[cursor..cursor + self.stride];
                let sample = read_unit(candidate);
                if self.advance(candidate, sample) {
                    // Fewer rows remain than the stages span, so this cannot fire.
                    debug_assert!(!self.is_fired());
                } else if self.history.is_empty() {
                    self.retire(candidate, sample);
                    start = cursor + self.stride;
                } else {
                    self.history.clear();
                    continue 'restart;
                }
                cursor += self.stride;
            }
            return;
        }
    }
}
