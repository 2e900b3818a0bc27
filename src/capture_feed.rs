//! Event sink that records an acquisition into a [`SampleStore`].

use crate::acquisition::AcquisitionError;
use crate::acquisition_event::{AcquisitionEvent, EventSink, Header};
use crate::sample_store::SampleStore;
use std::sync::Arc;

/// Applies pipeline events to a shared store: Header allocates, Data appends,
/// End marks the capture as complete.
///
/// The store is shared so a reader thread can query it while the pipeline
/// thread feeds it.
#[derive(Debug)]
pub struct CaptureFeed {
    store: Arc<SampleStore>,
    depth: usize,
    header: Option<Header>,
    trigger_offset: Option<u64>,
    data_errors: usize,
    error: Option<AcquisitionError>,
}

impl CaptureFeed {
    /// Ring capacity used when the acquisition has no sample limit.
    pub const DEFAULT_DEPTH: usize = 1 << 20;

    pub fn new(store: Arc<SampleStore>) -> Self {
        Self {
            store,
            depth: Self::DEFAULT_DEPTH,
            header: None,
            trigger_offset: None,
            data_errors: 0,
            error: None,
        }
    }

    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    pub fn store(&self) -> &Arc<SampleStore> {
        &self.store
    }

    pub fn header(&self) -> Option<&Header> {
        self.header.as_ref()
    }

    pub fn trigger_offset(&self) -> Option<u64> {
        self.trigger_offset
    }

    /// Data packets that failed the self-test sequence check.
    pub fn data_errors(&self) -> usize {
        self.data_errors
    }

    pub fn error(&self) -> Option<&AcquisitionError> {
        self.error.as_ref()
    }

    /// Store rows needed for `header`; the limit counts device rows, the
    /// store holds one row per `unit_pitch` of them.
    fn capacity_for(&self, header: &Header) -> usize {
        match header.limit_samples {
            0 => self.depth,
            limit => limit.div_ceil(u64::from(header.unit_pitch.max(1))) as usize,
        }
    }
}

impl EventSink for CaptureFeed {
    fn emit(&mut self, event: AcquisitionEvent<'_>) {
        match event {
            AcquisitionEvent::Header(header) => {
                self.trigger_offset = None;
                self.data_errors = 0;
                self.error = None;
                let capacity = self.capacity_for(&header);
                if let Err(e) = self.store.allocate(capacity, &header.channels) {
                    log::error!("Cannot record acquisition: {e}");
                }
                self.header = Some(header);
            }
            AcquisitionEvent::Trigger { offset } => self.trigger_offset = Some(offset),
            AcquisitionEvent::Data(packet) => {
                if packet.error {
                    self.data_errors += 1;
                }
                if !self.store.memory_failed() {
                    self.store.append(&packet.data, packet.unit_pitch);
                }
            }
            AcquisitionEvent::End => {
                log::debug!(
                    "Capture complete: {} samples stored",
                    self.store.logical_count()
                );
                self.store.mark_ended();
            }
            AcquisitionEvent::Error(error) => {
                log::warn!("Capture interrupted: {error}");
                self.error = Some(error);
            }
        }
    }
}
