//! Fixed-capacity multi-channel sample ring with its envelope summaries.
//!
//! Rows are stored in acquisition order, `stride` bytes each, one
//! little-endian `unit_bytes` value per channel. Logical index 0 is the oldest
//! row still held by the ring.
//!
//! [`SampleStore`] keeps the ring and its [`EnvelopeCache`] behind a single
//! lock so that an append and the envelope update it causes are observed
//! together by readers.

use crate::acquisition_config::ChannelSet;
use crate::envelope_cache::{EnvelopeCache, EnvelopeSection, EnvelopeSnapshot};
use crate::ring_index::RingIndex;
use parking_lot::{Mutex, MutexGuard};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to allocate {bytes} bytes of sample storage")]
    AllocationFailed { bytes: usize },

    #[error("Sample storage size overflows the address space")]
    SizeOverflow,
}

/// Little-endian value of up to the first eight bytes of `bytes`.
pub(crate) fn read_unit(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .take(8)
        .rev()
        .fold(0, |acc, &b| (acc << 8) | u64::from(b))
}

/// Raw ring storage. Mutated only under the [`SampleStore`] lock.
#[derive(Debug, Default)]
pub(crate) struct RingBuffer {
    data: Vec<u8>,
    capacity: usize,
    stride: usize,
    unit_bytes: usize,
    /// Next write position.
    cursor: usize,
    len: usize,
    /// Logical rows ever appended since the last allocate or clear.
    written: u64,
    /// Raw ticks left before the next row is kept when `pitch > 1`.
    pitch_countdown: u16,
}

impl RingBuffer {
    pub fn allocate(&mut self, capacity: usize, channels: &ChannelSet) -> Result<(), StoreError> {
        assert!(capacity > 0, "sample store capacity must be > 0");
        assert!(!channels.is_empty(), "sample store needs at least one channel");

        self.clear();
        self.capacity = 0;
        self.data.clear();
        let stride = channels.stride();
        let bytes = capacity
            .checked_mul(stride)
            .ok_or(StoreError::SizeOverflow)?;
        self.data
            .try_reserve_exact(bytes)
            .map_err(|_| StoreError::AllocationFailed { bytes })?;
        self.data.resize(bytes, 0);

        self.capacity = capacity;
        self.stride = stride;
        self.unit_bytes = channels.unit_bytes();
        Ok(())
    }

    pub fn release(&mut self) {
        self.data = Vec::new();
        self.capacity = 0;
        self.stride = 0;
        self.unit_bytes = 0;
        self.clear();
    }

    /// Forget all rows but keep the allocation.
    pub fn clear(&mut self) {
        self.cursor = 0;
        self.len = 0;
        self.written = 0;
        self.pitch_countdown = 0;
    }

    pub fn is_allocated(&self) -> bool {
        self.capacity > 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn index(&self) -> RingIndex {
        RingIndex::new(self.capacity)
    }

    /// Append whole rows. With `pitch > 1` only the first of every `pitch`
    /// rows is kept, the countdown carrying over between calls.
    pub fn append(&mut self, data: &[u8], pitch: u16) {
        assert!(self.is_allocated(), "append to an unallocated sample store");
        assert_eq!(
            data.len() % self.stride,
            0,
            "{} bytes is not a whole number of {}-byte rows",
            data.len(),
            self.stride
        );

        if pitch <= 1 {
            self.append_rows(data);
            return;
        }
        for row in data.chunks_exact(self.stride) {
            if self.pitch_countdown == 0 {
                self.append_rows(row);
                self.pitch_countdown = pitch;
            }
            self.pitch_countdown -= 1;
        }
    }

    fn append_rows(&mut self, data: &[u8]) {
        let rows = data.len() / self.stride;
        // Rows that would be overwritten within this same call are skipped.
        let skipped = rows.saturating_sub(self.capacity);
        let index = self.index();
        let start = index.advance(self.cursor, skipped);
        let kept = &data[skipped * self.stride..];

        let (tail, head) = index.span_across_wrap(start, rows - skipped);
        let (tail_bytes, head_bytes) = kept.split_at(tail.len() * self.stride);
        self.data[tail.start * self.stride..tail.end * self.stride].copy_from_slice(tail_bytes);
        self.data[head.start * self.stride..head.end * self.stride].copy_from_slice(head_bytes);

        self.cursor = index.advance(self.cursor, rows);
        self.len = (self.len + rows).min(self.capacity);
        self.written += rows as u64;
    }

    /// Ring position of a logical index.
    fn position_of(&self, logical: usize) -> usize {
        assert!(
            logical < self.len,
            "sample index {logical} out of range ({} samples)",
            self.len
        );
        let oldest = self.written - self.len as u64;
        self.index().wrap(oldest + logical as u64)
    }

    fn row_at(&self, position: usize) -> &[u8] {
        &self.data[position * self.stride..(position + 1) * self.stride]
    }

    pub fn row(&self, logical: usize) -> &[u8] {
        self.row_at(self.position_of(logical))
    }

    /// Value of `channel` in the row at ring `position`.
    pub fn value_at(&self, position: usize, channel: usize) -> u64 {
        assert!(
            channel < self.stride / self.unit_bytes,
            "channel {channel} out of range ({} channels)",
            self.stride / self.unit_bytes
        );
        let offset = channel * self.unit_bytes;
        read_unit(&self.row_at(position)[offset..offset + self.unit_bytes])
    }

    pub fn value(&self, logical: usize, channel: usize) -> u64 {
        self.value_at(self.position_of(logical), channel)
    }
}

#[derive(Debug, Default)]
struct StoreState {
    ring: RingBuffer,
    envelope: EnvelopeCache,
    channels: Option<ChannelSet>,
    memory_failed: bool,
    ended: bool,
}

/// Thread-safe sample ring plus envelope cache.
///
/// One thread appends while others read; every call takes the lock only for
/// its own duration. Use [`SampleStore::view`] to run several reads against one
/// consistent state.
#[derive(Debug, Default)]
pub struct SampleStore {
    state: Mutex<StoreState>,
}

impl SampleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Size the ring for `total_sample_count` rows of `channels`.
    ///
    /// On failure the store is left cleared and empty, with
    /// [`SampleStore::memory_failed`] set.
    pub fn allocate(
        &self,
        total_sample_count: usize,
        channels: &ChannelSet,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.ended = false;
        match state.ring.allocate(total_sample_count, channels) {
            Ok(()) => {
                log::debug!(
                    "Allocated sample store: {} samples x {} bytes",
                    total_sample_count,
                    channels.stride()
                );
                state.envelope.reset(channels.len(), total_sample_count);
                state.channels = Some(channels.clone());
                state.memory_failed = false;
                Ok(())
            }
            Err(e) => {
                log::error!("Sample store allocation failed: {e}");
                state.ring.release();
                state.envelope.reset(0, 0);
                state.channels = None;
                state.memory_failed = true;
                Err(e)
            }
        }
    }

    /// Ingest whole rows and update the envelope levels in the same critical
    /// section.
    pub fn append(&self, data: &[u8], pitch: u16) {
        #[cfg(feature = "cpu-profiling")]
        let _zone = tracy_client::span!("SampleStore::append");

        let mut state = self.state.lock();
        let StoreState { ring, envelope, .. } = &mut *state;
        ring.append(data, pitch);
        envelope.extend(ring);
    }

    /// Drop all samples and envelope data, keeping the allocation.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let StoreState {
            ring,
            envelope,
            channels,
            ended,
            ..
        } = &mut *state;
        ring.clear();
        envelope.reset(channels.as_ref().map_or(0, ChannelSet::len), ring.capacity());
        *ended = false;
    }

    /// Copy of the row at `logical_index`, one `unit_bytes` value per channel.
    pub fn read(&self, logical_index: usize) -> Vec<u8> {
        self.state.lock().ring.row(logical_index).to_vec()
    }

    /// Value of one channel (logical column) at `logical_index`.
    pub fn value(&self, logical_index: usize, channel: usize) -> u64 {
        self.view().value(logical_index, channel)
    }

    /// Raw bytes of rows `start..start + count`, oldest first.
    pub fn read_bytes(&self, start: usize, count: usize) -> Vec<u8> {
        let state = self.state.lock();
        assert!(
            start + count <= state.ring.len(),
            "rows {start}..{} out of range ({} samples)",
            start + count,
            state.ring.len()
        );
        let mut bytes = Vec::with_capacity(count * state.ring.stride());
        for logical in start..start + count {
            bytes.extend_from_slice(state.ring.row(logical));
        }
        bytes
    }

    /// Copy of an envelope section that can be used after the lock is released.
    pub fn envelope(
        &self,
        start: u64,
        length: u64,
        min_feature_length: f64,
        channel: usize,
    ) -> Option<EnvelopeSnapshot> {
        self.view()
            .envelope(start, length, min_feature_length, channel)
            .map(|section| section.snapshot())
    }

    /// Hold the lock for a batch of reads.
    pub fn view(&self) -> StoreView<'_> {
        StoreView {
            state: self.state.lock(),
        }
    }

    pub fn logical_count(&self) -> usize {
        self.state.lock().ring.len()
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().ring.capacity()
    }

    /// Rows appended since the last allocate or clear, including overwritten ones.
    pub fn total_written(&self) -> u64 {
        self.state.lock().ring.written()
    }

    pub fn channels(&self) -> Option<ChannelSet> {
        self.state.lock().channels.clone()
    }

    /// Logical column of a probe.
    pub fn channel_order(&self, probe: u16) -> Option<usize> {
        self.state.lock().channels.as_ref()?.order_of(probe)
    }

    pub fn has_channel(&self, probe: u16) -> bool {
        self.channel_order(probe).is_some()
    }

    pub fn memory_failed(&self) -> bool {
        self.state.lock().memory_failed
    }

    pub fn ended(&self) -> bool {
        self.state.lock().ended
    }

    pub fn mark_ended(&self) {
        self.state.lock().ended = true;
    }
}

/// Locked, consistent view of a [`SampleStore`].
pub struct StoreView<'a> {
    state: MutexGuard<'a, StoreState>,
}

impl StoreView<'_> {
    pub fn channels(&self) -> Option<&ChannelSet> {
        self.state.channels.as_ref()
    }

    pub fn logical_count(&self) -> usize {
        self.state.ring.len()
    }

    pub fn row(&self, logical_index: usize) -> &[u8] {
        self.state.ring.row(logical_index)
    }

    pub fn value(&self, logical_index: usize, channel: usize) -> u64 {
        self.state.ring.value(logical_index, channel)
    }

    pub fn envelope(
        &self,
        start: u64,
        length: u64,
        min_feature_length: f64,
        channel: usize,
    ) -> Option<EnvelopeSection<'_>> {
        self.state
            .envelope
            .query(start, length, min_feature_length, channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope_cache::EnvelopeSample;
    use proptest::prelude::*;

    fn store(capacity: usize, channels: ChannelSet) -> SampleStore {
        let store = SampleStore::new();
        store.allocate(capacity, &channels).unwrap();
        store
    }

    #[test]
    fn test_read_unit_is_little_endian() {
        assert_eq!(read_unit(&[0x34, 0x12]), 0x1234);
        assert_eq!(read_unit(&[]), 0);
        assert_eq!(read_unit(&[1, 0, 0, 0, 0, 0, 0, 0, 0xFF]), 1);
    }

    #[test]
    fn test_append_without_wrap() {
        let store = store(8, ChannelSet::new(vec![0, 1], 8));
        store.append(&[1, 10, 2, 20, 3, 30], 1);
        assert_eq!(store.logical_count(), 3);
        assert_eq!(store.read(0), vec![1, 10]);
        assert_eq!(store.value(2, 1), 30);
    }

    #[test]
    fn test_append_wraps_oldest_first() {
        let store = store(4, ChannelSet::new(vec![0], 8));
        store.append(&[0, 1, 2], 1);
        store.append(&[3, 4, 5], 1);
        assert_eq!(store.logical_count(), 4);
        assert_eq!(store.total_written(), 6);
        let rows: Vec<u64> = (0..4).map(|i| store.value(i, 0)).collect();
        assert_eq!(rows, vec![2, 3, 4, 5]);
    }

    #[test]
    fn test_append_longer_than_capacity() {
        let store = store(3, ChannelSet::new(vec![0], 8));
        store.append(&[9], 1);
        store.append(&[0, 1, 2, 3, 4, 5, 6], 1);
        assert_eq!(store.read_bytes(0, 3), vec![4, 5, 6]);
    }

    #[test]
    fn test_pitch_keeps_one_row_per_period() {
        let store = store(16, ChannelSet::new(vec![0], 8));
        store.append(&[0, 1, 2, 3, 4], 3);
        store.append(&[5, 6, 7], 3);
        assert_eq!(store.read_bytes(0, store.logical_count()), vec![0, 3, 6]);
    }

    #[test]
    fn test_wide_units() {
        let store = store(4, ChannelSet::new(vec![2, 5], 12));
        store.append(&[0x34, 0x12, 0xFF, 0x0F], 1);
        assert_eq!(store.value(0, 0), 0x1234);
        assert_eq!(store.value(0, 1), 0x0FFF);
        assert_eq!(store.channel_order(5), Some(1));
        assert!(!store.has_channel(0));
    }

    #[test]
    fn test_clear_resets_envelope() {
        let store = store(64, ChannelSet::new(vec![0], 8));
        store.append(&[7u8; 32], 1);
        assert!(store.envelope(0, 32, 16.0, 0).is_some_and(|s| s.samples.len() == 2));
        store.mark_ended();
        store.clear();
        assert_eq!(store.logical_count(), 0);
        assert!(!store.ended());
        assert_eq!(store.capacity(), 64);
        assert!(store.envelope(0, 32, 16.0, 0).unwrap().samples.iter().all(Option::is_none));
    }

    #[test]
    fn test_allocation_overflow_leaves_store_cleared() {
        let store = store(4, ChannelSet::new(vec![0], 8));
        store.append(&[1, 2], 1);
        let result = store.allocate(usize::MAX, &ChannelSet::new(vec![0, 1], 8));
        assert!(matches!(result, Err(StoreError::SizeOverflow)));
        assert!(store.memory_failed());
        assert_eq!(store.logical_count(), 0);
        assert_eq!(store.capacity(), 0);
        assert!(store.channels().is_none());

        store.allocate(4, &ChannelSet::new(vec![0], 8)).unwrap();
        assert!(!store.memory_failed());
    }

    #[test]
    fn test_view_reads_consistently() {
        let store = store(32, ChannelSet::new(vec![0], 8));
        store.append(&(0..32u8).collect::<Vec<_>>(), 1);
        let view = store.view();
        assert_eq!(view.logical_count(), 32);
        assert_eq!(view.row(31), &[31]);
        let section = view.envelope(0, 32, 16.0, 0).unwrap();
        assert_eq!(section.get(1), Some(EnvelopeSample { min: 16, max: 31 }));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_read_past_end_panics() {
        let store = store(4, ChannelSet::new(vec![0], 8));
        store.append(&[1, 2], 1);
        store.read(2);
    }

    #[test]
    #[should_panic(expected = "whole number")]
    fn test_partial_row_panics() {
        let store = store(4, ChannelSet::new(vec![0, 1], 8));
        store.append(&[1, 2, 3], 1);
    }

    proptest! {
        #[test]
        fn test_ring_holds_most_recent_rows(
            capacity in 1usize..64,
            chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..40), 1..20)
        ) {
            let store = store(capacity, ChannelSet::new(vec![0], 8));
            let mut all = Vec::new();
            for chunk in &chunks {
                store.append(chunk, 1);
                all.extend_from_slice(chunk);
            }

            let expected_len = all.len().min(capacity);
            prop_assert_eq!(store.logical_count(), expected_len);
            let oldest = all.len() - expected_len;
            for i in 0..expected_len {
                prop_assert_eq!(store.value(i, 0), u64::from(all[oldest + i]));
            }
        }

        #[test]
        fn test_envelope_matches_raw_data(
            capacity in 256usize..1100,
            chunks in prop::collection::vec(
                prop::collection::vec(any::<(u8, u8)>(), 0..120),
                1..40
            ),
            feature in prop::sample::select(vec![16.0, 256.0, 4096.0])
        ) {
            let store = store(capacity, ChannelSet::new(vec![0, 1], 8));
            let mut rows: Vec<[u8; 2]> = Vec::new();
            for chunk in &chunks {
                let bytes: Vec<u8> = chunk.iter().flat_map(|&(a, b)| [a, b]).collect();
                store.append(&bytes, 1);
                rows.extend(chunk.iter().map(|&(a, b)| [a, b]));
            }

            let len = store.logical_count() as u64;
            let view = store.view();
            for channel in 0..2 {
                let section = view.envelope(0, len, feature, channel).unwrap();
                prop_assert!(section.scale() as f64 <= feature);
                let scale = section.scale() as usize;
                for offset in 0..section.len() {
                    let entry = section.start() + offset;
                    if !section.valid_entries().contains(&entry) {
                        continue;
                    }
                    let first = entry as usize * scale;
                    let raw = rows[first..first + scale].iter().map(|row| row[channel]);
                    let expected = EnvelopeSample {
                        min: u64::from(raw.clone().min().unwrap()),
                        max: u64::from(raw.max().unwrap()),
                    };
                    prop_assert_eq!(section.get(offset), Some(expected));
                }
            }
        }
    }
}
