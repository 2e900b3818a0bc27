//! Multi-resolution min/max summaries of the raw sample ring.
//!
//! Level 0 summarizes [`SCALE_FACTOR`] raw samples per entry, level `n`
//! summarizes `SCALE_FACTOR^(n+1)`. Every level is itself a ring sized to the
//! raw capacity at that resolution, so entries are addressed by their absolute
//! group number (groups ever completed since the last reset) and stay valid
//! across wraparound of the raw buffer.

use crate::ring_index::RingIndex;
use crate::sample_store::RingBuffer;
use std::ops::Range;

pub const SCALE_POWER: u32 = 4;
pub const SCALE_FACTOR: u64 = 1 << SCALE_POWER;
pub const LEVEL_COUNT: usize = 10;

/// Envelope arrays grow by this many entries at a time.
const GROW_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnvelopeSample {
    pub min: u64,
    pub max: u64,
}

impl EnvelopeSample {
    fn of(value: u64) -> Self {
        Self {
            min: value,
            max: value,
        }
    }

    fn merge(self, other: Self) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }
}

#[derive(Debug)]
struct Envelope {
    /// Entries completed at this level since the last reset.
    count: u64,
    /// First entry that was actually computed; earlier ones were skipped.
    start: u64,
    ring: Option<RingIndex>,
    samples: Vec<EnvelopeSample>,
}

impl Envelope {
    fn new(slots: usize) -> Self {
        Self {
            count: 0,
            start: 0,
            ring: (slots > 0).then(|| RingIndex::new(slots)),
            samples: Vec::new(),
        }
    }

    fn slots(&self) -> u64 {
        self.ring.map_or(0, |r| r.capacity() as u64)
    }

    /// Entries still held by this level's ring and fully computed.
    fn retained(&self) -> Range<u64> {
        let lo = self.start.max(self.count.saturating_sub(self.slots()));
        lo.min(self.count)..self.count
    }

    fn get(&self, entry: u64) -> EnvelopeSample {
        // Levels without storage never complete an entry.
        self.ring
            .map_or_else(EnvelopeSample::default, |ring| self.samples[ring.wrap(entry)])
    }

    fn store(&mut self, entry: u64, sample: EnvelopeSample) {
        let Some(ring) = self.ring else {
            return;
        };
        let slot = ring.wrap(entry);
        if slot >= self.samples.len() {
            if slot >= self.samples.capacity() {
                let wanted = (slot + 1).div_ceil(GROW_CHUNK) * GROW_CHUNK;
                let wanted = wanted.min(ring.capacity());
                self.samples.reserve_exact(wanted - self.samples.len());
            }
            self.samples.resize(slot + 1, EnvelopeSample::default());
        }
        self.samples[slot] = sample;
    }

    /// Record progress towards `target` completed entries, computing only the
    /// entries from `first` on. Returns whether the count moved.
    fn advance_to(
        &mut self,
        target: u64,
        first: u64,
        mut compute: impl FnMut(u64) -> EnvelopeSample,
    ) -> bool {
        if self.ring.is_none() || target == self.count {
            return false;
        }

        let first = first
            .max(self.count)
            .max(target.saturating_sub(self.slots()));
        for entry in first..target {
            let sample = compute(entry);
            self.store(entry, sample);
        }
        if first > self.count {
            self.start = first;
        }
        self.count = target;
        true
    }
}

/// Per-channel, per-level min/max arrays derived from a [`RingBuffer`].
#[derive(Debug, Default)]
pub struct EnvelopeCache {
    levels: Vec<Vec<Envelope>>,
    /// Absolute index of the oldest raw sample still in the ring.
    window_start: u64,
}

impl EnvelopeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all envelope data and size the levels for a raw ring of `raw_capacity`.
    pub fn reset(&mut self, channel_count: usize, raw_capacity: usize) {
        self.window_start = 0;
        self.levels = (0..channel_count)
            .map(|_| {
                (0..LEVEL_COUNT)
                    .map(|level| Envelope::new(Self::slots_for(raw_capacity, level)))
                    .collect()
            })
            .collect();
    }

    fn slots_for(raw_capacity: usize, level: usize) -> usize {
        let power = SCALE_POWER as usize * (level + 1);
        if power >= usize::BITS as usize {
            0
        } else {
            raw_capacity >> power
        }
    }

    /// Raw samples summarized by one entry at `level`.
    pub fn scale_of(level: usize) -> u64 {
        1 << (SCALE_POWER as usize * (level + 1))
    }

    /// Bring every level up to date with the samples now in `ring`.
    pub(crate) fn extend(&mut self, ring: &RingBuffer) {
        #[cfg(feature = "cpu-profiling")]
        let _zone = tracy_client::span!("EnvelopeCache::extend");

        let written = ring.written();
        self.window_start = written - ring.len() as u64;
        let target = written >> SCALE_POWER;
        let first_whole = self.window_start.div_ceil(SCALE_FACTOR);

        for (channel, levels) in self.levels.iter_mut().enumerate() {
            let grew = levels[0].advance_to(target, first_whole, |group| {
                Self::summarize_raw(ring, channel, group)
            });
            if !grew {
                continue;
            }

            for level in 1..LEVEL_COUNT {
                let (lower, upper) = levels.split_at_mut(level);
                let lower = &lower[level - 1];
                let upper = &mut upper[0];

                let target = lower.count >> SCALE_POWER;
                let first = lower.retained().start.div_ceil(SCALE_FACTOR);
                let grew = upper.advance_to(target, first, |group| {
                    let base = group << SCALE_POWER;
                    (base + 1..base + SCALE_FACTOR)
                        .fold(lower.get(base), |acc, entry| acc.merge(lower.get(entry)))
                });
                if !grew {
                    break;
                }
            }
        }
    }

    fn summarize_raw(ring: &RingBuffer, channel: usize, group: u64) -> EnvelopeSample {
        let index = ring.index();
        let (tail, head) = index.span_across_wrap(
            index.wrap(group << SCALE_POWER),
            SCALE_FACTOR as usize,
        );
        let mut positions = tail.chain(head);
        let first = positions
            .next()
            .map(|pos| ring.value_at(pos, channel))
            .unwrap_or_default();
        positions.fold(EnvelopeSample::of(first), |acc, pos| {
            acc.merge(EnvelopeSample::of(ring.value_at(pos, channel)))
        })
    }

    /// Entries completed at `level` for `channel`, including ones that have
    /// since been overwritten.
    pub fn level_count(&self, channel: usize, level: usize) -> u64 {
        self.levels[channel][level].count
    }

    /// Entries at `level` whose raw samples are all still in the ring.
    pub fn valid_range(&self, channel: usize, level: usize) -> Range<u64> {
        let envelope = &self.levels[channel][level];
        let retained = envelope.retained();
        let lo = retained
            .start
            .max(self.window_start.div_ceil(Self::scale_of(level)));
        lo.min(retained.end)..retained.end
    }

    /// Pick the coarsest level whose entries are no longer than `min_feature_length`
    /// raw samples and describe `[start, start + length)` (logical sample indices)
    /// in that level's index space.
    ///
    /// Returns `None` when even level 0 is coarser than the requested feature
    /// length; the caller should read raw samples instead.
    pub fn query(
        &self,
        start: u64,
        length: u64,
        min_feature_length: f64,
        channel: usize,
    ) -> Option<EnvelopeSection<'_>> {
        assert!(min_feature_length > 0.0, "feature length must be positive");
        assert!(
            channel < self.levels.len(),
            "channel {channel} out of range ({} channels)",
            self.levels.len()
        );

        let levels = &self.levels[channel];
        if (Self::scale_of(0) as f64) > min_feature_length || levels[0].ring.is_none() {
            return None;
        }
        let mut level = 0;
        while level + 1 < LEVEL_COUNT
            && levels[level + 1].ring.is_some()
            && Self::scale_of(level + 1) as f64 <= min_feature_length
        {
            level += 1;
        }

        let power = SCALE_POWER * (level as u32 + 1);
        let envelope = &levels[level];
        Some(EnvelopeSection {
            level,
            scale: Self::scale_of(level),
            start: (self.window_start + start) >> power,
            length: length >> power,
            valid: self.valid_range(channel, level),
            ring: envelope.ring?,
            samples: &envelope.samples,
        })
    }
}

/// Read-only window into one envelope level, borrowed for as long as the store
/// lock is held.
#[derive(Debug, Clone)]
pub struct EnvelopeSection<'a> {
    level: usize,
    scale: u64,
    start: u64,
    length: u64,
    valid: Range<u64>,
    ring: RingIndex,
    samples: &'a [EnvelopeSample],
}

impl<'a> EnvelopeSection<'a> {
    pub fn level(&self) -> usize {
        self.level
    }

    /// Raw samples per entry.
    pub fn scale(&self) -> u64 {
        self.scale
    }

    /// Entry number of the first requested entry at this level.
    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Entries of this level currently backed by raw data.
    pub fn valid_entries(&self) -> Range<u64> {
        self.valid.clone()
    }

    /// The `offset`-th requested entry, or `None` if it is not (or no longer)
    /// backed by raw data.
    pub fn get(&self, offset: u64) -> Option<EnvelopeSample> {
        let entry = self.start + offset;
        (offset < self.length && self.valid.contains(&entry))
            .then(|| self.samples[self.ring.wrap(entry)])
    }

    pub fn iter(&self) -> impl Iterator<Item = Option<EnvelopeSample>> + 'a {
        let section = self.clone();
        (0..self.length).map(move |offset| section.get(offset))
    }

    /// Copy the backed entries out so they can outlive the store lock.
    pub fn to_vec(&self) -> Vec<EnvelopeSample> {
        self.iter().flatten().collect()
    }

    pub fn snapshot(&self) -> EnvelopeSnapshot {
        EnvelopeSnapshot {
            level: self.level,
            scale: self.scale,
            start: self.start,
            samples: self.iter().collect(),
        }
    }
}

/// Owned copy of an [`EnvelopeSection`]; `None` marks entries not backed by
/// raw data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeSnapshot {
    pub level: usize,
    pub scale: u64,
    pub start: u64,
    pub samples: Vec<Option<EnvelopeSample>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition_config::ChannelSet;

    fn ring(capacity: usize) -> RingBuffer {
        let mut ring = RingBuffer::default();
        ring.allocate(capacity, &ChannelSet::new(vec![0], 8)).unwrap();
        ring
    }

    fn extended(ring: &RingBuffer) -> EnvelopeCache {
        let mut cache = EnvelopeCache::new();
        cache.reset(1, ring.capacity());
        cache.extend(ring);
        cache
    }

    #[test]
    fn test_incremental_levels() {
        let mut ring = ring(256);
        let mut cache = EnvelopeCache::new();
        cache.reset(1, 256);

        ring.append(&[0u8; 8], 1);
        cache.extend(&ring);
        assert_eq!(cache.level_count(0, 0), 0);

        ring.append(&[0xFFu8; 8], 1);
        cache.extend(&ring);
        assert_eq!(cache.level_count(0, 0), 1);
        let section = cache.query(0, 16, 16.0, 0).unwrap();
        assert_eq!(section.get(0), Some(EnvelopeSample { min: 0, max: 0xFF }));

        ring.append(&[0xFFu8; 240], 1);
        cache.extend(&ring);
        assert_eq!(cache.level_count(0, 0), 16);
        assert_eq!(cache.level_count(0, 1), 1);

        let level0 = cache.query(0, 256, 16.0, 0).unwrap();
        assert_eq!(level0.level(), 0);
        for i in 1..16 {
            assert_eq!(level0.get(i), Some(EnvelopeSample::of(0xFF)));
        }

        let level1 = cache.query(0, 256, 300.0, 0).unwrap();
        assert_eq!(level1.level(), 1);
        assert_eq!(level1.len(), 1);
        assert_eq!(level1.get(0), Some(EnvelopeSample { min: 0, max: 0xFF }));
    }

    #[test]
    fn test_query_finer_than_level_zero() {
        let mut ring = ring(64);
        ring.append(&[1u8; 64], 1);
        let cache = extended(&ring);
        assert!(cache.query(0, 64, 4.0, 0).is_none());
        assert!(cache.query(0, 64, 15.9, 0).is_none());
        assert_eq!(cache.query(0, 64, 16.0, 0).unwrap().level(), 0);
    }

    #[test]
    fn test_query_caps_at_last_populated_level() {
        let mut ring = ring(512);
        ring.append(&vec![3u8; 512], 1);
        let cache = extended(&ring);
        // 512 raw samples support levels 0 (32 entries) and 1 (2 entries) only.
        let section = cache.query(0, 512, 1.0e9, 0).unwrap();
        assert_eq!(section.level(), 1);
        assert_eq!(section.scale(), 256);
        assert_eq!(section.len(), 2);
    }

    #[test]
    fn test_wrapped_ring_summaries_follow_raw_window() {
        let mut ring = ring(40);
        let data: Vec<u8> = (0..100u8).collect();
        let mut cache = EnvelopeCache::new();
        cache.reset(1, 40);
        for chunk in data.chunks(7) {
            ring.append(chunk, 1);
            cache.extend(&ring);
        }

        // Raw window holds samples 60..100; whole groups inside it are 4 and 5.
        assert_eq!(cache.valid_range(0, 0), 4..6);
        let section = cache.query(0, 48, 16.0, 0).unwrap();
        assert_eq!(section.start(), 3);
        assert_eq!(section.len(), 3);
        assert_eq!(section.get(0), None);
        assert_eq!(section.get(1), Some(EnvelopeSample { min: 64, max: 79 }));
        assert_eq!(section.get(2), Some(EnvelopeSample { min: 80, max: 95 }));
    }

    #[test]
    fn test_group_straddling_wrap_point() {
        // Capacity 24 is not a multiple of 16, so group 1 (samples 16..32)
        // occupies ring positions 16..24 and 0..8.
        let mut ring = ring(24);
        let mut cache = EnvelopeCache::new();
        cache.reset(1, 24);
        let data: Vec<u8> = (0..32u8).map(|v| v.wrapping_mul(37)).collect();
        ring.append(&data[..20], 1);
        cache.extend(&ring);
        ring.append(&data[20..], 1);
        cache.extend(&ring);

        assert_eq!(cache.level_count(0, 0), 2);
        assert_eq!(cache.valid_range(0, 0), 1..2);
        let section = cache.query(0, 32, 16.0, 0).unwrap();
        let expected = data[16..32]
            .iter()
            .fold(EnvelopeSample::of(data[16].into()), |acc, &v| {
                acc.merge(EnvelopeSample::of(v.into()))
            });
        assert_eq!(section.get(0), None);
        assert_eq!(section.to_vec(), vec![expected]);
    }

    #[test]
    fn test_reset_discards_levels() {
        let mut ring = ring(64);
        ring.append(&[9u8; 64], 1);
        let mut cache = extended(&ring);
        assert_eq!(cache.level_count(0, 0), 4);
        cache.reset(1, 64);
        assert_eq!(cache.level_count(0, 0), 0);
        assert!(cache.query(0, 64, 16.0, 0).unwrap().to_vec().is_empty());
    }
}
