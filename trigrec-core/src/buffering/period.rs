//! Lock-free period ring buffer.
//!
//! For multichannel data all channels must travel through the same ring to stay
//! in sync with each other, and the reader must know how much to take out per
//! period. Each period is therefore framed with a header carrying its timestamp,
//! frame count, channel count and payload length, followed by one
//! length-prefixed block per channel:
//!
//! ```text
//! | time u32 | nframes u32 | nchannels u32 | nbytes u32 |  (16-byte header)
//! | len u32 | channel 0 bytes | len u32 | channel 1 bytes | ...
//! ```
//!
//! Audio blocks hold `nframes` native-endian samples. Event blocks hold
//! [`EventRecord`]s and may have any length.
//!
//! The writer reserves a whole period, then supplies it channel by channel. The
//! period is staged on the writer side and published with a single advance of
//! the ring's write index after the last channel, so a reader can never observe
//! a partial period. Misusing the protocol (pushing without a reservation,
//! reserving twice, popping before requesting...) is a caller bug and panics.
//!
//! On the read side there are two cursors: the destructive read cursor (the
//! ring's read index) and a read-ahead cursor used by [`PeriodReader::peek_ahead`]
//! to inspect periods without consuming them. The read-ahead cursor is kept as a
//! byte offset from the read cursor, so it can never fall behind it.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use serde::Serialize;

use crate::{
    buffering::{
        events::{self, EventIter, EventRecord},
        RingBuffer, RingReader, RingWriter,
    },
    error::Result,
    Sample, SAMPLE_BYTES,
};

/// Length prefix preceding every channel block.
pub const CHANNEL_PREFIX_LEN: usize = 4;

/// Minimum number of worst-case periods a buffer should hold so that both
/// threads always have something to work on.
pub const MIN_PERIODS: usize = 3;

/// Header framing every period in the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodHeader {
    /// Frame counter value at the start of the period. Wraps at `u32::MAX`.
    pub time: u32,
    pub nframes: u32,
    pub nchannels: u32,
    /// Payload length in bytes, channel length prefixes included.
    pub nbytes: u32,
}

impl PeriodHeader {
    pub const LEN: usize = 16;

    /// Size of the framed period (header plus payload).
    pub fn total_len(&self) -> usize {
        Self::LEN + self.nbytes as usize
    }

    fn encode(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0..4].copy_from_slice(&self.time.to_le_bytes());
        out[4..8].copy_from_slice(&self.nframes.to_le_bytes());
        out[8..12].copy_from_slice(&self.nchannels.to_le_bytes());
        out[12..16].copy_from_slice(&self.nbytes.to_le_bytes());
        out
    }

    fn decode(raw: &[u8; Self::LEN]) -> Self {
        let word = |i: usize| u32::from_le_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
        Self {
            time: word(0),
            nframes: word(4),
            nchannels: word(8),
            nbytes: word(12),
        }
    }
}

/// Bytes taken in the ring by one audio period.
pub const fn period_bytes(nframes: usize, nchannels: usize) -> usize {
    PeriodHeader::LEN + nchannels * (CHANNEL_PREFIX_LEN + nframes * SAMPLE_BYTES)
}

/// Counters shared by both halves of a [`PeriodRingbuffer`].
#[derive(Debug, Default)]
pub struct RingStats {
    periods_written: AtomicU64,
    periods_dropped: AtomicU64,
    periods_released: AtomicU64,
}

impl RingStats {
    pub fn snapshot(&self) -> RingStatsSnapshot {
        RingStatsSnapshot {
            periods_written: self.periods_written.load(Ordering::Relaxed),
            periods_dropped: self.periods_dropped.load(Ordering::Relaxed),
            periods_released: self.periods_released.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RingStatsSnapshot {
    pub periods_written: u64,
    /// Periods refused by `reserve` for lack of space (overruns).
    pub periods_dropped: u64,
    pub periods_released: u64,
}

/// Unsplit period buffer. Create once at stream setup, then [`split`](Self::split).
pub struct PeriodRingbuffer {
    ring: RingBuffer<u8>,
}

impl PeriodRingbuffer {
    /// Allocate a buffer of `capacity` bytes.
    ///
    /// There is no fixed relationship between buffer size and period size, but
    /// the buffer should hold at least [`MIN_PERIODS`] periods (see
    /// [`period_bytes`]); in practice much larger buffers are a good idea.
    pub fn new(capacity: usize) -> Result<Self> {
        Ok(Self {
            ring: RingBuffer::new(capacity)?,
        })
    }

    /// Buffer sized for `periods` audio periods of the given shape.
    pub fn for_periods(nframes: usize, nchannels: usize, periods: usize) -> Result<Self> {
        Self::new(period_bytes(nframes, nchannels) * periods)
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Reallocate for a new session configuration. Buffered periods are
    /// discarded, since a shrinking copy could cut one in half.
    pub fn resize(&mut self, capacity: usize) -> Result<()> {
        self.ring = RingBuffer::new(capacity)?;
        Ok(())
    }

    pub fn split(self) -> (PeriodWriter, PeriodReader) {
        let capacity = self.ring.capacity();
        let (writer, reader) = self.ring.split();
        let stats = Arc::new(RingStats::default());
        (
            PeriodWriter {
                ring: writer,
                staging: Vec::with_capacity(capacity),
                pending: None,
                stats: Arc::clone(&stats),
            },
            PeriodReader {
                ring: reader,
                scratch: Vec::new(),
                read_ahead: 0,
                oldest_seen: false,
                request: None,
                stats,
            },
        )
    }
}

#[derive(Debug)]
struct Pending {
    nframes: u32,
    chans_to_write: u32,
    bytes_to_write: usize,
}

/// Write side. Owned by the real-time thread; never blocks or allocates.
pub struct PeriodWriter {
    ring: RingWriter<u8>,
    /// Holds the period being assembled. Sized to the ring capacity at
    /// construction, which bounds any period that can be reserved.
    staging: Vec<u8>,
    pending: Option<Pending>,
    stats: Arc<RingStats>,
}

impl PeriodWriter {
    /// Reserve space for an audio period of `nchannels` × `nframes` samples.
    ///
    /// If the whole period fits, the header is staged and subsequent calls to
    /// [`push`](Self::push) supply the channels. Nothing becomes visible to the
    /// reader until the last channel is pushed.
    ///
    /// Returns the number of periods of this size that could fit in the free
    /// space. Zero means the period does not fit: nothing is written, the
    /// dropped-period counter is incremented and the caller should skip the
    /// period.
    ///
    /// # Panics
    /// If the previous period has not been completely written.
    pub fn reserve(&mut self, time: u32, nframes: u32, nchannels: u32) -> usize {
        let data_bytes = nchannels as usize * nframes as usize * SAMPLE_BYTES;
        self.reserve_bytes(time, nframes, nchannels, data_bytes)
    }

    /// Reserve a period whose channels total `data_bytes` (length prefixes
    /// excluded). Used when event channels of variable length are involved.
    ///
    /// # Panics
    /// If the previous period has not been completely written.
    pub fn reserve_bytes(
        &mut self,
        time: u32,
        nframes: u32,
        nchannels: u32,
        data_bytes: usize,
    ) -> usize {
        if self.pending.is_some() {
            panic!("reserve called before the previous period was completely written");
        }
        let payload = data_bytes + nchannels as usize * CHANNEL_PREFIX_LEN;
        let total = PeriodHeader::LEN + payload;
        let space = self.ring.write_space();
        let Ok(nbytes) = u32::try_from(payload) else {
            self.stats.periods_dropped.fetch_add(1, Ordering::Relaxed);
            return 0;
        };
        if total > space {
            self.stats.periods_dropped.fetch_add(1, Ordering::Relaxed);
            return 0;
        }

        let header = PeriodHeader {
            time,
            nframes,
            nchannels,
            nbytes,
        };
        self.staging.clear();
        self.staging.extend_from_slice(&header.encode());
        self.pending = Some(Pending {
            nframes,
            chans_to_write: nchannels,
            bytes_to_write: payload,
        });
        if nchannels == 0 {
            self.publish();
        }
        space / total
    }

    /// Write one audio channel of the reserved period.
    ///
    /// # Panics
    /// If no period is reserved, all channels were already written, or
    /// `samples` does not hold exactly `nframes` samples.
    pub fn push(&mut self, samples: &[Sample]) {
        let nframes = match &self.pending {
            Some(p) => p.nframes as usize,
            None => panic!("push called without an open reservation"),
        };
        assert_eq!(
            samples.len(),
            nframes,
            "channel length must equal the reserved frame count"
        );
        self.push_bytes(bytemuck::cast_slice(samples));
    }

    /// Write one raw channel block of the reserved period.
    ///
    /// # Panics
    /// If no period is reserved, all channels were already written, or the
    /// block does not fit the reserved payload size.
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.begin_channel(bytes.len());
        self.staging.extend_from_slice(bytes);
        self.end_channel();
    }

    /// Encode `events` as one event channel of the reserved period. Size the
    /// reservation with [`events::encoded_len`].
    pub fn push_events(&mut self, records: &[EventRecord<'_>]) {
        self.begin_channel(events::encoded_len(records));
        for record in records {
            events::encode_into(&mut self.staging, record);
        }
        self.end_channel();
    }

    /// Reserve and write a complete audio period in one call. Returns the
    /// result of [`reserve`](Self::reserve); on zero nothing is written.
    pub fn write_period(&mut self, time: u32, nframes: u32, channels: &[&[Sample]]) -> usize {
        let fits = self.reserve(time, nframes, channels.len() as u32);
        if fits > 0 {
            for channel in channels {
                self.push(channel);
            }
        }
        fits
    }

    /// Whether a period is reserved but not yet fully written.
    pub fn is_reserved(&self) -> bool {
        self.pending.is_some()
    }

    pub fn write_space(&self) -> usize {
        self.ring.write_space()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn stats(&self) -> RingStatsSnapshot {
        self.stats.snapshot()
    }

    fn begin_channel(&mut self, len: usize) {
        let Some(pending) = self.pending.as_mut() else {
            panic!("push called without an open reservation");
        };
        let block = CHANNEL_PREFIX_LEN + len;
        if block > pending.bytes_to_write {
            panic!(
                "channel of {len} bytes overflows the reserved period ({} bytes left)",
                pending.bytes_to_write
            );
        }
        pending.chans_to_write -= 1;
        pending.bytes_to_write -= block;
        if pending.chans_to_write == 0 && pending.bytes_to_write != 0 {
            panic!(
                "last channel leaves {} reserved bytes unwritten",
                pending.bytes_to_write
            );
        }
        self.staging.extend_from_slice(&(len as u32).to_le_bytes());
    }

    fn end_channel(&mut self) {
        if matches!(&self.pending, Some(p) if p.chans_to_write == 0) {
            self.publish();
        }
    }

    fn publish(&mut self) {
        // Free space only grows between reserve and publish, so this never
        // comes up short.
        let written = self.ring.write_slice(&self.staging);
        debug_assert_eq!(written, self.staging.len());
        self.pending = None;
        self.stats.periods_written.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy)]
struct RequestState {
    header: PeriodHeader,
    next_channel: u32,
    /// Offset of the next channel block within the payload.
    offset: usize,
}

/// Read side. Owned by exactly one consumer thread.
pub struct PeriodReader {
    ring: RingReader<u8>,
    /// Contiguous copy of regions that wrap around the end of the arena.
    scratch: Vec<u8>,
    /// Bytes between the read cursor and the read-ahead cursor.
    read_ahead: usize,
    /// The oldest period was handed out by `peek`.
    oldest_seen: bool,
    request: Option<RequestState>,
    stats: Arc<RingStats>,
}

impl PeriodReader {
    /// The oldest unreleased period, if one is completely written.
    pub fn peek(&mut self) -> Option<Period<'_>> {
        let header = self.header_at(0)?;
        self.oldest_seen = true;
        Some(self.view(0, header))
    }

    /// The next period past the read-ahead cursor, advancing the cursor.
    ///
    /// Successive calls walk forward through the buffer without consuming
    /// anything; [`release`](Self::release) later frees the periods in order.
    pub fn peek_ahead(&mut self) -> Option<Period<'_>> {
        let offset = self.read_ahead;
        let header = self.header_at(offset)?;
        self.read_ahead += header.total_len();
        Some(self.view(offset, header))
    }

    /// Free the oldest period, returning its header.
    ///
    /// # Panics
    /// If the oldest period was never handed out by `request`, `peek` or
    /// `peek_ahead` (including releasing twice).
    pub fn release(&mut self) -> PeriodHeader {
        let acquired = self.request.is_some() || self.oldest_seen || self.read_ahead > 0;
        let header = match self.header_at(0) {
            Some(header) if acquired => header,
            _ => panic!("release called without a requested or peeked period"),
        };
        let total = header.total_len();
        self.ring.skip(total);
        self.read_ahead = self.read_ahead.saturating_sub(total);
        self.request = None;
        self.oldest_seen = false;
        self.stats.periods_released.fetch_add(1, Ordering::Relaxed);
        header
    }

    /// Drop every complete period currently in the buffer without copying
    /// payload, resetting both cursors. Used to recover from an overrun.
    ///
    /// Returns the number of periods released.
    pub fn release_all(&mut self) -> usize {
        let mut released = 0usize;
        let mut bytes = 0usize;
        while let Some(header) = self.header_at(bytes) {
            bytes += header.total_len();
            released += 1;
        }
        self.ring.skip(bytes);
        self.read_ahead = 0;
        self.request = None;
        self.oldest_seen = false;
        self.stats
            .periods_released
            .fetch_add(released as u64, Ordering::Relaxed);
        released
    }

    /// Header of the oldest period, for channel-by-channel reading with
    /// [`pop`](Self::pop). Repeated calls return the same period until it is
    /// released.
    pub fn request(&mut self) -> Option<PeriodHeader> {
        if let Some(req) = &self.request {
            return Some(req.header);
        }
        let header = self.header_at(0)?;
        self.request = Some(RequestState {
            header,
            next_channel: 0,
            offset: 0,
        });
        Some(header)
    }

    /// Copy the next channel of the requested period into `dest`. Returns the
    /// number of samples copied.
    ///
    /// # Panics
    /// If called before `request` or after all channels have been read.
    pub fn pop(&mut self, dest: &mut [Sample]) -> usize {
        self.pop_with(|_, channel| channel.copy_to(dest))
    }

    /// Hand the next channel of the requested period to `visit` together with
    /// its index.
    ///
    /// # Panics
    /// If called before `request` or after all channels have been read.
    pub fn pop_with<R>(&mut self, visit: impl FnOnce(usize, Channel<'_>) -> R) -> R {
        let Some(req) = self.request else {
            panic!("pop called before request");
        };
        if req.next_channel >= req.header.nchannels {
            panic!(
                "pop called after all {} channels of the period were read",
                req.header.nchannels
            );
        }

        let block = PeriodHeader::LEN + req.offset;
        let mut prefix = [0u8; CHANNEL_PREFIX_LEN];
        self.copy_out(block, &mut prefix);
        let len = u32::from_le_bytes(prefix) as usize;
        let out = visit(
            req.next_channel as usize,
            Channel {
                bytes: self.region(block + CHANNEL_PREFIX_LEN, len),
            },
        );

        self.request = Some(RequestState {
            next_channel: req.next_channel + 1,
            offset: req.offset + CHANNEL_PREFIX_LEN + len,
            ..req
        });
        out
    }

    /// Number of complete periods available.
    pub fn available_periods(&self) -> usize {
        let mut count = 0usize;
        let mut offset = 0usize;
        while let Some(header) = self.header_at(offset) {
            offset += header.total_len();
            count += 1;
        }
        count
    }

    /// Bytes that have been passed by `peek_ahead` but not released.
    pub fn read_ahead_bytes(&self) -> usize {
        self.read_ahead
    }

    pub fn read_space(&self) -> usize {
        self.ring.read_space()
    }

    pub fn write_space(&self) -> usize {
        self.ring.write_space()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Periods the writer has dropped for lack of space so far.
    pub fn overruns(&self) -> u64 {
        self.stats.periods_dropped.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> RingStatsSnapshot {
        self.stats.snapshot()
    }

    /// Counters shared with the writer, for reading after this reader has
    /// moved to another thread.
    pub fn stats_handle(&self) -> Arc<RingStats> {
        Arc::clone(&self.stats)
    }

    /// Header of the period starting `offset` bytes past the read cursor, if
    /// that period is completely written.
    fn header_at(&self, offset: usize) -> Option<PeriodHeader> {
        let (head, tail) = self.ring.as_slices();
        let available = head.len() + tail.len();
        if available < offset + PeriodHeader::LEN {
            return None;
        }
        let mut raw = [0u8; PeriodHeader::LEN];
        copy_region(head, tail, offset, &mut raw);
        let header = PeriodHeader::decode(&raw);
        (available >= offset + header.total_len()).then_some(header)
    }

    fn view(&mut self, offset: usize, header: PeriodHeader) -> Period<'_> {
        Period {
            header,
            payload: self.region(offset + PeriodHeader::LEN, header.nbytes as usize),
        }
    }

    fn copy_out(&self, start: usize, dest: &mut [u8]) {
        let (head, tail) = self.ring.as_slices();
        copy_region(head, tail, start, dest);
    }

    /// `len` bytes starting `start` bytes past the read cursor, borrowed from
    /// the ring when contiguous and copied into scratch when they wrap.
    fn region(&mut self, start: usize, len: usize) -> &[u8] {
        let Self { ring, scratch, .. } = self;
        let (head, tail) = ring.as_slices();
        if start + len <= head.len() {
            &head[start..start + len]
        } else if start >= head.len() {
            let start = start - head.len();
            &tail[start..start + len]
        } else {
            scratch.clear();
            scratch.resize(len, 0);
            copy_region(head, tail, start, scratch);
            &scratch[..]
        }
    }
}

/// Copy `dest.len()` bytes starting at logical offset `start` of the
/// two-slice region `head ++ tail`.
fn copy_region(head: &[u8], tail: &[u8], start: usize, dest: &mut [u8]) {
    let mut filled = 0;
    let mut tail_start = start.saturating_sub(head.len());
    if start < head.len() {
        filled = (head.len() - start).min(dest.len());
        dest[..filled].copy_from_slice(&head[start..start + filled]);
        tail_start = 0;
    }
    let rest = dest.len() - filled;
    dest[filled..].copy_from_slice(&tail[tail_start..tail_start + rest]);
}

/// A complete period borrowed from the reader.
#[derive(Debug, Clone, Copy)]
pub struct Period<'a> {
    header: PeriodHeader,
    payload: &'a [u8],
}

impl<'a> Period<'a> {
    pub fn header(&self) -> PeriodHeader {
        self.header
    }

    pub fn time(&self) -> u32 {
        self.header.time
    }

    pub fn nframes(&self) -> u32 {
        self.header.nframes
    }

    pub fn nchannels(&self) -> usize {
        self.header.nchannels as usize
    }

    pub fn channels(&self) -> ChannelIter<'a> {
        ChannelIter {
            bytes: self.payload,
            remaining: self.header.nchannels,
        }
    }

    pub fn channel(&self, index: usize) -> Option<Channel<'a>> {
        self.channels().nth(index)
    }
}

/// Iterator over the channel blocks of a period, in push order.
#[derive(Debug, Clone)]
pub struct ChannelIter<'a> {
    bytes: &'a [u8],
    remaining: u32,
}

impl<'a> Iterator for ChannelIter<'a> {
    type Item = Channel<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 || self.bytes.len() < CHANNEL_PREFIX_LEN {
            return None;
        }
        let len = u32::from_le_bytes([self.bytes[0], self.bytes[1], self.bytes[2], self.bytes[3]])
            as usize;
        let end = (CHANNEL_PREFIX_LEN + len).min(self.bytes.len());
        let channel = Channel {
            bytes: &self.bytes[CHANNEL_PREFIX_LEN..end],
        };
        self.bytes = &self.bytes[end..];
        self.remaining -= 1;
        Some(channel)
    }
}

/// One channel block of a period.
#[derive(Debug, Clone, Copy)]
pub struct Channel<'a> {
    bytes: &'a [u8],
}

impl<'a> Channel<'a> {
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Number of whole samples in the block, when read as audio.
    pub fn sample_count(&self) -> usize {
        self.bytes.len() / SAMPLE_BYTES
    }

    pub fn samples(&self) -> impl Iterator<Item = Sample> + 'a {
        self.bytes
            .chunks_exact(SAMPLE_BYTES)
            .map(bytemuck::pod_read_unaligned::<Sample>)
    }

    /// Copy samples into `dest`; returns how many were copied.
    pub fn copy_to(&self, dest: &mut [Sample]) -> usize {
        let n = dest.len().min(self.sample_count());
        bytemuck::cast_slice_mut::<Sample, u8>(&mut dest[..n])
            .copy_from_slice(&self.bytes[..n * SAMPLE_BYTES]);
        n
    }

    /// Decode the block as event records.
    pub fn events(&self) -> EventIter<'a> {
        EventIter::new(self.bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(start: f32, len: usize) -> Vec<Sample> {
        (0..len).map(|i| start + i as f32).collect()
    }

    fn split(capacity: usize) -> (PeriodWriter, PeriodReader) {
        PeriodRingbuffer::new(capacity).expect("buffer").split()
    }

    #[test]
    fn request_pop_release_reproduces_pushed_periods() {
        let (mut writer, mut reader) = split(4096);

        for p in 0..3u32 {
            assert!(writer.reserve(p * 8, 8, 2) > 0);
            writer.push(&ramp(p as f32 * 100.0, 8));
            writer.push(&ramp(p as f32 * 100.0 + 50.0, 8));
        }

        for p in 0..3u32 {
            let header = reader.request().expect("period available");
            assert_eq!(header.time, p * 8);
            assert_eq!(header.nframes, 8);
            assert_eq!(header.nchannels, 2);

            let mut left = [0.0; 8];
            let mut right = [0.0; 8];
            assert_eq!(reader.pop(&mut left), 8);
            assert_eq!(reader.pop(&mut right), 8);
            assert_eq!(left.to_vec(), ramp(p as f32 * 100.0, 8));
            assert_eq!(right.to_vec(), ramp(p as f32 * 100.0 + 50.0, 8));
            reader.release();
        }
        assert!(reader.request().is_none());
        assert_eq!(reader.read_space(), 0);
    }

    #[test]
    fn partially_written_period_is_invisible() {
        let (mut writer, mut reader) = split(1024);
        writer.reserve(0, 4, 2);
        writer.push(&[1.0; 4]);

        assert!(reader.peek().is_none());
        assert!(reader.peek_ahead().is_none());
        assert!(reader.request().is_none());
        assert_eq!(reader.read_space(), 0);

        writer.push(&[2.0; 4]);
        assert_eq!(reader.peek().map(|p| p.nchannels()), Some(2));
    }

    #[test]
    #[should_panic(expected = "reserve called before the previous period")]
    fn second_reserve_before_completion_panics() {
        let (mut writer, _reader) = split(1024);
        writer.reserve(0, 4, 2);
        writer.push(&[0.0; 4]);
        writer.reserve(4, 4, 2);
    }

    #[test]
    #[should_panic(expected = "push called without an open reservation")]
    fn push_without_reserve_panics() {
        let (mut writer, _reader) = split(1024);
        writer.push(&[0.0; 4]);
    }

    #[test]
    #[should_panic(expected = "push called without an open reservation")]
    fn push_beyond_channel_count_panics() {
        let (mut writer, _reader) = split(1024);
        writer.reserve(0, 4, 1);
        writer.push(&[0.0; 4]);
        writer.push(&[0.0; 4]);
    }

    #[test]
    #[should_panic(expected = "channel length must equal")]
    fn push_with_wrong_frame_count_panics() {
        let (mut writer, _reader) = split(1024);
        writer.reserve(0, 4, 1);
        writer.push(&[0.0; 3]);
    }

    #[test]
    fn failed_reserve_leaves_buffer_unchanged() {
        let size = period_bytes(16, 2);
        let (mut writer, reader) = split(size * 2 + size / 2);

        assert_eq!(writer.reserve(0, 16, 2), 2);
        writer.push(&[0.5; 16]);
        writer.push(&[0.5; 16]);
        assert_eq!(writer.reserve(16, 16, 2), 1);
        writer.push(&[0.5; 16]);
        writer.push(&[0.5; 16]);

        let read_before = reader.read_space();
        let write_before = writer.write_space();
        assert_eq!(writer.reserve(32, 16, 2), 0);
        assert!(!writer.is_reserved());
        assert_eq!(reader.read_space(), read_before);
        assert_eq!(writer.write_space(), write_before);
        assert_eq!(reader.overruns(), 1);
        assert_eq!(reader.available_periods(), 2);
    }

    #[test]
    fn peek_ahead_walks_forward_and_release_keeps_cursor_in_front() {
        let (mut writer, mut reader) = split(4096);
        for t in 0..3u32 {
            writer.write_period(t * 4, 4, &[&[t as f32; 4]]);
        }

        assert_eq!(reader.peek_ahead().map(|p| p.time()), Some(0));
        assert_eq!(reader.peek_ahead().map(|p| p.time()), Some(4));
        assert_eq!(reader.release().time, 0);

        // The released period is never offered again, and the read-ahead
        // cursor still points past the second period.
        assert_eq!(reader.peek().map(|p| p.time()), Some(4));
        assert_eq!(reader.peek_ahead().map(|p| p.time()), Some(8));
        assert!(reader.peek_ahead().is_none());

        reader.release();
        reader.release();
        assert_eq!(reader.read_ahead_bytes(), 0);
        assert!(reader.peek_ahead().is_none());
    }

    #[test]
    fn release_without_read_ahead_resets_to_read_cursor() {
        let (mut writer, mut reader) = split(4096);
        writer.write_period(0, 4, &[&[0.0; 4]]);
        writer.write_period(4, 4, &[&[1.0; 4]]);

        assert!(reader.request().is_some());
        reader.release();
        assert_eq!(reader.read_ahead_bytes(), 0);
        assert_eq!(reader.peek_ahead().map(|p| p.time()), Some(4));
    }

    #[test]
    #[should_panic(expected = "release called without a requested or peeked period")]
    fn double_release_panics() {
        let (mut writer, mut reader) = split(4096);
        writer.write_period(0, 4, &[&[0.0; 4]]);
        writer.write_period(4, 4, &[&[0.0; 4]]);
        reader.request();
        reader.release();
        reader.release();
    }

    #[test]
    #[should_panic(expected = "pop called before request")]
    fn pop_before_request_panics() {
        let (mut writer, mut reader) = split(4096);
        writer.write_period(0, 4, &[&[0.0; 4]]);
        let mut dest = [0.0; 4];
        reader.pop(&mut dest);
    }

    #[test]
    #[should_panic(expected = "pop called after all 1 channels")]
    fn pop_past_last_channel_panics() {
        let (mut writer, mut reader) = split(4096);
        writer.write_period(0, 4, &[&[0.0; 4]]);
        let mut dest = [0.0; 4];
        reader.request();
        reader.pop(&mut dest);
        reader.pop(&mut dest);
    }

    #[test]
    fn release_all_recovers_a_full_buffer() {
        let size = period_bytes(32, 2);
        let (mut writer, mut reader) = split(size * 4);
        let initial_write = writer.write_space();

        let mut t = 0u32;
        while writer.write_period(t, 32, &[&[0.1; 32], &[0.2; 32]]) > 0 {
            t += 32;
        }
        assert_eq!(reader.overruns(), 1);
        reader.peek_ahead();
        reader.request();

        assert_eq!(reader.release_all(), 4);
        assert_eq!(reader.read_space(), 0);
        assert_eq!(reader.write_space(), initial_write);
        assert_eq!(reader.read_ahead_bytes(), 0);
        assert!(reader.request().is_none());
    }

    #[test]
    fn periods_survive_wraparound_intact() {
        // Capacity deliberately not a multiple of the period size.
        let (mut writer, mut reader) = split(period_bytes(10, 3) * 3 + 7);
        let mut next_read = 0u32;

        for t in 0..50u32 {
            let chans: Vec<Vec<Sample>> = (0..3).map(|c| ramp((t * 10 + c) as f32, 10)).collect();
            let refs: Vec<&[Sample]> = chans.iter().map(Vec::as_slice).collect();
            while writer.write_period(t, 10, &refs) == 0 {
                let period = reader.peek().expect("buffer full implies a period");
                assert_eq!(period.time(), next_read);
                for (c, channel) in period.channels().enumerate() {
                    let got: Vec<Sample> = channel.samples().collect();
                    assert_eq!(got, ramp((next_read * 10 + c as u32) as f32, 10));
                }
                reader.release();
                next_read += 1;
            }
        }
        assert_eq!(reader.available_periods() as u32, 50 - next_read);
    }

    #[test]
    fn mixed_audio_and_event_channels() {
        let (mut writer, mut reader) = split(4096);
        let note = [0x90u8, 64, 127];
        let records = [EventRecord::new(2, &note)];
        let data_bytes = 8 * SAMPLE_BYTES + events::encoded_len(&records);

        assert!(writer.reserve_bytes(128, 8, 2, data_bytes) > 0);
        writer.push(&[0.25; 8]);
        writer.push_events(&records);

        let period = reader.peek().expect("period");
        let audio = period.channel(0).expect("audio channel");
        assert_eq!(audio.sample_count(), 8);
        let events: Vec<_> = period.channel(1).expect("event channel").events().collect();
        assert_eq!(events, records);
    }

    #[test]
    fn pop_with_visits_channels_in_push_order() {
        let (mut writer, mut reader) = split(4096);
        writer.write_period(0, 2, &[&[1.0, 1.0], &[2.0, 2.0], &[3.0, 3.0]]);

        reader.request();
        let seen: Vec<(usize, Sample)> = (0..3)
            .map(|_| reader.pop_with(|idx, ch| (idx, ch.samples().sum::<Sample>())))
            .collect();
        assert_eq!(seen, vec![(0, 2.0), (1, 4.0), (2, 6.0)]);
    }

    #[test]
    fn resize_discards_buffered_periods() {
        let mut rb = PeriodRingbuffer::for_periods(16, 2, MIN_PERIODS).expect("buffer");
        assert_eq!(rb.capacity(), period_bytes(16, 2) * MIN_PERIODS);
        rb.resize(8192).expect("resize");
        let (writer, reader) = rb.split();
        assert_eq!(writer.capacity(), 8192);
        assert_eq!(reader.read_space(), 0);
    }
}
