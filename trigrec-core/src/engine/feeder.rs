//! Producer-side adapter between a capture callback and the period buffer.

use crate::{
    buffering::{PeriodWriter, RingStatsSnapshot},
    notify::DataReady,
    Sample,
};

/// Turns callback-sized blocks of samples into periods.
///
/// Each call to [`feed_interleaved`](Self::feed_interleaved) or
/// [`feed_planar`](Self::feed_planar) writes one period stamped with the
/// running frame clock and then wakes the consumer. The clock advances even
/// when a period is dropped, so the consumer sees the gap as a jump in time.
///
/// Safe to call from an audio callback: blocks of up to `max_frames` frames
/// are deinterleaved into preallocated scratch, and neither the buffer nor the
/// notification blocks.
pub struct PeriodFeeder {
    writer: PeriodWriter,
    ready: DataReady,
    clock: u32,
    scratch: Vec<Sample>,
    dropped: u64,
}

impl PeriodFeeder {
    pub fn new(writer: PeriodWriter, ready: DataReady, max_frames: usize) -> Self {
        Self {
            writer,
            ready,
            clock: 0,
            scratch: vec![0.0; max_frames],
            dropped: 0,
        }
    }

    /// Write one period from interleaved samples. A trailing partial frame is
    /// ignored. Returns `false` if the period was dropped for lack of space.
    pub fn feed_interleaved(&mut self, data: &[Sample], channels: usize) -> bool {
        if channels == 0 {
            return false;
        }
        let nframes = data.len() / channels;
        if nframes == 0 {
            return false;
        }
        let time = self.advance(nframes);
        if self.writer.reserve(time, nframes as u32, channels as u32) == 0 {
            self.dropped += 1;
            return false;
        }
        if self.scratch.len() < nframes {
            // Block larger than configured; allocates once.
            self.scratch.resize(nframes, 0.0);
        }
        for channel in 0..channels {
            let dest = &mut self.scratch[..nframes];
            for (slot, frame) in dest.iter_mut().zip(data.chunks_exact(channels)) {
                *slot = frame[channel];
            }
            self.writer.push(&self.scratch[..nframes]);
        }
        self.ready.notify();
        true
    }

    /// Write one period from per-channel slices.
    ///
    /// # Panics
    /// If the slices differ in length.
    pub fn feed_planar(&mut self, channels: &[&[Sample]]) -> bool {
        let nframes = channels.first().map_or(0, |c| c.len());
        if nframes == 0 {
            return false;
        }
        let time = self.advance(nframes);
        if self.writer.write_period(time, nframes as u32, channels) == 0 {
            self.dropped += 1;
            return false;
        }
        self.ready.notify();
        true
    }

    /// Frame time the next period will carry.
    pub fn clock(&self) -> u32 {
        self.clock
    }

    /// Restart the frame clock. Setting it below its current value makes the
    /// consumer treat the following periods as a new recording.
    pub fn set_clock(&mut self, time: u32) {
        self.clock = time;
    }

    /// Periods dropped by this feeder.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn stats(&self) -> RingStatsSnapshot {
        self.writer.stats()
    }

    pub fn writer(&self) -> &PeriodWriter {
        &self.writer
    }

    fn advance(&mut self, nframes: usize) -> u32 {
        let time = self.clock;
        self.clock = self.clock.wrapping_add(nframes as u32);
        time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::{period::period_bytes, PeriodRingbuffer};

    #[test]
    fn interleaved_blocks_become_planar_periods() {
        let (writer, mut reader) = PeriodRingbuffer::new(4096).expect("buffer").split();
        let mut feeder = PeriodFeeder::new(writer, DataReady::new(), 8);

        assert!(feeder.feed_interleaved(&[1.0, -1.0, 2.0, -2.0, 3.0, -3.0], 2));
        assert!(feeder.feed_interleaved(&[4.0, -4.0], 2));
        assert_eq!(feeder.clock(), 4);

        let header = reader.request().expect("first period");
        assert_eq!((header.time, header.nframes, header.nchannels), (0, 3, 2));
        let mut left = [0.0; 3];
        let mut right = [0.0; 3];
        reader.pop(&mut left);
        reader.pop(&mut right);
        reader.release();
        assert_eq!(left, [1.0, 2.0, 3.0]);
        assert_eq!(right, [-1.0, -2.0, -3.0]);

        assert_eq!(reader.request().expect("second period").time, 3);
    }

    #[test]
    fn dropped_periods_still_advance_the_clock() {
        let size = period_bytes(4, 1);
        let (writer, mut reader) = PeriodRingbuffer::new(size).expect("buffer").split();
        let mut feeder = PeriodFeeder::new(writer, DataReady::new(), 4);

        assert!(feeder.feed_planar(&[&[0.0; 4]]));
        assert!(!feeder.feed_planar(&[&[0.0; 4]]));
        assert_eq!(feeder.dropped(), 1);
        assert_eq!(reader.overruns(), 1);

        reader.peek().expect("period");
        reader.release();
        assert!(feeder.feed_planar(&[&[0.0; 4]]));
        assert_eq!(reader.peek().expect("period").time(), 8);
    }

    #[test]
    fn degenerate_blocks_are_ignored() {
        let (writer, reader) = PeriodRingbuffer::new(1024).expect("buffer").split();
        let mut feeder = PeriodFeeder::new(writer, DataReady::new(), 4);
        assert!(!feeder.feed_interleaved(&[1.0, 2.0], 0));
        assert!(!feeder.feed_interleaved(&[1.0], 2));
        assert!(!feeder.feed_planar(&[]));
        assert_eq!(reader.available_periods(), 0);
        assert_eq!(feeder.clock(), 0);
    }
}
