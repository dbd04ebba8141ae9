//! Lock-free SPSC ring buffers.
//!
//! [`RingBuffer`] is a fixed-capacity queue of `Copy` elements backed by
//! `ringbuf::HeapRb`. The unsplit owner supports reconfiguration
//! ([`RingBuffer::resize`]); once [`split`](RingBuffer::split) into a
//! [`RingWriter`] and a [`RingReader`], each half may live on its own thread
//! and all operations are wait-free. The halves publish data through the ring's
//! atomic indices only: a written element becomes visible to the reader when
//! the write index is advanced, and space becomes visible to the writer when
//! the read index is advanced.
//!
//! [`period`] layers timestamped multi-channel periods on top of a byte ring.

pub mod events;
pub mod period;

use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapCons, HeapProd, HeapRb,
};

use crate::error::{Result, TrigrecError};

pub use period::{
    Channel, Period, PeriodHeader, PeriodReader, PeriodRingbuffer, PeriodWriter, RingStats,
    RingStatsSnapshot,
};

/// Fixed-capacity single-producer/single-consumer queue.
pub struct RingBuffer<T> {
    rb: HeapRb<T>,
}

impl<T: Copy> RingBuffer<T> {
    /// Allocate a ring holding `capacity` elements.
    ///
    /// # Errors
    /// `TrigrecError::ZeroCapacity` if `capacity` is zero.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(TrigrecError::ZeroCapacity);
        }
        Ok(Self {
            rb: HeapRb::new(capacity),
        })
    }

    pub fn capacity(&self) -> usize {
        self.rb.capacity().get()
    }

    /// Elements that can be written without overwriting unread data.
    pub fn write_space(&self) -> usize {
        self.rb.vacant_len()
    }

    /// Elements available to read.
    pub fn read_space(&self) -> usize {
        self.rb.occupied_len()
    }

    /// Append one element. Returns `false` (and writes nothing) when full.
    pub fn write(&mut self, item: T) -> bool {
        self.rb.try_push(item).is_ok()
    }

    /// Remove the oldest element, if any.
    pub fn read(&mut self) -> Option<T> {
        self.rb.try_pop()
    }

    /// Append as many elements of `items` as fit; returns the count written.
    pub fn write_slice(&mut self, items: &[T]) -> usize {
        self.rb.push_slice(items)
    }

    /// Move up to `dest.len()` elements into `dest`; returns the count read.
    pub fn read_slice(&mut self, dest: &mut [T]) -> usize {
        self.rb.pop_slice(dest)
    }

    /// Reallocate with a new capacity.
    ///
    /// Only available on the unsplit buffer, so no reader or writer can be
    /// active. Buffered elements are carried over oldest-first; whatever does
    /// not fit is discarded and counted in the return value.
    pub fn resize(&mut self, capacity: usize) -> Result<usize> {
        if capacity == 0 {
            return Err(TrigrecError::ZeroCapacity);
        }
        let buffered = self.rb.occupied_len();
        let mut resized = HeapRb::new(capacity);
        while !resized.is_full() {
            match self.rb.try_pop() {
                Some(item) => {
                    let _ = resized.try_push(item);
                }
                None => break,
            }
        }
        let discarded = buffered - resized.occupied_len();
        self.rb = resized;
        Ok(discarded)
    }

    /// Hand out the producer and consumer halves.
    pub fn split(self) -> (RingWriter<T>, RingReader<T>) {
        let (prod, cons) = self.rb.split();
        (RingWriter { prod }, RingReader { cons })
    }
}

/// Producer half of a [`RingBuffer`]. Held by the real-time thread.
pub struct RingWriter<T> {
    prod: HeapProd<T>,
}

impl<T: Copy> RingWriter<T> {
    pub fn capacity(&self) -> usize {
        self.prod.capacity().get()
    }

    pub fn write_space(&self) -> usize {
        self.prod.vacant_len()
    }

    pub fn write(&mut self, item: T) -> bool {
        self.prod.try_push(item).is_ok()
    }

    /// Wait-free bulk write. All copied elements are published together.
    pub fn write_slice(&mut self, items: &[T]) -> usize {
        self.prod.push_slice(items)
    }
}

/// Consumer half of a [`RingBuffer`].
pub struct RingReader<T> {
    cons: HeapCons<T>,
}

impl<T: Copy> RingReader<T> {
    pub fn capacity(&self) -> usize {
        self.cons.capacity().get()
    }

    pub fn read_space(&self) -> usize {
        self.cons.occupied_len()
    }

    /// Free space as currently seen from the consumer side.
    pub fn write_space(&self) -> usize {
        self.cons.vacant_len()
    }

    pub fn read(&mut self) -> Option<T> {
        self.cons.try_pop()
    }

    pub fn read_slice(&mut self, dest: &mut [T]) -> usize {
        self.cons.pop_slice(dest)
    }

    /// Copy the oldest elements into `dest` without consuming them.
    pub fn peek_slice(&self, dest: &mut [T]) -> usize {
        let (head, tail) = self.cons.as_slices();
        let n = dest.len().min(head.len() + tail.len());
        let from_head = n.min(head.len());
        dest[..from_head].copy_from_slice(&head[..from_head]);
        dest[from_head..n].copy_from_slice(&tail[..n - from_head]);
        n
    }

    /// Drop up to `count` of the oldest elements; returns the count dropped.
    pub fn skip(&mut self, count: usize) -> usize {
        self.cons.skip(count)
    }

    /// The readable region, oldest first, as two slices (the second is
    /// non-empty only when the data wraps around the end of the arena).
    pub fn as_slices(&self) -> (&[T], &[T]) {
        self.cons.as_slices()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(
            RingBuffer::<u8>::new(0),
            Err(TrigrecError::ZeroCapacity)
        ));
    }

    #[test]
    fn write_fails_without_partial_write_when_full() {
        let mut rb = RingBuffer::<u32>::new(2).expect("ring");
        assert!(rb.write(1));
        assert!(rb.write(2));
        assert_eq!(rb.write_space(), 0);
        assert!(!rb.write(3));
        assert_eq!(rb.read_space(), 2);
        assert_eq!(rb.read(), Some(1));
        assert_eq!(rb.read(), Some(2));
        assert_eq!(rb.read(), None);
    }

    #[test]
    fn resize_keeps_oldest_items_that_fit() {
        let mut rb = RingBuffer::<u16>::new(8).expect("ring");
        assert_eq!(rb.write_slice(&[1, 2, 3, 4, 5]), 5);

        let discarded = rb.resize(3).expect("resize");
        assert_eq!(discarded, 2);
        assert_eq!(rb.capacity(), 3);

        let mut out = [0u16; 3];
        assert_eq!(rb.read_slice(&mut out), 3);
        assert_eq!(out, [1, 2, 3]);
    }

    #[test]
    fn split_halves_share_the_arena() {
        let (mut writer, mut reader) = RingBuffer::<u8>::new(4).expect("ring").split();
        assert_eq!(writer.write_slice(b"abcdef"), 4);
        assert_eq!(reader.read_space(), 4);

        let mut peeked = [0u8; 2];
        assert_eq!(reader.peek_slice(&mut peeked), 2);
        assert_eq!(&peeked, b"ab");
        assert_eq!(reader.read_space(), 4, "peek must not consume");

        assert_eq!(reader.skip(3), 3);
        assert_eq!(reader.read(), Some(b'd'));
        assert_eq!(writer.write_space(), 4);
    }

    #[test]
    fn slices_expose_wrapped_region_in_order() {
        let (mut writer, mut reader) = RingBuffer::<u8>::new(4).expect("ring").split();
        writer.write_slice(b"abc");
        reader.skip(2);
        writer.write_slice(b"def");

        let (head, tail) = reader.as_slices();
        let joined: Vec<u8> = head.iter().chain(tail.iter()).copied().collect();
        assert_eq!(joined, b"cdef");
    }

    #[test]
    fn concurrent_producer_and_consumer_preserve_order() {
        let (mut writer, mut reader) = RingBuffer::<u32>::new(64).expect("ring").split();
        const N: u32 = 100_000;

        let producer = std::thread::spawn(move || {
            let mut next = 0u32;
            while next < N {
                if writer.write(next) {
                    next += 1;
                } else {
                    std::thread::yield_now();
                }
            }
        });

        let mut expected = 0u32;
        while expected < N {
            match reader.read() {
                Some(v) => {
                    assert_eq!(v, expected);
                    expected += 1;
                }
                None => std::thread::yield_now(),
            }
        }
        producer.join().expect("producer thread panicked");
    }
}
