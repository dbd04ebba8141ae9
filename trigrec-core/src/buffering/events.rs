//! Event records carried in event (control/MIDI-like) channels.
//!
//! An event channel block is a concatenation of records, each encoded as
//! `frame: u32 LE | len: u16 LE | data[len]`, where `frame` is the offset of
//! the event from the start of its period.

/// Bytes preceding each record's data.
pub const EVENT_HEADER_LEN: usize = 6;

/// One timestamped event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRecord<'a> {
    /// Frame offset within the period (or within the entry, once rebased).
    pub frame: u32,
    /// Raw message bytes; for MIDI the first byte is the status byte.
    pub data: &'a [u8],
}

impl<'a> EventRecord<'a> {
    pub fn new(frame: u32, data: &'a [u8]) -> Self {
        Self { frame, data }
    }

    pub fn encoded_len(&self) -> usize {
        EVENT_HEADER_LEN + self.data.len()
    }

    /// High nibble of the status byte (message type for MIDI).
    pub fn kind(&self) -> u8 {
        self.data.first().map_or(0, |s| s & 0xF0)
    }

    /// Low nibble of the status byte (MIDI channel).
    pub fn midi_channel(&self) -> u8 {
        self.data.first().map_or(0, |s| s & 0x0F)
    }
}

/// Total encoded size of `events` as one channel block.
pub fn encoded_len(events: &[EventRecord<'_>]) -> usize {
    events.iter().map(EventRecord::encoded_len).sum()
}

/// Append the encoding of `event` to `buf`.
///
/// # Panics
/// If the message is longer than `u16::MAX` bytes.
pub(crate) fn encode_into(buf: &mut Vec<u8>, event: &EventRecord<'_>) {
    let len = u16::try_from(event.data.len()).unwrap_or_else(|_| {
        panic!(
            "event message of {} bytes exceeds the record limit",
            event.data.len()
        )
    });
    buf.extend_from_slice(&event.frame.to_le_bytes());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(event.data);
}

/// Lazy decoder over an event channel block.
///
/// Stops at the first truncated record.
#[derive(Debug, Clone)]
pub struct EventIter<'a> {
    bytes: &'a [u8],
}

impl<'a> EventIter<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }
}

impl<'a> Iterator for EventIter<'a> {
    type Item = EventRecord<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.bytes.len() < EVENT_HEADER_LEN {
            return None;
        }
        let frame = u32::from_le_bytes([self.bytes[0], self.bytes[1], self.bytes[2], self.bytes[3]]);
        let len = u16::from_le_bytes([self.bytes[4], self.bytes[5]]) as usize;
        let end = EVENT_HEADER_LEN + len;
        if self.bytes.len() < end {
            self.bytes = &[];
            return None;
        }
        let data = &self.bytes[EVENT_HEADER_LEN..end];
        self.bytes = &self.bytes[end..];
        Some(EventRecord { frame, data })
    }
}
