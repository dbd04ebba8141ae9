//! # trigrec-core
//!
//! Real-time audio recording engine: a lock-free period buffer between the
//! audio callback and a consumer thread, a crossing-rate trigger gate with a
//! prebuffer, and a disk writer.
//!
//! ## Architecture
//!
//! ```text
//! Input device → AudioCapture → PeriodFeeder ─► PeriodRingbuffer (SPSC bytes)
//!                                   │                    │
//!                               DataReady::notify   PeriodReader
//!                                   │                    │
//!                                   └──► consumer thread ┤
//!                                                        ├─► DiskWriter → EntrySink (entries on disk)
//!                                                        └─► TriggerGate → TriggerSink (one file per trigger)
//!                                                                 │
//!                                                    broadcast::Sender<GateEvent>
//! ```
//!
//! The producer side never allocates, locks or performs I/O. Periods become
//! visible to the reader only once every channel has been written.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod disk;
pub mod engine;
pub mod error;
pub mod events;
pub mod notify;
pub mod trigger;

/// One audio sample as carried by the period buffer.
pub type Sample = f32;

/// Size of one [`Sample`] in bytes.
pub const SAMPLE_BYTES: usize = std::mem::size_of::<Sample>();

// Convenience re-exports for downstream crates
pub use buffering::{Period, PeriodHeader, PeriodReader, PeriodRingbuffer, PeriodWriter};
pub use disk::{DiskWriter, DiskWriterConfig, EntryWriter, MultiWavWriter, WavEntrySink};
pub use engine::{PeriodFeeder, RecordMode, Recorder, RecorderConfig, TriggerSettings};
pub use error::TrigrecError;
pub use events::{GateEvent, GateEventKind, GateState, SessionStatus, SessionStatusEvent};
pub use notify::DataReady;
pub use trigger::{GateConfig, TriggerGate, TriggerRunner, WindowCounter};
