//! Event types broadcast to observers of a recording session.
//!
//! All types serialize to camelCase JSON with lowercase enum tags, so the CLI
//! can print them as JSON lines.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Gate events
// ---------------------------------------------------------------------------

/// Recording gate state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateState {
    /// Not recording; periods accumulate in the prebuffer.
    Closed,
    /// Periods are flushed to the sink as they arrive.
    Open,
}

/// What happened at a gate transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateEventKind {
    Opened,
    Closed,
    /// Time went backwards while open; the current output was finalized and a
    /// new one started.
    Split,
    /// Periods were dropped by the producer; the prebuffer was discarded.
    Overrun,
}

/// Emitted by the trigger gate on every transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    pub kind: GateEventKind,
    /// Frame time of the period that caused the transition.
    pub time: u32,
    /// Output unit finalized by this transition, if any.
    pub output: Option<String>,
    /// Total periods dropped by the producer so far.
    pub overruns: u64,
}

// ---------------------------------------------------------------------------
// Session status
// ---------------------------------------------------------------------------

/// Lifecycle state of a `Recorder`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Created but not started.
    Idle,
    /// Capturing audio and consuming periods.
    Recording,
    /// Capture stopped; may be restarted.
    Stopped,
    /// Device or consumer failure.
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusEvent {
    pub status: SessionStatus,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}
