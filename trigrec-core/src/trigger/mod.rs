//! Triggered recording.
//!
//! The [`CrossingDetector`] trait is the extensibility point for the per-period
//! feature fed to the gate's window counters; [`ThresholdCrossings`] is the
//! default. [`TriggerGate`] consumes periods through read-ahead access to the
//! period buffer and hands them to a [`TriggerSink`] while open.

pub mod counter;
pub mod crossing;
pub mod gate;
pub mod runner;
pub mod sink;

pub use counter::WindowCounter;
pub use crossing::ThresholdCrossings;
pub use gate::{GateConfig, GateDiagnostics, GateSnapshot, TriggerGate};
pub use runner::TriggerRunner;
pub use sink::{DiscardSink, TriggerSink};

use crate::Sample;

/// Per-period feature extractor feeding the gate's window counters.
///
/// Implementors may carry state across periods (e.g. the level of the last
/// sample seen).
pub trait CrossingDetector: Send + 'static {
    /// Number of events (e.g. threshold crossings) in `samples`.
    fn count(&mut self, samples: &[Sample]) -> u32;

    /// Forget state carried over from previous periods.
    fn reset(&mut self);
}
