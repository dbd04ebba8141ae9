//! Downstream output for periods passed through an open gate.

use tracing::debug;

use crate::{buffering::Period, error::Result};

/// Receives periods in arrival order while the gate is open.
pub trait TriggerSink: Send + 'static {
    /// Append one period to the current output unit, opening one if needed.
    fn write(&mut self, period: &Period<'_>) -> Result<()>;

    /// Finalize the current output unit and return its name. `Ok(None)` when
    /// nothing was written since the last flush.
    fn flush(&mut self) -> Result<Option<String>>;
}

impl<T: TriggerSink + ?Sized> TriggerSink for Box<T> {
    fn write(&mut self, period: &Period<'_>) -> Result<()> {
        (**self).write(period)
    }

    fn flush(&mut self) -> Result<Option<String>> {
        (**self).flush()
    }
}

/// Sink that keeps nothing. Gate events are still emitted, so a session
/// without an output template only logs its transitions.
#[derive(Debug, Default)]
pub struct DiscardSink {
    frames: u64,
}

impl DiscardSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TriggerSink for DiscardSink {
    fn write(&mut self, period: &Period<'_>) -> Result<()> {
        self.frames += u64::from(period.nframes());
        Ok(())
    }

    fn flush(&mut self) -> Result<Option<String>> {
        if self.frames > 0 {
            debug!(frames = self.frames, "discarded gated frames");
        }
        self.frames = 0;
        Ok(None)
    }
}
