//! Trigger gate / prebuffer controller.
//!
//! ## Algorithm
//!
//! Periods are inspected with `peek_ahead`, so nothing is consumed until the
//! gate decides what to do with it.
//!
//! - **CLOSED**: crossings on the trigger channel are accumulated into analysis
//!   periods and pushed into the open counter. Periods stay in the buffer as
//!   the prebuffer; the oldest are released (unwritten) once the prebuffer
//!   exceeds its configured length. When the open counter reaches its count
//!   threshold the gate opens and every prebuffered period, oldest first, is
//!   written to the sink and released.
//! - **OPEN**: each period is written and released as it arrives. When a full
//!   close window sums to at most the close count threshold, the sink is
//!   flushed and the gate closes.
//!
//! Both counters and both detectors are reset on every transition.
//!
//! Count thresholds are derived from crossing rates (per second):
//! `ceil(rate × analysis_frames × periods / sample_rate)`.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{
    counter::WindowCounter, crossing::ThresholdCrossings, sink::TriggerSink, CrossingDetector,
};
use crate::{
    buffering::{Period, PeriodReader},
    error::{Result, TrigrecError},
    events::{GateEvent, GateEventKind, GateState},
    Sample,
};

/// Broadcast channel capacity for gate events.
const EVENT_CAP: usize = 256;

/// Configuration for [`TriggerGate`].
#[derive(Debug, Clone, PartialEq)]
pub struct GateConfig {
    /// Sample rate of the incoming periods (Hz). Default: 48000.
    pub sample_rate: u32,
    /// Audio retained before the trigger point (frames). Default: 1 s.
    pub prebuffer_frames: u32,
    /// Length of one analysis period (frames). Default: 100 ms.
    pub analysis_frames: u32,
    /// Amplitude an excursion must reach to count as an open crossing.
    pub open_threshold: Sample,
    /// Crossings per second needed to open. Default: 10.
    pub open_rate: f32,
    /// Analysis periods in the open window. Default: 10.
    pub open_periods: usize,
    /// Amplitude an excursion must reach to count as a close crossing.
    pub close_threshold: Sample,
    /// Crossing rate per second at or below which the gate closes. Default: 5.
    pub close_rate: f32,
    /// Analysis periods in the close window. Default: 10.
    pub close_periods: usize,
    /// Index of the channel the detectors listen to.
    pub trigger_channel: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self::with_timing(48_000, 1000.0, 100.0)
    }
}

impl GateConfig {
    /// Default thresholds with prebuffer and analysis period given in
    /// milliseconds.
    pub fn with_timing(sample_rate: u32, prebuffer_ms: f32, analysis_ms: f32) -> Self {
        Self {
            sample_rate,
            prebuffer_frames: ms_to_frames(sample_rate, prebuffer_ms),
            analysis_frames: ms_to_frames(sample_rate, analysis_ms),
            open_threshold: 0.2,
            open_rate: 10.0,
            open_periods: 10,
            close_threshold: 0.2,
            close_rate: 5.0,
            close_periods: 10,
            trigger_channel: 0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(TrigrecError::InvalidConfig("sample rate must be non-zero".into()));
        }
        if self.analysis_frames == 0 {
            return Err(TrigrecError::InvalidConfig(
                "analysis period must be at least one frame".into(),
            ));
        }
        if self.open_periods == 0 || self.close_periods == 0 {
            return Err(TrigrecError::InvalidConfig(
                "open and close windows must span at least one period".into(),
            ));
        }
        for (name, rate) in [("open", self.open_rate), ("close", self.close_rate)] {
            if !rate.is_finite() || rate < 0.0 {
                return Err(TrigrecError::InvalidConfig(format!(
                    "{name} crossing rate must be a non-negative number, got {rate}"
                )));
            }
        }
        for (name, thresh) in [("open", self.open_threshold), ("close", self.close_threshold)] {
            if !thresh.is_finite() || thresh <= 0.0 {
                return Err(TrigrecError::InvalidConfig(format!(
                    "{name} amplitude threshold must be positive, got {thresh}"
                )));
            }
        }
        Ok(())
    }

    /// Window sum at which the gate opens. Never below one, so that silence
    /// cannot open the gate.
    pub fn open_count(&self) -> i64 {
        self.count_threshold(self.open_rate, self.open_periods).max(1)
    }

    /// Window sum at or below which the gate closes.
    pub fn close_count(&self) -> i64 {
        self.count_threshold(self.close_rate, self.close_periods)
    }

    fn count_threshold(&self, rate: f32, periods: usize) -> i64 {
        let crossings = f64::from(rate) * f64::from(self.analysis_frames) * periods as f64
            / f64::from(self.sample_rate);
        crossings.ceil() as i64
    }
}

pub fn ms_to_frames(sample_rate: u32, ms: f32) -> u32 {
    (f64::from(ms) * f64::from(sample_rate) / 1000.0).round() as u32
}

/// Gate counters, readable from any thread.
#[derive(Debug, Default)]
pub struct GateDiagnostics {
    pub periods_seen: AtomicU64,
    pub periods_written: AtomicU64,
    /// Prebuffered periods released without being written.
    pub periods_discarded: AtomicU64,
    pub opens: AtomicU64,
    pub closes: AtomicU64,
    pub splits: AtomicU64,
    pub overruns: AtomicU64,
    pub sink_errors: AtomicU64,
}

impl GateDiagnostics {
    pub fn snapshot(&self) -> GateSnapshot {
        GateSnapshot {
            periods_seen: self.periods_seen.load(Ordering::Relaxed),
            periods_written: self.periods_written.load(Ordering::Relaxed),
            periods_discarded: self.periods_discarded.load(Ordering::Relaxed),
            opens: self.opens.load(Ordering::Relaxed),
            closes: self.closes.load(Ordering::Relaxed),
            splits: self.splits.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
            sink_errors: self.sink_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GateSnapshot {
    pub periods_seen: u64,
    pub periods_written: u64,
    pub periods_discarded: u64,
    pub opens: u64,
    pub closes: u64,
    pub splits: u64,
    pub overruns: u64,
    pub sink_errors: u64,
}

pub struct TriggerGate<S> {
    config: GateConfig,
    sink: S,
    state: GateState,
    open_detector: Box<dyn CrossingDetector>,
    close_detector: Box<dyn CrossingDetector>,
    open_counter: WindowCounter,
    close_counter: WindowCounter,
    open_count: i64,
    close_count: i64,
    /// Crossings and frames gathered toward the current analysis period.
    pending_crossings: i64,
    pending_frames: u32,
    /// Frames between the read cursor and the read-ahead cursor.
    prebuffered_frames: u64,
    last_time: Option<u32>,
    seen_overruns: u64,
    /// Copy of the trigger channel; grows to the largest period seen.
    scratch: Vec<Sample>,
    events: broadcast::Sender<GateEvent>,
    seq: u64,
    diagnostics: Arc<GateDiagnostics>,
}

impl<S: TriggerSink> TriggerGate<S> {
    /// Gate using [`ThresholdCrossings`] detectors at the configured
    /// amplitude thresholds.
    pub fn new(config: GateConfig, sink: S) -> Result<Self> {
        let open = Box::new(ThresholdCrossings::new(config.open_threshold));
        let close = Box::new(ThresholdCrossings::new(config.close_threshold));
        Self::with_detectors(config, sink, open, close)
    }

    pub fn with_detectors(
        config: GateConfig,
        sink: S,
        open_detector: Box<dyn CrossingDetector>,
        close_detector: Box<dyn CrossingDetector>,
    ) -> Result<Self> {
        config.validate()?;
        let open_count = config.open_count();
        let close_count = config.close_count();
        info!(
            open_count,
            close_count,
            prebuffer_frames = config.prebuffer_frames,
            analysis_frames = config.analysis_frames,
            "trigger gate configured"
        );
        let (events, _) = broadcast::channel(EVENT_CAP);
        Ok(Self {
            open_counter: WindowCounter::new(config.open_periods),
            close_counter: WindowCounter::new(config.close_periods),
            config,
            sink,
            state: GateState::Closed,
            open_detector,
            close_detector,
            open_count,
            close_count,
            pending_crossings: 0,
            pending_frames: 0,
            prebuffered_frames: 0,
            last_time: None,
            seen_overruns: 0,
            scratch: Vec::new(),
            events,
            seq: 0,
            diagnostics: Arc::new(GateDiagnostics::default()),
        })
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GateEvent> {
        self.events.subscribe()
    }

    pub fn event_sender(&self) -> broadcast::Sender<GateEvent> {
        self.events.clone()
    }

    /// Publish events on an existing channel instead of the gate's own.
    pub fn with_event_sender(mut self, events: broadcast::Sender<GateEvent>) -> Self {
        self.events = events;
        self
    }

    pub fn diagnostics(&self) -> Arc<GateDiagnostics> {
        Arc::clone(&self.diagnostics)
    }

    pub fn open_counter(&self) -> &WindowCounter {
        &self.open_counter
    }

    pub fn close_counter(&self) -> &WindowCounter {
        &self.close_counter
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Handle every complete period currently available. Returns the number
    /// of periods inspected.
    pub fn process(&mut self, reader: &mut PeriodReader) -> usize {
        let mut processed = 0;
        loop {
            self.check_overrun(reader);
            let Some(period) = reader.peek_ahead() else {
                break;
            };
            let header = period.header();
            let backwards = self.last_time.is_some_and(|last| header.time < last);
            processed += 1;
            self.diagnostics.periods_seen.fetch_add(1, Ordering::Relaxed);

            match self.state {
                GateState::Closed => {
                    let crossings = self.analyze(&period);
                    if backwards {
                        self.restart_prebuffer(reader, header.total_len());
                    }
                    self.last_time = Some(header.time);
                    self.prebuffered_frames += u64::from(header.nframes);

                    let opened = self
                        .accumulate(crossings, header.nframes)
                        .is_some_and(|count| self.open_counter.push(count, self.open_count));
                    if opened {
                        self.open(reader, header.time);
                    } else {
                        self.trim_prebuffer(reader);
                    }
                }
                GateState::Open => {
                    if backwards {
                        self.split(header.time);
                    }
                    let crossings = self.analyze(&period);
                    self.write(&period);
                    reader.release();
                    self.last_time = Some(header.time);

                    let closing = self.accumulate(crossings, header.nframes).is_some_and(|count| {
                        self.close_counter.push(count, -self.close_count)
                            && self.close_counter.is_full()
                    });
                    if closing {
                        self.close(header.time);
                    }
                }
            }
        }
        processed
    }

    /// Drain what is left and close any open output unit. Returns the name of
    /// the unit finalized, if any.
    pub fn finish(&mut self, reader: &mut PeriodReader) -> Option<String> {
        self.process(reader);
        if self.state == GateState::Open {
            let time = self.last_time.unwrap_or(0);
            self.close(time)
        } else {
            None
        }
    }

    fn analyze(&mut self, period: &Period<'_>) -> u32 {
        let Some(channel) = period.channel(self.config.trigger_channel) else {
            debug!(
                channels = period.nchannels(),
                trigger_channel = self.config.trigger_channel,
                "period has no trigger channel"
            );
            return 0;
        };
        let len = channel.sample_count();
        if self.scratch.len() < len {
            self.scratch.resize(len, 0.0);
        }
        let n = channel.copy_to(&mut self.scratch[..len]);
        let detector = match self.state {
            GateState::Closed => &mut self.open_detector,
            GateState::Open => &mut self.close_detector,
        };
        detector.count(&self.scratch[..n])
    }

    /// Fold one period into the current analysis period; yields the crossing
    /// count once the analysis period is complete.
    fn accumulate(&mut self, crossings: u32, nframes: u32) -> Option<i64> {
        self.pending_crossings += i64::from(crossings);
        self.pending_frames = self.pending_frames.saturating_add(nframes);
        if self.pending_frames < self.config.analysis_frames {
            return None;
        }
        let count = self.pending_crossings;
        self.pending_crossings = 0;
        self.pending_frames = 0;
        Some(count)
    }

    fn open(&mut self, reader: &mut PeriodReader, time: u32) {
        self.state = GateState::Open;
        self.reset_analysis();
        self.diagnostics.opens.fetch_add(1, Ordering::Relaxed);

        let mut flushed = 0usize;
        while reader.read_ahead_bytes() > 0 {
            let Some(period) = reader.peek() else {
                break;
            };
            self.write(&period);
            reader.release();
            flushed += 1;
        }
        self.prebuffered_frames = 0;
        info!(time, prebuffered_periods = flushed, "gate opened");
        self.emit(GateEventKind::Opened, time, None);
    }

    fn close(&mut self, time: u32) -> Option<String> {
        let output = self.flush_sink();
        self.state = GateState::Closed;
        self.reset_analysis();
        self.diagnostics.closes.fetch_add(1, Ordering::Relaxed);
        info!(time, output = output.as_deref().unwrap_or("-"), "gate closed");
        self.emit(GateEventKind::Closed, time, output.clone());
        output
    }

    fn split(&mut self, time: u32) {
        let output = self.flush_sink();
        self.diagnostics.splits.fetch_add(1, Ordering::Relaxed);
        info!(time, output = output.as_deref().unwrap_or("-"), "time reset, starting new output");
        self.emit(GateEventKind::Split, time, output);
    }

    /// Release the oldest prebuffered periods beyond the prebuffer length.
    fn trim_prebuffer(&mut self, reader: &mut PeriodReader) {
        let limit = u64::from(self.config.prebuffer_frames);
        while self.prebuffered_frames > limit && reader.read_ahead_bytes() > 0 {
            let header = reader.release();
            self.prebuffered_frames = self
                .prebuffered_frames
                .saturating_sub(u64::from(header.nframes));
            self.diagnostics
                .periods_discarded
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Time went backwards while closed: the prebuffer belongs to another
    /// timeline. Keep only the period just peeked (`current_len` bytes).
    fn restart_prebuffer(&mut self, reader: &mut PeriodReader, current_len: usize) {
        while reader.read_ahead_bytes() > current_len {
            reader.release();
            self.diagnostics
                .periods_discarded
                .fetch_add(1, Ordering::Relaxed);
        }
        self.prebuffered_frames = 0;
        self.open_counter.reset();
        self.pending_crossings = 0;
        self.pending_frames = 0;
        debug!("time reset while closed, prebuffer restarted");
    }

    fn check_overrun(&mut self, reader: &mut PeriodReader) {
        let overruns = reader.overruns();
        if overruns == self.seen_overruns {
            return;
        }
        let dropped = overruns - self.seen_overruns;
        self.seen_overruns = overruns;
        let released = reader.release_all();
        warn!(dropped, released, "producer overrun, buffered periods discarded");

        let output = if self.state == GateState::Open {
            self.diagnostics.closes.fetch_add(1, Ordering::Relaxed);
            self.flush_sink()
        } else {
            None
        };
        self.state = GateState::Closed;
        self.reset_analysis();
        self.prebuffered_frames = 0;
        self.diagnostics.overruns.fetch_add(1, Ordering::Relaxed);
        let time = self.last_time.take().unwrap_or(0);
        self.emit(GateEventKind::Overrun, time, output);
    }

    fn write(&mut self, period: &Period<'_>) {
        match self.sink.write(period) {
            Ok(()) => {
                self.diagnostics
                    .periods_written
                    .fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.diagnostics.sink_errors.fetch_add(1, Ordering::Relaxed);
                warn!(time = period.time(), error = %e, "sink write failed, period lost");
            }
        }
    }

    fn flush_sink(&mut self) -> Option<String> {
        match self.sink.flush() {
            Ok(output) => output,
            Err(e) => {
                self.diagnostics.sink_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "sink flush failed");
                None
            }
        }
    }

    fn reset_analysis(&mut self) {
        self.open_counter.reset();
        self.close_counter.reset();
        self.open_detector.reset();
        self.close_detector.reset();
        self.pending_crossings = 0;
        self.pending_frames = 0;
    }

    fn emit(&mut self, kind: GateEventKind, time: u32, output: Option<String>) {
        self.seq += 1;
        // No subscribers is fine.
        let _ = self.events.send(GateEvent {
            seq: self.seq,
            kind,
            time,
            output,
            overruns: self.seen_overruns,
        });
    }
}
