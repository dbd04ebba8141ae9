//! `Recorder`: top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! Recorder::new(config)
//!     └─► start()   → device open, buffer sized, consumer thread spawned, status = Recording
//!         └─► stop() → capture dropped, consumer drained and joined, status = Stopped
//! ```
//!
//! `start()`/`stop()` in the wrong state return an error rather than
//! panicking. A stopped recorder may be started again.
//!
//! ## Threading
//!
//! `cpal::Stream` is `!Send` on Windows/macOS (COM / CoreAudio thread
//! affinity). `AudioCapture` is therefore created *inside* a dedicated capture
//! thread so it never crosses a thread boundary. A sync oneshot channel
//! carries the opened format and the consumer handle, or the open error, back
//! to the `start()` caller.

pub mod feeder;
pub mod offline;

pub use feeder::PeriodFeeder;

use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::{
    audio::{self, AudioCapture, InputFormat, MAX_CALLBACK_FRAMES},
    buffering::{
        period::{period_bytes, MIN_PERIODS},
        PeriodReader, PeriodRingbuffer, RingStats, RingStatsSnapshot,
    },
    disk::{
        ChannelSpec, DiskLogger, DiskStats, DiskWriter, DiskWriterConfig, MultiWavWriter,
        WavEntrySink,
    },
    error::{Result, TrigrecError},
    events::{GateEvent, SessionStatus, SessionStatusEvent},
    notify::DataReady,
    trigger::{DiscardSink, GateConfig, GateSnapshot, TriggerGate, TriggerRunner, TriggerSink},
};

/// Broadcast channel capacity: 256 events buffered for slow consumers.
const BROADCAST_CAP: usize = 256;

/// How often the capture thread checks for a stop request.
const CAPTURE_POLL: Duration = Duration::from_millis(20);

/// Trigger parameters in sample-rate independent units. Turned into a
/// [`GateConfig`] once the device rate is known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TriggerSettings {
    /// Audio kept from before the trigger point (ms). Default: 1000.
    pub prebuffer_ms: f32,
    /// Analysis period length (ms). Default: 100.
    pub analysis_ms: f32,
    pub open_threshold: f32,
    /// Crossings per second needed to open. Default: 10.
    pub open_rate: f32,
    pub open_periods: usize,
    pub close_threshold: f32,
    /// Crossings per second at or below which the gate closes. Default: 5.
    pub close_rate: f32,
    pub close_periods: usize,
    pub trigger_channel: usize,
}

impl Default for TriggerSettings {
    fn default() -> Self {
        let gate = GateConfig::default();
        Self {
            prebuffer_ms: 1000.0,
            analysis_ms: 100.0,
            open_threshold: gate.open_threshold,
            open_rate: gate.open_rate,
            open_periods: gate.open_periods,
            close_threshold: gate.close_threshold,
            close_rate: gate.close_rate,
            close_periods: gate.close_periods,
            trigger_channel: gate.trigger_channel,
        }
    }
}

impl TriggerSettings {
    pub fn gate_config(&self, sample_rate: u32) -> GateConfig {
        GateConfig {
            open_threshold: self.open_threshold,
            open_rate: self.open_rate,
            open_periods: self.open_periods,
            close_threshold: self.close_threshold,
            close_rate: self.close_rate,
            close_periods: self.close_periods,
            trigger_channel: self.trigger_channel,
            ..GateConfig::with_timing(sample_rate, self.prebuffer_ms, self.analysis_ms)
        }
    }
}

/// What a session does with the periods it captures.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordMode {
    /// Every period is written to numbered entry directories under
    /// `output_dir`.
    Continuous { output_dir: PathBuf },
    /// Only gated intervals are kept, one WAV file per interval named from
    /// `template`. Without a template, gate events are reported and the audio
    /// is discarded.
    Triggered {
        settings: TriggerSettings,
        template: Option<String>,
    },
}

/// Configuration for `Recorder`.
#[derive(Debug, Clone, PartialEq)]
pub struct RecorderConfig {
    pub mode: RecordMode,
    /// Expected frames per callback, used to size the buffer. Default: 1024.
    pub period_frames: usize,
    /// Buffer capacity in periods of `period_frames`. Default: 64.
    pub buffer_periods: usize,
    /// Channel names and kinds for entry metadata.
    pub channels: Vec<ChannelSpec>,
    /// Session attributes copied into every entry.
    pub attributes: BTreeMap<String, String>,
    /// Input device name; `None` selects the default device.
    pub preferred_device: Option<String>,
}

impl RecorderConfig {
    pub fn new(mode: RecordMode) -> Self {
        Self {
            mode,
            period_frames: 1024,
            buffer_periods: 64,
            channels: Vec::new(),
            attributes: BTreeMap::new(),
            preferred_device: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.period_frames == 0 {
            return Err(TrigrecError::InvalidConfig(
                "period must be at least one frame".into(),
            ));
        }
        if self.buffer_periods < MIN_PERIODS {
            return Err(TrigrecError::InvalidConfig(format!(
                "buffer must hold at least {MIN_PERIODS} periods, got {}",
                self.buffer_periods
            )));
        }
        match &self.mode {
            RecordMode::Continuous { output_dir } if output_dir.as_os_str().is_empty() => Err(
                TrigrecError::InvalidConfig("output directory is empty".into()),
            ),
            RecordMode::Triggered { settings, .. } => settings.gate_config(48_000).validate(),
            _ => Ok(()),
        }
    }

    /// Buffer size in bytes for a stream with `channels` channels. A
    /// triggered session also needs room for the periods the gate holds back
    /// as prebuffer.
    pub fn buffer_bytes(&self, channels: usize, sample_rate: u32) -> usize {
        let mut periods = self.buffer_periods;
        if let RecordMode::Triggered { settings, .. } = &self.mode {
            let held = settings.gate_config(sample_rate).prebuffer_frames as usize;
            periods += held.div_ceil(self.period_frames) + 1;
        }
        period_bytes(self.period_frames, channels.max(1)) * periods
    }
}

/// The consumer side of a session, running on its own thread.
pub enum Consumer {
    Disk(DiskWriter<WavEntrySink>),
    Trigger(TriggerRunner<Box<dyn TriggerSink>>),
}

impl Consumer {
    /// Build the sink for `mode` and start consuming `reader`. Gate events
    /// go out on `gate_events`.
    pub fn start(
        config: &RecorderConfig,
        reader: PeriodReader,
        sample_rate: u32,
        gate_events: broadcast::Sender<GateEvent>,
    ) -> Result<Self> {
        match &config.mode {
            RecordMode::Continuous { output_dir } => {
                let sink = WavEntrySink::create(output_dir)?;
                let disk_config = DiskWriterConfig {
                    sample_rate,
                    channels: config.channels.clone(),
                    attributes: config.attributes.clone(),
                    ..Default::default()
                };
                Ok(Self::Disk(DiskWriter::start(reader, sink, disk_config)?))
            }
            RecordMode::Triggered { settings, template } => {
                let sink: Box<dyn TriggerSink> = match template {
                    Some(template) => Box::new(MultiWavWriter::new(template.clone(), sample_rate)?),
                    None => Box::new(DiscardSink::new()),
                };
                let gate = TriggerGate::new(settings.gate_config(sample_rate), sink)?
                    .with_event_sender(gate_events);
                Ok(Self::Trigger(TriggerRunner::start(gate, reader, DataReady::new())?))
            }
        }
    }

    /// Handle the producer uses to wake the consumer.
    pub fn notifier(&self) -> DataReady {
        match self {
            Self::Disk(disk) => disk.notifier(),
            Self::Trigger(runner) => runner.notifier(),
        }
    }

    /// Log handle, for continuous sessions.
    pub fn logger(&self) -> Option<DiskLogger> {
        match self {
            Self::Disk(disk) => Some(disk.logger()),
            Self::Trigger(_) => None,
        }
    }

    fn snapshot(&self, summary: &mut SessionSummary) {
        match self {
            Self::Disk(disk) => summary.disk = Some(disk.stats()),
            Self::Trigger(runner) => summary.gate = Some(runner.diagnostics()),
        }
    }

    /// Stop the consumer after it drains the buffer.
    fn finish(self, summary: &mut SessionSummary) -> Result<()> {
        match self {
            Self::Disk(disk) => summary.disk = Some(disk.join()?),
            Self::Trigger(runner) => {
                let diagnostics = runner.diagnostics_handle();
                runner.join()?;
                summary.gate = Some(diagnostics.snapshot());
            }
        }
        Ok(())
    }
}

/// Counters of a session, live or finished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub ring: RingStatsSnapshot,
    pub disk: Option<DiskStats>,
    pub gate: Option<GateSnapshot>,
}

struct Session {
    format: InputFormat,
    consumer: Consumer,
    ring: Arc<RingStats>,
    capture: JoinHandle<()>,
}

/// The top-level recorder handle.
///
/// `Recorder` is `Send + Sync`; all fields use interior mutability. Wrap in
/// `Arc<Recorder>` to share it with signal handlers or event forwarders.
pub struct Recorder {
    config: RecorderConfig,
    /// `true` while capture is active.
    running: Arc<AtomicBool>,
    status: Arc<Mutex<SessionStatus>>,
    status_tx: broadcast::Sender<SessionStatusEvent>,
    gate_tx: broadcast::Sender<GateEvent>,
    session: Mutex<Option<Session>>,
}

impl Recorder {
    /// Create a recorder. Does not open any device; call `start()`.
    pub fn new(config: RecorderConfig) -> Result<Self> {
        config.validate()?;
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (gate_tx, _) = broadcast::channel(BROADCAST_CAP);
        Ok(Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            status: Arc::new(Mutex::new(SessionStatus::Idle)),
            status_tx,
            gate_tx,
            session: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    /// Open the input device and start recording.
    ///
    /// Blocks until the device is confirmed open (or fails), then returns
    /// the stream format.
    ///
    /// # Errors
    /// - `TrigrecError::AlreadyRunning` if already started.
    /// - `TrigrecError::NoDefaultInputDevice` / `TrigrecError::AudioStream` on
    ///   device error.
    pub fn start(&self) -> Result<InputFormat> {
        let mut session = self.session.lock();
        if session.is_some() || self.running.load(Ordering::SeqCst) {
            return Err(TrigrecError::AlreadyRunning);
        }
        self.running.store(true, Ordering::SeqCst);

        let config = self.config.clone();
        let running = Arc::clone(&self.running);
        let gate_tx = self.gate_tx.clone();

        // Sync oneshot: capture thread reports open success/failure to start().
        let (open_tx, open_rx) =
            std::sync::mpsc::channel::<Result<(InputFormat, Consumer, Arc<RingStats>)>>();

        let spawned = std::thread::Builder::new()
            .name("trigrec-capture".into())
            .spawn(move || {
                // ── Open audio device (must happen on THIS thread, cpal::Stream is !Send) ──
                let opened = open_session(&config, Arc::clone(&running), gate_tx);
                let capture = match opened {
                    Ok((capture, consumer, ring)) => {
                        let _ = open_tx.send(Ok((capture.format, consumer, ring)));
                        capture
                    }
                    Err(e) => {
                        let _ = open_tx.send(Err(e));
                        running.store(false, Ordering::SeqCst);
                        return;
                    }
                };

                while running.load(Ordering::Acquire) {
                    std::thread::park_timeout(CAPTURE_POLL);
                }

                // Stream drops here, releasing the audio device on this thread.
                capture.stop();
                drop(capture);
            })
            .map_err(|e| TrigrecError::Thread(e.to_string()));
        let capture = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                self.set_status(SessionStatus::Error, Some(e.to_string()));
                return Err(e);
            }
        };

        // Block start() until device open is confirmed.
        match open_rx.recv() {
            Ok(Ok((format, consumer, ring))) => {
                info!(
                    sample_rate = format.sample_rate,
                    channels = format.channels,
                    "recorder started"
                );
                *session = Some(Session {
                    format,
                    consumer,
                    ring,
                    capture,
                });
                self.set_status(SessionStatus::Recording, None);
                Ok(format)
            }
            Ok(Err(e)) => {
                let _ = capture.join();
                self.running.store(false, Ordering::SeqCst);
                self.set_status(SessionStatus::Error, Some(e.to_string()));
                Err(e)
            }
            Err(_) => {
                // Channel closed before a message was sent: capture thread panicked?
                let _ = capture.join();
                self.running.store(false, Ordering::SeqCst);
                self.set_status(SessionStatus::Error, Some("capture failed to start".into()));
                Err(TrigrecError::Other(anyhow::anyhow!(
                    "capture thread died unexpectedly"
                )))
            }
        }
    }

    /// Stop capture, drain the buffer through the consumer and wait for it.
    ///
    /// # Errors
    /// - `TrigrecError::NotRunning` if not currently recording.
    pub fn stop(&self) -> Result<SessionSummary> {
        let Some(session) = self.session.lock().take() else {
            return Err(TrigrecError::NotRunning);
        };
        info!("recorder stop requested");

        self.running.store(false, Ordering::SeqCst);
        session.capture.thread().unpark();
        if session.capture.join().is_err() {
            error!("capture thread panicked");
        }

        let mut summary = SessionSummary::default();
        let finished = session.consumer.finish(&mut summary);
        summary.ring = session.ring.snapshot();
        match finished {
            Ok(()) => {
                self.set_status(SessionStatus::Stopped, None);
                info!(?summary, "recorder stopped");
                Ok(summary)
            }
            Err(e) => {
                self.set_status(SessionStatus::Error, Some(e.to_string()));
                Err(e)
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Current session status (snapshot).
    pub fn status(&self) -> SessionStatus {
        *self.status.lock()
    }

    /// Format of the running session, if any.
    pub fn format(&self) -> Option<InputFormat> {
        self.session.lock().as_ref().map(|s| s.format)
    }

    /// Subscribe to live status change events.
    pub fn subscribe_status(&self) -> broadcast::Receiver<SessionStatusEvent> {
        self.status_tx.subscribe()
    }

    /// Subscribe to gate transitions of triggered sessions.
    pub fn subscribe_gate(&self) -> broadcast::Receiver<GateEvent> {
        self.gate_tx.subscribe()
    }

    /// Log handle of a running continuous session.
    pub fn logger(&self) -> Option<DiskLogger> {
        self.session.lock().as_ref().and_then(|s| s.consumer.logger())
    }

    /// Live counters of the running session.
    pub fn diagnostics(&self) -> Option<SessionSummary> {
        let session = self.session.lock();
        let session = session.as_ref()?;
        let mut summary = SessionSummary {
            ring: session.ring.snapshot(),
            ..Default::default()
        };
        session.consumer.snapshot(&mut summary);
        Some(summary)
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    fn set_status(&self, new_status: SessionStatus, detail: Option<String>) {
        *self.status.lock() = new_status;
        let _ = self.status_tx.send(SessionStatusEvent {
            status: new_status,
            detail,
        });
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if self.session.get_mut().is_some() {
            let _ = self.stop();
        }
    }
}

/// Select the device, size the buffer for its channel count, start the
/// consumer and open the stream. Runs on the capture thread.
fn open_session(
    config: &RecorderConfig,
    running: Arc<AtomicBool>,
    gate_events: broadcast::Sender<GateEvent>,
) -> Result<(AudioCapture, Consumer, Arc<RingStats>)> {
    let input = audio::select_input(config.preferred_device.as_deref())?;
    let format = input.format;
    let capacity = config.buffer_bytes(usize::from(format.channels), format.sample_rate);
    let (writer, reader) = PeriodRingbuffer::new(capacity)?.split();
    let ring = reader.stats_handle();
    let consumer = Consumer::start(config, reader, format.sample_rate, gate_events)?;
    let feeder = PeriodFeeder::new(writer, consumer.notifier(), MAX_CALLBACK_FRAMES);
    let capture = AudioCapture::open(input, feeder, running)?;
    Ok((capture, consumer, ring))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_settings_follow_device_rate() {
        let settings = TriggerSettings::default();
        let gate = settings.gate_config(44_100);
        assert_eq!(gate.sample_rate, 44_100);
        assert_eq!(gate.prebuffer_frames, 44_100);
        assert_eq!(gate.analysis_frames, 4_410);
        assert_eq!(gate.open_count(), 10);
        assert_eq!(gate.close_count(), 5);
    }

    #[test]
    fn trigger_settings_fill_missing_json_fields() {
        let settings: TriggerSettings =
            serde_json::from_str(r#"{"openRate": 20.0, "prebufferMs": 250.0}"#)
                .expect("deserialize settings");
        assert_eq!(settings.open_rate, 20.0);
        assert_eq!(settings.prebuffer_ms, 250.0);
        assert_eq!(settings.close_periods, TriggerSettings::default().close_periods);
    }

    #[test]
    fn config_validation() {
        let mut config = RecorderConfig::new(RecordMode::Continuous {
            output_dir: PathBuf::from("rec"),
        });
        assert!(config.validate().is_ok());
        assert_eq!(config.buffer_bytes(2, 48_000), period_bytes(1024, 2) * 64);

        config.buffer_periods = 2;
        assert!(config.validate().is_err());

        let mut triggered = RecorderConfig::new(RecordMode::Triggered {
            settings: TriggerSettings {
                open_periods: 0,
                ..Default::default()
            },
            template: None,
        });
        assert!(triggered.validate().is_err());
        triggered.mode = RecordMode::Continuous {
            output_dir: PathBuf::new(),
        };
        assert!(triggered.validate().is_err());
    }

    #[test]
    fn triggered_buffer_includes_prebuffer() {
        let config = RecorderConfig::new(RecordMode::Triggered {
            settings: TriggerSettings::default(),
            template: None,
        });
        // One second of prebuffer at 8 kHz is 8 periods of 1024 frames, plus
        // the period being analyzed.
        assert_eq!(config.buffer_bytes(1, 8000), period_bytes(1024, 1) * (64 + 8 + 1));
    }

    #[test]
    fn consumer_start_builds_triggered_session() {
        let (mut writer, reader) = PeriodRingbuffer::new(8192).expect("buffer").split();
        let config = RecorderConfig::new(RecordMode::Triggered {
            settings: TriggerSettings::default(),
            template: None,
        });
        let (gate_tx, _) = broadcast::channel(8);
        let consumer = Consumer::start(&config, reader, 8000, gate_tx).expect("consumer");
        assert!(consumer.logger().is_none());

        writer.write_period(0, 16, &[&[0.0; 16]]);
        consumer.notifier().notify();
        let mut summary = SessionSummary::default();
        consumer.finish(&mut summary).expect("finish");
        assert_eq!(summary.gate.map(|g| g.opens), Some(0));
    }

    #[test]
    fn consumer_start_builds_continuous_session() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut writer, reader) = PeriodRingbuffer::new(8192).expect("buffer").split();
        let config = RecorderConfig::new(RecordMode::Continuous {
            output_dir: dir.path().to_path_buf(),
        });
        let (gate_tx, _) = broadcast::channel(8);
        let consumer = Consumer::start(&config, reader, 8000, gate_tx).expect("consumer");
        assert!(consumer.logger().is_some());

        writer.write_period(0, 16, &[&[0.25; 16]]);
        consumer.notifier().notify();
        let mut summary = SessionSummary::default();
        consumer.finish(&mut summary).expect("finish");
        assert_eq!(summary.disk.map(|d| d.periods), Some(1));
        assert!(dir.path().join("entry_000000").join("00_ch0.wav").exists());
    }

    #[test]
    fn stop_without_start_is_an_error() {
        let recorder = Recorder::new(RecorderConfig::new(RecordMode::Triggered {
            settings: TriggerSettings::default(),
            template: None,
        }))
        .expect("recorder");
        assert_eq!(recorder.status(), SessionStatus::Idle);
        assert!(matches!(recorder.stop(), Err(TrigrecError::NotRunning)));
        assert!(recorder.diagnostics().is_none());
    }
}
