//! Continuous recording to disk.
//!
//! [`DiskWriter`] owns a consumer thread that drains a [`PeriodReader`] with
//! `request`/`pop`/`release` and hands every channel to an [`EntrySink`]. The
//! sink and the writer's bookkeeping live behind one mutex, which is also the
//! mutex the thread sleeps on while waiting for the producer's
//! [`DataReady`] signal. The ring buffer itself is never locked.
//!
//! Recordings are split into entries. A new entry begins with the first
//! period, whenever the frame clock goes backwards or skips ahead (the
//! producer dropped periods), and whenever the channel count changes.
//! Overruns counted by the ring buffer are only logged; the entry boundary
//! follows the frame clock so it lands exactly at the gap.
//!
//! Log messages may come from any thread, including the audio callback; they
//! are queued on a bounded channel without blocking and written by the disk
//! thread.

pub mod multi;
pub mod wav;

pub use multi::MultiWavWriter;
pub use wav::{EventLine, WavEntrySink};

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::{
    buffering::{Channel, PeriodHeader, PeriodReader},
    error::{Result, TrigrecError},
    notify::{DataReady, WAKE_TIMEOUT},
};

/// Pending log records beyond this are dropped rather than blocking.
const DEFAULT_LOG_QUEUE: usize = 1024;

/// What a channel carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// Sampled audio, one sample per frame.
    Audio,
    /// Timestamped event records.
    Events,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSpec {
    pub name: String,
    pub kind: ChannelKind,
}

impl ChannelSpec {
    pub fn audio(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ChannelKind::Audio,
        }
    }

    pub fn events(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ChannelKind::Events,
        }
    }
}

/// Configuration for [`DiskWriter`].
#[derive(Debug, Clone)]
pub struct DiskWriterConfig {
    pub sample_rate: u32,
    /// Channel names and kinds, in push order. Periods with more channels than
    /// listed get audio channels named `ch<N>` for the rest.
    pub channels: Vec<ChannelSpec>,
    /// Session attributes copied into every entry.
    pub attributes: BTreeMap<String, String>,
    /// Capacity of the log queue.
    pub log_queue: usize,
}

impl Default for DiskWriterConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: Vec::new(),
            attributes: BTreeMap::new(),
            log_queue: DEFAULT_LOG_QUEUE,
        }
    }
}

impl DiskWriterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(TrigrecError::InvalidConfig("sample rate must be non-zero".into()));
        }
        if self.log_queue == 0 {
            return Err(TrigrecError::InvalidConfig("log queue must hold at least one record".into()));
        }
        Ok(())
    }

    /// Channel layout for a period with `nchannels` channels.
    pub fn channels_for(&self, nchannels: usize) -> Vec<ChannelSpec> {
        (0..nchannels)
            .map(|i| {
                self.channels
                    .get(i)
                    .cloned()
                    .unwrap_or_else(|| ChannelSpec::audio(format!("ch{i}")))
            })
            .collect()
    }
}

/// Metadata handed to [`EntrySink::begin_entry`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryStart<'a> {
    pub index: u64,
    /// Frame time of the entry's first period.
    pub start_frame: u32,
    pub wall_clock: DateTime<Utc>,
    pub sample_rate: u32,
    pub channels: &'a [ChannelSpec],
    pub attributes: &'a BTreeMap<String, String>,
}

/// A timestamped log message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub sec: i64,
    pub usec: i64,
    pub message: String,
}

impl LogRecord {
    pub fn now(message: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            sec: now.timestamp(),
            usec: i64::from(now.timestamp_subsec_micros()),
            message: message.into(),
        }
    }
}

/// File-format layer underneath [`DiskWriter`].
pub trait EntrySink: Send + 'static {
    /// Finish the current entry, if any, and start a new one.
    fn begin_entry(&mut self, entry: &EntryStart<'_>) -> Result<()>;

    /// Append one channel of a period. `offset` is the period's frame time
    /// relative to the start of the entry.
    fn write_channel(
        &mut self,
        index: usize,
        spec: &ChannelSpec,
        offset: u32,
        channel: Channel<'_>,
    ) -> Result<()>;

    fn log(&mut self, record: &LogRecord) -> Result<()>;

    /// Make everything written so far durable and close the current entry.
    fn flush(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskStats {
    pub entries: u64,
    pub periods: u64,
    pub frames: u64,
    /// Periods the producer dropped while this writer was running.
    pub overruns: u64,
    pub write_errors: u64,
    pub logs_written: u64,
    pub logs_dropped: u64,
}

/// Cloneable, non-blocking handle for queueing log messages.
#[derive(Debug, Clone)]
pub struct DiskLogger {
    tx: Sender<LogRecord>,
    dropped: Arc<AtomicU64>,
    ready: DataReady,
}

impl DiskLogger {
    /// Queue a message stamped with the given time. Returns `false` if the
    /// queue was full and the message was dropped.
    pub fn log(&self, message: impl Into<String>, sec: i64, usec: i64) -> bool {
        self.send(LogRecord {
            sec,
            usec,
            message: message.into(),
        })
    }

    /// Queue a message stamped with the current wall-clock time.
    pub fn log_now(&self, message: impl Into<String>) -> bool {
        self.send(LogRecord::now(message))
    }

    fn send(&self, record: LogRecord) -> bool {
        match self.tx.try_send(record) {
            Ok(()) => {
                self.ready.notify();
                true
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

struct EntryState {
    start: u32,
    /// Frame time the next contiguous period would carry.
    expected: u32,
    nchannels: usize,
    specs: Vec<ChannelSpec>,
}

/// Entry bookkeeping and the sink, without a thread.
///
/// [`DiskWriter`] runs one of these behind its mutex. Offline replay drives
/// one directly from the producer's thread.
pub struct EntryWriter<S> {
    sink: S,
    config: DiskWriterConfig,
    entry: Option<EntryState>,
    next_entry: u64,
    seen_overruns: u64,
    stats: DiskStats,
}

impl<S: EntrySink> EntryWriter<S> {
    pub fn new(sink: S, config: DiskWriterConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            sink,
            config,
            entry: None,
            next_entry: 0,
            seen_overruns: 0,
            stats: DiskStats::default(),
        })
    }

    /// Treat drops already counted by `reader` as seen, so they are not
    /// reported as overruns of this writer.
    pub fn sync_overruns(&mut self, reader: &PeriodReader) {
        self.seen_overruns = reader.overruns();
    }

    pub fn config(&self) -> &DiskWriterConfig {
        &self.config
    }

    pub fn stats(&self) -> DiskStats {
        self.stats
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Write one log record now.
    pub fn log(&mut self, record: &LogRecord) {
        match self.sink.log(record) {
            Ok(()) => self.stats.logs_written += 1,
            Err(e) => {
                self.stats.write_errors += 1;
                warn!(error = %e, "failed to write log record");
            }
        }
    }

    fn drain_logs(&mut self, logs: &Receiver<LogRecord>) {
        for record in logs.try_iter() {
            self.log(&record);
        }
    }

    /// Write every complete period available. Returns the number written.
    pub fn write_available(&mut self, reader: &mut PeriodReader) -> usize {
        let mut written = 0;
        loop {
            self.check_overrun(reader);
            let Some(header) = reader.request() else {
                break;
            };
            self.ensure_entry(&header);
            let Some(entry) = self.entry.as_ref() else {
                break;
            };
            let offset = header.time.wrapping_sub(entry.start);

            for _ in 0..header.nchannels {
                let Self { sink, entry, stats, .. } = self;
                let specs = entry.as_ref().map_or(&[][..], |e| e.specs.as_slice());
                let result = reader.pop_with(|idx, channel| match specs.get(idx) {
                    Some(spec) => sink.write_channel(idx, spec, offset, channel),
                    None => Ok(()),
                });
                if let Err(e) = result {
                    stats.write_errors += 1;
                    warn!(time = header.time, error = %e, "failed to write channel");
                }
            }
            reader.release();
            if let Some(entry) = self.entry.as_mut() {
                entry.expected = header.time.wrapping_add(header.nframes);
            }

            self.stats.periods += 1;
            self.stats.frames += u64::from(header.nframes);
            written += 1;
        }
        written
    }

    /// Close the current entry and flush the sink. The next period starts a
    /// new entry.
    pub fn finish(&mut self) -> Result<()> {
        self.entry = None;
        let result = self.sink.flush();
        if result.is_err() {
            self.stats.write_errors += 1;
        }
        result
    }

    fn ensure_entry(&mut self, header: &PeriodHeader) {
        let nchannels = header.nchannels as usize;
        let reason = match &self.entry {
            None => Some("start"),
            Some(entry) if header.time < entry.start => Some("time reset"),
            Some(entry) if header.time != entry.expected => Some("gap"),
            Some(entry) if entry.nchannels != nchannels => Some("channel layout changed"),
            Some(_) => None,
        };
        let Some(reason) = reason else {
            return;
        };

        let specs = self.config.channels_for(nchannels);
        let index = self.next_entry;
        self.next_entry += 1;
        let start = EntryStart {
            index,
            start_frame: header.time,
            wall_clock: Utc::now(),
            sample_rate: self.config.sample_rate,
            channels: &specs,
            attributes: &self.config.attributes,
        };
        match self.sink.begin_entry(&start) {
            Ok(()) => {
                self.stats.entries += 1;
                info!(index, start_frame = header.time, reason, "new entry");
            }
            Err(e) => {
                self.stats.write_errors += 1;
                error!(index, error = %e, "failed to begin entry");
            }
        }
        self.entry = Some(EntryState {
            start: header.time,
            expected: header.time,
            nchannels,
            specs,
        });
    }

    fn check_overrun(&mut self, reader: &PeriodReader) {
        let overruns = reader.overruns();
        if overruns == self.seen_overruns {
            return;
        }
        let dropped = overruns - self.seen_overruns;
        self.seen_overruns = overruns;
        self.stats.overruns += dropped;
        warn!(dropped, "producer overrun");
        self.log(&LogRecord::now(format!("overrun: {dropped} periods dropped")));
    }
}

struct Shared<S> {
    state: Mutex<EntryWriter<S>>,
    ready: DataReady,
    stop: AtomicBool,
    logs_dropped: Arc<AtomicU64>,
}

/// Handle to a running disk-writer thread.
pub struct DiskWriter<S> {
    shared: Arc<Shared<S>>,
    logger: DiskLogger,
    handle: Option<JoinHandle<()>>,
}

impl<S: EntrySink> DiskWriter<S> {
    /// Spawn the disk thread. It consumes `reader` until stopped.
    pub fn start(reader: PeriodReader, sink: S, config: DiskWriterConfig) -> Result<Self> {
        Self::spawn(reader, EntryWriter::new(sink, config)?)
    }

    /// Spawn the disk thread around an existing [`EntryWriter`].
    pub fn spawn(mut reader: PeriodReader, mut entries: EntryWriter<S>) -> Result<Self> {
        entries.sync_overruns(&reader);
        let (tx, logs) = crossbeam_channel::bounded(entries.config().log_queue);
        let ready = DataReady::new();
        let logs_dropped = Arc::new(AtomicU64::new(0));
        let sample_rate = entries.config().sample_rate;
        let shared = Arc::new(Shared {
            state: Mutex::new(entries),
            ready: ready.clone(),
            stop: AtomicBool::new(false),
            logs_dropped: Arc::clone(&logs_dropped),
        });
        let logger = DiskLogger {
            tx,
            dropped: logs_dropped,
            ready,
        };

        let thread_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("trigrec-disk".into())
            .spawn(move || {
                info!(sample_rate, "disk thread started");
                let mut state = thread_shared.state.lock();
                loop {
                    state.drain_logs(&logs);
                    let written = state.write_available(&mut reader);
                    if thread_shared.stop.load(Ordering::Acquire) {
                        break;
                    }
                    if written == 0 {
                        thread_shared.ready.wait_for(&mut state, WAKE_TIMEOUT);
                    }
                }

                // Drain what the producer managed to publish before stopping.
                state.write_available(&mut reader);
                state.drain_logs(&logs);
                if let Err(e) = state.finish() {
                    error!(error = %e, "final flush failed");
                }
                debug!(stats = ?state.stats, "disk thread stopped");
            })
            .map_err(|e| TrigrecError::Thread(e.to_string()))?;

        Ok(Self {
            shared,
            logger,
            handle: Some(handle),
        })
    }

    /// Handle the producer uses to wake the disk thread after each period.
    pub fn notifier(&self) -> DataReady {
        self.shared.ready.clone()
    }

    /// Cloneable log handle for other threads.
    pub fn logger(&self) -> DiskLogger {
        self.logger.clone()
    }

    /// Queue a log message. Never blocks; see [`DiskLogger::log`].
    pub fn log(&self, message: impl Into<String>, sec: i64, usec: i64) -> bool {
        self.logger.log(message, sec, usec)
    }

    pub fn log_now(&self, message: impl Into<String>) -> bool {
        self.logger.log_now(message)
    }

    /// Current counters. Briefly takes the disk lock.
    pub fn stats(&self) -> DiskStats {
        let mut stats = self.shared.state.lock().stats();
        stats.logs_dropped = self.shared.logs_dropped.load(Ordering::Relaxed);
        stats
    }

    /// Ask the thread to drain, flush and exit. Does not wait.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.ready.notify();
    }

    /// Stop the thread, wait for it and return the final counters.
    pub fn join(mut self) -> Result<DiskStats> {
        self.stop();
        let handle = self.handle.take().ok_or(TrigrecError::NotRunning)?;
        handle
            .join()
            .map_err(|_| TrigrecError::Thread("disk thread panicked".into()))?;
        Ok(self.stats())
    }
}

impl<S> Drop for DiskWriter<S> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.shared.stop.store(true, Ordering::Release);
            self.shared.ready.notify();
            let _ = handle.join();
        }
    }
}
