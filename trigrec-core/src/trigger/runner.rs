//! Runs a [`TriggerGate`] on its own consumer thread.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::{
    gate::{GateDiagnostics, GateSnapshot, TriggerGate},
    sink::TriggerSink,
};
use crate::{
    buffering::PeriodReader,
    error::{Result, TrigrecError},
    events::GateEvent,
    notify::{DataReady, WAKE_TIMEOUT},
};

struct Shared {
    /// Only used to park the thread on `ready`.
    idle: Mutex<()>,
    ready: DataReady,
    stop: AtomicBool,
}

/// Handle to a running trigger thread.
pub struct TriggerRunner<S> {
    shared: Arc<Shared>,
    events: broadcast::Sender<GateEvent>,
    diagnostics: Arc<GateDiagnostics>,
    handle: Option<JoinHandle<S>>,
}

impl<S: TriggerSink> TriggerRunner<S> {
    /// Move `gate` and `reader` onto a new thread that processes periods
    /// whenever `ready` is notified.
    pub fn start(mut gate: TriggerGate<S>, mut reader: PeriodReader, ready: DataReady) -> Result<Self> {
        let shared = Arc::new(Shared {
            idle: Mutex::new(()),
            ready,
            stop: AtomicBool::new(false),
        });
        let events = gate.event_sender();
        let diagnostics = gate.diagnostics();

        let thread_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("trigrec-trigger".into())
            .spawn(move || {
                info!("trigger thread started");
                loop {
                    gate.process(&mut reader);
                    if thread_shared.stop.load(Ordering::Acquire) {
                        break;
                    }
                    let mut idle = thread_shared.idle.lock();
                    thread_shared.ready.wait_for(&mut idle, WAKE_TIMEOUT);
                }
                if let Some(output) = gate.finish(&mut reader) {
                    debug!(output = %output, "closed open output on shutdown");
                }
                info!("trigger thread stopped");
                gate.into_sink()
            })
            .map_err(|e| TrigrecError::Thread(e.to_string()))?;

        Ok(Self {
            shared,
            events,
            diagnostics,
            handle: Some(handle),
        })
    }

    /// Handle the producer uses to wake this thread.
    pub fn notifier(&self) -> DataReady {
        self.shared.ready.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GateEvent> {
        self.events.subscribe()
    }

    pub fn diagnostics(&self) -> GateSnapshot {
        self.diagnostics.snapshot()
    }

    /// Counters that stay readable after the runner is joined.
    pub fn diagnostics_handle(&self) -> Arc<GateDiagnostics> {
        Arc::clone(&self.diagnostics)
    }

    /// Ask the thread to drain the buffer and exit.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.ready.notify();
    }

    /// Stop the thread and wait for it, returning the sink.
    pub fn join(mut self) -> Result<S> {
        self.stop();
        let handle = self.handle.take().ok_or(TrigrecError::NotRunning)?;
        handle
            .join()
            .map_err(|_| TrigrecError::Thread("trigger thread panicked".into()))
    }
}

impl<S> Drop for TriggerRunner<S> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.shared.stop.store(true, Ordering::Release);
            self.shared.ready.notify();
            let _ = handle.join();
        }
    }
}
