use thiserror::Error;

/// All errors produced by trigrec-core.
///
/// Running out of ring buffer space is deliberately absent: a failed
/// reservation is an ordinary return value on the real-time path.
#[derive(Debug, Error)]
pub enum TrigrecError {
    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("ring buffer capacity must be non-zero")]
    ZeroCapacity,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("recorder is already running")]
    AlreadyRunning,

    #[error("recorder is not running")]
    NotRunning,

    #[error("worker thread failed: {0}")]
    Thread(String),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, TrigrecError>;
