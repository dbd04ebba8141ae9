//! Audio capture via cpal backend.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It **must not**:
//! - Allocate heap memory
//! - Block on a mutex or condvar
//! - Perform I/O
//!
//! Each callback block is handed to a [`PeriodFeeder`], which writes one
//! period into the lock-free buffer and wakes the consumer. Integer formats
//! are converted into a buffer allocated before the stream starts.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). `AudioCapture` therefore must be created and dropped on the same
//! thread; the recorder keeps it on a dedicated capture thread.

pub mod device;

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    SampleFormat, SampleRate, Stream, StreamConfig,
};

use crate::{
    engine::PeriodFeeder,
    error::{Result, TrigrecError},
};
use serde::Serialize;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
#[cfg(feature = "audio-cpal")]
use tracing::{error, info, warn};

/// Largest block the capture path converts in one go. Longer integer
/// callbacks are split into several periods.
pub const MAX_CALLBACK_FRAMES: usize = 8192;

#[cfg_attr(not(feature = "audio-cpal"), allow(dead_code))]
fn i16_to_f32(sample: i16) -> f32 {
    f32::from(sample) / 32768.0
}

#[cfg_attr(not(feature = "audio-cpal"), allow(dead_code))]
fn u8_to_f32(sample: u8) -> f32 {
    (f32::from(sample) - 128.0) / 128.0
}

/// Convert interleaved integer samples through `scratch` and feed them as
/// consecutive periods of at most `scratch.len() / channels` frames, so the
/// frame clock covers the whole block. Returns the number of periods fed.
#[cfg_attr(not(feature = "audio-cpal"), allow(dead_code))]
fn feed_converted<T: Copy>(
    feeder: &mut PeriodFeeder,
    data: &[T],
    channels: usize,
    scratch: &mut [f32],
    convert: impl Fn(T) -> f32,
) -> usize {
    let chunk = (scratch.len() / channels.max(1)) * channels;
    if chunk == 0 {
        return 0;
    }
    let mut periods = 0;
    for block in data.chunks(chunk) {
        let dest = &mut scratch[..block.len()];
        for (dst, src) in dest.iter_mut().zip(block) {
            *dst = convert(*src);
        }
        feeder.feed_interleaved(dest, channels);
        periods += 1;
    }
    periods
}

/// Stream parameters reported by the selected device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InputFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// An input device resolved but not yet opened.
pub struct InputDevice {
    pub name: String,
    pub format: InputFormat,
    #[cfg(feature = "audio-cpal")]
    device: cpal::Device,
    #[cfg(feature = "audio-cpal")]
    sample_format: SampleFormat,
}

/// Resolve an input device by preferred name, otherwise fall back to the
/// default input device and then the first available device.
#[cfg(feature = "audio-cpal")]
pub fn select_input(preferred_device_name: Option<&str>) -> Result<InputDevice> {
    let host = cpal::default_host();
    let mut selected_device = None;

    if let Some(preferred_name) = preferred_device_name {
        match host.input_devices() {
            Ok(mut devices) => {
                selected_device = devices.find(|device| {
                    device
                        .name()
                        .map(|name| name == preferred_name)
                        .unwrap_or(false)
                });

                if selected_device.is_none() {
                    warn!(
                        "preferred input device '{}' not found, falling back",
                        preferred_name
                    );
                }
            }
            Err(e) => {
                warn!("failed to list input devices while resolving preference: {e}");
            }
        }
    }

    let device = if let Some(device) = selected_device {
        device
    } else if let Some(default) = host.default_input_device() {
        default
    } else {
        let mut devices = host
            .input_devices()
            .map_err(|e| TrigrecError::AudioDevice(e.to_string()))?;
        let fallback = devices.next().ok_or(TrigrecError::NoDefaultInputDevice)?;
        warn!("no default input device, falling back to first available input");
        fallback
    };

    let supported = device
        .default_input_config()
        .map_err(|e| TrigrecError::AudioDevice(e.to_string()))?;
    let name = device.name().unwrap_or_default();
    let format = InputFormat {
        sample_rate: supported.sample_rate().0,
        channels: supported.channels(),
    };
    info!(
        device = name.as_str(),
        sample_rate = format.sample_rate,
        channels = format.channels,
        "input device selected"
    );

    Ok(InputDevice {
        name,
        format,
        device,
        sample_format: supported.sample_format(),
    })
}

#[cfg(not(feature = "audio-cpal"))]
pub fn select_input(_preferred_device_name: Option<&str>) -> Result<InputDevice> {
    Err(TrigrecError::AudioStream(
        "compiled without audio-cpal feature".into(),
    ))
}

/// Handle to an active audio capture stream.
///
/// **Not `Send`**: `cpal::Stream` is bound to its creation thread on
/// Windows/macOS. Create and drop this type on the same OS thread.
pub struct AudioCapture {
    /// Kept alive so the stream is not dropped prematurely.
    #[cfg(feature = "audio-cpal")]
    _stream: Stream,
    /// Shared flag; set to `false` to make the callback a no-op.
    running: Arc<AtomicBool>,
    pub format: InputFormat,
}

impl AudioCapture {
    /// Start streaming from `input` into `feeder`, one period per callback.
    #[cfg(feature = "audio-cpal")]
    pub fn open(input: InputDevice, mut feeder: PeriodFeeder, running: Arc<AtomicBool>) -> Result<Self> {
        let InputFormat {
            sample_rate,
            channels,
        } = input.format;
        info!(device = input.name.as_str(), "opening input stream");

        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let ch = usize::from(channels);
        let flag = Arc::clone(&running);

        let stream = match input.sample_format {
            SampleFormat::F32 => input.device.build_input_stream(
                &config,
                move |data: &[f32], _info| {
                    if !flag.load(Ordering::Relaxed) {
                        return;
                    }
                    feeder.feed_interleaved(data, ch);
                },
                |err| error!("audio stream error: {err}"),
                None,
            ),

            SampleFormat::I16 => {
                let mut converted: Vec<f32> = vec![0.0; MAX_CALLBACK_FRAMES * ch];
                input.device.build_input_stream(
                    &config,
                    move |data: &[i16], _info| {
                        if !flag.load(Ordering::Relaxed) {
                            return;
                        }
                        feed_converted(&mut feeder, data, ch, &mut converted, i16_to_f32);
                    },
                    |err| error!("audio stream error: {err}"),
                    None,
                )
            }

            SampleFormat::U8 => {
                let mut converted: Vec<f32> = vec![0.0; MAX_CALLBACK_FRAMES * ch];
                input.device.build_input_stream(
                    &config,
                    move |data: &[u8], _info| {
                        if !flag.load(Ordering::Relaxed) {
                            return;
                        }
                        feed_converted(&mut feeder, data, ch, &mut converted, u8_to_f32);
                    },
                    |err| error!("audio stream error: {err}"),
                    None,
                )
            }

            fmt => {
                return Err(TrigrecError::AudioStream(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| TrigrecError::AudioStream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| TrigrecError::AudioStream(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            running,
            format: input.format,
        })
    }

    /// Stub when the `audio-cpal` feature is disabled.
    #[cfg(not(feature = "audio-cpal"))]
    pub fn open(_input: InputDevice, _feeder: PeriodFeeder, _running: Arc<AtomicBool>) -> Result<Self> {
        Err(TrigrecError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }

    /// Make the callback a no-op from its next invocation on.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}
