//! Offline replay of a WAV file through the period buffer.
//!
//! Producer and consumer share the calling thread: blocks are fed one after
//! another and the caller's main loop runs every `nblocks` blocks to drain the
//! buffer. With a buffer of at least `nblocks` periods nothing is dropped, so
//! a replay reproduces exactly what a live session would have seen.

use std::path::Path;

use hound::{SampleFormat, WavReader};
use serde::Serialize;
use tracing::{debug, info};

use super::PeriodFeeder;
use crate::{
    error::{Result, TrigrecError},
    Sample,
};

/// Format of a WAV file, read from its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WavInfo {
    pub sample_rate: u32,
    pub channels: u16,
    /// Length in frames.
    pub frames: u32,
}

pub fn probe_wav(path: impl AsRef<Path>) -> Result<WavInfo> {
    let reader = WavReader::open(path)?;
    let spec = reader.spec();
    Ok(WavInfo {
        sample_rate: spec.sample_rate,
        channels: spec.channels,
        frames: reader.duration(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayOptions {
    /// Frames per period. Default: 1024.
    pub block_frames: usize,
    /// Periods fed between main-loop calls. Default: 4.
    pub nblocks: usize,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            block_frames: 1024,
            nblocks: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayStats {
    pub blocks: u64,
    pub frames: u64,
    /// Blocks the buffer had no room for.
    pub dropped: u64,
    pub main_loop_calls: u64,
}

/// Feed the WAV at `path` through `feeder` in periods of
/// `options.block_frames` frames, calling `main_loop` after every
/// `options.nblocks` periods and once more at the end.
///
/// Integer samples are scaled to [-1, 1). The last period may be short.
pub fn replay_wav<F>(
    path: impl AsRef<Path>,
    feeder: &mut PeriodFeeder,
    options: ReplayOptions,
    mut main_loop: F,
) -> Result<ReplayStats>
where
    F: FnMut() -> Result<()>,
{
    if options.block_frames == 0 || options.nblocks == 0 {
        return Err(TrigrecError::InvalidConfig(
            "replay block size and block count must be non-zero".into(),
        ));
    }
    let path = path.as_ref();
    let mut reader = WavReader::open(path)?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels);
    if channels == 0 {
        return Err(TrigrecError::InvalidConfig(format!(
            "{} has no channels",
            path.display()
        )));
    }
    info!(
        path = %path.display(),
        sample_rate = spec.sample_rate,
        channels,
        block_frames = options.block_frames,
        "replaying"
    );

    let mut samples: Box<dyn Iterator<Item = Result<Sample>> + '_> = match spec.sample_format {
        SampleFormat::Float => Box::new(
            reader
                .samples::<f32>()
                .map(|s| s.map_err(TrigrecError::from)),
        ),
        SampleFormat::Int => {
            let scale = 1.0 / (1u64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            Box::new(
                reader
                    .samples::<i32>()
                    .map(move |s| s.map(|v| v as f32 * scale).map_err(TrigrecError::from)),
            )
        }
    };

    let block_len = options.block_frames * channels;
    let mut block: Vec<Sample> = Vec::with_capacity(block_len);
    let mut stats = ReplayStats::default();
    loop {
        block.clear();
        for sample in samples.by_ref().take(block_len) {
            block.push(sample?);
        }
        let frames = block.len() / channels;
        if frames == 0 {
            break;
        }
        if !feeder.feed_interleaved(&block, channels) {
            stats.dropped += 1;
        }
        stats.blocks += 1;
        stats.frames += frames as u64;
        if stats.blocks % options.nblocks as u64 == 0 {
            main_loop()?;
            stats.main_loop_calls += 1;
        }
    }
    main_loop()?;
    stats.main_loop_calls += 1;

    debug!(?stats, "replay finished");
    Ok(stats)
}
