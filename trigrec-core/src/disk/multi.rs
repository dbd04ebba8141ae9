//! Numbered multi-file WAV output for triggered recording.

use std::{
    fs::File,
    io::BufWriter,
    path::{Path, PathBuf},
};

use hound::{SampleFormat, WavSpec, WavWriter};
use tracing::{debug, info};

use crate::{
    buffering::{Channel, Period},
    error::{Result, TrigrecError},
    trigger::TriggerSink,
    SAMPLE_BYTES,
};

struct OpenFile {
    path: PathBuf,
    writer: WavWriter<BufWriter<File>>,
    channels: usize,
    frames: u64,
}

/// Writes each gate-open interval to its own interleaved float WAV file.
///
/// File names come from a template in which `{}` is replaced by a
/// zero-padded running index (`take_{}.wav` → `take_0000.wav`, ...). A
/// template without `{}` gets `_NNNN` inserted before its extension.
/// Indices whose file already exists are skipped, so earlier takes survive
/// a new writer on the same template.
/// Channels whose block does not hold exactly `nframes` samples (event
/// channels) are not written.
pub struct MultiWavWriter {
    template: String,
    sample_rate: u32,
    next_index: u32,
    files_written: u32,
    current: Option<OpenFile>,
    /// Audio channels of the period being written; reused between periods.
    audio: Vec<usize>,
}

impl MultiWavWriter {
    pub fn new(template: impl Into<String>, sample_rate: u32) -> Result<Self> {
        let template = template.into();
        if template.trim().is_empty() {
            return Err(TrigrecError::InvalidConfig("output template is empty".into()));
        }
        if sample_rate == 0 {
            return Err(TrigrecError::InvalidConfig("sample rate must be non-zero".into()));
        }
        Ok(Self {
            template,
            sample_rate,
            next_index: 0,
            files_written: 0,
            current: None,
            audio: Vec::new(),
        })
    }

    /// Path the file with the given index will be written to.
    pub fn path_for(&self, index: u32) -> PathBuf {
        let number = format!("{index:04}");
        if self.template.contains("{}") {
            return PathBuf::from(self.template.replacen("{}", &number, 1));
        }
        let path = Path::new(&self.template);
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = match path.extension() {
            Some(ext) => format!("{stem}_{number}.{}", ext.to_string_lossy()),
            None => format!("{stem}_{number}.wav"),
        };
        path.with_file_name(name)
    }

    /// Files written so far.
    pub fn files_written(&self) -> u32 {
        self.files_written
    }

    /// First path at or after `next_index` that does not exist yet.
    fn next_free_path(&mut self) -> PathBuf {
        loop {
            let path = self.path_for(self.next_index);
            if !path.exists() {
                return path;
            }
            debug!(path = %path.display(), "output exists, skipping index");
            self.next_index += 1;
        }
    }

    fn open(&mut self, channels: usize) -> Result<&mut OpenFile> {
        let path = self.next_free_path();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let spec = WavSpec {
            channels: channels as u16,
            sample_rate: self.sample_rate,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };
        let writer = WavWriter::create(&path, spec)?;
        self.next_index += 1;
        self.files_written += 1;
        info!(path = %path.display(), channels, "opened output file");
        Ok(self.current.insert(OpenFile {
            path,
            writer,
            channels,
            frames: 0,
        }))
    }
}

impl TriggerSink for MultiWavWriter {
    fn write(&mut self, period: &Period<'_>) -> Result<()> {
        let nframes = period.nframes() as usize;
        self.audio.clear();
        self.audio.extend(
            period
                .channels()
                .enumerate()
                .filter(|(_, ch)| ch.as_bytes().len() == nframes * SAMPLE_BYTES)
                .map(|(idx, _)| idx),
        );
        if self.audio.is_empty() || nframes == 0 {
            return Ok(());
        }

        let channels = self.audio.len();
        if self.current.as_ref().is_some_and(|f| f.channels != channels) {
            // Layout changed mid-recording; WAV cannot express that.
            self.flush()?;
        }
        if self.current.is_none() {
            self.open(channels)?;
        }
        let Some(file) = self.current.as_mut() else {
            return Ok(());
        };

        let blocks: Vec<Channel<'_>> = self
            .audio
            .iter()
            .filter_map(|&idx| period.channel(idx))
            .collect();
        let mut iters: Vec<_> = blocks.iter().map(Channel::samples).collect();
        for _ in 0..nframes {
            for samples in iters.iter_mut() {
                file.writer.write_sample(samples.next().unwrap_or(0.0))?;
            }
        }
        file.frames += nframes as u64;
        Ok(())
    }

    fn flush(&mut self) -> Result<Option<String>> {
        let Some(file) = self.current.take() else {
            return Ok(None);
        };
        file.writer.finalize()?;
        let name = file.path.display().to_string();
        info!(path = %name, frames = file.frames, "closed output file");
        Ok(Some(name))
    }
}
