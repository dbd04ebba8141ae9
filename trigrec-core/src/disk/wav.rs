//! Directory-per-entry storage.
//!
//! ```text
//! <root>/
//!   log.jsonl                  one LogRecord per line
//!   entry_000000/
//!     entry.json               EntryStart metadata
//!     00_mic.wav               mono 32-bit float WAV per audio channel
//!     01_midi.jsonl            one event per line per event channel
//!   entry_000001/
//!     ...
//! ```
//!
//! Entry directories are numbered after the highest one already under
//! `<root>`, so a new session never overwrites an earlier one.

use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use hound::{SampleFormat, WavSpec, WavWriter};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ChannelKind, ChannelSpec, EntrySink, EntryStart, LogRecord};
use crate::{buffering::Channel, error::Result};

pub const LOG_FILE: &str = "log.jsonl";
pub const ENTRY_FILE: &str = "entry.json";
const ENTRY_PREFIX: &str = "entry_";

/// One line of an event channel file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLine {
    /// Frame offset from the start of the entry.
    pub start: u64,
    /// Status byte high nibble (message type).
    #[serde(rename = "type")]
    pub kind: u8,
    /// Status byte low nibble.
    pub chan: u8,
    /// Raw message, hex encoded.
    pub message: String,
}

enum Output {
    Audio(WavWriter<BufWriter<File>>),
    Events(BufWriter<File>),
}

struct OpenEntry {
    dir: PathBuf,
    outputs: Vec<Output>,
}

pub struct WavEntrySink {
    root: PathBuf,
    /// Directory index of this session's entry 0.
    first_index: u64,
    log: BufWriter<File>,
    entry: Option<OpenEntry>,
}

impl WavEntrySink {
    /// Store entries under `root`, creating it if needed. An existing log file
    /// is appended to and existing entries are kept.
    pub fn create(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        let first_index = next_free_index(&root)?;
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(root.join(LOG_FILE))?;
        if first_index > 0 {
            debug!(root = %root.display(), first_index, "continuing existing recording root");
        }
        Ok(Self {
            root,
            first_index,
            log: BufWriter::new(log),
            entry: None,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory index the first entry of this session is written to.
    pub fn first_index(&self) -> u64 {
        self.first_index
    }

    /// Directory of the entry currently being written.
    pub fn current_entry(&self) -> Option<&Path> {
        self.entry.as_ref().map(|e| e.dir.as_path())
    }

    fn close_entry(&mut self) -> Result<()> {
        let Some(entry) = self.entry.take() else {
            return Ok(());
        };
        for output in entry.outputs {
            match output {
                Output::Audio(wav) => wav.finalize()?,
                Output::Events(mut file) => file.flush()?,
            }
        }
        debug!(dir = %entry.dir.display(), "entry closed");
        Ok(())
    }
}

impl EntrySink for WavEntrySink {
    fn begin_entry(&mut self, entry: &EntryStart<'_>) -> Result<()> {
        self.close_entry()?;

        let index = self.first_index + entry.index;
        let dir = self.root.join(format!("{ENTRY_PREFIX}{index:06}"));
        fs::create_dir_all(&dir)?;
        let mut meta = BufWriter::new(File::create(dir.join(ENTRY_FILE))?);
        serde_json::to_writer_pretty(&mut meta, &EntryStart { index, ..entry.clone() })?;
        meta.flush()?;

        let spec = WavSpec {
            channels: 1,
            sample_rate: entry.sample_rate,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };
        let mut outputs = Vec::with_capacity(entry.channels.len());
        for (idx, channel) in entry.channels.iter().enumerate() {
            let stem = format!("{idx:02}_{}", file_stem(&channel.name));
            let output = match channel.kind {
                ChannelKind::Audio => {
                    Output::Audio(WavWriter::create(dir.join(format!("{stem}.wav")), spec)?)
                }
                ChannelKind::Events => Output::Events(BufWriter::new(File::create(
                    dir.join(format!("{stem}.jsonl")),
                )?)),
            };
            outputs.push(output);
        }

        self.entry = Some(OpenEntry { dir, outputs });
        Ok(())
    }

    fn write_channel(
        &mut self,
        index: usize,
        _spec: &ChannelSpec,
        offset: u32,
        channel: Channel<'_>,
    ) -> Result<()> {
        let Some(output) = self
            .entry
            .as_mut()
            .and_then(|entry| entry.outputs.get_mut(index))
        else {
            return Ok(());
        };
        match output {
            Output::Audio(wav) => {
                for sample in channel.samples() {
                    wav.write_sample(sample)?;
                }
            }
            Output::Events(file) => {
                for event in channel.events() {
                    let line = EventLine {
                        start: u64::from(offset) + u64::from(event.frame),
                        kind: event.kind(),
                        chan: event.midi_channel(),
                        message: hex::encode(event.data),
                    };
                    serde_json::to_writer(&mut *file, &line)?;
                    file.write_all(b"\n")?;
                }
            }
        }
        Ok(())
    }

    fn log(&mut self, record: &LogRecord) -> Result<()> {
        serde_json::to_writer(&mut self.log, record)?;
        self.log.write_all(b"\n")?;
        self.log.flush()?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.close_entry()?;
        self.log.flush()?;
        Ok(())
    }
}

/// Channel name reduced to characters safe in a file name.
fn file_stem(name: &str) -> String {
    let stem: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    if stem.is_empty() {
        "channel".into()
    } else {
        stem
    }
}

/// One past the highest `entry_NNNNNN` directory under `root`.
fn next_free_index(root: &Path) -> Result<u64> {
    let mut next = 0;
    for dirent in fs::read_dir(root)? {
        let dirent = dirent?;
        if !dirent.file_type()?.is_dir() {
            continue;
        }
        let name = dirent.file_name();
        let index = name
            .to_str()
            .and_then(|n| n.strip_prefix(ENTRY_PREFIX))
            .and_then(|n| n.parse::<u64>().ok());
        if let Some(index) = index {
            next = next.max(index + 1);
        }
    }
    Ok(next)
}
