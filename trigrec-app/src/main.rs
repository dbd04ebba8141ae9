//! trigrec command-line recorder.
//!
//! ```text
//! trigrec record  [-o DIR] [--attr key=value]...   continuous recording into entry directories
//! trigrec trigger [TEMPLATE]                       one WAV per triggered interval
//! trigrec replay  INPUT [--output DIR | --template T]
//! trigrec devices
//! trigrec settings [--save]
//! ```
//!
//! Gate and session events are printed to stdout as JSON lines; diagnostics
//! go to stderr through `tracing` (`RUST_LOG` overrides the default filter).

mod settings;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};
use trigrec_core::{
    audio::device::list_input_devices,
    buffering::period::{period_bytes, MIN_PERIODS},
    disk::{DiskWriterConfig, EntryWriter, WavEntrySink},
    engine::offline::{probe_wav, replay_wav, ReplayOptions, ReplayStats},
    trigger::{DiscardSink, TriggerSink},
    DataReady, GateEvent, MultiWavWriter, PeriodFeeder, PeriodRingbuffer, RecordMode, Recorder,
    RecorderConfig, SessionStatus, SessionStatusEvent, TriggerGate,
};

use settings::{default_settings_path, load_settings, save_settings, AppSettings};

#[derive(Debug, Parser)]
#[command(name = "trigrec", version, about = "Triggered and continuous audio recorder")]
struct Cli {
    /// Settings file (default: the user config directory).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Record everything into numbered entry directories.
    Record {
        /// Output root directory.
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Session attribute stored with every entry.
        #[arg(long = "attr", value_parser = parse_attribute)]
        attributes: Vec<(String, String)>,
        #[command(flatten)]
        live: LiveArgs,
    },
    /// Record only while the trigger gate is open.
    Trigger {
        /// Output file template; `{}` becomes the take number. Without one,
        /// gate events are only reported.
        template: Option<String>,
        #[command(flatten)]
        live: LiveArgs,
    },
    /// Run a WAV file through the recorder offline.
    Replay {
        input: PathBuf,
        /// Write continuous entries under this directory instead of gating.
        #[arg(short, long, conflicts_with = "template")]
        output: Option<PathBuf>,
        /// Output file template for gated takes.
        #[arg(short, long)]
        template: Option<String>,
        /// Frames per period.
        #[arg(long, default_value_t = 1024)]
        block_frames: usize,
        /// Periods fed between consumer passes.
        #[arg(long, default_value_t = 4)]
        nblocks: usize,
    },
    /// List audio input devices.
    Devices,
    /// Print the effective settings as JSON.
    Settings {
        /// Write the effective settings back to the settings file.
        #[arg(long)]
        save: bool,
    },
}

#[derive(Debug, Args)]
struct LiveArgs {
    /// Input device name.
    #[arg(short, long)]
    device: Option<String>,
    /// Stop after this many seconds instead of waiting for Ctrl-C.
    #[arg(long)]
    duration: Option<f64>,
}

fn parse_attribute(raw: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err("attribute key is empty".into());
    }
    Ok((key.to_string(), value.trim().to_string()))
}

fn print_json(value: &impl Serialize) {
    match serde_json::to_string(value) {
        Ok(line) => println!("{line}"),
        Err(e) => warn!("failed to serialize event: {e}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("trigrec=info,trigrec_core=info")),
        )
        .init();

    let cli = Cli::parse();
    let settings_path = cli.settings.clone().unwrap_or_else(default_settings_path);
    let settings = load_settings(&settings_path);

    match cli.command {
        Command::Record {
            output,
            attributes,
            live,
        } => {
            let mut config = recorder_config(
                &settings,
                RecordMode::Continuous {
                    output_dir: output.unwrap_or_else(|| settings.output_dir.clone()),
                },
                &live,
            );
            config.attributes.extend(attributes);
            run_live(config, live.duration).await
        }
        Command::Trigger { template, live } => {
            let config = recorder_config(
                &settings,
                RecordMode::Triggered {
                    settings: settings.trigger.clone(),
                    template: template.or_else(|| settings.output_template.clone()),
                },
                &live,
            );
            run_live(config, live.duration).await
        }
        Command::Replay {
            input,
            output,
            template,
            block_frames,
            nblocks,
        } => {
            let options = ReplayOptions {
                block_frames,
                nblocks,
            };
            let stats = tokio::task::spawn_blocking(move || {
                run_replay(&settings, &input, output, template, options)
            })
            .await
            .context("replay task panicked")??;
            print_json(&stats);
            Ok(())
        }
        Command::Devices => {
            for device in list_input_devices() {
                print_json(&device);
            }
            Ok(())
        }
        Command::Settings { save } => {
            if save {
                save_settings(&settings_path, &settings)
                    .with_context(|| format!("writing {}", settings_path.display()))?;
                info!(path = %settings_path.display(), "settings saved");
            }
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
    }
}

fn recorder_config(settings: &AppSettings, mode: RecordMode, live: &LiveArgs) -> RecorderConfig {
    RecorderConfig {
        period_frames: settings.period_frames,
        buffer_periods: settings.buffer_periods,
        channels: settings.channels.clone(),
        attributes: settings.attributes.clone(),
        preferred_device: live
            .device
            .clone()
            .or_else(|| settings.preferred_input_device.clone()),
        ..RecorderConfig::new(mode)
    }
}

async fn run_live(config: RecorderConfig, duration: Option<f64>) -> Result<()> {
    let recorder = Arc::new(Recorder::new(config)?);
    let mut status = recorder.subscribe_status();
    let gate = recorder.subscribe_gate();

    let starting = Arc::clone(&recorder);
    let format = tokio::task::spawn_blocking(move || starting.start())
        .await
        .context("start task panicked")??;
    info!(
        sample_rate = format.sample_rate,
        channels = format.channels,
        "recording, press Ctrl-C to stop"
    );

    let printer = tokio::spawn(forward_gate_events(gate));
    let wait = async {
        match duration {
            Some(secs) if secs > 0.0 => tokio::time::sleep(Duration::from_secs_f64(secs)).await,
            _ => {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("failed to listen for Ctrl-C: {e}");
                }
            }
        }
    };
    tokio::select! {
        _ = wait => {}
        detail = wait_for_error(&mut status) => {
            warn!(detail = %detail, "session failed");
        }
    }

    let stopping = Arc::clone(&recorder);
    let summary = tokio::task::spawn_blocking(move || stopping.stop())
        .await
        .context("stop task panicked")??;
    printer.abort();
    print_json(&summary);
    Ok(())
}

/// Resolves once the recorder reports an error status.
async fn wait_for_error(rx: &mut broadcast::Receiver<SessionStatusEvent>) -> String {
    loop {
        match rx.recv().await {
            Ok(event) => {
                print_json(&event);
                if event.status == SessionStatus::Error {
                    return event.detail.unwrap_or_default();
                }
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

async fn forward_gate_events(mut rx: broadcast::Receiver<GateEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => print_json(&event),
            Err(broadcast::error::RecvError::Lagged(n)) => warn!("dropped {n} gate events"),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Offline replay on the current thread: feed `input` through a buffer and
/// drain it with either an entry writer or a trigger gate.
fn run_replay(
    settings: &AppSettings,
    input: &Path,
    output: Option<PathBuf>,
    template: Option<String>,
    options: ReplayOptions,
) -> Result<ReplayStats> {
    let info = probe_wav(input).with_context(|| format!("reading {}", input.display()))?;
    if info.channels == 0 {
        bail!("{} has no channels", input.display());
    }
    let channels = usize::from(info.channels);

    if let Some(output_dir) = output {
        let capacity = period_bytes(options.block_frames, channels)
            * (options.nblocks + 1).max(MIN_PERIODS);
        let (writer, mut reader) = PeriodRingbuffer::new(capacity)?.split();
        let mut feeder = PeriodFeeder::new(writer, DataReady::new(), options.block_frames);
        let config = DiskWriterConfig {
            sample_rate: info.sample_rate,
            channels: settings.channels.clone(),
            attributes: settings.attributes.clone(),
            ..Default::default()
        };
        let mut entries = EntryWriter::new(WavEntrySink::create(&output_dir)?, config)?;
        let stats = replay_wav(input, &mut feeder, options, || {
            entries.write_available(&mut reader);
            Ok(())
        })?;
        entries.finish()?;
        info!(entries = entries.stats().entries, dir = %output_dir.display(), "replay written");
        return Ok(stats);
    }

    let gate_config = settings.trigger.gate_config(info.sample_rate);
    let held = (gate_config.prebuffer_frames as usize).div_ceil(options.block_frames) + 1;
    let capacity =
        period_bytes(options.block_frames, channels) * (held + options.nblocks).max(MIN_PERIODS);
    let (writer, mut reader) = PeriodRingbuffer::new(capacity)?.split();
    let mut feeder = PeriodFeeder::new(writer, DataReady::new(), options.block_frames);

    let sink: Box<dyn TriggerSink> = match template.or_else(|| settings.output_template.clone()) {
        Some(template) => Box::new(MultiWavWriter::new(template, info.sample_rate)?),
        None => Box::new(DiscardSink::new()),
    };
    let mut gate = TriggerGate::new(gate_config, sink)?;
    let mut events = gate.subscribe();
    let mut print_events = move || {
        while let Ok(event) = events.try_recv() {
            print_json(&event);
        }
    };

    let stats = replay_wav(input, &mut feeder, options, || {
        gate.process(&mut reader);
        print_events();
        Ok(())
    })?;
    gate.finish(&mut reader);
    print_events();
    info!(diagnostics = ?gate.diagnostics().snapshot(), "replay finished");
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attributes_parse_as_key_value() {
        assert_eq!(
            parse_attribute("bird = zf 42").expect("attr"),
            ("bird".to_string(), "zf 42".to_string())
        );
        assert!(parse_attribute("novalue").is_err());
        assert!(parse_attribute("=x").is_err());
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["trigrec", "trigger", "take_{}.wav", "--duration", "2"])
            .expect("parse trigger");
        match cli.command {
            Command::Trigger { template, live } => {
                assert_eq!(template.as_deref(), Some("take_{}.wav"));
                assert_eq!(live.duration, Some(2.0));
            }
            other => panic!("unexpected command {other:?}"),
        }

        assert!(Cli::try_parse_from(["trigrec", "replay", "in.wav", "-o", "out", "-t", "x"]).is_err());
    }

    #[test]
    fn replay_with_template_writes_takes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("in.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut wav = hound::WavWriter::create(&input, spec).expect("create input");
        // Two seconds of silence, one of a loud square wave, two of silence.
        for i in 0..5 * 8000 {
            let loud = (16_000..24_000).contains(&i) && (i / 10) % 2 == 0;
            wav.write_sample(if loud { 20_000i16 } else { 0 })
                .expect("write sample");
        }
        wav.finalize().expect("finalize input");

        let settings = AppSettings::default();
        let template = dir.path().join("take_{}.wav").display().to_string();
        let stats = run_replay(
            &settings,
            &input,
            None,
            Some(template),
            ReplayOptions::default(),
        )
        .expect("replay");
        assert_eq!(stats.frames, 40_000);
        assert_eq!(stats.dropped, 0);
        assert!(dir.path().join("take_0000.wav").exists());
        assert!(!dir.path().join("take_0001.wav").exists());
    }

    #[test]
    fn replay_with_output_writes_an_entry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("in.wav");
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 8000,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut wav = hound::WavWriter::create(&input, spec).expect("create input");
        for _ in 0..3000 {
            wav.write_sample(0.25f32).expect("left");
            wav.write_sample(-0.25f32).expect("right");
        }
        wav.finalize().expect("finalize input");

        let out = dir.path().join("out");
        let stats = run_replay(
            &AppSettings::default(),
            &input,
            Some(out.clone()),
            None,
            ReplayOptions::default(),
        )
        .expect("replay");
        assert_eq!(stats.frames, 3000);
        let entry = out.join("entry_000000");
        assert!(entry.join("00_ch0.wav").exists());
        assert!(entry.join("01_ch1.wav").exists());
    }
}
