use std::path::Path;
use std::time::{Duration, Instant};

use hound::{SampleFormat, WavSpec, WavWriter};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use trigrec_core::disk::{ChannelSpec, DiskWriter, DiskWriterConfig, EntryWriter, WavEntrySink};
use trigrec_core::engine::offline::{replay_wav, ReplayOptions};
use trigrec_core::engine::PeriodFeeder;
use trigrec_core::events::{GateEvent, GateEventKind, GateState};
use trigrec_core::trigger::{DiscardSink, GateConfig, TriggerGate, TriggerRunner};
use trigrec_core::{DataReady, MultiWavWriter, PeriodRingbuffer};

const RATE: u32 = 1000;
const FRAMES: usize = 100;

/// 1 kHz, 100-frame analysis periods, 200-frame prebuffer. Opens at 12
/// crossings over 3 periods, closes at ≤ 2 crossings over 2 periods.
fn gate_config() -> GateConfig {
    GateConfig {
        sample_rate: RATE,
        prebuffer_frames: 200,
        analysis_frames: FRAMES as u32,
        open_threshold: 0.2,
        open_rate: 40.0,
        open_periods: 3,
        close_threshold: 0.2,
        close_rate: 10.0,
        close_periods: 2,
        trigger_channel: 0,
    }
}

/// Four pulses per period.
fn loud() -> Vec<f32> {
    (0..FRAMES).map(|i| if i % 25 < 12 { 0.5 } else { 0.0 }).collect()
}

fn quiet() -> Vec<f32> {
    vec![0.0; FRAMES]
}

/// 5 quiet, 6 loud, 5 quiet periods.
fn burst() -> Vec<Vec<f32>> {
    let mut periods = vec![quiet(); 5];
    periods.extend(std::iter::repeat_with(loud).take(6));
    periods.extend(std::iter::repeat_with(quiet).take(5));
    periods
}

fn write_input(path: &Path, periods: &[Vec<f32>]) {
    let spec = WavSpec {
        channels: 1,
        sample_rate: RATE,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };
    let mut wav = WavWriter::create(path, spec).expect("create input");
    for sample in periods.iter().flatten() {
        wav.write_sample(*sample).expect("write sample");
    }
    wav.finalize().expect("finalize input");
}

fn drain(rx: &mut broadcast::Receiver<GateEvent>) -> Vec<GateEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(ev) => events.push(ev),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return events,
        }
    }
}

#[test]
fn offline_replay_through_gate_writes_one_file_per_burst() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("input.wav");
    write_input(&input, &burst());

    let template = dir.path().join("take_{}.wav").display().to_string();
    let sink = MultiWavWriter::new(template, RATE).expect("sink");
    let mut gate = TriggerGate::new(gate_config(), sink).expect("gate");
    let mut events = gate.subscribe();

    let (writer, mut reader) = PeriodRingbuffer::for_periods(FRAMES, 1, 8)
        .expect("buffer")
        .split();
    let mut feeder = PeriodFeeder::new(writer, DataReady::new(), FRAMES);
    let options = ReplayOptions {
        block_frames: FRAMES,
        nblocks: 1,
    };
    let stats = replay_wav(&input, &mut feeder, options, || {
        gate.process(&mut reader);
        Ok(())
    })
    .expect("replay");
    assert_eq!(stats.blocks, 16);
    assert_eq!(stats.dropped, 0);
    assert_eq!(gate.finish(&mut reader), None);
    assert_eq!(gate.state(), GateState::Closed);

    let events = drain(&mut events);
    let kinds: Vec<(GateEventKind, u32)> = events.iter().map(|e| (e.kind, e.time)).collect();
    assert_eq!(
        kinds,
        vec![(GateEventKind::Opened, 700), (GateEventKind::Closed, 1200)]
    );
    let output = events[1].output.clone().expect("closed event names its file");
    assert!(output.ends_with("take_0000.wav"));

    // Two prebuffered periods plus the opening one, then everything up to the
    // close.
    let mut wav = hound::WavReader::open(&output).expect("open output");
    assert_eq!(wav.duration(), 8 * FRAMES as u32);
    let samples: Vec<f32> = wav.samples::<f32>().map(|s| s.expect("sample")).collect();
    assert_eq!(&samples[..FRAMES], loud().as_slice());
    assert_eq!(&samples[7 * FRAMES..], quiet().as_slice());

    let diag = gate.diagnostics().snapshot();
    assert_eq!(diag.opens, 1);
    assert_eq!(diag.closes, 1);
    assert_eq!(diag.periods_written, 8);
    assert_eq!(diag.periods_seen, 16);
}

#[test]
fn runner_thread_reports_gate_events() {
    let (writer, reader) = PeriodRingbuffer::for_periods(FRAMES, 1, 32)
        .expect("buffer")
        .split();
    let gate = TriggerGate::new(gate_config(), DiscardSink::new()).expect("gate");
    let runner = TriggerRunner::start(gate, reader, DataReady::new()).expect("runner");
    let mut events = runner.subscribe();
    let mut feeder = PeriodFeeder::new(writer, runner.notifier(), FRAMES);

    for period in burst() {
        assert!(feeder.feed_planar(&[period.as_slice()]));
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while runner.diagnostics().closes == 0 {
        assert!(Instant::now() < deadline, "gate never closed");
        std::thread::sleep(Duration::from_millis(5));
    }
    runner.join().expect("join runner");

    let kinds: Vec<GateEventKind> = drain(&mut events).iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![GateEventKind::Opened, GateEventKind::Closed]);
}

#[test]
fn stalled_gate_reports_overrun_and_rearms() {
    let (writer, mut reader) = PeriodRingbuffer::for_periods(FRAMES, 1, 4)
        .expect("buffer")
        .split();
    let mut gate = TriggerGate::new(gate_config(), DiscardSink::new()).expect("gate");
    let mut events = gate.subscribe();
    let mut feeder = PeriodFeeder::new(writer, DataReady::new(), FRAMES);

    // Six periods into a four-period buffer before the gate runs.
    for _ in 0..6 {
        feeder.feed_planar(&[loud().as_slice()]);
    }
    gate.process(&mut reader);
    let overrun = drain(&mut events);
    assert_eq!(overrun.len(), 1);
    assert_eq!(overrun[0].kind, GateEventKind::Overrun);
    assert_eq!(overrun[0].overruns, 2);
    assert_eq!(reader.read_space(), 0);

    // Fresh audio opens the gate as usual.
    for _ in 0..3 {
        assert!(feeder.feed_planar(&[loud().as_slice()]));
        gate.process(&mut reader);
    }
    assert_eq!(gate.state(), GateState::Open);
    assert_eq!(drain(&mut events)[0].kind, GateEventKind::Opened);
}

#[test]
fn disk_writer_records_live_stream_to_entries() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (writer, reader) = PeriodRingbuffer::for_periods(64, 2, 16)
        .expect("buffer")
        .split();
    let config = DiskWriterConfig {
        sample_rate: 8000,
        channels: vec![ChannelSpec::audio("left"), ChannelSpec::audio("right")],
        ..Default::default()
    };
    let sink = WavEntrySink::create(dir.path()).expect("sink");
    let disk = DiskWriter::start(reader, sink, config).expect("disk writer");
    let mut feeder = PeriodFeeder::new(writer, disk.notifier(), 64);

    let producer = std::thread::spawn(move || {
        let block: Vec<f32> = (0..128).map(|i| if i % 2 == 0 { 0.5 } else { -0.5 }).collect();
        let mut accepted = Vec::new();
        while accepted.len() < 20 {
            let time = feeder.clock();
            if feeder.feed_interleaved(&block, 2) {
                accepted.push(time);
            } else {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        (accepted, feeder.dropped())
    });
    let (accepted, dropped) = producer.join().expect("producer");
    assert!(disk.log_now("session done"));
    let stats = disk.join().expect("join disk writer");

    assert_eq!(stats.periods, 20);
    assert_eq!(stats.overruns, dropped);
    // Every hole in the frame clock between accepted periods starts an entry.
    let gaps = accepted.windows(2).filter(|w| w[1] != w[0] + 64).count() as u64;
    assert_eq!(stats.entries, 1 + gaps);
    if dropped == 0 {
        assert_eq!(stats.logs_written, 1);
    } else {
        assert!(stats.logs_written >= 2, "overrun is logged");
    }

    let entry = dir.path().join("entry_000000");
    let left = hound::WavReader::open(entry.join("00_left.wav")).expect("left channel");
    let right = hound::WavReader::open(entry.join("01_right.wav")).expect("right channel");
    assert_eq!(left.duration(), right.duration());
    assert!(left.into_samples::<f32>().all(|s| s.expect("sample") == 0.5));
}

#[test]
fn offline_replay_into_entry_writer() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("input.wav");
    write_input(&input, &burst());
    let out = dir.path().join("out");

    let (writer, mut reader) = PeriodRingbuffer::for_periods(FRAMES, 1, 8)
        .expect("buffer")
        .split();
    let mut feeder = PeriodFeeder::new(writer, DataReady::new(), FRAMES);
    let config = DiskWriterConfig {
        sample_rate: RATE,
        ..Default::default()
    };
    let mut entries =
        EntryWriter::new(WavEntrySink::create(&out).expect("sink"), config).expect("entries");
    let options = ReplayOptions {
        block_frames: 64,
        nblocks: 4,
    };
    replay_wav(&input, &mut feeder, options, || {
        entries.write_available(&mut reader);
        Ok(())
    })
    .expect("replay");
    entries.finish().expect("finish");

    assert_eq!(entries.stats().frames, 1600);
    let wav = hound::WavReader::open(out.join("entry_000000").join("00_ch0.wav")).expect("wav");
    assert_eq!(wav.duration(), 1600);
}
