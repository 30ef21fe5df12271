//! Shared test fixtures: WAV generation and a fake audio device
//!
//! The engine's mixer is normally driven by a cpal stream; tests install it
//! on a plain thread that pulls one block per block-period, which behaves
//! like a bit-exact, headless audio device.

use cuedeck::playback::mixer::OutputMixer;
use cuedeck::{EngineConfig, EngineEvent};
use hound::{SampleFormat, WavSpec, WavWriter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Write a stereo float WAV of `frames` frames at `rate`
pub fn write_wav(path: &Path, rate: u32, frames: usize) -> PathBuf {
    let spec = WavSpec {
        channels: 2,
        sample_rate: rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };
    let mut writer = WavWriter::create(path, spec).unwrap();
    for i in 0..frames {
        // 220 Hz tone at a comfortable level.
        let t = i as f32 / rate as f32;
        let s = (2.0 * std::f32::consts::PI * 220.0 * t).sin() * 0.4;
        writer.write_sample(s).unwrap();
        writer.write_sample(s).unwrap();
    }
    writer.finalize().unwrap();
    path.to_path_buf()
}

/// Engine configuration sized for fast tests: small blocks, short watchdogs
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.block_frames = 512;
    config.pool_workers = 2;
    config
}

/// Headless audio device driving the mixer at the real block rate
pub struct MixerDriver {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MixerDriver {
    pub fn start(mixer: OutputMixer, config: &EngineConfig) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let block_samples = config.block_frames * config.channels;
        let period = config.block_duration();

        let handle = std::thread::Builder::new()
            .name("test-audio-device".to_string())
            .spawn(move || {
                let mut mixer = mixer;
                let mut block = vec![0.0f32; block_samples];
                while !stop_flag.load(Ordering::Relaxed) {
                    let started = Instant::now();
                    mixer.process(&mut block);
                    let elapsed = started.elapsed();
                    if elapsed < period {
                        std::thread::sleep(period - elapsed);
                    }
                }
            })
            .unwrap();

        Self {
            stop,
            handle: Some(handle),
        }
    }

    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MixerDriver {
    fn drop(&mut self) {
        self.halt();
    }
}

/// Pull events into `log` until `predicate` matches one or the timeout
/// expires; returns whether a match arrived
pub fn pump_until<F>(
    events: &flume::Receiver<EngineEvent>,
    log: &mut Vec<EngineEvent>,
    timeout: Duration,
    predicate: F,
) -> bool
where
    F: Fn(&EngineEvent) -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        match events.recv_timeout(Duration::from_millis(50)) {
            Ok(event) => {
                let matched = predicate(&event);
                log.push(event);
                if matched {
                    return true;
                }
            }
            Err(flume::RecvTimeoutError::Timeout) => {}
            Err(flume::RecvTimeoutError::Disconnected) => return false,
        }
    }
    false
}

/// Drain anything still queued without waiting
pub fn drain_events(events: &flume::Receiver<EngineEvent>, log: &mut Vec<EngineEvent>) {
    while let Ok(event) = events.try_recv() {
        log.push(event);
    }
}

/// Count events matching a predicate
pub fn count<F: Fn(&EngineEvent) -> bool>(log: &[EngineEvent], predicate: F) -> usize {
    log.iter().filter(|e| predicate(e)).count()
}
