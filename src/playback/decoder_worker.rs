//! Decoder worker threads
//!
//! Each worker owns a set of decode jobs and an inbox from the pool
//! coordinator. Per tick the worker serves jobs with positive credit in
//! ascending-credit order (starving jobs first), with jobs inside their
//! loop-lookahead window promoted to the front so the seek and resampler
//! flush happen before the ring can drain.
//!
//! A `DecodeJob` is one running demux/decode context: it pulls packets,
//! resamples to the engine format, applies the post-seek discard, trims at
//! the out-frame, accumulates output chunks, and pushes them to the ring
//! without ever exceeding outstanding credit.
//!
//! # Boundary / loop logic
//!
//! An iteration ends by reaching the out-frame (trimmed) or demuxer EOF
//! (untrimmed). Buffered trim updates are applied at the boundary, then:
//! - non-looping: the final chunk carries `eof = true` and the job ends
//! - looping: the container seeks back to the in-frame, the resampler is
//!   reset, the post-seek discard re-arms, and the next chunk carries
//!   `is_loop_restart = true`; `eof` is never set

use crate::audio::decoder::CueDecoder;
use crate::audio::resampler::StreamResampler;
use crate::config::EngineConfig;
use crate::error::DecodeError;
use crate::playback::messages::{CueId, DecodeSpec, TrimUpdate};
use crate::playback::ring::{PcmChunk, RingProducer};
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Fixed input block for the stateful resampler
const RESAMPLER_CHUNK_FRAMES: usize = 1024;

/// Packets decoded per job per scheduling tick
const MAX_PACKETS_PER_STEP: usize = 32;

/// Worker inbox idle timeout
const IDLE_RECV_TIMEOUT: Duration = Duration::from_millis(5);

/// Coordinator → worker commands
pub enum WorkerCommand {
    /// Begin a decode job. `gen` disambiguates successive jobs for a
    /// replayed cue id.
    Start {
        spec: DecodeSpec,
        producer: RingProducer,
        gen: u64,
    },

    /// Cumulative credit grant in frames
    Credit { cue_id: CueId, frames: usize },

    /// Tear the job down at its next safe point
    Stop { cue_id: CueId },

    /// Buffered trim/loop update for the next loop boundary
    Update { cue_id: CueId, update: TrimUpdate },

    /// Drop all jobs and exit
    Shutdown,
}

/// Worker → coordinator job-termination report
///
/// `error` is Some when the job failed; the coordinator forwards it to the
/// orchestrator as a decode error event. `gen` echoes the Start so a stale
/// report cannot clear a newer assignment for the same cue id.
pub struct JobEnded {
    pub worker: usize,
    pub cue_id: CueId,
    pub gen: u64,
    pub error: Option<String>,
}

/// Spawn one decoder worker thread
pub fn spawn_worker(
    index: usize,
    config: EngineConfig,
    inbox: flume::Receiver<WorkerCommand>,
    reports: flume::Sender<JobEnded>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("cuedeck-decode-{}", index))
        .spawn(move || {
            debug!("Decoder worker {} started", index);
            worker_loop(index, &config, inbox, reports);
            debug!("Decoder worker {} exiting", index);
        })
        .expect("spawn decoder worker thread")
}

fn worker_loop(
    index: usize,
    config: &EngineConfig,
    inbox: flume::Receiver<WorkerCommand>,
    reports: flume::Sender<JobEnded>,
) {
    let mut jobs: HashMap<CueId, DecodeJob> = HashMap::new();

    loop {
        // Suspend on the inbox only when no job has outstanding credit.
        let busy = jobs.values().any(|j| j.runnable());
        if !busy {
            match inbox.recv_timeout(IDLE_RECV_TIMEOUT) {
                Ok(command) => {
                    if handle_command(index, config, &mut jobs, &reports, command) {
                        return;
                    }
                }
                Err(flume::RecvTimeoutError::Timeout) => {}
                Err(flume::RecvTimeoutError::Disconnected) => return,
            }
        }
        // Drain whatever else arrived without blocking.
        while let Ok(command) = inbox.try_recv() {
            if handle_command(index, config, &mut jobs, &reports, command) {
                return;
            }
        }

        // A lane the mixer already dropped leaves a job with no consumer;
        // reap those even when they hold no credit.
        jobs.retain(|cue_id, job| {
            if job.producer.consumer_detached() {
                debug!("[worker {}] Consumer gone for cue='{}', reaping job", index, cue_id);
                let _ = reports.send(JobEnded {
                    worker: index,
                    cue_id: cue_id.clone(),
                    gen: job.gen,
                    error: None,
                });
                false
            } else {
                true
            }
        });

        // Starving jobs first; jobs near a loop boundary jump the queue so
        // the pre-seek happens before the ring drains.
        let mut order: Vec<(CueId, u64, bool)> = jobs
            .iter()
            .filter(|(_, j)| j.runnable())
            .map(|(id, j)| (id.clone(), j.credit, j.in_lookahead()))
            .collect();
        order.sort_by_key(|(_, credit, lookahead)| (!lookahead, *credit));

        for (cue_id, _, _) in order {
            let Some(job) = jobs.get_mut(&cue_id) else {
                continue;
            };
            let outcome = catch_unwind(AssertUnwindSafe(|| job.step()));
            match outcome {
                Ok(Ok(StepOutcome::Working)) => {}
                Ok(Ok(StepOutcome::Ended)) => {
                    let job = jobs.remove(&cue_id).expect("job present");
                    info!(
                        "[worker {}] Job done: cue='{}', loops={}, frames={}",
                        index, cue_id, job.loop_count, job.total_frames
                    );
                    let _ = reports.send(JobEnded {
                        worker: index,
                        cue_id,
                        gen: job.gen,
                        error: None,
                    });
                }
                Ok(Err(e)) => {
                    let job = jobs.remove(&cue_id).expect("job present");
                    job.producer.mark_eof();
                    warn!("[worker {}] Job failed: cue='{}': {}", index, cue_id, e);
                    let _ = reports.send(JobEnded {
                        worker: index,
                        cue_id,
                        gen: job.gen,
                        error: Some(e.to_string()),
                    });
                }
                Err(panic) => {
                    let message = panic_message(panic);
                    let job = jobs.remove(&cue_id).expect("job present");
                    job.producer.mark_eof();
                    warn!(
                        "[worker {}] Job panicked: cue='{}': {}",
                        index, cue_id, message
                    );
                    let _ = reports.send(JobEnded {
                        worker: index,
                        cue_id,
                        gen: job.gen,
                        error: Some(
                            DecodeError::Panicked { message }.to_string(),
                        ),
                    });
                }
            }
        }
    }
}

/// Returns true when the worker should exit
fn handle_command(
    index: usize,
    config: &EngineConfig,
    jobs: &mut HashMap<CueId, DecodeJob>,
    reports: &flume::Sender<JobEnded>,
    command: WorkerCommand,
) -> bool {
    match command {
        WorkerCommand::Start {
            spec,
            producer,
            gen,
        } => {
            let cue_id = spec.cue_id.clone();
            // A replayed cue id replaces its old job; the old job still
            // accounts for itself with a termination report.
            if let Some(old) = jobs.remove(&cue_id) {
                old.producer.mark_eof();
                let _ = reports.send(JobEnded {
                    worker: index,
                    cue_id: cue_id.clone(),
                    gen: old.gen,
                    error: None,
                });
            }
            match DecodeJob::new(spec, producer, config, gen) {
                Ok(job) => {
                    debug!("[worker {}] Job started: cue='{}'", index, cue_id);
                    jobs.insert(cue_id, job);
                }
                Err(e) => {
                    warn!(
                        "[worker {}] Job failed to start: cue='{}': {}",
                        index, cue_id, e
                    );
                    let _ = reports.send(JobEnded {
                        worker: index,
                        cue_id,
                        gen,
                        error: Some(e.to_string()),
                    });
                }
            }
        }
        WorkerCommand::Credit { cue_id, frames } => {
            if let Some(job) = jobs.get_mut(&cue_id) {
                job.credit += frames as u64;
            }
        }
        WorkerCommand::Stop { cue_id } => {
            if let Some(job) = jobs.remove(&cue_id) {
                job.producer.mark_eof();
                debug!("[worker {}] Job stopped: cue='{}'", index, cue_id);
                let _ = reports.send(JobEnded {
                    worker: index,
                    cue_id,
                    gen: job.gen,
                    error: None,
                });
            }
        }
        WorkerCommand::Update { cue_id, update } => {
            if let Some(job) = jobs.get_mut(&cue_id) {
                job.buffer_update(update);
            }
        }
        WorkerCommand::Shutdown => {
            jobs.clear();
            return true;
        }
    }
    false
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

enum StepOutcome {
    /// Job still live
    Working,
    /// Job completed (final chunk pushed or consumer gone)
    Ended,
}

/// A staged output chunk awaiting credit
struct StagedChunk {
    samples: Vec<f32>,
    loop_restart: bool,
    eof: bool,
}

/// One running demux/decode context
struct DecodeJob {
    producer: RingProducer,
    decoder: CueDecoder,
    resampler: StreamResampler,

    in_frame: u64,
    out_frame: Option<u64>,
    loop_enabled: bool,

    /// Outstanding credit in frames (cumulative)
    credit: u64,

    /// Target-rate frames produced since the last in-frame
    decoded_frames: u64,

    /// Post-seek settle frames still to drop (target rate)
    discard_frames: u64,

    /// Source-rate frames to skip after an inexact container seek
    skip_source_frames: u64,

    /// Completed loop iterations
    loop_count: u64,

    /// Lifetime frames pushed (diagnostics)
    total_frames: u64,

    /// Trim update to apply at the next boundary
    pending_update: Option<TrimUpdate>,

    /// Accumulating output chunk
    accum: Vec<f32>,
    /// The next staged chunk starts a new loop iteration
    accum_restart: bool,

    /// Chunks closed out and awaiting credit
    staged: VecDeque<StagedChunk>,

    /// Final chunk staged; job ends when staging drains
    finishing: bool,

    /// Generation tag from the Start command
    gen: u64,

    // Engine-fixed parameters
    target_rate: u32,
    channels: usize,
    target_chunk_frames: usize,
    lookahead_frames: u64,
    seek_discard: u64,
}

impl DecodeJob {
    fn new(
        spec: DecodeSpec,
        producer: RingProducer,
        config: &EngineConfig,
        gen: u64,
    ) -> Result<Self, DecodeError> {
        // A failed start still has to close the ring, or the mixer lane
        // would wait on PCM until the stuck-decode watchdog fires.
        let decoder = match CueDecoder::open(&spec.file_path, config.channels) {
            Ok(decoder) => decoder,
            Err(e) => {
                producer.mark_eof();
                return Err(e);
            }
        };
        let resampler = match StreamResampler::new(
            decoder.source_rate(),
            config.sample_rate,
            config.channels,
            RESAMPLER_CHUNK_FRAMES,
        ) {
            Ok(resampler) => resampler,
            Err(e) => {
                producer.mark_eof();
                return Err(e);
            }
        };

        let mut job = Self {
            producer,
            decoder,
            resampler,
            in_frame: spec.in_frame,
            out_frame: spec.out_frame,
            loop_enabled: spec.loop_enabled,
            credit: 0,
            decoded_frames: 0,
            discard_frames: 0,
            skip_source_frames: 0,
            loop_count: 0,
            total_frames: 0,
            pending_update: None,
            accum: Vec::new(),
            accum_restart: false,
            staged: VecDeque::new(),
            finishing: false,
            gen,
            target_rate: config.sample_rate,
            channels: config.channels,
            target_chunk_frames: config.target_chunk_frames(),
            lookahead_frames: config.lookahead_frames() as u64,
            seek_discard: config.seek_discard_frames(),
        };
        if let Err(e) = job.begin_iteration(true) {
            job.producer.mark_eof();
            return Err(e);
        }
        Ok(job)
    }

    fn buffer_update(&mut self, update: TrimUpdate) {
        let merged = match self.pending_update.take() {
            Some(prev) => TrimUpdate {
                in_frame: update.in_frame.or(prev.in_frame),
                out_frame: update.out_frame.or(prev.out_frame),
                loop_enabled: update.loop_enabled.or(prev.loop_enabled),
            },
            None => update,
        };
        self.pending_update = Some(merged);
    }

    /// The job wants CPU time this tick
    fn runnable(&self) -> bool {
        self.credit > 0
    }

    /// Within the proactive pre-seek window of a loop boundary
    fn in_lookahead(&self) -> bool {
        if !self.loop_enabled {
            return false;
        }
        match self.out_frame {
            Some(out) => {
                let remaining = out.saturating_sub(self.in_frame + self.decoded_frames);
                remaining <= self.lookahead_frames
            }
            None => false,
        }
    }

    fn accum_frames(&self) -> usize {
        self.accum.len() / self.channels
    }

    fn staged_frames(&self) -> usize {
        self.staged
            .iter()
            .map(|c| c.samples.len() / self.channels)
            .sum()
    }

    /// One scheduling quantum: push what credit allows, decode up to a
    /// bounded number of packets, push again
    fn step(&mut self) -> Result<StepOutcome, DecodeError> {
        if self.producer.consumer_detached() {
            return Ok(StepOutcome::Ended);
        }

        self.push_staged();
        if self.finishing {
            return Ok(if self.staged.is_empty() {
                StepOutcome::Ended
            } else {
                StepOutcome::Working
            });
        }

        let decode_ahead_cap = self.target_chunk_frames * 2;
        let mut packets = 0;
        while self.credit > 0
            && self.staged_frames() + self.accum_frames() < decode_ahead_cap
            && packets < MAX_PACKETS_PER_STEP
            && !self.finishing
        {
            packets += 1;
            match self.decoder.next_block()? {
                Some(mut block) => {
                    if self.skip_source_frames > 0 {
                        let frames = (block.len() / self.channels) as u64;
                        let drop = self.skip_source_frames.min(frames);
                        block.drain(..(drop as usize) * self.channels);
                        self.skip_source_frames -= drop;
                        if block.is_empty() {
                            continue;
                        }
                    }
                    let resampled = self.resampler.feed(&block)?;
                    if self.absorb_target(resampled) {
                        self.end_iteration()?;
                    }
                }
                None => {
                    // Demuxer EOF: the filter tail still belongs to this
                    // iteration.
                    let tail = self.resampler.flush()?;
                    self.absorb_target(tail);
                    self.end_iteration()?;
                }
            }
        }

        self.push_staged();
        if self.finishing && self.staged.is_empty() {
            return Ok(StepOutcome::Ended);
        }
        Ok(StepOutcome::Working)
    }

    /// Apply discard and trim, append to the accumulator
    ///
    /// Returns true when the out-frame boundary was reached.
    fn absorb_target(&mut self, mut samples: Vec<f32>) -> bool {
        if samples.is_empty() {
            return false;
        }

        if self.discard_frames > 0 {
            let frames = (samples.len() / self.channels) as u64;
            let drop = self.discard_frames.min(frames);
            samples.drain(..(drop as usize) * self.channels);
            self.discard_frames -= drop;
            if samples.is_empty() {
                return false;
            }
        }

        let mut boundary = false;
        if let Some(out) = self.out_frame {
            let remaining = out.saturating_sub(self.in_frame + self.decoded_frames);
            let frames = (samples.len() / self.channels) as u64;
            if frames >= remaining {
                samples.truncate((remaining as usize) * self.channels);
                boundary = true;
            }
        }

        self.decoded_frames += (samples.len() / self.channels) as u64;
        if !samples.is_empty() {
            self.accum.extend_from_slice(&samples);
            if self.accum_frames() >= self.target_chunk_frames {
                self.stage_accum(false);
            }
        }
        boundary
    }

    /// Close the accumulator into a staged chunk
    fn stage_accum(&mut self, eof: bool) {
        if self.accum.is_empty() {
            return;
        }
        self.staged.push_back(StagedChunk {
            samples: std::mem::take(&mut self.accum),
            loop_restart: self.accum_restart,
            eof,
        });
        self.accum_restart = false;
    }

    /// Iteration boundary: apply buffered updates, then loop or finish
    fn end_iteration(&mut self) -> Result<(), DecodeError> {
        if let Some(update) = self.pending_update.take() {
            if let Some(in_frame) = update.in_frame {
                self.in_frame = in_frame;
            }
            if let Some(out_frame) = update.out_frame {
                self.out_frame = Some(out_frame);
            }
            if let Some(loop_enabled) = update.loop_enabled {
                self.loop_enabled = loop_enabled;
            }
        }

        if self.loop_enabled {
            // A loop window that yields nothing would seek forever.
            if self.decoded_frames == 0 {
                return Err(DecodeError::DecodeFailed {
                    frame: self.in_frame,
                    message: "loop window produced no audio".to_string(),
                });
            }
            self.stage_accum(false);
            self.loop_count += 1;
            self.begin_iteration(false)?;
        } else {
            self.stage_accum(true);
            match self.staged.back_mut() {
                Some(last) => last.eof = true,
                // Nothing buffered at all (e.g. trim window fully inside the
                // discard region): the ring still has to learn we are done.
                None => self.producer.mark_eof(),
            }
            self.finishing = true;
        }
        Ok(())
    }

    /// Seek to the iteration start and arm the post-seek discard
    fn begin_iteration(&mut self, first: bool) -> Result<(), DecodeError> {
        self.decoded_frames = 0;
        self.skip_source_frames = 0;
        self.discard_frames = 0;
        self.resampler.reset();

        if self.in_frame > 0 {
            let source_target = frames_to_source(
                self.in_frame,
                self.decoder.source_rate(),
                self.target_rate,
            );
            let actual = self.decoder.seek_to_frame(source_target)?;
            self.skip_source_frames = source_target.saturating_sub(actual);
            self.discard_frames = self.seek_discard;
        } else if !first {
            self.decoder.seek_to_frame(0)?;
        }

        if !first {
            self.accum_restart = true;
        }
        Ok(())
    }

    /// Push staged chunks while credit remains, splitting at the credit
    /// boundary
    fn push_staged(&mut self) {
        while self.credit > 0 {
            let Some(front) = self.staged.front_mut() else {
                break;
            };
            let frames = (front.samples.len() / self.channels) as u64;
            if frames == 0 {
                self.staged.pop_front();
                continue;
            }

            let chunk = if frames <= self.credit {
                let staged = self.staged.pop_front().expect("front exists");
                PcmChunk {
                    samples: staged.samples,
                    is_loop_restart: staged.loop_restart,
                    eof: staged.eof,
                }
            } else {
                // Partial push: the restart marker goes with the head, the
                // eof flag stays with the remainder.
                let take = (self.credit as usize) * self.channels;
                let samples: Vec<f32> = front.samples.drain(..take).collect();
                let loop_restart = front.loop_restart;
                front.loop_restart = false;
                PcmChunk {
                    samples,
                    is_loop_restart: loop_restart,
                    eof: false,
                }
            };

            let pushed = chunk.frames(self.channels) as u64;
            match self.producer.push(chunk) {
                Ok(()) => {
                    self.credit -= pushed;
                    self.total_frames += pushed;
                }
                Err(chunk) => {
                    // Queue full (cannot happen under credit discipline);
                    // put it back and retry next tick.
                    self.staged.push_front(StagedChunk {
                        samples: chunk.samples,
                        loop_restart: chunk.is_loop_restart,
                        eof: chunk.eof,
                    });
                    break;
                }
            }
        }
    }
}

/// Convert a target-rate frame index to the nearest source-rate frame
fn frames_to_source(target_frame: u64, source_rate: u32, target_rate: u32) -> u64 {
    (target_frame as u128 * source_rate as u128 / target_rate as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::ring::ring_pair;
    use hound::{SampleFormat, WavSpec, WavWriter};
    use std::path::PathBuf;
    use std::sync::Arc;

    fn write_wav(path: &PathBuf, rate: u32, frames: usize) {
        let spec = WavSpec {
            channels: 2,
            sample_rate: rate,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };
        let mut writer = WavWriter::create(path, spec).unwrap();
        for i in 0..frames {
            let s = (i as f32 * 0.001).sin() * 0.5;
            writer.write_sample(s).unwrap();
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }

    fn job_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.sample_rate = 48_000;
        config.channels = 2;
        config.block_frames = 256;
        config
    }

    fn spec(path: &PathBuf, in_frame: u64, out_frame: Option<u64>, looping: bool) -> DecodeSpec {
        DecodeSpec {
            cue_id: Arc::from("test"),
            file_path: path.clone(),
            in_frame,
            out_frame,
            loop_enabled: looping,
        }
    }

    #[test]
    fn test_whole_file_decode_to_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.wav");
        write_wav(&path, 48_000, 4800);

        let (prod, mut cons) = ring_pair(2);
        let config = job_config();
        let mut job = DecodeJob::new(spec(&path, 0, None, false), prod, &config, 0).unwrap();

        job.credit = 1_000_000;
        loop {
            match job.step().unwrap() {
                StepOutcome::Working => {}
                StepOutcome::Ended => break,
            }
        }

        // All 4800 frames arrive and the ring carries EOF.
        let mut total = 0;
        let mut dst = vec![0.0f32; 512 * 2];
        loop {
            let r = cons.drain_into(&mut dst);
            if r.frames == 0 {
                break;
            }
            total += r.frames;
        }
        assert_eq!(total, 4800);
        assert!(cons.eof());
        assert!(cons.finished_pending());
    }

    #[test]
    fn test_trimmed_decode_yields_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.wav");
        write_wav(&path, 48_000, 48_000);

        let (prod, mut cons) = ring_pair(2);
        let config = job_config();
        // Window [12000, 36000): 24000 frames, minus the 10 ms settle.
        let mut job =
            DecodeJob::new(spec(&path, 12_000, Some(36_000), false), prod, &config, 0).unwrap();
        job.credit = 1_000_000;
        loop {
            match job.step().unwrap() {
                StepOutcome::Working => {}
                StepOutcome::Ended => break,
            }
        }

        let mut total = 0;
        let mut dst = vec![0.0f32; 1024 * 2];
        loop {
            let r = cons.drain_into(&mut dst);
            if r.frames == 0 {
                break;
            }
            total += r.frames;
        }
        let window = 24_000u64;
        let discard = config.seek_discard_frames();
        assert!(
            (total as u64) <= window && (total as u64) >= window - discard - 64,
            "expected ~{} frames (±discard), got {}",
            window,
            total
        );
        assert!(cons.eof());
    }

    #[test]
    fn test_credit_limits_production() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.wav");
        write_wav(&path, 48_000, 48_000);

        let (prod, cons) = ring_pair(2);
        let config = job_config();
        let mut job = DecodeJob::new(spec(&path, 0, None, false), prod, &config, 0).unwrap();

        job.credit = 500;
        for _ in 0..50 {
            let _ = job.step().unwrap();
        }
        // Production never exceeds granted credit.
        assert_eq!(cons.buffered_frames(), 500);
        assert_eq!(job.credit, 0);
    }

    #[test]
    fn test_loop_iterations_are_lossless() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.wav");
        write_wav(&path, 48_000, 48_000);

        let (prod, mut cons) = ring_pair(2);
        let config = job_config();
        // Loop the first 4800 frames.
        let mut job =
            DecodeJob::new(spec(&path, 0, Some(4_800), true), prod, &config, 0).unwrap();

        // Grant enough credit for ~4 iterations.
        job.credit = 4_800 * 4;
        for _ in 0..400 {
            match job.step().unwrap() {
                StepOutcome::Working => {}
                StepOutcome::Ended => panic!("looping job must not end"),
            }
            if job.credit == 0 {
                break;
            }
        }
        assert!(job.loop_count >= 3, "expected ≥3 loops, got {}", job.loop_count);

        // Drain everything; count restart markers, assert no EOF.
        let mut dst = vec![0.0f32; 1024 * 2];
        let mut restarts = 0;
        let mut total = 0;
        loop {
            let r = cons.drain_into(&mut dst);
            if r.frames == 0 {
                break;
            }
            restarts += r.loop_restarts;
            total += r.frames;
        }
        assert!(restarts >= 3);
        assert_eq!(total, 4_800 * 4);
        assert!(!cons.eof(), "looping cue must never carry eof");
    }

    #[test]
    fn test_loop_with_offset_in_frame_discards_settle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.wav");
        write_wav(&path, 48_000, 48_000);

        let (prod, mut cons) = ring_pair(2);
        let config = job_config();
        let discard = config.seek_discard_frames();
        // Window [9600, 14400): 4800 frames nominal, each iteration yields
        // the window minus the 10 ms settle. Grant exactly three iterations
        // of credit.
        let per_iteration = 4_800 - discard;
        let mut job =
            DecodeJob::new(spec(&path, 9_600, Some(14_400), true), prod, &config, 0).unwrap();

        job.credit = per_iteration * 3;
        for _ in 0..400 {
            let _ = job.step().unwrap();
            if job.credit == 0 {
                break;
            }
        }
        assert_eq!(job.credit, 0);
        assert!(job.loop_count >= 3);

        let mut dst = vec![0.0f32; 1024 * 2];
        let mut total = 0u64;
        let mut restarts = 0u32;
        loop {
            let r = cons.drain_into(&mut dst);
            if r.frames == 0 {
                break;
            }
            total += r.frames as u64;
            restarts += r.loop_restarts;
        }
        // Exactly three iterations drained: two restart markers pushed,
        // every iteration the same length within the settle tolerance.
        assert_eq!(total, per_iteration * 3);
        assert_eq!(restarts, 2);
    }

    #[test]
    fn test_update_applies_at_loop_boundary_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.wav");
        write_wav(&path, 48_000, 48_000);

        let (prod, mut cons) = ring_pair(2);
        let config = job_config();
        let mut job =
            DecodeJob::new(spec(&path, 0, Some(4_800), true), prod, &config, 0).unwrap();

        // Shrink the window mid-iteration; iteration 1 still plays full
        // length, later iterations use the new out-frame.
        job.buffer_update(TrimUpdate {
            in_frame: None,
            out_frame: Some(2_400),
            loop_enabled: None,
        });

        job.credit = 4_800 + 2_400 * 2;
        for _ in 0..400 {
            let _ = job.step().unwrap();
            if job.credit == 0 {
                break;
            }
        }

        // First iteration: 4800 frames, then restarts every 2400.
        let mut dst = vec![0.0f32; 1200 * 2];
        let mut seen_before_first_restart = 0u64;
        let mut saw_restart = false;
        loop {
            let r = cons.drain_into(&mut dst);
            if r.frames == 0 {
                break;
            }
            if !saw_restart {
                if r.loop_restarts > 0 {
                    saw_restart = true;
                } else {
                    seen_before_first_restart += r.frames as u64;
                }
            }
        }
        assert!(saw_restart);
        assert!(
            seen_before_first_restart >= 3_600,
            "first iteration must not be cut mid-stream (saw {})",
            seen_before_first_restart
        );
        assert_eq!(job.out_frame, Some(2_400));
    }

    #[test]
    fn test_start_failure_reports_error() {
        let (prod, cons) = ring_pair(2);
        let config = job_config();
        let missing = PathBuf::from("/nonexistent/missing.wav");
        let result = DecodeJob::new(spec(&missing, 0, None, false), prod, &config, 0);
        assert!(result.is_err());
        drop(cons);
    }

    #[test]
    fn test_consumer_drop_ends_job() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.wav");
        write_wav(&path, 48_000, 48_000);

        let (prod, cons) = ring_pair(2);
        let config = job_config();
        let mut job = DecodeJob::new(spec(&path, 0, None, false), prod, &config, 0).unwrap();
        job.credit = 1_000;
        drop(cons);
        assert!(matches!(job.step().unwrap(), StepOutcome::Ended));
    }

    #[test]
    fn test_resampled_decode_approximates_duration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.wav");
        // 1 second of 44.1 kHz source into a 48 kHz engine.
        write_wav(&path, 44_100, 44_100);

        let (prod, mut cons) = ring_pair(2);
        let config = job_config();
        let mut job = DecodeJob::new(spec(&path, 0, None, false), prod, &config, 0).unwrap();
        job.credit = 1_000_000;
        loop {
            match job.step().unwrap() {
                StepOutcome::Working => {}
                StepOutcome::Ended => break,
            }
        }

        let mut dst = vec![0.0f32; 1024 * 2];
        let mut total = 0usize;
        loop {
            let r = cons.drain_into(&mut dst);
            if r.frames == 0 {
                break;
            }
            total += r.frames;
        }
        assert!(
            total.abs_diff(48_000) <= 256,
            "expected ~48000 frames, got {}",
            total
        );
    }
}
