//! Output mixer
//!
//! The realtime pull side of the engine: a host audio API invokes
//! `process()` with one output block and a hard deadline of
//! `block_frames / sample_rate`. Each invocation drains a drip of commands
//! from the orchestrator, pulls PCM from every live ring, applies fade
//! envelopes and per-cue gain, mixes into the block, applies master volume,
//! and emits telemetry and lifecycle observations.
//!
//! # Realtime discipline
//!
//! Nothing on this path blocks: ring pops, atomic flag reads, and
//! `try_send`/`try_push` only. Telemetry that does not fit in the event
//! queue is dropped. Diagnostics go through the lock-free rtlog ring.
//! Scratch buffers are sized at construction; the only allocations after
//! that happen when a StartCue command installs a new lane.
//!
//! # Per-cue state machine
//!
//! ```text
//! [none] ──StartCue──► [fading_in] ──envelope done──► [running]
//! [running] ──FadeTo(silence)/StopCue──► [fading] ──envelope at 0──► [ending]
//! [running] ──ring finished──► [ending]            (non-looping only)
//! [ending] ──next callback──► emit Finished, drop lane
//! ```
//!
//! A StartCue for an id whose lane is still live does not overwrite it: the
//! old lane is cut through the same path a zero-duration stop takes, and
//! the new lane is parked until the old one retires a block later.

use crate::config::EngineConfig;
use crate::playback::envelope::{Envelope, FadeCurve};
use crate::playback::messages::{
    CueId, MixerCommand, MixerEvent, MixerFinishReason, PoolCommand,
};
use crate::playback::ring::{RingConsumer, Watermarks};
use crate::playback::rtlog::{RtLogProducer, RtRecord};
use ringbuf::{traits::*, HeapCons, HeapProd};
use std::collections::HashMap;
use std::time::Instant;

/// Commands applied per callback; the rest stay queued for the next block
const MAX_COMMANDS_PER_CALLBACK: usize = 32;

/// Envelope count above which gain ramps are generated as vectors
const BATCH_ENVELOPE_THRESHOLD: usize = 2;

/// Lifecycle of one mixer lane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LaneState {
    /// Fade-in envelope still running
    FadingIn,
    /// Steady playback
    Running,
    /// Fading toward silence (stop, manual fade, or auto-fade)
    Fading,
    /// Will emit Finished and drop at the start of the next callback
    Ending,
}

/// Per-cue mixing state
struct Lane {
    cue_id: CueId,
    consumer: RingConsumer,
    /// Post-envelope mix gain (linear)
    gain: f32,
    envelope: Option<Envelope>,
    state: LaneState,
    /// Stuck-decode watchdog fired for this lane
    stuck: bool,
    /// Torn down to make room for a same-id replacement. The orchestrator
    /// already stopped the old decode job and emitted the old instance's
    /// finished event, so this lane retires without a DecodeStop and
    /// without a Finished of its own.
    replaced: bool,
    /// Reason recorded when the lane entered Ending
    finish_reason: MixerFinishReason,
}

/// A StartCue waiting for the old same-id lane to retire
struct PendingStart {
    consumer: RingConsumer,
    gain: f32,
    fade_in_frames: u64,
}

/// Realtime output mixer
pub struct OutputMixer {
    config: EngineConfig,
    lanes: HashMap<CueId, Lane>,
    /// Replacement starts parked until the old same-id lane retires
    pending_starts: HashMap<CueId, PendingStart>,
    inbox: HeapCons<MixerCommand>,
    events: HeapProd<MixerEvent>,
    pool_tx: flume::Sender<PoolCommand>,
    rtlog: RtLogProducer,
    master_volume: f32,

    /// Per-cue scratch, `block_frames * channels` samples
    scratch: Vec<f32>,
    /// Batched envelope ramp, `block_frames` gains
    gain_ramp: Vec<f32>,
    /// Reusable teardown list
    retired: Vec<CueId>,
}

impl OutputMixer {
    pub fn new(
        config: EngineConfig,
        inbox: HeapCons<MixerCommand>,
        events: HeapProd<MixerEvent>,
        pool_tx: flume::Sender<PoolCommand>,
        rtlog: RtLogProducer,
    ) -> Self {
        let scratch_len = config.block_frames * config.channels;
        let master_volume = config.master_volume;
        Self {
            scratch: vec![0.0; scratch_len],
            gain_ramp: vec![0.0; config.block_frames],
            retired: Vec::with_capacity(16),
            lanes: HashMap::new(),
            pending_starts: HashMap::new(),
            inbox,
            events,
            pool_tx,
            rtlog,
            master_volume,
            config,
        }
    }

    /// Number of live lanes (diagnostics/tests)
    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    /// Fill one output block
    ///
    /// `output` is interleaved f32, at most `block_frames * channels`
    /// samples; the host may ask for less.
    pub fn process(&mut self, output: &mut [f32]) {
        let channels = self.config.channels;
        let frames = (output.len() / channels).min(self.config.block_frames);
        let samples = frames * channels;
        let now = Instant::now();

        // Lanes marked Ending last callback: emit and drop first, so their
        // rings are released exactly one block after the last sample.
        self.retire_ending_lanes();

        self.apply_command_drip();

        output[..samples].iter_mut().for_each(|s| *s = 0.0);

        let active_envelopes = self
            .lanes
            .values()
            .filter(|l| l.envelope.is_some())
            .count();
        let telemetry_enabled = active_envelopes <= self.config.telemetry_skip_threshold;
        let batched = active_envelopes > BATCH_ENVELOPE_THRESHOLD;

        let marks = Watermarks::for_active_rings(
            self.config.block_frames,
            self.lanes.len(),
            self.config.low_water_mult,
            self.config.request_mult,
            self.config.burst_request_mult,
            self.config.burst_threshold,
        );

        for lane in self.lanes.values_mut() {
            if lane.state == LaneState::Ending {
                continue;
            }

            // Drain PCM into the lane scratch; pad the shortfall with
            // silence.
            let report = lane.consumer.drain_into(&mut self.scratch[..samples]);
            let filled = report.frames;
            let filled_samples = filled * channels;
            self.scratch[filled_samples..samples]
                .iter_mut()
                .for_each(|s| *s = 0.0);

            if filled < frames
                && !lane.consumer.eof()
                && lane.consumer.pcm_age(now).is_some()
            {
                self.rtlog.push(RtRecord::Underrun {
                    cue_id: lane.cue_id.clone(),
                    filled,
                });
            }

            for _ in 0..report.loop_restarts {
                push_event(
                    &mut self.events,
                    &mut self.rtlog,
                    MixerEvent::LoopRestarted {
                        cue_id: lane.cue_id.clone(),
                    },
                );
            }

            // Envelope and mix gain are applied to the scratch in place, so
            // the level telemetry below reports what actually got mixed.
            if let Some(env) = lane.envelope.as_ref() {
                if batched {
                    // One ramp vector per envelope, then a single multiply.
                    env.fill_ramp(&mut self.gain_ramp[..filled]);
                    for f in 0..filled {
                        let g = self.gain_ramp[f] * lane.gain;
                        for c in 0..channels {
                            self.scratch[f * channels + c] *= g;
                        }
                    }
                } else {
                    for f in 0..filled {
                        let g = env.gain_at(f as u64) * lane.gain;
                        for c in 0..channels {
                            self.scratch[f * channels + c] *= g;
                        }
                    }
                }
            } else if (lane.gain - 1.0).abs() > f32::EPSILON {
                for s in self.scratch[..filled_samples].iter_mut() {
                    *s *= lane.gain;
                }
            }
            for s in 0..filled_samples {
                output[s] += self.scratch[s];
            }

            // The envelope tracks wall-clock blocks, not filled frames: a
            // starved cue keeps fading through its silence.
            let mut envelope_completed_to_silence = false;
            if let Some(env) = lane.envelope.as_mut() {
                env.advance(frames as u64);
                if env.is_complete() {
                    if env.completes_to_silence() {
                        envelope_completed_to_silence = true;
                    } else {
                        // Steady gain reached; FadingIn becomes Running.
                        lane.envelope = None;
                        lane.state = LaneState::Running;
                    }
                }
            }

            if telemetry_enabled {
                let (rms, peak) = levels_over(&self.scratch[..filled_samples]);
                push_event(
                    &mut self.events,
                    &mut self.rtlog,
                    MixerEvent::Levels {
                        cue_id: lane.cue_id.clone(),
                        rms,
                        peak,
                    },
                );
                push_event(
                    &mut self.events,
                    &mut self.rtlog,
                    MixerEvent::Time {
                        cue_id: lane.cue_id.clone(),
                        samples_consumed: lane.consumer.samples_consumed(),
                    },
                );
            }

            if envelope_completed_to_silence {
                lane.state = LaneState::Ending;
                lane.finish_reason = MixerFinishReason::FadeComplete;
                // The decoder may still be producing (looping cue, long
                // file); tell the pool the job is done. A replaced lane's
                // old job was already stopped upstream, and a DecodeStop
                // here would hit the successor job for the same id.
                if !lane.replaced {
                    let _ = self.pool_tx.try_send(PoolCommand::DecodeStop {
                        cue_id: lane.cue_id.clone(),
                    });
                }
                continue;
            }

            // Natural completion: nothing filled, producer done, ring empty.
            if lane.consumer.finished_pending() {
                lane.state = LaneState::Ending;
                lane.finish_reason = if lane.stuck {
                    MixerFinishReason::TimeoutStuckDecode
                } else {
                    MixerFinishReason::EofNatural
                };
                continue;
            }

            // Stuck-decode watchdog. Rings that never received PCM are
            // exempt: a new cue is not timed out before its first chunk.
            if !lane.stuck
                && lane.consumer.request_pending()
                && lane.consumer.buffered_frames() == 0
            {
                if let (Some(request_age), Some(pcm_age)) = (
                    lane.consumer.request_age(now),
                    lane.consumer.pcm_age(now),
                ) {
                    let timeout = self.config.stuck_timeout();
                    if request_age > timeout && pcm_age > timeout {
                        lane.stuck = true;
                        lane.consumer.force_eof();
                        self.rtlog.push(RtRecord::StuckDecodeTimeout {
                            cue_id: lane.cue_id.clone(),
                            silent_ms: pcm_age.as_millis() as u64,
                        });
                        continue;
                    }
                }
            }

            // Credit issuance below the low-water mark.
            if !lane.consumer.eof()
                && !lane.consumer.request_pending()
                && lane.consumer.buffered_frames() < marks.low_water
            {
                lane.consumer.begin_credit_request();
                let request = PoolCommand::BufferRequest {
                    cue_id: lane.cue_id.clone(),
                    frames: marks.credit,
                };
                if self.pool_tx.try_send(request).is_err() {
                    lane.consumer.cancel_credit_request();
                }
            }
        }

        // Master volume, then master telemetry over the final block.
        if (self.master_volume - 1.0).abs() > f32::EPSILON {
            for s in output[..samples].iter_mut() {
                *s *= self.master_volume;
            }
        }
        if telemetry_enabled && !self.lanes.is_empty() {
            let (rms, peak) = levels_over(&output[..samples]);
            push_event(
                &mut self.events,
                &mut self.rtlog,
                MixerEvent::MasterLevels { rms, peak },
            );
        }
    }

    /// Emit Finished for lanes that ended last callback and drop them
    fn retire_ending_lanes(&mut self) {
        self.retired.clear();
        for (id, lane) in self.lanes.iter() {
            if lane.state == LaneState::Ending {
                self.retired.push(id.clone());
            }
        }
        // Split borrow: retired ids were collected above.
        let retired = std::mem::take(&mut self.retired);
        for id in retired.iter() {
            if let Some(lane) = self.lanes.remove(id) {
                // A replaced lane's finished event was already emitted for
                // the old instance upstream; emitting another here would
                // tear down the successor's bookkeeping.
                if !lane.replaced {
                    push_event(
                        &mut self.events,
                        &mut self.rtlog,
                        MixerEvent::Finished {
                            cue_id: lane.cue_id,
                            reason: lane.finish_reason,
                        },
                    );
                }
            }
            // The parked replacement takes the slot the old lane vacated.
            if let Some(pending) = self.pending_starts.remove(id) {
                self.install_lane(
                    id.clone(),
                    pending.consumer,
                    pending.gain,
                    pending.fade_in_frames,
                );
            }
        }
        self.retired = retired;
    }

    /// Drain a bounded drip of orchestrator commands
    fn apply_command_drip(&mut self) {
        for _ in 0..MAX_COMMANDS_PER_CALLBACK {
            match self.inbox.try_pop() {
                Some(command) => self.apply_command(command),
                None => break,
            }
        }
    }

    fn apply_command(&mut self, command: MixerCommand) {
        match command {
            MixerCommand::StartCue {
                cue_id,
                consumer,
                gain,
                fade_in_frames,
            } => {
                if let Some(existing) = self.lanes.get_mut(&cue_id) {
                    if !existing.consumer.is_reusable() {
                        // Live replay: the old lane leaves through the same
                        // cut-and-retire path a zero-duration stop takes,
                        // and the new start waits one block for its slot.
                        let start = existing
                            .envelope
                            .as_ref()
                            .map(|e| e.current_gain())
                            .unwrap_or(1.0);
                        existing.envelope =
                            Some(Envelope::new(start, 0.0, 0, FadeCurve::Linear));
                        existing.state = LaneState::Fading;
                        existing.replaced = true;
                        self.rtlog.push(RtRecord::LaneReplaced {
                            cue_id: cue_id.clone(),
                        });
                        self.pending_starts.insert(
                            cue_id,
                            PendingStart {
                                consumer,
                                gain,
                                fade_in_frames,
                            },
                        );
                        return;
                    }
                }
                self.install_lane(cue_id, consumer, gain, fade_in_frames);
            }

            MixerCommand::StopCue {
                cue_id,
                fade_out_frames,
            } => {
                // A stop landing while a same-id replacement is parked
                // covers both generations: drop the parked start and let
                // this lane's teardown account for the cue.
                let had_pending = self.pending_starts.remove(&cue_id).is_some();
                let Some(lane) = self.lanes.get_mut(&cue_id) else {
                    self.rtlog.push(RtRecord::UnknownCue { cue_id });
                    return;
                };
                if had_pending {
                    lane.replaced = false;
                }
                let start = lane
                    .envelope
                    .as_ref()
                    .map(|e| e.current_gain())
                    .unwrap_or(1.0);
                lane.envelope = Some(Envelope::new(
                    start,
                    0.0,
                    fade_out_frames,
                    FadeCurve::Linear,
                ));
                lane.state = LaneState::Fading;
            }

            MixerCommand::FadeTo {
                cue_id,
                target,
                duration_frames,
                curve,
            } => {
                let to_silence = target <= 0.0;
                // Same coverage rule as StopCue for fades to silence.
                let had_pending =
                    to_silence && self.pending_starts.remove(&cue_id).is_some();
                let Some(lane) = self.lanes.get_mut(&cue_id) else {
                    self.rtlog.push(RtRecord::UnknownCue { cue_id });
                    return;
                };
                if had_pending {
                    lane.replaced = false;
                }
                let start = lane
                    .envelope
                    .as_ref()
                    .map(|e| e.current_gain())
                    .unwrap_or(1.0);
                lane.envelope = Some(Envelope::new(start, target, duration_frames, curve));
                lane.state = if to_silence {
                    LaneState::Fading
                } else {
                    LaneState::Running
                };
            }

            MixerCommand::SetGain { cue_id, gain } => {
                let Some(lane) = self.lanes.get_mut(&cue_id) else {
                    self.rtlog.push(RtRecord::UnknownCue { cue_id });
                    return;
                };
                lane.gain = gain;
            }

            MixerCommand::SetMasterVolume { volume } => {
                self.master_volume = volume.clamp(0.0, 1.0);
            }
        }
    }

    fn install_lane(
        &mut self,
        cue_id: CueId,
        consumer: RingConsumer,
        gain: f32,
        fade_in_frames: u64,
    ) {
        let envelope = if fade_in_frames > 0 {
            Some(Envelope::new(0.0, 1.0, fade_in_frames, FadeCurve::Linear))
        } else {
            None
        };
        let state = if envelope.is_some() {
            LaneState::FadingIn
        } else {
            LaneState::Running
        };
        self.lanes.insert(
            cue_id.clone(),
            Lane {
                cue_id,
                consumer,
                gain,
                envelope,
                state,
                stuck: false,
                replaced: false,
                finish_reason: MixerFinishReason::EofNatural,
            },
        );
    }
}

/// Non-blocking event push; queue-full means the event is dropped
fn push_event(
    events: &mut HeapProd<MixerEvent>,
    rtlog: &mut RtLogProducer,
    event: MixerEvent,
) {
    if events.try_push(event).is_err() {
        rtlog.push(RtRecord::EventDropped);
    }
}

/// RMS and peak (linear) over an interleaved sample slice
fn levels_over(samples: &[f32]) -> (f32, f32) {
    if samples.is_empty() {
        return (0.0, 0.0);
    }
    let mut sum_sq = 0.0f64;
    let mut peak = 0.0f32;
    for &s in samples {
        sum_sq += (s as f64) * (s as f64);
        let a = s.abs();
        if a > peak {
            peak = a;
        }
    }
    let rms = (sum_sq / samples.len() as f64).sqrt() as f32;
    (rms, peak)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::envelope::FadeCurve;
    use crate::playback::ring::{ring_pair, PcmChunk, RingProducer};
    use crate::playback::rtlog::rtlog_pair;
    use ringbuf::HeapRb;
    use std::sync::Arc;

    struct Harness {
        mixer: OutputMixer,
        inbox_tx: HeapProd<MixerCommand>,
        events_rx: HeapCons<MixerEvent>,
        pool_rx: flume::Receiver<PoolCommand>,
    }

    fn harness(config: EngineConfig) -> Harness {
        let (inbox_tx, inbox_rx) = HeapRb::<MixerCommand>::new(256).split();
        let (events_tx, events_rx) = HeapRb::<MixerEvent>::new(1024).split();
        let (pool_tx, pool_rx) = flume::bounded(1024);
        let (rtlog_tx, _rtlog_rx) = rtlog_pair();
        Harness {
            mixer: OutputMixer::new(config, inbox_rx, events_tx, pool_tx, rtlog_tx),
            inbox_tx,
            events_rx,
            pool_rx,
        }
    }

    fn small_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.block_frames = 64;
        config.channels = 2;
        config
    }

    fn start_lane(h: &mut Harness, id: &str, gain: f32, fade_in: u64) -> RingProducer {
        let (prod, cons) = ring_pair(2);
        h.inbox_tx
            .try_push(MixerCommand::StartCue {
                cue_id: Arc::from(id),
                consumer: cons,
                gain,
                fade_in_frames: fade_in,
            })
            .ok()
            .unwrap();
        prod
    }

    fn chunk(frames: usize, value: f32) -> PcmChunk {
        PcmChunk {
            samples: vec![value; frames * 2],
            is_loop_restart: false,
            eof: false,
        }
    }

    fn drain_events(h: &mut Harness) -> Vec<MixerEvent> {
        let mut out = Vec::new();
        while let Some(e) = h.events_rx.try_pop() {
            out.push(e);
        }
        out
    }

    #[test]
    fn test_silence_with_no_lanes() {
        let mut h = harness(small_config());
        let mut out = vec![1.0f32; 64 * 2];
        h.mixer.process(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));
        assert!(drain_events(&mut h).is_empty());
    }

    #[test]
    fn test_single_lane_mixes_with_gain() {
        let mut h = harness(small_config());
        let mut prod = start_lane(&mut h, "a", 0.5, 0);
        prod.push(chunk(64, 0.8)).unwrap();

        let mut out = vec![0.0f32; 64 * 2];
        h.mixer.process(&mut out);
        assert!((out[0] - 0.4).abs() < 1e-6);
        assert_eq!(h.mixer.lane_count(), 1);
    }

    #[test]
    fn test_two_lanes_sum() {
        let mut h = harness(small_config());
        let mut p1 = start_lane(&mut h, "a", 1.0, 0);
        let mut p2 = start_lane(&mut h, "b", 1.0, 0);
        p1.push(chunk(64, 0.25)).unwrap();
        p2.push(chunk(64, 0.5)).unwrap();

        let mut out = vec![0.0f32; 64 * 2];
        h.mixer.process(&mut out);
        assert!((out[10] - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_underrun_pads_with_silence() {
        let mut h = harness(small_config());
        let mut prod = start_lane(&mut h, "a", 1.0, 0);
        prod.push(chunk(10, 1.0)).unwrap();

        let mut out = vec![9.0f32; 64 * 2];
        h.mixer.process(&mut out);
        assert_eq!(out[0], 1.0);
        assert_eq!(out[10 * 2], 0.0);
        assert_eq!(out[63 * 2 + 1], 0.0);
    }

    #[test]
    fn test_fade_in_ramps_from_zero() {
        let mut h = harness(small_config());
        let mut prod = start_lane(&mut h, "a", 1.0, 64);
        prod.push(chunk(64, 1.0)).unwrap();

        let mut out = vec![0.0f32; 64 * 2];
        h.mixer.process(&mut out);
        assert!(out[0] < 0.05, "start of fade-in should be near zero");
        assert!(out[63 * 2] > 0.9, "end of fade-in block should be near one");
    }

    #[test]
    fn test_eof_finishes_and_emits_once() {
        let mut h = harness(small_config());
        let mut prod = start_lane(&mut h, "a", 1.0, 0);
        prod.push(PcmChunk {
            samples: vec![0.1; 32 * 2],
            is_loop_restart: false,
            eof: true,
        })
        .unwrap();

        let mut out = vec![0.0f32; 64 * 2];
        // Block 1: drains the tail, marks Ending.
        h.mixer.process(&mut out);
        assert_eq!(h.mixer.lane_count(), 1);
        // Block 2: retires the lane and emits Finished.
        h.mixer.process(&mut out);
        assert_eq!(h.mixer.lane_count(), 0);

        let finished: Vec<_> = drain_events(&mut h)
            .into_iter()
            .filter(|e| matches!(e, MixerEvent::Finished { .. }))
            .collect();
        assert_eq!(finished.len(), 1);
        match &finished[0] {
            MixerEvent::Finished { cue_id, reason } => {
                assert_eq!(cue_id.as_ref(), "a");
                assert_eq!(*reason, MixerFinishReason::EofNatural);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_stop_cue_fades_to_removal() {
        let mut h = harness(small_config());
        let mut prod = start_lane(&mut h, "a", 1.0, 0);
        for _ in 0..4 {
            prod.push(chunk(64, 0.5)).unwrap();
        }
        let mut out = vec![0.0f32; 64 * 2];
        h.mixer.process(&mut out);

        h.inbox_tx
            .try_push(MixerCommand::StopCue {
                cue_id: Arc::from("a"),
                fade_out_frames: 64,
            })
            .ok()
            .unwrap();
        h.mixer.process(&mut out); // fade plays out across this block
        assert!(out[0] > out[63 * 2], "fade-out should decrease within the block");
        h.mixer.process(&mut out); // retire + Finished

        let finished: Vec<_> = drain_events(&mut h)
            .into_iter()
            .filter(|e| matches!(e, MixerEvent::Finished { .. }))
            .collect();
        assert_eq!(finished.len(), 1);
        match &finished[0] {
            MixerEvent::Finished { reason, .. } => {
                assert_eq!(*reason, MixerFinishReason::FadeComplete)
            }
            _ => unreachable!(),
        }

        // The pool was told to stop the job.
        let stops: Vec<_> = h
            .pool_rx
            .try_iter()
            .filter(|c| matches!(c, PoolCommand::DecodeStop { .. }))
            .collect();
        assert_eq!(stops.len(), 1);
    }

    #[test]
    fn test_zero_duration_stop_is_immediate() {
        let mut h = harness(small_config());
        let mut prod = start_lane(&mut h, "a", 1.0, 0);
        prod.push(chunk(64, 0.5)).unwrap();
        let mut out = vec![0.0f32; 64 * 2];
        h.mixer.process(&mut out);

        h.inbox_tx
            .try_push(MixerCommand::StopCue {
                cue_id: Arc::from("a"),
                fade_out_frames: 0,
            })
            .ok()
            .unwrap();
        h.mixer.process(&mut out);
        h.mixer.process(&mut out);
        assert_eq!(h.mixer.lane_count(), 0);
    }

    #[test]
    fn test_fade_replacement_starts_at_instantaneous_gain() {
        let mut h = harness(small_config());
        let mut prod = start_lane(&mut h, "a", 1.0, 0);
        for _ in 0..4 {
            prod.push(chunk(64, 1.0)).unwrap();
        }
        // Long fade to silence...
        h.inbox_tx
            .try_push(MixerCommand::FadeTo {
                cue_id: Arc::from("a"),
                target: 0.0,
                duration_frames: 128,
                curve: FadeCurve::Linear,
            })
            .ok()
            .unwrap();
        let mut out = vec![0.0f32; 64 * 2];
        h.mixer.process(&mut out);

        // ...replaced mid-flight by a fade back up. The replacement starts
        // from ~0.5, not from zero or one.
        h.inbox_tx
            .try_push(MixerCommand::FadeTo {
                cue_id: Arc::from("a"),
                target: 1.0,
                duration_frames: 128,
                curve: FadeCurve::Linear,
            })
            .ok()
            .unwrap();
        h.mixer.process(&mut out);
        assert!(
            (out[0] - 0.5).abs() < 0.05,
            "replacement fade should start near 0.5, got {}",
            out[0]
        );
    }

    #[test]
    fn test_update_gain_applies_next_block() {
        let mut h = harness(small_config());
        let mut prod = start_lane(&mut h, "a", 1.0, 0);
        prod.push(chunk(64, 0.5)).unwrap();
        prod.push(chunk(64, 0.5)).unwrap();

        let mut out = vec![0.0f32; 64 * 2];
        h.mixer.process(&mut out);
        assert!((out[0] - 0.5).abs() < 1e-6);

        h.inbox_tx
            .try_push(MixerCommand::SetGain {
                cue_id: Arc::from("a"),
                gain: 0.1,
            })
            .ok()
            .unwrap();
        h.mixer.process(&mut out);
        assert!((out[0] - 0.05).abs() < 1e-6);
    }

    #[test]
    fn test_telemetry_emitted_below_threshold() {
        let mut h = harness(small_config());
        let mut prod = start_lane(&mut h, "a", 1.0, 0);
        prod.push(chunk(64, 0.5)).unwrap();
        let mut out = vec![0.0f32; 64 * 2];
        h.mixer.process(&mut out);

        let events = drain_events(&mut h);
        assert!(events
            .iter()
            .any(|e| matches!(e, MixerEvent::Levels { .. })));
        assert!(events.iter().any(|e| matches!(e, MixerEvent::Time { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, MixerEvent::MasterLevels { .. })));
    }

    #[test]
    fn test_telemetry_skipped_above_envelope_threshold() {
        let mut config = small_config();
        config.telemetry_skip_threshold = 2;
        let mut h = harness(config);

        let mut prods = Vec::new();
        for i in 0..3 {
            // Long fade-ins keep three envelopes active.
            let mut p = start_lane(&mut h, &format!("cue{}", i), 1.0, 10_000);
            p.push(chunk(64, 0.5)).unwrap();
            prods.push(p);
        }
        let mut out = vec![0.0f32; 64 * 2];
        h.mixer.process(&mut out);

        let events = drain_events(&mut h);
        assert!(
            !events.iter().any(|e| matches!(
                e,
                MixerEvent::Levels { .. } | MixerEvent::Time { .. } | MixerEvent::MasterLevels { .. }
            )),
            "telemetry must be skipped entirely when envelopes exceed the threshold"
        );
    }

    #[test]
    fn test_credit_requested_below_low_water() {
        let mut h = harness(small_config());
        let _prod = start_lane(&mut h, "a", 1.0, 0);
        let mut out = vec![0.0f32; 64 * 2];
        h.mixer.process(&mut out);

        let requests: Vec<_> = h
            .pool_rx
            .try_iter()
            .filter_map(|c| match c {
                PoolCommand::BufferRequest { cue_id, frames } => Some((cue_id, frames)),
                _ => None,
            })
            .collect();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0.as_ref(), "a");
        // Normal (non-burst) credit: one block.
        assert_eq!(requests[0].1, 64);
    }

    #[test]
    fn test_no_duplicate_credit_while_pending() {
        let mut h = harness(small_config());
        let _prod = start_lane(&mut h, "a", 1.0, 0);
        let mut out = vec![0.0f32; 64 * 2];
        h.mixer.process(&mut out);
        h.mixer.process(&mut out);
        h.mixer.process(&mut out);

        let requests = h
            .pool_rx
            .try_iter()
            .filter(|c| matches!(c, PoolCommand::BufferRequest { .. }))
            .count();
        assert_eq!(requests, 1, "request_pending must suppress re-requests");
    }

    #[test]
    fn test_burst_scales_credit() {
        let mut config = small_config();
        config.burst_threshold = 2;
        let mut h = harness(config);
        let _p1 = start_lane(&mut h, "a", 1.0, 0);
        let _p2 = start_lane(&mut h, "b", 1.0, 0);
        let _p3 = start_lane(&mut h, "c", 1.0, 0);

        let mut out = vec![0.0f32; 64 * 2];
        h.mixer.process(&mut out);
        let frames: Vec<_> = h
            .pool_rx
            .try_iter()
            .filter_map(|c| match c {
                PoolCommand::BufferRequest { frames, .. } => Some(frames),
                _ => None,
            })
            .collect();
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|&f| f == 64 * 12));
    }

    #[test]
    fn test_loop_restart_forwarded() {
        let mut h = harness(small_config());
        let mut prod = start_lane(&mut h, "a", 1.0, 0);
        prod.push(chunk(32, 0.5)).unwrap();
        prod.push(PcmChunk {
            samples: vec![0.5; 32 * 2],
            is_loop_restart: true,
            eof: false,
        })
        .unwrap();

        let mut out = vec![0.0f32; 64 * 2];
        h.mixer.process(&mut out);
        let restarts = drain_events(&mut h)
            .into_iter()
            .filter(|e| matches!(e, MixerEvent::LoopRestarted { .. }))
            .count();
        assert_eq!(restarts, 1);
    }

    #[test]
    fn test_master_volume_scales_output() {
        let mut h = harness(small_config());
        let mut prod = start_lane(&mut h, "a", 1.0, 0);
        prod.push(chunk(64, 0.8)).unwrap();
        h.inbox_tx
            .try_push(MixerCommand::SetMasterVolume { volume: 0.25 })
            .ok()
            .unwrap();

        let mut out = vec![0.0f32; 64 * 2];
        h.mixer.process(&mut out);
        assert!((out[0] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_new_cue_never_times_out_before_first_pcm() {
        let mut config = small_config();
        config.stuck_timeout_ms = 0; // any age exceeds the timeout
        let mut h = harness(config);
        let _prod = start_lane(&mut h, "a", 1.0, 0);

        let mut out = vec![0.0f32; 64 * 2];
        // First block issues the credit request; several more give the
        // watchdog every chance to misfire.
        for _ in 0..5 {
            h.mixer.process(&mut out);
        }
        assert_eq!(h.mixer.lane_count(), 1, "lane must survive with no PCM yet");
        assert!(!drain_events(&mut h)
            .iter()
            .any(|e| matches!(e, MixerEvent::Finished { .. })));
    }

    #[test]
    fn test_stuck_after_first_pcm_times_out() {
        let mut config = small_config();
        config.stuck_timeout_ms = 0;
        let mut h = harness(config);
        let mut prod = start_lane(&mut h, "a", 1.0, 0);
        prod.push(chunk(8, 0.5)).unwrap();

        let mut out = vec![0.0f32; 64 * 2];
        // Block 1: drains the only chunk, issues credit.
        h.mixer.process(&mut out);
        // Block 2: empty + pending + stale => watchdog forces EOF.
        std::thread::sleep(std::time::Duration::from_millis(2));
        h.mixer.process(&mut out);
        // Block 3: finished_pending observed, lane ends.
        h.mixer.process(&mut out);
        // Block 4: retirement.
        h.mixer.process(&mut out);

        let finished: Vec<_> = drain_events(&mut h)
            .into_iter()
            .filter_map(|e| match e {
                MixerEvent::Finished { reason, .. } => Some(reason),
                _ => None,
            })
            .collect();
        assert_eq!(finished, vec![MixerFinishReason::TimeoutStuckDecode]);
    }

    #[test]
    fn test_restart_live_cue_goes_through_removal_path() {
        let mut h = harness(small_config());
        let mut old_prod = start_lane(&mut h, "a", 1.0, 0);
        for _ in 0..4 {
            old_prod.push(chunk(64, 0.5)).unwrap();
        }
        let mut out = vec![0.0f32; 64 * 2];
        h.mixer.process(&mut out);
        assert!((out[0] - 0.5).abs() < 1e-6);

        // Replay the id with a fresh ring carrying a different signal.
        let mut new_prod = start_lane(&mut h, "a", 1.0, 0);
        new_prod.push(chunk(64, 0.25)).unwrap();

        // The old lane is cut, not overwritten: it plays out this block as
        // silence and keeps its slot until it retires.
        h.mixer.process(&mut out);
        assert!(
            out.iter().all(|&s| s == 0.0),
            "replaced lane must not sound past the cut"
        );
        assert_eq!(h.mixer.lane_count(), 1);

        // Next block: old lane retired, replacement installed and audible.
        h.mixer.process(&mut out);
        assert_eq!(h.mixer.lane_count(), 1);
        assert!(
            (out[0] - 0.25).abs() < 1e-6,
            "replacement plays once the old lane retires, got {}",
            out[0]
        );

        // The old job was stopped upstream and its finished event already
        // emitted there: the mixer adds neither a DecodeStop nor a
        // Finished of its own.
        assert!(!h
            .pool_rx
            .try_iter()
            .any(|c| matches!(c, PoolCommand::DecodeStop { .. })));
        assert!(!drain_events(&mut h)
            .iter()
            .any(|e| matches!(e, MixerEvent::Finished { .. })));
    }

    #[test]
    fn test_stop_covers_parked_replacement() {
        let mut h = harness(small_config());
        let mut old_prod = start_lane(&mut h, "a", 1.0, 0);
        // Enough buffered audio that the old ring is not reusable when the
        // replay lands, forcing the parked-replacement path.
        for _ in 0..3 {
            old_prod.push(chunk(64, 0.5)).unwrap();
        }
        let mut out = vec![0.0f32; 64 * 2];
        h.mixer.process(&mut out);

        // Replay, then stop before the replacement leaves the parking slot.
        let _new_prod = start_lane(&mut h, "a", 1.0, 0);
        h.inbox_tx
            .try_push(MixerCommand::StopCue {
                cue_id: Arc::from("a"),
                fade_out_frames: 0,
            })
            .ok()
            .unwrap();

        h.mixer.process(&mut out); // cut + park, then the stop drops the park
        h.mixer.process(&mut out); // retire
        assert_eq!(h.mixer.lane_count(), 0);
        h.mixer.process(&mut out);
        assert_eq!(
            h.mixer.lane_count(),
            0,
            "no parked lane may resurrect after a stop"
        );

        // The stop accounts for exactly one teardown.
        let finished = drain_events(&mut h)
            .into_iter()
            .filter(|e| matches!(e, MixerEvent::Finished { .. }))
            .count();
        assert_eq!(finished, 1);
    }

    #[test]
    fn test_levels_over_known_signal() {
        let samples = vec![0.5f32, -0.5, 0.5, -0.5];
        let (rms, peak) = levels_over(&samples);
        assert!((rms - 0.5).abs() < 1e-6);
        assert!((peak - 0.5).abs() < 1e-6);
    }
}
