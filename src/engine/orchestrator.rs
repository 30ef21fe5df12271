//! Engine orchestrator
//!
//! Single-owner registry and command dispatcher on a dedicated thread with
//! a short fixed tick. The orchestrator translates public commands into
//! internal mixer/pool messages, tracks removal-reason intent, runs the
//! refade watchdog, and coalesces mixer telemetry down to the public event
//! rate.
//!
//! Ownership is a DAG: the orchestrator holds channel endpoints to the
//! decoder pool and the mixer; each cue's ring halves are created here and
//! shipped outward, never shared back.

use crate::commands::{
    BatchCommandsCommand, EngineCommand, FadeCueCommand, PlayCueCommand, StopCueCommand,
    UpdateCueCommand,
};
use crate::config::EngineConfig;
use crate::engine::cue::{Cue, RemovalReason};
use crate::events::EngineEvent;
use crate::playback::envelope::{db_to_linear, linear_to_db, FadeCurve, SILENCE_FLOOR_DB};
use crate::playback::messages::{
    CueId, DecodeSpec, MixerCommand, MixerEvent, MixerFinishReason, PoolCommand, PoolEvent,
    TrimUpdate,
};
use crate::playback::ring::{ring_pair, Playhead};
use ringbuf::{traits::*, HeapCons, HeapProd};
use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Per-cue registry entry
struct CueEntry {
    cue: Cue,
    playhead: Playhead,
}

/// Refade bookkeeping for one requested fade-out
struct PendingStop {
    deadline: Instant,
    fade_out_ms: u64,
}

/// Channel endpoints the orchestrator owns
pub struct OrchestratorChannels {
    pub commands: flume::Receiver<EngineCommand>,
    pub events: flume::Sender<EngineEvent>,
    pub mixer_tx: HeapProd<MixerCommand>,
    pub mixer_events: HeapCons<MixerEvent>,
    pub pool_tx: flume::Sender<PoolCommand>,
    pub pool_events: flume::Receiver<PoolEvent>,
}

/// Spawn the orchestrator thread
///
/// The thread exits when the command sender is dropped.
pub fn spawn_orchestrator(
    config: EngineConfig,
    channels: OrchestratorChannels,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("cuedeck-orchestrator".to_string())
        .spawn(move || {
            info!("Orchestrator started");
            Orchestrator::new(config, channels).run();
            info!("Orchestrator stopped");
        })
        .expect("spawn orchestrator thread")
}

struct Orchestrator {
    config: EngineConfig,

    cues: HashMap<CueId, CueEntry>,
    removal_reasons: HashMap<CueId, RemovalReason>,
    fade_requested: HashSet<CueId>,
    pending_stops: HashMap<CueId, PendingStop>,
    refade_attempts: HashMap<CueId, u32>,
    last_refade_check: Instant,

    // Latest-wins telemetry coalescing
    latest_levels: HashMap<CueId, (f32, f32)>,
    latest_time: HashMap<CueId, u64>,
    latest_master: Option<(f32, f32)>,
    last_telemetry_flush: Instant,

    // Commands that did not fit in the mixer inbox, retried each tick
    mixer_backlog: VecDeque<MixerCommand>,

    commands: flume::Receiver<EngineCommand>,
    events: flume::Sender<EngineEvent>,
    mixer_tx: HeapProd<MixerCommand>,
    mixer_events: HeapCons<MixerEvent>,
    pool_tx: flume::Sender<PoolCommand>,
    pool_events: flume::Receiver<PoolEvent>,
}

impl Orchestrator {
    fn new(config: EngineConfig, channels: OrchestratorChannels) -> Self {
        let now = Instant::now();
        Self {
            config,
            cues: HashMap::new(),
            removal_reasons: HashMap::new(),
            fade_requested: HashSet::new(),
            pending_stops: HashMap::new(),
            refade_attempts: HashMap::new(),
            last_refade_check: now,
            latest_levels: HashMap::new(),
            latest_time: HashMap::new(),
            latest_master: None,
            last_telemetry_flush: now,
            mixer_backlog: VecDeque::new(),
            commands: channels.commands,
            events: channels.events,
            mixer_tx: channels.mixer_tx,
            mixer_events: channels.mixer_events,
            pool_tx: channels.pool_tx,
            pool_events: channels.pool_events,
        }
    }

    fn run(mut self) {
        let tick = self.config.tick();
        loop {
            match self.commands.recv_timeout(tick) {
                Ok(command) => {
                    self.handle_command(command);
                    // Arrival order, without letting a burst starve the tick
                    // work below.
                    for _ in 0..64 {
                        match self.commands.try_recv() {
                            Ok(command) => self.handle_command(command),
                            Err(_) => break,
                        }
                    }
                }
                Err(flume::RecvTimeoutError::Timeout) => {}
                Err(flume::RecvTimeoutError::Disconnected) => break,
            }

            self.flush_mixer_backlog();
            // Pool errors first: a decode-error intent must be on record
            // before the mixer's finish observation for the same cue is
            // resolved.
            self.drain_pool_events();
            self.drain_mixer_events();
            self.check_refades(Instant::now());
            self.flush_telemetry(Instant::now());
        }
    }

    // ------------------------------------------------------------------
    // Command handling
    // ------------------------------------------------------------------

    fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::PlayCue(cmd) => self.play_cue(cmd),
            EngineCommand::StopCue(cmd) => self.stop_cue(cmd),
            EngineCommand::FadeCue(cmd) => self.fade_cue(cmd),
            EngineCommand::UpdateCue(cmd) => self.update_cue(cmd),
            EngineCommand::Batch(BatchCommandsCommand { commands }) => {
                // A batch never interleaves with other commands: the whole
                // sequence runs inside this tick.
                for command in commands {
                    self.handle_command(command);
                }
            }
            EngineCommand::SetMasterVolume { volume } => {
                self.send_mixer(MixerCommand::SetMasterVolume { volume });
            }
        }
    }

    fn play_cue(&mut self, cmd: PlayCueCommand) {
        let cue_id: CueId = CueId::from(cmd.cue_id.as_str());

        // One live cue per id: a replay of a live id terminates the old
        // instance first, so every started cue still gets exactly one
        // finished event.
        if self.cues.contains_key(&cue_id) {
            warn!("PlayCue for live cue '{}', replacing", cue_id);
            self.removal_reasons
                .entry(cue_id.clone())
                .or_insert(RemovalReason::ManualStop);
            self.finish_cue(&cue_id, MixerFinishReason::FadeComplete);
            let _ = self.pool_tx.send(PoolCommand::DecodeStop {
                cue_id: cue_id.clone(),
            });
        }

        // Cues to auto-fade: every other active cue, including ones already
        // fading (their envelopes get replaced; duplicate fade commands are
        // accepted).
        let to_fade: Vec<CueId> = if cmd.auto_fade_on_new && !cmd.layered {
            self.cues.keys().cloned().collect()
        } else {
            Vec::new()
        };

        let cue = Cue::from_command(&cmd, Utc::now());

        // Ring halves: producer goes to the decoder pool, consumer to the
        // mixer.
        let (producer, consumer) = ring_pair(self.config.channels);
        let playhead = consumer.playhead();

        let _ = self.pool_tx.send(PoolCommand::DecodeStart {
            spec: DecodeSpec {
                cue_id: cue_id.clone(),
                file_path: cue.file_path.clone(),
                in_frame: cue.in_frame,
                out_frame: cue.out_frame,
                loop_enabled: cue.loop_enabled,
            },
            producer,
        });

        self.send_mixer(MixerCommand::StartCue {
            cue_id: cue_id.clone(),
            consumer,
            gain: db_to_linear(cue.gain_db),
            fade_in_frames: self.ms_to_frames(cue.fade_in_ms),
        });

        self.emit(EngineEvent::CueStarted {
            cue: cue.clone(),
            timestamp: Utc::now(),
        });

        debug!(
            "PlayCue '{}': file={}, trim=[{}, {:?}), loop={}, auto_fade={}",
            cue_id,
            cue.file_path.display(),
            cue.in_frame,
            cue.out_frame,
            cue.loop_enabled,
            to_fade.len()
        );

        self.cues.insert(cue_id, CueEntry { cue, playhead });

        // Auto-fade transition. Above the stagger threshold the commands go
        // out 1 ms apart so a burst cannot saturate the mixer inbox.
        let stagger = to_fade.len() > self.config.stagger_threshold;
        for (i, fade_id) in to_fade.into_iter().enumerate() {
            if stagger && i > 0 {
                std::thread::sleep(Duration::from_millis(self.config.stagger_delay_ms));
            }
            if self.fade_requested.contains(&fade_id) {
                // Duplicate fades are accepted: the new envelope replaces
                // the one in flight.
                debug!("Cue '{}' already fading, re-fading", fade_id);
            }
            self.removal_reasons
                .entry(fade_id.clone())
                .or_insert(RemovalReason::AutoFade);
            self.request_fade_out(&fade_id, FadeCurve::EqualPower);
        }
    }

    fn stop_cue(&mut self, cmd: StopCueCommand) {
        let cue_id: CueId = CueId::from(cmd.cue_id.as_str());
        if !self.cues.contains_key(&cue_id) {
            debug!("StopCue for unknown cue '{}'", cue_id);
            return;
        }
        self.removal_reasons
            .entry(cue_id.clone())
            .or_insert(RemovalReason::ManualStop);

        let fade_out_ms = self.cues[&cue_id].cue.fade_out_ms;
        self.send_mixer(MixerCommand::StopCue {
            cue_id: cue_id.clone(),
            fade_out_frames: self.ms_to_frames(fade_out_ms),
        });
        self.arm_refade_watchdog(cue_id, fade_out_ms);
    }

    fn fade_cue(&mut self, cmd: FadeCueCommand) {
        let cue_id: CueId = CueId::from(cmd.cue_id.as_str());
        if !self.cues.contains_key(&cue_id) {
            debug!("FadeCue for unknown cue '{}'", cue_id);
            return;
        }

        let to_silence = cmd.target_db <= SILENCE_FLOOR_DB;
        if to_silence {
            self.removal_reasons
                .entry(cue_id.clone())
                .or_insert(RemovalReason::ManualFade);
            self.arm_refade_watchdog(cue_id.clone(), cmd.duration_ms);
        }

        self.send_mixer(MixerCommand::FadeTo {
            cue_id,
            target: db_to_linear(cmd.target_db),
            duration_frames: self.ms_to_frames(cmd.duration_ms),
            curve: cmd.curve,
        });
    }

    fn update_cue(&mut self, cmd: UpdateCueCommand) {
        let cue_id: CueId = CueId::from(cmd.cue_id.as_str());
        let Some(entry) = self.cues.get_mut(&cue_id) else {
            debug!("UpdateCue for unknown cue '{}'", cue_id);
            return;
        };

        // Gain takes effect immediately at the mixer.
        if let Some(gain_db) = cmd.gain_db {
            entry.cue.gain_db = gain_db;
            let gain = db_to_linear(gain_db);
            self.send_mixer(MixerCommand::SetGain {
                cue_id: cue_id.clone(),
                gain,
            });
        }

        // Trim and loop changes go to the decoder and land at the next
        // loop boundary.
        let update = TrimUpdate {
            in_frame: cmd.in_frame,
            out_frame: cmd.out_frame,
            loop_enabled: cmd.loop_enabled,
        };
        if !update.is_empty() {
            let entry = self.cues.get_mut(&cue_id).expect("checked above");
            if let Some(in_frame) = update.in_frame {
                entry.cue.in_frame = in_frame;
            }
            if let Some(out_frame) = update.out_frame {
                entry.cue.out_frame = Some(out_frame);
            }
            if let Some(loop_enabled) = update.loop_enabled {
                entry.cue.loop_enabled = loop_enabled;
            }
            let _ = self.pool_tx.send(PoolCommand::UpdateCue { cue_id, update });
        }
    }

    /// Fade a cue to silence over its own fade-out time
    fn request_fade_out(&mut self, cue_id: &CueId, curve: FadeCurve) {
        let Some(entry) = self.cues.get(cue_id) else {
            return;
        };
        let fade_out_ms = entry.cue.fade_out_ms;
        self.send_mixer(MixerCommand::FadeTo {
            cue_id: cue_id.clone(),
            target: 0.0,
            duration_frames: self.ms_to_frames(fade_out_ms),
            curve,
        });
        self.arm_refade_watchdog(cue_id.clone(), fade_out_ms);
    }

    fn arm_refade_watchdog(&mut self, cue_id: CueId, fade_out_ms: u64) {
        let deadline = Instant::now()
            + Duration::from_millis(fade_out_ms + self.config.refade_grace_ms);
        self.fade_requested.insert(cue_id.clone());
        self.pending_stops.insert(
            cue_id,
            PendingStop {
                deadline,
                fade_out_ms,
            },
        );
    }

    // ------------------------------------------------------------------
    // Event ingestion
    // ------------------------------------------------------------------

    fn drain_mixer_events(&mut self) {
        while let Some(event) = self.mixer_events.try_pop() {
            match event {
                MixerEvent::Finished { cue_id, reason } => {
                    self.finish_cue(&cue_id, reason);
                }
                MixerEvent::LoopRestarted { cue_id } => {
                    debug!("Loop restarted for cue '{}'", cue_id);
                }
                MixerEvent::Levels { cue_id, rms, peak } => {
                    self.latest_levels.insert(cue_id, (rms, peak));
                }
                MixerEvent::Time {
                    cue_id,
                    samples_consumed,
                } => {
                    self.latest_time.insert(cue_id, samples_consumed);
                }
                MixerEvent::MasterLevels { rms, peak } => {
                    self.latest_master = Some((rms, peak));
                }
            }
        }
    }

    fn drain_pool_events(&mut self) {
        while let Ok(event) = self.pool_events.try_recv() {
            match event {
                PoolEvent::DecodeError { cue_id, message } => {
                    self.removal_reasons
                        .entry(cue_id.clone())
                        .or_insert(RemovalReason::DecodeError(message.clone()));
                    self.emit(EngineEvent::DecodeError {
                        cue_id: cue_id.to_string(),
                        message,
                        timestamp: Utc::now(),
                    });
                }
            }
        }
    }

    /// Build the final snapshot and clear all per-cue bookkeeping
    ///
    /// Engine intent wins over the mixer's observed reason.
    fn finish_cue(&mut self, cue_id: &CueId, mixer_reason: MixerFinishReason) {
        let Some(entry) = self.cues.remove(cue_id) else {
            // Already removed (forced removal raced the mixer event).
            return;
        };

        let reason = self
            .removal_reasons
            .remove(cue_id)
            .unwrap_or_else(|| match mixer_reason {
                MixerFinishReason::EofNatural => RemovalReason::EofNatural,
                MixerFinishReason::FadeComplete => RemovalReason::FadeComplete,
                MixerFinishReason::TimeoutStuckDecode => RemovalReason::TimeoutStuckDecode,
            });

        self.clear_cue_bookkeeping(cue_id);

        // A timed-out decode job may still be wedged in the pool; tell it
        // to tear down at its next safe point.
        if matches!(reason, RemovalReason::TimeoutStuckDecode) {
            let _ = self.pool_tx.send(PoolCommand::DecodeStop {
                cue_id: cue_id.clone(),
            });
        }

        let snapshot = entry.cue.into_finished(reason.clone(), Utc::now());
        info!("Cue '{}' finished: {}", cue_id, reason);
        self.emit(EngineEvent::CueFinished {
            cue: snapshot,
            reason,
            timestamp: Utc::now(),
        });
    }

    fn clear_cue_bookkeeping(&mut self, cue_id: &CueId) {
        self.fade_requested.remove(cue_id);
        self.pending_stops.remove(cue_id);
        self.refade_attempts.remove(cue_id);
        self.latest_levels.remove(cue_id);
        self.latest_time.remove(cue_id);
    }

    // ------------------------------------------------------------------
    // Watchdogs and telemetry
    // ------------------------------------------------------------------

    /// Refade watchdog: cues past their fade deadline get the fade
    /// re-issued; after the attempt limit they are forcibly removed.
    ///
    /// Must never fire during healthy operation; its firing rate is a
    /// health metric.
    fn check_refades(&mut self, now: Instant) {
        if now.duration_since(self.last_refade_check)
            < Duration::from_millis(self.config.refade_check_interval_ms)
        {
            return;
        }
        self.last_refade_check = now;

        let overdue: Vec<(CueId, u64)> = self
            .pending_stops
            .iter()
            .filter(|(_, stop)| now > stop.deadline)
            .map(|(id, stop)| (id.clone(), stop.fade_out_ms))
            .collect();

        for (cue_id, fade_out_ms) in overdue {
            if !self.cues.contains_key(&cue_id) {
                self.pending_stops.remove(&cue_id);
                continue;
            }
            let attempts = self.refade_attempts.entry(cue_id.clone()).or_insert(0);
            *attempts += 1;

            if *attempts > self.config.refade_max_attempts {
                warn!(
                    "Cue '{}' stuck after {} refade attempts, forcing removal",
                    cue_id,
                    self.config.refade_max_attempts
                );
                self.removal_reasons
                    .insert(cue_id.clone(), RemovalReason::ForcedStuckFade);
                // Cut the lane and the decode job; the eventual mixer
                // Finished event for this lane finds no registry entry.
                self.send_mixer(MixerCommand::StopCue {
                    cue_id: cue_id.clone(),
                    fade_out_frames: 0,
                });
                let _ = self.pool_tx.send(PoolCommand::DecodeStop {
                    cue_id: cue_id.clone(),
                });
                self.finish_cue(&cue_id, MixerFinishReason::FadeComplete);
            } else {
                warn!(
                    "Cue '{}' past fade deadline, re-issuing fade (attempt {})",
                    cue_id, attempts
                );
                let cue_id_clone = cue_id.clone();
                self.send_mixer(MixerCommand::FadeTo {
                    cue_id: cue_id_clone,
                    target: 0.0,
                    duration_frames: self.ms_to_frames(fade_out_ms),
                    curve: FadeCurve::Linear,
                });
                if let Some(stop) = self.pending_stops.get_mut(&cue_id) {
                    stop.deadline = now
                        + Duration::from_millis(fade_out_ms + self.config.refade_grace_ms);
                }
            }
        }
    }

    /// Re-emit coalesced telemetry at the public rate, latest value only
    fn flush_telemetry(&mut self, now: Instant) {
        if now.duration_since(self.last_telemetry_flush)
            < Duration::from_millis(self.config.telemetry_interval_ms)
        {
            return;
        }
        self.last_telemetry_flush = now;

        let levels: Vec<(CueId, (f32, f32))> = self.latest_levels.drain().collect();
        for (cue_id, (rms, peak)) in levels {
            self.emit(EngineEvent::CueLevels {
                cue_id: cue_id.to_string(),
                rms_db: linear_to_db(rms),
                peak_db: linear_to_db(peak),
            });
        }

        let times: Vec<(CueId, u64)> = self.latest_time.drain().collect();
        for (cue_id, samples) in times {
            if let Some(entry) = self.cues.get(&cue_id) {
                let (elapsed, remaining, total) = self.cue_times(&entry.cue, samples);
                self.emit(EngineEvent::CueTime {
                    cue_id: cue_id.to_string(),
                    elapsed_seconds: elapsed,
                    remaining_seconds: remaining,
                    total_seconds: total,
                });
            }
        }

        if let Some((rms, peak)) = self.latest_master.take() {
            self.emit(EngineEvent::MasterLevels {
                rms_db: linear_to_db(rms),
                peak_db: linear_to_db(peak),
            });
        }
    }

    /// Elapsed/remaining/total from `samples_consumed` and the trim window
    ///
    /// Trimmed-relative mode starts elapsed at zero; absolute-file mode
    /// offsets it by the trim-in point.
    fn cue_times(&self, cue: &Cue, samples_consumed: u64) -> (f64, Option<f64>, Option<f64>) {
        let sr = self.config.sample_rate as f64;
        let trim_elapsed = samples_consumed as f64 / sr;

        let total = cue.trim_frames().map(|frames| frames as f64 / sr);
        let remaining = total.map(|t| (t - trim_elapsed).max(0.0));

        let elapsed = if self.config.absolute_time_mode {
            cue.in_frame as f64 / sr + trim_elapsed
        } else {
            trim_elapsed
        };
        (elapsed, remaining, total)
    }

    // ------------------------------------------------------------------
    // Egress plumbing
    // ------------------------------------------------------------------

    fn send_mixer(&mut self, command: MixerCommand) {
        if !self.mixer_backlog.is_empty() {
            self.mixer_backlog.push_back(command);
            return;
        }
        if let Err(command) = self.mixer_tx.try_push(command) {
            self.mixer_backlog.push_back(command);
        }
    }

    fn flush_mixer_backlog(&mut self) {
        while let Some(command) = self.mixer_backlog.pop_front() {
            if let Err(command) = self.mixer_tx.try_push(command) {
                self.mixer_backlog.push_front(command);
                break;
            }
        }
    }

    fn emit(&mut self, event: EngineEvent) {
        let telemetry = event.is_telemetry();
        if let Err(flume::TrySendError::Full(event)) = self.events.try_send(event) {
            if !telemetry {
                // Lifecycle events are worth a bounded wait; telemetry is
                // droppable by contract.
                let _ = self
                    .events
                    .send_timeout(event, Duration::from_millis(50));
            }
        }
    }

    fn ms_to_frames(&self, ms: u64) -> u64 {
        ms * self.config.sample_rate as u64 / 1000
    }
}
