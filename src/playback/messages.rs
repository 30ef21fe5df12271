//! Internal channel payloads between the core's execution contexts
//!
//! The public command/event surface (ms, dB, `String` ids) is translated by
//! the orchestrator into these internal forms (frames, linear gain,
//! interned `Arc<str>` ids) so that handling them on the audio callback
//! never allocates.

use crate::playback::envelope::FadeCurve;
use crate::playback::ring::{RingConsumer, RingProducer};
use std::path::PathBuf;
use std::sync::Arc;

/// Interned cue identity; cloning is a refcount bump
pub type CueId = Arc<str>;

/// Orchestrator → mixer inbox (SPSC, drained as a drip each callback)
pub enum MixerCommand {
    /// Install a lane for a new cue
    StartCue {
        cue_id: CueId,
        consumer: RingConsumer,
        /// Post-envelope mix gain (linear)
        gain: f32,
        /// Fade-in ramp length in frames (0 = hard start)
        fade_in_frames: u64,
    },

    /// Fade the cue to silence and tear it down
    StopCue {
        cue_id: CueId,
        /// Fade-out ramp length in frames (0 = immediate cut)
        fade_out_frames: u64,
    },

    /// Install a new envelope, replacing any prior one; the ramp starts at
    /// the cue's current instantaneous gain
    FadeTo {
        cue_id: CueId,
        /// Target gain (linear; 0.0 arms teardown on completion)
        target: f32,
        duration_frames: u64,
        curve: FadeCurve,
    },

    /// Set the post-envelope mix gain
    SetGain { cue_id: CueId, gain: f32 },

    /// Set the master volume applied to the mixed block
    SetMasterVolume { volume: f32 },
}

/// What the mixer observed when a cue reached its end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixerFinishReason {
    /// Ring drained with EOF set (non-looping cue played out)
    EofNatural,
    /// A fade envelope completed at silence
    FadeComplete,
    /// The stuck-decode watchdog forced the ring closed
    TimeoutStuckDecode,
}

/// Mixer → orchestrator event queue (SPSC, non-blocking push, droppable)
#[derive(Debug, Clone)]
pub enum MixerEvent {
    /// The lane was torn down; the orchestrator resolves the public
    /// removal reason (engine intent wins over this observation)
    Finished {
        cue_id: CueId,
        reason: MixerFinishReason,
    },

    /// A loop-restart chunk boundary was consumed
    LoopRestarted { cue_id: CueId },

    /// Per-cue levels over the filled portion of the last block (linear)
    Levels { cue_id: CueId, rms: f32, peak: f32 },

    /// Playhead position (frames consumed since the ring was created)
    Time { cue_id: CueId, samples_consumed: u64 },

    /// Master bus levels over the last mixed block (linear)
    MasterLevels { rms: f32, peak: f32 },
}

/// Trim/loop fields of an UpdateCue, applied at the next loop boundary
#[derive(Debug, Clone, Copy, Default)]
pub struct TrimUpdate {
    pub in_frame: Option<u64>,
    pub out_frame: Option<u64>,
    pub loop_enabled: Option<bool>,
}

impl TrimUpdate {
    pub fn is_empty(&self) -> bool {
        self.in_frame.is_none() && self.out_frame.is_none() && self.loop_enabled.is_none()
    }
}

/// Job description shipped to the decoder pool
pub struct DecodeSpec {
    pub cue_id: CueId,
    pub file_path: PathBuf,
    pub in_frame: u64,
    pub out_frame: Option<u64>,
    pub loop_enabled: bool,
}

/// Orchestrator/mixer → decoder pool inbox (MPSC)
pub enum PoolCommand {
    /// Begin decoding into the ring; queued FIFO beyond the concurrency cap
    DecodeStart {
        spec: DecodeSpec,
        producer: RingProducer,
    },

    /// Cumulative credit grant for an active job
    BufferRequest { cue_id: CueId, frames: usize },

    /// Tear the job down at its next safe point; cancels a still-pending
    /// start
    DecodeStop { cue_id: CueId },

    /// Buffered trim/loop update, applied at the next loop boundary
    UpdateCue { cue_id: CueId, update: TrimUpdate },

    /// Stop all workers and exit the coordinator
    Shutdown,
}

/// Decoder pool → orchestrator events
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// A job failed; the ring (if any) is left for the mixer to drain
    DecodeError { cue_id: CueId, message: String },
}
