//! Cue model and removal reasons
//!
//! A `Cue` is one playback instance of a source file with trim, gain, fade,
//! and loop parameters. It is immutable after creation except for
//! `stopped_at` and `removal_reason`, which are written exactly once when
//! the cue terminates.

use crate::commands::PlayCueCommand;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Why a cue left the engine
///
/// This is a closed set; `DecodeError` carries the failure message in its
/// `decode_error:<message>` string form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum RemovalReason {
    /// Non-looping cue played to its end
    EofNatural,
    /// StopCueCommand
    ManualStop,
    /// FadeCueCommand to silence
    ManualFade,
    /// Faded because a new non-layered cue started
    AutoFade,
    /// A fade envelope completed at silence
    FadeComplete,
    /// The source file could not be decoded
    DecodeError(String),
    /// Stuck-decode watchdog fired
    TimeoutStuckDecode,
    /// Refade watchdog gave up and forcibly removed the cue
    ForcedStuckFade,
}

impl RemovalReason {
    /// Canonical string form
    pub fn as_string(&self) -> String {
        match self {
            RemovalReason::EofNatural => "eof_natural".to_string(),
            RemovalReason::ManualStop => "manual_stop".to_string(),
            RemovalReason::ManualFade => "manual_fade".to_string(),
            RemovalReason::AutoFade => "auto_fade".to_string(),
            RemovalReason::FadeComplete => "fade_complete".to_string(),
            RemovalReason::DecodeError(msg) => format!("decode_error:{}", msg),
            RemovalReason::TimeoutStuckDecode => "timeout_stuck_decode".to_string(),
            RemovalReason::ForcedStuckFade => "forced_stuck_fade".to_string(),
        }
    }
}

impl std::fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_string())
    }
}

impl From<RemovalReason> for String {
    fn from(reason: RemovalReason) -> Self {
        reason.as_string()
    }
}

impl TryFrom<String> for RemovalReason {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "eof_natural" => Ok(RemovalReason::EofNatural),
            "manual_stop" => Ok(RemovalReason::ManualStop),
            "manual_fade" => Ok(RemovalReason::ManualFade),
            "auto_fade" => Ok(RemovalReason::AutoFade),
            "fade_complete" => Ok(RemovalReason::FadeComplete),
            "timeout_stuck_decode" => Ok(RemovalReason::TimeoutStuckDecode),
            "forced_stuck_fade" => Ok(RemovalReason::ForcedStuckFade),
            other => match other.strip_prefix("decode_error:") {
                Some(msg) => Ok(RemovalReason::DecodeError(msg.to_string())),
                None => Err(format!("unknown removal reason: {}", other)),
            },
        }
    }
}

/// One playback instance of a source file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cue {
    /// Opaque caller-supplied identity
    pub cue_id: String,

    /// Source file
    pub file_path: PathBuf,

    /// Trim window start, in frames at the engine sample rate
    pub in_frame: u64,

    /// Trim window end (exclusive); None = end of file
    pub out_frame: Option<u64>,

    /// Mix gain in dB, applied after the fade envelope
    pub gain_db: f32,

    /// Fade-in duration in milliseconds (0 = hard start)
    pub fade_in_ms: u64,

    /// Fade-out duration in milliseconds (0 = hard cut)
    pub fade_out_ms: u64,

    /// Seek back to `in_frame` at the trim boundary instead of finishing
    pub loop_enabled: bool,

    /// When playback started
    pub started_at: DateTime<Utc>,

    /// When the cue terminated (written exactly once)
    pub stopped_at: Option<DateTime<Utc>>,

    /// Why the cue terminated (written exactly once)
    pub removal_reason: Option<RemovalReason>,
}

impl Cue {
    /// Build a live cue from a play command
    pub fn from_command(cmd: &PlayCueCommand, started_at: DateTime<Utc>) -> Self {
        Self {
            cue_id: cmd.cue_id.clone(),
            file_path: cmd.file_path.clone(),
            in_frame: cmd.in_frame,
            out_frame: cmd.out_frame,
            gain_db: cmd.gain_db,
            fade_in_ms: cmd.fade_in_ms,
            fade_out_ms: cmd.fade_out_ms,
            loop_enabled: cmd.loop_enabled,
            started_at,
            stopped_at: None,
            removal_reason: None,
        }
    }

    /// Final immutable snapshot with termination fields set
    pub fn into_finished(mut self, reason: RemovalReason, stopped_at: DateTime<Utc>) -> Self {
        debug_assert!(self.removal_reason.is_none(), "removal_reason written twice");
        self.stopped_at = Some(stopped_at);
        self.removal_reason = Some(reason);
        self
    }

    /// Trim window length in frames, if the end is known
    pub fn trim_frames(&self) -> Option<u64> {
        self.out_frame.map(|out| out.saturating_sub(self.in_frame))
    }
}
