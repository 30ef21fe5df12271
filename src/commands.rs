//! Command ingress surface
//!
//! Commands are tagged variants sent into the orchestrator over the engine's
//! command channel. Commands from a single caller are processed in arrival
//! order; a batch is applied atomically with respect to the orchestrator
//! tick.

use crate::playback::envelope::FadeCurve;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Start playback of a cue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayCueCommand {
    /// Opaque cue identity; one live cue per id
    pub cue_id: String,

    /// Source audio file
    pub file_path: PathBuf,

    /// Trim window start in frames at the engine sample rate
    #[serde(default)]
    pub in_frame: u64,

    /// Trim window end (exclusive); None = end of file
    #[serde(default)]
    pub out_frame: Option<u64>,

    /// Mix gain in dB
    #[serde(default)]
    pub gain_db: f32,

    /// Fade-in duration in milliseconds
    #[serde(default)]
    pub fade_in_ms: u64,

    /// Fade-out duration in milliseconds (used by stop and auto-fade)
    #[serde(default)]
    pub fade_out_ms: u64,

    /// Loop between `in_frame` and `out_frame`
    #[serde(default)]
    pub loop_enabled: bool,

    /// Layer on top of currently playing cues instead of replacing them
    #[serde(default)]
    pub layered: bool,

    /// When not layered, fade out every other active cue
    #[serde(default)]
    pub auto_fade_on_new: bool,
}

/// Stop a cue (fade out over its `fade_out_ms`, or cut if zero)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopCueCommand {
    pub cue_id: String,
}

/// Fade a cue to a target gain over a duration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FadeCueCommand {
    pub cue_id: String,

    /// Target gain in dB; at or below the silence floor this becomes a
    /// fade-to-removal
    pub target_db: f32,

    /// Fade duration in milliseconds
    pub duration_ms: u64,

    /// Ramp shape
    #[serde(default = "default_curve")]
    pub curve: FadeCurve,
}

fn default_curve() -> FadeCurve {
    FadeCurve::Linear
}

/// Partial update of a live cue
///
/// Gain changes take effect by the next callback; trim and loop changes are
/// forwarded to the decoder and apply at the next loop boundary, never
/// mid-iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateCueCommand {
    pub cue_id: String,

    #[serde(default)]
    pub in_frame: Option<u64>,

    /// A new end must be a frame index; an end cannot be cleared back to
    /// end-of-file
    #[serde(default)]
    pub out_frame: Option<u64>,

    #[serde(default)]
    pub gain_db: Option<f32>,

    #[serde(default)]
    pub loop_enabled: Option<bool>,
}

/// A sequence of commands applied without interleaving
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchCommandsCommand {
    pub commands: Vec<EngineCommand>,
}

/// Tagged command ingress type
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineCommand {
    PlayCue(PlayCueCommand),
    StopCue(StopCueCommand),
    FadeCue(FadeCueCommand),
    UpdateCue(UpdateCueCommand),
    Batch(BatchCommandsCommand),
    /// Set the post-mix master volume (0.0 to 1.0)
    SetMasterVolume { volume: f32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_play_command_json_defaults() {
        let json = r#"{
            "type": "PlayCue",
            "cue_id": "pad",
            "file_path": "pads/warm.flac"
        }"#;
        let cmd: EngineCommand = serde_json::from_str(json).unwrap();
        match cmd {
            EngineCommand::PlayCue(play) => {
                assert_eq!(play.cue_id, "pad");
                assert_eq!(play.in_frame, 0);
                assert_eq!(play.out_frame, None);
                assert!(!play.loop_enabled);
                assert!(!play.layered);
                assert!(!play.auto_fade_on_new);
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn test_fade_command_defaults_to_linear() {
        let json = r#"{
            "type": "FadeCue",
            "cue_id": "pad",
            "target_db": -12.0,
            "duration_ms": 400
        }"#;
        let cmd: EngineCommand = serde_json::from_str(json).unwrap();
        match cmd {
            EngineCommand::FadeCue(fade) => assert_eq!(fade.curve, FadeCurve::Linear),
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn test_batch_round_trip() {
        let batch = EngineCommand::Batch(BatchCommandsCommand {
            commands: vec![
                EngineCommand::StopCue(StopCueCommand {
                    cue_id: "a".to_string(),
                }),
                EngineCommand::SetMasterVolume { volume: 0.5 },
            ],
        });
        let json = serde_json::to_string(&batch).unwrap();
        let back: EngineCommand = serde_json::from_str(&json).unwrap();
        match back {
            EngineCommand::Batch(inner) => assert_eq!(inner.commands.len(), 2),
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}
