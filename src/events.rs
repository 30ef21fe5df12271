//! Event egress surface
//!
//! Events are tagged variants written to a single channel; any fan-out
//! (per-widget routing, transport encoding) is the consumer's concern.
//! Level and time events are best-effort telemetry, coalesced by the
//! orchestrator to at most 20 Hz per cue and droppable under load.

use crate::engine::cue::{Cue, RemovalReason};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tagged event egress type
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    /// A cue began producing audio
    CueStarted {
        cue: Cue,
        timestamp: DateTime<Utc>,
    },

    /// A cue left the engine; `cue.removal_reason` matches `reason`
    CueFinished {
        cue: Cue,
        reason: RemovalReason,
        timestamp: DateTime<Utc>,
    },

    /// Playhead telemetry
    ///
    /// In trimmed-relative mode `elapsed_seconds` starts at zero and
    /// `remaining_seconds`/`total_seconds` cover the trim window; both are
    /// None when the trim end is unknown (out_frame = end of file).
    CueTime {
        cue_id: String,
        elapsed_seconds: f64,
        remaining_seconds: Option<f64>,
        total_seconds: Option<f64>,
    },

    /// Per-cue level meter telemetry over the last mixed block
    CueLevels {
        cue_id: String,
        rms_db: f32,
        peak_db: f32,
    },

    /// Master bus level telemetry over the last mixed block
    MasterLevels { rms_db: f32, peak_db: f32 },

    /// A decode job failed; a CueFinished with a `decode_error:` reason
    /// follows once the cue's ring drains
    DecodeError {
        cue_id: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl EngineEvent {
    /// Cue id the event concerns, if any
    pub fn cue_id(&self) -> Option<&str> {
        match self {
            EngineEvent::CueStarted { cue, .. } => Some(&cue.cue_id),
            EngineEvent::CueFinished { cue, .. } => Some(&cue.cue_id),
            EngineEvent::CueTime { cue_id, .. } => Some(cue_id),
            EngineEvent::CueLevels { cue_id, .. } => Some(cue_id),
            EngineEvent::MasterLevels { .. } => None,
            EngineEvent::DecodeError { cue_id, .. } => Some(cue_id),
        }
    }

    /// Telemetry events are droppable; lifecycle events are not
    pub fn is_telemetry(&self) -> bool {
        matches!(
            self,
            EngineEvent::CueTime { .. }
                | EngineEvent::CueLevels { .. }
                | EngineEvent::MasterLevels { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tagging() {
        let event = EngineEvent::CueLevels {
            cue_id: "pad".to_string(),
            rms_db: -18.5,
            peak_db: -6.0,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"CueLevels\""));
        assert!(json.contains("\"cue_id\":\"pad\""));
    }

    #[test]
    fn test_telemetry_classification() {
        let levels = EngineEvent::MasterLevels {
            rms_db: -20.0,
            peak_db: -10.0,
        };
        assert!(levels.is_telemetry());
        assert_eq!(levels.cue_id(), None);

        let error = EngineEvent::DecodeError {
            cue_id: "x".to_string(),
            message: "bad header".to_string(),
            timestamp: Utc::now(),
        };
        assert!(!error.is_telemetry());
        assert_eq!(error.cue_id(), Some("x"));
    }
}
