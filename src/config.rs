//! Engine configuration
//!
//! Every tunable of the audio core lives on `EngineConfig`, which is passed
//! to constructors. There is no process-wide state: two engines with
//! different configurations can coexist in one process.
//!
//! The record can be built in code (`EngineConfig::default()`), loaded from a
//! TOML file, or loaded with field-level defaults for anything the file
//! omits.

use crate::error::{EngineError, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Engine configuration record
///
/// `sample_rate`, `channels` and `block_frames` are fixed for the lifetime of
/// an engine instance; everything else is a policy knob read where it is
/// used.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Output sample rate in Hz (fixed per engine)
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Output channel count (fixed per engine)
    #[serde(default = "default_channels")]
    pub channels: usize,

    /// Frames per output callback block (fixed per engine)
    #[serde(default = "default_block_frames")]
    pub block_frames: usize,

    /// Maximum number of simultaneously decoding jobs
    #[serde(default = "default_max_concurrent_decodings")]
    pub max_concurrent_decodings: usize,

    /// Number of decoder worker threads (default: min(4, cores))
    #[serde(default = "default_pool_workers")]
    pub pool_workers: usize,

    /// Decoder output chunk target, as a multiple of `block_frames`
    #[serde(default = "default_chunk_mult")]
    pub chunk_mult: usize,

    /// Loop pre-seek lookahead window, as a multiple of `block_frames`
    #[serde(default = "default_lookahead_mult")]
    pub lookahead_mult: usize,

    /// Low-water credit trigger, as a multiple of `block_frames`
    #[serde(default = "default_low_water_mult")]
    pub low_water_mult: usize,

    /// Credit grant size, as a multiple of `block_frames`
    #[serde(default = "default_request_mult")]
    pub request_mult: usize,

    /// Credit grant size under burst, as a multiple of `block_frames`
    #[serde(default = "default_burst_request_mult")]
    pub burst_request_mult: usize,

    /// Active-ring count above which burst compensation kicks in
    #[serde(default = "default_burst_threshold")]
    pub burst_threshold: usize,

    /// Active-envelope count above which per-tick telemetry is skipped
    #[serde(default = "default_telemetry_skip_threshold")]
    pub telemetry_skip_threshold: usize,

    /// Cue count above which auto-fade commands are staggered
    #[serde(default = "default_stagger_threshold")]
    pub stagger_threshold: usize,

    /// Stagger delay between fade commands, in milliseconds
    #[serde(default = "default_stagger_delay_ms")]
    pub stagger_delay_ms: u64,

    /// Stuck-decode watchdog timeout, in milliseconds
    #[serde(default = "default_stuck_timeout_ms")]
    pub stuck_timeout_ms: u64,

    /// Extra grace added to a fade's duration before the refade watchdog
    /// considers it overdue, in milliseconds
    #[serde(default = "default_refade_grace_ms")]
    pub refade_grace_ms: u64,

    /// Minimum interval between refade watchdog sweeps, in milliseconds
    #[serde(default = "default_refade_check_interval_ms")]
    pub refade_check_interval_ms: u64,

    /// Refade attempts before a cue is forcibly removed
    #[serde(default = "default_refade_max_attempts")]
    pub refade_max_attempts: u32,

    /// Orchestrator tick period, in milliseconds
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    /// Minimum interval between re-emitted telemetry events per cue,
    /// in milliseconds (50 ms = 20 Hz)
    #[serde(default = "default_telemetry_interval_ms")]
    pub telemetry_interval_ms: u64,

    /// Playhead reporting mode: false = trimmed-relative (elapsed starts at
    /// zero), true = absolute-file (elapsed includes the trim-in offset)
    #[serde(default)]
    pub absolute_time_mode: bool,

    /// Initial master volume (0.0 to 1.0)
    #[serde(default = "default_master_volume")]
    pub master_volume: f32,

    /// Output device name (None = system default)
    #[serde(default)]
    pub device: Option<String>,
}

fn default_sample_rate() -> u32 {
    48_000
}

fn default_channels() -> usize {
    2
}

fn default_block_frames() -> usize {
    2048
}

fn default_max_concurrent_decodings() -> usize {
    6
}

fn default_pool_workers() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cores.min(4)
}

fn default_chunk_mult() -> usize {
    8
}

fn default_lookahead_mult() -> usize {
    4
}

fn default_low_water_mult() -> usize {
    4
}

fn default_request_mult() -> usize {
    1
}

fn default_burst_request_mult() -> usize {
    12
}

fn default_burst_threshold() -> usize {
    8
}

fn default_telemetry_skip_threshold() -> usize {
    6
}

fn default_stagger_threshold() -> usize {
    6
}

fn default_stagger_delay_ms() -> u64 {
    1
}

fn default_stuck_timeout_ms() -> u64 {
    30_000
}

fn default_refade_grace_ms() -> u64 {
    200
}

fn default_refade_check_interval_ms() -> u64 {
    50
}

fn default_refade_max_attempts() -> u32 {
    3
}

fn default_tick_ms() -> u64 {
    5
}

fn default_telemetry_interval_ms() -> u64 {
    50
}

fn default_master_volume() -> f32 {
    1.0
}

impl Default for EngineConfig {
    fn default() -> Self {
        // Round-trip through an empty TOML table so every field picks up its
        // serde default; keeps Default and Deserialize from drifting apart.
        toml::from_str("").expect("empty config deserializes with defaults")
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    ///
    /// Missing fields fall back to their defaults; unknown fields are
    /// ignored.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            EngineError::Config(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let config: EngineConfig = toml::from_str(&text)
            .map_err(|e| EngineError::Config(format!("Failed to parse TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate invariants that defaults satisfy but hand-edited files can
    /// break.
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(EngineError::Config("sample_rate must be non-zero".into()));
        }
        if self.channels == 0 {
            return Err(EngineError::Config("channels must be non-zero".into()));
        }
        if self.block_frames == 0 {
            return Err(EngineError::Config("block_frames must be non-zero".into()));
        }
        if self.pool_workers == 0 {
            return Err(EngineError::Config("pool_workers must be non-zero".into()));
        }
        if self.max_concurrent_decodings == 0 {
            return Err(EngineError::Config(
                "max_concurrent_decodings must be non-zero".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.master_volume) {
            return Err(EngineError::Config(
                "master_volume must be within [0.0, 1.0]".into(),
            ));
        }
        Ok(())
    }

    /// Decoder output chunk target in frames
    pub fn target_chunk_frames(&self) -> usize {
        self.block_frames * self.chunk_mult
    }

    /// Loop pre-seek lookahead window in frames
    pub fn lookahead_frames(&self) -> usize {
        self.block_frames * self.lookahead_mult
    }

    /// Stuck-decode watchdog timeout
    pub fn stuck_timeout(&self) -> Duration {
        Duration::from_millis(self.stuck_timeout_ms)
    }

    /// Orchestrator tick period
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// Duration of one output block
    pub fn block_duration(&self) -> Duration {
        Duration::from_secs_f64(self.block_frames as f64 / self.sample_rate as f64)
    }

    /// Post-seek discard tolerance in frames (10 ms at the engine rate)
    pub fn seek_discard_frames(&self) -> u64 {
        (self.sample_rate / 100) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_engine_constants() {
        let config = EngineConfig::default();
        assert_eq!(config.sample_rate, 48_000);
        assert_eq!(config.channels, 2);
        assert_eq!(config.block_frames, 2048);
        assert_eq!(config.max_concurrent_decodings, 6);
        assert!(config.pool_workers >= 1 && config.pool_workers <= 4);
        assert_eq!(config.target_chunk_frames(), 2048 * 8);
        assert_eq!(config.lookahead_frames(), 2048 * 4);
        assert_eq!(config.burst_threshold, 8);
        assert_eq!(config.telemetry_skip_threshold, 6);
        assert_eq!(config.stagger_threshold, 6);
        assert_eq!(config.refade_max_attempts, 3);
        assert!(!config.absolute_time_mode);
    }

    #[test]
    fn test_seek_discard_is_ten_milliseconds() {
        let config = EngineConfig::default();
        assert_eq!(config.seek_discard_frames(), 480);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
            sample_rate = 44100
            block_frames = 1024
            "#,
        )
        .unwrap();
        assert_eq!(config.sample_rate, 44_100);
        assert_eq!(config.block_frames, 1024);
        assert_eq!(config.channels, 2);
        assert_eq!(config.stuck_timeout_ms, 30_000);
    }

    #[test]
    fn test_validate_rejects_zero_block() {
        let mut config = EngineConfig::default();
        config.block_frames = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_block_duration() {
        let config = EngineConfig::default();
        let expected = 2048.0 / 48_000.0;
        assert!((config.block_duration().as_secs_f64() - expected).abs() < 1e-9);
    }
}
