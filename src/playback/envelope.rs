//! Fade envelopes and gain math
//!
//! An `Envelope` is a time-varying linear gain ramp applied to one cue at
//! mix time: from `start` to `target` over `total` frames, shaped by a fade
//! curve. Creating a new envelope replaces any prior one; an envelope whose
//! target is silence arms the cue for teardown when it completes.
//!
//! # Fade Curves
//!
//! - **Linear**: v(t) = t, constant rate of change
//! - **EqualPower**: v(t) = sin(t × π/2), constant perceived loudness

use serde::{Deserialize, Serialize};
use std::f32::consts::FRAC_PI_2;

/// Gain targets at or below this value are treated as silence: the linear
/// gain becomes exactly 0.0 and envelope completion tears the cue down.
pub const SILENCE_FLOOR_DB: f32 = -90.0;

/// Convert decibels to linear gain
///
/// Targets at or below [`SILENCE_FLOOR_DB`] map to exactly 0.0 so that a
/// completed fade-out produces true silence rather than a denormal residue.
pub fn db_to_linear(db: f32) -> f32 {
    if db <= SILENCE_FLOOR_DB {
        0.0
    } else {
        10.0_f32.powf(db / 20.0)
    }
}

/// Convert linear gain to decibels, floored at [`SILENCE_FLOOR_DB`]
///
/// The floor keeps telemetry finite and serializable.
pub fn linear_to_db(linear: f32) -> f32 {
    let floor_linear = 10.0_f32.powf(SILENCE_FLOOR_DB / 20.0);
    if linear <= floor_linear {
        SILENCE_FLOOR_DB
    } else {
        20.0 * linear.log10()
    }
}

/// Fade curve shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FadeCurve {
    /// v(t) = t
    Linear,
    /// v(t) = sin(t × π/2), quarter-sine
    EqualPower,
}

impl FadeCurve {
    /// Curve shape at normalized position t in [0, 1]
    fn shape(self, t: f32) -> f32 {
        let t = t.clamp(0.0, 1.0);
        match self {
            FadeCurve::Linear => t,
            FadeCurve::EqualPower => (t * FRAC_PI_2).sin(),
        }
    }
}

/// Per-cue linear gain ramp
///
/// Gains are linear (not dB) so the per-sample path is a multiply. Progress
/// is counted in frames consumed by the mixer; `advance` is called once per
/// callback with the number of frames actually mixed.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Gain at ramp start (linear)
    start: f32,

    /// Gain at ramp end (linear)
    target: f32,

    /// Ramp length in frames (0 = immediate cut to target)
    total: u64,

    /// Frames already consumed
    done: u64,

    /// Curve shape
    curve: FadeCurve,
}

impl Envelope {
    /// Create a new envelope from `start` to `target` linear gain over
    /// `total` frames
    ///
    /// A zero-length envelope completes immediately at `target` (an
    /// immediate cut).
    pub fn new(start: f32, target: f32, total: u64, curve: FadeCurve) -> Self {
        Self {
            start,
            target,
            total,
            done: 0,
            curve,
        }
    }

    /// Gain at `offset` frames past the current position
    pub fn gain_at(&self, offset: u64) -> f32 {
        if self.total == 0 {
            return self.target;
        }
        let pos = (self.done + offset).min(self.total);
        let t = pos as f32 / self.total as f32;
        self.start + (self.target - self.start) * self.curve.shape(t)
    }

    /// Gain at the current position (used as the start of a replacing
    /// envelope)
    pub fn current_gain(&self) -> f32 {
        self.gain_at(0)
    }

    /// Fill `dst` with one gain value per frame, starting at the current
    /// position
    ///
    /// Used by the batched path: one ramp vector per envelope, then a single
    /// multiply over the scratch buffer.
    pub fn fill_ramp(&self, dst: &mut [f32]) {
        for (i, g) in dst.iter_mut().enumerate() {
            *g = self.gain_at(i as u64);
        }
    }

    /// Advance the envelope by `frames` mixed frames
    pub fn advance(&mut self, frames: u64) {
        self.done = (self.done + frames).min(self.total);
    }

    /// True once the ramp has fully played out
    pub fn is_complete(&self) -> bool {
        self.done >= self.total
    }

    /// True if completing this envelope should tear the cue down
    pub fn completes_to_silence(&self) -> bool {
        self.target <= 0.0
    }

    /// Ramp target (linear)
    pub fn target(&self) -> f32 {
        self.target
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_to_linear_unity_and_half() {
        assert!((db_to_linear(0.0) - 1.0).abs() < 1e-6);
        // -6.02 dB is half amplitude
        assert!((db_to_linear(-6.0205999) - 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_silence_floor_maps_to_zero() {
        assert_eq!(db_to_linear(SILENCE_FLOOR_DB), 0.0);
        assert_eq!(db_to_linear(-120.0), 0.0);
        assert!(db_to_linear(SILENCE_FLOOR_DB + 1.0) > 0.0);
    }

    #[test]
    fn test_linear_to_db_round_trip() {
        for db in [-60.0f32, -20.0, -6.0, 0.0, 6.0] {
            let back = linear_to_db(db_to_linear(db));
            assert!((back - db).abs() < 1e-3, "db={} back={}", db, back);
        }
        assert_eq!(linear_to_db(0.0), SILENCE_FLOOR_DB);
    }

    #[test]
    fn test_linear_curve_midpoint() {
        let env = Envelope::new(0.0, 1.0, 100, FadeCurve::Linear);
        assert!((env.gain_at(50) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_equal_power_curve_midpoint() {
        // sin(π/4) ≈ 0.7071
        let env = Envelope::new(0.0, 1.0, 100, FadeCurve::EqualPower);
        assert!((env.gain_at(50) - 0.70710678).abs() < 1e-4);
    }

    #[test]
    fn test_zero_length_envelope_is_a_cut() {
        let mut env = Envelope::new(1.0, 0.0, 0, FadeCurve::Linear);
        assert!(env.is_complete());
        assert_eq!(env.current_gain(), 0.0);
        assert!(env.completes_to_silence());
        env.advance(10);
        assert!(env.is_complete());
    }

    #[test]
    fn test_advance_saturates_at_total() {
        let mut env = Envelope::new(0.0, 1.0, 10, FadeCurve::Linear);
        env.advance(7);
        assert!(!env.is_complete());
        assert!((env.current_gain() - 0.7).abs() < 1e-6);
        env.advance(100);
        assert!(env.is_complete());
        assert_eq!(env.current_gain(), 1.0);
    }

    #[test]
    fn test_replacement_starts_from_instantaneous_gain() {
        let mut first = Envelope::new(0.0, 1.0, 100, FadeCurve::Linear);
        first.advance(25);
        let second = Envelope::new(first.current_gain(), 0.0, 100, FadeCurve::Linear);
        assert!((second.current_gain() - 0.25).abs() < 1e-6);
        assert!((second.gain_at(100) - 0.0).abs() < 1e-6);
    }

    #[test]
    fn test_fill_ramp_matches_gain_at() {
        let env = Envelope::new(0.2, 0.8, 64, FadeCurve::EqualPower);
        let mut ramp = vec![0.0f32; 16];
        env.fill_ramp(&mut ramp);
        for (i, &g) in ramp.iter().enumerate() {
            assert_eq!(g, env.gain_at(i as u64));
        }
    }

    #[test]
    fn test_fade_to_non_silence_does_not_arm_teardown() {
        let env = Envelope::new(1.0, db_to_linear(-12.0), 100, FadeCurve::Linear);
        assert!(!env.completes_to_silence());
    }

    #[test]
    fn test_curve_serde_names() {
        let json = serde_json::to_string(&FadeCurve::EqualPower).unwrap();
        assert_eq!(json, "\"equal_power\"");
        let parsed: FadeCurve = serde_json::from_str("\"linear\"").unwrap();
        assert_eq!(parsed, FadeCurve::Linear);
    }
}
