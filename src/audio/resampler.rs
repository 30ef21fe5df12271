//! Stateful audio resampling using rubato
//!
//! Converts decoded audio to the engine sample rate. Filter state is kept
//! across blocks so streamed chunks join without phase discontinuities;
//! the decode worker feeds arbitrary packet sizes and this module handles
//! the fixed-chunk requirement of `FastFixedIn` with an internal
//! accumulator.
//!
//! Iteration boundaries (trim end, loop restart) call `flush()` so the
//! exact tail comes out without zero-padding leaking into the next
//! iteration, then `reset()` before decoding resumes at the seek target.

use crate::error::DecodeError;
use rubato::{FastFixedIn, PolynomialDegree, Resampler as RubatoResampler};
use tracing::debug;

enum Inner {
    /// Input rate equals output rate; samples pass straight through
    PassThrough,

    /// Active rate conversion with maintained filter state
    Active { resampler: FastFixedIn<f32> },
}

/// Streaming resampler with an input accumulator
pub struct StreamResampler {
    inner: Inner,
    channels: usize,
    /// Fixed input chunk size in frames for the active resampler
    chunk_frames: usize,
    /// Interleaved input awaiting a full chunk
    pending: Vec<f32>,
}

impl StreamResampler {
    /// Create a resampler from `input_rate` to `output_rate`
    ///
    /// `chunk_frames` is the fixed input block the active resampler
    /// processes; larger blocks amortize filter overhead, smaller blocks
    /// reduce boundary latency.
    pub fn new(
        input_rate: u32,
        output_rate: u32,
        channels: usize,
        chunk_frames: usize,
    ) -> Result<Self, DecodeError> {
        let inner = if input_rate == output_rate {
            debug!("Pass-through resampler at {} Hz", input_rate);
            Inner::PassThrough
        } else {
            debug!(
                "Resampler {} Hz -> {} Hz ({} ch, chunk {})",
                input_rate, output_rate, channels, chunk_frames
            );
            let resampler = FastFixedIn::<f32>::new(
                output_rate as f64 / input_rate as f64,
                1.0,
                PolynomialDegree::Septic,
                chunk_frames,
                channels,
            )
            .map_err(|e| DecodeError::Resample {
                source_rate: input_rate,
                target_rate: output_rate,
                message: e.to_string(),
            })?;
            Inner::Active { resampler }
        };

        Ok(Self {
            inner,
            channels,
            chunk_frames,
            pending: Vec::new(),
        })
    }

    /// True when no rate conversion happens
    pub fn is_pass_through(&self) -> bool {
        matches!(self.inner, Inner::PassThrough)
    }

    /// Feed interleaved input; returns whatever output is ready
    ///
    /// Output may be empty while the accumulator waits for a full chunk.
    pub fn feed(&mut self, input: &[f32]) -> Result<Vec<f32>, DecodeError> {
        match &mut self.inner {
            Inner::PassThrough => Ok(input.to_vec()),
            Inner::Active { resampler } => {
                self.pending.extend_from_slice(input);

                let chunk_samples = self.chunk_frames * self.channels;
                let mut out = Vec::new();
                while self.pending.len() >= chunk_samples {
                    let chunk: Vec<f32> = self.pending.drain(..chunk_samples).collect();
                    let planar = deinterleave(&chunk, self.channels);
                    let resampled = resampler
                        .process(&planar, None)
                        .map_err(|e| resample_error(e))?;
                    interleave_into(&resampled, &mut out);
                }
                Ok(out)
            }
        }
    }

    /// Flush the accumulator and filter tail at an iteration boundary
    pub fn flush(&mut self) -> Result<Vec<f32>, DecodeError> {
        match &mut self.inner {
            Inner::PassThrough => Ok(std::mem::take(&mut self.pending)),
            Inner::Active { resampler } => {
                let mut out = Vec::new();

                if !self.pending.is_empty() {
                    let planar = deinterleave(&self.pending, self.channels);
                    self.pending.clear();
                    let resampled = resampler
                        .process_partial(Some(&planar), None)
                        .map_err(|e| resample_error(e))?;
                    interleave_into(&resampled, &mut out);
                }

                // One empty partial call drains the filter delay line.
                let tail = resampler
                    .process_partial::<Vec<f32>>(None, None)
                    .map_err(|e| resample_error(e))?;
                interleave_into(&tail, &mut out);

                Ok(out)
            }
        }
    }

    /// Clear filter state after a container seek
    pub fn reset(&mut self) {
        self.pending.clear();
        if let Inner::Active { resampler } = &mut self.inner {
            resampler.reset();
        }
    }
}

fn resample_error(e: rubato::ResampleError) -> DecodeError {
    DecodeError::Resample {
        source_rate: 0,
        target_rate: 0,
        message: e.to_string(),
    }
}

/// Interleaved [L, R, L, R, ...] to planar [[L, L, ...], [R, R, ...]]
fn deinterleave(samples: &[f32], channels: usize) -> Vec<Vec<f32>> {
    let frames = samples.len() / channels;
    let mut planar = vec![Vec::with_capacity(frames); channels];
    for frame in 0..frames {
        for ch in 0..channels {
            planar[ch].push(samples[frame * channels + ch]);
        }
    }
    planar
}

/// Planar channels back to interleaved, appending to `out`
fn interleave_into(planar: &[Vec<f32>], out: &mut Vec<f32>) {
    if planar.is_empty() {
        return;
    }
    let frames = planar[0].len();
    out.reserve(frames * planar.len());
    for frame in 0..frames {
        for chan in planar {
            out.push(chan[frame]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deinterleave_interleave_round_trip() {
        let interleaved = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let planar = deinterleave(&interleaved, 2);
        assert_eq!(planar[0], vec![1.0, 3.0, 5.0]);
        assert_eq!(planar[1], vec![2.0, 4.0, 6.0]);

        let mut back = Vec::new();
        interleave_into(&planar, &mut back);
        assert_eq!(back, interleaved);
    }

    #[test]
    fn test_pass_through_copies() {
        let mut rs = StreamResampler::new(48_000, 48_000, 2, 1024).unwrap();
        assert!(rs.is_pass_through());
        let input = vec![0.1, 0.2, 0.3, 0.4];
        assert_eq!(rs.feed(&input).unwrap(), input);
        assert!(rs.flush().unwrap().is_empty());
    }

    #[test]
    fn test_active_accumulates_to_chunk() {
        let mut rs = StreamResampler::new(44_100, 48_000, 2, 512).unwrap();
        assert!(!rs.is_pass_through());

        // Half a chunk: nothing comes out yet.
        let out = rs.feed(&vec![0.5; 256 * 2]).unwrap();
        assert!(out.is_empty());

        // Second half completes the chunk.
        let out = rs.feed(&vec![0.5; 256 * 2]).unwrap();
        let frames = out.len() / 2;
        let expected = (512.0 * 48_000.0 / 44_100.0) as usize;
        assert!(
            frames.abs_diff(expected) <= 32,
            "expected ~{} frames, got {}",
            expected,
            frames
        );
    }

    #[test]
    fn test_flush_emits_remainder() {
        let mut rs = StreamResampler::new(44_100, 48_000, 2, 512).unwrap();
        rs.feed(&vec![0.5; 100 * 2]).unwrap();
        let out = rs.flush().unwrap();
        // The partial 100 frames plus filter tail come out at the new rate.
        assert!(!out.is_empty());
        assert_eq!(out.len() % 2, 0);
    }

    #[test]
    fn test_total_output_approximates_ratio() {
        let mut rs = StreamResampler::new(44_100, 48_000, 2, 512).unwrap();
        let mut total = 0usize;
        for _ in 0..10 {
            total += rs.feed(&vec![0.25; 441 * 2]).unwrap().len() / 2;
        }
        total += rs.flush().unwrap().len() / 2;

        let input_frames = 441 * 10;
        let expected = (input_frames as f64 * 48_000.0 / 44_100.0) as usize;
        assert!(
            total.abs_diff(expected) <= 64,
            "expected ~{} frames, got {}",
            expected,
            total
        );
    }

    #[test]
    fn test_reset_clears_pending() {
        let mut rs = StreamResampler::new(44_100, 48_000, 2, 512).unwrap();
        rs.feed(&vec![0.5; 10 * 2]).unwrap();
        assert!(!rs.pending.is_empty());
        rs.reset();
        assert!(rs.pending.is_empty());
    }
}
