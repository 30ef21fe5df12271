//! Streaming audio decoder using symphonia
//!
//! One `CueDecoder` wraps one open container: probe by extension hint,
//! default-track selection, then explicit packet-pull decoding. The worker
//! loop pulls blocks rather than iterating a generator so that trim and
//! loop boundaries stay easy to reason about.
//!
//! # Sample Format
//!
//! Output is interleaved f32 at the *source* sample rate, already converted
//! to the engine channel count: mono sources are duplicated, multi-channel
//! sources are average-downmixed round-robin. Rate conversion happens in
//! the resampler stage, not here.

use crate::error::DecodeError;
use std::fs::File;
use std::path::{Path, PathBuf};
use symphonia::core::audio::{AudioBuffer, AudioBufferRef, Signal};
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::sample::Sample;
use tracing::{debug, warn};

/// Streaming decoder for one source file
pub struct CueDecoder {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    source_rate: u32,
    /// Engine channel count the output is converted to
    channels: usize,
    path: PathBuf,
}

impl std::fmt::Debug for CueDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CueDecoder")
            .field("track_id", &self.track_id)
            .field("source_rate", &self.source_rate)
            .field("channels", &self.channels)
            .field("path", &self.path)
            .finish()
    }
}

impl CueDecoder {
    /// Open a file and prepare its default audio track for decoding
    pub fn open(path: &Path, channels: usize) -> Result<Self, DecodeError> {
        let file = File::open(path).map_err(|e| DecodeError::OpenFailed {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| DecodeError::UnsupportedFormat {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| DecodeError::NoAudioTrack {
                path: path.to_path_buf(),
            })?;

        let track_id = track.id;
        let codec_params = track.codec_params.clone();
        let source_rate = codec_params
            .sample_rate
            .ok_or_else(|| DecodeError::UnsupportedFormat {
                path: path.to_path_buf(),
                message: "sample rate not declared".to_string(),
            })?;

        let decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| DecodeError::UnsupportedFormat {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

        debug!(
            "Opened {}: {} Hz, track {}",
            path.display(),
            source_rate,
            track_id
        );

        Ok(Self {
            format,
            decoder,
            track_id,
            source_rate,
            channels,
            path: path.to_path_buf(),
        })
    }

    /// Source sample rate
    pub fn source_rate(&self) -> u32 {
        self.source_rate
    }

    /// Decode the next packet
    ///
    /// Returns interleaved f32 at the source rate in the engine channel
    /// count, or None at end of stream. Single corrupt packets are skipped,
    /// matching symphonia's recoverable-error contract.
    pub fn next_block(&mut self) -> Result<Option<Vec<f32>>, DecodeError> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(None);
                }
                Err(SymphoniaError::ResetRequired) => return Ok(None),
                Err(e) => {
                    return Err(DecodeError::DecodeFailed {
                        frame: 0,
                        message: e.to_string(),
                    });
                }
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    let mut out = Vec::with_capacity(decoded.frames() * self.channels);
                    convert_samples(&decoded, self.channels, &mut out);
                    return Ok(Some(out));
                }
                Err(SymphoniaError::DecodeError(e)) => {
                    // Recoverable per symphonia's contract: skip the packet.
                    warn!("Skipping corrupt packet in {}: {}", self.path.display(), e);
                    continue;
                }
                Err(e) => {
                    return Err(DecodeError::DecodeFailed {
                        frame: 0,
                        message: e.to_string(),
                    });
                }
            }
        }
    }

    /// Seek the container to a source-rate frame index
    ///
    /// Returns the frame actually landed on (at or before the target for
    /// compressed formats); the caller discards the difference.
    pub fn seek_to_frame(&mut self, frame: u64) -> Result<u64, DecodeError> {
        let seeked = self
            .format
            .seek(
                SeekMode::Accurate,
                SeekTo::TimeStamp {
                    ts: frame,
                    track_id: self.track_id,
                },
            )
            .map_err(|e| DecodeError::SeekFailed {
                frame,
                message: e.to_string(),
            })?;
        self.decoder.reset();
        Ok(seeked.actual_ts)
    }
}

/// Convert a decoded buffer to interleaved f32 in the requested channel
/// count, appending to `out`
fn convert_samples(decoded: &AudioBufferRef, channels: usize, out: &mut Vec<f32>) {
    match decoded {
        AudioBufferRef::F32(buf) => interleave(buf, channels, out, |s| s),
        AudioBufferRef::F64(buf) => interleave(buf, channels, out, |s| s as f32),
        AudioBufferRef::S32(buf) => {
            interleave(buf, channels, out, |s| s as f32 / i32::MAX as f32)
        }
        AudioBufferRef::S16(buf) => {
            interleave(buf, channels, out, |s| s as f32 / i16::MAX as f32)
        }
        AudioBufferRef::S8(buf) => interleave(buf, channels, out, |s| s as f32 / i8::MAX as f32),
        AudioBufferRef::S24(buf) => {
            interleave(buf, channels, out, |s| s.inner() as f32 / 8_388_608.0)
        }
        AudioBufferRef::U32(buf) => interleave(buf, channels, out, |s| {
            (s as i64 - 2_147_483_648) as f32 / 2_147_483_648.0
        }),
        AudioBufferRef::U16(buf) => {
            interleave(buf, channels, out, |s| (s as i32 - 32_768) as f32 / 32_768.0)
        }
        AudioBufferRef::U8(buf) => {
            interleave(buf, channels, out, |s| (s as i32 - 128) as f32 / 128.0)
        }
        AudioBufferRef::U24(buf) => interleave(buf, channels, out, |s| {
            (s.inner() as i32 - 8_388_608) as f32 / 8_388_608.0
        }),
    }
}

/// Interleave a planar buffer into `channels` output channels
///
/// - mono source: duplicated to every output channel
/// - matching counts: plain interleave
/// - otherwise: source channels are average-downmixed round-robin, so a
///   stereo target gets evens on the left and odds on the right
fn interleave<S: Sample>(
    buf: &AudioBuffer<S>,
    channels: usize,
    out: &mut Vec<f32>,
    convert: impl Fn(S) -> f32,
) {
    let src_channels = buf.spec().channels.count();
    let frames = buf.frames();

    if src_channels == 1 {
        for frame in 0..frames {
            let s = convert(buf.chan(0)[frame]);
            for _ in 0..channels {
                out.push(s);
            }
        }
    } else if src_channels == channels {
        for frame in 0..frames {
            for ch in 0..channels {
                out.push(convert(buf.chan(ch)[frame]));
            }
        }
    } else {
        // Average-downmix round-robin into the target layout.
        let mut sums = vec![0.0f32; channels];
        let mut counts = vec![0u32; channels];
        for (slot, count) in counts.iter_mut().enumerate() {
            *count = (src_channels / channels) as u32
                + u32::from(slot < src_channels % channels);
        }
        for frame in 0..frames {
            sums.iter_mut().for_each(|s| *s = 0.0);
            for ch in 0..src_channels {
                sums[ch % channels] += convert(buf.chan(ch)[frame]);
            }
            for slot in 0..channels {
                let n = counts[slot].max(1) as f32;
                out.push(sums[slot] / n);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_nonexistent_file_fails() {
        let err = CueDecoder::open(Path::new("/nonexistent/cue.wav"), 2).unwrap_err();
        assert!(matches!(err, DecodeError::OpenFailed { .. }));
    }

    #[test]
    fn test_open_non_audio_file_fails() {
        // The probe must reject garbage rather than looping.
        let dir = std::env::temp_dir();
        let path = dir.join("cuedeck_not_audio.wav");
        std::fs::write(&path, b"this is not a riff header at all").unwrap();
        let err = CueDecoder::open(&path, 2).unwrap_err();
        assert!(matches!(err, DecodeError::UnsupportedFormat { .. }));
        let _ = std::fs::remove_file(&path);
    }

    // Decoding real content is covered by the integration scenarios, which
    // generate WAV fixtures with hound.
}
