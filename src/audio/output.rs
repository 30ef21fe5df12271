//! Audio output using cpal
//!
//! Owns the output device and stream; the stream callback pulls blocks
//! from the engine's mixer. The host may request any buffer size, so the
//! callback walks the buffer in mixer-block-sized segments.

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::playback::mixer::OutputMixer;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};
use tracing::{debug, info, warn};

/// Audio output manager
pub struct AudioOutput {
    device: Device,
    config: StreamConfig,
    sample_format: SampleFormat,
    stream: Option<Stream>,
    channels: usize,
    block_frames: usize,
}

impl AudioOutput {
    /// List available output device names
    pub fn list_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices: Vec<String> = host
            .output_devices()
            .map_err(|e| EngineError::AudioOutput(format!("Failed to enumerate devices: {}", e)))?
            .filter_map(|device| device.name().ok())
            .collect();
        debug!("Found {} output devices", devices.len());
        Ok(devices)
    }

    /// Open the configured device (or the system default) at the engine's
    /// fixed rate and channel count
    pub fn new(engine_config: &EngineConfig) -> Result<Self> {
        let host = cpal::default_host();

        let device = if let Some(name) = engine_config.device.as_ref() {
            let mut devices = host.output_devices().map_err(|e| {
                EngineError::AudioOutput(format!("Failed to enumerate devices: {}", e))
            })?;
            devices
                .find(|d| d.name().ok().as_deref() == Some(name.as_str()))
                .ok_or_else(|| EngineError::AudioOutput(format!("Device '{}' not found", name)))?
        } else {
            host.default_output_device()
                .ok_or_else(|| EngineError::AudioOutput("No default output device".to_string()))?
        };

        info!(
            "Using audio device: {}",
            device.name().unwrap_or_else(|_| "Unknown".to_string())
        );

        let (config, sample_format) = Self::pick_config(&device, engine_config)?;
        debug!(
            "Stream config: {} Hz, {} ch, format {:?}",
            config.sample_rate.0, config.channels, sample_format
        );

        Ok(Self {
            device,
            config,
            sample_format,
            stream: None,
            channels: engine_config.channels,
            block_frames: engine_config.block_frames,
        })
    }

    /// Find a stream configuration matching the engine's fixed format
    fn pick_config(
        device: &Device,
        engine_config: &EngineConfig,
    ) -> Result<(StreamConfig, SampleFormat)> {
        let rate = engine_config.sample_rate;
        let channels = engine_config.channels as u16;

        let mut supported = device.supported_output_configs().map_err(|e| {
            EngineError::AudioOutput(format!("Failed to get device configs: {}", e))
        })?;

        let preferred = supported.find(|c| {
            c.channels() == channels
                && c.min_sample_rate().0 <= rate
                && c.max_sample_rate().0 >= rate
                && c.sample_format() == SampleFormat::F32
        });
        if let Some(supported_config) = preferred {
            let sample_format = supported_config.sample_format();
            let config = supported_config
                .with_sample_rate(cpal::SampleRate(rate))
                .config();
            return Ok((config, sample_format));
        }

        // Fall back to anything at the right rate/channels; sample format
        // conversion happens in the callback.
        let mut supported = device.supported_output_configs().map_err(|e| {
            EngineError::AudioOutput(format!("Failed to get device configs: {}", e))
        })?;
        let fallback = supported
            .find(|c| {
                c.channels() == channels
                    && c.min_sample_rate().0 <= rate
                    && c.max_sample_rate().0 >= rate
            })
            .ok_or_else(|| {
                EngineError::AudioOutput(format!(
                    "No output config supports {} Hz / {} ch",
                    rate, channels
                ))
            })?;
        let sample_format = fallback.sample_format();
        let config = fallback.with_sample_rate(cpal::SampleRate(rate)).config();
        Ok((config, sample_format))
    }

    /// Start the stream, moving the mixer onto the audio thread
    pub fn start(&mut self, mixer: OutputMixer) -> Result<()> {
        info!("Starting audio stream");

        let stream = match self.sample_format {
            SampleFormat::F32 => self.build_stream_f32(mixer)?,
            SampleFormat::I16 => self.build_stream_i16(mixer)?,
            SampleFormat::U16 => self.build_stream_u16(mixer)?,
            other => {
                return Err(EngineError::AudioOutput(format!(
                    "Unsupported sample format: {:?}",
                    other
                )));
            }
        };

        stream
            .play()
            .map_err(|e| EngineError::AudioOutput(format!("Failed to start stream: {}", e)))?;
        self.stream = Some(stream);

        info!("Audio stream started");
        Ok(())
    }

    fn build_stream_f32(&self, mut mixer: OutputMixer) -> Result<Stream> {
        let channels = self.channels;
        let block_samples = self.block_frames * channels;

        let stream = self
            .device
            .build_output_stream(
                &self.config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    for segment in data.chunks_mut(block_samples) {
                        mixer.process(segment);
                        for s in segment.iter_mut() {
                            *s = s.clamp(-1.0, 1.0);
                        }
                    }
                },
                |err| warn!("Audio stream error: {}", err),
                None,
            )
            .map_err(|e| EngineError::AudioOutput(format!("Failed to build stream: {}", e)))?;
        Ok(stream)
    }

    fn build_stream_i16(&self, mut mixer: OutputMixer) -> Result<Stream> {
        let channels = self.channels;
        let block_samples = self.block_frames * channels;
        let mut scratch = vec![0.0f32; block_samples];

        let stream = self
            .device
            .build_output_stream(
                &self.config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    for segment in data.chunks_mut(block_samples) {
                        let part = &mut scratch[..segment.len()];
                        mixer.process(part);
                        for (dst, &src) in segment.iter_mut().zip(part.iter()) {
                            *dst = (src.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                        }
                    }
                },
                |err| warn!("Audio stream error: {}", err),
                None,
            )
            .map_err(|e| EngineError::AudioOutput(format!("Failed to build stream: {}", e)))?;
        Ok(stream)
    }

    fn build_stream_u16(&self, mut mixer: OutputMixer) -> Result<Stream> {
        let channels = self.channels;
        let block_samples = self.block_frames * channels;
        let mut scratch = vec![0.0f32; block_samples];

        let stream = self
            .device
            .build_output_stream(
                &self.config,
                move |data: &mut [u16], _: &cpal::OutputCallbackInfo| {
                    for segment in data.chunks_mut(block_samples) {
                        let part = &mut scratch[..segment.len()];
                        mixer.process(part);
                        for (dst, &src) in segment.iter_mut().zip(part.iter()) {
                            // [-1.0, 1.0] to [0, 65535]
                            *dst = ((src.clamp(-1.0, 1.0) + 1.0) * 32767.5) as u16;
                        }
                    }
                },
                |err| warn!("Audio stream error: {}", err),
                None,
            )
            .map_err(|e| EngineError::AudioOutput(format!("Failed to build stream: {}", e)))?;
        Ok(stream)
    }

    /// Stop and drop the stream (and the mixer with it)
    pub fn stop(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            info!("Stopping audio stream");
            stream
                .pause()
                .map_err(|e| EngineError::AudioOutput(format!("Failed to pause stream: {}", e)))?;
            drop(stream);
        }
        Ok(())
    }

    /// Device name
    pub fn device_name(&self) -> String {
        self.device.name().unwrap_or_else(|_| "Unknown".to_string())
    }
}

impl Drop for AudioOutput {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
