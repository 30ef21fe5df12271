//! # cuedeck
//!
//! Multi-cue, low-latency audio playback engine for a live soundboard
//! surface: dozens of named audio files can be armed, started, faded,
//! gain-adjusted, looped, and stopped concurrently while the surface above
//! receives level meters and playhead telemetry.
//!
//! **Architecture:** four cooperating contexts joined by bounded queues:
//! a decoder worker pool (symphonia + rubato), per-cue PCM rings with
//! credit-based backpressure (ringbuf), a realtime output mixer (driven by
//! cpal or any other block-pull sink), and an orchestrator thread owning
//! the cue registry and event egress.
//!
//! ```no_run
//! use cuedeck::{Engine, EngineConfig, EngineCommand, PlayCueCommand};
//!
//! let mut engine = Engine::new(EngineConfig::default()).unwrap();
//! let mut output = cuedeck::AudioOutput::new(&EngineConfig::default()).unwrap();
//! output.start(engine.take_mixer().unwrap()).unwrap();
//!
//! engine.send(EngineCommand::PlayCue(PlayCueCommand {
//!     cue_id: "intro".into(),
//!     file_path: "intro.flac".into(),
//!     in_frame: 0,
//!     out_frame: None,
//!     gain_db: -3.0,
//!     fade_in_ms: 20,
//!     fade_out_ms: 400,
//!     loop_enabled: false,
//!     layered: false,
//!     auto_fade_on_new: true,
//! })).unwrap();
//!
//! for event in engine.events().iter() {
//!     println!("{:?}", event);
//! }
//! ```

pub mod audio;
pub mod commands;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod playback;

pub use audio::output::AudioOutput;
pub use commands::{
    BatchCommandsCommand, EngineCommand, FadeCueCommand, PlayCueCommand, StopCueCommand,
    UpdateCueCommand,
};
pub use config::EngineConfig;
pub use engine::cue::{Cue, RemovalReason};
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use events::EngineEvent;
pub use playback::envelope::FadeCurve;
pub use playback::mixer::OutputMixer;
