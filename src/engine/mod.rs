//! Engine facade
//!
//! `Engine::new` wires every channel, spawns the decoder pool, the realtime
//! log drain, and the orchestrator, and hands back the three things the
//! world above needs: a command sender, an event receiver, and the mixer to
//! install into an audio sink.

pub mod cue;
pub mod orchestrator;

use crate::commands::EngineCommand;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::events::EngineEvent;
use crate::playback::decoder_pool::DecoderPool;
use crate::playback::messages::{MixerCommand, MixerEvent, PoolEvent};
use crate::playback::mixer::OutputMixer;
use crate::playback::rtlog::{rtlog_pair, spawn_drain};
use orchestrator::{spawn_orchestrator, OrchestratorChannels};
use ringbuf::{traits::*, HeapRb};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::info;

/// Queue depths for the realtime-facing rings. Generous relative to the
/// command drip and the per-callback telemetry volume.
const MIXER_INBOX_CAPACITY: usize = 1024;
const MIXER_EVENT_CAPACITY: usize = 4096;

/// A running cuedeck engine
pub struct Engine {
    command_tx: Option<flume::Sender<EngineCommand>>,
    event_rx: flume::Receiver<EngineEvent>,
    mixer: Option<OutputMixer>,
    pool: Option<DecoderPool>,
    orchestrator: Option<JoinHandle<()>>,
    rtlog_stop: Arc<AtomicBool>,
    rtlog_thread: Option<JoinHandle<()>>,
}

impl Engine {
    /// Construct and start the engine's background contexts
    ///
    /// The audio callback does not run until the caller takes the mixer
    /// (`take_mixer`) and installs it into a sink.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let (command_tx, command_rx) = flume::bounded::<EngineCommand>(256);
        let (event_tx, event_rx) = flume::bounded::<EngineEvent>(1024);
        let (mixer_cmd_tx, mixer_cmd_rx) =
            HeapRb::<MixerCommand>::new(MIXER_INBOX_CAPACITY).split();
        let (mixer_event_tx, mixer_event_rx) =
            HeapRb::<MixerEvent>::new(MIXER_EVENT_CAPACITY).split();
        let (pool_event_tx, pool_event_rx) = flume::bounded::<PoolEvent>(256);

        let pool = DecoderPool::new(config.clone(), pool_event_tx);

        let (rtlog_tx, rtlog_drain) = rtlog_pair();
        let rtlog_stop = Arc::new(AtomicBool::new(false));
        let rtlog_thread = spawn_drain(rtlog_drain, Arc::clone(&rtlog_stop));

        let mixer = OutputMixer::new(
            config.clone(),
            mixer_cmd_rx,
            mixer_event_tx,
            pool.command_sender(),
            rtlog_tx,
        );

        let orchestrator = spawn_orchestrator(
            config.clone(),
            OrchestratorChannels {
                commands: command_rx,
                events: event_tx,
                mixer_tx: mixer_cmd_tx,
                mixer_events: mixer_event_rx,
                pool_tx: pool.command_sender(),
                pool_events: pool_event_rx,
            },
        );

        info!(
            "Engine started: {} Hz, {} ch, block {} frames",
            config.sample_rate, config.channels, config.block_frames
        );

        Ok(Self {
            command_tx: Some(command_tx),
            event_rx,
            mixer: Some(mixer),
            pool: Some(pool),
            orchestrator: Some(orchestrator),
            rtlog_stop,
            rtlog_thread: Some(rtlog_thread),
        })
    }

    /// Send one command into the orchestrator
    pub fn send(&self, command: EngineCommand) -> Result<()> {
        match &self.command_tx {
            Some(tx) => tx
                .send(command)
                .map_err(|_| EngineError::ChannelClosed("engine commands")),
            None => Err(EngineError::ShuttingDown),
        }
    }

    /// Clonable command sender for callers that outlive borrows of the
    /// engine
    pub fn command_sender(&self) -> Result<flume::Sender<EngineCommand>> {
        self.command_tx
            .clone()
            .ok_or(EngineError::ShuttingDown)
    }

    /// The engine's event stream
    pub fn events(&self) -> &flume::Receiver<EngineEvent> {
        &self.event_rx
    }

    /// Take the mixer for installation into an audio sink
    ///
    /// Returns None if it was already taken.
    pub fn take_mixer(&mut self) -> Option<OutputMixer> {
        self.mixer.take()
    }

    /// Orderly shutdown: the orchestrator drains, workers join, the log
    /// drain exits
    ///
    /// The caller must stop the audio stream (dropping the mixer) first;
    /// a still-installed callback keeps only its own rings alive.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        // Dropping the command sender ends the orchestrator loop.
        self.command_tx = None;
        if let Some(handle) = self.orchestrator.take() {
            let _ = handle.join();
        }
        if let Some(pool) = self.pool.take() {
            pool.shutdown();
        }
        self.rtlog_stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.rtlog_thread.take() {
            let _ = handle.join();
        }
        info!("Engine shut down");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.orchestrator.is_some() {
            self.shutdown_inner();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_starts_and_shuts_down() {
        let mut config = EngineConfig::default();
        config.pool_workers = 1;
        let engine = Engine::new(config).unwrap();
        assert!(engine.command_tx.is_some());
        engine.shutdown();
    }

    #[test]
    fn test_mixer_taken_once() {
        let mut config = EngineConfig::default();
        config.pool_workers = 1;
        let mut engine = Engine::new(config).unwrap();
        assert!(engine.take_mixer().is_some());
        assert!(engine.take_mixer().is_none());
        engine.shutdown();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = EngineConfig::default();
        config.block_frames = 0;
        assert!(Engine::new(config).is_err());
    }
}
