//! cuedeck command-line player
//!
//! Minimal driver for the engine: arm one or more files as cues, play them
//! through the default (or named) output device, and print engine events
//! until every cue finishes.

use anyhow::{Context, Result};
use clap::Parser;
use cuedeck::{
    AudioOutput, Engine, EngineCommand, EngineConfig, EngineEvent, PlayCueCommand,
    StopCueCommand,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "cuedeck")]
#[command(about = "Multi-cue soundboard audio engine")]
#[command(version)]
struct Args {
    /// Audio files to play as cues
    #[arg(required_unless_present = "list_devices")]
    files: Vec<PathBuf>,

    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Gain in dB applied to every cue
    #[arg(short, long, default_value_t = 0.0)]
    gain_db: f32,

    /// Loop each cue until the duration elapses
    #[arg(long)]
    r#loop: bool,

    /// Fade-in per cue, in milliseconds
    #[arg(long, default_value_t = 0)]
    fade_in_ms: u64,

    /// Fade-out per cue, in milliseconds
    #[arg(long, default_value_t = 250)]
    fade_out_ms: u64,

    /// Layer cues instead of auto-fading the previous one
    #[arg(long)]
    layered: bool,

    /// Stop all cues (through their fade-out) after this many seconds
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Output device name (default: system default)
    #[arg(short, long)]
    device: Option<String>,

    /// List output devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Print events as JSON lines instead of human-readable text
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cuedeck=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let args = Args::parse();

    if args.list_devices {
        for name in AudioOutput::list_devices()? {
            println!("{}", name);
        }
        return Ok(());
    }

    if args.r#loop && args.duration_secs.is_none() {
        anyhow::bail!("--loop needs --duration-secs, otherwise playback never ends");
    }

    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if args.device.is_some() {
        config.device = args.device.clone();
    }

    let mut engine = Engine::new(config.clone())?;
    let mut output = AudioOutput::new(&config)?;
    output.start(engine.take_mixer().expect("mixer not yet taken"))?;
    info!("Playing on '{}'", output.device_name());

    let cue_ids: Vec<String> = args
        .files
        .iter()
        .enumerate()
        .map(|(i, path)| {
            format!(
                "{}#{}",
                path.file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("cue"),
                i
            )
        })
        .collect();

    for (cue_id, path) in cue_ids.iter().zip(&args.files) {
        engine.send(EngineCommand::PlayCue(PlayCueCommand {
            cue_id: cue_id.clone(),
            file_path: path.clone(),
            in_frame: 0,
            out_frame: None,
            gain_db: args.gain_db,
            fade_in_ms: args.fade_in_ms,
            fade_out_ms: args.fade_out_ms,
            loop_enabled: args.r#loop,
            layered: args.layered || args.files.len() > 1,
            auto_fade_on_new: !args.layered,
        }))?;
    }

    // Timed stop: every cue leaves through its fade-out, never a hard cut.
    if let Some(secs) = args.duration_secs {
        let sender = engine.command_sender()?;
        let ids = cue_ids.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs(secs));
            info!("Duration elapsed, stopping all cues");
            for cue_id in ids {
                let _ = sender.send(EngineCommand::StopCue(StopCueCommand { cue_id }));
            }
        });
    }

    let mut remaining = cue_ids.len();
    for event in engine.events().iter() {
        if args.json {
            println!("{}", serde_json::to_string(&event)?);
        } else {
            print_event(&event);
        }
        if matches!(event, EngineEvent::CueFinished { .. }) {
            remaining -= 1;
            if remaining == 0 {
                break;
            }
        }
    }

    output.stop()?;
    drop(output);
    engine.shutdown();
    Ok(())
}

fn print_event(event: &EngineEvent) {
    match event {
        EngineEvent::CueStarted { cue, .. } => {
            println!("started  {} ({})", cue.cue_id, cue.file_path.display());
        }
        EngineEvent::CueFinished { cue, reason, .. } => {
            println!("finished {} ({})", cue.cue_id, reason);
        }
        EngineEvent::CueTime {
            cue_id,
            elapsed_seconds,
            remaining_seconds,
            ..
        } => match remaining_seconds {
            Some(remaining) => println!(
                "time     {} {:.1}s (-{:.1}s)",
                cue_id, elapsed_seconds, remaining
            ),
            None => println!("time     {} {:.1}s", cue_id, elapsed_seconds),
        },
        EngineEvent::CueLevels {
            cue_id,
            rms_db,
            peak_db,
        } => {
            println!(
                "levels   {} rms {:.1} dB, peak {:.1} dB",
                cue_id, rms_db, peak_db
            );
        }
        EngineEvent::MasterLevels { rms_db, peak_db } => {
            println!("master   rms {:.1} dB, peak {:.1} dB", rms_db, peak_db);
        }
        EngineEvent::DecodeError {
            cue_id, message, ..
        } => {
            eprintln!("error    {}: {}", cue_id, message);
        }
    }
}
