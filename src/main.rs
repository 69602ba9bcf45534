// Lip sync preview
// Plays a file and draws the mouth openness as a text meter

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use lipsync_engine::{EngineSettings, MouthShape, PlaybackController};

#[derive(Parser, Debug)]
#[command(name = "lipsync-preview", about = "Preview the mouth openness curve of an audio file")]
struct Args {
    /// Audio file (.wav, .mp3, .ogg, .flac)
    file: PathBuf,

    /// Directory holding lipsync.json
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Animate without opening an audio device
    #[arg(long)]
    silent: bool,

    /// Start position in seconds
    #[arg(long)]
    seek: Option<f64>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let mut settings = match &args.settings {
        Some(dir) => EngineSettings::load(dir).context("Failed to load settings")?,
        None => EngineSettings::default(),
    };
    if args.silent {
        settings.playback.audio_enabled = false;
    }
    let scale = settings.envelope.openness_scale.max(1);

    let controller = PlaybackController::new(settings).context("Failed to start playback engine")?;
    controller
        .load(&args.file)
        .with_context(|| format!("Failed to load {:?}", args.file))?;

    controller.on_update(move |position, openness| {
        let width = (openness * scale as f32).round() as usize;
        println!(
            "{:7.3}s |{:<w$}| {:?}",
            position,
            "#".repeat(width),
            MouthShape::from_openness(openness),
            w = scale as usize
        );
    });
    controller.on_degraded(|reason| warn!("Playing without audio: {}", reason));

    let (done_tx, done_rx) = mpsc::channel();
    controller.on_complete(move || {
        let _ = done_tx.send(());
    });
    let (err_tx, err_rx) = mpsc::channel::<String>();
    controller.on_error(move |message| {
        let _ = err_tx.send(message.to_string());
    });

    controller.play(args.seek).context("Failed to start playback")?;

    let limit = Duration::from_secs_f64(controller.get_duration() + 5.0);
    match done_rx.recv_timeout(limit) {
        Ok(()) => Ok(()),
        Err(_) => match err_rx.try_recv() {
            Ok(message) => anyhow::bail!("Playback failed: {}", message),
            Err(_) => anyhow::bail!("Playback did not complete within {:?}", limit),
        },
    }
}
