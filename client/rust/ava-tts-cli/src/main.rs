use std::io::{IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ava_tts::{Config, Engine, PlaybackQueue, SayRequest, Speaker, TagAwareSpeaker, VolcEngine};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const PROGRESS_RENDER_INTERVAL: Duration = Duration::from_millis(200);
const DRAIN_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// TOML config file
    #[arg(long, default_value = "ava.toml")]
    config: PathBuf,

    /// Override the configured voice
    #[arg(long)]
    voice: Option<String>,

    /// Only buffer audio, never open the output device
    #[arg(long)]
    no_playback: bool,

    /// Show a progress line while speaking
    #[arg(long)]
    progress: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Speak a single utterance
    Say(SayArgs),
    /// Read tagged text such as `<say>hi</say>` from stdin and speak it
    Tags,
}

#[derive(clap::Args, Debug)]
struct SayArgs {
    text: String,

    #[arg(long)]
    emotion: Option<String>,

    /// Context hint for the voice; may be repeated
    #[arg(long)]
    context: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut config = Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(voice) = args.voice.clone() {
        config.engine.voice_type = voice;
    }
    if args.no_playback {
        config.playback.enabled = false;
    }
    info!(config = %args.config.display(), voice = %config.engine.voice_type, "ava-tts starting");

    let engine = VolcEngine::connect(config.engine.clone()).await?;
    let (speaker, drain) = build_speaker(engine, config.playback.enabled)?;
    let speaker = Arc::new(speaker);

    let Args {
        command, progress, ..
    } = args;
    let run = async {
        match command {
            Command::Say(say) => {
                let mut req = SayRequest::utterance(say.text);
                req.emotion = say.emotion;
                req.context_texts = say.context;
                speaker.say(req).await?;
            }
            Command::Tags => run_tags(Arc::clone(&speaker)).await?,
        }
        wait_idle(&speaker, progress).await;
        anyhow::Ok(())
    };

    tokio::select! {
        res = run => res?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            speaker.stop().await;
        }
    }

    if let Some(drain) = drain {
        drain.abort();
    }
    speaker.close()?;
    Ok(())
}

async fn run_tags(speaker: Arc<Speaker<VolcEngine>>) -> Result<()> {
    let mut tas = TagAwareSpeaker::new(speaker);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        tas.feed(&line);
        tas.feed("\n");
    }
    tas.finish().await;
    Ok(())
}

/// Opens the output device when asked to, otherwise paces the queue in the
/// background so progress still advances in real time.
fn build_speaker(
    engine: VolcEngine,
    playback: bool,
) -> Result<(Speaker<VolcEngine>, Option<JoinHandle<()>>)> {
    #[cfg(feature = "playback")]
    {
        if playback {
            return Ok((Speaker::new(engine)?, None));
        }
    }
    #[cfg(not(feature = "playback"))]
    {
        if playback {
            warn!("built without the playback feature, audio will not be heard");
        }
    }

    let speaker = Speaker::headless(engine);
    let drain = spawn_drain(Arc::clone(speaker.queue()), speaker.engine().sample_rate());
    Ok((speaker, Some(drain)))
}

fn spawn_drain(queue: Arc<PlaybackQueue>, sample_rate: u32) -> JoinHandle<()> {
    let frames = (sample_rate as f64 * DRAIN_INTERVAL.as_secs_f64()) as usize;
    tokio::spawn(async move {
        let mut ticker = interval(DRAIN_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = vec![[0.0f32; 2]; frames.max(1)];
        loop {
            ticker.tick().await;
            if !queue.stream(&mut buf).1 {
                break;
            }
        }
    })
}

async fn wait_idle(speaker: &Speaker<VolcEngine>, show_progress: bool) {
    let show_progress = show_progress && std::io::stderr().is_terminal();
    let mut ticker = interval(PROGRESS_RENDER_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    while !speaker.is_idle() {
        ticker.tick().await;
        if show_progress {
            let p = speaker.progress();
            let word = p.current_word.map(|w| w.word).unwrap_or_default();
            eprint!(
                "\r\x1b[2K{:5.1}% {:.1}/{:.1}s [{word}] {}",
                p.percentage, p.current_time, p.total_time, p.played_text
            );
            if let Err(e) = std::io::stderr().flush() {
                warn!(error = %e, "progress render failed");
                return;
            }
        }
    }
    if show_progress {
        eprintln!();
    }
}
