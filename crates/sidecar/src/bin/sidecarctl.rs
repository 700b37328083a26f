//! sidecarctl - poke at the capture sidecar from a terminal
//!
//! Subcommands:
//! - `sidecarctl status` - Is the sidecar installed and answering?
//! - `sidecarctl targets` - List capturable audio targets
//! - `sidecarctl capture <target-id>` - Capture into a null sink and report queue health
//! - `sidecarctl config` - Show the effective configuration and where it came from

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use playout::{playback_channel, FrameIngestor, QueueSnapshot};
use sidecar::{PlaybackBridge, StartCaptureOptions, Supervisor};
use sidecarconf::{PlaybackMode, SidecarConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "sidecarctl")]
#[command(about = "Control and diagnose the native capture sidecar")]
#[command(version)]
struct Cli {
    /// Config file (replaces ./capture-sidecar.toml)
    #[arg(short, long, global = true, env = "CAPTURE_SIDECAR_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check whether the sidecar binary resolves and answers health.ping
    Status,

    /// List audio targets the sidecar can capture
    Targets,

    /// Capture a target and render it through the playback queue
    Capture {
        /// Target id from `sidecarctl targets`
        target_id: String,

        /// How long to capture
        #[arg(short, long, default_value = "10")]
        seconds: u64,

        /// Playback profile: low-latency or stable
        #[arg(short, long)]
        mode: Option<PlaybackMode>,
    },

    /// Print the effective configuration
    Config,
}

fn init_tracing(level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, sources) = SidecarConfig::load_with_sources_from(cli.config.as_deref())
        .context("Failed to load configuration")?;
    init_tracing(&config.telemetry.log_level);

    match cli.command {
        Commands::Status => status(config).await,
        Commands::Targets => targets(config).await,
        Commands::Capture {
            target_id,
            seconds,
            mode,
        } => {
            let mut config = config;
            if let Some(mode) = mode {
                config.playback.mode = mode;
            }
            capture(config, target_id, Duration::from_secs(seconds)).await
        }
        Commands::Config => {
            for file in &sources.files {
                println!("# loaded: {}", file.display());
            }
            for var in &sources.env_overrides {
                println!("# env: {}", var);
            }
            print!("{}", config.to_toml());
            Ok(())
        }
    }
}

async fn status(config: SidecarConfig) -> Result<()> {
    let supervisor = Supervisor::from_config(config);
    let status = supervisor.get_status().await;
    println!("{}", serde_json::to_string_pretty(&status)?);
    if let Ok(snapshot) = supervisor.snapshot().await {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }
    supervisor.dispose().await;
    Ok(())
}

async fn targets(config: SidecarConfig) -> Result<()> {
    let supervisor = Supervisor::from_config(config);
    let result = supervisor.list_audio_targets().await;
    supervisor.dispose().await;

    let targets = result.context("Failed to list audio targets")?;
    if targets.is_empty() {
        println!("No capturable targets");
    }
    for target in targets {
        match (target.pid, &target.process_name) {
            (Some(pid), Some(name)) => println!("{}\t{}\t{} ({})", target.id, target.label, name, pid),
            _ => println!("{}\t{}", target.id, target.label),
        }
    }
    Ok(())
}

async fn capture(config: SidecarConfig, target_id: String, duration: Duration) -> Result<()> {
    let supervisor = Supervisor::from_config(config.clone());
    let events = supervisor.subscribe();

    let session = supervisor
        .start_audio_capture(StartCaptureOptions {
            target_id: target_id.clone(),
            ..Default::default()
        })
        .await
        .with_context(|| format!("Failed to start capture of {}", target_id))?;
    println!(
        "Capturing {} as {} ({} Hz, {} ch, {} mode)",
        target_id, session.session_id, session.sample_rate, session.channels, config.playback.mode
    );

    let (sender, mut queue, mut monitor) =
        playback_channel(&config.playback, session.sample_rate, session.channels);
    let ingestor = FrameIngestor::new(&session, session.channels, &config.playback, sender);
    let bridge = PlaybackBridge::spawn(events, session.clone(), ingestor);

    // Null sink paced like a device callback
    let frames_per_buffer = session.frames_per_buffer.unwrap_or(480).max(1);
    let period = Duration::from_secs_f64(f64::from(frames_per_buffer) / f64::from(session.sample_rate.max(1)));
    let running = Arc::new(AtomicBool::new(true));
    let render_running = Arc::clone(&running);
    let render = thread::Builder::new()
        .name("playout-render".to_string())
        .spawn(move || {
            let mut out = vec![0.0f32; frames_per_buffer as usize * usize::from(session.channels.max(1))];
            while render_running.load(Ordering::Relaxed) {
                queue.render(&mut out);
                thread::sleep(period);
            }
        })
        .context("Failed to spawn render thread")?;

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = ticker.tick() => {
                monitor.poll();
                print_stats(&monitor.stats());
                if bridge.is_finished() {
                    println!("Session ended by the sidecar");
                    break;
                }
            }
        }
    }

    if let Err(e) = supervisor.stop_audio_capture(Some(&session.session_id)).await {
        eprintln!("Stop failed: {}", e);
    }
    let counters = bridge.join().await;
    running.store(false, Ordering::Relaxed);
    if render.join().is_err() {
        eprintln!("Render thread panicked");
    }
    monitor.poll();

    let ingress = supervisor.ingress_stats();
    supervisor.dispose().await;

    println!(
        "accepted={} rejected={} silence_frames={} handoff_dropped={} lagged_events={}",
        counters.accepted,
        counters.rejected,
        counters.silence_frames_inserted,
        counters.handoff_dropped,
        counters.lagged_events
    );
    print_stats(&monitor.stats());
    println!("{}", serde_json::to_string(&ingress)?);
    Ok(())
}

fn print_stats(stats: &QueueSnapshot) {
    println!(
        "depth={} received={} played={} underruns={} overflow={} trimmed={} resets={}",
        stats.depth,
        stats.chunks_received,
        stats.chunks_played,
        stats.underruns,
        stats.overflow_drops,
        stats.trim_drops,
        stats.resets
    );
}
