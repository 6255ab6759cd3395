// apps/session-sim/src/main.rs
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dotenv::dotenv;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod script;

use script::{PeerAction, ScriptStep};
use shared_config::AppConfig;
use video_session_cell::capabilities::RecordingSink;
use video_session_cell::testing::{
    stats_sequence, FakeMediaCapture, FakeRecordingSink, FakeTransportFactory,
};
use video_session_cell::{FileRecordingSink, SessionConfig, SessionCoordinator};

#[derive(Parser)]
#[command(name = "session-sim")]
#[command(about = "Drive a video session against simulated devices and a simulated peer")]
struct Args {
    /// JSON script of steps; the built-in consultation script runs when omitted
    #[arg(short, long)]
    script: Option<PathBuf>,

    /// Keep recordings in memory instead of writing manifests to VIDEO_RECORDING_DIR
    #[arg(long)]
    memory_recordings: bool,

    /// Peer only answers when the script says so
    #[arg(long)]
    manual_answer: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Loading Env Vars
    dotenv().ok();

    // Initialize tracing; stdout is reserved for the event stream
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    info!("Starting video session simulator");

    // Load configuration
    let config = AppConfig::from_env();
    let session_config = SessionConfig::from_app_config(&config);

    let steps = match &args.script {
        Some(path) => {
            info!("Loading script {}", path.display());
            script::load(path)?
        }
        None => script::parse(script::DEFAULT_SCRIPT)?,
    };

    let capture = Arc::new(FakeMediaCapture::new());
    let transports = Arc::new(if args.manual_answer {
        FakeTransportFactory::without_auto_answer()
    } else {
        FakeTransportFactory::new()
    });
    let recordings: Arc<dyn RecordingSink> = if args.memory_recordings || !config.is_recording_storage_configured() {
        Arc::new(FakeRecordingSink::new())
    } else {
        info!("Writing recording manifests to {}", config.recording_storage_dir);
        Arc::new(FileRecordingSink::from_app_config(&config))
    };

    let (coordinator, mut events) = SessionCoordinator::with_capabilities(
        session_config.clone(),
        capture.clone(),
        transports.clone(),
        recordings,
    );

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("Could not serialize event: {}", e),
            }
        }
    });

    for (index, step) in steps.into_iter().enumerate() {
        match step {
            ScriptStep::Command { command } => {
                if let Err(e) = coordinator.dispatch(command).await {
                    warn!("Step {} rejected: {} ({:?})", index, e, e.severity());
                }
            }
            ScriptStep::Peer { action } => {
                let Some(transport) = transports.last_transport() else {
                    warn!("Step {}: no peer connection yet", index);
                    continue;
                };
                match action {
                    PeerAction::RemoteStream => transport.deliver_remote_stream(),
                    PeerAction::Disconnect => transport.disconnect(),
                    PeerAction::Reconnect => transport.reconnect(),
                    PeerAction::HangUp => transport.hang_up(),
                    PeerAction::Fail => transport.fail("simulated ICE failure"),
                };
            }
            ScriptStep::Stats { readings } => {
                let stats = stats_sequence(&readings, session_config.quality_sample_interval);
                match transports.last_transport() {
                    Some(transport) => transport.push_stats(stats),
                    None => transports.queue_stats(stats),
                }
            }
            ScriptStep::EndDisplayCapture => {
                if !capture.end_display_capture() {
                    warn!("Step {}: no display capture to end", index);
                }
            }
            ScriptStep::DevicesChanged => {
                if let Err(e) = coordinator.refresh_devices().await {
                    warn!("Step {}: device refresh failed: {}", index, e);
                }
            }
            ScriptStep::Wait { ms } => tokio::time::sleep(Duration::from_millis(ms)).await,
        }
    }

    info!("Script finished in state {}", coordinator.state().await);
    coordinator.destroy().await;
    printer.await?;

    Ok(())
}
