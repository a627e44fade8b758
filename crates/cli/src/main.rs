//! Pose stream session server binary.
//!
//! ## Usage
//!
//! ```bash
//! # Listen on 0.0.0.0:8080 and push the default Desktop/UE4 handshake
//! posestream-server
//!
//! # Mixamo rig in room mode, evict apps silent for 10s
//! posestream-server --rig mixamo --mode room --session-timeout-secs 10
//!
//! # Verbose logging
//! RUST_LOG=posestream=debug posestream-server --port 9000
//! ```

use std::net::IpAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use posestream_server::{Dispatcher, LogSink, ServerConfig};
use posestream_wire::{AppVersion, HandshakeConfig, Rig, TrackingMode};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// UDP session server for pose camera apps.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// UDP port the app connects to
    #[arg(short, long, default_value_t = posestream_server::DEFAULT_PORT, env = "POSESTREAM_PORT")]
    port: u16,

    /// Local address to bind
    #[arg(long, default_value = "0.0.0.0", env = "POSESTREAM_BIND")]
    bind: IpAddr,

    /// Name displayed in the app
    #[arg(long, default_value = "PoseStream", env = "POSESTREAM_NAME")]
    name: String,

    /// Skeleton rig: UE4 or Mixamo
    #[arg(long, default_value = "UE4", env = "POSESTREAM_RIG")]
    rig: Rig,

    /// Room, Desktop, Portrait, RoomBodyOnly or PortraitBodyOnly
    #[arg(long, default_value = "Desktop", env = "POSESTREAM_MODE")]
    mode: TrackingMode,

    /// Mirror the camera image
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, env = "POSESTREAM_MIRROR")]
    mirror: bool,

    /// Smoothed output rate; 0 for async mode
    #[arg(long, default_value_t = 60, env = "POSESTREAM_SYNC_FPS")]
    sync_fps: u32,

    /// Requested camera capture rate
    #[arg(long, default_value_t = 60, env = "POSESTREAM_CAMERA_FPS")]
    camera_fps: u32,

    /// Evict sessions with no traffic for this many seconds
    #[arg(long, env = "POSESTREAM_SESSION_TIMEOUT_SECS")]
    session_timeout_secs: Option<u64>,

    /// Reject apps older than this version (e.g. 1.2.5)
    #[arg(long, env = "POSESTREAM_MIN_APP_VERSION")]
    min_app_version: Option<AppVersion>,

    /// Do not ask apps to disconnect on shutdown
    #[arg(long)]
    no_disconnect_on_shutdown: bool,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_ip: self.bind,
            port: self.port,
            handshake: HandshakeConfig {
                name: self.name.clone(),
                rig: self.rig,
                mode: self.mode,
                mirror: self.mirror,
                sync_fps: self.sync_fps,
                camera_fps: self.camera_fps,
            },
            session_timeout: self.session_timeout_secs.map(Duration::from_secs),
            min_app_version: self.min_app_version,
            disconnect_on_shutdown: !self.no_disconnect_on_shutdown,
            ..Default::default()
        }
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("posestream=info")),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging();

    let config = args.server_config();
    info!(
        port = config.port,
        rig = %config.handshake.rig,
        mode = %config.handshake.mode,
        mirror = config.handshake.mirror,
        sync_fps = config.handshake.sync_fps,
        camera_fps = config.handshake.camera_fps,
        "starting pose stream server"
    );

    let mut dispatcher = Dispatcher::bind(config, LogSink)
        .await
        .context("failed to start server")?;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
        }
        signal_cancel.cancel();
    });

    dispatcher
        .run(cancel)
        .await
        .context("receive loop failed")?;

    let stats = dispatcher.stats();
    info!(
        sessions = dispatcher.server().session_count(),
        handshakes = stats.handshakes,
        stream_payloads = stats.stream_payloads,
        "server stopped"
    );
    Ok(())
}
