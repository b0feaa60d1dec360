//! Broadcaster binary
//!
//! Captures the local camera and microphone once and fans the encoded
//! stream out to every viewer announced by the signaling relay.
//!
//! # Usage
//!
//! ```bash
//! beamcast [signaling_url] [stream_id] [video_device] [audio_device] [camera_type]
//!
//! # USB webcam against a remote relay
//! beamcast ws://203.0.113.7:8080 pi-camera-stream /dev/video0 default usb
//! ```
//!
//! TURN relays are configured through the environment (or a `.env` file):
//! `CLOUDFLARE_TURN_KEY_ID`/`CLOUDFLARE_API_TOKEN` for dynamic credentials,
//! or `TURN_SERVER`/`TURN_USERNAME`/`TURN_PASSWORD` for a static relay.

use beamcast::config::{load_dotenv, turn_setup_from_vars};
use beamcast::{
    BroadcastConfig, BroadcastManager, CameraKind, CaptureEncoder, ExternalEncoderSource,
    SessionFactory, SignalingAdapter, TurnProvider, TurnSetup,
};
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Single-source multi-viewer WebRTC broadcaster
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// WebSocket signaling server URL (ws:// or wss://)
    #[arg(default_value = "ws://localhost:8080")]
    signaling_url: String,

    /// Stream identifier viewers subscribe to
    #[arg(default_value = "pi-camera-stream")]
    stream_id: String,

    /// Video capture device (used for USB cameras)
    #[arg(default_value = "/dev/video0")]
    video_device: String,

    /// Audio capture device (ALSA name)
    #[arg(default_value = "default")]
    audio_device: String,

    /// Camera type: csi, legacy, usb
    #[arg(default_value = "csi")]
    camera_type: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run().await {
        error!("start failure: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> beamcast::Result<()> {
    let args = Args::parse();

    let camera: CameraKind = args.camera_type.parse()?;
    let config = BroadcastConfig {
        signaling_url: args.signaling_url,
        stream_id: args.stream_id,
        video_device: args.video_device,
        audio_device: args.audio_device,
        camera,
        turn: turn_setup_from_vars(&load_dotenv()),
        ..Default::default()
    };
    config.validate()?;

    // Cloudflare TURN is only trusted after a successful validation fetch;
    // otherwise the broadcaster degrades rather than failing.
    let (provider, turn_display) = match &config.turn {
        TurnSetup::Cloudflare(cf) => {
            let provider = TurnProvider::new(cf)?;
            match provider.get_credentials().await {
                Ok(_) => (
                    Some(provider),
                    "Cloudflare TURN (dynamic credentials)".to_string(),
                ),
                Err(e) => {
                    warn!("Cloudflare TURN configured but validation fetch failed: {}", e);
                    (None, "Not configured".to_string())
                }
            }
        }
        TurnSetup::Static(st) => (None, st.uri.clone()),
        TurnSetup::Disabled => (None, "Not configured".to_string()),
    };

    info!("=====================================");
    info!("  beamcast - WebRTC broadcaster");
    info!("  (multi-viewer, shared encoder)");
    info!("=====================================");
    info!("Signaling: {}", config.signaling_url);
    info!("Stream ID: {}", config.stream_id);
    info!("Camera:    {}", config.camera.label());
    info!("Audio:     {}", config.audio_device);
    info!("TURN:      {}", turn_display);
    if turn_display == "Not configured" {
        info!("           (set TURN_SERVER or Cloudflare keys for NAT traversal)");
    }
    info!("=====================================");

    let source = ExternalEncoderSource::new(
        config.camera,
        &config.video_device,
        &config.audio_device,
    );
    let (graph, graph_events) = CaptureEncoder::new(source);
    graph.start().await?;

    let factory = SessionFactory::new(&config, provider);
    let adapter = Arc::new(SignalingAdapter::new(&config.signaling_url));
    let manager = BroadcastManager::new(
        Arc::clone(&graph),
        graph_events,
        factory,
        Arc::clone(&adapter) as Arc<dyn beamcast::SignalingOutbound>,
    );

    adapter
        .connect(Arc::clone(&manager) as Arc<dyn beamcast::SignalingHandler>)
        .await?;
    adapter.register_broadcaster(&config.stream_id)?;

    info!("========================================");
    info!("   STREAMING READY - waiting for viewers");
    info!("========================================");

    tokio::select! {
        result = manager.run_events() => {
            // A graph fatal already ran the shutdown path.
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            manager.shutdown().await;
        }
    }

    info!("goodbye");
    Ok(())
}
