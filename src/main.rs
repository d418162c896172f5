#![forbid(unsafe_code)]

mod auth;
mod config;
mod media;
mod metrics;
mod room;
mod router;
mod signaling;

use anyhow::{Context, Result};
use auth::TokenValidator;
use config::ServerConfig;
use metrics::ServerMetrics;
use router::Router;
use signaling::SignalingServer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roomcast=debug,webrtc=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("roomcast - starting SFU");

    let cfg = ServerConfig::from_env();

    // The verification key is mandatory; refusing to start without it is
    // the only way to keep the join gate meaningful.
    let pem = std::fs::read(&cfg.public_key_path)
        .with_context(|| format!("cannot read public key at {}", cfg.public_key_path))?;
    let validator = TokenValidator::from_rsa_pem(&pem)
        .with_context(|| format!("invalid public key at {}", cfg.public_key_path))?;
    info!("Loaded join-token public key from {}", cfg.public_key_path);

    let api = media::build_api(&cfg).context("building webrtc API")?;
    info!(
        "Media: Opus PT{} / VP8 PT{}, ICE ports {}-{}, STUN {}",
        media::AUDIO_PAYLOAD_TYPE,
        media::VIDEO_PAYLOAD_TYPE,
        cfg.ice_port_min,
        cfg.ice_port_max,
        cfg.stun_server
    );

    let metrics = ServerMetrics::new();
    let port = cfg.port;
    let max_connections = cfg.max_connections;

    let (router, handle, events) = Router::new(cfg, validator, api, metrics.clone());
    let loop_task = tokio::spawn(router.run(events));

    let server = SignalingServer::new(handle, metrics, max_connections);

    // Run server with graceful shutdown
    tokio::select! {
        result = server.serve(port) => {
            if let Err(e) = result {
                tracing::error!("Signaling server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    loop_task.abort();
    info!("Server shutdown complete");
    Ok(())
}
