//! Headless voice session host for stdin/stdout JSON communication.
//!
//! Configuration is read from `$VOXLINE_CONFIG` or the default config path.
//! The transcription token comes from `$VOXLINE_TOKEN`; `$VOXLINE_API_KEY`
//! optionally supplies a dedicated synthesis key.
//!
//! All tracing/diagnostic output goes to stderr so that stdout remains a
//! clean JSON protocol channel.

use std::path::PathBuf;
use std::sync::Arc;
use voxline::config::StaticToken;
use voxline::host::stdio::run_stdio_bridge;
use voxline::{VoiceConfig, VoiceSession};

fn load_config() -> anyhow::Result<VoiceConfig> {
    let path = std::env::var_os("VOXLINE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(VoiceConfig::default_config_path);
    let mut config = if path.exists() {
        tracing::info!(path = %path.display(), "loading voice config");
        VoiceConfig::from_file(&path)?
    } else {
        tracing::info!(path = %path.display(), "no config file; using defaults");
        VoiceConfig::default()
    };

    if let Ok(token) = std::env::var("VOXLINE_TOKEN") {
        config = config.with_token_provider(Arc::new(StaticToken(token)));
    }
    if let Ok(key) = std::env::var("VOXLINE_API_KEY") {
        config = config.with_api_key_provider(Arc::new(StaticToken(key)));
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("voxline=info")),
        )
        .init();

    tracing::info!("voxline-host starting");

    let config = load_config()?;
    let session = VoiceSession::new(config).map_err(|e| {
        tracing::error!(error = %e, "invalid voice configuration");
        anyhow::anyhow!("voxline-host failed: {e}")
    })?;

    run_stdio_bridge(session).await.map_err(|e| {
        tracing::error!(error = %e, "voxline-host exited with error");
        anyhow::anyhow!("voxline-host failed: {e}")
    })?;

    tracing::info!("voxline-host shut down cleanly");
    Ok(())
}
