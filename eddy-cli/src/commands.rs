//! CLI command implementations

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Subcommand;
use eddy_core::config::EddyConfig;
use eddy_core::decision::DecideOptions;
use eddy_core::media::{FfprobeProbe, MediaProbe};
use eddy_core::{
    ContentStore, ContentUrls, DecisionEngine, DeviceProfile, PlaybackService, ProviderRegistry,
    StreamingFormat, TranscodeParams,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Start the playback server
    Serve {
        /// Address to bind to
        #[arg(long)]
        bind: Option<SocketAddr>,
        /// Root of the content-addressable store
        #[arg(long)]
        content_root: Option<PathBuf>,
        /// Scratch directory for in-progress transcodes
        #[arg(long)]
        temp_root: Option<PathBuf>,
        /// Directory that media file ids resolve against
        #[arg(long)]
        library_root: Option<PathBuf>,
        /// Sessions allowed to transcode at once
        #[arg(long)]
        max_concurrent: Option<usize>,
        /// Directory for durable session records
        #[arg(long)]
        state_dir: Option<PathBuf>,
    },
    /// Print the playback decision for a media file
    Decide {
        /// Path to the media file
        media: PathBuf,
        /// Device profile as JSON, or @path to a JSON file
        #[arg(long, default_value = "{}")]
        device: String,
        /// Adaptive streaming format (dash or hls)
        #[arg(long)]
        format: Option<StreamingFormat>,
    },
    /// Print the content hash and store location for transcode parameters
    Hash {
        /// Transcode parameters as JSON, or @path to a JSON file
        #[arg(long)]
        params: String,
    },
    /// Run one cleanup pass over persisted sessions and the content store
    Cleanup,
}

/// Handle the CLI command
///
/// # Errors
/// Returns appropriate error based on the command that fails
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Serve {
            bind,
            content_root,
            temp_root,
            library_root,
            max_concurrent,
            state_dir,
        } => {
            let mut config = EddyConfig::from_env()?;
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(root) = content_root {
                config.content.root = root;
            }
            if let Some(root) = temp_root {
                config.pipeline.temp_root = root;
            }
            if let Some(root) = library_root {
                config.server.library_root = root;
            }
            if let Some(count) = max_concurrent {
                config.sessions.max_concurrent = count;
            }
            if state_dir.is_some() {
                config.sessions.state_dir = state_dir;
            }
            config.validate()?;
            serve(config).await
        }
        Commands::Decide {
            media,
            device,
            format,
        } => decide(&media, &device, format).await,
        Commands::Hash { params } => hash(&params).await,
        Commands::Cleanup => cleanup().await,
    }
}

/// Runs the server and a periodic cleanup loop until Ctrl-C.
async fn serve(config: EddyConfig) -> anyhow::Result<()> {
    let playback = Arc::new(
        PlaybackService::from_config(&config)
            .await
            .context("failed to start playback service")?,
    );
    let shutdown = CancellationToken::new();

    let cleanup = playback.cleanup_service(config.content.retention);
    let interval = config.sessions.cleanup_interval;
    let cleanup_token = shutdown.child_token();
    let cleanup_task = tokio::spawn(async move { cleanup.run(interval, cleanup_token).await });

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C, shutting down"),
        }
        signal_token.cancel();
    });

    let served = eddy_web::run_server(playback, config.server.bind, shutdown.clone()).await;
    shutdown.cancel();
    if let Err(e) = cleanup_task.await {
        warn!(error = %e, "Cleanup task ended abnormally");
    }
    served.context("server failed")
}

/// Probes a file and prints the decision as JSON.
async fn decide(media: &Path, device: &str, format: Option<StreamingFormat>) -> anyhow::Result<()> {
    let config = EddyConfig::from_env()?;
    let device: DeviceProfile = parse_json_arg(device)
        .await
        .context("invalid device profile")?;

    let profile = FfprobeProbe::new(&config.pipeline.ffprobe_path)
        .probe(media)
        .await
        .with_context(|| format!("failed to probe {}", media.display()))?;

    let registry = Arc::new(ProviderRegistry::from_config(&config.pipeline)?);
    let store = Arc::new(ContentStore::open(&config.content.root).await?);
    let engine = DecisionEngine::new(
        registry,
        store,
        ContentUrls::new(&config.server.content_base_url),
        config.decision.default_format,
    );

    // Ids are library-relative so hashes match what the server computes
    let media_id = media
        .strip_prefix(&config.server.library_root)
        .unwrap_or(media)
        .to_string_lossy()
        .into_owned();
    let options = DecideOptions {
        format,
        seek_offset_ms: 0,
    };
    let decision = engine.decide(&media_id, &profile, &device, options).await?;

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "media_id": media_id,
            "profile": profile,
            "decision": decision,
        }))?
    );
    Ok(())
}

/// Prints the content hash of a parameter set and whether it is stored.
async fn hash(params: &str) -> anyhow::Result<()> {
    let config = EddyConfig::from_env()?;
    let params: TranscodeParams = parse_json_arg(params)
        .await
        .context("invalid transcode parameters")?;

    let store = ContentStore::open(&config.content.root).await?;
    let hash = store.hash(&params);
    let stored = store.exists(&hash).await;

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "content_hash": hash,
            "path": store.path(&hash),
            "stored": stored,
        }))?
    );
    Ok(())
}

/// Reloads persisted sessions, then sweeps sessions and the store once.
async fn cleanup() -> anyhow::Result<()> {
    let config = EddyConfig::from_env()?;
    let playback = PlaybackService::from_config(&config)
        .await
        .context("failed to open playback state")?;

    let report = playback
        .cleanup_service(config.content.retention)
        .run_once()
        .await;
    playback.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Reads a JSON argument given inline or as `@path`.
async fn parse_json_arg<T: serde::de::DeserializeOwned>(arg: &str) -> anyhow::Result<T> {
    let text = match arg.strip_prefix('@') {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {path}"))?,
        None => arg.to_string(),
    };
    Ok(serde_json::from_str(&text)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_parse_json_arg_inline_and_file() {
        let device: DeviceProfile = parse_json_arg(r#"{"containers":["mp4"],"codecs":["h264"]}"#)
            .await
            .unwrap();
        assert!(device.supports_container("mp4"));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.json");
        let params = TranscodeParams::new("movie", "mp4", StreamingFormat::Hls);
        std::fs::write(&path, serde_json::to_string(&params).unwrap()).unwrap();

        let parsed: TranscodeParams = parse_json_arg(&format!("@{}", path.display()))
            .await
            .unwrap();
        assert_eq!(parsed, params);
    }

    #[tokio::test]
    async fn test_parse_json_arg_rejects_garbage() {
        assert!(parse_json_arg::<DeviceProfile>("not json").await.is_err());
        assert!(
            parse_json_arg::<DeviceProfile>("@/nonexistent/device.json")
                .await
                .is_err()
        );
    }
}
