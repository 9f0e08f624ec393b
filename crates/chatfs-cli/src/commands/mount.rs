//! Mount command - mount a chatfs volume as a filesystem.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chatfs_core::{Crypto, MasterKey};
use chatfs_fuse::{ChatFilesystem, Engine};
use chatfs_index::MetadataIndex;
use chatfs_mount::ContentCache;
use chatfs_transport::{ChatTransport, HttpChatTransport, RemoteObjectStore, Throttler, ThrottlerConfig};
use clap::Args as ClapArgs;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::config::AppConfig;

#[derive(ClapArgs, Clone)]
pub struct Args {
    /// Directory to mount the volume at (defaults to `/mnt/<DriveLetter>`)
    pub mountpoint: Option<PathBuf>,

    /// Print cache hit rate and upload/download retry counts on unmount
    #[arg(long)]
    pub stats: bool,

    /// Maximum number of uploads the background queue runs concurrently
    #[arg(long, default_value = "3")]
    pub max_concurrent_uploads: usize,
}

#[instrument(level = "info", name = "cmd::mount", skip_all)]
pub async fn execute(config: &AppConfig, args: &Args) -> Result<()> {
    let mountpoint = args.mountpoint.clone().unwrap_or_else(|| default_mountpoint(config));
    if !mountpoint.exists() {
        std::fs::create_dir_all(&mountpoint)
            .with_context(|| format!("failed to create mountpoint {}", mountpoint.display()))?;
    }

    let engine = Arc::new(build_engine(config, args.max_concurrent_uploads).await?);
    let upload_stats = engine.upload_queue().stats();

    let rt_handle = tokio::runtime::Handle::current();
    let fs = ChatFilesystem::new(Arc::clone(&engine), rt_handle, current_uid(), current_gid());

    let options = vec![fuser::MountOption::FSName("chatfs".to_string()), fuser::MountOption::AutoUnmount];

    eprintln!("Mounting chatfs at {}...", mountpoint.display());
    let session = fuser::spawn_mount2(fs, &mountpoint, &options).context("failed to mount chatfs")?;
    eprintln!("Mounted. Press Ctrl+C to unmount.");

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;

    eprintln!("Unmounting...");
    drop(session);

    if args.stats {
        let (hits, misses) = engine.cache_hit_stats();
        let total = hits + misses;
        #[allow(clippy::cast_precision_loss)]
        let hit_rate = if total == 0 { 0.0 } else { 100.0 * hits as f64 / total as f64 };
        println!("Content cache: {hits} hits, {misses} misses ({hit_rate:.1}% hit rate)");
        println!(
            "Background uploads: {} completed, {} failed, {} in flight",
            upload_stats.completed.load(std::sync::atomic::Ordering::Relaxed),
            upload_stats.failed.load(std::sync::atomic::Ordering::Relaxed),
            upload_stats.in_flight.load(std::sync::atomic::Ordering::Relaxed),
        );
    }

    match Arc::try_unwrap(engine) {
        Ok(engine) => engine.shutdown(),
        Err(_) => tracing::warn!("engine still has outstanding references at shutdown; key material not zeroed"),
    }

    eprintln!("Unmounted.");
    Ok(())
}

fn default_mountpoint(config: &AppConfig) -> PathBuf {
    PathBuf::from("/mnt").join(config.filesystem.driveletter.to_lowercase())
}

async fn build_engine(config: &AppConfig, max_concurrent_uploads: usize) -> Result<Engine> {
    let crypto = if config.security.enableencryption {
        let key = match &config.security.masterkey {
            Some(encoded) => decode_master_key(encoded)?,
            None => load_or_generate_key(config)?,
        };
        Some(Crypto::new(key))
    } else {
        None
    };

    let index = Arc::new(MetadataIndex::open(config.database_path())?);
    let cache = Arc::new(ContentCache::new(u64::from(config.filesystem.cachesizemb) * 1024 * 1024));

    let http_client = reqwest::Client::new();
    let transport = HttpChatTransport::new(http_client.clone());
    transport.connect(&config.discord.bottoken).await.context("failed to authenticate with the chat service")?;
    transport
        .await_ready(std::time::Duration::from_secs(30))
        .await
        .context("timed out waiting for the chat service to become ready")?;
    transport.resolve_channel(config.discord.channelid).await.context("failed to resolve the configured channel")?;

    let throttler = Arc::new(Throttler::new(ThrottlerConfig {
        min_delay_secs: config.throttle.mindelaysecs,
        max_delay_secs: config.throttle.maxdelaysecs,
        backoff_multiplier: config.throttle.backoffmultiplier,
    }));
    let remote = Arc::new(RemoteObjectStore::new(Arc::new(transport), throttler, http_client));

    let cancel = CancellationToken::new();
    Ok(Engine::new(crypto, index, cache, remote, max_concurrent_uploads, cancel))
}

fn decode_master_key(encoded: &str) -> Result<MasterKey> {
    use base64::Engine as _;
    let bytes = base64::engine::general_purpose::STANDARD.decode(encoded).context("Security.MasterKey is not valid base64")?;
    let arr: [u8; 32] = bytes.try_into().map_err(|_| anyhow::anyhow!("Security.MasterKey must decode to 32 bytes"))?;
    Ok(MasterKey::from_bytes(arr))
}

fn load_or_generate_key(config: &AppConfig) -> Result<MasterKey> {
    let path = config.master_key_file();
    if path.exists() {
        let encoded = std::fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
        decode_master_key(encoded.trim())
    } else {
        anyhow::bail!(
            "no master key found at {}; run `chatfs keygen` first, or set Security.MasterKey",
            path.display()
        );
    }
}

#[cfg(unix)]
fn current_uid() -> u32 {
    // SAFETY: getuid takes no arguments and cannot fail.
    unsafe { libc::getuid() }
}

#[cfg(unix)]
fn current_gid() -> u32 {
    // SAFETY: getgid takes no arguments and cannot fail.
    unsafe { libc::getgid() }
}
