//! `chatfsmount`: a thin standalone binary that mounts a chatfs volume
//! without going through the `chatfs` CLI's full configuration layering.
//! Reads the same `CHATFS_*` environment variables the CLI's config loader
//! recognizes (see `chatfs-cli::config`), for scripted or containerized use
//! where a TOML file is overkill.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chatfs_core::{Crypto, MasterKey};
use chatfs_fuse::{ChatFilesystem, Engine};
use chatfs_index::MetadataIndex;
use chatfs_mount::ContentCache;
use chatfs_transport::{ChatTransport, HttpChatTransport, RemoteObjectStore, Throttler, ThrottlerConfig};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into())).init();

    let mountpoint: PathBuf = env::args().nth(1).context("usage: chatfsmount <mountpoint>")?.into();

    let rt = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    let engine = rt.block_on(build_engine())?;

    let fs = ChatFilesystem::new(Arc::new(engine), rt.handle().clone(), current_uid(), current_gid());

    let options = vec![fuser::MountOption::FSName("chatfs".to_string()), fuser::MountOption::AutoUnmount];
    let session = fuser::spawn_mount2(fs, &mountpoint, &options).context("failed to mount chatfs")?;

    rt.block_on(async {
        let _ = tokio::signal::ctrl_c().await;
    });

    drop(session);
    Ok(())
}

async fn build_engine() -> Result<Engine> {
    let bot_token = env::var("CHATFS_DISCORD_BOTTOKEN").context("CHATFS_DISCORD_BOTTOKEN is required")?;
    let channel_id: u64 = env::var("CHATFS_DISCORD_CHANNELID")
        .context("CHATFS_DISCORD_CHANNELID is required")?
        .parse()
        .context("CHATFS_DISCORD_CHANNELID must be a u64")?;

    let enable_encryption = env::var("CHATFS_SECURITY_ENABLEENCRYPTION").map(|v| v != "false" && v != "0").unwrap_or(true);

    let crypto = if enable_encryption {
        let key_bytes = match env::var("CHATFS_SECURITY_MASTERKEY") {
            Ok(b64) => {
                use base64::Engine as _;
                let bytes = base64::engine::general_purpose::STANDARD.decode(b64).context("CHATFS_SECURITY_MASTERKEY is not valid base64")?;
                let arr: [u8; 32] = bytes.try_into().map_err(|_| anyhow::anyhow!("master key must be 32 bytes"))?;
                MasterKey::from_bytes(arr)
            }
            Err(_) => MasterKey::generate(),
        };
        Some(Crypto::new(key_bytes))
    } else {
        None
    };

    let db_path = env::var("CHATFS_INDEX_DATABASEPATH").unwrap_or_else(|_| "chatfs-index.sqlite3".to_string());
    let index = Arc::new(MetadataIndex::open(&db_path)?);

    let cache_budget_mb: u64 = env::var("CHATFS_FILESYSTEM_CACHESIZEMB").ok().and_then(|v| v.parse().ok()).unwrap_or(256);
    let cache = Arc::new(ContentCache::new(cache_budget_mb * 1024 * 1024));

    let http_client = reqwest::Client::new();
    let transport = HttpChatTransport::new(http_client.clone());
    transport.connect(&bot_token).await.context("failed to authenticate with the chat service")?;
    transport.resolve_channel(channel_id).await.context("failed to resolve the configured channel")?;

    let throttler = Arc::new(Throttler::new(ThrottlerConfig::default()));
    let remote = Arc::new(RemoteObjectStore::new(Arc::new(transport), throttler, http_client));

    let cancel = CancellationToken::new();
    Ok(Engine::new(crypto, index, cache, remote, 3, cancel))
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
