//! Remote Object Store: the throttled, retrying uploader/downloader/deleter
//! built on top of a [`ChatTransport`].

use std::sync::Arc;
use std::time::Duration;

use chatfs_core::ChunkRef;
use rand::seq::SliceRandom;
use reqwest::Client;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::obfuscate::{hash_file_name, obfuscated_filename};
use crate::throttler::Throttler;
use crate::transport::{ChatTransport, TransportError};

const MAX_UPLOAD_ATTEMPTS: u32 = 5;
const MAX_DOWNLOAD_ATTEMPTS: u32 = 5;
const UPLOAD_CONCURRENCY: usize = 3;
const DOWNLOAD_RETRY_BASE_SECS: f64 = 2.0;
const DOWNLOAD_UA_DELAY_RANGE_SECS: std::ops::Range<f64> = 0.2..0.8;
const RATE_LIMIT_PAUSE_SECS: f64 = 60.0;

const USER_AGENTS: [&str; 5] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_4) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Mobile/15E148 Safari/604.1",
];

#[derive(Debug, Error)]
pub enum RemoteStoreError {
    #[error("upload exhausted after {0} attempts")]
    UploadExhausted(u32),

    #[error("download exhausted after {0} attempts")]
    DownloadExhausted(u32),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Uploader/downloader/deleter against a chat channel, gated by a
/// concurrency-3 semaphore and paced by a [`Throttler`].
pub struct RemoteObjectStore {
    transport: Arc<dyn ChatTransport>,
    throttler: Arc<Throttler>,
    upload_gate: Semaphore,
    http_client: Client,
}

impl RemoteObjectStore {
    #[must_use]
    pub fn new(transport: Arc<dyn ChatTransport>, throttler: Arc<Throttler>, http_client: Client) -> Self {
        Self { transport, throttler, upload_gate: Semaphore::new(UPLOAD_CONCURRENCY), http_client }
    }

    /// Uploads one chunk, retrying through rate limits and transient errors.
    /// Holds the concurrency-gate permit for the whole attempt sequence.
    pub async fn upload(
        &self,
        bytes: Vec<u8>,
        original_file_name: &str,
        chunk_index: u32,
        crc32: u32,
        cancel: &CancellationToken,
    ) -> Result<ChunkRef, RemoteStoreError> {
        let _permit = self.upload_gate.acquire().await.expect("upload gate semaphore is never closed");
        let size_bytes = bytes.len() as u64;

        for attempt in 0..MAX_UPLOAD_ATTEMPTS {
            let filename = obfuscated_filename(original_file_name, chunk_index);
            self.throttler.wait(cancel).await.map_err(|_| RemoteStoreError::Cancelled)?;

            match self.transport.send_file_attachment(bytes.clone(), &filename).await {
                Ok(att) => {
                    self.throttler.register_success();
                    info!(
                        chunk_index,
                        filename = hash_file_name(&filename),
                        "chunk uploaded"
                    );
                    return Ok(ChunkRef {
                        chunk_index,
                        message_id: att.message_id,
                        attachment_url: att.attachment_url,
                        size_bytes,
                        crc32,
                    });
                }
                Err(err) if err.is_rate_limited() => {
                    self.throttler.register_error(Some(429));
                    self.throttler
                        .rate_limit_pause(RATE_LIMIT_PAUSE_SECS, cancel)
                        .await
                        .map_err(|_| RemoteStoreError::Cancelled)?;
                }
                Err(err) => {
                    warn!(chunk_index, attempt, error = %err, "chunk upload attempt failed");
                    self.throttler.register_error(err.http_status());
                    let backoff = Duration::from_secs_f64(5.0 * f64::from(attempt + 1));
                    tokio::select! {
                        () = cancel.cancelled() => return Err(RemoteStoreError::Cancelled),
                        () = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
        Err(RemoteStoreError::UploadExhausted(MAX_UPLOAD_ATTEMPTS))
    }

    /// Downloads one chunk's bytes, retrying with exponential backoff.
    /// Not gated by the upload semaphore; each call manages its own pacing.
    pub async fn download(&self, url: &str, cancel: &CancellationToken) -> Result<Vec<u8>, RemoteStoreError> {
        let mut backoff_secs = DOWNLOAD_RETRY_BASE_SECS;

        for attempt in 0..MAX_DOWNLOAD_ATTEMPTS {
            let ua = USER_AGENTS.choose(&mut rand::thread_rng()).expect("non-empty UA pool");
            let jitter = rand::thread_rng()
                .gen_range_f64(DOWNLOAD_UA_DELAY_RANGE_SECS.start..DOWNLOAD_UA_DELAY_RANGE_SECS.end);
            tokio::select! {
                () = cancel.cancelled() => return Err(RemoteStoreError::Cancelled),
                () = tokio::time::sleep(Duration::from_secs_f64(jitter)) => {}
            }

            let resp = self.http_client.get(url).header("User-Agent", *ua).send().await;
            match resp {
                Ok(r) if r.status().is_success() => {
                    return Ok(r.bytes().await.map_err(TransportError::from)?.to_vec());
                }
                Ok(r) if r.status().as_u16() == 429 => {
                    warn!(attempt, "download rate limited, pausing 60s");
                    tokio::select! {
                        () = cancel.cancelled() => return Err(RemoteStoreError::Cancelled),
                        () = tokio::time::sleep(Duration::from_secs(60)) => {}
                    }
                    // A 429 pause does not advance the exponential schedule.
                }
                Ok(r) => {
                    warn!(attempt, status = r.status().as_u16(), "download attempt failed");
                    tokio::select! {
                        () = cancel.cancelled() => return Err(RemoteStoreError::Cancelled),
                        () = tokio::time::sleep(Duration::from_secs_f64(backoff_secs)) => {}
                    }
                    backoff_secs *= 2.0;
                }
                Err(err) => {
                    warn!(attempt, error = %err, "download transport error");
                    tokio::select! {
                        () = cancel.cancelled() => return Err(RemoteStoreError::Cancelled),
                        () = tokio::time::sleep(Duration::from_secs_f64(backoff_secs)) => {}
                    }
                    backoff_secs *= 2.0;
                }
            }
        }
        Err(RemoteStoreError::DownloadExhausted(MAX_DOWNLOAD_ATTEMPTS))
    }

    /// Best-effort: resolve then delete. Failures are logged and swallowed.
    pub async fn delete(&self, message_id: u64, cancel: &CancellationToken) {
        if self.throttler.wait(cancel).await.is_err() {
            return;
        }
        if let Err(err) = self.transport.get_message(message_id).await {
            warn!(message_id, error = %err, "could not resolve message before delete, attempting delete anyway");
        }
        if let Err(err) = self.transport.delete_message(message_id).await {
            warn!(message_id, error = %err, "best-effort delete failed");
        }
    }

    pub async fn delete_many(&self, message_ids: &[u64], cancel: &CancellationToken) {
        for &id in message_ids {
            self.delete(id, cancel).await;
        }
    }
}

trait RngRangeF64Ext {
    fn gen_range_f64(&mut self, range: std::ops::Range<f64>) -> f64;
}

impl<T: rand::Rng> RngRangeF64Ext for T {
    fn gen_range_f64(&mut self, range: std::ops::Range<f64>) -> f64 {
        self.gen_range(range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct StubTransport {
        upload_responses: Mutex<Vec<Result<(u64, String), TransportError>>>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ChatTransport for StubTransport {
        async fn connect(&self, _token: &str) -> Result<(), TransportError> {
            Ok(())
        }
        async fn await_ready(&self, _timeout: Duration) -> Result<(), TransportError> {
            Ok(())
        }
        async fn resolve_channel(&self, _channel_id: u64) -> Result<(), TransportError> {
            Ok(())
        }
        async fn send_file_attachment(
            &self,
            _bytes: Vec<u8>,
            _filename: &str,
        ) -> Result<crate::transport::AttachmentRef, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.upload_responses.lock().unwrap();
            match responses.remove(0) {
                Ok((message_id, attachment_url)) => {
                    Ok(crate::transport::AttachmentRef { message_id, attachment_url })
                }
                Err(err) => Err(err),
            }
        }
        async fn get_message(&self, _message_id: u64) -> Result<(), TransportError> {
            Ok(())
        }
        async fn delete_message(&self, _message_id: u64) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_storm_retries_and_eventually_succeeds() {
        let transport = Arc::new(StubTransport {
            upload_responses: Mutex::new(vec![
                Err(TransportError::RateLimited { retry_after_secs: 1.0 }),
                Err(TransportError::RateLimited { retry_after_secs: 1.0 }),
                Err(TransportError::RateLimited { retry_after_secs: 1.0 }),
                Ok((42, "https://example.invalid/chunk0".to_string())),
            ]),
            calls: AtomicU32::new(0),
        });
        let throttler = Arc::new(Throttler::new(crate::throttler::ThrottlerConfig::default()));
        let store = RemoteObjectStore::new(transport.clone(), Arc::clone(&throttler), Client::new());

        let cancel = CancellationToken::new();
        let result = store.upload(b"data".to_vec(), "/a.bin", 0, 0xDEAD_BEEF, &cancel).await.unwrap();

        assert_eq!(result.message_id, 42);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 4);
        assert!(throttler.current_multiplier() >= 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_five_failed_attempts() {
        let transport = Arc::new(StubTransport {
            upload_responses: Mutex::new(vec![
                Err(TransportError::Status { status: 500, body: String::new() });
                5
            ]),
            calls: AtomicU32::new(0),
        });
        let throttler = Arc::new(Throttler::new(crate::throttler::ThrottlerConfig::default()));
        let store = RemoteObjectStore::new(transport, Arc::clone(&throttler), Client::new());

        let cancel = CancellationToken::new();
        let err = store.upload(b"data".to_vec(), "/a.bin", 0, 0, &cancel).await.unwrap_err();
        assert!(matches!(err, RemoteStoreError::UploadExhausted(5)));
    }
}
