//! Full-stack exercises of [`Engine`] against a stub chat transport backed
//! by a real HTTP server, so reassembly genuinely round-trips bytes through
//! the network path rather than a download closure the test wrote itself.
//!
//! Modeled on the workflow-level integration tests the FUSE layer's backing
//! vault implementation keeps in its own `tests/` directory (one file per
//! end-to-end scenario, built against an in-process harness rather than a
//! real mount).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chatfs_core::{ChunkError, Crypto, MasterKey, VirtualPath};
use chatfs_fuse::{Engine, OpenMode};
use chatfs_index::MetadataIndex;
use chatfs_mount::{AdapterError, ContentCache};
use chatfs_transport::{
    AttachmentRef, ChatTransport, RemoteObjectStore, Throttler, ThrottlerConfig, TransportError,
};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path_regex};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Serves every uploaded chunk back over a real HTTP connection, keyed by
/// the message id embedded in its URL. `corrupt` lets a test overwrite a
/// chunk's stored bytes in place, simulating corruption in the backing
/// store between upload and a later read.
struct ChunkResponder(Arc<DashMap<u64, Vec<u8>>>);

impl Respond for ChunkResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let id: Option<u64> = request.url.path().rsplit('/').next().and_then(|s| s.parse().ok());
        match id.and_then(|id| self.0.get(&id).map(|b| b.clone())) {
            Some(bytes) => ResponseTemplate::new(200).set_body_bytes(bytes),
            None => ResponseTemplate::new(404),
        }
    }
}

struct StubTransport {
    server: MockServer,
    chunks: Arc<DashMap<u64, Vec<u8>>>,
    next_id: AtomicU64,
}

impl StubTransport {
    async fn new() -> Self {
        let server = MockServer::start().await;
        let chunks = Arc::new(DashMap::new());

        Mock::given(method("GET"))
            .and(path_regex(r"^/attachments/\d+$"))
            .respond_with(ChunkResponder(Arc::clone(&chunks)))
            .mount(&server)
            .await;

        Self { server, chunks, next_id: AtomicU64::new(1) }
    }

    /// Overwrites the bytes stored behind `message_id` so the next download
    /// of that chunk returns `bytes` instead of what was originally uploaded.
    fn corrupt(&self, message_id: u64, bytes: Vec<u8>) {
        self.chunks.insert(message_id, bytes);
    }
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

    async fn send_file_attachment(&self, bytes: Vec<u8>, _filename: &str) -> Result<AttachmentRef, TransportError> {
        let message_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.chunks.insert(message_id, bytes);
        Ok(AttachmentRef { message_id, attachment_url: format!("{}/attachments/{message_id}", self.server.uri()) })
    }

    async fn get_message(&self, _message_id: u64) -> Result<(), TransportError> {
        Ok(())
    }

    async fn delete_message(&self, _message_id: u64) -> Result<(), TransportError> {
        Ok(())
    }
}

async fn build_engine() -> (Engine, Arc<StubTransport>) {
    let index = Arc::new(MetadataIndex::open_in_memory().expect("in-memory index opens"));
    let cache = Arc::new(ContentCache::new(64 * 1024 * 1024));
    let transport = Arc::new(StubTransport::new().await);
    let throttler = Arc::new(Throttler::new(ThrottlerConfig::default()));
    let remote = Arc::new(RemoteObjectStore::new(Arc::clone(&transport), throttler, reqwest::Client::new()));
    let crypto = Crypto::new(MasterKey::generate());
    (Engine::new(Some(crypto), index, cache, remote, 3, CancellationToken::new()), transport)
}

/// Writes `content` to `path` through the engine and blocks until the
/// detached background upload the close triggers has actually completed,
/// polling the upload queue's own completion counter rather than sleeping a
/// fixed guess.
async fn write_and_close(engine: &Engine, path: &VirtualPath, content: &[u8]) {
    engine.open_or_create(path, OpenMode::CreateNew).await.expect("create succeeds");
    if !content.is_empty() {
        engine.write(path, 0, content).expect("write succeeds");
    }
    let stats = engine.upload_queue().stats();
    let before = stats.completed.load(Ordering::SeqCst) + stats.failed.load(Ordering::SeqCst);
    engine.cleanup(path);

    for _ in 0..200 {
        let now = stats.completed.load(Ordering::SeqCst) + stats.failed.load(Ordering::SeqCst);
        if now > before {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(stats.failed.load(Ordering::SeqCst), 0, "background upload should not have failed");
}

#[tokio::test]
async fn small_file_round_trips_through_upload_and_reassembly() {
    let (engine, _transport) = build_engine().await;
    let file = VirtualPath::from("notes/todo.txt");

    write_and_close(&engine, &file, b"buy milk").await;

    let info = engine.get_file_info(&file).expect("record exists after close");
    assert_eq!(info.size_bytes, 8);

    let read_back = engine.read(&file, 0, 8).await.expect("read succeeds");
    assert_eq!(read_back, b"buy milk");
}

#[tokio::test]
async fn a_file_closed_without_any_write_uploads_zero_chunks() {
    let (engine, _transport) = build_engine().await;
    let file = VirtualPath::from("touched.txt");

    write_and_close(&engine, &file, b"").await;

    let info = engine.get_file_info(&file).expect("record exists after close");
    assert_eq!(info.size_bytes, 0);
    assert!(info.chunks.is_empty(), "an empty file uploads nothing");

    let read_back = engine.read(&file, 0, 10).await.expect("read succeeds");
    assert!(read_back.is_empty());
}

#[tokio::test]
async fn a_file_spanning_multiple_chunks_reassembles_in_order() {
    let (engine, _transport) = build_engine().await;
    let file = VirtualPath::from("big.bin");

    // One full CHUNK_MAX plaintext encrypts to CHUNK_MAX + 28 bytes, which
    // spills into a second ciphertext chunk.
    let content: Vec<u8> = (0..chatfs_core::chunker::CHUNK_MAX).map(|i| (i % 251) as u8).collect();
    write_and_close(&engine, &file, &content).await;

    let info = engine.get_file_info(&file).expect("record exists after close");
    assert_eq!(info.chunks.len(), 2, "a CHUNK_MAX-sized file should span two ciphertext chunks");
    assert_eq!(info.size_bytes, content.len() as u64);

    let read_back = engine.read(&file, 0, content.len()).await.expect("read succeeds");
    assert_eq!(read_back, content);
}

#[tokio::test]
async fn corrupting_a_stored_chunk_surfaces_as_a_chunk_integrity_error_on_read() {
    let (engine, transport) = build_engine().await;
    let file = VirtualPath::from("tampered.bin");

    write_and_close(&engine, &file, b"a secret worth protecting").await;

    let info = engine.get_file_info(&file).expect("record exists after close");
    let chunk = &info.chunks[0];
    transport.corrupt(chunk.message_id, vec![0xFFu8; chunk.size_bytes as usize]);

    let err = engine.read(&file, 0, 26).await.unwrap_err();
    assert!(matches!(err, AdapterError::Chunk(ChunkError::IntegrityFailure { index: 0 })));
}

#[tokio::test]
async fn renaming_a_file_preserves_its_content() {
    let (engine, _transport) = build_engine().await;
    let from = VirtualPath::from("drafts/a.txt");
    let to = VirtualPath::from("final/a.txt");

    write_and_close(&engine, &from, b"first draft").await;
    engine.mkdir(&VirtualPath::from("final")).expect("mkdir succeeds");
    engine.move_path(&from, &to, false).expect("rename succeeds");

    assert!(engine.get_file_info(&from).is_err(), "the old path should be gone");
    let read_back = engine.read(&to, 0, 64).await.expect("read from the new path succeeds");
    assert_eq!(read_back, b"first draft");
}
