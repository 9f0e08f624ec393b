//! The Filesystem Adapter (C7): translates kernel-agnostic file-op calls
//! into engine operations across crypto, chunking, the remote object store,
//! the metadata index, and the content cache.
//!
//! This module knows nothing about FUSE. [`crate::fs::ChatFilesystem`] is
//! the one piece that speaks `fuser`'s inode-based vocabulary; everything
//! here is path-keyed, matching the callback contract this was built
//! against.

use std::sync::Arc;

use chatfs_core::{ChunkRef, Chunker, Crypto, FileRecord, VirtualPath};
use chatfs_index::MetadataIndex;
use chatfs_mount::{AdapterError, AdapterResult, ContentCache, UploadQueue, WriteBuffer};
use chatfs_transport::RemoteObjectStore;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Mirrors the Windows-style open dispositions the original callback
/// surface distinguishes between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    CreateNew,
    Create,
    Truncate,
    Open,
    OpenOrCreate,
    Append,
}

#[derive(Debug, Clone, Copy)]
pub struct OpenOutcome {
    pub is_directory: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct VolumeInfo {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

impl Default for VolumeInfo {
    fn default() -> Self {
        // A fixed 1 TiB total, 999 GiB free; there is no real quota to report.
        Self { total_bytes: 1024 * 1024 * 1024 * 1024, free_bytes: 999 * 1024 * 1024 * 1024 }
    }
}

fn cache_key(path: &VirtualPath) -> String {
    format!("file:{}", path.as_str())
}

/// Bridges path-based file-op calls to the storage engine. Holds the
/// per-path write-buffer and read-cache maps described in the adapter spec;
/// every other component (crypto, chunker, index, cache, remote store) is
/// owned elsewhere and only borrowed here.
pub struct Engine {
    crypto: Option<Crypto>,
    chunker: Chunker,
    index: Arc<MetadataIndex>,
    cache: Arc<ContentCache>,
    remote: Arc<RemoteObjectStore>,
    upload_queue: UploadQueue,
    write_buffers: DashMap<VirtualPath, Arc<SyncMutex<WriteBuffer>>>,
    read_cache: DashMap<VirtualPath, Vec<u8>>,
    cancel: CancellationToken,
}

impl Engine {
    #[must_use]
    pub fn new(
        crypto: Option<Crypto>,
        index: Arc<MetadataIndex>,
        cache: Arc<ContentCache>,
        remote: Arc<RemoteObjectStore>,
        max_concurrent_uploads: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            crypto,
            chunker: Chunker::new(),
            index,
            cache,
            remote,
            upload_queue: UploadQueue::new(max_concurrent_uploads),
            write_buffers: DashMap::new(),
            read_cache: DashMap::new(),
            cancel,
        }
    }

    #[must_use]
    pub fn upload_queue(&self) -> &UploadQueue {
        &self.upload_queue
    }

    /// `(hits, misses)` against the content cache since the engine started.
    #[must_use]
    pub fn cache_hit_stats(&self) -> (u64, u64) {
        self.cache.hit_stats()
    }

    /// Open/create semantics per the honored disposition. Root and existing
    /// directories always succeed with `is_directory` set.
    ///
    /// Async only because `Append` of an existing file must preload the
    /// buffer via [`Self::load_file_data`]; every other disposition never
    /// touches the network.
    pub async fn open_or_create(&self, path: &VirtualPath, mode: OpenMode) -> AdapterResult<OpenOutcome> {
        if path.is_root() {
            return Ok(OpenOutcome { is_directory: true });
        }

        let existing = self.index.get(path).map_err(|e| AdapterError::Internal(e.to_string()))?;
        if let Some(record) = &existing {
            if record.is_directory {
                return Ok(OpenOutcome { is_directory: true });
            }
        }

        match mode {
            OpenMode::CreateNew => {
                if existing.is_some() {
                    return Err(AdapterError::AlreadyExists);
                }
                self.start_write_buffer(path, WriteBuffer::new_for_create(path.clone()));
            }
            OpenMode::Create | OpenMode::Truncate => {
                if mode == OpenMode::Truncate && existing.is_none() {
                    return Err(AdapterError::NotFound);
                }
                self.start_write_buffer(path, WriteBuffer::new_for_create(path.clone()));
            }
            OpenMode::Open => {
                if existing.is_none() {
                    return Err(AdapterError::NotFound);
                }
            }
            OpenMode::OpenOrCreate => {
                if existing.is_none() {
                    self.start_write_buffer(path, WriteBuffer::new_for_create(path.clone()));
                }
            }
            OpenMode::Append => {
                if existing.is_some() {
                    let body = self.load_file_data(path).await?;
                    self.start_write_buffer(path, WriteBuffer::new(path.clone(), body));
                } else {
                    self.start_write_buffer(path, WriteBuffer::new_empty(path.clone()));
                }
            }
        }

        Ok(OpenOutcome { is_directory: false })
    }

    fn start_write_buffer(&self, path: &VirtualPath, buffer: WriteBuffer) {
        self.write_buffers.insert(path.clone(), Arc::new(SyncMutex::new(buffer)));
    }

    /// Writes are serialized per path by that path's own buffer mutex.
    pub fn write(&self, path: &VirtualPath, offset: u64, data: &[u8]) -> AdapterResult<usize> {
        let buffer = self
            .write_buffers
            .entry(path.clone())
            .or_insert_with(|| Arc::new(SyncMutex::new(WriteBuffer::new_empty(path.clone()))));
        let mut guard = buffer.lock();
        Ok(guard.write(offset, data))
    }

    /// Serves from the session read cache if present, else populates it via
    /// [`Self::load_file_data`]. Reads past EOF succeed with zero bytes.
    pub async fn read(&self, path: &VirtualPath, offset: u64, size: usize) -> AdapterResult<Vec<u8>> {
        if let Some(cached) = self.read_cache.get(path) {
            return Ok(slice_at(&cached, offset, size));
        }
        let body = self.load_file_data(path).await?;
        let out = slice_at(&body, offset, size);
        self.read_cache.insert(path.clone(), body);
        Ok(out)
    }

    /// Checks the content cache; on miss, reassembles from the index's
    /// chunk refs through the remote store, then populates the cache.
    async fn load_file_data(&self, path: &VirtualPath) -> AdapterResult<Vec<u8>> {
        let key = cache_key(path);
        if let Some(bytes) = self.cache.get(&key) {
            return Ok(bytes.to_vec());
        }

        let record = self.index.get(path).map_err(|e| AdapterError::Internal(e.to_string()))?.ok_or(AdapterError::NotFound)?;

        let remote = Arc::clone(&self.remote);
        let cancel = self.cancel.clone();

        let body = self
            .chunker
            .reassemble_from_refs(
                &record.chunks,
                |url| {
                    let remote = Arc::clone(&remote);
                    let cancel = cancel.clone();
                    let url = url.to_string();
                    async move {
                        remote.download(&url, &cancel).await.map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
                    }
                },
                self.crypto.as_ref(),
            )
            .await
            .map_err(AdapterError::from)?;

        self.cache.add(key, body.clone());
        Ok(body)
    }

    /// Snapshots and removes the write buffer, then hands the snapshot to a
    /// detached background upload task. The filesystem call returns
    /// immediately regardless of how the task eventually resolves.
    pub fn cleanup(&self, path: &VirtualPath) {
        let Some((_, buffer)) = self.write_buffers.remove(path) else { return };
        self.read_cache.remove(path);

        let content = Arc::try_unwrap(buffer).map_or_else(|arc| arc.lock().clone_content(), |m| m.into_inner().into_content());

        let index = Arc::clone(&self.index);
        let remote = Arc::clone(&self.remote);
        let cache = Arc::clone(&self.cache);
        let cancel = self.cancel.clone();
        let chunker = self.chunker;
        let crypto = self.crypto.clone();
        let path = path.clone();

        self.upload_queue.spawn(format!("upload:{}", chatfs_transport::hash_file_name(path.as_str())), async move {
            upload_closed_file(path, content, chunker, crypto, remote, index, cache, cancel)
                .await
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
        });
    }

    pub fn delete_file(&self, path: &VirtualPath) -> AdapterResult<()> {
        let record = self.index.get(path).map_err(|e| AdapterError::Internal(e.to_string()))?.ok_or(AdapterError::NotFound)?;

        let ids: Vec<u64> = record.chunks.iter().map(|c| c.message_id).collect();
        let remote = Arc::clone(&self.remote);
        let cancel = self.cancel.clone();
        self.upload_queue.spawn(format!("delete:{}", chatfs_transport::hash_file_name(path.as_str())), async move {
            remote.delete_many(&ids, &cancel).await;
            Ok(())
        });

        self.index.delete(path).map_err(|e| AdapterError::Internal(e.to_string()))?;
        self.cache.evict_by_prefix(&cache_key(path));
        self.read_cache.remove(path);
        Ok(())
    }

    pub fn delete_directory(&self, path: &VirtualPath) -> AdapterResult<()> {
        let children = self.index.list(path).map_err(|e| AdapterError::Internal(e.to_string()))?;
        if !children.is_empty() {
            return Err(AdapterError::NotEmpty);
        }
        self.index.delete(path).map_err(|e| AdapterError::Internal(e.to_string()))?;
        Ok(())
    }

    pub fn mkdir(&self, path: &VirtualPath) -> AdapterResult<()> {
        if self.index.exists(path).map_err(|e| AdapterError::Internal(e.to_string()))? {
            return Err(AdapterError::AlreadyExists);
        }
        let record = FileRecord::new_directory(path.clone(), Utc::now());
        self.index.save(&record).map_err(|e| AdapterError::Internal(e.to_string()))?;
        Ok(())
    }

    pub fn list(&self, dir: &VirtualPath) -> AdapterResult<Vec<FileRecord>> {
        self.index.list(dir).map_err(|e| AdapterError::Internal(e.to_string()))
    }

    pub fn get_file_info(&self, path: &VirtualPath) -> AdapterResult<FileRecord> {
        if path.is_root() {
            return Ok(FileRecord::new_directory(VirtualPath::root(), Utc::now()));
        }
        self.index.get(path).map_err(|e| AdapterError::Internal(e.to_string()))?.ok_or(AdapterError::NotFound)
    }

    /// Fails `NotFound` if the source is absent, `AlreadyExists` if the
    /// destination exists and `replace` is false. If `replace` is true and
    /// the destination exists, the index overwrites it atomically and this
    /// best-effort deletes the overwritten destination's chunks from the
    /// remote store. Evicts the cached body of both the source and the
    /// destination.
    pub fn move_path(&self, from: &VirtualPath, to: &VirtualPath, replace: bool) -> AdapterResult<()> {
        if !self.index.exists(from).map_err(|e| AdapterError::Internal(e.to_string()))? {
            return Err(AdapterError::NotFound);
        }
        if !replace && self.index.exists(to).map_err(|e| AdapterError::Internal(e.to_string()))? {
            return Err(AdapterError::AlreadyExists);
        }
        let orphaned_ids = self.index.rename(from, to, Utc::now()).map_err(|e| AdapterError::Internal(e.to_string()))?;
        if !orphaned_ids.is_empty() {
            let remote = Arc::clone(&self.remote);
            let cancel = self.cancel.clone();
            self.upload_queue.spawn(format!("delete:{}", chatfs_transport::hash_file_name(to.as_str())), async move {
                remote.delete_many(&orphaned_ids, &cancel).await;
                Ok(())
            });
        }
        self.cache.evict(&cache_key(from));
        self.read_cache.remove(from);
        self.cache.evict(&cache_key(to));
        self.read_cache.remove(to);
        Ok(())
    }

    #[must_use]
    pub fn volume_info(&self) -> VolumeInfo {
        VolumeInfo::default()
    }

    /// Consumes the engine: drops the crypto key material (zeroing it),
    /// releases the index and remote store handles, and cancels any
    /// in-flight background uploads. Callers invoke this after the kernel
    /// session has already been unmounted, so no further filesystem calls
    /// can race with it.
    pub fn shutdown(self) {
        self.cancel.cancel();
        drop(self.crypto);
        drop(self.write_buffers);
        drop(self.read_cache);
        drop(self.upload_queue);
        drop(self.index);
        drop(self.remote);
    }
}

trait CloneContentExt {
    fn clone_content(&self) -> Vec<u8>;
}

impl CloneContentExt for WriteBuffer {
    fn clone_content(&self) -> Vec<u8> {
        self.read(0, self.len() as usize).to_vec()
    }
}

#[allow(clippy::too_many_arguments)]
async fn upload_closed_file(
    path: VirtualPath,
    content: Vec<u8>,
    chunker: Chunker,
    crypto: Option<Crypto>,
    remote: Arc<RemoteObjectStore>,
    index: Arc<MetadataIndex>,
    cache: Arc<ContentCache>,
    cancel: CancellationToken,
) -> Result<(), anyhow::Error> {
    let plain_len = content.len() as u64;
    let mut refs: Vec<ChunkRef> = Vec::new();

    // An empty write buffer (e.g. a `touch`'d file closed without a single
    // write) uploads nothing: the record still gets saved, with zero chunks,
    // in step (e) below.
    if !content.is_empty() {
        let to_upload = match &crypto {
            Some(c) => c.encrypt(&content),
            None => content,
        };

        let fragments = chunker.fragment(&to_upload);
        refs.reserve(fragments.len());
        for chunk in fragments {
            let chunk_ref = remote
                .upload(chunk.bytes, path.as_str(), chunk.index, chunk.crc32, &cancel)
                .await
                .map_err(|e| anyhow::anyhow!("chunk {} upload failed: {e}", chunk.index))?;
            refs.push(chunk_ref);
        }
    }

    let record = FileRecord::new_file(path.clone(), plain_len, refs, Utc::now());
    index.save(&record)?;
    info!(path = chatfs_transport::hash_file_name(path.as_str()), "upload completed");
    Ok(())
}

fn slice_at(body: &[u8], offset: u64, size: usize) -> Vec<u8> {
    let offset = offset as usize;
    if offset >= body.len() {
        return Vec::new();
    }
    let end = (offset + size).min(body.len());
    body[offset..end].to_vec()
}
