//! Deterministic chunking and integrity-checked reassembly.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::{instrument, warn};

use crate::crypto::{Crypto, CryptoError};
use crate::model::ChunkRef;
use crate::ENCRYPTION_OVERHEAD;

/// Maximum plaintext/ciphertext bytes per chunk: 9 MiB.
pub const CHUNK_MAX: usize = 9 * 1024 * 1024;

/// Uniform delay range between successive chunk downloads, spacing CDN hits
/// independently of the throttler's upload-side rate budget.
const INTER_DOWNLOAD_DELAY_MS: std::ops::Range<u64> = 100..400;

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("chunk {index} failed CRC verification")]
    IntegrityFailure { index: u32 },
    #[error("download of chunk {index} failed: {source}")]
    Download {
        index: u32,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// A single fragment produced by [`Chunker::fragment`].
#[derive(Debug, Clone)]
pub struct Chunk {
    pub index: u32,
    pub bytes: Vec<u8>,
    pub crc32: u32,
}

/// Stateless fragmentation/reassembly logic. Carries no keys; callers pass
/// an optional [`Crypto`] for the legacy-fallback decrypt step in
/// [`Chunker::reassemble_from_refs`].
#[derive(Debug, Default, Clone, Copy)]
pub struct Chunker;

impl Chunker {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Split `bytes` into ascending, index-0-based, size-capped chunks. The
    /// final chunk carries the remainder and may be the only chunk.
    #[instrument(skip_all, fields(len = bytes.len()))]
    pub fn fragment(&self, bytes: &[u8]) -> Vec<Chunk> {
        if bytes.is_empty() {
            return vec![Chunk {
                index: 0,
                bytes: Vec::new(),
                crc32: crc32fast::hash(&[]),
            }];
        }
        bytes
            .chunks(CHUNK_MAX)
            .enumerate()
            .map(|(i, slice)| Chunk {
                index: i as u32,
                bytes: slice.to_vec(),
                crc32: crc32fast::hash(slice),
            })
            .collect()
    }

    /// `ceil((plain_size + ENCRYPTION_OVERHEAD) / CHUNK_MAX)`.
    #[must_use]
    pub fn chunk_count(plain_size: u64) -> u64 {
        let encrypted = plain_size + ENCRYPTION_OVERHEAD as u64;
        if encrypted == 0 {
            return 1;
        }
        encrypted.div_ceil(CHUNK_MAX as u64)
    }

    /// Sort `refs` by `chunk_index`, download each via `download_fn`,
    /// verify its CRC-32, concatenate, and, if `crypto` is supplied and the
    /// reassembled blob is at least [`ENCRYPTION_OVERHEAD`] bytes, attempt
    /// decryption.
    ///
    /// A decryption failure on a sufficiently large blob is *not* surfaced
    /// as an error: it is interpreted as "this file predates encryption"
    /// and the raw reassembled bytes are returned instead (legacy
    /// fallback). A CRC mismatch during download, by contrast, always fails
    /// the whole reassembly. It indicates transport/storage corruption,
    /// not a format-era difference.
    pub async fn reassemble_from_refs<F, Fut>(
        &self,
        refs: &[ChunkRef],
        mut download_fn: F,
        crypto: Option<&Crypto>,
    ) -> Result<Vec<u8>, ChunkError>
    where
        F: FnMut(&str) -> Fut,
        Fut: Future<Output = Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>>>,
    {
        let mut sorted: Vec<&ChunkRef> = refs.iter().collect();
        sorted.sort_by_key(|r| r.chunk_index);

        let mut out = Vec::new();
        for (pos, r) in sorted.iter().enumerate() {
            let bytes = download_fn(&r.attachment_url)
                .await
                .map_err(|source| ChunkError::Download { index: r.chunk_index, source })?;
            if crc32fast::hash(&bytes) != r.crc32 {
                return Err(ChunkError::IntegrityFailure { index: r.chunk_index });
            }
            out.extend_from_slice(&bytes);

            if pos + 1 < sorted.len() {
                let delay_ms = rand::thread_rng().gen_range(INTER_DOWNLOAD_DELAY_MS);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
        }

        if let Some(crypto) = crypto {
            if out.len() >= ENCRYPTION_OVERHEAD {
                match crypto.decrypt(&out) {
                    Ok(plain) => return Ok(plain),
                    Err(CryptoError::Corrupted) => {
                        warn!("decryption failed on a sufficiently large blob; treating as legacy unencrypted content");
                        return Ok(out);
                    }
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MasterKey;

    #[test]
    fn fragments_respect_chunk_max() {
        let chunker = Chunker::new();
        let data = vec![0xABu8; CHUNK_MAX * 2 + 37];
        let chunks = chunker.fragment(&data);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].bytes.len(), CHUNK_MAX);
        assert_eq!(chunks[1].bytes.len(), CHUNK_MAX);
        assert_eq!(chunks[2].bytes.len(), 37);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i as u32);
            assert_eq!(c.crc32, crc32fast::hash(&c.bytes));
        }
    }

    #[test]
    fn empty_input_yields_single_empty_chunk() {
        let chunks = Chunker::new().fragment(&[]);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].bytes.is_empty());
    }

    #[test]
    fn chunk_count_matches_fragment_len_when_encrypted() {
        for size in [0u64, 1, 100, CHUNK_MAX as u64 - 28, CHUNK_MAX as u64, 25 * 1024 * 1024] {
            let crypto = Crypto::new(MasterKey::generate());
            let plain = vec![0u8; size as usize];
            let encrypted = crypto.encrypt(&plain);
            let fragments = Chunker::new().fragment(&encrypted);
            assert_eq!(Chunker::chunk_count(size), fragments.len() as u64, "size={size}");
        }
    }

    #[tokio::test]
    async fn reassembles_in_index_order_regardless_of_ref_order() {
        let chunker = Chunker::new();
        let refs = vec![
            ChunkRef { chunk_index: 1, message_id: 2, attachment_url: "b".into(), size_bytes: 1, crc32: crc32fast::hash(b"B") },
            ChunkRef { chunk_index: 0, message_id: 1, attachment_url: "a".into(), size_bytes: 1, crc32: crc32fast::hash(b"A") },
        ];
        let result = chunker
            .reassemble_from_refs(
                &refs,
                |url| {
                    let bytes: Vec<u8> = match url {
                        "a" => b"A".to_vec(),
                        "b" => b"B".to_vec(),
                        _ => unreachable!(),
                    };
                    async move { Ok(bytes) }
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(result, b"AB");
    }

    #[tokio::test]
    async fn crc_mismatch_fails_reassembly() {
        let chunker = Chunker::new();
        let refs = vec![ChunkRef {
            chunk_index: 0,
            message_id: 1,
            attachment_url: "a".into(),
            size_bytes: 1,
            crc32: 0xDEAD_BEEF,
        }];
        let err = chunker
            .reassemble_from_refs(&refs, |_| async { Ok(b"A".to_vec()) }, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ChunkError::IntegrityFailure { index: 0 }));
    }

    #[tokio::test]
    async fn legacy_unencrypted_blob_is_returned_raw() {
        let crypto = Crypto::new(MasterKey::generate());
        let legacy_plain = b"not a gcm frame but 28+ bytes long!!".to_vec();
        let refs = vec![ChunkRef {
            chunk_index: 0,
            message_id: 1,
            attachment_url: "a".into(),
            size_bytes: legacy_plain.len() as u64,
            crc32: crc32fast::hash(&legacy_plain),
        }];
        let data = legacy_plain.clone();
        let result = Chunker::new()
            .reassemble_from_refs(&refs, move |_| { let d = data.clone(); async move { Ok(d) } }, Some(&crypto))
            .await
            .unwrap();
        assert_eq!(result, legacy_plain);
    }

    #[tokio::test]
    async fn encrypted_blob_decrypts_when_crypto_supplied() {
        let crypto = Crypto::new(MasterKey::generate());
        let plain = b"hello world".to_vec();
        let ct = crypto.encrypt(&plain);
        let refs = vec![ChunkRef {
            chunk_index: 0,
            message_id: 1,
            attachment_url: "a".into(),
            size_bytes: ct.len() as u64,
            crc32: crc32fast::hash(&ct),
        }];
        let data = ct.clone();
        let result = Chunker::new()
            .reassemble_from_refs(&refs, move |_| { let d = data.clone(); async move { Ok(d) } }, Some(&crypto))
            .await
            .unwrap();
        assert_eq!(result, plain);
    }
}
