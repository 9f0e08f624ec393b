//! Durable record types: [`FileRecord`] and [`ChunkRef`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::path::VirtualPath;

/// A single remote chunk belonging to exactly one [`FileRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    /// Zero-based, unique within the owning file.
    pub chunk_index: u32,
    /// Opaque message identifier returned by the chat service.
    pub message_id: u64,
    /// Retrieval URL for the chunk's attachment.
    pub attachment_url: String,
    /// Ciphertext byte length, at most `9 * 2^20`.
    pub size_bytes: u64,
    /// CRC-32 (ISO/HDLC, little-endian) over the transmitted bytes.
    pub crc32: u32,
}

/// A file or directory entry in the metadata index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub virtual_path: VirtualPath,
    pub file_name: String,
    /// Plaintext length as observed by the OS. Zero for directories.
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub is_directory: bool,
    /// Ordered ascending by `chunk_index`; empty for directories.
    pub chunks: Vec<ChunkRef>,
}

impl FileRecord {
    /// Build a fresh directory record for `path`.
    #[must_use]
    pub fn new_directory(path: VirtualPath, now: DateTime<Utc>) -> Self {
        let file_name = path.file_name().to_string();
        Self {
            virtual_path: path,
            file_name,
            size_bytes: 0,
            created_at: now,
            modified_at: now,
            is_directory: true,
            chunks: Vec::new(),
        }
    }

    /// Build a fresh regular-file record.
    #[must_use]
    pub fn new_file(
        path: VirtualPath,
        size_bytes: u64,
        chunks: Vec<ChunkRef>,
        now: DateTime<Utc>,
    ) -> Self {
        let file_name = path.file_name().to_string();
        Self {
            virtual_path: path,
            file_name,
            size_bytes,
            created_at: now,
            modified_at: now,
            is_directory: false,
            chunks,
        }
    }

    /// Chunk indices must be contiguous starting at 0 with no gaps.
    #[must_use]
    pub fn chunks_are_contiguous(&self) -> bool {
        self.chunks
            .iter()
            .enumerate()
            .all(|(i, c)| c.chunk_index as usize == i)
    }

    /// Sum of the ciphertext bytes across all chunks.
    #[must_use]
    pub fn ciphertext_len(&self) -> u64 {
        self.chunks.iter().map(|c| c.size_bytes).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(i: u32) -> ChunkRef {
        ChunkRef {
            chunk_index: i,
            message_id: i as u64,
            attachment_url: format!("https://example.invalid/{i}"),
            size_bytes: 1024,
            crc32: 0,
        }
    }

    #[test]
    fn directory_has_no_chunks_and_zero_size() {
        let rec = FileRecord::new_directory(VirtualPath::from("a"), Utc::now());
        assert!(rec.is_directory);
        assert_eq!(rec.size_bytes, 0);
        assert!(rec.chunks.is_empty());
    }

    #[test]
    fn contiguous_chunk_indices_detected() {
        let rec = FileRecord::new_file(
            VirtualPath::from("a.bin"),
            100,
            vec![chunk(0), chunk(1), chunk(2)],
            Utc::now(),
        );
        assert!(rec.chunks_are_contiguous());

        let gapped = FileRecord::new_file(
            VirtualPath::from("b.bin"),
            100,
            vec![chunk(0), chunk(2)],
            Utc::now(),
        );
        assert!(!gapped.chunks_are_contiguous());
    }

    #[test]
    fn ciphertext_len_sums_chunk_sizes() {
        let rec = FileRecord::new_file(
            VirtualPath::from("a.bin"),
            100,
            vec![chunk(0), chunk(1)],
            Utc::now(),
        );
        assert_eq!(rec.ciphertext_len(), 2048);
    }
}
