//! Data model, per-file authenticated encryption, and chunking.
//!
//! This crate has no networking and no filesystem I/O of its own: it is the
//! pure core that the rest of the workspace builds around. `chatfs-index`
//! persists the types defined here, `chatfs-transport` moves the chunks this
//! crate produces, and `chatfs-fuse` orchestrates all of it.

pub mod chunker;
pub mod crypto;
pub mod model;
pub mod path;

pub use chunker::{ChunkError, Chunker};
pub use crypto::{Crypto, CryptoError, MasterKey};
pub use model::{ChunkRef, FileRecord};
pub use path::VirtualPath;

/// Authenticated-encryption overhead added to every encrypted buffer:
/// a 12-byte IV followed by a 16-byte GCM tag.
pub const ENCRYPTION_OVERHEAD: usize = 28;
