//! Shared mount-side plumbing: content cache, write buffering, the bounded
//! background-upload executor, and POSIX error mapping.
//!
//! Everything here is kernel-bridge-agnostic. `chatfs-fuse` is the one
//! binding in this workspace today, but nothing in this crate assumes FUSE.

pub mod cache;
pub mod error;
pub mod upload_queue;
pub mod write_buffer;

pub use cache::ContentCache;
pub use error::{AdapterError, AdapterResult};
pub use upload_queue::{UploadQueue, UploadQueueStats};
pub use write_buffer::WriteBuffer;
