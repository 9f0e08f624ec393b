//! Binds the chatfs storage engine to the kernel's FUSE interface.
//!
//! [`engine::Engine`] and [`inode::InodeTable`] are kernel-agnostic; the one
//! piece that speaks `fuser`'s vocabulary is [`fs::ChatFilesystem`].

pub mod async_bridge;
pub mod engine;
pub mod fs;
pub mod inode;

pub use engine::{Engine, OpenMode, OpenOutcome, VolumeInfo};
pub use fs::ChatFilesystem;
pub use inode::InodeTable;
