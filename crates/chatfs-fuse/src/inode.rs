//! Bidirectional mapping between FUSE inodes and virtual paths.
//!
//! The engine crates are entirely path-keyed (per the adapter's
//! `writeBuffers`/`readCache` maps), but `fuser::Filesystem` callbacks are
//! inode-keyed. This table is the one place that bridges the two.

use std::sync::atomic::{AtomicU64, Ordering};

use chatfs_core::VirtualPath;
use dashmap::DashMap;

/// The root inode number, per FUSE convention.
pub const ROOT_INODE: u64 = 1;

struct InodeEntry {
    path: VirtualPath,
    nlookup: AtomicU64,
}

/// Thread-safe inode <-> path table with `nlookup` reference counting so
/// `forget()` can be honored correctly.
pub struct InodeTable {
    by_inode: DashMap<u64, InodeEntry>,
    by_path: DashMap<VirtualPath, u64>,
    next_inode: AtomicU64,
}

impl InodeTable {
    #[must_use]
    pub fn new() -> Self {
        let table = Self {
            by_inode: DashMap::new(),
            by_path: DashMap::new(),
            next_inode: AtomicU64::new(ROOT_INODE + 1),
        };
        table.by_inode.insert(ROOT_INODE, InodeEntry { path: VirtualPath::root(), nlookup: AtomicU64::new(1) });
        table.by_path.insert(VirtualPath::root(), ROOT_INODE);
        table
    }

    /// Returns the inode for `path`, allocating one and bumping `nlookup` if
    /// it did not already have one.
    pub fn get_or_insert(&self, path: &VirtualPath) -> u64 {
        if let Some(existing) = self.by_path.get(path) {
            let inode = *existing;
            if let Some(entry) = self.by_inode.get(&inode) {
                entry.nlookup.fetch_add(1, Ordering::Relaxed);
            }
            return inode;
        }

        let inode = self.next_inode.fetch_add(1, Ordering::Relaxed);
        self.by_inode.insert(inode, InodeEntry { path: path.clone(), nlookup: AtomicU64::new(1) });
        self.by_path.insert(path.clone(), inode);
        inode
    }

    #[must_use]
    pub fn path_for(&self, inode: u64) -> Option<VirtualPath> {
        self.by_inode.get(&inode).map(|e| e.path.clone())
    }

    #[must_use]
    pub fn inode_for(&self, path: &VirtualPath) -> Option<u64> {
        self.by_path.get(path).map(|v| *v)
    }

    /// Decrements `nlookup` by `count` and removes the entry once it drops
    /// to zero. The root inode is never forgotten.
    pub fn forget(&self, inode: u64, count: u64) {
        if inode == ROOT_INODE {
            return;
        }
        let remaining = {
            let Some(entry) = self.by_inode.get(&inode) else { return };
            let old = entry.nlookup.fetch_sub(count, Ordering::AcqRel);
            old.saturating_sub(count)
        };
        if remaining == 0 {
            if let Some((_, entry)) = self.by_inode.remove(&inode) {
                self.by_path.remove(&entry.path);
            }
        }
    }

    /// Called after a rename: re-points the existing inode at its new path
    /// so open file handles keep working.
    pub fn rename(&self, old_path: &VirtualPath, new_path: &VirtualPath) {
        if let Some((_, inode)) = self.by_path.remove(old_path) {
            if let Some(mut entry) = self.by_inode.get_mut(&inode) {
                entry.path = new_path.clone();
            }
            self.by_path.insert(new_path.clone(), inode);
        }
    }

    /// Drops the inode entirely, regardless of `nlookup`. Used after a
    /// delete, since the kernel has no further use for the mapping.
    pub fn remove(&self, path: &VirtualPath) {
        if let Some((_, inode)) = self.by_path.remove(path) {
            self.by_inode.remove(&inode);
        }
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
