//! Per-path write buffering for random-access writes to open files.
//!
//! A file's chunks are encrypted and uploaded as a unit, so random-access
//! writes cannot be applied to remote storage in place: the whole body is
//! buffered in memory from open to close and only then fragmented and
//! uploaded. [`WriteBuffer`] implements that read-modify-write buffer; the
//! filesystem adapter owns a map of these keyed by [`VirtualPath`], at most
//! one per open-for-write path at a time.

use chatfs_core::VirtualPath;

/// A growable byte buffer for one open-for-write file.
#[derive(Debug)]
pub struct WriteBuffer {
    content: Vec<u8>,
    dirty: bool,
    virtual_path: VirtualPath,
}

impl WriteBuffer {
    /// Buffer preloaded with `existing_content` (e.g. append-mode opens of an
    /// existing file). Starts clean: nothing has changed yet.
    #[must_use]
    pub fn new(virtual_path: VirtualPath, existing_content: Vec<u8>) -> Self {
        Self { content: existing_content, dirty: false, virtual_path }
    }

    /// Empty buffer for a brand-new file. Starts dirty so that closing
    /// without a single write still creates an empty remote file.
    #[must_use]
    pub fn new_for_create(virtual_path: VirtualPath) -> Self {
        Self { content: Vec::new(), dirty: true, virtual_path }
    }

    /// Empty buffer for a truncated file. Starts clean; becomes dirty on the
    /// first write or explicit truncate.
    #[must_use]
    pub fn new_empty(virtual_path: VirtualPath) -> Self {
        Self { content: Vec::new(), dirty: false, virtual_path }
    }

    /// Write `data` at `offset`, zero-filling any gap and growing the buffer
    /// geometrically (1.5x) to keep repeated sequential writes amortized
    /// O(n) instead of O(n^2).
    pub fn write(&mut self, offset: u64, data: &[u8]) -> usize {
        #[allow(clippy::cast_possible_truncation)]
        let offset = offset as usize;
        let end = offset + data.len();

        if end > self.content.len() {
            let new_capacity = std::cmp::max(end, (self.content.capacity() * 3) / 2);
            if new_capacity > self.content.capacity() {
                self.content.reserve(new_capacity - self.content.capacity());
            }
            self.content.resize(end, 0);
        }

        self.content[offset..end].copy_from_slice(data);
        self.dirty = true;
        data.len()
    }

    /// Slice of the buffer at `offset`, truncated to fit. Empty past EOF.
    #[must_use]
    pub fn read(&self, offset: u64, size: usize) -> &[u8] {
        #[allow(clippy::cast_possible_truncation)]
        let offset = offset as usize;
        if offset >= self.content.len() {
            return &[];
        }
        let end = (offset + size).min(self.content.len());
        &self.content[offset..end]
    }

    pub fn truncate(&mut self, size: u64) {
        #[allow(clippy::cast_possible_truncation)]
        let size = size as usize;
        if size != self.content.len() {
            self.content.resize(size, 0);
            self.dirty = true;
        }
    }

    #[must_use]
    #[inline]
    pub fn len(&self) -> u64 {
        self.content.len() as u64
    }

    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    #[must_use]
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    #[must_use]
    #[inline]
    pub fn virtual_path(&self) -> &VirtualPath {
        &self.virtual_path
    }

    /// Consume the buffer, returning its content for the upload task.
    #[must_use]
    pub fn into_content(self) -> Vec<u8> {
        self.content
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path() -> VirtualPath {
        VirtualPath::from("test.txt")
    }

    #[test]
    fn new_preserves_existing_content_and_starts_clean() {
        let buf = WriteBuffer::new(path(), vec![1, 2, 3]);
        assert_eq!(buf.len(), 3);
        assert!(!buf.is_dirty());
    }

    #[test]
    fn new_for_create_is_dirty_even_though_empty() {
        let buf = WriteBuffer::new_for_create(path());
        assert!(buf.is_empty());
        assert!(buf.is_dirty());
    }

    #[test]
    fn new_empty_starts_clean() {
        let buf = WriteBuffer::new_empty(path());
        assert!(buf.is_empty());
        assert!(!buf.is_dirty());
    }

    #[test]
    fn write_at_start_overwrites_prefix() {
        let mut buf = WriteBuffer::new(path(), vec![0; 10]);
        let n = buf.write(0, b"Hello");
        assert_eq!(n, 5);
        assert_eq!(buf.read(0, 5), b"Hello");
        assert_eq!(buf.len(), 10);
    }

    #[test]
    fn write_past_end_zero_fills_the_gap() {
        let mut buf = WriteBuffer::new_empty(path());
        buf.write(5, b"end");
        assert_eq!(buf.len(), 8);
        assert_eq!(buf.read(0, 5), &[0, 0, 0, 0, 0]);
        assert_eq!(buf.read(5, 3), b"end");
    }

    #[test]
    fn read_past_end_is_empty() {
        let buf = WriteBuffer::new(path(), vec![1, 2, 3]);
        assert_eq!(buf.read(10, 5), &[] as &[u8]);
    }

    #[test]
    fn read_clamps_to_available_bytes() {
        let buf = WriteBuffer::new(path(), vec![1, 2, 3]);
        assert_eq!(buf.read(1, 100), &[2, 3]);
    }

    #[test]
    fn truncate_shrinks_and_marks_dirty() {
        let mut buf = WriteBuffer::new(path(), vec![1, 2, 3, 4, 5]);
        buf.truncate(2);
        assert_eq!(buf.len(), 2);
        assert!(buf.is_dirty());
    }

    #[test]
    fn truncate_to_same_size_does_not_dirty_a_clean_buffer() {
        let mut buf = WriteBuffer::new(path(), vec![1, 2, 3]);
        buf.truncate(3);
        assert!(!buf.is_dirty());
    }

    #[test]
    fn truncate_growing_zero_fills() {
        let mut buf = WriteBuffer::new(path(), vec![1, 2]);
        buf.truncate(4);
        assert_eq!(buf.read(0, 4), &[1, 2, 0, 0]);
    }

    #[test]
    fn into_content_yields_final_bytes() {
        let mut buf = WriteBuffer::new_empty(path());
        buf.write(0, b"abc");
        assert_eq!(buf.into_content(), b"abc".to_vec());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn writes_at_offset_zero_are_readable_back(data in prop::collection::vec(any::<u8>(), 0..512)) {
            let mut buf = WriteBuffer::new_empty(VirtualPath::from("p"));
            buf.write(0, &data);
            prop_assert_eq!(buf.read(0, data.len()), &data[..]);
        }

        #[test]
        fn len_never_shrinks_from_a_write(offset in 0u64..256, len in 0usize..256) {
            let mut buf = WriteBuffer::new_empty(VirtualPath::from("p"));
            let before = buf.len();
            buf.write(offset, &vec![0u8; len]);
            prop_assert!(buf.len() >= before);
        }
    }
}
