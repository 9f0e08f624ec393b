//! Virtual paths, the primary key of the metadata index.

use std::fmt;

/// Canonical path separator used throughout the virtual filesystem.
pub const SEP: char = '/';

/// A path within the virtual filesystem.
///
/// Case-preserving, case-sensitive for equality (`..as_str()` is the
/// canonical representation used as the index's unique key). The empty path
/// denotes the root directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirtualPath(String);

impl VirtualPath {
    /// The root directory.
    #[must_use]
    pub fn root() -> Self {
        Self(String::new())
    }

    /// Normalize an incoming OS-facing path: strip a leading separator and
    /// collapse any run of separators, but otherwise preserve case and
    /// segment content verbatim.
    #[must_use]
    pub fn normalize(raw: &str) -> Self {
        let trimmed = raw.trim_start_matches(SEP).trim_end_matches(SEP);
        let collapsed: Vec<&str> = trimmed.split(SEP).filter(|s| !s.is_empty()).collect();
        Self(collapsed.join(&SEP.to_string()))
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The last path segment, i.e. the entry's file name. Empty for root.
    #[must_use]
    pub fn file_name(&self) -> &str {
        match self.0.rfind(SEP) {
            Some(idx) => &self.0[idx + 1..],
            None => &self.0,
        }
    }

    /// The parent directory, or `None` if this path is already the root.
    #[must_use]
    pub fn parent(&self) -> Option<VirtualPath> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind(SEP) {
            Some(idx) => Some(VirtualPath(self.0[..idx].to_string())),
            None => Some(VirtualPath::root()),
        }
    }

    /// Build the child path `self / name`.
    #[must_use]
    pub fn join(&self, name: &str) -> VirtualPath {
        if self.is_root() {
            VirtualPath(name.to_string())
        } else {
            VirtualPath(format!("{}{}{}", self.0, SEP, name))
        }
    }

    /// Whether `other` is a direct child of `self` (one segment deeper, no
    /// further nesting).
    #[must_use]
    pub fn is_direct_child(&self, other: &VirtualPath) -> bool {
        if other.0.is_empty() {
            return false;
        }
        let rest = if self.is_root() {
            other.0.as_str()
        } else {
            match other.0.strip_prefix(&self.0) {
                Some(rest) => match rest.strip_prefix(SEP) {
                    Some(rest) => rest,
                    None => return false,
                },
                None => return false,
            }
        };
        !rest.is_empty() && !rest.contains(SEP)
    }
}

impl fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", SEP, self.0)
    }
}

impl From<&str> for VirtualPath {
    fn from(raw: &str) -> Self {
        VirtualPath::normalize(raw)
    }
}

impl From<String> for VirtualPath {
    fn from(raw: String) -> Self {
        VirtualPath::normalize(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_leading_and_trailing_separators() {
        assert_eq!(VirtualPath::normalize("/a/b/").as_str(), "a/b");
        assert_eq!(VirtualPath::normalize("a/b").as_str(), "a/b");
        assert_eq!(VirtualPath::normalize("//a//b//").as_str(), "a/b");
        assert!(VirtualPath::normalize("/").is_root());
        assert!(VirtualPath::normalize("").is_root());
    }

    #[test]
    fn case_sensitive_equality() {
        assert_ne!(VirtualPath::from("A.txt"), VirtualPath::from("a.txt"));
    }

    #[test]
    fn file_name_is_last_segment() {
        assert_eq!(VirtualPath::from("a/b/c.txt").file_name(), "c.txt");
        assert_eq!(VirtualPath::from("c.txt").file_name(), "c.txt");
        assert_eq!(VirtualPath::root().file_name(), "");
    }

    #[test]
    fn parent_walks_up_one_segment() {
        assert_eq!(VirtualPath::from("a/b/c.txt").parent(), Some(VirtualPath::from("a/b")));
        assert_eq!(VirtualPath::from("a.txt").parent(), Some(VirtualPath::root()));
        assert_eq!(VirtualPath::root().parent(), None);
    }

    #[test]
    fn join_builds_children() {
        assert_eq!(VirtualPath::root().join("a"), VirtualPath::from("a"));
        assert_eq!(VirtualPath::from("a").join("b"), VirtualPath::from("a/b"));
    }

    #[test]
    fn direct_child_excludes_grandchildren() {
        let dir = VirtualPath::from("a");
        assert!(dir.is_direct_child(&VirtualPath::from("a/b.txt")));
        assert!(!dir.is_direct_child(&VirtualPath::from("a/b/c.txt")));
        assert!(!dir.is_direct_child(&VirtualPath::from("other/b.txt")));
    }

    #[test]
    fn direct_child_of_root() {
        let root = VirtualPath::root();
        assert!(root.is_direct_child(&VirtualPath::from("a")));
        assert!(!root.is_direct_child(&VirtualPath::from("a/b")));
    }
}
