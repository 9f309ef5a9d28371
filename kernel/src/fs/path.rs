//! VFS paths.
//!
//! A path is a NUL-separated sequence of UTF-8 segments; the empty
//! string is the root. Userspace is required to normalise paths before
//! the kernel sees them, so leading/trailing separators, empty segments,
//! and `.` segments are rejected outright rather than cleaned up.

use alloc::borrow::ToOwned;
use alloc::string::String;

use crate::error::{OsResult, OsStatus};

/// Separator between path segments.
pub const PATH_SEPARATOR: char = '\0';

/// Characters that may never appear inside a segment.
const INVALID_SEGMENT_CHARS: &[char] = &['/', '\\', ':'];

/// Validate raw path text.
///
/// Accepts the empty string (the root). Rejects leading/trailing
/// separators, empty segments, `.` segments, and invalid characters.
pub fn verify_path_text(text: &str) -> bool {
    if text.is_empty() {
        return true;
    }

    let bytes = text.as_bytes();
    if bytes[0] == 0 || bytes[bytes.len() - 1] == 0 {
        return false;
    }

    for pair in bytes.windows(2) {
        if pair[0] == 0 && pair[1] == 0 {
            return false;
        }
    }

    for segment in text.split(PATH_SEPARATOR) {
        if segment == "." {
            return false;
        }
        if segment.chars().any(|ch| INVALID_SEGMENT_CHARS.contains(&ch)) {
            return false;
        }
    }

    true
}

/// An owned, validated path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VfsPath {
    text: String,
}

impl VfsPath {
    /// The root path.
    pub fn root() -> VfsPath {
        VfsPath {
            text: String::new(),
        }
    }

    /// Validate and take ownership of path text.
    pub fn new(text: &str) -> OsResult<VfsPath> {
        if !verify_path_text(text) {
            return Err(OsStatus::InvalidPath);
        }
        Ok(VfsPath {
            text: text.to_owned(),
        })
    }

    pub fn is_root(&self) -> bool {
        self.text.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Number of segments; zero for the root.
    pub fn segment_count(&self) -> usize {
        if self.text.is_empty() {
            0
        } else {
            self.text.matches(PATH_SEPARATOR).count() + 1
        }
    }

    /// Iterate the segments in order.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.text.split(PATH_SEPARATOR).filter(|s| !s.is_empty())
    }

    /// The final segment; empty for the root.
    pub fn name(&self) -> &str {
        match self.text.rfind(PATH_SEPARATOR) {
            Some(position) => &self.text[position + 1..],
            None => &self.text,
        }
    }

    /// Everything but the final segment.
    pub fn parent(&self) -> VfsPath {
        match self.text.rfind(PATH_SEPARATOR) {
            Some(position) => VfsPath {
                text: String::from(&self.text[..position]),
            },
            None => VfsPath::root(),
        }
    }

    /// Append one segment.
    pub fn join(&self, segment: &str) -> OsResult<VfsPath> {
        if segment.is_empty() || segment == "." {
            return Err(OsStatus::InvalidPath);
        }
        if segment
            .chars()
            .any(|ch| ch == PATH_SEPARATOR || INVALID_SEGMENT_CHARS.contains(&ch))
        {
            return Err(OsStatus::InvalidPath);
        }

        let mut text = self.text.clone();
        if !text.is_empty() {
            text.push(PATH_SEPARATOR);
        }
        text.push_str(segment);
        Ok(VfsPath { text })
    }

    /// Whether `self` is `other` or a descendant of it.
    pub fn starts_with(&self, other: &VfsPath) -> bool {
        if other.is_root() {
            return true;
        }
        if self.text == other.text {
            return true;
        }
        self.text.starts_with(&other.text)
            && self.text.as_bytes().get(other.text.len()) == Some(&0)
    }
}

impl core::fmt::Display for VfsPath {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for segment in self.segments() {
            write!(f, "/{}", segment)?;
        }
        Ok(())
    }
}
