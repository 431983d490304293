//! The abstract `BlobStore` interface (spec.md §4.1)
//!
//! A polymorphic, blocking interface over a directory-like remote
//! namespace. SFTP/S3/WebDAV drivers are external collaborators (spec.md
//! §1); this crate defines the trait and ships the one concrete driver the
//! spec keeps in scope as a reference implementation — local filesystem —
//! plus an in-memory driver used by tests across the workspace.

use chrono::{DateTime, Utc};
use poolmesh_core::Result;
use std::io::{Read, Write};

/// A byte range `[from, to)` for a partial read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// Inclusive start offset.
    pub from: u64,
    /// Exclusive end offset.
    pub to: u64,
}

impl ByteRange {
    /// Construct a range, asserting `from <= to`.
    pub fn new(from: u64, to: u64) -> Self {
        debug_assert!(from <= to, "ByteRange::new requires from <= to");
        Self { from, to }
    }

    /// Length of the range in bytes.
    pub fn len(&self) -> u64 {
        self.to - self.from
    }

    /// Whether the range is empty.
    pub fn is_empty(&self) -> bool {
        self.from == self.to
    }
}

/// One listing entry: a blob or sub-directory under a `BlobStore` path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Name relative to the listed directory (not a full path).
    pub name: String,
    /// Size in bytes; meaningless for directories.
    pub size: u64,
    /// Whether this entry is itself a directory.
    pub is_dir: bool,
    /// Last-modified time, as reported by the backend.
    pub mod_time: DateTime<Utc>,
}

/// Abstract, blocking object store. Every call may block the calling
/// thread (spec.md §5: "Every `BlobStore` call is blocking"); callers that
/// need concurrency run it on a worker thread.
///
/// Contract: `mod_time` must be monotonic in wall time for a given name
/// within a single backend — guards (spec.md §4.7) depend on this to
/// short-circuit expensive listings. A backend whose mtime semantics are
/// weaker than this still converges; it just re-lists more often.
pub trait BlobStore: Send + Sync {
    /// Write the full contents of `name` (or just `range`, if given) to
    /// `sink`. Fails with `NotFound` when absent.
    fn read(&self, name: &str, range: Option<ByteRange>, sink: &mut dyn Write) -> Result<()>;

    /// Replace `name` with the `size` bytes read from `source`, creating
    /// parent directories as needed. Overwrites any existing object.
    fn write(&self, name: &str, source: &mut dyn Read, size: u64) -> Result<()>;

    /// List the immediate children of `dir`, in no particular order
    /// (callers sort lexicographically themselves). Entries beginning with
    /// `.` are included. Fails with `NotFound` if `dir` itself is absent.
    fn list(&self, dir: &str) -> Result<Vec<Entry>>;

    /// Stat a single object or directory.
    fn stat(&self, name: &str) -> Result<Entry>;

    /// Rename `old` to `new`, overwriting `new` if it already exists.
    fn rename(&self, old: &str, new: &str) -> Result<()>;

    /// Delete `name`. Recursive if it names a directory. Idempotent: not
    /// finding `name` is not an error.
    fn delete(&self, name: &str) -> Result<()>;

    /// Release any held resources (connections, file handles).
    fn close(&self) -> Result<()>;
}

#[cfg(test)]
pub(crate) fn read_to_vec(store: &dyn BlobStore, name: &str) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    store.read(name, None, &mut buf)?;
    Ok(buf)
}
