// Copyright 2024 The GitStage Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The storage seam.
//!
//! A [`StorageBackend`] partitions one storage root into four logical
//! segments and persists blobs, per-path info records, and the
//! aggregate index. The VFS owns its backend exclusively and serializes
//! operations on it; there is no cross-path atomicity requirement. The
//! VFS writes the index last in every operation so that a crash leaves
//! storage recoverable to the last durable index.

use std::fmt;
use std::fmt::Debug;

use async_trait::async_trait;
use thiserror::Error;

use crate::index::FileInfo;
use crate::index::Index;
use crate::vfs_path::VfsPathBuf;

/// One of the four logical storage partitions of a root.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum Segment {
    /// The user-visible mutable layer. Absence of a key here means
    /// "unmodified vs base".
    Workspace,
    /// The immutable snapshot last reconciled with the remote.
    Base,
    /// Remote bytes parked beside conflicting local edits.
    Conflict,
    /// Per-path metadata records (the enumeration form of the index).
    Info,
}

impl Segment {
    /// The segments that hold blob content.
    pub const BLOB_SEGMENTS: [Self; 3] = [Self::Workspace, Self::Base, Self::Conflict];

    /// The literal segment name used by path-addressed backends.
    pub fn name(self) -> &'static str {
        match self {
            Self::Workspace => "workspace",
            Self::Base => "base",
            Self::Conflict => "conflict",
            Self::Info => "info",
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        f.pad(self.name())
    }
}

/// Storage-backend error that may occur after the backend is set up.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Could not initialize storage root")]
    Init {
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Error when reading blob {path:?} from segment {segment}")]
    ReadBlob {
        path: VfsPathBuf,
        segment: Segment,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Error when writing blob {path:?} to segment {segment}")]
    WriteBlob {
        path: VfsPathBuf,
        segment: Segment,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Error when deleting blob {path:?}")]
    DeleteBlob {
        path: VfsPathBuf,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Error when listing files")]
    ListFiles {
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// The persisted index exists but cannot be decoded. The VFS
    /// resets to an empty index when it sees this.
    #[error("Persisted index is unreadable")]
    CorruptIndex {
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Error when reading the index")]
    ReadIndex {
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Error when writing the index")]
    WriteIndex {
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Defines the interface for storage backends.
///
/// Implementations serialize operations per instance. `write_blob`
/// keeps the per-path info record coherent by compose-merging the write
/// through [`FileInfo::absorb_write`]; the authoritative entries arrive
/// with the next `write_index`.
#[async_trait]
pub trait StorageBackend: Send + Sync + Debug {
    /// A unique name identifying the backend implementation.
    fn name(&self) -> &str;

    /// Idempotent setup of the storage root.
    async fn init(&self) -> StorageResult<()>;

    /// Reads a blob. `segment: None` reads the workspace with fallback
    /// to base, which is the application's view of the file.
    async fn read_blob(
        &self,
        path: &VfsPathBuf,
        segment: Option<Segment>,
    ) -> StorageResult<Option<String>>;

    /// Writes a blob into `segment` and updates the info record.
    async fn write_blob(
        &self,
        path: &VfsPathBuf,
        content: &str,
        segment: Segment,
    ) -> StorageResult<()>;

    /// Deletes the blob from one segment, or from all segments plus
    /// the info record when `segment` is `None`. Deleting an absent
    /// blob is not an error.
    async fn delete_blob(&self, path: &VfsPathBuf, segment: Option<Segment>) -> StorageResult<()>;

    /// Lists `(path, info)` pairs. `segment: None` enumerates every
    /// known path from the info records; a concrete segment restricts
    /// to paths with a blob there. A prefix matches whole path
    /// components; without `recursive`, only paths directly below the
    /// prefix are returned.
    async fn list_files(
        &self,
        prefix: Option<&VfsPathBuf>,
        segment: Option<Segment>,
        recursive: bool,
    ) -> StorageResult<Vec<(VfsPathBuf, FileInfo)>>;

    /// Reads the aggregate index: the singleton record stored under
    /// the literal key `index` plus the per-entry info records.
    /// Returns `None` if no index has been written yet.
    async fn read_index(&self) -> StorageResult<Option<Index>>;

    /// Persists the aggregate index and refreshes the per-entry info
    /// records, removing records for paths no longer indexed.
    async fn write_index(&self, index: &Index) -> StorageResult<()>;
}

/// Filters a listing down to the requested prefix and depth. Shared by
/// backend implementations.
pub fn listing_matches(
    path: &VfsPathBuf,
    prefix: Option<&VfsPathBuf>,
    recursive: bool,
) -> bool {
    match prefix {
        Some(prefix) => match path.depth_below(prefix) {
            // A listing never returns the prefix itself; the prefix
            // names a directory level.
            Some(depth) => (recursive && depth > 0) || depth == 1,
            None => false,
        },
        None => recursive || path.components().count() == 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(value: &str) -> VfsPathBuf {
        VfsPathBuf::new(value).unwrap()
    }

    #[test]
    fn test_segment_names() {
        assert_eq!(Segment::Workspace.name(), "workspace");
        assert_eq!(Segment::Base.name(), "base");
        assert_eq!(Segment::Conflict.name(), "conflict");
        assert_eq!(Segment::Info.name(), "info");
        assert_eq!(format!("{}", Segment::Base), "base");
    }

    #[test]
    fn test_listing_matches() {
        // No prefix: recursive sees everything, flat sees top level.
        assert!(listing_matches(&path("a.json"), None, false));
        assert!(!listing_matches(&path("dir/a.json"), None, false));
        assert!(listing_matches(&path("dir/a.json"), None, true));

        // Prefixes match whole components.
        let dir = path("dir");
        assert!(listing_matches(&path("dir/a.json"), Some(&dir), false));
        assert!(!listing_matches(&path("dir/sub/a.json"), Some(&dir), false));
        assert!(listing_matches(&path("dir/sub/a.json"), Some(&dir), true));
        assert!(!listing_matches(&path("director/a.json"), Some(&dir), true));
        assert!(!listing_matches(&path("dir"), Some(&dir), true));
    }
}
