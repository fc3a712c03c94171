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

//! A storage backend for server filesystems.
//!
//! One directory per storage root, one subdirectory per segment, one
//! file per blob: `<root>/<segment>/<logical path>`. Info records live
//! as JSON files under the `info` segment and the index singleton as
//! `<root>/index`. As in git trees, a logical path cannot be both a
//! file and a directory within one root.

use std::fs;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;

use async_trait::async_trait;
use tempfile::NamedTempFile;

use crate::content_hash::hash_content;
use crate::index::FileInfo;
use crate::index::FileState;
use crate::index::Index;
use crate::storage::listing_matches;
use crate::storage::Segment;
use crate::storage::StorageBackend;
use crate::storage::StorageError;
use crate::storage::StorageResult;
use crate::vfs_path::VfsPathBuf;

const INDEX_KEY: &str = "index";

/// The singleton half of the persisted index; entries are stored
/// per-path under the info segment.
#[derive(serde::Serialize, serde::Deserialize)]
struct IndexRecord {
    #[serde(default)]
    head: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_commit_key: Option<String>,
}

fn to_other_err(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> StorageError {
    StorageError::Other(err.into())
}

#[derive(Debug)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn name() -> &'static str {
        "local"
    }

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Opens the named root under `base_dir`.
    pub fn with_root(base_dir: &Path, root_name: &str) -> Self {
        Self::new(base_dir.join(root_name))
    }

    /// Capability probe: whether `base_dir` can host storage roots.
    pub fn can_use(base_dir: &Path) -> bool {
        if fs::create_dir_all(base_dir).is_err() {
            return false;
        }
        NamedTempFile::new_in(base_dir).is_ok()
    }

    /// Enumerates the root names under `base_dir`.
    pub fn available_roots(base_dir: &Path) -> std::io::Result<Vec<String>> {
        let mut roots = vec![];
        let entries = match fs::read_dir(base_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(roots),
            Err(err) => return Err(err),
        };
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir()
                && let Some(name) = entry.file_name().to_str()
            {
                roots.push(name.to_string());
            }
        }
        roots.sort();
        Ok(roots)
    }

    /// Removes the named root and everything under it.
    pub fn delete_root(base_dir: &Path, root_name: &str) -> std::io::Result<()> {
        match fs::remove_dir_all(base_dir.join(root_name)) {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn blob_path(&self, path: &VfsPathBuf, segment: Segment) -> PathBuf {
        self.root.join(segment.name()).join(path.as_str())
    }

    fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_KEY)
    }

    /// Writes `content` at `target` through a temp file in the root,
    /// so a crash never leaves a half-written blob behind.
    fn persist(&self, target: &Path, content: &str) -> std::io::Result<()> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut temp_file = NamedTempFile::new_in(&self.root)?;
        temp_file.write_all(content.as_bytes())?;
        temp_file.persist(target)?;
        Ok(())
    }

    fn read_if_present(&self, disk_path: &Path) -> std::io::Result<Option<String>> {
        match fs::read_to_string(disk_path) {
            Ok(content) => Ok(Some(content)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn read_info(&self, path: &VfsPathBuf) -> StorageResult<Option<FileInfo>> {
        let raw = self
            .read_if_present(&self.blob_path(path, Segment::Info))
            .map_err(|err| StorageError::ReadBlob {
                path: path.clone(),
                segment: Segment::Info,
                source: err.into(),
            })?;
        match raw {
            Some(raw) => {
                let info = serde_json::from_str(&raw).map_err(|err| StorageError::CorruptIndex {
                    source: err.into(),
                })?;
                Ok(Some(info))
            }
            None => Ok(None),
        }
    }

    fn write_info(&self, info: &FileInfo) -> StorageResult<()> {
        let raw = serde_json::to_string(info).map_err(to_other_err)?;
        self.persist(&self.blob_path(&info.path, Segment::Info), &raw)
            .map_err(|err| StorageError::WriteBlob {
                path: info.path.clone(),
                segment: Segment::Info,
                source: err.into(),
            })
    }

    fn remove_file_if_present(&self, disk_path: &Path) -> std::io::Result<()> {
        match fs::remove_file(disk_path) {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    /// Collects the logical paths with a file under `segment_dir`.
    fn collect_segment_paths(&self, segment: Segment) -> StorageResult<Vec<VfsPathBuf>> {
        fn walk(dir: &Path, prefix: String, acc: &mut Vec<String>) -> std::io::Result<()> {
            let entries = match fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(err) => return Err(err),
            };
            for entry in entries {
                let entry = entry?;
                let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                let logical = if prefix.is_empty() {
                    name
                } else {
                    format!("{prefix}/{name}")
                };
                if entry.file_type()?.is_dir() {
                    walk(&entry.path(), logical, acc)?;
                } else {
                    acc.push(logical);
                }
            }
            Ok(())
        }

        let mut raw = vec![];
        walk(&self.root.join(segment.name()), String::new(), &mut raw)
            .map_err(|err| StorageError::ListFiles { source: err.into() })?;
        let mut paths = vec![];
        for logical in raw {
            let path = VfsPathBuf::new(logical)
                .map_err(|err| StorageError::ListFiles { source: err.into() })?;
            paths.push(path);
        }
        paths.sort();
        Ok(paths)
    }

    /// The info record for a path, synthesized from the blob itself if
    /// the record has not been written yet.
    fn info_or_synthesized(
        &self,
        path: &VfsPathBuf,
        segment: Segment,
    ) -> StorageResult<Option<FileInfo>> {
        if let Some(info) = self.read_info(path)? {
            return Ok(Some(info));
        }
        let disk_path = self.blob_path(path, segment);
        let content = self
            .read_if_present(&disk_path)
            .map_err(|err| StorageError::ReadBlob {
                path: path.clone(),
                segment,
                source: err.into(),
            })?;
        let Some(content) = content else {
            return Ok(None);
        };
        let state = match segment {
            Segment::Base => FileState::Base,
            _ => FileState::Added,
        };
        let mut info = FileInfo::new(path.clone(), state);
        let sha = hash_content(&content);
        match segment {
            Segment::Base => info.base_sha = Some(sha),
            Segment::Conflict => info.remote_sha = Some(sha),
            _ => info.workspace_sha = Some(sha),
        }
        Ok(Some(info))
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn name(&self) -> &str {
        Self::name()
    }

    async fn init(&self) -> StorageResult<()> {
        for segment in [Segment::Workspace, Segment::Base, Segment::Conflict, Segment::Info] {
            fs::create_dir_all(self.root.join(segment.name()))
                .map_err(|err| StorageError::Init { source: err.into() })?;
        }
        Ok(())
    }

    async fn read_blob(
        &self,
        path: &VfsPathBuf,
        segment: Option<Segment>,
    ) -> StorageResult<Option<String>> {
        let segments = match segment {
            Some(segment) => vec![segment],
            None => vec![Segment::Workspace, Segment::Base],
        };
        for segment in segments {
            let content = self
                .read_if_present(&self.blob_path(path, segment))
                .map_err(|err| StorageError::ReadBlob {
                    path: path.clone(),
                    segment,
                    source: err.into(),
                })?;
            if content.is_some() {
                return Ok(content);
            }
        }
        Ok(None)
    }

    async fn write_blob(
        &self,
        path: &VfsPathBuf,
        content: &str,
        segment: Segment,
    ) -> StorageResult<()> {
        self.persist(&self.blob_path(path, segment), content)
            .map_err(|err| StorageError::WriteBlob {
                path: path.clone(),
                segment,
                source: err.into(),
            })?;
        let existing = self.read_info(path)?;
        let info =
            FileInfo::absorb_write(existing.as_ref(), path, segment, hash_content(content));
        self.write_info(&info)
    }

    async fn delete_blob(&self, path: &VfsPathBuf, segment: Option<Segment>) -> StorageResult<()> {
        let map_err = |err: std::io::Error| StorageError::DeleteBlob {
            path: path.clone(),
            source: err.into(),
        };
        match segment {
            Some(segment) => self
                .remove_file_if_present(&self.blob_path(path, segment))
                .map_err(map_err),
            None => {
                for segment in Segment::BLOB_SEGMENTS {
                    self.remove_file_if_present(&self.blob_path(path, segment))
                        .map_err(map_err)?;
                }
                self.remove_file_if_present(&self.blob_path(path, Segment::Info))
                    .map_err(map_err)
            }
        }
    }

    async fn list_files(
        &self,
        prefix: Option<&VfsPathBuf>,
        segment: Option<Segment>,
        recursive: bool,
    ) -> StorageResult<Vec<(VfsPathBuf, FileInfo)>> {
        let segment = segment.unwrap_or(Segment::Info);
        let mut files = vec![];
        for path in self.collect_segment_paths(segment)? {
            if !listing_matches(&path, prefix, recursive) {
                continue;
            }
            if let Some(info) = self.info_or_synthesized(&path, segment)? {
                files.push((path, info));
            }
        }
        Ok(files)
    }

    async fn read_index(&self) -> StorageResult<Option<Index>> {
        let raw = self
            .read_if_present(&self.index_path())
            .map_err(|err| StorageError::ReadIndex { source: err.into() })?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let record: IndexRecord = serde_json::from_str(&raw)
            .map_err(|err| StorageError::CorruptIndex { source: err.into() })?;
        let mut index = Index {
            head: record.head,
            last_commit_key: record.last_commit_key,
            ..Index::empty()
        };
        for path in self.collect_segment_paths(Segment::Info)? {
            if let Some(info) = self.read_info(&path)? {
                index.entries.insert(path, info);
            }
        }
        Ok(Some(index))
    }

    async fn write_index(&self, index: &Index) -> StorageResult<()> {
        for info in index.entries.values() {
            self.write_info(info)?;
        }
        // Drop info records for paths that left the index.
        for path in self.collect_segment_paths(Segment::Info)? {
            if !index.entries.contains_key(&path) {
                self.remove_file_if_present(&self.blob_path(&path, Segment::Info))
                    .map_err(|err| StorageError::DeleteBlob {
                        path: path.clone(),
                        source: err.into(),
                    })?;
            }
        }
        let record = IndexRecord {
            head: index.head.clone(),
            last_commit_key: index.last_commit_key.clone(),
        };
        let raw = serde_json::to_string(&record).map_err(to_other_err)?;
        self.persist(&self.index_path(), &raw)
            .map_err(|err| StorageError::WriteIndex { source: err.into() })
    }
}
