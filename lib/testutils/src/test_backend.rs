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

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::fmt::Error;
use std::fmt::Formatter;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use async_trait::async_trait;
use gitstage_lib::content_hash::hash_content;
use gitstage_lib::index::FileInfo;
use gitstage_lib::index::Index;
use gitstage_lib::storage::Segment;
use gitstage_lib::storage::StorageBackend;
use gitstage_lib::storage::StorageError;
use gitstage_lib::storage::StorageResult;
use gitstage_lib::storage::listing_matches;
use gitstage_lib::vfs_path::VfsPathBuf;

#[derive(Default)]
struct TestBackendData {
    workspace: BTreeMap<VfsPathBuf, String>,
    base: BTreeMap<VfsPathBuf, String>,
    conflict: BTreeMap<VfsPathBuf, String>,
    infos: BTreeMap<VfsPathBuf, FileInfo>,
    /// The singleton record, stored under the literal key `index`.
    index: Option<(String, Option<String>)>,
    /// Remaining conflict-segment writes that should fail; exercises
    /// the swallow-and-log path of conflict persistence.
    conflict_write_failures: u32,
}

impl TestBackendData {
    fn segment(&self, segment: Segment) -> &BTreeMap<VfsPathBuf, String> {
        match segment {
            Segment::Workspace => &self.workspace,
            Segment::Base => &self.base,
            Segment::Conflict => &self.conflict,
            Segment::Info => panic!("the info segment holds records, not blobs"),
        }
    }

    fn segment_mut(&mut self, segment: Segment) -> &mut BTreeMap<VfsPathBuf, String> {
        match segment {
            Segment::Workspace => &mut self.workspace,
            Segment::Base => &mut self.base,
            Segment::Conflict => &mut self.conflict,
            Segment::Info => panic!("the info segment holds records, not blobs"),
        }
    }
}

/// An in-memory storage backend for tests. Strict where it can be: it
/// panics on blob reads from the info segment and supports scripted
/// write failures.
#[derive(Clone, Default)]
pub struct TestStorageBackend {
    data: Arc<Mutex<TestBackendData>>,
}

impl TestStorageBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn locked_data(&self) -> MutexGuard<'_, TestBackendData> {
        self.data.lock().unwrap()
    }

    /// Makes the next `count` conflict-segment writes fail.
    pub fn fail_conflict_writes(&self, count: u32) {
        self.locked_data().conflict_write_failures = count;
    }

    /// Test-side view of a whole segment's contents.
    pub fn segment_contents(&self, segment: Segment) -> BTreeMap<VfsPathBuf, String> {
        self.locked_data().segment(segment).clone()
    }
}

impl Debug for TestStorageBackend {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        f.debug_struct("TestStorageBackend").finish_non_exhaustive()
    }
}

#[async_trait]
impl StorageBackend for TestStorageBackend {
    fn name(&self) -> &str {
        "test"
    }

    async fn init(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn read_blob(
        &self,
        path: &VfsPathBuf,
        segment: Option<Segment>,
    ) -> StorageResult<Option<String>> {
        let data = self.locked_data();
        let content = match segment {
            Some(segment) => data.segment(segment).get(path),
            None => data.workspace.get(path).or_else(|| data.base.get(path)),
        };
        Ok(content.cloned())
    }

    async fn write_blob(
        &self,
        path: &VfsPathBuf,
        content: &str,
        segment: Segment,
    ) -> StorageResult<()> {
        let mut data = self.locked_data();
        if segment == Segment::Conflict && data.conflict_write_failures > 0 {
            data.conflict_write_failures -= 1;
            return Err(StorageError::WriteBlob {
                path: path.clone(),
                segment,
                source: "scripted failure".into(),
            });
        }
        data.segment_mut(segment).insert(path.clone(), content.to_string());
        let info = FileInfo::absorb_write(
            data.infos.get(path),
            path,
            segment,
            hash_content(content),
        );
        data.infos.insert(path.clone(), info);
        Ok(())
    }

    async fn delete_blob(&self, path: &VfsPathBuf, segment: Option<Segment>) -> StorageResult<()> {
        let mut data = self.locked_data();
        match segment {
            Some(segment) => {
                data.segment_mut(segment).remove(path);
            }
            None => {
                for segment in Segment::BLOB_SEGMENTS {
                    data.segment_mut(segment).remove(path);
                }
                data.infos.remove(path);
            }
        }
        Ok(())
    }

    async fn list_files(
        &self,
        prefix: Option<&VfsPathBuf>,
        segment: Option<Segment>,
        recursive: bool,
    ) -> StorageResult<Vec<(VfsPathBuf, FileInfo)>> {
        let data = self.locked_data();
        let paths: Vec<VfsPathBuf> = match segment {
            None | Some(Segment::Info) => data.infos.keys().cloned().collect(),
            Some(segment) => data.segment(segment).keys().cloned().collect(),
        };
        let mut files = vec![];
        for path in paths {
            if !listing_matches(&path, prefix, recursive) {
                continue;
            }
            if let Some(info) = data.infos.get(&path) {
                files.push((path, info.clone()));
            }
        }
        Ok(files)
    }

    async fn read_index(&self) -> StorageResult<Option<Index>> {
        let data = self.locked_data();
        let Some((head, last_commit_key)) = data.index.clone() else {
            return Ok(None);
        };
        Ok(Some(Index {
            head,
            last_commit_key,
            entries: data.infos.clone(),
        }))
    }

    async fn write_index(&self, index: &Index) -> StorageResult<()> {
        let mut data = self.locked_data();
        data.infos = index.entries.clone();
        data.index = Some((index.head.clone(), index.last_commit_key.clone()));
        Ok(())
    }
}
