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
use std::collections::VecDeque;
use std::fmt::Debug;
use std::fmt::Error;
use std::fmt::Formatter;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use async_trait::async_trait;
use gitstage_lib::content_hash::hash_content;
use gitstage_lib::index::ChangeKind;
use gitstage_lib::remote::CommitAction;
use gitstage_lib::remote::RemoteAdapter;
use gitstage_lib::remote::RemoteError;
use gitstage_lib::remote::RemoteResult;
use gitstage_lib::remote::RemoteSnapshot;
use gitstage_lib::remote::RemoteTreeEntry;
use gitstage_lib::vfs_path::VfsPathBuf;

/// A commit recorded by the in-memory remote, for assertions.
#[derive(Debug, Clone)]
pub struct RecordedCommit {
    pub sha: String,
    pub message: String,
    pub actions: Vec<CommitAction>,
}

#[derive(Default)]
struct TestRemoteData {
    head: String,
    files: BTreeMap<VfsPathBuf, String>,
    commits: Vec<RecordedCommit>,
    commit_counter: u64,
    fetch_failures: VecDeque<RemoteError>,
    commit_failures: VecDeque<RemoteError>,
}

/// An in-memory remote: one branch, applied actions, recorded commits,
/// and scripted failures. Clones share state, so a test can keep a
/// handle beside the adapter it gave to the VFS.
#[derive(Clone, Default)]
pub struct TestRemote {
    data: Arc<Mutex<TestRemoteData>>,
}

impl TestRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn locked_data(&self) -> MutexGuard<'_, TestRemoteData> {
        self.data.lock().unwrap()
    }

    /// Forces the remote to a given head and tree, as if another
    /// client had pushed.
    pub fn set_state(&self, head: &str, files: &[(&str, &str)]) {
        let mut data = self.locked_data();
        data.head = head.to_string();
        data.files = files
            .iter()
            .map(|(path, content)| {
                (VfsPathBuf::new(*path).unwrap(), (*content).to_string())
            })
            .collect();
    }

    pub fn head(&self) -> String {
        self.locked_data().head.clone()
    }

    pub fn files(&self) -> BTreeMap<VfsPathBuf, String> {
        self.locked_data().files.clone()
    }

    pub fn commits(&self) -> Vec<RecordedCommit> {
        self.locked_data().commits.clone()
    }

    /// Queues an error for the next snapshot fetch.
    pub fn fail_next_fetch(&self, err: RemoteError) {
        self.locked_data().fetch_failures.push_back(err);
    }

    /// Queues an error for the next commit attempt.
    pub fn fail_next_commit(&self, err: RemoteError) {
        self.locked_data().commit_failures.push_back(err);
    }
}

impl Debug for TestRemote {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        f.debug_struct("TestRemote").finish_non_exhaustive()
    }
}

#[async_trait]
impl RemoteAdapter for TestRemote {
    fn name(&self) -> &str {
        "test"
    }

    fn branch(&self) -> &str {
        "main"
    }

    async fn fetch_snapshot(&self, _branch: &str) -> RemoteResult<RemoteSnapshot> {
        let mut data = self.locked_data();
        if let Some(err) = data.fetch_failures.pop_front() {
            return Err(err);
        }
        Ok(RemoteSnapshot {
            head: data.head.clone(),
            files: data.files.clone(),
        })
    }

    async fn create_blobs(&self, contents: &[String]) -> RemoteResult<Vec<String>> {
        Ok(contents
            .iter()
            .map(|content| hash_content(content).hex())
            .collect())
    }

    async fn create_tree(
        &self,
        _base_tree: Option<&str>,
        _entries: &[RemoteTreeEntry],
    ) -> RemoteResult<String> {
        Ok("test:tree".to_string())
    }

    async fn create_commit(
        &self,
        _message: &str,
        _tree_sha: &str,
        _parents: &[String],
    ) -> RemoteResult<String> {
        Ok("test:commit".to_string())
    }

    async fn create_commit_with_actions(
        &self,
        _branch: &str,
        message: &str,
        actions: &[CommitAction],
    ) -> RemoteResult<String> {
        let mut data = self.locked_data();
        if let Some(err) = data.commit_failures.pop_front() {
            return Err(err);
        }
        for action in actions {
            match action.kind {
                ChangeKind::Create | ChangeKind::Update => {
                    data.files.insert(
                        action.path.clone(),
                        action.content.clone().unwrap_or_default(),
                    );
                }
                ChangeKind::Delete => {
                    data.files.remove(&action.path);
                }
            }
        }
        data.commit_counter += 1;
        let sha = format!("commit-{}", data.commit_counter);
        data.head = sha.clone();
        data.commits.push(RecordedCommit {
            sha: sha.clone(),
            message: message.to_string(),
            actions: actions.to_vec(),
        });
        Ok(sha)
    }

    async fn update_ref(&self, _branch: &str, commit_sha: &str) -> RemoteResult<()> {
        self.locked_data().head = commit_sha.to_string();
        Ok(())
    }
}
