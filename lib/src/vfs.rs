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

//! The virtual filesystem state machine.
//!
//! A [`Vfs`] tracks how the workspace diverges from the base snapshot
//! last reconciled with the remote, reconciles remote snapshots
//! three-way on pull, and pushes the accumulated change set as one
//! remote commit. The VFS owns its storage backend and remote adapter
//! exclusively; callers serialize operations on one instance.
//!
//! Every operation writes storage first and the index last, so a crash
//! leaves storage recoverable to the last durable index.

use std::collections::BTreeMap;

use itertools::Itertools as _;
use thiserror::Error;

use crate::content_hash::ContentSha;
use crate::content_hash::hash_content;
use crate::index::ChangeKind;
use crate::index::ChangeSetEntry;
use crate::index::FileInfo;
use crate::index::FileState;
use crate::index::Index;
use crate::index::MillisSinceEpoch;
use crate::remote::CommitAction;
use crate::remote::RemoteAdapter;
use crate::remote::RemoteError;
use crate::remote::RemoteResult;
use crate::retry::RetryClass;
use crate::retry::RetryPolicy;
use crate::retry::retry_with_backoff;
use crate::storage::Segment;
use crate::storage::StorageBackend;
use crate::storage::StorageError;
use crate::vfs_path::VfsPathBuf;

/// Error from a top-level VFS operation.
#[derive(Debug, Error)]
pub enum VfsError {
    #[error("Push parent {parent:?} does not match the local head {head:?}")]
    HeadMismatch { parent: String, head: String },
    #[error("Cannot push with {} unresolved conflicts", paths.len())]
    UnresolvedConflicts { paths: Vec<VfsPathBuf> },
    #[error("Rename source {path:?} not found")]
    SourceNotFound { path: VfsPathBuf },
    #[error("No remote adapter is configured")]
    RemoteNotConfigured,
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

pub type VfsResult<T> = Result<T, VfsError>;

/// One conflicting path reported by a pull.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ConflictEntry {
    pub path: VfsPathBuf,
    /// Fingerprint of the remote side; `None` when the remote deleted
    /// the path.
    pub remote_sha: Option<ContentSha>,
}

/// What a pull did.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct PullOutcome {
    /// Paths present in the remote snapshot.
    pub fetched_paths: Vec<VfsPathBuf>,
    pub conflicts: Vec<ConflictEntry>,
}

/// A push request: commit message, the remote head the caller believes
/// it is building on, and optionally a precomputed action list.
#[derive(Debug, Clone)]
pub struct PushRequest {
    pub message: String,
    pub parent_sha: String,
    pub changes: Option<Vec<CommitAction>>,
}

/// What a push did.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct PushOutcome {
    pub commit_sha: String,
    /// True when the change set was empty and the remote was never
    /// called; `commit_sha` is then the unchanged parent.
    pub noop: bool,
}

fn classify_remote<T>(outcome: &RemoteResult<T>) -> RetryClass {
    match outcome {
        Ok(_) => RetryClass::Halt,
        Err(err) if err.is_retryable() => RetryClass::Retry {
            after: err.retry_after(),
        },
        Err(_) => RetryClass::Halt,
    }
}

pub struct Vfs {
    backend: Box<dyn StorageBackend>,
    remote: Option<Box<dyn RemoteAdapter>>,
    retry: RetryPolicy,
    index: Index,
}

impl std::fmt::Debug for Vfs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("Vfs")
            .field("backend", &self.backend)
            .field("remote", &self.remote)
            .field("head", &self.index.head)
            .finish_non_exhaustive()
    }
}

impl Vfs {
    pub fn new(backend: Box<dyn StorageBackend>) -> Self {
        Self {
            backend,
            remote: None,
            retry: RetryPolicy::default(),
            index: Index::empty(),
        }
    }

    pub fn with_remote(backend: Box<dyn StorageBackend>, remote: Box<dyn RemoteAdapter>) -> Self {
        Self {
            remote: Some(remote),
            ..Self::new(backend)
        }
    }

    pub fn set_retry_policy(&mut self, retry: RetryPolicy) {
        self.retry = retry;
    }

    /// The remote commit id that `base` currently reflects.
    pub fn head(&self) -> &str {
        &self.index.head
    }

    /// Read-only view of the index, mainly for tests and diagnostics.
    pub fn index(&self) -> &Index {
        &self.index
    }

    /// Initializes the backend and loads the index. A missing or
    /// unreadable index resets to the empty value; no remote traffic.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn init(&mut self) -> VfsResult<()> {
        self.backend.init().await?;
        self.index = match self.backend.read_index().await {
            Ok(Some(index)) => index,
            Ok(None) => Index::empty(),
            Err(StorageError::CorruptIndex { source }) => {
                tracing::warn!(error = %source, "persisted index is unreadable, resetting");
                Index::empty()
            }
            Err(err) => return Err(err.into()),
        };
        Ok(())
    }

    async fn save_index(&mut self) -> VfsResult<()> {
        #[cfg(debug_assertions)]
        self.index.assert_entry_shapes();
        self.backend.write_index(&self.index).await?;
        Ok(())
    }

    /// Writes `content` at `path` in the workspace, classifying the
    /// divergence from base. Writing the base bytes back over an
    /// unmodified or modified entry reverts it instead of dirtying it.
    #[tracing::instrument(level = "debug", skip(self, content))]
    pub async fn write_file(&mut self, path: &VfsPathBuf, content: &str) -> VfsResult<()> {
        let sha = hash_content(content);
        let entry = self.index.entry(path).cloned();
        let info = match entry {
            None => {
                self.backend
                    .write_blob(path, content, Segment::Workspace)
                    .await?;
                let mut info = FileInfo::new(path.clone(), FileState::Added);
                info.workspace_sha = Some(sha);
                info
            }
            Some(mut info) => match info.state {
                FileState::Base => {
                    if info.base_sha.as_ref() == Some(&sha) {
                        return Ok(());
                    }
                    self.backend
                        .write_blob(path, content, Segment::Workspace)
                        .await?;
                    info.state = FileState::Modified;
                    info.workspace_sha = Some(sha);
                    info
                }
                FileState::Added | FileState::Modified => {
                    if info.base_sha.as_ref() == Some(&sha) {
                        // The edit re-created the base bytes: drop the
                        // workspace blob and revert to unmodified.
                        self.backend.delete_blob(path, Some(Segment::Workspace)).await?;
                        info.state = FileState::Base;
                        info.workspace_sha = None;
                        info
                    } else {
                        self.backend
                            .write_blob(path, content, Segment::Workspace)
                            .await?;
                        info.workspace_sha = Some(sha);
                        info
                    }
                }
                FileState::Deleted => {
                    // Un-tombstone. Re-creating the base bytes exactly
                    // restores the entry to unmodified.
                    if info.base_sha.as_ref() == Some(&sha) {
                        info.state = FileState::Base;
                        info.workspace_sha = None;
                        info
                    } else {
                        self.backend
                            .write_blob(path, content, Segment::Workspace)
                            .await?;
                        info.state = FileState::Modified;
                        info.workspace_sha = Some(sha);
                        info
                    }
                }
                FileState::Conflict => {
                    self.backend
                        .write_blob(path, content, Segment::Workspace)
                        .await?;
                    info.workspace_sha = Some(sha);
                    info
                }
            },
        };
        let mut info = info;
        info.updated_at = info.updated_at.max(MillisSinceEpoch::now());
        self.index.put_entry(info);
        self.save_index().await
    }

    /// Deletes `path`: tracked entries become tombstones until a push
    /// confirms the deletion; a locally-added file just disappears.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn delete_file(&mut self, path: &VfsPathBuf) -> VfsResult<()> {
        let Some(info) = self.index.entry(path).cloned() else {
            return Ok(());
        };
        match info.state {
            FileState::Deleted => return Ok(()),
            FileState::Added => {
                self.backend.delete_blob(path, Some(Segment::Workspace)).await?;
                self.index.remove_entry(path);
            }
            FileState::Base | FileState::Modified | FileState::Conflict => {
                self.backend.delete_blob(path, Some(Segment::Workspace)).await?;
                self.backend.delete_blob(path, Some(Segment::Conflict)).await?;
                if info.base_sha.is_some() {
                    let mut tombstone = info;
                    tombstone.state = FileState::Deleted;
                    tombstone.workspace_sha = None;
                    tombstone.remote_sha = None;
                    tombstone.updated_at = tombstone.updated_at.max(MillisSinceEpoch::now());
                    self.index.put_entry(tombstone);
                } else {
                    // A conflicted path that was never in base has
                    // nothing to tombstone; the next pull re-adds the
                    // remote side as a fresh base file.
                    self.index.remove_entry(path);
                }
            }
        }
        self.save_index().await
    }

    /// Renames `from` to `to` in the workspace. The rename appears in
    /// the change-set view as one delete plus one create.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn rename_workspace(&mut self, from: &VfsPathBuf, to: &VfsPathBuf) -> VfsResult<()> {
        let content = self.backend.read_blob(from, None).await?;
        let Some(content) = content else {
            return Err(VfsError::SourceNotFound { path: from.clone() });
        };
        self.write_file(to, &content).await?;
        self.delete_file(from).await
    }

    /// Returns the file contents as the application sees them:
    /// workspace if present, else base, else `None`.
    pub async fn read_file(&self, path: &VfsPathBuf) -> VfsResult<Option<String>> {
        Ok(self.backend.read_blob(path, None).await?)
    }

    /// Reads the workspace segment only, through the backend.
    pub async fn read_workspace(&self, path: &VfsPathBuf) -> VfsResult<Option<String>> {
        Ok(self.backend.read_blob(path, Some(Segment::Workspace)).await?)
    }

    /// Paths visible to the application (tombstones hidden).
    pub fn list_paths(&self) -> Vec<VfsPathBuf> {
        self.index.visible_paths()
    }

    /// The ordered list of pending local changes. Pure over the index.
    pub fn get_change_set(&self) -> Vec<ChangeSetEntry> {
        self.index.change_set()
    }

    /// Overwrites the base layer with `snapshot` and sets `head`. A
    /// blunt fast-forward primitive: local edits are preserved as
    /// modifications (or additions, when their base vanished), with no
    /// conflict detection. `pull` is the reconciling form.
    #[tracing::instrument(level = "debug", skip(self, snapshot))]
    pub async fn apply_base_snapshot(
        &mut self,
        snapshot: &BTreeMap<VfsPathBuf, String>,
        head: &str,
    ) -> VfsResult<()> {
        for (path, content) in snapshot {
            let sha = hash_content(content);
            self.backend.write_blob(path, content, Segment::Base).await?;
            let mut info = match self.index.entry(path).cloned() {
                Some(info) => info,
                None => FileInfo::new(path.clone(), FileState::Base),
            };
            info.base_sha = Some(sha);
            if matches!(info.state, FileState::Added | FileState::Modified) {
                if info.workspace_sha == info.base_sha {
                    // The new base caught up with the local edit.
                    self.backend.delete_blob(path, Some(Segment::Workspace)).await?;
                    info.state = FileState::Base;
                    info.workspace_sha = None;
                } else {
                    // An addition gains a base underneath it.
                    info.state = FileState::Modified;
                }
            }
            info.updated_at = info.updated_at.max(MillisSinceEpoch::now());
            self.index.put_entry(info);
        }

        let stale: Vec<FileInfo> = self
            .index
            .entries
            .values()
            .filter(|info| info.base_sha.is_some() && !snapshot.contains_key(&info.path))
            .cloned()
            .collect();
        for info in stale {
            self.backend.delete_blob(&info.path, Some(Segment::Base)).await?;
            match info.state {
                FileState::Modified | FileState::Conflict => {
                    // Keep the local bytes as a fresh addition.
                    let mut kept = info;
                    kept.state = FileState::Added;
                    kept.base_sha = None;
                    kept.remote_sha = None;
                    kept.updated_at = kept.updated_at.max(MillisSinceEpoch::now());
                    if kept.workspace_sha.is_some() {
                        self.index.put_entry(kept);
                    } else {
                        self.index.remove_entry(&kept.path);
                    }
                }
                _ => {
                    self.index.remove_entry(&info.path);
                }
            }
        }

        self.index.head = head.to_string();
        self.save_index().await
    }

    /// Fetches a snapshot from the configured remote and reconciles it.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn pull(&mut self) -> VfsResult<PullOutcome> {
        let adapter = self.remote.as_ref().ok_or(VfsError::RemoteNotConfigured)?;
        let branch = adapter.branch().to_string();
        let snapshot = retry_with_backoff(&self.retry, classify_remote, || {
            adapter.fetch_snapshot(&branch)
        })
        .await?;
        self.pull_with_snapshot(&snapshot.head, &snapshot.files).await
    }

    /// Reconciles a remote snapshot three-way against base and the
    /// workspace. Identical bytes on both sides never conflict;
    /// conflicting remote bytes are parked in the conflict segment and
    /// reported. Re-running with the same snapshot converges.
    #[tracing::instrument(level = "debug", skip(self, remote_files))]
    pub async fn pull_with_snapshot(
        &mut self,
        remote_head: &str,
        remote_files: &BTreeMap<VfsPathBuf, String>,
    ) -> VfsResult<PullOutcome> {
        let mut outcome = PullOutcome {
            fetched_paths: remote_files.keys().cloned().collect(),
            ..PullOutcome::default()
        };

        let paths: Vec<VfsPathBuf> = self
            .index
            .entries
            .keys()
            .merge(remote_files.keys())
            .dedup()
            .cloned()
            .collect();
        for path in paths {
            let entry = self.index.entry(&path).cloned();
            let remote_content = remote_files.get(&path);
            if let Some(conflict) = self
                .reconcile_path(&path, entry, remote_content)
                .await?
            {
                outcome.conflicts.push(conflict);
            }
        }

        self.index.head = remote_head.to_string();
        self.save_index().await?;
        Ok(outcome)
    }

    /// Reconciles one path; returns the conflict to report, if any.
    async fn reconcile_path(
        &mut self,
        path: &VfsPathBuf,
        entry: Option<FileInfo>,
        remote_content: Option<&String>,
    ) -> VfsResult<Option<ConflictEntry>> {
        let now = MillisSinceEpoch::now();
        match (entry, remote_content) {
            // New on the remote: becomes a base file.
            (None, Some(content)) => {
                self.backend.write_blob(path, content, Segment::Base).await?;
                let mut info = FileInfo::new(path.clone(), FileState::Base);
                info.base_sha = Some(hash_content(content));
                self.index.put_entry(info);
                Ok(None)
            }
            (None, None) => Ok(None),
            (Some(info), Some(content)) => {
                let remote_sha = hash_content(content);
                self.reconcile_present(path, info, content, remote_sha, now).await
            }
            (Some(info), None) => self.reconcile_absent(path, info, now).await,
        }
    }

    async fn reconcile_present(
        &mut self,
        path: &VfsPathBuf,
        mut info: FileInfo,
        content: &str,
        remote_sha: ContentSha,
        now: MillisSinceEpoch,
    ) -> VfsResult<Option<ConflictEntry>> {
        let remote_matches_base = info.base_sha.as_ref() == Some(&remote_sha);
        let remote_matches_workspace = info.workspace_sha.as_ref() == Some(&remote_sha);
        match info.state {
            FileState::Base => {
                if !remote_matches_base {
                    self.backend.write_blob(path, content, Segment::Base).await?;
                    info.base_sha = Some(remote_sha);
                    info.updated_at = info.updated_at.max(now);
                    self.index.put_entry(info);
                }
                Ok(None)
            }
            FileState::Added | FileState::Modified => {
                if remote_matches_workspace {
                    // Both sides wrote the same bytes; promote the
                    // workspace to base.
                    self.backend.write_blob(path, content, Segment::Base).await?;
                    self.backend.delete_blob(path, Some(Segment::Workspace)).await?;
                    info.state = FileState::Base;
                    info.base_sha = Some(remote_sha);
                    info.workspace_sha = None;
                    info.updated_at = info.updated_at.max(now);
                    self.index.put_entry(info);
                    Ok(None)
                } else if info.state == FileState::Modified && remote_matches_base {
                    // Remote unchanged since base; the local edit
                    // stands.
                    Ok(None)
                } else {
                    self.mark_conflict(path, info, Some(content), Some(remote_sha), now)
                        .await
                }
            }
            FileState::Deleted => {
                if remote_matches_base {
                    // Remote unchanged; the local delete stands.
                    Ok(None)
                } else {
                    // Local delete vs remote change.
                    self.mark_conflict(path, info, Some(content), Some(remote_sha), now)
                        .await
                }
            }
            FileState::Conflict => {
                if remote_matches_workspace {
                    // The local side caught up with the remote side;
                    // the conflict dissolves into a plain base file.
                    self.backend.write_blob(path, content, Segment::Base).await?;
                    self.backend.delete_blob(path, Some(Segment::Workspace)).await?;
                    self.backend.delete_blob(path, Some(Segment::Conflict)).await?;
                    info.state = FileState::Base;
                    info.base_sha = Some(remote_sha);
                    info.workspace_sha = None;
                    info.remote_sha = None;
                    info.updated_at = info.updated_at.max(now);
                    self.index.put_entry(info);
                    Ok(None)
                } else if remote_matches_base {
                    // The remote reverted to the base bytes; what is
                    // left is an ordinary local modification, or the
                    // pending delete the conflict interrupted.
                    self.backend.delete_blob(path, Some(Segment::Conflict)).await?;
                    info.state = if info.workspace_sha.is_some() {
                        FileState::Modified
                    } else {
                        FileState::Deleted
                    };
                    info.remote_sha = None;
                    info.updated_at = info.updated_at.max(now);
                    self.index.put_entry(info);
                    Ok(None)
                } else {
                    self.mark_conflict(path, info, Some(content), Some(remote_sha), now)
                        .await
                }
            }
        }
    }

    async fn reconcile_absent(
        &mut self,
        path: &VfsPathBuf,
        mut info: FileInfo,
        now: MillisSinceEpoch,
    ) -> VfsResult<Option<ConflictEntry>> {
        match info.state {
            // The local delete is confirmed (or was never pushed but
            // the remote agrees); the tombstone finalizes.
            FileState::Deleted => {
                self.backend.delete_blob(path, None).await?;
                self.index.remove_entry(path);
                Ok(None)
            }
            FileState::Base => {
                self.backend.delete_blob(path, None).await?;
                self.index.remove_entry(path);
                Ok(None)
            }
            // Never pushed; nothing to reconcile.
            FileState::Added => Ok(None),
            // Local change vs remote delete.
            FileState::Modified => {
                self.backend.delete_blob(path, Some(Segment::Base)).await?;
                info.base_sha = None;
                self.mark_conflict(path, info, None, None, now).await
            }
            FileState::Conflict => {
                if info.workspace_sha.is_some() {
                    self.backend.delete_blob(path, Some(Segment::Base)).await?;
                    self.backend.delete_blob(path, Some(Segment::Conflict)).await?;
                    info.base_sha = None;
                    self.mark_conflict(path, info, None, None, now).await
                } else {
                    // Local delete vs remote change, and the remote
                    // side has now deleted too: both sides agree.
                    self.backend.delete_blob(path, None).await?;
                    self.index.remove_entry(path);
                    Ok(None)
                }
            }
        }
    }

    /// Moves an entry into the conflict state, parking the remote
    /// bytes beside it. A failure to persist the remote bytes is
    /// logged rather than aborting the pull; the entry still records
    /// the remote fingerprint.
    async fn mark_conflict(
        &mut self,
        path: &VfsPathBuf,
        mut info: FileInfo,
        remote_content: Option<&str>,
        remote_sha: Option<ContentSha>,
        now: MillisSinceEpoch,
    ) -> VfsResult<Option<ConflictEntry>> {
        match remote_content {
            Some(content) => {
                if let Err(err) = self
                    .backend
                    .write_blob(path, content, Segment::Conflict)
                    .await
                {
                    tracing::warn!(
                        path = %path,
                        error = %err,
                        "could not persist remote content for conflict"
                    );
                }
            }
            None => {
                self.backend.delete_blob(path, Some(Segment::Conflict)).await?;
            }
        }
        info.state = FileState::Conflict;
        info.remote_sha = remote_sha.clone();
        info.updated_at = info.updated_at.max(now);
        self.index.put_entry(info);
        Ok(Some(ConflictEntry {
            path: path.clone(),
            remote_sha,
        }))
    }

    /// Resolves a conflicted path by accepting the remote side as the
    /// new merge base while keeping the local intent: divergent
    /// workspace bytes become a modification (or an addition, when the
    /// remote deleted the path), an absent workspace stays a pending
    /// delete.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn resolve_conflict(&mut self, path: &VfsPathBuf) -> VfsResult<()> {
        let Some(mut info) = self.index.entry(path).cloned() else {
            return Ok(());
        };
        if info.state != FileState::Conflict {
            return Ok(());
        }

        match info.remote_sha.take() {
            Some(_) => {
                let remote_content = self
                    .backend
                    .read_blob(path, Some(Segment::Conflict))
                    .await?
                    .unwrap_or_default();
                self.backend
                    .write_blob(path, &remote_content, Segment::Base)
                    .await?;
                self.backend.delete_blob(path, Some(Segment::Conflict)).await?;
                // Fingerprint what actually landed in base; if the
                // conflict blob had been lost, the recorded remote sha
                // would be a lie.
                info.base_sha = Some(hash_content(&remote_content));
                info.state = if info.workspace_sha == info.base_sha {
                    self.backend.delete_blob(path, Some(Segment::Workspace)).await?;
                    info.workspace_sha = None;
                    FileState::Base
                } else if info.workspace_sha.is_some() {
                    FileState::Modified
                } else {
                    FileState::Deleted
                };
            }
            None => {
                // The remote side is a deletion: the path starts over
                // as a local addition.
                self.backend.delete_blob(path, Some(Segment::Base)).await?;
                info.base_sha = None;
                info.state = FileState::Added;
            }
        }
        info.updated_at = info.updated_at.max(MillisSinceEpoch::now());
        if info.state == FileState::Added && info.workspace_sha.is_none() {
            self.index.remove_entry(path);
        } else {
            self.index.put_entry(info);
        }
        self.save_index().await
    }

    /// Materializes the change set into commit actions, attaching
    /// workspace contents to creates and updates.
    async fn materialize_changes(&self) -> VfsResult<Vec<CommitAction>> {
        let mut actions = vec![];
        for change in self.index.change_set() {
            let action = match change.kind {
                ChangeKind::Delete => CommitAction::delete(change.path),
                ChangeKind::Create | ChangeKind::Update => {
                    let content = self
                        .backend
                        .read_blob(&change.path, Some(Segment::Workspace))
                        .await?
                        .ok_or_else(|| {
                            StorageError::Other(
                                format!("workspace blob missing for {:?}", change.path).into(),
                            )
                        })?;
                    CommitAction {
                        kind: change.kind,
                        path: change.path,
                        content: Some(content),
                    }
                }
            };
            actions.push(action);
        }
        Ok(actions)
    }

    /// Pushes the pending change set as one remote commit and promotes
    /// the workspace into the new base. On failure nothing is
    /// promoted: the index is not advanced and the workspace is
    /// preserved.
    #[tracing::instrument(level = "debug", skip(self, request), fields(parent = %request.parent_sha))]
    pub async fn push(&mut self, request: PushRequest) -> VfsResult<PushOutcome> {
        if request.parent_sha != self.index.head {
            return Err(VfsError::HeadMismatch {
                parent: request.parent_sha,
                head: self.index.head.clone(),
            });
        }
        let conflicted = self.index.conflicted_paths();
        if !conflicted.is_empty() {
            return Err(VfsError::UnresolvedConflicts { paths: conflicted });
        }

        let mut actions = match request.changes {
            Some(actions) => actions,
            None => self.materialize_changes().await?,
        };
        actions.sort_by(|a, b| {
            (&a.path, a.kind != ChangeKind::Delete).cmp(&(&b.path, b.kind != ChangeKind::Delete))
        });
        if actions.is_empty() {
            return Ok(PushOutcome {
                commit_sha: request.parent_sha,
                noop: true,
            });
        }

        let adapter = self.remote.as_ref().ok_or(VfsError::RemoteNotConfigured)?;
        let branch = adapter.branch().to_string();
        let commit_sha = retry_with_backoff(&self.retry, classify_remote, || {
            adapter.create_commit_with_actions(&branch, &request.message, &actions)
        })
        .await?;

        // The commit is on the remote; promote the local layers to
        // match, storage first, index last.
        let entries: Vec<FileInfo> = self.index.entries.values().cloned().collect();
        for mut info in entries {
            match info.state {
                FileState::Added | FileState::Modified => {
                    let content = self
                        .backend
                        .read_blob(&info.path, Some(Segment::Workspace))
                        .await?
                        .unwrap_or_default();
                    self.backend
                        .write_blob(&info.path, &content, Segment::Base)
                        .await?;
                    self.backend
                        .delete_blob(&info.path, Some(Segment::Workspace))
                        .await?;
                    info.base_sha = info.workspace_sha.take();
                    info.state = FileState::Base;
                    info.updated_at = info.updated_at.max(MillisSinceEpoch::now());
                    self.index.put_entry(info);
                }
                FileState::Deleted => {
                    self.backend.delete_blob(&info.path, None).await?;
                    self.index.remove_entry(&info.path);
                }
                FileState::Base | FileState::Conflict => {}
            }
        }
        self.index.head = commit_sha.clone();
        self.index.last_commit_key = Some(commit_sha.clone());

        // The commit API may have moved the ref already; a failure
        // here must not fail the push.
        if let Some(adapter) = &self.remote
            && let Err(err) = adapter.update_ref(&branch, &commit_sha).await
        {
            tracing::warn!(error = %err, "ref update after commit failed");
        }

        self.save_index().await?;
        Ok(PushOutcome {
            commit_sha,
            noop: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_remote() {
        let retryable: RemoteResult<()> = Err(RemoteError::Http {
            status: 503,
            body: String::new(),
            retry_after: Some(std::time::Duration::from_secs(3)),
        });
        assert_eq!(
            classify_remote(&retryable),
            RetryClass::Retry {
                after: Some(std::time::Duration::from_secs(3))
            }
        );

        let terminal: RemoteResult<()> = Err(RemoteError::UnexpectedResponse {
            message: "missing id".to_string(),
        });
        assert_eq!(classify_remote(&terminal), RetryClass::Halt);
        assert_eq!(classify_remote(&Ok(())), RetryClass::Halt);
    }
}
