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

//! The remote seam.
//!
//! A [`RemoteAdapter`] abstracts one hosting provider behind two core
//! operations: fetching a snapshot of a branch (head commit id, tree
//! listing, file contents) and applying an ordered list of
//! [`CommitAction`]s as a single remote commit. The legacy
//! blob/tree/commit/ref operations exist for providers that build
//! trees explicitly; a provider whose commit API takes actions
//! directly may return a marker from `create_tree` and do the real
//! work in `create_commit_with_actions`.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::index::ChangeKind;
use crate::vfs_path::VfsPathBuf;

/// A branch's state as fetched from the remote: head commit id and the
/// full tree of file contents.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct RemoteSnapshot {
    pub head: String,
    pub files: BTreeMap<VfsPathBuf, String>,
}

/// One file operation inside a remote commit.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct CommitAction {
    pub kind: ChangeKind,
    pub path: VfsPathBuf,
    /// File contents for creates and updates; `None` for deletes.
    pub content: Option<String>,
}

impl CommitAction {
    pub fn create(path: VfsPathBuf, content: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::Create,
            path,
            content: Some(content.into()),
        }
    }

    pub fn update(path: VfsPathBuf, content: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::Update,
            path,
            content: Some(content.into()),
        }
    }

    pub fn delete(path: VfsPathBuf) -> Self {
        Self {
            kind: ChangeKind::Delete,
            path,
            content: None,
        }
    }
}

/// A tree entry handed to the legacy `create_tree` operation. A `None`
/// sha removes the path from the tree.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct RemoteTreeEntry {
    pub path: VfsPathBuf,
    pub blob_sha: Option<String>,
}

/// Remote error with the retryable/terminal classification the retry
/// helper consumes.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Non-2xx response. The body text is propagated as the message.
    #[error("Remote returned HTTP {status}: {body}")]
    Http {
        status: u16,
        body: String,
        /// Server-provided `Retry-After`, when present. Overrides the
        /// computed backoff.
        retry_after: Option<Duration>,
    },
    /// Transport-layer failure (connect, timeout, TLS, ...).
    #[error("Could not reach remote")]
    Transport {
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// The response decoded but violates the provider's schema, e.g.
    /// a commit response missing the expected id.
    #[error("unexpected response: {message}")]
    UnexpectedResponse { message: String },
    /// The response body was not valid JSON.
    #[error("invalid JSON response")]
    InvalidJson {
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl RemoteError {
    /// HTTP >= 500, 408, 429, and transport failures are transient.
    /// Everything else is terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http { status, .. } => *status >= 500 || matches!(*status, 408 | 429),
            Self::Transport { .. } => true,
            Self::UnexpectedResponse { .. } | Self::InvalidJson { .. } => false,
        }
    }

    /// Server-requested delay before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Http { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Builds the error for a non-2xx response, draining the body text and
/// honoring a `Retry-After` header when one is present.
pub(crate) async fn status_error(response: reqwest::Response) -> RemoteError {
    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();
    RemoteError::Http {
        status,
        body,
        retry_after,
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport {
            source: Box::new(err),
        }
    }
}

/// Defines the interface for remote hosting providers.
#[async_trait]
pub trait RemoteAdapter: Send + Sync + Debug {
    /// A unique name identifying the provider.
    fn name(&self) -> &str;

    /// The branch this adapter was configured to track.
    fn branch(&self) -> &str;

    /// Reads the branch head commit id, the tree listing, and the raw
    /// contents of every file.
    async fn fetch_snapshot(&self, branch: &str) -> RemoteResult<RemoteSnapshot>;

    /// Uploads blobs, returning their provider shas in input order.
    async fn create_blobs(&self, contents: &[String]) -> RemoteResult<Vec<String>>;

    /// Builds a tree on top of `base_tree`. Providers whose commit API
    /// takes actions directly may return a marker here.
    async fn create_tree(
        &self,
        base_tree: Option<&str>,
        entries: &[RemoteTreeEntry],
    ) -> RemoteResult<String>;

    /// Creates a commit object for `tree_sha` with the given parents.
    async fn create_commit(
        &self,
        message: &str,
        tree_sha: &str,
        parents: &[String],
    ) -> RemoteResult<String>;

    /// Applies `actions` as one remote commit on `branch` and returns
    /// the new commit sha. The server rejects the commit without
    /// mutating the branch if the branch head moved since the actions
    /// were computed.
    async fn create_commit_with_actions(
        &self,
        branch: &str,
        message: &str,
        actions: &[CommitAction],
    ) -> RemoteResult<String>;

    /// Points the branch ref at `commit_sha`. Providers whose commit
    /// API already moved the ref may no-op.
    async fn update_ref(&self, branch: &str, commit_sha: &str) -> RemoteResult<()>;
}
