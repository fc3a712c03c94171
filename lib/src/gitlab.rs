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

//! GitLab remote adapter.
//!
//! GitLab's commits API applies a whole list of file actions as one
//! commit, so this adapter routes everything through
//! `create_commit_with_actions`. The legacy blob/tree/commit
//! operations return markers; nothing downstream consumes them.

use std::fmt;
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use percent_encoding::AsciiSet;
use percent_encoding::NON_ALPHANUMERIC;
use percent_encoding::utf8_percent_encode;
use serde::Deserialize;
use serde_json::json;

use crate::content_hash::hash_content;
use crate::index::ChangeKind;
use crate::remote::CommitAction;
use crate::remote::RemoteAdapter;
use crate::remote::RemoteError;
use crate::remote::RemoteResult;
use crate::remote::RemoteSnapshot;
use crate::remote::RemoteTreeEntry;
use crate::remote::status_error;
use crate::vfs_path::VfsPathBuf;

/// Marker returned by the legacy tree operation; the real work happens
/// in `create_commit_with_actions`.
pub const GITLAB_TREE_MARKER: &str = "gitlab:tree";
/// Marker returned by the legacy commit operation.
pub const GITLAB_COMMIT_MARKER: &str = "gitlab:commit";

const DEFAULT_HOST: &str = "https://gitlab.com";
const DEFAULT_BRANCH: &str = "main";
const TREE_PAGE_SIZE: usize = 100;

/// Everything except RFC 3986 unreserved characters. Encodes `/` in a
/// path-with-namespace the way the GitLab API requires.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

fn encode_segment(value: &str) -> String {
    utf8_percent_encode(value, PATH_SEGMENT).to_string()
}

/// Construction options for [`GitLabAdapter`].
#[derive(Debug, Clone, serde::Deserialize)]
pub struct GitLabOptions {
    /// Numeric project id or path-with-namespace (`group/project`).
    pub project_id: String,
    pub token: String,
    /// Instance base URL; defaults to `https://gitlab.com`.
    #[serde(default)]
    pub host: Option<String>,
    /// Tracked branch; defaults to `main`.
    #[serde(default)]
    pub branch: Option<String>,
}

#[derive(Deserialize)]
struct BranchResponse {
    commit: BranchCommit,
}

#[derive(Deserialize)]
struct BranchCommit {
    id: String,
}

#[derive(Deserialize)]
struct TreeItem {
    path: String,
    #[serde(rename = "type")]
    item_type: String,
}

#[derive(Deserialize)]
struct CommitResponse {
    id: Option<String>,
}

pub struct GitLabAdapter {
    client: reqwest::Client,
    host: String,
    project_id: String,
    token: String,
    branch: String,
}

impl Debug for GitLabAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        f.debug_struct("GitLabAdapter")
            .field("host", &self.host)
            .field("project_id", &self.project_id)
            .field("branch", &self.branch)
            .finish_non_exhaustive()
    }
}

impl GitLabAdapter {
    pub fn new(options: GitLabOptions) -> RemoteResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            host: options
                .host
                .unwrap_or_else(|| DEFAULT_HOST.to_string())
                .trim_end_matches('/')
                .to_string(),
            project_id: options.project_id,
            token: options.token,
            branch: options.branch.unwrap_or_else(|| DEFAULT_BRANCH.to_string()),
        })
    }

    fn project_url(&self, suffix: &str) -> String {
        format!(
            "{}/api/v4/projects/{}{}",
            self.host,
            encode_segment(&self.project_id),
            suffix
        )
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header("PRIVATE-TOKEN", &self.token)
    }

    /// Sends a request and decodes a JSON response body, mapping the
    /// failure modes onto the remote error contract.
    async fn fetch_json<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> RemoteResult<T> {
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|err| RemoteError::InvalidJson {
            source: err.into(),
        })
    }

    async fn fetch_head(&self, branch: &str) -> RemoteResult<String> {
        let url = self.project_url(&format!("/repository/branches/{}", encode_segment(branch)));
        let response: BranchResponse = self.fetch_json(self.request(reqwest::Method::GET, url)).await?;
        Ok(response.commit.id)
    }

    async fn fetch_tree_paths(&self, branch: &str) -> RemoteResult<Vec<String>> {
        let mut paths = vec![];
        let mut page = 1;
        loop {
            let url = self.project_url(&format!(
                "/repository/tree?ref={}&recursive=true&per_page={TREE_PAGE_SIZE}&page={page}",
                encode_segment(branch)
            ));
            let items: Vec<TreeItem> =
                self.fetch_json(self.request(reqwest::Method::GET, url)).await?;
            let item_count = items.len();
            paths.extend(
                items
                    .into_iter()
                    .filter(|item| item.item_type == "blob")
                    .map(|item| item.path),
            );
            if item_count < TREE_PAGE_SIZE {
                return Ok(paths);
            }
            page += 1;
        }
    }

    async fn fetch_raw_file(&self, branch: &str, path: &str) -> RemoteResult<String> {
        let url = self.project_url(&format!(
            "/repository/files/{}/raw?ref={}",
            encode_segment(path),
            encode_segment(branch)
        ));
        let response = self.request(reqwest::Method::GET, url).send().await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        Ok(response.text().await?)
    }
}

fn action_name(kind: ChangeKind) -> &'static str {
    match kind {
        ChangeKind::Create => "create",
        ChangeKind::Update => "update",
        ChangeKind::Delete => "delete",
    }
}

#[async_trait]
impl RemoteAdapter for GitLabAdapter {
    fn name(&self) -> &str {
        "gitlab"
    }

    fn branch(&self) -> &str {
        &self.branch
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn fetch_snapshot(&self, branch: &str) -> RemoteResult<RemoteSnapshot> {
        let head = self.fetch_head(branch).await?;
        let mut snapshot = RemoteSnapshot {
            head,
            ..RemoteSnapshot::default()
        };
        for raw_path in self.fetch_tree_paths(branch).await? {
            let content = self.fetch_raw_file(branch, &raw_path).await?;
            let path = VfsPathBuf::new(raw_path).map_err(|err| {
                RemoteError::UnexpectedResponse {
                    message: format!("tree listing contains an unusable path: {err}"),
                }
            })?;
            snapshot.files.insert(path, content);
        }
        Ok(snapshot)
    }

    async fn create_blobs(&self, contents: &[String]) -> RemoteResult<Vec<String>> {
        // GitLab has no blob endpoint; the commits API uploads content
        // inline. Hand back content fingerprints so legacy callers get
        // stable ids.
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
        Ok(GITLAB_TREE_MARKER.to_string())
    }

    async fn create_commit(
        &self,
        _message: &str,
        _tree_sha: &str,
        _parents: &[String],
    ) -> RemoteResult<String> {
        Ok(GITLAB_COMMIT_MARKER.to_string())
    }

    #[tracing::instrument(level = "debug", skip(self, actions), fields(actions = actions.len()))]
    async fn create_commit_with_actions(
        &self,
        branch: &str,
        message: &str,
        actions: &[CommitAction],
    ) -> RemoteResult<String> {
        let body = json!({
            "branch": branch,
            "commit_message": message,
            "actions": actions
                .iter()
                .map(|action| {
                    let mut value = json!({
                        "action": action_name(action.kind),
                        "file_path": action.path.as_str(),
                    });
                    if let Some(content) = &action.content {
                        value["content"] = json!(content);
                    }
                    value
                })
                .collect::<Vec<_>>(),
        });
        let url = self.project_url("/repository/commits");
        let response: CommitResponse = self
            .fetch_json(self.request(reqwest::Method::POST, url).json(&body))
            .await?;
        response.id.ok_or_else(|| RemoteError::UnexpectedResponse {
            message: "commit response missing id".to_string(),
        })
    }

    async fn update_ref(&self, _branch: &str, _commit_sha: &str) -> RemoteResult<()> {
        // The commits API moves the branch ref as part of the commit.
        Ok(())
    }
}
