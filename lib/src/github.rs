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

//! GitHub remote adapter.
//!
//! GitHub commits through the low-level git data API, so the legacy
//! blob/tree/commit/ref operations carry their full meaning here and
//! `create_commit_with_actions` composes them: upload blobs, build a
//! tree on the parent commit's tree (deletions as null-sha entries),
//! create the commit, move the ref.

use std::fmt;
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::index::ChangeKind;
use crate::remote::CommitAction;
use crate::remote::RemoteAdapter;
use crate::remote::RemoteError;
use crate::remote::RemoteResult;
use crate::remote::RemoteSnapshot;
use crate::remote::RemoteTreeEntry;
use crate::remote::status_error;
use crate::vfs_path::VfsPathBuf;

const API_HOST: &str = "https://api.github.com";
const DEFAULT_BRANCH: &str = "main";
const USER_AGENT: &str = concat!("gitstage/", env!("CARGO_PKG_VERSION"));
const FILE_MODE: &str = "100644";

/// Construction options for [`GitHubAdapter`].
#[derive(Debug, Clone, serde::Deserialize)]
pub struct GitHubOptions {
    pub owner: String,
    pub repo: String,
    pub token: String,
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
    sha: String,
    commit: CommitDetail,
}

#[derive(Deserialize)]
struct CommitDetail {
    tree: ShaResponse,
}

#[derive(Deserialize)]
struct ShaResponse {
    sha: Option<String>,
}

#[derive(Deserialize)]
struct TreeResponse {
    tree: Vec<TreeResponseItem>,
}

#[derive(Deserialize)]
struct TreeResponseItem {
    path: String,
    #[serde(rename = "type")]
    item_type: String,
}

pub struct GitHubAdapter {
    client: reqwest::Client,
    owner: String,
    repo: String,
    token: String,
    branch: String,
}

impl Debug for GitHubAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        f.debug_struct("GitHubAdapter")
            .field("owner", &self.owner)
            .field("repo", &self.repo)
            .field("branch", &self.branch)
            .finish_non_exhaustive()
    }
}

impl GitHubAdapter {
    pub fn new(options: GitHubOptions) -> RemoteResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            owner: options.owner,
            repo: options.repo,
            token: options.token,
            branch: options.branch.unwrap_or_else(|| DEFAULT_BRANCH.to_string()),
        })
    }

    fn repo_url(&self, suffix: &str) -> String {
        format!("{API_HOST}/repos/{}/{}{}", self.owner, self.repo, suffix)
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header(reqwest::header::AUTHORIZATION, format!("token {}", self.token))
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
    }

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

    /// Expects the `sha` field every git data endpoint returns.
    fn require_sha(response: ShaResponse, endpoint: &str) -> RemoteResult<String> {
        response.sha.ok_or_else(|| RemoteError::UnexpectedResponse {
            message: format!("{endpoint} response missing sha"),
        })
    }

    async fn fetch_branch(&self, branch: &str) -> RemoteResult<BranchCommit> {
        let url = self.repo_url(&format!("/branches/{branch}"));
        let response: BranchResponse =
            self.fetch_json(self.request(reqwest::Method::GET, url)).await?;
        Ok(response.commit)
    }

    async fn fetch_raw_file(&self, branch: &str, path: &str) -> RemoteResult<String> {
        let url = self.repo_url(&format!("/contents/{path}?ref={branch}"));
        let response = self
            .request(reqwest::Method::GET, url)
            .header(reqwest::header::ACCEPT, "application/vnd.github.raw+json")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        Ok(response.text().await?)
    }
}

#[async_trait]
impl RemoteAdapter for GitHubAdapter {
    fn name(&self) -> &str {
        "github"
    }

    fn branch(&self) -> &str {
        &self.branch
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn fetch_snapshot(&self, branch: &str) -> RemoteResult<RemoteSnapshot> {
        let head = self.fetch_branch(branch).await?.sha;
        let url = self.repo_url(&format!("/git/trees/{head}?recursive=1"));
        let tree: TreeResponse = self.fetch_json(self.request(reqwest::Method::GET, url)).await?;
        let mut snapshot = RemoteSnapshot {
            head,
            ..RemoteSnapshot::default()
        };
        for item in tree.tree {
            if item.item_type != "blob" {
                continue;
            }
            let content = self.fetch_raw_file(branch, &item.path).await?;
            let path = VfsPathBuf::new(item.path).map_err(|err| {
                RemoteError::UnexpectedResponse {
                    message: format!("tree listing contains an unusable path: {err}"),
                }
            })?;
            snapshot.files.insert(path, content);
        }
        Ok(snapshot)
    }

    async fn create_blobs(&self, contents: &[String]) -> RemoteResult<Vec<String>> {
        let mut shas = vec![];
        for content in contents {
            let url = self.repo_url("/git/blobs");
            let body = json!({ "content": content, "encoding": "utf-8" });
            let response: ShaResponse = self
                .fetch_json(self.request(reqwest::Method::POST, url).json(&body))
                .await?;
            shas.push(Self::require_sha(response, "blob")?);
        }
        Ok(shas)
    }

    async fn create_tree(
        &self,
        base_tree: Option<&str>,
        entries: &[RemoteTreeEntry],
    ) -> RemoteResult<String> {
        let tree: Vec<_> = entries
            .iter()
            .map(|entry| {
                json!({
                    "path": entry.path.as_str(),
                    "mode": FILE_MODE,
                    "type": "blob",
                    // A null sha removes the path from the tree.
                    "sha": entry.blob_sha,
                })
            })
            .collect();
        let mut body = json!({ "tree": tree });
        if let Some(base_tree) = base_tree {
            body["base_tree"] = json!(base_tree);
        }
        let url = self.repo_url("/git/trees");
        let response: ShaResponse = self
            .fetch_json(self.request(reqwest::Method::POST, url).json(&body))
            .await?;
        Self::require_sha(response, "tree")
    }

    async fn create_commit(
        &self,
        message: &str,
        tree_sha: &str,
        parents: &[String],
    ) -> RemoteResult<String> {
        let url = self.repo_url("/git/commits");
        let body = json!({ "message": message, "tree": tree_sha, "parents": parents });
        let response: ShaResponse = self
            .fetch_json(self.request(reqwest::Method::POST, url).json(&body))
            .await?;
        Self::require_sha(response, "commit")
    }

    #[tracing::instrument(level = "debug", skip(self, actions), fields(actions = actions.len()))]
    async fn create_commit_with_actions(
        &self,
        branch: &str,
        message: &str,
        actions: &[CommitAction],
    ) -> RemoteResult<String> {
        let parent = self.fetch_branch(branch).await?;
        let base_tree = Self::require_sha(parent.commit.tree, "branch")?;

        let uploads: Vec<String> = actions
            .iter()
            .filter_map(|action| action.content.clone())
            .collect();
        let mut blob_shas = self.create_blobs(&uploads).await?.into_iter();
        let entries: Vec<RemoteTreeEntry> = actions
            .iter()
            .map(|action| RemoteTreeEntry {
                path: action.path.clone(),
                blob_sha: match action.kind {
                    ChangeKind::Delete => None,
                    ChangeKind::Create | ChangeKind::Update => blob_shas.next(),
                },
            })
            .collect();

        let tree_sha = self.create_tree(Some(&base_tree), &entries).await?;
        let commit_sha = self
            .create_commit(message, &tree_sha, &[parent.sha])
            .await?;
        self.update_ref(branch, &commit_sha).await?;
        Ok(commit_sha)
    }

    async fn update_ref(&self, branch: &str, commit_sha: &str) -> RemoteResult<()> {
        let url = self.repo_url(&format!("/git/refs/heads/{branch}"));
        let body = json!({ "sha": commit_sha, "force": false });
        let response = self
            .request(reqwest::Method::PATCH, url)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        Ok(())
    }
}
