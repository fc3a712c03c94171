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

//! The index: the VFS's authoritative record of per-path state.
//!
//! The index maps each logical path to a [`FileInfo`] entry describing
//! how the path relates to the base snapshot (`head` on the remote).
//! Entries move through the [`FileState`] machine as the application
//! edits files and as pulls and pushes reconcile with the remote. The
//! aggregate [`Index`] value is persisted through the storage backend,
//! which also keeps a per-path copy of each entry for enumeration.

use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::Deserialize;
use serde::Serialize;

use crate::content_hash::ContentSha;
use crate::storage::Segment;
use crate::vfs_path::VfsPathBuf;

/// Milliseconds since the Unix epoch.
#[derive(
    Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default, Serialize, Deserialize,
)]
pub struct MillisSinceEpoch(pub i64);

impl MillisSinceEpoch {
    /// The current wall clock. Entry stamps never move backwards, so a
    /// clock step back degrades to "stale but ordered" rather than
    /// reordering history.
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map_or(0, |duration| duration.as_millis() as i64);
        Self(millis)
    }
}

/// How a path relates to the base snapshot.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileState {
    /// Unmodified: the workspace has no entry, the base bytes are the
    /// remote bytes at `head`.
    Base,
    /// Created locally; no base bytes exist.
    Added,
    /// Base bytes exist and the workspace holds different bytes.
    Modified,
    /// Tombstone: deleted locally, awaiting a push to confirm.
    Deleted,
    /// A pull found remote bytes that disagree with local edits; the
    /// remote side is parked in the conflict segment.
    Conflict,
}

/// The classification of a pending local change, as it will appear in a
/// remote commit.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

/// One element of the change set: a pending action at a path. Contents
/// are attached when the change set is materialized into commit
/// actions; the projection itself never touches storage.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ChangeSetEntry {
    pub kind: ChangeKind,
    pub path: VfsPathBuf,
}

/// Per-path index entry.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: VfsPathBuf,
    pub state: FileState,
    /// Fingerprint of the current base bytes, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_sha: Option<ContentSha>,
    /// Fingerprint of the current workspace bytes, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_sha: Option<ContentSha>,
    /// Fingerprint of the remote bytes seen at the last pull; carried
    /// while the entry is in conflict.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_sha: Option<ContentSha>,
    pub updated_at: MillisSinceEpoch,
}

impl FileInfo {
    pub fn new(path: VfsPathBuf, state: FileState) -> Self {
        Self {
            path,
            state,
            base_sha: None,
            workspace_sha: None,
            remote_sha: None,
            updated_at: MillisSinceEpoch::now(),
        }
    }

    /// Compose-merges a blob write into the info record for its path.
    ///
    /// This is the mechanical projection backends apply when
    /// `write_blob` lands bytes in a segment; it keeps the per-path
    /// info record coherent even before the VFS writes the index. The
    /// VFS's own transitions are richer (it deletes the workspace blob
    /// instead of writing it when an edit reverts to base, for
    /// example), and overwrite these records when the index is saved.
    pub fn absorb_write(
        existing: Option<&Self>,
        path: &VfsPathBuf,
        segment: Segment,
        sha: ContentSha,
    ) -> Self {
        let mut info = existing
            .cloned()
            .unwrap_or_else(|| Self::new(path.clone(), FileState::Added));
        match segment {
            Segment::Workspace => {
                info.workspace_sha = Some(sha);
                info.state = match info.state {
                    FileState::Conflict => FileState::Conflict,
                    _ if info.base_sha.is_some() => FileState::Modified,
                    _ => FileState::Added,
                };
            }
            Segment::Base => {
                info.base_sha = Some(sha);
                if existing.is_none() {
                    info.state = FileState::Base;
                }
            }
            Segment::Conflict => {
                info.remote_sha = Some(sha);
                info.state = FileState::Conflict;
            }
            Segment::Info => {}
        }
        info.updated_at = info.updated_at.max(MillisSinceEpoch::now());
        info
    }

    /// Whether the path shows up in `list_paths` (tombstones hidden).
    pub fn is_visible(&self) -> bool {
        !matches!(self.state, FileState::Deleted)
    }

    /// Whether the workspace side diverges from base.
    pub fn has_local_edits(&self) -> bool {
        !matches!(self.state, FileState::Base)
    }

    /// Checks the sha-field shape required by the entry's state.
    /// Storage-presence checks live with the backends; this covers the
    /// pure half.
    pub fn check_shape(&self) -> Result<(), String> {
        let ok = match self.state {
            FileState::Base => self.base_sha.is_some() && self.workspace_sha.is_none(),
            FileState::Added => self.base_sha.is_none() && self.workspace_sha.is_some(),
            FileState::Modified => {
                self.base_sha.is_some()
                    && self.workspace_sha.is_some()
                    && self.base_sha != self.workspace_sha
            }
            FileState::Deleted => self.base_sha.is_some() && self.workspace_sha.is_none(),
            // At least one divergent side must exist. `remote_sha` is
            // absent when the remote side is a deletion.
            FileState::Conflict => self.remote_sha.is_some() || self.workspace_sha.is_some(),
        };
        if ok {
            Ok(())
        } else {
            Err(format!(
                "index entry for {:?} has state {:?} but shas {:?}/{:?}/{:?}",
                self.path, self.state, self.base_sha, self.workspace_sha, self.remote_sha
            ))
        }
    }
}

/// The aggregate index value: the remote commit that `base` reflects,
/// the key of the last commit this client created, and all per-path
/// entries.
#[derive(Debug, PartialEq, Eq, Clone, Default, Serialize, Deserialize)]
pub struct Index {
    #[serde(default)]
    pub head: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_commit_key: Option<String>,
    #[serde(default)]
    pub entries: BTreeMap<VfsPathBuf, FileInfo>,
}

impl Index {
    /// An index that has never seen a remote.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn entry(&self, path: &VfsPathBuf) -> Option<&FileInfo> {
        self.entries.get(path)
    }

    /// Inserts or replaces the entry at `info.path`.
    pub fn put_entry(&mut self, info: FileInfo) {
        self.entries.insert(info.path.clone(), info);
    }

    pub fn remove_entry(&mut self, path: &VfsPathBuf) -> Option<FileInfo> {
        self.entries.remove(path)
    }

    /// Paths visible to the application: everything except tombstones.
    pub fn visible_paths(&self) -> Vec<VfsPathBuf> {
        self.entries
            .values()
            .filter(|info| info.is_visible())
            .map(|info| info.path.clone())
            .collect()
    }

    /// Paths whose entries are in conflict.
    pub fn conflicted_paths(&self) -> Vec<VfsPathBuf> {
        self.entries
            .values()
            .filter(|info| matches!(info.state, FileState::Conflict))
            .map(|info| info.path.clone())
            .collect()
    }

    /// Projects the pending local changes in commit order:
    /// lexicographic by path, with a delete sorting before a create or
    /// update at the same path. Pure over the entries; contents are
    /// attached later, when the set is materialized into commit
    /// actions.
    pub fn change_set(&self) -> Vec<ChangeSetEntry> {
        let mut changes: Vec<ChangeSetEntry> = self
            .entries
            .values()
            .filter_map(|info| {
                let kind = match info.state {
                    FileState::Added => ChangeKind::Create,
                    FileState::Modified => ChangeKind::Update,
                    FileState::Deleted => ChangeKind::Delete,
                    FileState::Base | FileState::Conflict => return None,
                };
                Some(ChangeSetEntry {
                    kind,
                    path: info.path.clone(),
                })
            })
            .collect();
        changes.sort_by(|a, b| {
            (&a.path, a.kind != ChangeKind::Delete).cmp(&(&b.path, b.kind != ChangeKind::Delete))
        });
        changes
    }

    /// Panics if any entry violates the state/sha shape invariants.
    /// Intended for `debug_assert!`-style checks after operations and
    /// for direct use in tests.
    pub fn assert_entry_shapes(&self) {
        for (path, info) in &self.entries {
            assert_eq!(path, &info.path, "entry keyed under a foreign path");
            if let Err(message) = info.check_shape() {
                panic!("{message}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_hash::hash_content;

    fn path(value: &str) -> VfsPathBuf {
        VfsPathBuf::new(value).unwrap()
    }

    fn entry(path_value: &str, state: FileState) -> FileInfo {
        let mut info = FileInfo::new(path(path_value), state);
        match state {
            FileState::Base | FileState::Deleted => {
                info.base_sha = Some(hash_content("base"));
            }
            FileState::Added => {
                info.workspace_sha = Some(hash_content("local"));
            }
            FileState::Modified => {
                info.base_sha = Some(hash_content("base"));
                info.workspace_sha = Some(hash_content("local"));
            }
            FileState::Conflict => {
                info.workspace_sha = Some(hash_content("local"));
                info.remote_sha = Some(hash_content("remote"));
            }
        }
        info
    }

    #[test]
    fn test_change_set_projection_and_order() {
        let mut index = Index::empty();
        index.put_entry(entry("t5.txt", FileState::Added));
        index.put_entry(entry("t4.txt", FileState::Deleted));
        index.put_entry(entry("a.json", FileState::Modified));
        index.put_entry(entry("kept.txt", FileState::Base));
        index.put_entry(entry("fight.txt", FileState::Conflict));

        let changes = index.change_set();
        assert_eq!(
            changes
                .iter()
                .map(|change| (change.kind, change.path.as_str()))
                .collect::<Vec<_>>(),
            [
                (ChangeKind::Update, "a.json"),
                (ChangeKind::Delete, "t4.txt"),
                (ChangeKind::Create, "t5.txt"),
            ]
        );
    }

    #[test]
    fn test_absorb_write_transitions() {
        let p = path("a.json");
        let workspace_sha = hash_content("local");

        // First workspace write at an unknown path creates an Added entry.
        let info = FileInfo::absorb_write(None, &p, Segment::Workspace, workspace_sha.clone());
        assert_eq!(info.state, FileState::Added);
        assert_eq!(info.workspace_sha, Some(workspace_sha.clone()));
        info.check_shape().unwrap();

        // A base write underneath turns a later workspace write into Modified.
        let base = FileInfo::absorb_write(None, &p, Segment::Base, hash_content("v1"));
        assert_eq!(base.state, FileState::Base);
        let modified =
            FileInfo::absorb_write(Some(&base), &p, Segment::Workspace, workspace_sha.clone());
        assert_eq!(modified.state, FileState::Modified);
        modified.check_shape().unwrap();

        // A conflict-segment write parks the remote sha and pins the state.
        let conflicted =
            FileInfo::absorb_write(Some(&modified), &p, Segment::Conflict, hash_content("remote"));
        assert_eq!(conflicted.state, FileState::Conflict);
        assert_eq!(conflicted.remote_sha, Some(hash_content("remote")));
        // Workspace writes while conflicted stay conflicted.
        let still =
            FileInfo::absorb_write(Some(&conflicted), &p, Segment::Workspace, workspace_sha);
        assert_eq!(still.state, FileState::Conflict);
    }

    #[test]
    fn test_visible_paths_hide_tombstones() {
        let mut index = Index::empty();
        index.put_entry(entry("a.json", FileState::Base));
        index.put_entry(entry("gone.txt", FileState::Deleted));
        index.put_entry(entry("new.txt", FileState::Added));
        assert_eq!(
            index
                .visible_paths()
                .iter()
                .map(VfsPathBuf::as_str)
                .collect::<Vec<_>>(),
            ["a.json", "new.txt"]
        );
        assert_eq!(index.conflicted_paths(), Vec::<VfsPathBuf>::new());
    }

    #[test]
    fn test_serde_round_trip() {
        let mut index = Index {
            head: "h1".to_string(),
            last_commit_key: Some("c1".to_string()),
            entries: BTreeMap::new(),
        };
        index.put_entry(entry("a.json", FileState::Modified));
        let json = serde_json::to_string(&index).unwrap();
        let back: Index = serde_json::from_str(&json).unwrap();
        assert_eq!(back, index);

        // A missing or unparseable index resets to the empty value.
        let empty: Index = serde_json::from_str("{}").unwrap();
        assert_eq!(empty, Index::empty());
        assert_eq!(empty.head, "");
    }

    #[test]
    fn test_shape_checks() {
        let mut bad = entry("a.json", FileState::Modified);
        bad.workspace_sha = bad.base_sha.clone();
        assert!(bad.check_shape().is_err());

        let mut index = Index::empty();
        index.put_entry(entry("a.json", FileState::Base));
        index.assert_entry_shapes();
    }
}
