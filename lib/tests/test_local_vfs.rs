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

use gitstage_lib::index::ChangeKind;
use gitstage_lib::index::FileState;
use gitstage_lib::local_backend::LocalBackend;
use gitstage_lib::vfs::PushRequest;
use gitstage_lib::vfs::Vfs;
use gitstage_lib::vfs_path::VfsPathBuf;
use pollster::FutureExt as _;
use testutils::test_remote::TestRemote;
use testutils::vfs_path;

fn local_vfs(root: &std::path::Path, remote: &TestRemote) -> Vfs {
    let backend = LocalBackend::with_root(root, "main");
    let mut vfs = Vfs::with_remote(Box::new(backend), Box::new(remote.clone()));
    vfs.init().block_on().unwrap();
    vfs
}

#[test]
fn test_cycle_on_a_filesystem_root() {
    let temp_dir = tempfile::tempdir().unwrap();
    let remote = TestRemote::new();
    remote.set_state("r1", &[("docs/readme.md", "hello"), ("config.json", "{}")]);

    let mut vfs = local_vfs(temp_dir.path(), &remote);
    vfs.pull().block_on().unwrap();
    assert_eq!(vfs.head(), "r1");
    assert_eq!(
        vfs.read_file(&vfs_path("docs/readme.md")).block_on().unwrap(),
        Some("hello".to_string())
    );

    vfs.write_file(&vfs_path("config.json"), "{\"debug\":true}")
        .block_on()
        .unwrap();
    vfs.write_file(&vfs_path("docs/guide.md"), "new page")
        .block_on()
        .unwrap();

    let parent = vfs.head().to_string();
    let outcome = vfs
        .push(PushRequest {
            message: "edit config, add guide".to_string(),
            parent_sha: parent,
            changes: None,
        })
        .block_on()
        .unwrap();

    let commits = remote.commits();
    assert_eq!(
        commits[0]
            .actions
            .iter()
            .map(|action| (action.kind, action.path.as_str()))
            .collect::<Vec<_>>(),
        [
            (ChangeKind::Update, "config.json"),
            (ChangeKind::Create, "docs/guide.md"),
        ]
    );

    // A fresh VFS over the same root sees the pushed state.
    let mut reopened = local_vfs(temp_dir.path(), &remote);
    assert_eq!(reopened.head(), outcome.commit_sha);
    assert_eq!(
        reopened
            .list_paths()
            .iter()
            .map(VfsPathBuf::as_str)
            .collect::<Vec<_>>(),
        ["config.json", "docs/guide.md", "docs/readme.md"]
    );
    assert!(reopened.get_change_set().is_empty());
    assert_eq!(
        reopened
            .index()
            .entry(&vfs_path("docs/guide.md"))
            .unwrap()
            .state,
        FileState::Base
    );
    // And pulling on the reopened instance is a clean no-op.
    let pull = reopened.pull().block_on().unwrap();
    assert_eq!(pull.conflicts, vec![]);
}

#[test]
fn test_init_resets_unreadable_index() {
    let temp_dir = tempfile::tempdir().unwrap();
    let remote = TestRemote::new();
    let root = temp_dir.path().join("main");
    std::fs::create_dir_all(&root).unwrap();
    std::fs::write(root.join("index"), "definitely not json").unwrap();

    let vfs = local_vfs(temp_dir.path(), &remote);
    assert_eq!(vfs.head(), "");
    assert!(vfs.index().entries.is_empty());
    assert!(vfs.list_paths().is_empty());
}

#[test]
fn test_two_roots_are_independent() {
    let temp_dir = tempfile::tempdir().unwrap();

    let mut first = Vfs::new(Box::new(LocalBackend::with_root(temp_dir.path(), "one")));
    first.init().block_on().unwrap();
    first.write_file(&vfs_path("a.txt"), "one").block_on().unwrap();

    let mut second = Vfs::new(Box::new(LocalBackend::with_root(temp_dir.path(), "two")));
    second.init().block_on().unwrap();
    assert!(second.list_paths().is_empty());

    assert_eq!(
        LocalBackend::available_roots(temp_dir.path()).unwrap(),
        ["one", "two"]
    );
}
