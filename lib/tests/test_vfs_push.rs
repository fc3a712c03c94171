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

use assert_matches::assert_matches;
use gitstage_lib::index::ChangeKind;
use gitstage_lib::index::FileState;
use gitstage_lib::remote::CommitAction;
use gitstage_lib::remote::RemoteError;
use gitstage_lib::retry::RetryPolicy;
use gitstage_lib::storage::Segment;
use gitstage_lib::vfs::PushRequest;
use gitstage_lib::vfs::VfsError;
use gitstage_lib::vfs_path::VfsPathBuf;
use pollster::FutureExt as _;
use pretty_assertions::assert_eq;
use testutils::new_vfs_with_remote;
use testutils::vfs_path;

fn push_request(message: &str, parent: &str) -> PushRequest {
    PushRequest {
        message: message.to_string(),
        parent_sha: parent.to_string(),
        changes: None,
    }
}

fn action_views(actions: &[CommitAction]) -> Vec<(ChangeKind, &str, Option<&str>)> {
    actions
        .iter()
        .map(|action| {
            (
                action.kind,
                action.path.as_str(),
                action.content.as_deref(),
            )
        })
        .collect()
}

#[test]
fn test_create_push() {
    let (mut vfs, backend, remote) = new_vfs_with_remote();
    vfs.write_file(&vfs_path("a.json"), "{\"x\":1}").block_on().unwrap();

    let outcome = vfs.push(push_request("add a.json", "")).block_on().unwrap();

    assert!(!outcome.noop);
    let commits = remote.commits();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].message, "add a.json");
    assert_eq!(
        action_views(&commits[0].actions),
        [(ChangeKind::Create, "a.json", Some("{\"x\":1}"))]
    );

    // The workspace was promoted into base.
    assert_eq!(
        backend.segment_contents(Segment::Base).get(&vfs_path("a.json")),
        Some(&"{\"x\":1}".to_string())
    );
    assert!(backend.segment_contents(Segment::Workspace).is_empty());
    assert_eq!(vfs.index().entry(&vfs_path("a.json")).unwrap().state, FileState::Base);
    assert_eq!(vfs.head(), outcome.commit_sha);
    assert_eq!(vfs.index().last_commit_key, Some(outcome.commit_sha.clone()));
    assert!(vfs.get_change_set().is_empty());
}

#[test]
fn test_update_push() {
    let (mut vfs, _backend, remote) = new_vfs_with_remote();
    remote.set_state("r1", &[("a.json", "v1")]);
    vfs.pull().block_on().unwrap();
    vfs.write_file(&vfs_path("a.json"), "v2").block_on().unwrap();

    let parent = vfs.head().to_string();
    vfs.push(push_request("update", &parent)).block_on().unwrap();

    let commits = remote.commits();
    assert_eq!(
        action_views(&commits[0].actions),
        [(ChangeKind::Update, "a.json", Some("v2"))]
    );
    assert_eq!(
        remote.files().get(&vfs_path("a.json")),
        Some(&"v2".to_string())
    );
}

#[test]
fn test_delete_push() {
    let (mut vfs, backend, remote) = new_vfs_with_remote();
    remote.set_state("r1", &[("a.json", "v1")]);
    vfs.pull().block_on().unwrap();
    vfs.delete_file(&vfs_path("a.json")).block_on().unwrap();

    let parent = vfs.head().to_string();
    vfs.push(push_request("remove", &parent)).block_on().unwrap();

    let commits = remote.commits();
    assert_eq!(
        action_views(&commits[0].actions),
        [(ChangeKind::Delete, "a.json", None)]
    );
    assert!(backend.segment_contents(Segment::Base).is_empty());
    assert_eq!(vfs.index().entry(&vfs_path("a.json")), None);
    assert!(remote.files().is_empty());
}

#[test]
fn test_push_with_stale_parent_mutates_nothing() {
    let (mut vfs, _backend, remote) = new_vfs_with_remote();
    remote.set_state("r1", &[("a.json", "v1")]);
    vfs.pull().block_on().unwrap();
    vfs.write_file(&vfs_path("a.json"), "v2").block_on().unwrap();

    let result = vfs.push(push_request("stale", "r0")).block_on();

    assert_matches!(
        result,
        Err(VfsError::HeadMismatch { parent, head }) if parent == "r0" && head == "r1"
    );
    assert!(remote.commits().is_empty(), "the remote must not be called");
    assert_eq!(vfs.head(), "r1");
    assert_eq!(
        vfs.index().entry(&vfs_path("a.json")).unwrap().state,
        FileState::Modified
    );
}

#[test]
fn test_push_with_unresolved_conflict_fails() {
    let (mut vfs, _backend, remote) = new_vfs_with_remote();
    remote.set_state("r1", &[("a.json", "v1")]);
    vfs.pull().block_on().unwrap();
    vfs.write_file(&vfs_path("a.json"), "local").block_on().unwrap();
    remote.set_state("r2", &[("a.json", "remote")]);
    vfs.pull().block_on().unwrap();

    let result = vfs.push(push_request("blocked", "r2")).block_on();

    assert_matches!(
        result,
        Err(VfsError::UnresolvedConflicts { paths }) if paths == [vfs_path("a.json")]
    );
    assert!(remote.commits().is_empty());

    // Resolving unblocks the push.
    vfs.resolve_conflict(&vfs_path("a.json")).block_on().unwrap();
    let outcome = vfs.push(push_request("after resolve", "r2")).block_on().unwrap();
    assert!(!outcome.noop);
    assert_eq!(
        remote.files().get(&vfs_path("a.json")),
        Some(&"local".to_string())
    );
}

#[test]
fn test_noop_push_skips_the_remote() {
    let (mut vfs, _backend, remote) = new_vfs_with_remote();
    remote.set_state("r1", &[("a.json", "v1")]);
    vfs.pull().block_on().unwrap();

    let outcome = vfs.push(push_request("nothing", "r1")).block_on().unwrap();

    assert!(outcome.noop);
    assert_eq!(outcome.commit_sha, "r1");
    assert!(remote.commits().is_empty());
    assert_eq!(vfs.head(), "r1");
}

#[test]
fn test_push_with_supplied_changes() {
    let (mut vfs, _backend, remote) = new_vfs_with_remote();
    let request = PushRequest {
        message: "scripted".to_string(),
        parent_sha: String::new(),
        // Deliberately unsorted; the push sorts delete-first by path.
        changes: Some(vec![
            CommitAction::create(vfs_path("b.txt"), "b"),
            CommitAction::delete(vfs_path("a.txt")),
        ]),
    };
    vfs.push(request).block_on().unwrap();

    let commits = remote.commits();
    assert_eq!(
        action_views(&commits[0].actions),
        [
            (ChangeKind::Delete, "a.txt", None),
            (ChangeKind::Create, "b.txt", Some("b")),
        ]
    );
}

#[test]
fn test_rename_pushes_as_delete_plus_create() {
    let (mut vfs, _backend, remote) = new_vfs_with_remote();
    remote.set_state("r1", &[("a.txt", "v1")]);
    vfs.pull().block_on().unwrap();
    vfs.rename_workspace(&vfs_path("a.txt"), &vfs_path("b.txt"))
        .block_on()
        .unwrap();

    let parent = vfs.head().to_string();
    vfs.push(push_request("rename", &parent)).block_on().unwrap();

    let commits = remote.commits();
    assert_eq!(
        action_views(&commits[0].actions),
        [
            (ChangeKind::Delete, "a.txt", None),
            (ChangeKind::Create, "b.txt", Some("v1")),
        ]
    );
    assert_eq!(
        remote.files().keys().map(VfsPathBuf::as_str).collect::<Vec<_>>(),
        ["b.txt"]
    );
}

#[test]
fn test_full_cycle_with_rename_and_delete() {
    let (mut vfs, _backend, remote) = new_vfs_with_remote();
    remote.set_state(
        "r1",
        &[
            ("readme.md", "hi"),
            ("t1.txt", "1"),
            ("t2.txt", "2"),
            ("t3.txt", "3"),
            ("t4.txt", "4"),
            ("t6.txt", "6"),
            ("t7.txt", "7"),
        ],
    );
    vfs.pull().block_on().unwrap();
    assert_eq!(vfs.list_paths().len(), 7);

    vfs.write_file(&vfs_path("t5.txt"), "hello").block_on().unwrap();
    vfs.delete_file(&vfs_path("t4.txt")).block_on().unwrap();

    let parent = vfs.head().to_string();
    let outcome = vfs.push(push_request("cycle", &parent)).block_on().unwrap();

    let commits = remote.commits();
    assert_eq!(
        action_views(&commits[0].actions),
        [
            (ChangeKind::Delete, "t4.txt", None),
            (ChangeKind::Create, "t5.txt", Some("hello")),
        ]
    );
    assert_eq!(
        vfs.list_paths().iter().map(VfsPathBuf::as_str).collect::<Vec<_>>(),
        ["readme.md", "t1.txt", "t2.txt", "t3.txt", "t5.txt", "t6.txt", "t7.txt"]
    );
    assert!(vfs.get_change_set().is_empty());
    assert_eq!(vfs.head(), outcome.commit_sha);
    assert_eq!(remote.head(), outcome.commit_sha);
}

#[test]
fn test_terminal_remote_failure_leaves_state_intact() {
    let (mut vfs, backend, remote) = new_vfs_with_remote();
    vfs.write_file(&vfs_path("a.json"), "v1").block_on().unwrap();
    remote.fail_next_commit(RemoteError::Http {
        status: 401,
        body: "bad credentials".to_string(),
        retry_after: None,
    });

    let result = vfs.push(push_request("doomed", "")).block_on();

    assert_matches!(
        result,
        Err(VfsError::Remote(RemoteError::Http { status: 401, .. }))
    );
    // Nothing was promoted or advanced.
    assert_eq!(vfs.head(), "");
    assert_eq!(vfs.index().entry(&vfs_path("a.json")).unwrap().state, FileState::Added);
    assert_eq!(
        backend.segment_contents(Segment::Workspace).get(&vfs_path("a.json")),
        Some(&"v1".to_string())
    );

    // A later attempt goes through.
    let outcome = vfs.push(push_request("retry", "")).block_on().unwrap();
    assert!(!outcome.noop);
}

#[tokio::test(start_paused = true)]
async fn test_transient_remote_failure_is_retried() {
    let (mut vfs, _backend, remote) = new_vfs_with_remote();
    vfs.write_file(&vfs_path("a.json"), "v1").await.unwrap();
    remote.fail_next_commit(RemoteError::Http {
        status: 503,
        body: "hold on".to_string(),
        retry_after: None,
    });

    let outcome = vfs.push(push_request("eventually", "")).await.unwrap();
    assert!(!outcome.noop);
    assert_eq!(remote.commits().len(), 1);
    assert_eq!(vfs.head(), outcome.commit_sha);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retry_budget_surfaces_the_failure() {
    let (mut vfs, _backend, remote) = new_vfs_with_remote();
    vfs.set_retry_policy(RetryPolicy {
        max_attempts: 3,
        ..RetryPolicy::default()
    });
    vfs.write_file(&vfs_path("a.json"), "v1").await.unwrap();
    for _ in 0..3 {
        remote.fail_next_fetch(RemoteError::Http {
            status: 500,
            body: "down".to_string(),
            retry_after: None,
        });
    }

    let result = vfs.pull().await;
    assert_matches!(
        result,
        Err(VfsError::Remote(RemoteError::Http { status: 500, .. }))
    );
    // The budget was spent: a fourth scripted failure would remain
    // queued if more attempts had been made.
    assert_eq!(vfs.head(), "");
}
