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

use gitstage_lib::vfs::Vfs;
use gitstage_lib::vfs_path::VfsPathBuf;
use pollster::FutureExt as _;

use crate::test_backend::TestStorageBackend;
use crate::test_remote::TestRemote;

pub mod test_backend;
pub mod test_remote;

/// Shorthand constructor for a validated path; panics on invalid
/// input, which in a test is what you want.
pub fn vfs_path(value: &str) -> VfsPathBuf {
    VfsPathBuf::new(value).unwrap()
}

/// An initialized VFS over a fresh in-memory backend, no remote.
pub fn new_vfs() -> (Vfs, TestStorageBackend) {
    let backend = TestStorageBackend::new();
    let mut vfs = Vfs::new(Box::new(backend.clone()));
    vfs.init().block_on().unwrap();
    (vfs, backend)
}

/// An initialized VFS wired to a shared in-memory remote. The returned
/// handles observe the same backend and remote the VFS uses.
pub fn new_vfs_with_remote() -> (Vfs, TestStorageBackend, TestRemote) {
    let backend = TestStorageBackend::new();
    let remote = TestRemote::new();
    let mut vfs = Vfs::with_remote(Box::new(backend.clone()), Box::new(remote.clone()));
    vfs.init().block_on().unwrap();
    (vfs, backend, remote)
}
