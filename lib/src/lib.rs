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

//! Client-side virtual filesystem with Git-like semantics.
//!
//! Applications read and write files locally through a [`vfs::Vfs`];
//! the VFS tracks divergence from a known remote base, detects
//! three-way conflicts on pull, and pushes accumulated edits as a
//! single commit against a hosting provider (GitHub or GitLab). The
//! [`storage::StorageBackend`] and [`remote::RemoteAdapter`] traits
//! are the two seams through which the core talks to storage and to
//! the remote.

pub mod content_hash;
pub mod github;
pub mod gitlab;
pub mod index;
pub mod local_backend;
pub mod remote;
pub mod retry;
pub mod storage;
pub mod vfs;
pub mod vfs_path;
