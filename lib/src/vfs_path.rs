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

//! Logical file paths.
//!
//! Every blob in every segment, every index entry, and every commit
//! action is keyed by a [`VfsPathBuf`]: a non-empty `/`-separated path
//! relative to the storage root. The type is validated on construction
//! so the rest of the crate never has to reason about empty, absolute,
//! or `..`-escaping paths.

use std::fmt;
use std::fmt::Debug;

use thiserror::Error;

/// Error occurred when a string fails to parse as a [`VfsPathBuf`].
#[derive(Debug, Error)]
#[error("Invalid file path: {value:?}")]
pub struct InvalidVfsPathError {
    /// The string rejected by validation.
    pub value: String,
}

/// An owned, validated logical file path.
///
/// Guarantees: non-empty, `/`-separated, and every component is
/// non-empty and neither `.` nor `..`. Paths sort by their string form,
/// which the change-set ordering and the storage listings rely on.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Hash)]
pub struct VfsPathBuf(String);

impl VfsPathBuf {
    /// Validates `value` as a logical path.
    pub fn new(value: impl Into<String>) -> Result<Self, InvalidVfsPathError> {
        let value = value.into();
        let valid = !value.is_empty()
            && value
                .split('/')
                .all(|component| !matches!(component, "" | "." | ".."));
        if valid {
            Ok(Self(value))
        } else {
            Err(InvalidVfsPathError { value })
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterates the `/`-separated components.
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// The last path component.
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap()
    }

    /// Whether `prefix` matches this path on whole components: `"a/b"`
    /// is a prefix of `"a/b/c"` but not of `"a/bc"`. A path is a prefix
    /// of itself.
    pub fn starts_with(&self, prefix: &Self) -> bool {
        match self.0.strip_prefix(&prefix.0) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    /// Number of components separating this path from `prefix`, if
    /// `prefix` matches on whole components.
    pub fn depth_below(&self, prefix: &Self) -> Option<usize> {
        self.starts_with(prefix)
            .then(|| self.components().count() - prefix.components().count())
    }
}

impl Debug for VfsPathBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "{:?}", &self.0)
    }
}

impl fmt::Display for VfsPathBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        f.pad(&self.0)
    }
}

impl AsRef<str> for VfsPathBuf {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for VfsPathBuf {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for VfsPathBuf {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Self::new(value).map_err(serde::de::Error::custom)
    }
}
