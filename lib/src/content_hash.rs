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

//! Content fingerprinting.
//!
//! Blob contents are fingerprinted with SHA-1 so that the two hosting
//! providers and the local index agree on what "same bytes" means. The
//! hash is used only as an equality fingerprint for change detection;
//! nothing relies on collision resistance.

use std::fmt;
use std::fmt::Debug;

use digest::Digest as _;
use sha1::Sha1;

/// SHA-1 fingerprint of a blob's bytes, compared for equality and
/// rendered as lowercase hex.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Hash)]
pub struct ContentSha([u8; 20]);

impl ContentSha {
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Parses the given hex string into a `ContentSha`. Returns `None`
    /// unless the input is exactly 40 hex digits.
    pub fn try_from_hex(hex: impl AsRef<[u8]>) -> Option<Self> {
        let mut bytes = [0; 20];
        hex::decode_to_slice(hex, &mut bytes).ok()?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Lowercase hex representation.
    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl Debug for ContentSha {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        f.debug_tuple("ContentSha").field(&self.hex()).finish()
    }
}

impl fmt::Display for ContentSha {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        f.pad(&self.hex())
    }
}

impl serde::Serialize for ContentSha {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.hex().serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for ContentSha {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let hex = String::deserialize(deserializer)?;
        Self::try_from_hex(&hex)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid SHA-1 hex: {hex}")))
    }
}

/// Fingerprints the UTF-8 encoding of `content`.
pub fn hash_content(content: &str) -> ContentSha {
    ContentSha(Sha1::digest(content.as_bytes()).into())
}
