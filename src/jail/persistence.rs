// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! On-disk mirror of the ban map.
//!
//! The file is a single JSON object mapping address to expiry instant in
//! epoch milliseconds:
//!
//! ```json
//! {
//!   "198.51.100.20": 1767225600000,
//!   "203.0.113.7": 1767227400000
//! }
//! ```
//!
//! Every change rewrites the whole map into a sibling temporary file which is
//! then renamed over the existing one, so a crash mid-write leaves the previous
//! map intact.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::address::Address;
use crate::shared::error::{JailError, Result};

/// Banned address to expiry instant (epoch milliseconds).
pub type BanMap = BTreeMap<Address, u64>;

/// Location of the persisted ban map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanFile {
    path: PathBuf,
}

impl BanFile {
    /// File name used when only a directory is given.
    pub const DEFAULT_FILE_NAME: &'static str = "jail.json";

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `jail.json` inside `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(Self::DEFAULT_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted map, writing an empty one if the file is absent.
    ///
    /// # Errors
    ///
    /// A file that exists but cannot be read or does not parse is an error;
    /// there is no attempt to recover a corrupt map.
    pub fn load_or_create(&self) -> Result<BanMap> {
        match fs::read_to_string(&self.path) {
            Ok(content) => {
                serde_json::from_str(&content).map_err(|source| JailError::BanFileParse {
                    path: self.path.clone(),
                    source,
                })
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let empty = BanMap::new();
                self.save(&empty)?;
                tracing::info!(path = %self.path.display(), "Created empty ban file");
                Ok(empty)
            }
            Err(source) => Err(JailError::BanFileRead {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Replace the persisted map with `bans`.
    pub fn save(&self, bans: &BanMap) -> Result<()> {
        let json = serde_json::to_string_pretty(bans).map_err(JailError::BanFileEncode)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|source| self.write_error(source))?;
            }
        }

        let temp_path = self.temp_path();
        fs::write(&temp_path, json).map_err(|source| self.write_error(source))?;
        fs::rename(&temp_path, &self.path).map_err(|source| self.write_error(source))?;

        tracing::trace!(path = %self.path.display(), entries = bans.len(), "Ban file written");
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| Self::DEFAULT_FILE_NAME.into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn write_error(&self, source: io::Error) -> JailError {
        JailError::BanFileWrite {
            path: self.path.clone(),
            source,
        }
    }
}
