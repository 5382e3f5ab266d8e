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

//! Host key loading and generation.

use anyhow::{Context, Result};
use russh::keys::ssh_key::LineEnding;
use russh::keys::{Algorithm, HashAlg, PrivateKey};
use std::io::Write;
use std::path::Path;

/// Load an OpenSSH-format host private key.
///
/// # Errors
///
/// Returns an error if the key file cannot be read or parsed.
pub fn load_host_key(path: impl AsRef<Path>) -> Result<PrivateKey> {
    let path = path.as_ref();
    tracing::debug!(path = %path.display(), "Loading host key");

    PrivateKey::read_openssh_file(path)
        .with_context(|| format!("Failed to load host key from {}", path.display()))
}

/// Generate an Ed25519 host key at `path` and return its SHA256 fingerprint.
///
/// The file is written with mode 0600 on Unix. An existing file is only
/// replaced when `overwrite` is set.
pub fn generate_host_key(path: &Path, overwrite: bool) -> Result<String> {
    if path.exists() && !overwrite {
        anyhow::bail!(
            "Host key {} already exists (use --force to replace it)",
            path.display()
        );
    }

    let key = PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519)
        .context("Failed to generate Ed25519 key")?;
    let fingerprint = key.public_key().fingerprint(HashAlg::Sha256).to_string();
    let pem = key
        .to_openssh(LineEnding::LF)
        .context("Failed to encode host key to OpenSSH format")?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    write_private_key(path, &pem)?;

    tracing::info!(
        path = %path.display(),
        fingerprint = %fingerprint,
        "Generated Ed25519 host key"
    );
    Ok(fingerprint)
}

fn write_private_key(path: &Path, content: &str) -> Result<()> {
    #[cfg(unix)]
    {
        use std::fs::OpenOptions;
        use std::os::unix::fs::OpenOptionsExt;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .with_context(|| format!("Failed to create host key file: {}", path.display()))?;

        file.write_all(content.as_bytes())
            .with_context(|| format!("Failed to write host key: {}", path.display()))?;
    }

    #[cfg(not(unix))]
    {
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write host key: {}", path.display()))?;
    }

    Ok(())
}
