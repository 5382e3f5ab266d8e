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

//! Configuration loader for ssh-jail.
//!
//! Sources, highest precedence first:
//! 1. CLI arguments (applied by the binary)
//! 2. Environment variables (`SSH_JAIL_*`)
//! 3. Configuration file (YAML)
//! 4. Default values

use super::types::JailConfig;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Load configuration from file and environment.
///
/// If `config_path` is `None`, the first existing file among these is used:
/// 1. `./ssh-jail.yaml`
/// 2. `/etc/ssh-jail/config.yaml`
/// 3. `$XDG_CONFIG_HOME/ssh-jail/config.yaml` or `~/.config/ssh-jail/config.yaml`
///
/// # Environment Variables
///
/// - `SSH_JAIL_PORT` - Listen port
/// - `SSH_JAIL_BIND_ADDRESS` - Bind address
/// - `SSH_JAIL_HOST_KEY` - Host key path
/// - `SSH_JAIL_MAX_CONNECTIONS` - Concurrent connection cap
/// - `SSH_JAIL_BAN_THRESHOLD` - Failures before a ban
/// - `SSH_JAIL_BAN_DURATION` - Ban duration in seconds
/// - `SSH_JAIL_NOTIFY_THRESHOLD` - Live bans before alerts start
/// - `SSH_JAIL_WEBHOOK_URL` - Alert webhook
/// - `SSH_JAIL_FILE` - Ban file path
///
/// # Example
///
/// ```no_run
/// use ssh_jail::config::load_config;
///
/// # fn main() -> anyhow::Result<()> {
/// let config = load_config(None)?;
/// let config = load_config(Some("/etc/ssh-jail/custom.yaml".as_ref()))?;
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, an environment
/// variable has an invalid value, or validation fails.
pub fn load_config(config_path: Option<&Path>) -> Result<JailConfig> {
    let mut config = JailConfig::default();

    if let Some(path) = config_path {
        config = load_config_file(path).context("Failed to load configuration file")?;
        tracing::info!(path = %path.display(), "Loaded configuration from file");
    } else {
        for path in default_config_paths() {
            if path.exists() {
                config = load_config_file(&path).context("Failed to load configuration file")?;
                tracing::info!(path = %path.display(), "Loaded configuration from file");
                break;
            }
        }
    }

    config = apply_env_overrides(config)?;
    validate_config(&config)?;

    Ok(config)
}

/// Generate a configuration template as YAML string.
pub fn generate_config_template() -> String {
    let config = JailConfig::default();
    let mut yaml = String::new();

    yaml.push_str("# ssh-jail configuration file\n");
    yaml.push_str("#\n");
    yaml.push_str("# Configuration hierarchy (highest to lowest precedence):\n");
    yaml.push_str("# 1. CLI arguments\n");
    yaml.push_str("# 2. Environment variables (SSH_JAIL_* prefix)\n");
    yaml.push_str("# 3. This configuration file\n");
    yaml.push_str("# 4. Default values\n");
    yaml.push_str("#\n");
    yaml.push_str("# Optional keys:\n");
    yaml.push_str("#   jail.ban_threshold: failures before a ban (default: 2 x max_attempts_per_connection)\n");
    yaml.push_str("#   jail.webhook_url: chat webhook receiving ban alerts\n\n");

    yaml.push_str(&serde_yaml::to_string(&config).unwrap_or_default());

    yaml
}

fn load_config_file(path: &Path) -> Result<JailConfig> {
    let content =
        std::fs::read_to_string(path).context(format!("Failed to read {}", path.display()))?;

    serde_yaml::from_str(&content).context(format!("Failed to parse {}", path.display()))
}

fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = vec![
        PathBuf::from("./ssh-jail.yaml"),
        PathBuf::from("/etc/ssh-jail/config.yaml"),
    ];

    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("ssh-jail/config.yaml"));
    }

    paths
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(value) => {
            let parsed = value
                .trim()
                .parse()
                .with_context(|| format!("Invalid {name} value: {value}"))?;
            tracing::debug!(var = name, value = %value, "Applied environment override");
            Ok(Some(parsed))
        }
        Err(_) => Ok(None),
    }
}

/// Apply `SSH_JAIL_*` environment variable overrides.
fn apply_env_overrides(mut config: JailConfig) -> Result<JailConfig> {
    if let Some(port) = env_parse("SSH_JAIL_PORT")? {
        config.server.port = port;
    }
    if let Some(addr) = env_parse::<String>("SSH_JAIL_BIND_ADDRESS")? {
        config.server.bind_address = addr;
    }
    if let Some(key) = env_parse::<PathBuf>("SSH_JAIL_HOST_KEY")? {
        config.server.host_key = key;
    }
    if let Some(max) = env_parse("SSH_JAIL_MAX_CONNECTIONS")? {
        config.server.max_connections = max;
    }
    if let Some(threshold) = env_parse("SSH_JAIL_BAN_THRESHOLD")? {
        config.jail.ban_threshold = Some(threshold);
    }
    if let Some(secs) = env_parse("SSH_JAIL_BAN_DURATION")? {
        config.jail.ban_duration_secs = secs;
    }
    if let Some(threshold) = env_parse("SSH_JAIL_NOTIFY_THRESHOLD")? {
        config.jail.notify_threshold = threshold;
    }
    if let Ok(url) = std::env::var("SSH_JAIL_WEBHOOK_URL") {
        config.jail.webhook_url = Some(url).filter(|u| !u.trim().is_empty());
    }
    if let Some(file) = env_parse::<PathBuf>("SSH_JAIL_FILE")? {
        config.jail.ban_file = file;
    }

    Ok(config)
}

/// Validate configuration for correctness.
///
/// The host key is not required to exist here; `gen-host-key` and the
/// listener report a missing key themselves.
pub fn validate_config(config: &JailConfig) -> Result<()> {
    if config.server.port == 0 {
        anyhow::bail!("Server port cannot be 0");
    }

    if config.server.max_connections == 0 {
        anyhow::bail!("max_connections must be greater than 0");
    }

    if config.jail.max_attempts_per_connection == 0 {
        anyhow::bail!("max_attempts_per_connection must be greater than 0");
    }

    if config.jail.effective_ban_threshold() == 0 {
        anyhow::bail!("ban_threshold must be greater than 0");
    }

    if config.jail.notify_threshold == 0 {
        anyhow::bail!("notify_threshold must be greater than 0");
    }

    if config.jail.ban_duration_secs == 0 {
        anyhow::bail!("ban_duration_secs must be greater than 0");
    }

    if config.jail.ban_file.as_os_str().is_empty() {
        anyhow::bail!("ban_file must not be empty");
    }

    tracing::debug!("Configuration validation passed");
    Ok(())
}
