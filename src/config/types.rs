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

//! Configuration types for ssh-jail.
//!
//! All types support serde serialization/deserialization, and every field has
//! a default so a partial YAML file is valid.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration loaded from YAML files.
///
/// # Example YAML
///
/// ```yaml
/// server:
///   bind_address: "0.0.0.0"
///   port: 2222
///   host_key: /var/lib/ssh-jail/host.key
///
/// jail:
///   ban_file: /var/lib/ssh-jail/jail.json
///   ban_duration_secs: 1800
///   notify_threshold: 3
///   webhook_url: "https://discord.com/api/webhooks/..."
/// ```
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct JailConfig {
    /// Listener settings.
    pub server: ServerSettings,

    /// Failure tracking, ban and alert settings.
    pub jail: JailSettings,
}

/// Listener network and connection settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Address to bind to.
    ///
    /// Default: "0.0.0.0"
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Port to listen on.
    ///
    /// Default: 2222
    #[serde(default = "default_port")]
    pub port: u16,

    /// Path to the SSH host private key (OpenSSH format).
    ///
    /// Default: "host.key"
    #[serde(default = "default_host_key")]
    pub host_key: PathBuf,

    /// Maximum number of concurrent connections.
    ///
    /// Default: 5
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Banner shown to clients before authentication. Empty disables it.
    #[serde(default = "default_banner")]
    pub banner: String,
}

/// Failure tracking, ban and alert settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct JailSettings {
    /// Path of the persisted ban map.
    ///
    /// Default: "jail.json"
    #[serde(default = "default_ban_file")]
    pub ban_file: PathBuf,

    /// Failures from one address that trigger a ban.
    ///
    /// Default: twice `max_attempts_per_connection`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ban_threshold: Option<u32>,

    /// Ban duration in seconds.
    ///
    /// Default: 1800 (30 minutes)
    #[serde(default = "default_ban_duration")]
    pub ban_duration_secs: u64,

    /// Number of live bans at which every new ban sends an alert.
    ///
    /// Default: 3
    #[serde(default = "default_notify_threshold")]
    pub notify_threshold: usize,

    /// Chat webhook receiving ban alerts. Alerts are disabled when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,

    /// Password attempts allowed on a single connection.
    ///
    /// Default: 3
    #[serde(default = "default_max_attempts")]
    pub max_attempts_per_connection: u32,

    /// Delay applied before every reply, in milliseconds.
    ///
    /// Default: 1024
    #[serde(default = "default_response_delay")]
    pub response_delay_ms: u64,

    /// Usernames or passwords longer than this are recorded as a tag only.
    ///
    /// Default: 32
    #[serde(default = "default_max_credential_length")]
    pub max_credential_length: usize,
}

impl JailSettings {
    /// The configured ban threshold, or twice the per-connection cap.
    pub fn effective_ban_threshold(&self) -> u32 {
        self.ban_threshold
            .unwrap_or_else(|| self.max_attempts_per_connection.saturating_mul(2))
    }

    pub fn ban_duration(&self) -> Duration {
        Duration::from_secs(self.ban_duration_secs)
    }

    pub fn response_delay(&self) -> Duration {
        Duration::from_millis(self.response_delay_ms)
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            host_key: default_host_key(),
            max_connections: default_max_connections(),
            banner: default_banner(),
        }
    }
}

impl Default for JailSettings {
    fn default() -> Self {
        Self {
            ban_file: default_ban_file(),
            ban_threshold: None,
            ban_duration_secs: default_ban_duration(),
            notify_threshold: default_notify_threshold(),
            webhook_url: None,
            max_attempts_per_connection: default_max_attempts(),
            response_delay_ms: default_response_delay(),
            max_credential_length: default_max_credential_length(),
        }
    }
}

// Default value functions

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    2222
}

fn default_host_key() -> PathBuf {
    PathBuf::from("host.key")
}

fn default_max_connections() -> usize {
    5
}

fn default_banner() -> String {
    "All your inputs are recorded. If you do not agree, please close the connection.".to_string()
}

fn default_ban_file() -> PathBuf {
    PathBuf::from("jail.json")
}

fn default_ban_duration() -> u64 {
    1800
}

fn default_notify_threshold() -> usize {
    3
}

fn default_max_attempts() -> u32 {
    3
}

fn default_response_delay() -> u64 {
    1024
}

fn default_max_credential_length() -> usize {
    32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = JailConfig::default();
        assert_eq!(config.server.bind_address, "0.0.0.0");
        assert_eq!(config.server.port, 2222);
        assert_eq!(config.server.max_connections, 5);
        assert!(config.server.banner.starts_with("All your inputs are recorded."));
        assert_eq!(config.jail.ban_file, PathBuf::from("jail.json"));
        assert_eq!(config.jail.ban_duration(), Duration::from_secs(30 * 60));
        assert_eq!(config.jail.response_delay(), Duration::from_millis(1024));
        assert_eq!(config.jail.notify_threshold, 3);
        assert!(config.jail.webhook_url.is_none());
    }

    #[test]
    fn test_ban_threshold_follows_attempt_cap() {
        let mut settings = JailSettings::default();
        assert_eq!(settings.effective_ban_threshold(), 6);

        settings.max_attempts_per_connection = 5;
        assert_eq!(settings.effective_ban_threshold(), 10);

        settings.ban_threshold = Some(4);
        assert_eq!(settings.effective_ban_threshold(), 4);
    }

    #[test]
    fn test_yaml_parsing_partial() {
        let yaml = r#"
jail:
  ban_duration_secs: 60
  webhook_url: "https://hooks.example.com/abc"
"#;
        let config: JailConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.port, 2222);
        assert_eq!(config.jail.ban_duration_secs, 60);
        assert_eq!(config.jail.max_attempts_per_connection, 3);
        assert_eq!(
            config.jail.webhook_url.as_deref(),
            Some("https://hooks.example.com/abc")
        );
    }

    #[test]
    fn test_yaml_parsing_comprehensive() {
        let yaml = r#"
server:
  bind_address: "127.0.0.1"
  port: 2022
  host_key: /etc/ssh-jail/host.key
  max_connections: 20
  banner: ""

jail:
  ban_file: /var/lib/ssh-jail/jail.json
  ban_threshold: 4
  ban_duration_secs: 3600
  notify_threshold: 10
  max_attempts_per_connection: 2
  response_delay_ms: 500
  max_credential_length: 64
"#;
        let config: JailConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.bind_address, "127.0.0.1");
        assert_eq!(config.server.port, 2022);
        assert_eq!(config.server.host_key, PathBuf::from("/etc/ssh-jail/host.key"));
        assert_eq!(config.server.max_connections, 20);
        assert!(config.server.banner.is_empty());
        assert_eq!(config.jail.effective_ban_threshold(), 4);
        assert_eq!(config.jail.notify_threshold, 10);
        assert_eq!(config.jail.response_delay(), Duration::from_millis(500));
        assert_eq!(config.jail.max_credential_length, 64);
    }
}
