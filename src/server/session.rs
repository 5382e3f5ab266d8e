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

//! Per-connection authentication state machine.
//!
//! One [`AuthSession`] exists per TCP connection. The SSH handler turns each
//! authentication callback into an [`AuthEvent`] and maps the returned
//! [`Directive`] back onto the protocol. Nothing is ever accepted.
//!
//! # States
//!
//! - [`SessionState::Open`]: no password attempt seen yet
//! - [`SessionState::ThrottledReject`]: rejected, retry permitted
//! - [`SessionState::TerminalReject`]: per-connection cap reached
//! - [`SessionState::BannedTerminate`]: address banned or unusable
//! - [`SessionState::Closed`]: resources released
//!
//! Every directive is delayed by the policy's response delay, whatever the
//! outcome.
//!
//! # Example
//!
//! ```no_run
//! use ssh_jail::jail::Jail;
//! use ssh_jail::server::session::{Attempt, AuthSession, SessionPolicy};
//!
//! # async fn example(jail: Jail) {
//! let mut session = AuthSession::new(jail, SessionPolicy::default(), "203.0.113.7");
//! let directive = session
//!     .on_attempt(Attempt::password("root", "hunter2"))
//!     .await;
//! session.on_end();
//! session.on_close();
//! # }
//! ```

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::config::JailSettings;
use crate::jail::{Address, Jail};

/// Limits applied to a single connection.
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    /// Password attempts allowed before the final reject.
    ///
    /// Default: 3
    pub max_attempts: u32,

    /// Longer usernames or passwords, in UTF-16 code units, are recorded as
    /// a tag only.
    ///
    /// Default: 32
    pub max_credential_length: usize,

    /// Delay before every directive.
    ///
    /// Default: 1024 ms
    pub response_delay: Duration,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_credential_length: 32,
            response_delay: Duration::from_millis(1024),
        }
    }
}

impl SessionPolicy {
    pub fn from_settings(settings: &JailSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts_per_connection.max(1),
            max_credential_length: settings.max_credential_length,
            response_delay: settings.response_delay(),
        }
    }

    pub fn with_response_delay(mut self, delay: Duration) -> Self {
        self.response_delay = delay;
        self
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max.max(1);
        self
    }
}

/// SSH authentication method of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    None,
    Password,
    PublicKey,
    KeyboardInteractive,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Password => "password",
            Self::PublicKey => "publickey",
            Self::KeyboardInteractive => "keyboard-interactive",
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One authentication try as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub method: AuthMethod,
    pub username: String,
    pub secret: Option<String>,
}

impl Attempt {
    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            method: AuthMethod::Password,
            username: username.into(),
            secret: Some(password.into()),
        }
    }

    /// An attempt without a password (`none`, `publickey`, ...).
    pub fn other(method: AuthMethod, username: impl Into<String>) -> Self {
        Self {
            method,
            username: username.into(),
            secret: None,
        }
    }
}

/// Input to the state machine.
#[derive(Debug, Clone)]
pub enum AuthEvent {
    Attempt(Attempt),
    End,
    Error(String),
    Close,
}

/// Reply to an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// Reject the attempt. With `password_only` the client is told that only
    /// `password` may continue.
    Reject { password_only: bool },
    /// Close the connection.
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    ThrottledReject,
    TerminalReject,
    BannedTerminate,
    Closed,
}

/// Why an attempt was recorded without credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AttemptStatus {
    #[serde(rename = "long id")]
    LongId,
    #[serde(rename = "long pw")]
    LongPassword,
    #[serde(rename = "ban")]
    Banned,
    #[serde(rename = "invalid ip")]
    InvalidIp,
}

/// One entry of the per-connection attempt log.
///
/// Serializes as `{"id": ..., "pw": ...}` or `{"status": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum AttemptLogEntry {
    Credentials { id: String, pw: String },
    Status { status: AttemptStatus },
}

impl AttemptLogEntry {
    pub fn status(status: AttemptStatus) -> Self {
        Self::Status { status }
    }
}

/// Authentication controller for one connection.
#[derive(Debug)]
pub struct AuthSession {
    jail: Jail,
    policy: SessionPolicy,
    peer: String,
    address: Option<Address>,
    state: SessionState,
    attempts: u32,
    log: Vec<AttemptLogEntry>,
    flushed: bool,
}

impl AuthSession {
    /// Start a session for the connection from `peer`.
    ///
    /// An unparseable `peer` is kept as-is for logging; every attempt on such
    /// a session is terminated.
    pub fn new(jail: Jail, policy: SessionPolicy, peer: &str) -> Self {
        Self {
            jail,
            policy,
            peer: peer.to_string(),
            address: Address::parse(peer).ok(),
            state: SessionState::Open,
            attempts: 0,
            log: Vec::new(),
            flushed: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn attempt_log(&self) -> &[AttemptLogEntry] {
        &self.log
    }

    /// Peer address as given, for logging.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Feed one event. Only attempts produce a directive.
    pub async fn handle(&mut self, event: AuthEvent) -> Option<Directive> {
        match event {
            AuthEvent::Attempt(attempt) => Some(self.on_attempt(attempt).await),
            AuthEvent::End => {
                self.on_end();
                None
            }
            AuthEvent::Error(message) => {
                self.on_error(&message);
                None
            }
            AuthEvent::Close => {
                self.on_close();
                None
            }
        }
    }

    /// Decide on `attempt`, then wait out the response delay.
    pub async fn on_attempt(&mut self, attempt: Attempt) -> Directive {
        let directive = self.decide(attempt).await;
        tokio::time::sleep(self.policy.response_delay).await;
        directive
    }

    async fn decide(&mut self, attempt: Attempt) -> Directive {
        if matches!(
            self.state,
            SessionState::TerminalReject | SessionState::BannedTerminate | SessionState::Closed
        ) {
            return Directive::End;
        }

        let Some(address) = self.address else {
            self.log.push(AttemptLogEntry::status(AttemptStatus::InvalidIp));
            self.state = SessionState::BannedTerminate;
            return Directive::End;
        };

        if self.jail.bans().is_banned(&address).await {
            self.log.push(AttemptLogEntry::status(AttemptStatus::Banned));
            self.state = SessionState::BannedTerminate;
            return Directive::End;
        }

        if attempt.method != AuthMethod::Password {
            tracing::trace!(ip = %address, method = %attempt.method, "Steering client to password");
            return Directive::Reject {
                password_only: true,
            };
        }

        self.log.push(self.classify(&attempt));
        self.attempts += 1;

        match self.jail.punish(&address).await {
            Ok(true) => tracing::debug!(ip = %address, "Failure threshold reached"),
            Ok(false) => {}
            Err(e) => tracing::error!(ip = %address, error = %e, "Ban could not be persisted"),
        }

        if self.attempts >= self.policy.max_attempts {
            self.state = SessionState::TerminalReject;
            Directive::Reject {
                password_only: true,
            }
        } else {
            self.state = SessionState::ThrottledReject;
            Directive::Reject {
                password_only: false,
            }
        }
    }

    fn classify(&self, attempt: &Attempt) -> AttemptLogEntry {
        let max = self.policy.max_credential_length;
        let secret = attempt.secret.as_deref().unwrap_or_default();

        if credential_len(&attempt.username) > max {
            AttemptLogEntry::status(AttemptStatus::LongId)
        } else if credential_len(secret) > max {
            AttemptLogEntry::status(AttemptStatus::LongPassword)
        } else {
            AttemptLogEntry::Credentials {
                id: attempt.username.clone(),
                pw: secret.to_string(),
            }
        }
    }

    /// Flush the attempt log as one structured line. Later calls do nothing.
    pub fn on_end(&mut self) {
        if self.flushed {
            return;
        }
        self.flushed = true;

        let attempts = render_attempts(&self.log);
        tracing::info!(ip = %self.peer, attempts = %attempts, "Connection ended");
    }

    pub fn on_error(&mut self, message: &str) {
        log_connection_error(&self.peer, message);
    }

    /// Release the session. Later attempts are terminated.
    pub fn on_close(&mut self) {
        self.log.clear();
        self.state = SessionState::Closed;
    }
}

/// Length in UTF-16 code units; characters outside the Basic Multilingual
/// Plane count twice.
fn credential_len(value: &str) -> usize {
    value.encode_utf16().count()
}

/// JSON array of the attempt log.
pub fn render_attempts(log: &[AttemptLogEntry]) -> String {
    serde_json::to_string(log).unwrap_or_else(|_| "[]".to_string())
}

/// Log a transport error for a connection.
pub fn log_connection_error(peer: &str, message: &str) {
    tracing::warn!(ip = %peer, error = %message, "Connection error");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jail::{BanFile, BanStore, ManualClock};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::time::Instant;

    const START: u64 = 1_767_225_600_000;

    async fn jail(dir: &TempDir, threshold: u32) -> (Jail, ManualClock) {
        let clock = ManualClock::new(START);
        let bans = BanStore::builder(BanFile::in_dir(dir.path()))
            .clock(Arc::new(clock.clone()))
            .open()
            .await
            .unwrap();
        (Jail::new(bans, threshold, Duration::from_secs(1800)), clock)
    }

    fn session(jail: &Jail, peer: &str) -> AuthSession {
        AuthSession::new(jail.clone(), SessionPolicy::default(), peer)
    }

    #[tokio::test(start_paused = true)]
    async fn test_cap_three_per_connection() {
        let dir = TempDir::new().unwrap();
        let (jail, _clock) = jail(&dir, 10).await;
        let mut s = session(&jail, "203.0.113.7");

        let first = s.on_attempt(Attempt::password("root", "a")).await;
        assert_eq!(first, Directive::Reject { password_only: false });
        assert_eq!(s.state(), SessionState::ThrottledReject);

        let second = s.on_attempt(Attempt::password("root", "b")).await;
        assert_eq!(second, Directive::Reject { password_only: false });

        let third = s.on_attempt(Attempt::password("root", "c")).await;
        assert_eq!(third, Directive::Reject { password_only: true });
        assert_eq!(s.state(), SessionState::TerminalReject);

        let fourth = s.on_attempt(Attempt::password("root", "d")).await;
        assert_eq!(fourth, Directive::End);
        assert_eq!(s.attempts(), 3);

        let ip = Address::parse("203.0.113.7").unwrap();
        assert_eq!(jail.ledger().failure_count(&ip).await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_directive_is_delayed() {
        let dir = TempDir::new().unwrap();
        let (jail, _clock) = jail(&dir, 10).await;
        let mut s = session(&jail, "203.0.113.7");

        let started = Instant::now();
        s.on_attempt(Attempt::other(AuthMethod::None, "root")).await;
        assert_eq!(started.elapsed(), Duration::from_millis(1024));

        let started = Instant::now();
        s.on_attempt(Attempt::password("root", "x")).await;
        assert_eq!(started.elapsed(), Duration::from_millis(1024));

        let mut invalid = session(&jail, "not-an-ip");
        let started = Instant::now();
        assert_eq!(
            invalid.on_attempt(Attempt::password("root", "x")).await,
            Directive::End
        );
        assert_eq!(started.elapsed(), Duration::from_millis(1024));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_password_methods_are_not_counted() {
        let dir = TempDir::new().unwrap();
        let (jail, _clock) = jail(&dir, 10).await;
        let mut s = session(&jail, "198.51.100.20");

        for method in [
            AuthMethod::None,
            AuthMethod::PublicKey,
            AuthMethod::KeyboardInteractive,
        ] {
            let directive = s.on_attempt(Attempt::other(method, "root")).await;
            assert_eq!(directive, Directive::Reject { password_only: true });
        }

        assert_eq!(s.attempts(), 0);
        assert_eq!(s.state(), SessionState::Open);
        assert!(s.attempt_log().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_address_never_touches_store() {
        let dir = TempDir::new().unwrap();
        let (jail, _clock) = jail(&dir, 1).await;
        let mut s = session(&jail, "999.1.1.1");

        assert_eq!(
            s.on_attempt(Attempt::password("root", "x")).await,
            Directive::End
        );
        assert_eq!(s.state(), SessionState::BannedTerminate);
        assert_eq!(
            s.attempt_log(),
            &[AttemptLogEntry::status(AttemptStatus::InvalidIp)]
        );
        assert_eq!(jail.bans().count_banned().await, 0);
        assert_eq!(jail.ledger().tracked_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_banned_address_is_terminated() {
        let dir = TempDir::new().unwrap();
        let (jail, _clock) = jail(&dir, 10).await;
        let ip = Address::parse("203.0.113.7").unwrap();
        jail.bans().ban(ip, Duration::from_secs(60)).await.unwrap();

        let mut s = session(&jail, "203.0.113.7");
        assert_eq!(
            s.on_attempt(Attempt::other(AuthMethod::None, "root")).await,
            Directive::End
        );
        assert_eq!(s.state(), SessionState::BannedTerminate);
        assert_eq!(s.attempt_log(), &[AttemptLogEntry::status(AttemptStatus::Banned)]);
        assert_eq!(jail.ledger().failure_count(&ip).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ten_failures_ban_for_thirty_minutes() {
        let dir = TempDir::new().unwrap();
        let (jail, clock) = jail(&dir, 10).await;
        let ip = Address::parse("203.0.113.7").unwrap();

        // 3 + 3 + 3 + 1 attempts across four connections
        for per_connection in [3, 3, 3, 1] {
            let mut s = session(&jail, "203.0.113.7");
            for i in 0..per_connection {
                s.on_attempt(Attempt::password("admin", format!("pw{i}"))).await;
            }
            s.on_end();
            s.on_close();
        }
        assert!(jail.bans().is_banned(&ip).await);

        let mut s = session(&jail, "203.0.113.7");
        assert_eq!(
            s.on_attempt(Attempt::password("admin", "again")).await,
            Directive::End
        );

        clock.advance(Duration::from_secs(30 * 60 - 1));
        assert!(jail.bans().is_banned(&ip).await);

        clock.advance(Duration::from_secs(2));
        assert!(!jail.bans().is_banned(&ip).await);

        let mut s = session(&jail, "203.0.113.7");
        assert_eq!(
            s.on_attempt(Attempt::password("admin", "fresh")).await,
            Directive::Reject { password_only: false }
        );
        assert_eq!(jail.ledger().failure_count(&ip).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_log_classification() {
        let dir = TempDir::new().unwrap();
        let (jail, _clock) = jail(&dir, 10).await;
        let mut s = AuthSession::new(
            jail.clone(),
            SessionPolicy::default().with_max_attempts(5),
            "2001:db8::1",
        );

        let long = "x".repeat(33);
        let exact = "y".repeat(32);
        s.on_attempt(Attempt::password("root", "toor")).await;
        s.on_attempt(Attempt::password(long.clone(), "pw")).await;
        s.on_attempt(Attempt::password("root", long.clone())).await;
        s.on_attempt(Attempt::password(exact.clone(), exact.clone())).await;

        let rendered = render_attempts(s.attempt_log());
        let expected = serde_json::json!([
            { "id": "root", "pw": "toor" },
            { "status": "long id" },
            { "status": "long pw" },
            { "id": exact, "pw": exact },
        ]);
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&rendered).unwrap(),
            expected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_length_counts_utf16_units() {
        let dir = TempDir::new().unwrap();
        let (jail, _clock) = jail(&dir, 10).await;
        let mut s = AuthSession::new(
            jail.clone(),
            SessionPolicy::default().with_max_attempts(5),
            "203.0.113.7",
        );

        // 16 astral characters are 32 units, 17 are 34
        let fits = "\u{1F511}".repeat(16);
        let too_long = "\u{1F511}".repeat(17);
        // BMP characters count once even when multi-byte in UTF-8
        let accented = "\u{e9}".repeat(32);

        s.on_attempt(Attempt::password("root", fits.clone())).await;
        s.on_attempt(Attempt::password("root", too_long)).await;
        s.on_attempt(Attempt::password(accented.clone(), "pw")).await;

        assert_eq!(
            s.attempt_log(),
            &[
                AttemptLogEntry::Credentials {
                    id: "root".to_string(),
                    pw: fits,
                },
                AttemptLogEntry::status(AttemptStatus::LongPassword),
                AttemptLogEntry::Credentials {
                    id: accented,
                    pw: "pw".to_string(),
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_releases_session() {
        let dir = TempDir::new().unwrap();
        let (jail, _clock) = jail(&dir, 10).await;
        let mut s = session(&jail, "203.0.113.7");

        s.handle(AuthEvent::Attempt(Attempt::password("root", "x")))
            .await;
        assert!(s.handle(AuthEvent::Error("reset by peer".into())).await.is_none());
        assert!(s.handle(AuthEvent::End).await.is_none());
        assert!(s.handle(AuthEvent::Close).await.is_none());

        assert_eq!(s.state(), SessionState::Closed);
        assert!(s.attempt_log().is_empty());
        assert_eq!(
            s.handle(AuthEvent::Attempt(Attempt::password("root", "y")))
                .await,
            Some(Directive::End)
        );
    }

    #[test]
    fn test_policy_from_settings() {
        let settings = JailSettings {
            max_attempts_per_connection: 5,
            response_delay_ms: 250,
            max_credential_length: 16,
            ..JailSettings::default()
        };
        let policy = SessionPolicy::from_settings(&settings);
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.response_delay, Duration::from_millis(250));
        assert_eq!(policy.max_credential_length, 16);
    }
}
