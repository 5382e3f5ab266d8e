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

//! SSH handler implementation for the russh server.
//!
//! Authentication callbacks become [`Attempt`]s for the connection's
//! [`AuthSession`]. A reject directive maps to `Auth::Reject` with an explicit
//! method list; an end directive is returned as an error, which makes russh
//! drop the connection.
//!
//! russh removes the rejected method from the advertised list when a reject
//! carries no methods, so every reject names what the client may try next.

use russh::keys::ssh_key;
use russh::server::Auth;
use russh::{MethodKind, MethodSet};
use tokio::sync::OwnedSemaphorePermit;

use super::session::{Attempt, AuthMethod, AuthSession, Directive};
use crate::shared::error::JailError;

/// SSH handler for a single client connection.
pub struct JailHandler {
    session: AuthSession,

    /// Pre-authentication banner; `None` disables it.
    banner: Option<String>,

    /// Connection slot, released when the handler is dropped.
    _permit: Option<OwnedSemaphorePermit>,
}

impl JailHandler {
    pub fn new(session: AuthSession, banner: Option<String>) -> Self {
        Self {
            session,
            banner,
            _permit: None,
        }
    }

    /// Hold `permit` for the lifetime of the connection.
    pub fn with_permit(mut self, permit: OwnedSemaphorePermit) -> Self {
        self._permit = Some(permit);
        self
    }

    pub fn session(&self) -> &AuthSession {
        &self.session
    }

    async fn attempt(&mut self, attempt: Attempt) -> anyhow::Result<Auth> {
        match self.session.on_attempt(attempt).await {
            Directive::Reject { password_only } => Ok(Auth::Reject {
                proceed_with_methods: Some(advertised_methods(password_only)),
                partial_success: false,
            }),
            Directive::End => Err(JailError::ConnectionTerminated {
                address: self.session.peer().to_string(),
            }
            .into()),
        }
    }
}

/// Methods offered after a reject.
///
/// A retry keeps the listener's full list; the final reject and the steer
/// away from other methods leave only `password`.
pub(crate) fn advertised_methods(password_only: bool) -> MethodSet {
    let mut methods = MethodSet::empty();
    methods.push(MethodKind::Password);
    if !password_only {
        methods.push(MethodKind::PublicKey);
    }
    methods
}

impl russh::server::Handler for JailHandler {
    type Error = anyhow::Error;

    fn authentication_banner(
        &mut self,
    ) -> impl std::future::Future<Output = Result<Option<String>, Self::Error>> + Send {
        let banner = self.banner.clone();
        async move { Ok(banner) }
    }

    fn auth_none(
        &mut self,
        user: &str,
    ) -> impl std::future::Future<Output = Result<Auth, Self::Error>> + Send {
        tracing::trace!(ip = %self.session.peer(), user = %user, "Auth none attempt");
        self.attempt(Attempt::other(AuthMethod::None, user))
    }

    fn auth_publickey_offered(
        &mut self,
        user: &str,
        public_key: &ssh_key::PublicKey,
    ) -> impl std::future::Future<Output = Result<Auth, Self::Error>> + Send {
        tracing::trace!(
            ip = %self.session.peer(),
            user = %user,
            key_type = %public_key.algorithm(),
            "Public key offered"
        );
        self.attempt(Attempt::other(AuthMethod::PublicKey, user))
    }

    fn auth_password(
        &mut self,
        user: &str,
        password: &str,
    ) -> impl std::future::Future<Output = Result<Auth, Self::Error>> + Send {
        self.attempt(Attempt::password(user, password))
    }

    fn auth_keyboard_interactive<'a>(
        &'a mut self,
        user: &str,
        _submethods: &str,
        _response: Option<russh::server::Response<'a>>,
    ) -> impl std::future::Future<Output = Result<Auth, Self::Error>> + Send {
        tracing::trace!(ip = %self.session.peer(), user = %user, "Keyboard-interactive attempt");
        self.attempt(Attempt::other(AuthMethod::KeyboardInteractive, user))
    }
}

impl Drop for JailHandler {
    fn drop(&mut self) {
        self.session.on_end();
        self.session.on_close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jail::{Address, BanFile, BanStore, Jail};
    use crate::server::session::{SessionPolicy, SessionState};
    use russh::server::Handler;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::Semaphore;

    async fn handler(dir: &TempDir, peer: &str) -> (JailHandler, Jail) {
        let bans = BanStore::builder(BanFile::in_dir(dir.path()))
            .open()
            .await
            .unwrap();
        let jail = Jail::new(bans, 10, Duration::from_secs(60));
        let session = AuthSession::new(jail.clone(), SessionPolicy::default(), peer);
        (JailHandler::new(session, Some("recorded".to_string())), jail)
    }

    fn offered(auth: Auth) -> Vec<MethodKind> {
        match auth {
            Auth::Reject {
                proceed_with_methods: Some(methods),
                partial_success: false,
            } => methods.to_vec(),
            _ => panic!("expected a reject naming the next methods"),
        }
    }

    fn is_termination(err: &anyhow::Error) -> bool {
        err.downcast_ref::<JailError>()
            .is_some_and(JailError::is_termination)
    }

    #[tokio::test(start_paused = true)]
    async fn test_password_flow_maps_directives() {
        let dir = TempDir::new().unwrap();
        let (mut h, _jail) = handler(&dir, "203.0.113.7").await;

        for pw in ["a", "b"] {
            let auth = h.auth_password("root", pw).await.unwrap();
            assert_eq!(offered(auth), vec![MethodKind::Password, MethodKind::PublicKey]);
        }

        let third = h.auth_password("root", "c").await.unwrap();
        assert_eq!(offered(third), vec![MethodKind::Password]);

        let err = h.auth_password("root", "d").await.err().unwrap();
        assert!(is_termination(&err));
        assert_eq!(h.session().state(), SessionState::TerminalReject);
    }

    #[tokio::test(start_paused = true)]
    async fn test_none_advertises_password_only() {
        let dir = TempDir::new().unwrap();
        let (mut h, _jail) = handler(&dir, "203.0.113.7").await;

        let auth = h.auth_none("root").await.unwrap();
        assert_eq!(offered(auth), vec![MethodKind::Password]);
        assert_eq!(h.session().attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keyboard_interactive_is_delayed_and_steered() {
        let dir = TempDir::new().unwrap();
        let (mut h, _jail) = handler(&dir, "203.0.113.7").await;

        let started = tokio::time::Instant::now();
        let auth = h.auth_keyboard_interactive("root", "", None).await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_millis(1024));
        assert_eq!(offered(auth), vec![MethodKind::Password]);
        assert_eq!(h.session().attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keyboard_interactive_from_banned_peer_is_dropped() {
        let dir = TempDir::new().unwrap();
        let (mut h, jail) = handler(&dir, "203.0.113.7").await;
        let ip = Address::parse("203.0.113.7").unwrap();
        jail.bans().ban(ip, Duration::from_secs(60)).await.unwrap();

        let started = tokio::time::Instant::now();
        let err = h
            .auth_keyboard_interactive("root", "", None)
            .await
            .err()
            .unwrap();
        assert!(is_termination(&err));
        assert_eq!(started.elapsed(), Duration::from_millis(1024));
        assert_eq!(h.session().state(), SessionState::BannedTerminate);
    }

    #[tokio::test(start_paused = true)]
    async fn test_banned_peer_is_dropped() {
        let dir = TempDir::new().unwrap();
        let (mut h, jail) = handler(&dir, "203.0.113.7").await;
        let ip = Address::parse("203.0.113.7").unwrap();
        jail.bans().ban(ip, Duration::from_secs(60)).await.unwrap();

        let err = h.auth_none("root").await.err().unwrap();
        assert!(is_termination(&err));
    }

    #[tokio::test]
    async fn test_banner() {
        let dir = TempDir::new().unwrap();
        let (mut h, _jail) = handler(&dir, "203.0.113.7").await;
        assert_eq!(
            h.authentication_banner().await.unwrap().as_deref(),
            Some("recorded")
        );
    }

    #[tokio::test]
    async fn test_drop_releases_permit() {
        let dir = TempDir::new().unwrap();
        let (h, _jail) = handler(&dir, "203.0.113.7").await;
        let slots = Arc::new(Semaphore::new(1));

        let h = h.with_permit(Arc::clone(&slots).try_acquire_owned().unwrap());
        assert_eq!(slots.available_permits(), 0);

        drop(h);
        assert_eq!(slots.available_permits(), 1);
    }
}
