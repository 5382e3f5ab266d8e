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

//! Credential-recording SSH listener built on russh.
//!
//! # Overview
//!
//! - [`JailServer`]: accepts connections under a concurrency cap
//! - [`JailHandler`]: russh adapter for one connection
//! - [`session`]: the per-connection authentication state machine
//! - [`host_key`]: host key loading and generation
//!
//! # Example
//!
//! ```no_run
//! use ssh_jail::config::JailConfig;
//! use ssh_jail::jail::Jail;
//! use ssh_jail::server::{JailServer, SessionPolicy};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = JailConfig::default();
//!     let jail = Jail::open(&config.jail).await?;
//!     let policy = SessionPolicy::from_settings(&config.jail);
//!
//!     JailServer::new(config.server, jail, policy).run().await
//! }
//! ```

pub mod handler;
pub mod host_key;
pub mod session;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;

use crate::config::ServerSettings;
use crate::jail::{Address, Jail};
use crate::shared::error::JailError;

pub use self::handler::JailHandler;
pub use self::host_key::{generate_host_key, load_host_key};
pub use self::session::{
    log_connection_error, Attempt, AttemptLogEntry, AttemptStatus, AuthEvent, AuthMethod,
    AuthSession, Directive, SessionPolicy, SessionState,
};

/// Upper bound on authentication requests russh accepts per connection,
/// counting non-password methods too.
const TRANSPORT_AUTH_ATTEMPTS: usize = 10;

/// Connections idle for longer than this are dropped.
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(300);

/// The SSH listener.
pub struct JailServer {
    settings: ServerSettings,
    jail: Jail,
    policy: SessionPolicy,
    connections: Arc<Semaphore>,
}

impl JailServer {
    pub fn new(settings: ServerSettings, jail: Jail, policy: SessionPolicy) -> Self {
        let connections = Arc::new(Semaphore::new(settings.max_connections.max(1)));
        Self {
            settings,
            jail,
            policy,
            connections,
        }
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    pub fn jail(&self) -> &Jail {
        &self.jail
    }

    /// Number of connections currently holding a slot.
    pub fn active_connections(&self) -> usize {
        self.settings.max_connections.max(1) - self.connections.available_permits()
    }

    /// Listen on the configured address until the process ends.
    pub async fn run(&self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Listen on the configured address until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// Returns an error if the host key cannot be loaded or the address
    /// cannot be bound.
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let addr = (self.settings.bind_address.as_str(), self.settings.port);
        let russh_config = self.build_russh_config()?;

        let listener = TcpListener::bind(addr).await.with_context(|| {
            format!(
                "Failed to bind to {}:{}",
                self.settings.bind_address, self.settings.port
            )
        })?;

        self.serve(listener, Arc::new(russh_config), shutdown).await
    }

    /// Build the russh server configuration.
    pub fn build_russh_config(&self) -> Result<russh::server::Config> {
        let key = load_host_key(&self.settings.host_key)?;

        Ok(russh::server::Config {
            keys: vec![key],
            methods: handler::advertised_methods(false),
            // The session applies its own response delay.
            auth_rejection_time: Duration::ZERO,
            auth_rejection_time_initial: Some(Duration::ZERO),
            max_auth_attempts: TRANSPORT_AUTH_ATTEMPTS,
            inactivity_timeout: Some(INACTIVITY_TIMEOUT),
            ..Default::default()
        })
    }

    /// Accept connections from `listener` until `shutdown` resolves.
    pub async fn serve(
        &self,
        listener: TcpListener,
        russh_config: Arc<russh::server::Config>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        tracing::info!(
            local_addr = ?listener.local_addr(),
            max_connections = self.settings.max_connections,
            "SSH jail listening"
        );

        let banner = Some(self.settings.banner.clone()).filter(|b| !b.is_empty());
        tokio::pin!(shutdown);

        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept connection");
                        continue;
                    }
                },
                _ = &mut shutdown => {
                    tracing::info!("Shutting down listener");
                    return Ok(());
                }
            };

            let Ok(permit) = Arc::clone(&self.connections).try_acquire_owned() else {
                tracing::warn!(ip = %peer.ip(), "Connection limit reached, dropping connection");
                continue;
            };

            let peer_ip = Address::from_socket_addr(peer).to_string();
            let session = AuthSession::new(self.jail.clone(), self.policy.clone(), &peer_ip);
            let handler = JailHandler::new(session, banner.clone()).with_permit(permit);
            let config = Arc::clone(&russh_config);

            tokio::spawn(async move {
                tracing::debug!(ip = %peer_ip, "Accepted connection");
                let result = match russh::server::run_stream(config, stream, handler).await {
                    Ok(running) => running.await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    report_session_error(&peer_ip, &e);
                }
            });
        }
    }
}

/// Log how a connection ended, unless it was closed on purpose.
fn report_session_error(peer: &str, error: &anyhow::Error) {
    if error
        .downcast_ref::<JailError>()
        .is_some_and(JailError::is_termination)
    {
        tracing::debug!(ip = %peer, "Connection terminated");
        return;
    }
    if matches!(
        error.downcast_ref::<russh::Error>(),
        Some(russh::Error::Disconnect)
    ) {
        tracing::debug!(ip = %peer, "Client disconnected");
        return;
    }
    log_connection_error(peer, &error.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jail::{BanFile, BanStore};
    use tempfile::TempDir;

    async fn server(dir: &TempDir, settings: ServerSettings) -> JailServer {
        let bans = BanStore::builder(BanFile::in_dir(dir.path()))
            .open()
            .await
            .unwrap();
        let jail = Jail::new(bans, 6, Duration::from_secs(60));
        JailServer::new(settings, jail, SessionPolicy::default())
    }

    #[tokio::test]
    async fn test_build_russh_config_missing_key() {
        let dir = TempDir::new().unwrap();
        let settings = ServerSettings {
            host_key: dir.path().join("absent.key"),
            ..ServerSettings::default()
        };
        let server = server(&dir, settings).await;

        let err = server.build_russh_config().unwrap_err();
        assert!(err.to_string().contains("Failed to load host key"));
    }

    #[tokio::test]
    async fn test_build_russh_config_with_key() {
        let dir = TempDir::new().unwrap();
        let key_path = dir.path().join("host.key");
        generate_host_key(&key_path, false).unwrap();

        let settings = ServerSettings {
            host_key: key_path,
            ..ServerSettings::default()
        };
        let server = server(&dir, settings).await;

        let config = server.build_russh_config().unwrap();
        assert_eq!(config.keys.len(), 1);
        assert_eq!(config.auth_rejection_time, Duration::ZERO);
        assert_eq!(config.max_auth_attempts, TRANSPORT_AUTH_ATTEMPTS);
        assert_eq!(
            config.methods.to_vec(),
            vec![russh::MethodKind::Password, russh::MethodKind::PublicKey]
        );
    }

    #[tokio::test]
    async fn test_connection_slots() {
        let dir = TempDir::new().unwrap();
        let settings = ServerSettings {
            max_connections: 2,
            ..ServerSettings::default()
        };
        let server = server(&dir, settings).await;
        assert_eq!(server.active_connections(), 0);

        let _a = Arc::clone(&server.connections).try_acquire_owned().unwrap();
        let _b = Arc::clone(&server.connections).try_acquire_owned().unwrap();
        assert_eq!(server.active_connections(), 2);
        assert!(Arc::clone(&server.connections).try_acquire_owned().is_err());
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let key_path = dir.path().join("host.key");
        generate_host_key(&key_path, false).unwrap();
        let settings = ServerSettings {
            host_key: key_path,
            ..ServerSettings::default()
        };
        let server = server(&dir, settings).await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = Arc::new(server.build_russh_config().unwrap());

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            server.serve(listener, config, async {}),
        )
        .await;
        assert!(result.unwrap().is_ok());
    }
}
