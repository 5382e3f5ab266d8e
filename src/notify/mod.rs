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

//! Outbound ban alerts.
//!
//! The ban store never talks HTTP itself. It hands a message to a
//! [`NotificationGateway`], which runs the configured [`Notifier`] on a
//! background task so delivery never holds up attempt processing.
//!
//! - [`Notifier`]: one-method delivery interface
//! - [`NullNotifier`]: used when no endpoint is configured
//! - [`webhook::WebhookNotifier`]: JSON `{"content": ...}` POST, success on 204

pub mod webhook;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::jail::Address;
use crate::shared::error::Result;

pub use webhook::WebhookNotifier;

/// Delivery of a single alert message to some external endpoint.
///
/// Implementations must be thread-safe. Errors are reported to the caller,
/// which logs and drops them; there is no retry.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str) -> Result<()>;
}

/// Notifier that discards every message.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, _message: &str) -> Result<()> {
        Ok(())
    }
}

/// Fire-and-forget front of a [`Notifier`].
#[derive(Clone)]
pub struct NotificationGateway {
    notifier: Arc<dyn Notifier>,
}

impl NotificationGateway {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }

    /// A gateway that drops everything.
    pub fn disabled() -> Self {
        Self::new(Arc::new(NullNotifier))
    }

    /// Build from an optional webhook URL; `None` or an empty string yields a
    /// disabled gateway.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL does not parse or the HTTP client cannot
    /// be constructed.
    pub fn from_webhook_url(url: Option<&str>) -> Result<Self> {
        match url.map(str::trim).filter(|u| !u.is_empty()) {
            Some(url) => Ok(Self::new(Arc::new(WebhookNotifier::new(url)?))),
            None => Ok(Self::disabled()),
        }
    }

    /// Deliver `message` on a background task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn dispatch(&self, message: String) {
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(&message).await {
                tracing::error!(error = %e, "Failed to send ban notification");
            }
        });
    }
}

impl fmt::Debug for NotificationGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationGateway").finish_non_exhaustive()
    }
}

impl Default for NotificationGateway {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Alert text listing every currently banned address.
pub fn ban_summary(banned: &[Address]) -> String {
    let list = banned
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" | ");
    format!(
        ":closed_lock_with_key: {} IPs are banned. \nBanned IP: {}",
        banned.len(),
        list
    )
}
