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

//! Chat webhook notifier.
//!
//! Posts `{"content": "<message>"}` as JSON to the configured URL. The
//! endpoint signals success with `204 No Content`; any other status is an
//! error. This matches Discord-style incoming webhooks.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Serialize;

use super::Notifier;
use crate::shared::error::{JailError, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize)]
struct WebhookPayload<'a> {
    content: &'a str,
}

/// Notifier posting to an HTTP webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: Url,
}

impl WebhookNotifier {
    /// Create a notifier for `url`.
    ///
    /// # Errors
    ///
    /// Returns [`JailError::InvalidWebhookUrl`] if the URL does not parse or
    /// is not http(s).
    pub fn new(url: &str) -> Result<Self> {
        let parsed = Url::parse(url).map_err(|e| JailError::InvalidWebhookUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(JailError::InvalidWebhookUrl {
                url: url.to_string(),
                reason: format!("unsupported scheme '{}'", parsed.scheme()),
            });
        }

        let client = reqwest::Client::builder()
            .user_agent(concat!("ssh-jail/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            url: parsed,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, message: &str) -> Result<()> {
        let response = self
            .client
            .post(self.url.clone())
            .json(&WebhookPayload { content: message })
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::NO_CONTENT {
            return Err(JailError::NotificationStatus {
                status: status.as_u16(),
            });
        }

        tracing::debug!(url = %self.url, "Ban notification delivered");
        Ok(())
    }
}
