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

//! Error types for the jail engine.
//!
//! # Error Categories
//!
//! - Address validation: [`JailError::InvalidAddress`]
//! - Ban file persistence: [`JailError::BanFileRead`], [`JailError::BanFileWrite`],
//!   [`JailError::BanFileParse`], [`JailError::BanFileEncode`]
//! - Notification delivery: [`JailError::InvalidWebhookUrl`],
//!   [`JailError::NotificationTransport`], [`JailError::NotificationStatus`]
//! - Connection policy: [`JailError::ConnectionTerminated`]
//!
//! Only ban file errors raised while opening the store are fatal. Everything
//! else is logged by the caller and the listener keeps running.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the ban store, ledger, notifier and session layer.
#[derive(Debug, Error)]
pub enum JailError {
    /// Remote address is not a syntactically valid IP address.
    #[error("invalid address '{input}'")]
    InvalidAddress { input: String },

    /// The ban file exists but could not be read.
    #[error("failed to read ban file {path}: {source}")]
    BanFileRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The ban file could not be written or replaced.
    #[error("failed to write ban file {path}: {source}")]
    BanFileWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The ban file content is not a JSON object of address to epoch millis.
    #[error("malformed ban file {path}: {source}")]
    BanFileParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode ban map: {0}")]
    BanFileEncode(#[source] serde_json::Error),

    #[error("invalid webhook URL '{url}': {reason}")]
    InvalidWebhookUrl { url: String, reason: String },

    #[error("notification request failed: {0}")]
    NotificationTransport(#[from] reqwest::Error),

    /// The webhook answered with something other than 204 No Content.
    #[error("notification endpoint returned HTTP {status}")]
    NotificationStatus { status: u16 },

    /// The connection was closed by an `End` directive.
    #[error("connection from {address} terminated")]
    ConnectionTerminated { address: String },
}

impl JailError {
    /// Create an error for an address that failed validation.
    pub fn invalid_address(input: impl Into<String>) -> Self {
        Self::InvalidAddress {
            input: input.into(),
        }
    }

    /// Whether this error is the expected end of a terminated connection
    /// rather than a transport failure.
    pub fn is_termination(&self) -> bool {
        matches!(self, Self::ConnectionTerminated { .. })
    }
}

/// Result alias for jail operations.
pub type Result<T> = std::result::Result<T, JailError>;
