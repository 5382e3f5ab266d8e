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

//! Per-address failure tracking and persisted bans.
//!
//! # Overview
//!
//! - [`BanStore`]: address to expiry map, mirrored to a JSON file, with a
//!   timer per ban
//! - [`FailureLedger`]: in-memory consecutive failure counter per address
//! - [`Jail`]: the pair of them plus the ban duration, as shared by every
//!   connection
//!
//! A failure recorded on the ledger that reaches the threshold is turned
//! into a ban by the caller. Banning clears the address's counter, and a
//! banned address accumulates no failures until the ban lapses.

pub mod address;
pub mod ban_store;
pub mod clock;
pub mod ledger;
pub mod persistence;

use std::sync::Arc;
use std::time::Duration;

pub use address::Address;
pub use ban_store::{BanStore, BanStoreBuilder};
pub use clock::{Clock, ManualClock, SystemClock};
pub use ledger::FailureLedger;
pub use persistence::{BanFile, BanMap};

use crate::config::JailSettings;
use crate::notify::NotificationGateway;
use crate::shared::error::Result;

/// Shared ban state handed to every connection.
#[derive(Debug, Clone)]
pub struct Jail {
    bans: BanStore,
    ledger: FailureLedger,
    ban_duration: Duration,
}

impl Jail {
    pub fn new(bans: BanStore, ban_threshold: u32, ban_duration: Duration) -> Self {
        let ledger = FailureLedger::new(bans.clone(), ban_threshold);
        Self {
            bans,
            ledger,
            ban_duration,
        }
    }

    /// Open the ban file named in `settings` and wire up alerts.
    ///
    /// # Errors
    ///
    /// Fails if the webhook URL is invalid or the ban file cannot be loaded.
    pub async fn open(settings: &JailSettings) -> Result<Self> {
        Self::open_with_clock(settings, Arc::new(SystemClock)).await
    }

    pub async fn open_with_clock(settings: &JailSettings, clock: Arc<dyn Clock>) -> Result<Self> {
        let gateway = NotificationGateway::from_webhook_url(settings.webhook_url.as_deref())?;
        let bans = BanStore::builder(BanFile::new(&settings.ban_file))
            .clock(clock)
            .notifications(gateway)
            .notify_threshold(settings.notify_threshold)
            .open()
            .await?;

        Ok(Self::new(
            bans,
            settings.effective_ban_threshold(),
            settings.ban_duration(),
        ))
    }

    pub fn bans(&self) -> &BanStore {
        &self.bans
    }

    pub fn ledger(&self) -> &FailureLedger {
        &self.ledger
    }

    pub fn ban_duration(&self) -> Duration {
        self.ban_duration
    }

    /// Record a failed attempt and ban the address if it crosses the
    /// threshold. Returns whether a ban was placed.
    pub async fn punish(&self, address: &Address) -> Result<bool> {
        self.ledger
            .record_failure_and_ban(address, self.ban_duration)
            .await
    }
}
