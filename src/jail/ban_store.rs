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

//! Persisted, self-expiring ban store.
//!
//! Bans are kept in memory behind a single lock and mirrored to a JSON file
//! on every change. Each ban gets a timer task that removes it when it
//! expires, and reads evict any expired record they find, so an address is
//! never reported banned past its expiry even if a timer is late.
//!
//! On open, the persisted map is reconciled against the clock: entries that
//! expired while the process was down are dropped immediately and the rest
//! get timers for their remaining duration.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::AbortHandle;

use super::address::Address;
use super::clock::{Clock, SystemClock};
use super::ledger::FailureCounts;
use super::persistence::{BanFile, BanMap};
use crate::notify::{ban_summary, NotificationGateway};
use crate::shared::error::Result;

/// Default number of live bans at which every new ban raises an alert.
pub const DEFAULT_NOTIFY_THRESHOLD: usize = 3;

#[derive(Debug, Default)]
struct BanState {
    bans: BanMap,
    timers: HashMap<Address, AbortHandle>,
}

impl Drop for BanState {
    fn drop(&mut self) {
        for timer in self.timers.values() {
            timer.abort();
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: Mutex<BanState>,
    file: BanFile,
    clock: Arc<dyn Clock>,
    failures: FailureCounts,
    notifications: NotificationGateway,
    notify_threshold: usize,
}

/// Durable map of banned address to expiry instant.
///
/// Clones share the same state, so one store can be handed to every
/// connection handler.
///
/// # Example
///
/// ```no_run
/// use ssh_jail::jail::{Address, BanFile, BanStore};
/// use std::time::Duration;
///
/// # async fn example() -> ssh_jail::shared::Result<()> {
/// let store = BanStore::builder(BanFile::new("jail.json")).open().await?;
/// let ip = Address::parse("203.0.113.7")?;
///
/// store.ban(ip, Duration::from_secs(30 * 60)).await?;
/// assert!(store.is_banned(&ip).await);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct BanStore {
    inner: Arc<Inner>,
}

/// Builder for [`BanStore`].
pub struct BanStoreBuilder {
    file: BanFile,
    clock: Arc<dyn Clock>,
    notifications: NotificationGateway,
    notify_threshold: usize,
}

impl BanStoreBuilder {
    /// Use `clock` instead of the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Gateway that receives ban alerts.
    pub fn notifications(mut self, gateway: NotificationGateway) -> Self {
        self.notifications = gateway;
        self
    }

    /// Number of live bans at which alerts start.
    pub fn notify_threshold(mut self, threshold: usize) -> Self {
        self.notify_threshold = threshold;
        self
    }

    /// Load the persisted map and start expiry timers for live bans.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails if the ban file exists but cannot be read or parsed, or if
    /// removing expired entries cannot be written back.
    pub async fn open(self) -> Result<BanStore> {
        let mut bans = self.file.load_or_create()?;
        let now = self.clock.now_millis();

        let mut expired = Vec::new();
        bans.retain(|address, expires_at| {
            let live = *expires_at > now;
            if !live {
                expired.push(*address);
            }
            live
        });
        for address in &expired {
            tracing::info!(ip = %address, "Ban expired while offline, unbanned");
        }
        if !expired.is_empty() {
            self.file.save(&bans)?;
        }

        let live: Vec<(Address, u64)> = bans.iter().map(|(a, e)| (*a, *e)).collect();
        let store = BanStore {
            inner: Arc::new(Inner {
                state: Mutex::new(BanState {
                    bans,
                    timers: HashMap::new(),
                }),
                file: self.file,
                clock: self.clock,
                failures: FailureCounts::default(),
                notifications: self.notifications,
                notify_threshold: self.notify_threshold,
            }),
        };

        {
            let mut state = store.inner.state.lock().await;
            for (address, expires_at) in &live {
                let remaining = Duration::from_millis(expires_at - now);
                store.schedule_expiry(&mut state, *address, remaining);
            }
        }

        tracing::info!(
            path = %store.inner.file.path().display(),
            active_bans = live.len(),
            "Ban store loaded"
        );
        Ok(store)
    }
}

impl BanStore {
    /// Start building a store backed by `file`.
    pub fn builder(file: BanFile) -> BanStoreBuilder {
        BanStoreBuilder {
            file,
            clock: Arc::new(SystemClock),
            notifications: NotificationGateway::disabled(),
            notify_threshold: DEFAULT_NOTIFY_THRESHOLD,
        }
    }

    /// Whether `address` has a live ban.
    ///
    /// An expired record found here is removed and the file rewritten.
    pub async fn is_banned(&self, address: &Address) -> bool {
        let now = self.inner.clock.now_millis();
        let mut state = self.inner.state.lock().await;

        match state.bans.get(address).copied() {
            Some(expires_at) if expires_at > now => true,
            Some(_) => {
                state.bans.remove(address);
                state.timers.remove(address);
                // A failed write is logged by persist; the eviction stands.
                let _ = self.persist(&state.bans);
                tracing::info!(ip = %address, "Ban expired, unbanned on lookup");
                false
            }
            None => false,
        }
    }

    /// Ban `address` for `duration` from now.
    ///
    /// Overwrites any existing ban, rewrites the file, replaces the expiry
    /// timer, clears the address's failure counter and, once the number of
    /// live bans reaches the notify threshold, dispatches an alert.
    ///
    /// The in-memory ban takes effect even if the file write fails; the
    /// write error is returned.
    pub async fn ban(&self, address: Address, duration: Duration) -> Result<()> {
        let saved = self.place(address, duration).await;
        self.inner.failures.reset(&address).await;
        saved
    }

    /// Ban without touching the failure counters.
    ///
    /// The ledger calls this while it holds its own lock, after dropping the
    /// counter that crossed the threshold.
    pub(crate) async fn place(&self, address: Address, duration: Duration) -> Result<()> {
        let (saved, banned) = {
            let mut state = self.inner.state.lock().await;
            let now = self.inner.clock.now_millis();
            let expires_at = now.saturating_add(duration.as_millis() as u64);

            state.bans.insert(address, expires_at);
            let saved = self.persist(&state.bans);
            self.schedule_expiry(&mut state, address, duration);

            (saved, live_addresses(&state.bans, now))
        };

        tracing::warn!(
            ip = %address,
            duration_secs = duration.as_secs(),
            active_bans = banned.len(),
            "Banned address"
        );

        if banned.len() >= self.inner.notify_threshold {
            self.inner.notifications.dispatch(ban_summary(&banned));
        }

        saved
    }

    /// Remove any ban on `address`. A no-op if there is none.
    pub async fn unban(&self, address: &Address) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if state.bans.remove(address).is_none() {
            return Ok(());
        }
        if let Some(timer) = state.timers.remove(address) {
            timer.abort();
        }
        let saved = self.persist(&state.bans);
        drop(state);

        tracing::info!(ip = %address, "Unbanned address");
        saved
    }

    /// Addresses with a live ban.
    pub async fn list_banned(&self) -> BTreeSet<Address> {
        let now = self.inner.clock.now_millis();
        let state = self.inner.state.lock().await;
        live_addresses(&state.bans, now).into_iter().collect()
    }

    /// Number of live bans.
    pub async fn count_banned(&self) -> usize {
        let now = self.inner.clock.now_millis();
        let state = self.inner.state.lock().await;
        state.bans.values().filter(|expires_at| **expires_at > now).count()
    }

    /// Live bans with their expiry instant in epoch milliseconds.
    pub async fn bans(&self) -> Vec<(Address, u64)> {
        let now = self.inner.clock.now_millis();
        let state = self.inner.state.lock().await;
        state
            .bans
            .iter()
            .filter(|(_, expires_at)| **expires_at > now)
            .map(|(address, expires_at)| (*address, *expires_at))
            .collect()
    }

    /// Path of the backing file.
    pub fn file(&self) -> &BanFile {
        &self.inner.file
    }

    pub(crate) fn failure_counts(&self) -> FailureCounts {
        self.inner.failures.clone()
    }

    fn persist(&self, bans: &BanMap) -> Result<()> {
        self.inner.file.save(bans).inspect_err(|e| {
            tracing::error!(error = %e, "Failed to persist ban file");
        })
    }

    /// Start (or restart) the expiry timer for `address`.
    fn schedule_expiry(&self, state: &mut BanState, address: Address, delay: Duration) {
        let inner = Arc::downgrade(&self.inner);
        let task = tokio::spawn(expiry_timer(inner, address, delay));
        if let Some(previous) = state.timers.insert(address, task.abort_handle()) {
            previous.abort();
        }
    }

    /// Timer callback: drop the record if it has expired.
    ///
    /// Returns the time still left when the timer fired early against the
    /// store's clock.
    async fn expire(&self, address: &Address) -> Option<Duration> {
        let now = self.inner.clock.now_millis();
        let mut state = self.inner.state.lock().await;

        match state.bans.get(address).copied() {
            Some(expires_at) if expires_at > now => Some(Duration::from_millis(expires_at - now)),
            Some(_) => {
                state.bans.remove(address);
                state.timers.remove(address);
                // Same as on lookup: logged by persist, eviction stands.
                let _ = self.persist(&state.bans);
                tracing::info!(ip = %address, "Ban expired, unbanned");
                None
            }
            None => {
                state.timers.remove(address);
                None
            }
        }
    }

    #[cfg(test)]
    async fn pending_timers(&self) -> usize {
        self.inner.state.lock().await.timers.len()
    }
}

async fn expiry_timer(inner: Weak<Inner>, address: Address, mut delay: Duration) {
    loop {
        tokio::time::sleep(delay).await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match (BanStore { inner }).expire(&address).await {
            Some(remaining) => delay = remaining,
            None => return,
        }
    }
}

fn live_addresses(bans: &BanMap, now: u64) -> Vec<Address> {
    bans.iter()
        .filter(|(_, expires_at)| **expires_at > now)
        .map(|(address, _)| *address)
        .collect()
}
