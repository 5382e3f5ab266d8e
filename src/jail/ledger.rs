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

//! Per-address count of consecutive failed authentication attempts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use super::address::Address;
use super::ban_store::BanStore;
use crate::shared::error::Result;

/// The failure count map.
///
/// Owned by [`FailureLedger`]; the [`BanStore`] keeps a handle only so that a
/// ban can clear the banned address's counter.
#[derive(Debug, Clone, Default)]
pub struct FailureCounts {
    counts: Arc<Mutex<HashMap<Address, u32>>>,
}

impl FailureCounts {
    pub(crate) async fn reset(&self, address: &Address) {
        self.counts.lock().await.remove(address);
    }

    async fn get(&self, address: &Address) -> u32 {
        self.counts.lock().await.get(address).copied().unwrap_or(0)
    }

    async fn len(&self) -> usize {
        self.counts.lock().await.len()
    }
}

/// Counts failures per address and reports threshold crossings.
///
/// Clones share the same counters.
#[derive(Debug, Clone)]
pub struct FailureLedger {
    counts: FailureCounts,
    bans: BanStore,
    threshold: u32,
}

impl FailureLedger {
    /// Create a ledger feeding `bans`. A threshold of zero is treated as one.
    pub fn new(bans: BanStore, threshold: u32) -> Self {
        Self {
            counts: bans.failure_counts(),
            bans,
            threshold: threshold.max(1),
        }
    }

    /// Number of failures that triggers a ban.
    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Record one failed attempt from `address`.
    ///
    /// A banned address accumulates nothing and `false` is returned. When the
    /// count reaches the threshold the counter is dropped and `true` is
    /// returned; banning is left to the caller.
    pub async fn record_failure(&self, address: &Address) -> bool {
        let mut counts = self.counts.counts.lock().await;
        self.count_failure(&mut counts, address).await
    }

    /// Record one failed attempt and ban `address` for `duration` if it
    /// crosses the threshold. Returns whether a ban was placed.
    ///
    /// The counter map stays locked from the ban check to the ban itself, so
    /// concurrent failures from one address place a single ban.
    pub async fn record_failure_and_ban(
        &self,
        address: &Address,
        duration: Duration,
    ) -> Result<bool> {
        let mut counts = self.counts.counts.lock().await;
        if !self.count_failure(&mut counts, address).await {
            return Ok(false);
        }
        self.bans.place(*address, duration).await?;
        Ok(true)
    }

    // Lock order: counts, then the ban store.
    async fn count_failure(&self, counts: &mut HashMap<Address, u32>, address: &Address) -> bool {
        if self.bans.is_banned(address).await {
            return false;
        }

        let count = counts.entry(*address).or_insert(0);
        *count += 1;

        tracing::debug!(
            ip = %address,
            failures = *count,
            threshold = self.threshold,
            "Recorded failed attempt"
        );

        if *count >= self.threshold {
            counts.remove(address);
            return true;
        }
        false
    }

    /// Clear the counter for `address`.
    pub async fn reset_failures(&self, address: &Address) {
        self.counts.reset(address).await;
    }

    /// Current failure count for `address`.
    pub async fn failure_count(&self, address: &Address) -> u32 {
        self.counts.get(address).await
    }

    /// Number of addresses with a non-zero counter.
    pub async fn tracked_count(&self) -> usize {
        self.counts.len().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jail::persistence::BanFile;
    use tempfile::TempDir;

    fn test_ip() -> Address {
        Address::parse("192.168.1.100").unwrap()
    }

    fn test_ip2() -> Address {
        Address::parse("192.168.1.101").unwrap()
    }

    async fn ledger(dir: &TempDir, threshold: u32) -> FailureLedger {
        let bans = BanStore::builder(BanFile::in_dir(dir.path()))
            .open()
            .await
            .unwrap();
        FailureLedger::new(bans, threshold)
    }

    #[tokio::test]
    async fn test_failure_counting() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir, 5).await;
        let ip = test_ip();

        for i in 1..5 {
            assert!(!ledger.record_failure(&ip).await, "no crossing after {i}");
            assert_eq!(ledger.failure_count(&ip).await, i);
        }
    }

    #[tokio::test]
    async fn test_crossing_drops_counter() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir, 3).await;
        let ip = test_ip();

        assert!(!ledger.record_failure(&ip).await);
        assert!(!ledger.record_failure(&ip).await);
        assert!(ledger.record_failure(&ip).await);
        assert_eq!(ledger.failure_count(&ip).await, 0);
        assert_eq!(ledger.tracked_count().await, 0);
    }

    #[tokio::test]
    async fn test_reset_failures() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir, 3).await;
        let ip = test_ip();

        ledger.record_failure(&ip).await;
        ledger.record_failure(&ip).await;
        ledger.reset_failures(&ip).await;
        assert_eq!(ledger.failure_count(&ip).await, 0);

        // Needs the full threshold again
        assert!(!ledger.record_failure(&ip).await);
        assert!(!ledger.record_failure(&ip).await);
        assert!(ledger.record_failure(&ip).await);
    }

    #[tokio::test]
    async fn test_banned_address_does_not_accumulate() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir, 2).await;
        let ip = test_ip();

        ledger
            .bans
            .ban(ip, Duration::from_secs(300))
            .await
            .unwrap();

        assert!(!ledger.record_failure(&ip).await);
        assert!(!ledger.record_failure(&ip).await);
        assert_eq!(ledger.failure_count(&ip).await, 0);
    }

    #[tokio::test]
    async fn test_per_address_isolation() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir, 2).await;

        ledger.record_failure(&test_ip()).await;
        assert_eq!(ledger.failure_count(&test_ip2()).await, 0);
        assert!(!ledger.record_failure(&test_ip2()).await);
        assert!(ledger.record_failure(&test_ip()).await);
    }

    #[tokio::test]
    async fn test_zero_threshold_clamped() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir, 0).await;
        assert_eq!(ledger.threshold(), 1);
        assert!(ledger.record_failure(&test_ip()).await);
    }

    #[tokio::test]
    async fn test_clone_shares_state() {
        let dir = TempDir::new().unwrap();
        let first = ledger(&dir, 3).await;
        let second = first.clone();
        let ip = test_ip();

        first.record_failure(&ip).await;
        first.record_failure(&ip).await;
        assert_eq!(second.failure_count(&ip).await, 2);
        assert!(second.record_failure(&ip).await);
    }
}
