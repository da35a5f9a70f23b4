//! Subscription tables with a per-owner mirror and lazy expiration sweep.
//!
//! Each `SubscriptionTable` keeps the primary map (matcher id to subscription)
//! and a secondary index from owning participant URI to the ids it holds. The
//! two maps are separate `DashMap`s, so an insert or removal touches them one
//! after the other rather than atomically. A removal that misses the index is
//! reported so the caller can log it as a consistency error.
//!
//! Insert writes the index first, so a removal racing a fresh subscription
//! either misses the entry entirely or removes both halves. The remaining
//! window is a re-subscription of a matcher that is being removed at the same
//! moment by the same owner: the index can then lose the id while the entry
//! stays, which the next removal of that entry reports as an inconsistency.
//! Removals that act on a decision (expiry, ownership) re-check it under the
//! entry's shard lock.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;
use delivery_types::Message;
use serde::Serialize;

use crate::subscription::{SubscriberDetails, SubscriptionId, SubscriptionMatcher};

/// The three registries kept by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    /// Publish and request routing.
    Common,
    /// Response correlation by transaction id.
    Transactions,
    /// Debug observers of responses.
    TransactionsSniffers,
}

impl TableKind {
    pub const ALL: [TableKind; 3] = [
        TableKind::Common,
        TableKind::Transactions,
        TableKind::TransactionsSniffers,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            TableKind::Common => "subscriptions_common",
            TableKind::Transactions => "subscriptions_transactions",
            TableKind::TransactionsSniffers => "subscriptions_transactions_sniffers",
        }
    }
}

impl std::fmt::Display for TableKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A matcher together with its subscriber record.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub matcher: Arc<SubscriptionMatcher>,
    pub details: SubscriberDetails,
}

/// Result of removing one entry.
#[derive(Debug)]
pub struct Removed {
    pub subscription: Subscription,
    /// False when the owner index did not hold the id.
    pub mirrored: bool,
}

/// What a sweep pass removed.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub removed: Vec<Subscription>,
    /// Ids whose owner index entry was missing.
    pub inconsistencies: Vec<SubscriptionId>,
}

pub struct SubscriptionTable {
    kind: TableKind,
    entries: DashMap<SubscriptionId, Subscription>,
    by_owner: DashMap<String, HashSet<SubscriptionId>>,
    last_swept_epoch_ms: AtomicI64,
}

impl SubscriptionTable {
    pub fn new(kind: TableKind) -> Self {
        Self {
            kind,
            entries: DashMap::new(),
            by_owner: DashMap::new(),
            last_swept_epoch_ms: AtomicI64::new(0),
        }
    }

    pub fn kind(&self) -> TableKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or overwrite the entry for `matcher`.
    ///
    /// Returns the previous subscriber record when the matcher was already
    /// registered.
    pub fn insert(
        &self,
        matcher: Arc<SubscriptionMatcher>,
        details: SubscriberDetails,
    ) -> Option<SubscriberDetails> {
        let id = matcher.id();
        let owner = details.owner_uri().to_string();
        self.by_owner.entry(owner.clone()).or_default().insert(id);
        let previous = self.entries.insert(id, Subscription { matcher, details });
        if let Some(previous) = &previous {
            if previous.details.owner_uri() != owner {
                self.unindex(previous.details.owner_uri(), id);
            }
        }
        previous.map(|s| s.details)
    }

    pub fn remove(&self, id: SubscriptionId) -> Option<Removed> {
        self.remove_if(id, |_| true)
    }

    /// Remove `id` only while `owner` holds it.
    pub fn remove_owned(&self, id: SubscriptionId, owner: &str) -> Option<Removed> {
        self.remove_if(id, |subscription| subscription.details.owner_uri() == owner)
    }

    /// Remove `id` only if it is still expired at `now_ms`.
    pub fn remove_expired(&self, id: SubscriptionId, now_ms: i64) -> Option<Removed> {
        self.remove_if(id, |subscription| subscription.details.is_expired_at(now_ms))
    }

    fn remove_if(
        &self,
        id: SubscriptionId,
        predicate: impl FnOnce(&Subscription) -> bool,
    ) -> Option<Removed> {
        let (_, subscription) = self
            .entries
            .remove_if(&id, |_, subscription| predicate(subscription))?;
        let mirrored = self.unindex(subscription.details.owner_uri(), id);
        Some(Removed {
            subscription,
            mirrored,
        })
    }

    fn unindex(&self, owner: &str, id: SubscriptionId) -> bool {
        let found = match self.by_owner.get_mut(owner) {
            Some(mut ids) => ids.remove(&id),
            None => false,
        };
        self.by_owner.remove_if(owner, |_, ids| ids.is_empty());
        found
    }

    pub fn get(&self, id: SubscriptionId) -> Option<Subscription> {
        self.entries.get(&id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Ids held by `owner` in this table.
    pub fn owner_ids(&self, owner: &str) -> Vec<SubscriptionId> {
        let mut ids: Vec<_> = self
            .by_owner
            .get(owner)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn owner_count(&self, owner: &str) -> usize {
        self.by_owner.get(owner).map(|ids| ids.len()).unwrap_or(0)
    }

    /// Every subscriber whose matcher accepts `message`.
    ///
    /// With `first_only` the scan stops at the first match. Matchers run under
    /// shard read locks; delivery happens after the scan returns.
    pub fn find(&self, message: &Message, first_only: bool) -> Vec<SubscriberDetails> {
        let mut found = Vec::new();
        for entry in self.entries.iter() {
            if entry.matcher.matches(message) {
                found.push(entry.details.clone());
                if first_only {
                    break;
                }
            }
        }
        found
    }

    /// Sweep when more than `min_interval_ms` has passed since the last sweep.
    ///
    /// Concurrent callers race on the timestamp; only the winner sweeps.
    pub fn sweep_if_due(&self, now_ms: i64, min_interval_ms: u64) -> Option<SweepReport> {
        let last = self.last_swept_epoch_ms.load(Ordering::Acquire);
        let interval = i64::try_from(min_interval_ms).unwrap_or(i64::MAX);
        if now_ms.saturating_sub(last) <= interval {
            return None;
        }
        self.last_swept_epoch_ms
            .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(self.sweep(now_ms))
    }

    /// Remove every entry expired at `now_ms`, regardless of the interval.
    pub fn sweep(&self, now_ms: i64) -> SweepReport {
        let expired: Vec<SubscriptionId> = self
            .entries
            .iter()
            .filter(|entry| entry.details.is_expired_at(now_ms))
            .map(|entry| *entry.key())
            .collect();

        let mut report = SweepReport::default();
        for id in expired {
            // Gone, or re-subscribed with a later expiration, since the scan.
            if let Some(Removed {
                subscription,
                mirrored,
            }) = self.remove_expired(id, now_ms)
            {
                if !mirrored {
                    report.inconsistencies.push(id);
                }
                report.removed.push(subscription);
            }
        }
        report
    }

    pub fn last_swept_epoch_ms(&self) -> i64 {
        self.last_swept_epoch_ms.load(Ordering::Acquire)
    }

    /// All entries, ordered by id.
    pub fn snapshot(&self) -> Vec<Subscription> {
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        entries.sort_by_key(|s| s.matcher.id());
        entries
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.by_owner.clear();
    }

    #[cfg(test)]
    pub(crate) fn forget_owner(&self, owner: &str) {
        self.by_owner.remove(owner);
    }
}

impl std::fmt::Debug for SubscriptionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionTable")
            .field("kind", &self.kind)
            .field("entries", &self.entries.len())
            .field("owners", &self.by_owner.len())
            .field("last_swept_epoch_ms", &self.last_swept_epoch_ms())
            .finish()
    }
}
