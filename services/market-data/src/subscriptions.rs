//! Subscription-state bookkeeping across computation cycles
//!
//! `MarketDataManager` reconciles the full set of value specifications a
//! compiled view needs against the set currently tracked, drives provider
//! subscribe/unsubscribe calls, and records a per-key lifecycle:
//!
//! ```text
//! (untracked) ──request──▶ Pending ──succeeded──▶ Active
//!                             │  ╲──failed──▶ Failed
//!                             │
//!      not in a later request ▼ (also from Active/Failed)
//!                          Removed ──re-requested──▶ Pending
//! ```
//!
//! Removed entries are retained so stale removal is observable; unexpected
//! provider notifications for untracked keys never create entries.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use types::value_spec::ValueSpecification;

use crate::provider::{
    MarketDataListener, MarketDataProvider, MarketDataProviderResolver, MarketDataSnapshot,
};

/// Lifecycle state of one tracked subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SubscriptionStatus {
    /// Requested; no provider notification yet.
    Pending,
    /// Provider confirmed delivery.
    Active,
    /// Provider reported failure.
    Failed,
    /// No longer in the desired set; retained for observability.
    Removed,
}

/// One tracked subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionEntry {
    /// The (base) specification this key tracks.
    pub spec: ValueSpecification,
    /// Current lifecycle state.
    pub status: SubscriptionStatus,
    /// When the entry entered its current state.
    pub since: DateTime<Utc>,
    /// Failure reason, for Failed entries.
    pub detail: Option<String>,
}

/// Staged listener notification, emitted after the table lock is released.
struct StateChange {
    key: String,
    old: Option<SubscriptionStatus>,
    new: SubscriptionStatus,
}

/// Subscription-state bookkeeping for one view process.
///
/// All mutation is linearized through the table mutex; listener callbacks
/// are staged under the lock and emitted after release so a listener may
/// re-enter the manager.
pub struct MarketDataManager {
    entries: Mutex<BTreeMap<String, SubscriptionEntry>>,
    provider: Mutex<Option<Arc<dyn MarketDataProvider>>>,
    listener: Arc<dyn MarketDataListener>,
    resolver: Arc<dyn MarketDataProviderResolver>,
}

impl MarketDataManager {
    /// Create a manager. Both collaborators are mandatory; absence is
    /// unrepresentable at this boundary.
    pub fn new(
        listener: Arc<dyn MarketDataListener>,
        resolver: Arc<dyn MarketDataProviderResolver>,
    ) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            provider: Mutex::new(None),
            listener,
            resolver,
        }
    }

    /// Resolve and install the provider for the given market-data spec
    /// label. Returns false when the label does not resolve. Non-removed
    /// subscriptions are re-issued against the new provider.
    pub fn use_market_data_spec(&self, spec_label: &str) -> bool {
        let Some(next) = self.resolver.resolve(spec_label) else {
            warn!(spec_label, "Market data spec did not resolve to a provider");
            return false;
        };
        let previous = {
            let mut provider = self.lock_provider();
            std::mem::replace(&mut *provider, Some(Arc::clone(&next)))
        };
        let live: Vec<ValueSpecification> = {
            let entries = self.lock_entries();
            entries
                .values()
                .filter(|entry| {
                    matches!(
                        entry.status,
                        SubscriptionStatus::Pending | SubscriptionStatus::Active
                    )
                })
                .map(|entry| entry.spec.clone())
                .collect()
        };
        for spec in &live {
            if let Some(old) = &previous {
                old.unsubscribe(spec);
            }
            next.subscribe(spec);
        }
        info!(
            spec_label,
            resubscribed = live.len(),
            "Market data provider installed"
        );
        true
    }

    /// Reconcile the full desired subscription set against the tracked set.
    ///
    /// Tracked entries absent from `desired` transition to Removed (and are
    /// unsubscribed); untracked or Removed entries present in `desired` are
    /// (re)inserted Pending (and subscribed). Entries already tracked
    /// non-Removed and still desired are untouched, so the call is
    /// idempotent for an unchanged set.
    pub fn request_subscriptions(&self, desired: &BTreeSet<ValueSpecification>) {
        let now = Utc::now();
        let desired_keys: BTreeSet<String> =
            desired.iter().map(|spec| spec.subscription_key()).collect();

        let mut changes: Vec<StateChange> = Vec::new();
        let mut to_subscribe: Vec<ValueSpecification> = Vec::new();
        let mut to_unsubscribe: Vec<ValueSpecification> = Vec::new();

        {
            let mut entries = self.lock_entries();

            // Stale entries: tracked, live, no longer desired.
            for (key, entry) in entries.iter_mut() {
                if desired_keys.contains(key) || entry.status == SubscriptionStatus::Removed {
                    continue;
                }
                if matches!(
                    entry.status,
                    SubscriptionStatus::Pending | SubscriptionStatus::Active
                ) {
                    to_unsubscribe.push(entry.spec.clone());
                }
                changes.push(StateChange {
                    key: key.clone(),
                    old: Some(entry.status),
                    new: SubscriptionStatus::Removed,
                });
                entry.status = SubscriptionStatus::Removed;
                entry.since = now;
                entry.detail = None;
            }

            // New entries: desired but untracked, or previously removed.
            for spec in desired {
                let key = spec.subscription_key();
                let old = entries.get(&key).map(|entry| entry.status);
                match old {
                    None | Some(SubscriptionStatus::Removed) => {
                        entries.insert(
                            key.clone(),
                            SubscriptionEntry {
                                spec: spec.clone(),
                                status: SubscriptionStatus::Pending,
                                since: now,
                                detail: None,
                            },
                        );
                        to_subscribe.push(spec.clone());
                        changes.push(StateChange {
                            key,
                            old,
                            new: SubscriptionStatus::Pending,
                        });
                    }
                    // Still desired and already live: untouched.
                    Some(_) => {}
                }
            }
        }

        let provider = self.current_provider();
        if let Some(provider) = &provider {
            for spec in &to_unsubscribe {
                provider.unsubscribe(spec);
            }
            for spec in &to_subscribe {
                provider.subscribe(spec);
            }
        }

        debug!(
            desired = desired.len(),
            subscribed = to_subscribe.len(),
            removed = to_unsubscribe.len(),
            "Reconciled market data subscriptions"
        );
        self.emit(changes);
    }

    /// Provider confirmed delivery for the given specs. Untracked and
    /// Removed keys are ignored; no entry is created.
    pub fn subscriptions_succeeded(&self, specs: &BTreeSet<ValueSpecification>) {
        let now = Utc::now();
        let mut changes = Vec::new();
        {
            let mut entries = self.lock_entries();
            for spec in specs {
                let key = spec.subscription_key();
                match entries.get_mut(&key) {
                    Some(entry) if entry.status != SubscriptionStatus::Removed => {
                        let old = entry.status;
                        entry.status = SubscriptionStatus::Active;
                        entry.since = now;
                        entry.detail = None;
                        changes.push(StateChange {
                            key,
                            old: Some(old),
                            new: SubscriptionStatus::Active,
                        });
                    }
                    _ => {
                        debug!(key, "Ignoring success notification for untracked key");
                    }
                }
            }
        }
        self.emit(changes);
    }

    /// Provider reported failure for one spec. Untracked and Removed keys
    /// are ignored; no entry is created.
    pub fn subscription_failed(&self, spec: &ValueSpecification, reason: impl Into<String>) {
        let reason = reason.into();
        let key = spec.subscription_key();
        let mut changes = Vec::new();
        {
            let mut entries = self.lock_entries();
            match entries.get_mut(&key) {
                Some(entry) if entry.status != SubscriptionStatus::Removed => {
                    let old = entry.status;
                    entry.status = SubscriptionStatus::Failed;
                    entry.since = Utc::now();
                    entry.detail = Some(reason.clone());
                    changes.push(StateChange {
                        key: key.clone(),
                        old: Some(old),
                        new: SubscriptionStatus::Failed,
                    });
                    warn!(key, reason, "Market data subscription failed");
                }
                _ => {
                    debug!(key, "Ignoring failure notification for untracked key");
                }
            }
        }
        self.emit(changes);
    }

    /// All tracked entries whose ticker contains `query` as a substring.
    /// `None` or the empty string matches every entry. Keys differing only
    /// by value name are distinct entries in the result.
    pub fn query_subscription_state(
        &self,
        query: Option<&str>,
    ) -> BTreeMap<String, SubscriptionStatus> {
        let entries = self.lock_entries();
        entries
            .iter()
            .filter(|(_, entry)| match query {
                None | Some("") => true,
                Some(q) => entry.spec.ticker.contains(q),
            })
            .map(|(key, entry)| (key.clone(), entry.status))
            .collect()
    }

    /// Full entry detail for one key.
    pub fn subscription_entry(&self, key: &str) -> Option<SubscriptionEntry> {
        self.lock_entries().get(key).cloned()
    }

    /// Live count of Pending entries, recomputed on every call.
    pub fn pending_count(&self) -> usize {
        self.count(SubscriptionStatus::Pending)
    }

    /// Live count of Active entries, recomputed on every call.
    pub fn active_count(&self) -> usize {
        self.count(SubscriptionStatus::Active)
    }

    /// Live count of Failed entries, recomputed on every call.
    pub fn failed_count(&self) -> usize {
        self.count(SubscriptionStatus::Failed)
    }

    /// Live count of Removed entries, recomputed on every call.
    pub fn removed_count(&self) -> usize {
        self.count(SubscriptionStatus::Removed)
    }

    /// Total number of tracked keys, Removed included.
    pub fn tracked_count(&self) -> usize {
        self.lock_entries().len()
    }

    /// Snapshot from the currently installed provider, if any.
    pub fn snapshot(&self) -> Option<Box<dyn MarketDataSnapshot>> {
        self.current_provider().map(|provider| provider.snapshot())
    }

    /// Availability token of the current provider, if any.
    pub fn availability_token(&self) -> Option<u64> {
        self.current_provider()
            .map(|provider| provider.availability_token())
    }

    /// Forward a live-data change to the listener.
    pub fn notify_values_changed(&self, specs: &BTreeSet<ValueSpecification>) {
        self.listener.values_changed(specs);
    }

    fn count(&self, status: SubscriptionStatus) -> usize {
        self.lock_entries()
            .values()
            .filter(|entry| entry.status == status)
            .count()
    }

    fn current_provider(&self) -> Option<Arc<dyn MarketDataProvider>> {
        self.lock_provider().clone()
    }

    fn emit(&self, changes: Vec<StateChange>) {
        for change in changes {
            self.listener
                .subscription_state_changed(&change.key, change.old, change.new);
        }
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, SubscriptionEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_provider(&self) -> std::sync::MutexGuard<'_, Option<Arc<dyn MarketDataProvider>>> {
        self.provider.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap as StdBTreeMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use rust_decimal::Decimal;

    #[derive(Default)]
    struct RecordingListener {
        changes: Mutex<Vec<(String, Option<SubscriptionStatus>, SubscriptionStatus)>>,
    }

    impl MarketDataListener for RecordingListener {
        fn subscription_state_changed(
            &self,
            key: &str,
            old: Option<SubscriptionStatus>,
            new: SubscriptionStatus,
        ) {
            self.changes.lock().unwrap().push((key.to_string(), old, new));
        }

        fn values_changed(&self, _specs: &BTreeSet<ValueSpecification>) {}
    }

    #[derive(Default)]
    struct StubSnapshot {
        values: StdBTreeMap<ValueSpecification, Decimal>,
    }

    impl MarketDataSnapshot for StubSnapshot {
        fn init(&self) {}
        fn init_with(&self, _specs: &BTreeSet<ValueSpecification>, _timeout: Duration) {}
        fn query(&self, spec: &ValueSpecification) -> Option<Decimal> {
            self.values.get(spec).copied()
        }
        fn snapshot_time(&self) -> Option<chrono::DateTime<Utc>> {
            None
        }
        fn snapshot_time_indication(&self) -> Option<chrono::DateTime<Utc>> {
            None
        }
    }

    #[derive(Default)]
    struct RecordingProvider {
        subscribed: Mutex<Vec<ValueSpecification>>,
        unsubscribed: Mutex<Vec<ValueSpecification>>,
    }

    impl MarketDataProvider for RecordingProvider {
        fn subscribe(&self, spec: &ValueSpecification) {
            self.subscribed.lock().unwrap().push(spec.clone());
        }
        fn unsubscribe(&self, spec: &ValueSpecification) {
            self.unsubscribed.lock().unwrap().push(spec.clone());
        }
        fn snapshot(&self) -> Box<dyn MarketDataSnapshot> {
            Box::new(StubSnapshot::default())
        }
        fn is_available(&self, _spec: &ValueSpecification) -> bool {
            true
        }
        fn availability_token(&self) -> u64 {
            0
        }
    }

    struct SingleProviderResolver {
        provider: Arc<RecordingProvider>,
    }

    impl MarketDataProviderResolver for SingleProviderResolver {
        fn resolve(&self, spec_label: &str) -> Option<Arc<dyn MarketDataProvider>> {
            if spec_label == "live" {
                Some(Arc::clone(&self.provider) as Arc<dyn MarketDataProvider>)
            } else {
                None
            }
        }
    }

    fn manager() -> (MarketDataManager, Arc<RecordingListener>, Arc<RecordingProvider>) {
        let listener = Arc::new(RecordingListener::default());
        let provider = Arc::new(RecordingProvider::default());
        let resolver = Arc::new(SingleProviderResolver {
            provider: Arc::clone(&provider),
        });
        let manager = MarketDataManager::new(Arc::clone(&listener) as _, resolver as _);
        (manager, listener, provider)
    }

    fn spec(ticker: &str) -> ValueSpecification {
        ValueSpecification::new("Market_Value", ticker)
    }

    fn specs(tickers: &[&str]) -> BTreeSet<ValueSpecification> {
        tickers.iter().map(|t| spec(t)).collect()
    }

    #[test]
    fn test_status_serializes_uppercase() {
        assert_eq!(
            serde_json::to_string(&SubscriptionStatus::Pending).unwrap(),
            "\"PENDING\""
        );
        assert_eq!(
            serde_json::from_str::<SubscriptionStatus>("\"REMOVED\"").unwrap(),
            SubscriptionStatus::Removed
        );
    }

    #[test]
    fn test_request_creates_pending_entries() {
        let (manager, _, _) = manager();
        manager.request_subscriptions(&specs(&["AAPL.", "GOOG."]));
        assert_eq!(manager.pending_count(), 2);
        assert_eq!(manager.active_count(), 0);
        assert_eq!(manager.tracked_count(), 2);
    }

    #[test]
    fn test_succeeded_transitions_to_active() {
        let (manager, _, _) = manager();
        manager.request_subscriptions(&specs(&["AAPL."]));
        manager.subscriptions_succeeded(&specs(&["AAPL."]));
        assert_eq!(manager.pending_count(), 0);
        assert_eq!(manager.active_count(), 1);
    }

    #[test]
    fn test_failed_records_reason() {
        let (manager, _, _) = manager();
        manager.request_subscriptions(&specs(&["AAPL."]));
        manager.subscription_failed(&spec("AAPL."), "no permission");
        assert_eq!(manager.failed_count(), 1);
        let entry = manager
            .subscription_entry(&spec("AAPL.").subscription_key())
            .unwrap();
        assert_eq!(entry.detail.as_deref(), Some("no permission"));
    }

    #[test]
    fn test_rerequest_without_spec_marks_removed_and_retains_entry() {
        let (manager, _, _) = manager();
        manager.request_subscriptions(&specs(&["AAPL.", "GOOG."]));
        manager.subscriptions_succeeded(&specs(&["AAPL."]));

        manager.request_subscriptions(&specs(&["GOOG."]));
        assert_eq!(manager.removed_count(), 1);
        assert_eq!(manager.pending_count(), 1);
        assert_eq!(manager.tracked_count(), 2, "removed entries are retained");
    }

    #[test]
    fn test_rerequest_of_removed_key_recreates_pending() {
        let (manager, _, _) = manager();
        manager.request_subscriptions(&specs(&["AAPL."]));
        manager.subscriptions_succeeded(&specs(&["AAPL."]));
        manager.request_subscriptions(&specs(&[]));
        assert_eq!(manager.removed_count(), 1);

        manager.request_subscriptions(&specs(&["AAPL."]));
        let entry = manager
            .subscription_entry(&spec("AAPL.").subscription_key())
            .unwrap();
        assert_eq!(
            entry.status,
            SubscriptionStatus::Pending,
            "re-request yields Pending, not the prior Active"
        );
    }

    #[test]
    fn test_unchanged_entries_are_untouched() {
        let (manager, listener, _) = manager();
        manager.request_subscriptions(&specs(&["AAPL."]));
        manager.subscriptions_succeeded(&specs(&["AAPL."]));
        listener.changes.lock().unwrap().clear();

        manager.request_subscriptions(&specs(&["AAPL."]));
        assert_eq!(manager.active_count(), 1);
        assert!(
            listener.changes.lock().unwrap().is_empty(),
            "idempotent re-request emits no notifications"
        );
    }

    #[test]
    fn test_untracked_notifications_are_ignored() {
        let (manager, _, _) = manager();
        manager.subscriptions_succeeded(&specs(&["AAPL."]));
        manager.subscription_failed(&spec("GOOG."), "boom");
        assert_eq!(manager.tracked_count(), 0, "no entries created");
    }

    #[test]
    fn test_notifications_for_removed_keys_are_ignored() {
        let (manager, _, _) = manager();
        manager.request_subscriptions(&specs(&["AAPL."]));
        manager.request_subscriptions(&specs(&[]));
        manager.subscriptions_succeeded(&specs(&["AAPL."]));
        assert_eq!(manager.removed_count(), 1);
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn test_substring_query() {
        let (manager, _, _) = manager();
        manager.request_subscriptions(&specs(&[
            "AAPL.",
            "AAPL/G4NHG.O",
            "AAPL/G4G3F.",
            "GOOG.",
            "GOOG/GsG~K.",
        ]));

        assert_eq!(manager.query_subscription_state(Some("AAPL")).len(), 3);
        assert_eq!(manager.query_subscription_state(Some("AAPL.")).len(), 1);
        assert_eq!(manager.query_subscription_state(Some("GOOG")).len(), 2);
        assert_eq!(manager.query_subscription_state(None).len(), 5);
        assert_eq!(manager.query_subscription_state(Some("")).len(), 5);
        assert_eq!(manager.query_subscription_state(Some("MSFT")).len(), 0);
    }

    #[test]
    fn test_same_ticker_distinct_value_names_both_returned() {
        let (manager, _, _) = manager();
        let desired: BTreeSet<ValueSpecification> = [
            ValueSpecification::new("Market_Value", "AAPL."),
            ValueSpecification::new("Dividend_Yield", "AAPL."),
        ]
        .into_iter()
        .collect();
        manager.request_subscriptions(&desired);

        let matched = manager.query_subscription_state(Some("AAPL."));
        assert_eq!(matched.len(), 2);
        let keys: Vec<&String> = matched.keys().collect();
        assert_ne!(keys[0], keys[1], "keys distinguish the value names");
    }

    #[test]
    fn test_provider_subscribe_unsubscribe_flow() {
        let (manager, _, provider) = manager();
        assert!(manager.use_market_data_spec("live"));
        manager.request_subscriptions(&specs(&["AAPL.", "GOOG."]));
        assert_eq!(provider.subscribed.lock().unwrap().len(), 2);

        manager.request_subscriptions(&specs(&["GOOG."]));
        let unsubscribed = provider.unsubscribed.lock().unwrap();
        assert_eq!(unsubscribed.len(), 1);
        assert_eq!(unsubscribed[0].ticker, "AAPL.");
    }

    #[test]
    fn test_unresolvable_spec_label() {
        let (manager, _, _) = manager();
        assert!(!manager.use_market_data_spec("nonexistent"));
        assert!(manager.snapshot().is_none());
        assert!(manager.availability_token().is_none());
    }

    #[test]
    fn test_listener_sees_full_lifecycle() {
        let (manager, listener, _) = manager();
        manager.request_subscriptions(&specs(&["AAPL."]));
        manager.subscriptions_succeeded(&specs(&["AAPL."]));
        manager.request_subscriptions(&specs(&[]));

        let changes = listener.changes.lock().unwrap();
        let key = spec("AAPL.").subscription_key();
        assert_eq!(
            *changes,
            vec![
                (key.clone(), None, SubscriptionStatus::Pending),
                (
                    key.clone(),
                    Some(SubscriptionStatus::Pending),
                    SubscriptionStatus::Active
                ),
                (
                    key,
                    Some(SubscriptionStatus::Active),
                    SubscriptionStatus::Removed
                ),
            ]
        );
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn arbitrary_tickers() -> impl Strategy<Value = Vec<String>> {
            proptest::collection::vec("[A-Z]{1,4}\\.", 0..12)
        }

        proptest! {
            /// Reconciliation never forgets a tracked key: once requested,
            /// a key stays tracked (possibly Removed) forever.
            #[test]
            fn prop_tracked_keys_never_lost(
                first in arbitrary_tickers(),
                second in arbitrary_tickers(),
            ) {
                let (manager, _, _) = manager();
                let first: BTreeSet<ValueSpecification> =
                    first.iter().map(|t| spec(t)).collect();
                let second: BTreeSet<ValueSpecification> =
                    second.iter().map(|t| spec(t)).collect();

                manager.request_subscriptions(&first);
                let tracked_after_first = manager.tracked_count();
                manager.request_subscriptions(&second);

                prop_assert!(manager.tracked_count() >= tracked_after_first);
                for spec in &first {
                    prop_assert!(manager
                        .subscription_entry(&spec.subscription_key())
                        .is_some());
                }
            }

            /// Status counts always sum to the tracked total.
            #[test]
            fn prop_counts_sum_to_tracked(
                first in arbitrary_tickers(),
                second in arbitrary_tickers(),
            ) {
                let (manager, _, _) = manager();
                let first: BTreeSet<ValueSpecification> =
                    first.iter().map(|t| spec(t)).collect();
                let second: BTreeSet<ValueSpecification> =
                    second.iter().map(|t| spec(t)).collect();

                manager.request_subscriptions(&first);
                manager.subscriptions_succeeded(&first);
                manager.request_subscriptions(&second);

                let sum = manager.pending_count()
                    + manager.active_count()
                    + manager.failed_count()
                    + manager.removed_count();
                prop_assert_eq!(sum, manager.tracked_count());
            }
        }
    }
}
