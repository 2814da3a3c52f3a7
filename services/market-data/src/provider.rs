//! Market-data collaborator traits
//!
//! The engine consumes market data through these narrow interfaces; live
//! feeds, replayed recordings, and the in-memory stubs used by tests all
//! sit behind them. The traits are deliberately small so test doubles are
//! trivial hand-rolled structs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use types::value_spec::ValueSpecification;

use crate::subscriptions::SubscriptionStatus;

/// A point-in-time queryable view of market data.
pub trait MarketDataSnapshot: Send + Sync {
    /// Prepare the snapshot without filtering to particular values.
    fn init(&self);

    /// Prepare the snapshot for the given values, waiting up to `timeout`
    /// for them to become available.
    fn init_with(&self, specs: &BTreeSet<ValueSpecification>, timeout: Duration);

    /// Query a single value; `None` when the snapshot has no value for it.
    fn query(&self, spec: &ValueSpecification) -> Option<Decimal>;

    /// Query a set of values. Specs the snapshot cannot answer are simply
    /// absent from the result, never an error.
    fn query_set(
        &self,
        specs: &BTreeSet<ValueSpecification>,
    ) -> BTreeMap<ValueSpecification, Decimal> {
        specs
            .iter()
            .filter_map(|spec| self.query(spec).map(|value| (spec.clone(), value)))
            .collect()
    }

    /// The time the snapshot's data actually refers to, if known.
    fn snapshot_time(&self) -> Option<DateTime<Utc>>;

    /// A cheaper indication of the snapshot time, usable before `init`.
    fn snapshot_time_indication(&self) -> Option<DateTime<Utc>>;
}

/// A source of market data: subscriptions plus snapshot production.
pub trait MarketDataProvider: Send + Sync {
    /// Begin delivering the given value; success or failure arrives later
    /// through the manager's notification calls.
    fn subscribe(&self, spec: &ValueSpecification);

    /// Stop delivering the given value.
    fn unsubscribe(&self, spec: &ValueSpecification);

    /// Produce a snapshot over the provider's current data.
    fn snapshot(&self) -> Box<dyn MarketDataSnapshot>;

    /// Whether the provider can currently supply the given value.
    fn is_available(&self, spec: &ValueSpecification) -> bool;

    /// Token that changes whenever the provider's availability universe
    /// changes. Workers recompile when the token moves between cycles.
    fn availability_token(&self) -> u64;
}

/// Resolves a market-data specification label to a provider.
pub trait MarketDataProviderResolver: Send + Sync {
    fn resolve(&self, spec_label: &str) -> Option<Arc<dyn MarketDataProvider>>;
}

/// Downstream notifications from the subscription manager.
pub trait MarketDataListener: Send + Sync {
    /// A tracked subscription changed state. `old` is `None` for a newly
    /// tracked key.
    fn subscription_state_changed(
        &self,
        key: &str,
        old: Option<SubscriptionStatus>,
        new: SubscriptionStatus,
    );

    /// Live values changed for the given specs; workers use this to
    /// request a data-driven cycle.
    fn values_changed(&self, specs: &BTreeSet<ValueSpecification>);
}
