//! Composite snapshot over multiple market-data delegates
//!
//! Merges an ordered list of delegate snapshots into one queryable
//! snapshot. Extended value specifications (those annotated with a provider
//! index) are routed to the delegate at that index with the annotation
//! stripped; specs that resolve to no delegate simply yield no value.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::debug;

use types::value_spec::ValueSpecification;

use crate::provider::MarketDataSnapshot;

/// An ordered list of delegate snapshots behind one snapshot interface.
///
/// The composite owns the list reference, not the delegates' lifecycle.
pub struct CompositeMarketDataSnapshot {
    delegates: Vec<Box<dyn MarketDataSnapshot>>,
}

impl CompositeMarketDataSnapshot {
    pub fn new(delegates: Vec<Box<dyn MarketDataSnapshot>>) -> Self {
        Self { delegates }
    }

    /// Number of delegates.
    pub fn len(&self) -> usize {
        self.delegates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.delegates.is_empty()
    }

    /// Map an extended spec to its delegate index and delegate-local base
    /// spec. `None` for unannotated specs and out-of-range indices.
    fn route(&self, extended: &ValueSpecification) -> Option<(usize, ValueSpecification)> {
        let index = extended.provider_index?;
        if index >= self.delegates.len() {
            debug!(
                index,
                delegates = self.delegates.len(),
                "Extended spec addresses a delegate out of range"
            );
            return None;
        }
        Some((index, extended.without_provider()))
    }
}

impl MarketDataSnapshot for CompositeMarketDataSnapshot {
    fn init(&self) {
        for delegate in &self.delegates {
            delegate.init();
        }
    }

    /// Initialize every delegate exactly once: delegates addressed by at
    /// least one spec get the filtered form with their local subset, the
    /// rest get the unfiltered `init()`.
    fn init_with(&self, extended_specs: &BTreeSet<ValueSpecification>, timeout: Duration) {
        let mut per_delegate: Vec<BTreeSet<ValueSpecification>> =
            vec![BTreeSet::new(); self.delegates.len()];
        for spec in extended_specs {
            if let Some((index, base)) = self.route(spec) {
                per_delegate[index].insert(base);
            }
        }
        for (delegate, subset) in self.delegates.iter().zip(per_delegate) {
            if subset.is_empty() {
                delegate.init();
            } else {
                delegate.init_with(&subset, timeout);
            }
        }
    }

    fn query(&self, extended: &ValueSpecification) -> Option<Decimal> {
        let (index, base) = self.route(extended)?;
        self.delegates[index].query(&base)
    }

    fn snapshot_time(&self) -> Option<DateTime<Utc>> {
        self.delegates
            .iter()
            .find_map(|delegate| delegate.snapshot_time())
    }

    fn snapshot_time_indication(&self) -> Option<DateTime<Utc>> {
        self.delegates
            .iter()
            .find_map(|delegate| delegate.snapshot_time_indication())
    }
}
