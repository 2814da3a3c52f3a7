//! Market-data value specifications
//!
//! A `ValueSpecification` names one requested data item: a value name
//! (e.g. "Market_Value") against a ticker (e.g. "AAPL."). Two specs on the
//! same ticker with different value names are distinct subscriptions.
//!
//! A spec may additionally be "extended" with the index of the market-data
//! provider it originated from; the composite snapshot uses this to route
//! queries back to the right delegate.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a single requested market-data item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueSpecification {
    /// The value name, e.g. "Market_Value" or "Dividend_Yield".
    pub value_name: String,
    /// The ticker the value is requested against, e.g. "AAPL.".
    pub ticker: String,
    /// Provider index annotation for extended specs; `None` for base specs.
    pub provider_index: Option<usize>,
}

impl ValueSpecification {
    /// Create a base (un-annotated) specification.
    pub fn new(value_name: impl Into<String>, ticker: impl Into<String>) -> Self {
        Self {
            value_name: value_name.into(),
            ticker: ticker.into(),
            provider_index: None,
        }
    }

    /// Copy of this spec annotated with the given provider index.
    pub fn with_provider(&self, index: usize) -> Self {
        Self {
            value_name: self.value_name.clone(),
            ticker: self.ticker.clone(),
            provider_index: Some(index),
        }
    }

    /// Copy of this spec with the provider annotation stripped.
    pub fn without_provider(&self) -> Self {
        Self {
            value_name: self.value_name.clone(),
            ticker: self.ticker.clone(),
            provider_index: None,
        }
    }

    /// Whether this spec carries a provider-index annotation.
    pub fn is_extended(&self) -> bool {
        self.provider_index.is_some()
    }

    /// The normalized key used by the subscription table.
    ///
    /// Format: `{ticker}#{value_name}`. Specs differing only by value
    /// name on the same ticker produce distinct keys that share a ticker
    /// prefix, so substring queries on the ticker match both.
    pub fn subscription_key(&self) -> String {
        format!("{}#{}", self.ticker, self.value_name)
    }
}

impl fmt::Display for ValueSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.provider_index {
            Some(index) => write!(f, "{}#{}@{}", self.ticker, self.value_name, index),
            None => write!(f, "{}#{}", self.ticker, self.value_name),
        }
    }
}
