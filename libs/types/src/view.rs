//! View definitions and compiled view definitions
//!
//! A `ViewDefinition` names what to compute and the market data it needs.
//! Compiling it (an external concern) yields a `CompiledViewDefinition`:
//! the resolved market-data requirements plus a validity window for the
//! valuation times the compilation holds for.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::ids::ViewDefinitionId;
use crate::value_spec::ValueSpecification;

/// The named specification of what to compute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewDefinition {
    /// Stable identity across updates of the definition.
    pub id: ViewDefinitionId,
    /// Human-readable view name.
    pub name: String,
    /// Market-data items the view requires.
    pub requirements: BTreeSet<ValueSpecification>,
}

impl ViewDefinition {
    /// Create a view definition with a fresh id.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: ViewDefinitionId::new(),
            name: name.into(),
            requirements: BTreeSet::new(),
        }
    }

    /// Copy of this definition with an added requirement.
    pub fn with_requirement(mut self, spec: ValueSpecification) -> Self {
        self.requirements.insert(spec);
        self
    }
}

/// The output of compiling a view definition against a valuation time.
///
/// Produced by the external dependency-graph compiler; the engine only
/// reads the resolved requirements and the validity window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledViewDefinition {
    /// The definition this compilation was produced from.
    pub view: ViewDefinition,
    /// Valuation time the compilation was performed for.
    pub valuation_time: DateTime<Utc>,
    /// Resolved market-data requirements of the compiled graph.
    pub market_data_requirements: BTreeSet<ValueSpecification>,
    /// When the compilation happened.
    pub compiled_at: DateTime<Utc>,
    /// Earliest valuation time the compilation is valid for (open if None).
    pub valid_from: Option<DateTime<Utc>>,
    /// Latest valuation time the compilation is valid for (open if None).
    pub valid_to: Option<DateTime<Utc>>,
}

impl CompiledViewDefinition {
    /// Whether this compilation holds for the given valuation time.
    pub fn is_valid_for(&self, valuation_time: DateTime<Utc>) -> bool {
        if let Some(from) = self.valid_from {
            if valuation_time < from {
                return false;
            }
        }
        if let Some(to) = self.valid_to {
            if valuation_time > to {
                return false;
            }
        }
        true
    }
}
