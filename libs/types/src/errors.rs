//! Error taxonomy for the view computation engine
//!
//! Data and runtime failures (compilation, cycle execution, subscriptions)
//! are recovered locally and surfaced as events; only usage-contract
//! violations propagate as hard errors.

use thiserror::Error;

/// Usage-contract violations on worker lifecycles.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    #[error("Illegal worker state: {reason}")]
    IllegalState { reason: String },

    #[error("Worker already terminated")]
    Terminated,
}

impl WorkerError {
    pub fn illegal_state(reason: impl Into<String>) -> Self {
        Self::IllegalState {
            reason: reason.into(),
        }
    }
}

/// Dependency-graph compilation failure for a view definition.
///
/// Non-fatal to a worker: it keeps running its previous compiled view if
/// one exists.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Compilation of view '{view}' failed: {reason}")]
pub struct CompilationError {
    /// Name of the view definition that failed to compile.
    pub view: String,
    /// Compiler-reported reason.
    pub reason: String,
}

impl CompilationError {
    pub fn new(view: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            view: view.into(),
            reason: reason.into(),
        }
    }
}

/// A single cycle's valuation failure.
///
/// The worker reports it and continues to the next cycle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Cycle execution failed: {reason}")]
pub struct CycleExecutionError {
    /// Executor-reported reason.
    pub reason: String,
    /// Whether the failure was caused by missing market data.
    pub market_data_missing: bool,
}

impl CycleExecutionError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            market_data_missing: false,
        }
    }

    pub fn missing_market_data(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            market_data_missing: true,
        }
    }
}
