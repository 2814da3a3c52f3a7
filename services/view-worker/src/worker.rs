//! Worker contract and collaborator boundaries
//!
//! `ViewProcessWorker` is the unit of execution: something that runs a
//! stream of computation cycles against one view and reports through a
//! `ViewProcessWorkerContext`. The partitioning and parallel-recompilation
//! coordinators are themselves `ViewProcessWorker`s that wrap other
//! workers, so composition is decorator-shaped.
//!
//! The dependency-graph compiler and the valuation engine are external
//! collaborators behind `ViewCompiler`/`CycleExecutor`; the engine treats
//! both as opaque calls with a success or failure outcome.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use market_data::provider::MarketDataSnapshot;
use types::errors::{CompilationError, CycleExecutionError};
use types::execution::{ViewCycleExecutionOptions, ViewExecutionOptions};
use types::sequence::ViewCycleExecutionSequence;
use types::value_spec::ValueSpecification;
use types::view::{CompiledViewDefinition, ViewDefinition};

use crate::context::ViewProcessWorkerContext;

/// An execution unit running a sequence of computation cycles.
///
/// Every state-changing call made after `terminate()` is a no-op returning
/// the "not possible" value; none of these methods panic on a dead worker.
pub trait ViewProcessWorker: Send + Sync {
    /// Request an out-of-band cycle now. Returns false when the worker has
    /// terminated or its sequence has nothing more to offer.
    fn trigger_cycle(&self) -> bool;

    /// Request a data-driven cycle; same refusal semantics as
    /// `trigger_cycle`.
    fn request_cycle(&self) -> bool;

    /// Supply an updated view definition for subsequent compilations.
    fn update_view_definition(&self, view: ViewDefinition);

    /// Request shutdown. Asynchronous; does not block.
    fn terminate(&self);

    /// Block until termination completes.
    fn join(&self);

    /// Block until termination completes or the timeout expires; returns
    /// whether the worker completed within the timeout.
    fn join_timeout(&self, timeout: Duration) -> bool;

    fn is_terminated(&self) -> bool;

    /// Discard the current compilation and rebuild before the next cycle.
    fn force_graph_rebuild(&self);
}

/// Materializes delegate workers for the coordinators.
///
/// The cycle sequence travels alongside the immutable execution options so
/// coordinators can hand each delegate its own window over a shared
/// sequence.
pub trait ViewProcessWorkerFactory: Send + Sync {
    fn create_worker(
        &self,
        context: Arc<dyn ViewProcessWorkerContext>,
        execution_options: ViewExecutionOptions,
        sequence: Box<dyn ViewCycleExecutionSequence>,
        view: ViewDefinition,
    ) -> Arc<dyn ViewProcessWorker>;
}

/// Produces fresh cycle sequences for speculative workers.
///
/// The parallel-recompilation coordinator starts a new delegate whenever
/// the view definition changes; each delegate needs its own sequence.
pub trait ExecutionSequenceSource: Send + Sync {
    fn sequence(&self) -> Box<dyn ViewCycleExecutionSequence>;
}

/// External dependency-graph compiler.
pub trait ViewCompiler: Send + Sync {
    fn compile(
        &self,
        view: &ViewDefinition,
        valuation_time: DateTime<Utc>,
    ) -> Result<CompiledViewDefinition, CompilationError>;
}

/// External valuation engine: executes one compiled graph against one
/// snapshot.
pub trait CycleExecutor: Send + Sync {
    fn execute(
        &self,
        compiled: &CompiledViewDefinition,
        snapshot: &dyn MarketDataSnapshot,
        options: &ViewCycleExecutionOptions,
    ) -> Result<BTreeMap<ValueSpecification, Decimal>, CycleExecutionError>;
}
