//! Upward callback surface for view process workers
//!
//! A worker reports its progress to whoever owns it through a
//! `ViewProcessWorkerContext`. Events for a single worker arrive in program
//! order: a compilation event always precedes the first `cycle_started`
//! that uses it, and fragment events bracket but never cross
//! `cycle_started`/`cycle_completed` boundaries.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use types::errors::{CompilationError, CycleExecutionError};
use types::execution::ViewCycleExecutionOptions;
use types::ids::{CycleId, ViewDefinitionId};
use types::value_spec::ValueSpecification;
use types::view::CompiledViewDefinition;

/// Identity of one computation cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleMetadata {
    pub cycle_id: CycleId,
    /// The view definition the cycle executes against.
    pub view: ViewDefinitionId,
    pub valuation_time: DateTime<Utc>,
}

/// Which side of the valuation body a fragment marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FragmentPhase {
    /// Emitted after `cycle_started`, before the valuation body.
    PreValuation,
    /// Emitted after the valuation body, before the completion event.
    PostValuation,
}

/// A progress marker within one cycle. Exactly two are emitted per
/// executed cycle, one per phase; consumers count them for progress
/// granularity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleFragment {
    pub metadata: CycleMetadata,
    pub phase: FragmentPhase,
}

/// The outcome of one successfully executed cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleResult {
    pub metadata: CycleMetadata,
    /// Computed values keyed by the specification that requested them.
    pub values: BTreeMap<ValueSpecification, Decimal>,
    /// Wall time the valuation body took.
    pub duration: Duration,
}

/// Upward callbacks a worker emits to its owner.
pub trait ViewProcessWorkerContext: Send + Sync {
    /// A view definition was (re)compiled; precedes the first cycle that
    /// uses the compilation. `data_provider` names the market-data source
    /// the compilation was resolved against.
    fn view_definition_compiled(&self, data_provider: &str, compiled: &CompiledViewDefinition);

    /// Compilation failed; the worker keeps its previous compilation if
    /// one exists.
    fn view_definition_compilation_failed(&self, at: DateTime<Utc>, error: CompilationError);

    fn cycle_started(&self, metadata: &CycleMetadata);

    fn cycle_fragment_completed(&self, fragment: &CycleFragment);

    fn cycle_completed(&self, result: &CycleResult);

    /// A single cycle's valuation failed; the worker continues with the
    /// next cycle.
    fn cycle_execution_failed(
        &self,
        options: &ViewCycleExecutionOptions,
        error: CycleExecutionError,
    );

    /// The worker has stopped, after exhaustion or termination. Emitted
    /// exactly once; no further events follow it.
    fn worker_completed(&self);
}

/// An owned worker event, for contexts that stage events instead of
/// handling them immediately (the parallel-recompilation coordinator
/// buffers a not-yet-promoted worker's events this way).
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    ViewDefinitionCompiled {
        data_provider: String,
        compiled: CompiledViewDefinition,
    },
    ViewDefinitionCompilationFailed {
        at: DateTime<Utc>,
        error: CompilationError,
    },
    CycleStarted(CycleMetadata),
    CycleFragmentCompleted(CycleFragment),
    CycleCompleted(CycleResult),
    CycleExecutionFailed {
        options: ViewCycleExecutionOptions,
        error: CycleExecutionError,
    },
    WorkerCompleted,
}

impl WorkerEvent {
    /// Replay this event into a context.
    pub fn dispatch(&self, context: &dyn ViewProcessWorkerContext) {
        match self {
            WorkerEvent::ViewDefinitionCompiled {
                data_provider,
                compiled,
            } => context.view_definition_compiled(data_provider, compiled),
            WorkerEvent::ViewDefinitionCompilationFailed { at, error } => {
                context.view_definition_compilation_failed(*at, error.clone())
            }
            WorkerEvent::CycleStarted(metadata) => context.cycle_started(metadata),
            WorkerEvent::CycleFragmentCompleted(fragment) => {
                context.cycle_fragment_completed(fragment)
            }
            WorkerEvent::CycleCompleted(result) => context.cycle_completed(result),
            WorkerEvent::CycleExecutionFailed { options, error } => {
                context.cycle_execution_failed(options, error.clone())
            }
            WorkerEvent::WorkerCompleted => context.worker_completed(),
        }
    }

    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            WorkerEvent::ViewDefinitionCompiled { .. } => "ViewDefinitionCompiled",
            WorkerEvent::ViewDefinitionCompilationFailed { .. } => {
                "ViewDefinitionCompilationFailed"
            }
            WorkerEvent::CycleStarted(_) => "CycleStarted",
            WorkerEvent::CycleFragmentCompleted(_) => "CycleFragmentCompleted",
            WorkerEvent::CycleCompleted(_) => "CycleCompleted",
            WorkerEvent::CycleExecutionFailed { .. } => "CycleExecutionFailed",
            WorkerEvent::WorkerCompleted => "WorkerCompleted",
        }
    }
}
