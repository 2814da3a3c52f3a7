//! Hand-rolled test doubles for the coordinator suites
//!
//! The partitioning and recompilation coordinators are exercised against a
//! controllable delegate worker instead of the threaded leaf worker, so
//! the tests drive chain advancement and promotion deterministically. The
//! doubles live here (not under `#[cfg(test)]`) so the integration suite
//! can share them.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use types::errors::{CompilationError, CycleExecutionError};
use types::execution::{ViewCycleExecutionOptions, ViewExecutionOptions};
use types::sequence::{SequenceEstimate, ViewCycleExecutionSequence};
use types::view::{CompiledViewDefinition, ViewDefinition};

use crate::context::{
    CycleFragment, CycleMetadata, CycleResult, ViewProcessWorkerContext, WorkerEvent,
};
use crate::worker::{ViewProcessWorker, ViewProcessWorkerFactory};

struct StubState {
    sequence: Box<dyn ViewCycleExecutionSequence>,
    completed: bool,
    last_view_update: Option<ViewDefinition>,
    rebuilds: usize,
    triggers: usize,
}

/// A delegate worker that only moves when the test tells it to.
///
/// `trigger_cycle`/`request_cycle` consume one sequence element and report
/// whether one was available; `run_to_completion` drains the sequence and
/// emits `worker_completed`, as the real worker does on exhaustion.
pub struct StubWorker {
    context: Arc<dyn ViewProcessWorkerContext>,
    options: ViewExecutionOptions,
    estimate_at_creation: SequenceEstimate,
    view: ViewDefinition,
    state: Mutex<StubState>,
}

impl StubWorker {
    fn new(
        context: Arc<dyn ViewProcessWorkerContext>,
        options: ViewExecutionOptions,
        sequence: Box<dyn ViewCycleExecutionSequence>,
        view: ViewDefinition,
    ) -> Self {
        let estimate_at_creation = sequence.estimate_remaining();
        Self {
            context,
            options,
            estimate_at_creation,
            view,
            state: Mutex::new(StubState {
                sequence,
                completed: false,
                last_view_update: None,
                rebuilds: 0,
                triggers: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StubState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sequence estimate observed when the delegate was created.
    pub fn estimate_at_creation(&self) -> SequenceEstimate {
        self.estimate_at_creation
    }

    /// Execution options the delegate was created with.
    pub fn options(&self) -> ViewExecutionOptions {
        self.options.clone()
    }

    /// View definition the delegate was created with.
    pub fn view(&self) -> ViewDefinition {
        self.view.clone()
    }

    /// Most recent `update_view_definition` payload, if any.
    pub fn last_view_update(&self) -> Option<ViewDefinition> {
        self.lock().last_view_update.clone()
    }

    pub fn rebuild_count(&self) -> usize {
        self.lock().rebuilds
    }

    pub fn trigger_count(&self) -> usize {
        self.lock().triggers
    }

    /// Drain the remaining sequence and report completion upward, once.
    pub fn run_to_completion(&self) {
        loop {
            let polled = {
                let mut state = self.lock();
                if state.completed {
                    return;
                }
                state.sequence.poll(&ViewCycleExecutionOptions::default())
            };
            if polled.is_none() {
                break;
            }
        }
        self.finish();
    }

    fn finish(&self) {
        let first = {
            let mut state = self.lock();
            if state.completed {
                false
            } else {
                state.completed = true;
                true
            }
        };
        if first {
            self.context.worker_completed();
        }
    }

    /// Report a compilation upward, as the real worker does before its
    /// first cycle.
    pub fn emit_compiled(&self, data_provider: &str) {
        let compiled = CompiledViewDefinition {
            view: self.view.clone(),
            valuation_time: Utc::now(),
            market_data_requirements: self.view.requirements.clone(),
            compiled_at: Utc::now(),
            valid_from: None,
            valid_to: None,
        };
        self.context.view_definition_compiled(data_provider, &compiled);
    }
}

impl ViewProcessWorker for StubWorker {
    fn trigger_cycle(&self) -> bool {
        let mut state = self.lock();
        if state.completed {
            return false;
        }
        state.triggers += 1;
        state
            .sequence
            .poll(&ViewCycleExecutionOptions::default())
            .is_some()
    }

    fn request_cycle(&self) -> bool {
        self.trigger_cycle()
    }

    fn update_view_definition(&self, view: ViewDefinition) {
        self.lock().last_view_update = Some(view);
    }

    fn terminate(&self) {
        self.finish();
    }

    fn join(&self) {}

    fn join_timeout(&self, _timeout: Duration) -> bool {
        self.lock().completed
    }

    fn is_terminated(&self) -> bool {
        self.lock().completed
    }

    fn force_graph_rebuild(&self) {
        self.lock().rebuilds += 1;
    }
}

/// Factory that records every delegate it creates.
#[derive(Default)]
pub struct StubFactory {
    created: Mutex<Vec<Arc<StubWorker>>>,
}

impl StubFactory {
    /// All delegates created so far, in creation order.
    pub fn created(&self) -> Vec<Arc<StubWorker>> {
        self.created
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl ViewProcessWorkerFactory for StubFactory {
    fn create_worker(
        &self,
        context: Arc<dyn ViewProcessWorkerContext>,
        execution_options: ViewExecutionOptions,
        sequence: Box<dyn ViewCycleExecutionSequence>,
        view: ViewDefinition,
    ) -> Arc<dyn ViewProcessWorker> {
        let worker = Arc::new(StubWorker::new(context, execution_options, sequence, view));
        self.created
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Arc::clone(&worker));
        worker
    }
}

/// Context that records every event it receives, in order.
#[derive(Default)]
pub struct CountingContext {
    events: Mutex<Vec<WorkerEvent>>,
}

impl CountingContext {
    pub fn events(&self) -> Vec<WorkerEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn labels(&self) -> Vec<&'static str> {
        self.events().iter().map(|event| event.label()).collect()
    }

    /// Number of `worker_completed` events received.
    pub fn completions(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, WorkerEvent::WorkerCompleted))
            .count()
    }

    fn push(&self, event: WorkerEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }
}

impl ViewProcessWorkerContext for CountingContext {
    fn view_definition_compiled(&self, data_provider: &str, compiled: &CompiledViewDefinition) {
        self.push(WorkerEvent::ViewDefinitionCompiled {
            data_provider: data_provider.to_string(),
            compiled: compiled.clone(),
        });
    }

    fn view_definition_compilation_failed(&self, at: DateTime<Utc>, error: CompilationError) {
        self.push(WorkerEvent::ViewDefinitionCompilationFailed { at, error });
    }

    fn cycle_started(&self, metadata: &CycleMetadata) {
        self.push(WorkerEvent::CycleStarted(metadata.clone()));
    }

    fn cycle_fragment_completed(&self, fragment: &CycleFragment) {
        self.push(WorkerEvent::CycleFragmentCompleted(fragment.clone()));
    }

    fn cycle_completed(&self, result: &CycleResult) {
        self.push(WorkerEvent::CycleCompleted(result.clone()));
    }

    fn cycle_execution_failed(
        &self,
        options: &ViewCycleExecutionOptions,
        error: CycleExecutionError,
    ) {
        self.push(WorkerEvent::CycleExecutionFailed {
            options: options.clone(),
            error,
        });
    }

    fn worker_completed(&self) {
        self.push(WorkerEvent::WorkerCompleted);
    }
}
