//! Parallel-recompilation coordinator
//!
//! `ParallelRecompilationViewProcessWorker` keeps one primary delegate
//! running while an updated view definition compiles on a speculative
//! secondary delegate. Promotion retires the primary and moves the
//! secondary into its place; how eagerly that happens is the compilation
//! mode chosen at start.
//!
//! A not-yet-promoted secondary is invisible to the owning context: its
//! events are buffered by its slot adapter and flushed at promotion.
//! Events the promoted worker emits while the flush is still draining are
//! appended behind the backlog, so old-primary events and buffered events
//! always precede the promoted worker's live events.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use types::errors::{CompilationError, CycleExecutionError, WorkerError};
use types::execution::{
    ParallelCompilationMode, ViewCycleExecutionOptions, ViewExecutionOptions,
};
use types::view::{CompiledViewDefinition, ViewDefinition};

use crate::context::{
    CycleFragment, CycleMetadata, CycleResult, ViewProcessWorkerContext, WorkerEvent,
};
use crate::worker::{ExecutionSequenceSource, ViewProcessWorker, ViewProcessWorkerFactory};

/// One delegate slot. The worker is filled in after creation so events the
/// delegate emits during its own construction still find the slot.
struct Slot {
    id: u64,
    worker: Option<Arc<dyn ViewProcessWorker>>,
    adapter: Arc<SlotContext>,
}

struct ParallelState {
    mode: ParallelCompilationMode,
    options: Option<ViewExecutionOptions>,
    primary: Option<Slot>,
    secondary: Option<Slot>,
    pending_view: Option<ViewDefinition>,
    /// Slot id owed a promotion trigger once its worker is filled in.
    pending_trigger: Option<u64>,
    next_slot: u64,
    started: bool,
    terminated: bool,
    /// Exactly-once guard for the outer `worker_completed`.
    completing: bool,
}

struct ParallelInner {
    factory: Arc<dyn ViewProcessWorkerFactory>,
    sequences: Arc<dyn ExecutionSequenceSource>,
    context: Arc<dyn ViewProcessWorkerContext>,
    state: Mutex<ParallelState>,
    changed: Condvar,
}

/// What a slot event decided under the lock, executed after release.
enum Staged {
    Emit(Vec<WorkerEvent>),
    /// Drain a promoted slot's backlog, then release it to live dispatch.
    Flush { id: u64, adapter: Arc<SlotContext> },
    Terminate(Arc<dyn ViewProcessWorker>),
    Trigger(Arc<dyn ViewProcessWorker>),
    OuterCompleted,
}

#[derive(Clone, Copy)]
enum SlotKind {
    Primary,
    Secondary,
}

impl ParallelInner {
    fn lock_state(&self) -> MutexGuard<'_, ParallelState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn execute(&self, staged: Vec<Staged>) {
        for action in staged {
            match action {
                Staged::Emit(events) => {
                    for event in events {
                        event.dispatch(self.context.as_ref());
                    }
                }
                Staged::Flush { id, adapter } => {
                    // The promoted worker may keep emitting while this
                    // drains; held events are replayed here until the
                    // buffer settles empty and the adapter goes live.
                    let mut completed = false;
                    loop {
                        let batch = adapter.drain_or_release();
                        if batch.is_empty() {
                            break;
                        }
                        for event in batch {
                            match event {
                                WorkerEvent::WorkerCompleted => completed = true,
                                event => event.dispatch(self.context.as_ref()),
                            }
                        }
                    }
                    if completed {
                        self.on_slot_event(id, WorkerEvent::WorkerCompleted);
                    }
                }
                Staged::Terminate(worker) => worker.terminate(),
                Staged::Trigger(worker) => {
                    worker.trigger_cycle();
                }
                Staged::OuterCompleted => self.context.worker_completed(),
            }
        }
    }

    /// Move the secondary into the primary slot. Caller holds the lock.
    fn promote_locked(&self, state: &mut ParallelState, staged: &mut Vec<Staged>) {
        if let Some(old) = state.primary.take() {
            if let Some(worker) = old.worker {
                staged.push(Staged::Terminate(worker));
            }
        }
        if let Some(next) = state.secondary.take() {
            debug!(slot = next.id, "Promoting secondary worker");
            staged.push(Staged::Flush {
                id: next.id,
                adapter: Arc::clone(&next.adapter),
            });
            if state.mode == ParallelCompilationMode::DeferredExecution {
                match &next.worker {
                    Some(worker) => staged.push(Staged::Trigger(Arc::clone(worker))),
                    // Promoted mid-construction; trigger once filled in.
                    None => state.pending_trigger = Some(next.id),
                }
            }
            state.primary = Some(next);
        }
        self.changed.notify_all();
    }

    /// Emit the single outer completion when both slots have emptied.
    fn maybe_complete_locked(&self, state: &mut ParallelState, staged: &mut Vec<Staged>) {
        if state.started
            && state.primary.is_none()
            && state.secondary.is_none()
            && !state.completing
        {
            state.completing = true;
            staged.push(Staged::OuterCompleted);
        }
        self.changed.notify_all();
    }

    fn on_slot_event(&self, id: u64, event: WorkerEvent) {
        enum Role {
            Primary,
            Secondary,
            Stale,
        }

        let mut staged = Vec::new();
        {
            let mut state = self.lock_state();
            let role = if state.primary.as_ref().is_some_and(|slot| slot.id == id) {
                Role::Primary
            } else if state.secondary.as_ref().is_some_and(|slot| slot.id == id) {
                Role::Secondary
            } else {
                Role::Stale
            };

            match role {
                Role::Stale => {}
                Role::Primary => {
                    // A promoted slot still draining its backlog holds the
                    // event; the flushing thread replays it in order.
                    let passed = match state.primary.as_ref() {
                        Some(slot) => slot.adapter.hold_or_pass(event),
                        None => Some(event),
                    };
                    match passed {
                        None => {}
                        Some(WorkerEvent::WorkerCompleted) => {
                            state.primary = None;
                            if !state.terminated && state.secondary.is_some() {
                                self.promote_locked(&mut state, &mut staged);
                            } else {
                                self.maybe_complete_locked(&mut state, &mut staged);
                            }
                        }
                        Some(event) => staged.push(Staged::Emit(vec![event])),
                    }
                }
                Role::Secondary => match event {
                    WorkerEvent::WorkerCompleted => {
                        state.secondary = None;
                        self.maybe_complete_locked(&mut state, &mut staged);
                    }
                    event => {
                        let immediate = state.mode
                            == ParallelCompilationMode::ImmediateExecution
                            && matches!(event, WorkerEvent::ViewDefinitionCompiled { .. });
                        if let Some(slot) = state.secondary.as_ref() {
                            slot.adapter.buffer(event);
                        }
                        if immediate && !state.terminated {
                            self.promote_locked(&mut state, &mut staged);
                        }
                    }
                },
            }
        }
        self.execute(staged);
    }

    /// Create a delegate in the given slot; the slot is registered before
    /// the factory call so no early event is lost.
    fn spawn_slot(
        self: &Arc<Self>,
        kind: SlotKind,
        options: ViewExecutionOptions,
        view: ViewDefinition,
    ) {
        let (adapter, id) = {
            let mut state = self.lock_state();
            let id = state.next_slot;
            state.next_slot += 1;
            let adapter = Arc::new(SlotContext {
                inner: Arc::downgrade(self),
                id,
                buffer: Mutex::new(EventBuffer {
                    holding: matches!(kind, SlotKind::Secondary),
                    events: Vec::new(),
                }),
            });
            let slot = Slot {
                id,
                worker: None,
                adapter: Arc::clone(&adapter),
            };
            match kind {
                SlotKind::Primary => state.primary = Some(slot),
                SlotKind::Secondary => state.secondary = Some(slot),
            }
            (adapter, id)
        };

        let sequence = self.sequences.sequence();
        let worker = self.factory.create_worker(adapter, options, sequence, view);

        let trigger_now = {
            let mut state = self.lock_state();
            if state.terminated {
                drop(state);
                worker.terminate();
                return;
            }
            let slots = &mut *state;
            let mut placed = false;
            for slot in [slots.primary.as_mut(), slots.secondary.as_mut()]
                .into_iter()
                .flatten()
            {
                if slot.id == id {
                    slot.worker = Some(Arc::clone(&worker));
                    placed = true;
                }
            }
            if !placed {
                drop(state);
                worker.terminate();
                return;
            }
            if state.pending_trigger == Some(id) {
                state.pending_trigger = None;
                true
            } else {
                false
            }
        };
        if trigger_now {
            worker.trigger_cycle();
        }
    }

    fn primary_worker(&self) -> Option<Arc<dyn ViewProcessWorker>> {
        self.lock_state()
            .primary
            .as_ref()
            .and_then(|slot| slot.worker.clone())
    }
}

/// Held events of a slot that is not (or not yet fully) promoted.
struct EventBuffer {
    /// While set, events append here instead of dispatching.
    holding: bool,
    events: Vec<WorkerEvent>,
}

/// Buffers or routes one delegate's events depending on its slot's role.
struct SlotContext {
    inner: Weak<ParallelInner>,
    id: u64,
    buffer: Mutex<EventBuffer>,
}

impl SlotContext {
    fn handle(&self, event: WorkerEvent) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_slot_event(self.id, event);
        }
    }

    fn lock_buffer(&self) -> MutexGuard<'_, EventBuffer> {
        self.buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn buffer(&self, event: WorkerEvent) {
        self.lock_buffer().events.push(event);
    }

    /// Hold the event if the backlog is still draining, otherwise hand it
    /// back for immediate dispatch. Atomic with the flush's release.
    fn hold_or_pass(&self, event: WorkerEvent) -> Option<WorkerEvent> {
        let mut buffer = self.lock_buffer();
        if buffer.holding {
            buffer.events.push(event);
            None
        } else {
            Some(event)
        }
    }

    /// Take the held events; an empty take releases the adapter to live
    /// dispatch.
    fn drain_or_release(&self) -> Vec<WorkerEvent> {
        let mut buffer = self.lock_buffer();
        if buffer.events.is_empty() {
            buffer.holding = false;
            Vec::new()
        } else {
            std::mem::take(&mut buffer.events)
        }
    }
}

impl ViewProcessWorkerContext for SlotContext {
    fn view_definition_compiled(&self, data_provider: &str, compiled: &CompiledViewDefinition) {
        self.handle(WorkerEvent::ViewDefinitionCompiled {
            data_provider: data_provider.to_string(),
            compiled: compiled.clone(),
        });
    }

    fn view_definition_compilation_failed(&self, at: DateTime<Utc>, error: CompilationError) {
        self.handle(WorkerEvent::ViewDefinitionCompilationFailed { at, error });
    }

    fn cycle_started(&self, metadata: &CycleMetadata) {
        self.handle(WorkerEvent::CycleStarted(metadata.clone()));
    }

    fn cycle_fragment_completed(&self, fragment: &CycleFragment) {
        self.handle(WorkerEvent::CycleFragmentCompleted(fragment.clone()));
    }

    fn cycle_completed(&self, result: &CycleResult) {
        self.handle(WorkerEvent::CycleCompleted(result.clone()));
    }

    fn cycle_execution_failed(
        &self,
        options: &ViewCycleExecutionOptions,
        error: CycleExecutionError,
    ) {
        self.handle(WorkerEvent::CycleExecutionFailed {
            options: options.clone(),
            error,
        });
    }

    fn worker_completed(&self) {
        self.handle(WorkerEvent::WorkerCompleted);
    }
}

/// Decorator worker that recompiles updated view definitions on a
/// speculative secondary delegate.
pub struct ParallelRecompilationViewProcessWorker {
    inner: Arc<ParallelInner>,
}

impl ParallelRecompilationViewProcessWorker {
    pub fn new(
        factory: Arc<dyn ViewProcessWorkerFactory>,
        sequences: Arc<dyn ExecutionSequenceSource>,
        context: Arc<dyn ViewProcessWorkerContext>,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(ParallelInner {
                factory,
                sequences,
                context,
                state: Mutex::new(ParallelState {
                    mode: ParallelCompilationMode::ParallelExecution,
                    options: None,
                    primary: None,
                    secondary: None,
                    pending_view: None,
                    pending_trigger: None,
                    next_slot: 0,
                    started: false,
                    terminated: false,
                    completing: false,
                }),
                changed: Condvar::new(),
            }),
        })
    }

    /// Start in the mode carried by `options.parallel_compilation`.
    /// `None` runs secondaries concurrently, same as `start_parallel`.
    pub fn start(
        &self,
        options: ViewExecutionOptions,
        view: ViewDefinition,
    ) -> Result<(), WorkerError> {
        let mode = match options.parallel_compilation {
            ParallelCompilationMode::None => ParallelCompilationMode::ParallelExecution,
            mode => mode,
        };
        self.start_with_mode(mode, options, view)
    }

    /// Start with concurrently executing secondaries.
    pub fn start_parallel(
        &self,
        options: ViewExecutionOptions,
        view: ViewDefinition,
    ) -> Result<(), WorkerError> {
        self.start_with_mode(ParallelCompilationMode::ParallelExecution, options, view)
    }

    /// Start with secondaries promoted as soon as they compile.
    pub fn start_immediate(
        &self,
        options: ViewExecutionOptions,
        view: ViewDefinition,
    ) -> Result<(), WorkerError> {
        self.start_with_mode(ParallelCompilationMode::ImmediateExecution, options, view)
    }

    /// Start with secondaries that compile but hold their first cycle
    /// until promotion.
    pub fn start_deferred(
        &self,
        options: ViewExecutionOptions,
        view: ViewDefinition,
    ) -> Result<(), WorkerError> {
        self.start_with_mode(ParallelCompilationMode::DeferredExecution, options, view)
    }

    fn start_with_mode(
        &self,
        mode: ParallelCompilationMode,
        options: ViewExecutionOptions,
        view: ViewDefinition,
    ) -> Result<(), WorkerError> {
        let view = {
            let mut state = self.inner.lock_state();
            if state.terminated {
                return Err(WorkerError::Terminated);
            }
            if state.started {
                return Err(WorkerError::illegal_state("worker already started"));
            }
            state.started = true;
            state.mode = mode;
            state.options = Some(options.clone());
            state.pending_view.take().unwrap_or(view)
        };
        info!(mode = ?mode, view = %view.id, "Starting parallel-recompilation worker");
        self.inner.spawn_slot(SlotKind::Primary, options, view);
        Ok(())
    }

    /// The currently promoted delegate, if any.
    pub fn get_primary(&self) -> Option<Arc<dyn ViewProcessWorker>> {
        self.inner.primary_worker()
    }

    /// The speculative delegate, if any.
    pub fn get_secondary(&self) -> Option<Arc<dyn ViewProcessWorker>> {
        self.inner
            .lock_state()
            .secondary
            .as_ref()
            .and_then(|slot| slot.worker.clone())
    }
}

impl ViewProcessWorker for ParallelRecompilationViewProcessWorker {
    fn trigger_cycle(&self) -> bool {
        // One promotion retry: a refusal with a secondary present means
        // the primary's sequence is spent and the secondary takes over.
        for _attempt in 0..2 {
            let Some(worker) = self.inner.primary_worker() else {
                return false;
            };
            if worker.trigger_cycle() {
                return true;
            }
            let staged = {
                let mut state = self.inner.lock_state();
                let unchanged = state
                    .primary
                    .as_ref()
                    .and_then(|slot| slot.worker.as_ref())
                    .is_some_and(|current| Arc::ptr_eq(current, &worker));
                if unchanged && !state.terminated && state.secondary.is_some() {
                    let mut staged = Vec::new();
                    self.inner.promote_locked(&mut state, &mut staged);
                    Some(staged)
                } else {
                    None
                }
            };
            match staged {
                Some(staged) => self.inner.execute(staged),
                None => return false,
            }
        }
        false
    }

    fn request_cycle(&self) -> bool {
        self.trigger_cycle()
    }

    fn update_view_definition(&self, view: ViewDefinition) {
        enum Action {
            Remembered,
            StartSecondary {
                options: ViewExecutionOptions,
                old: Option<Arc<dyn ViewProcessWorker>>,
            },
        }

        let action = {
            let mut state = self.inner.lock_state();
            if state.terminated {
                return;
            }
            if !state.started || state.primary.is_none() {
                state.pending_view = Some(view.clone());
                Action::Remembered
            } else {
                let old = state.secondary.take().and_then(|slot| slot.worker);
                let base = state.options.clone().unwrap_or_default();
                let options = match state.mode {
                    ParallelCompilationMode::DeferredExecution => {
                        base.with_flags(base.flags.with_wait_for_initial_trigger(true))
                    }
                    _ => base,
                };
                Action::StartSecondary { options, old }
            }
        };

        match action {
            Action::Remembered => {}
            Action::StartSecondary { options, old } => {
                if let Some(old) = old {
                    debug!("Replacing speculative worker with newer view definition");
                    old.terminate();
                }
                self.inner.spawn_slot(SlotKind::Secondary, options, view);
            }
        }
    }

    fn terminate(&self) {
        let workers = {
            let mut state = self.inner.lock_state();
            if state.terminated {
                return;
            }
            state.terminated = true;
            self.inner.changed.notify_all();
            let mut workers = Vec::new();
            if let Some(slot) = &state.primary {
                workers.extend(slot.worker.clone());
            }
            if let Some(slot) = &state.secondary {
                workers.extend(slot.worker.clone());
            }
            workers
        };
        info!(delegates = workers.len(), "Terminating parallel-recompilation worker");
        for worker in workers {
            worker.terminate();
        }
    }

    fn join(&self) {
        let mut state = self.inner.lock_state();
        while state.primary.is_some() || state.secondary.is_some() {
            state = self
                .inner
                .changed
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    fn join_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.lock_state();
        while state.primary.is_some() || state.secondary.is_some() {
            let Some(remaining) = deadline
                .checked_duration_since(Instant::now())
                .filter(|d| !d.is_zero())
            else {
                return false;
            };
            let (next, _timeout) = self
                .inner
                .changed
                .wait_timeout(state, remaining)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state = next;
        }
        true
    }

    fn is_terminated(&self) -> bool {
        let state = self.inner.lock_state();
        state.primary.is_none() && state.secondary.is_none()
    }

    fn force_graph_rebuild(&self) {
        if let Some(worker) = self.inner.primary_worker() {
            worker.force_graph_rebuild();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use types::execution::ExecutionFlags;
    use types::sequence::{ArbitraryViewCycleExecutionSequence, ViewCycleExecutionSequence};

    use crate::testing::{CountingContext, StubFactory};

    struct FixedLengthSequences {
        length: usize,
    }

    impl ExecutionSequenceSource for FixedLengthSequences {
        fn sequence(&self) -> Box<dyn ViewCycleExecutionSequence> {
            Box::new(ArbitraryViewCycleExecutionSequence::of_length(self.length))
        }
    }

    fn options() -> ViewExecutionOptions {
        ViewExecutionOptions::new(ExecutionFlags::default())
    }

    fn coordinator(
        length: usize,
    ) -> (
        Arc<ParallelRecompilationViewProcessWorker>,
        Arc<StubFactory>,
        Arc<CountingContext>,
    ) {
        let factory = Arc::new(StubFactory::default());
        let context = Arc::new(CountingContext::default());
        let worker = ParallelRecompilationViewProcessWorker::new(
            Arc::clone(&factory) as _,
            Arc::new(FixedLengthSequences { length }) as _,
            Arc::clone(&context) as _,
        );
        (worker, factory, context)
    }

    #[test]
    fn test_second_start_is_an_illegal_state() {
        let (worker, _, _) = coordinator(4);
        let view = ViewDefinition::new("v");
        assert!(worker.start_parallel(options(), view.clone()).is_ok());
        let err = worker.start_parallel(options(), view).unwrap_err();
        assert!(matches!(err, WorkerError::IllegalState { .. }));
    }

    #[test]
    fn test_start_after_terminate_is_refused() {
        let (worker, _, _) = coordinator(4);
        worker.terminate();
        let err = worker
            .start_parallel(options(), ViewDefinition::new("v"))
            .unwrap_err();
        assert_eq!(err, WorkerError::Terminated);
    }

    #[test]
    fn test_update_before_start_is_remembered() {
        let (worker, factory, _) = coordinator(4);
        worker.update_view_definition(ViewDefinition::new("remembered"));
        worker
            .start_parallel(options(), ViewDefinition::new("original"))
            .unwrap();
        assert_eq!(factory.created()[0].view().name, "remembered");
    }

    #[test]
    fn test_update_starts_and_replaces_secondary() {
        let (worker, factory, _) = coordinator(4);
        worker
            .start_parallel(options(), ViewDefinition::new("v1"))
            .unwrap();
        worker.update_view_definition(ViewDefinition::new("v2"));
        assert!(worker.get_secondary().is_some());

        worker.update_view_definition(ViewDefinition::new("v3"));
        let delegates = factory.created();
        assert_eq!(delegates.len(), 3);
        assert!(delegates[1].is_terminated(), "replaced secondary terminated");
        assert_eq!(delegates[2].view().name, "v3");
        assert!(!delegates[2].is_terminated());
    }

    #[test]
    fn test_secondary_events_are_buffered_until_promotion() {
        let (worker, factory, context) = coordinator(2);
        worker
            .start_parallel(options(), ViewDefinition::new("v1"))
            .unwrap();
        worker.update_view_definition(ViewDefinition::new("v2"));

        factory.created()[1].emit_compiled("live");
        assert_eq!(
            context.labels(),
            Vec::<&str>::new(),
            "secondary compilation stays invisible before promotion"
        );

        factory.created()[0].run_to_completion();
        assert_eq!(context.labels(), vec!["ViewDefinitionCompiled"]);
        assert!(worker.get_secondary().is_none());
        assert!(worker.get_primary().is_some());
    }

    #[test]
    fn test_immediate_mode_promotes_on_compilation() {
        let (worker, factory, context) = coordinator(2);
        worker
            .start_immediate(options(), ViewDefinition::new("v1"))
            .unwrap();
        worker.update_view_definition(ViewDefinition::new("v2"));

        factory.created()[1].emit_compiled("live");
        assert_eq!(context.labels(), vec!["ViewDefinitionCompiled"]);
        assert!(
            factory.created()[0].is_terminated(),
            "old primary torn down at promotion"
        );
        assert!(worker.get_secondary().is_none());
    }

    #[test]
    fn test_deferred_mode_triggers_at_promotion() {
        let (worker, factory, _context) = coordinator(2);
        worker
            .start_deferred(options(), ViewDefinition::new("v1"))
            .unwrap();
        worker.update_view_definition(ViewDefinition::new("v2"));

        let secondary = factory.created()[1].clone();
        assert!(
            secondary.options().flags.wait_for_initial_trigger,
            "deferred secondary gates its first cycle"
        );
        assert_eq!(secondary.trigger_count(), 0);

        factory.created()[0].run_to_completion();
        assert_eq!(
            secondary.trigger_count(),
            1,
            "promotion issues the held-back trigger"
        );
    }

    #[test]
    fn test_completion_without_secondary_completes_coordinator() {
        let (worker, factory, context) = coordinator(1);
        worker
            .start_parallel(options(), ViewDefinition::new("v1"))
            .unwrap();
        factory.created()[0].run_to_completion();

        assert!(worker.is_terminated());
        assert_eq!(context.completions(), 1);
        assert!(!worker.trigger_cycle());
        worker.join();
    }

    #[test]
    fn test_join_without_start_returns_immediately() {
        let (worker, _, _) = coordinator(1);
        worker.join();
        assert!(worker.join_timeout(Duration::from_millis(1)));
        assert!(worker.is_terminated());
    }

    #[test]
    fn test_start_takes_mode_from_execution_options() {
        let (worker, factory, context) = coordinator(2);
        let options = options().with_parallel_compilation(
            ParallelCompilationMode::ImmediateExecution,
        );
        worker.start(options, ViewDefinition::new("v1")).unwrap();
        worker.update_view_definition(ViewDefinition::new("v2"));

        factory.created()[1].emit_compiled("live");
        assert_eq!(
            context.labels(),
            vec!["ViewDefinitionCompiled"],
            "options-borne immediate mode promotes on compilation"
        );
        assert!(factory.created()[0].is_terminated());
    }

    #[derive(Default)]
    struct GateLatch {
        reached: bool,
        released: bool,
    }

    /// Records events like `CountingContext`, but parks inside the
    /// dispatch of the compilation labelled "live" until released, so a
    /// test can interleave work while a flush is mid-dispatch.
    #[derive(Default)]
    struct GatedContext {
        events: Mutex<Vec<WorkerEvent>>,
        gate: Mutex<GateLatch>,
        changed: Condvar,
    }

    impl GatedContext {
        fn push(&self, event: WorkerEvent) {
            self.events.lock().unwrap().push(event);
        }

        fn providers(&self) -> Vec<String> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|event| match event {
                    WorkerEvent::ViewDefinitionCompiled { data_provider, .. } => {
                        Some(data_provider.clone())
                    }
                    _ => None,
                })
                .collect()
        }

        fn wait_reached(&self) {
            let mut latch = self.gate.lock().unwrap();
            while !latch.reached {
                latch = self.changed.wait(latch).unwrap();
            }
        }

        fn release(&self) {
            let mut latch = self.gate.lock().unwrap();
            latch.released = true;
            self.changed.notify_all();
        }
    }

    impl ViewProcessWorkerContext for GatedContext {
        fn view_definition_compiled(
            &self,
            data_provider: &str,
            compiled: &CompiledViewDefinition,
        ) {
            self.push(WorkerEvent::ViewDefinitionCompiled {
                data_provider: data_provider.to_string(),
                compiled: compiled.clone(),
            });
            if data_provider == "live" {
                let mut latch = self.gate.lock().unwrap();
                latch.reached = true;
                self.changed.notify_all();
                while !latch.released {
                    latch = self.changed.wait(latch).unwrap();
                }
            }
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

    #[test]
    fn test_flush_holds_fresh_primary_events_behind_the_backlog() {
        let factory = Arc::new(StubFactory::default());
        let context = Arc::new(GatedContext::default());
        let worker = ParallelRecompilationViewProcessWorker::new(
            Arc::clone(&factory) as _,
            Arc::new(FixedLengthSequences { length: 2 }) as _,
            Arc::clone(&context) as _,
        );
        worker
            .start_parallel(options(), ViewDefinition::new("v1"))
            .unwrap();
        worker.update_view_definition(ViewDefinition::new("v2"));
        factory.created()[1].emit_compiled("live");

        let old_primary = factory.created()[0].clone();
        let flusher = std::thread::spawn(move || old_primary.run_to_completion());

        // The flush is parked inside its first dispatch; an event the
        // promoted worker emits now must not overtake the backlog.
        context.wait_reached();
        factory.created()[1].emit_compiled("fresh");
        assert_eq!(context.providers(), ["live"]);

        context.release();
        flusher.join().unwrap();
        assert_eq!(context.providers(), ["live", "fresh"]);
    }
}
