//! Leaf worker: one dedicated thread running the cycle loop
//!
//! `SingleThreadViewProcessWorker` owns a single execution thread that
//! pulls cycle options from its sequence, keeps a compiled view current,
//! reconciles market-data subscriptions through its `MarketDataManager`,
//! and reports progress upward. The handle object implements
//! `ViewProcessWorker`; all of its methods are safe to call from any
//! thread, including after termination.
//!
//! Suspension points: the loop parks on a condvar between cycles when
//! triggers gate execution, and timed-parks while awaiting market data. It
//! wakes on trigger/request calls, on live-data notifications, and on
//! `terminate()`.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use market_data::provider::{
    MarketDataListener, MarketDataProviderResolver, MarketDataSnapshot,
};
use market_data::subscriptions::{MarketDataManager, SubscriptionStatus};
use types::execution::ViewExecutionOptions;
use types::ids::CycleId;
use types::sequence::ViewCycleExecutionSequence;
use types::value_spec::ValueSpecification;
use types::view::{CompiledViewDefinition, ViewDefinition};

use crate::context::{
    CycleFragment, CycleMetadata, CycleResult, FragmentPhase, ViewProcessWorkerContext,
};
use crate::worker::{
    CycleExecutor, ViewCompiler, ViewProcessWorker, ViewProcessWorkerFactory,
};

/// Tuning knobs for the leaf worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Timeout handed to `MarketDataSnapshot::init_with`.
    pub market_data_timeout: Duration,
    /// Re-check interval while suspended awaiting market data.
    pub await_poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            market_data_timeout: Duration::from_millis(500),
            await_poll_interval: Duration::from_millis(50),
        }
    }
}

/// Mutable worker state, guarded by the one mutex in `WorkerShared`.
#[derive(Default)]
struct WorkerState {
    terminate_requested: bool,
    /// Thread has exited; `worker_completed` has been emitted.
    completed: bool,
    /// Sequence offered nothing; no further cycles possible.
    exhausted: bool,
    cycle_requested: bool,
    pending_view: Option<ViewDefinition>,
    force_rebuild: bool,
}

/// State shared between the handle and the execution thread.
struct WorkerShared {
    state: Mutex<WorkerState>,
    /// Wakes the cycle loop (triggers, updates, data arrival, terminate).
    wakeup: Condvar,
    /// Completion latch for `join`.
    done: Condvar,
}

enum DataWait {
    Triggered,
    Timeout,
    Terminate,
}

impl WorkerShared {
    fn new() -> Self {
        Self {
            state: Mutex::new(WorkerState::default()),
            wakeup: Condvar::new(),
            done: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn request_cycle(&self) -> bool {
        let mut state = self.lock();
        if state.terminate_requested || state.completed || state.exhausted {
            return false;
        }
        state.cycle_requested = true;
        self.wakeup.notify_all();
        true
    }

    fn update_view(&self, view: ViewDefinition) {
        let mut state = self.lock();
        if state.terminate_requested || state.completed {
            return;
        }
        state.pending_view = Some(view);
        self.wakeup.notify_all();
    }

    fn force_rebuild(&self) {
        let mut state = self.lock();
        if state.terminate_requested || state.completed {
            return;
        }
        state.force_rebuild = true;
        self.wakeup.notify_all();
    }

    fn terminate(&self) {
        let mut state = self.lock();
        state.terminate_requested = true;
        self.wakeup.notify_all();
    }

    fn wake(&self) {
        let _state = self.lock();
        self.wakeup.notify_all();
    }

    fn terminate_requested(&self) -> bool {
        self.lock().terminate_requested
    }

    fn take_updates(&self) -> (Option<ViewDefinition>, bool) {
        let mut state = self.lock();
        let force = state.force_rebuild;
        state.force_rebuild = false;
        (state.pending_view.take(), force)
    }

    fn mark_exhausted(&self) {
        self.lock().exhausted = true;
    }

    fn mark_completed(&self) {
        let mut state = self.lock();
        state.completed = true;
        self.done.notify_all();
    }

    fn is_completed(&self) -> bool {
        self.lock().completed
    }

    /// Park until a cycle is requested, an update arrives, or termination.
    /// Returns false on termination.
    fn wait_for_trigger(&self) -> bool {
        let mut state = self.lock();
        loop {
            if state.terminate_requested {
                return false;
            }
            if state.cycle_requested {
                state.cycle_requested = false;
                return true;
            }
            if state.pending_view.is_some() || state.force_rebuild {
                return true;
            }
            state = self
                .wakeup
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Timed park while awaiting market data.
    fn wait_for_data(&self, interval: Duration) -> DataWait {
        let mut state = self.lock();
        if state.terminate_requested {
            return DataWait::Terminate;
        }
        if state.cycle_requested {
            state.cycle_requested = false;
            return DataWait::Triggered;
        }
        let (mut state, _timeout) = self
            .wakeup
            .wait_timeout(state, interval)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if state.terminate_requested {
            DataWait::Terminate
        } else if state.cycle_requested {
            state.cycle_requested = false;
            DataWait::Triggered
        } else {
            DataWait::Timeout
        }
    }

    fn join(&self) {
        let mut state = self.lock();
        while !state.completed {
            state = self
                .done
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    fn join_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while !state.completed {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()).filter(|d| !d.is_zero()) else {
                return false;
            };
            let (next, _timeout) = self
                .done
                .wait_timeout(state, remaining)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state = next;
        }
        true
    }
}

/// Routes provider notifications into the worker's wakeup machinery.
struct WorkerDataListener {
    shared: Arc<WorkerShared>,
}

impl MarketDataListener for WorkerDataListener {
    fn subscription_state_changed(
        &self,
        _key: &str,
        _old: Option<SubscriptionStatus>,
        _new: SubscriptionStatus,
    ) {
        // Availability may have changed; re-check any data wait.
        self.shared.wake();
    }

    fn values_changed(&self, _specs: &std::collections::BTreeSet<ValueSpecification>) {
        self.shared.request_cycle();
    }
}

/// Snapshot stand-in when no provider is installed: answers nothing.
struct NoDataSnapshot;

impl MarketDataSnapshot for NoDataSnapshot {
    fn init(&self) {}
    fn init_with(&self, _specs: &std::collections::BTreeSet<ValueSpecification>, _t: Duration) {}
    fn query(&self, _spec: &ValueSpecification) -> Option<Decimal> {
        None
    }
    fn snapshot_time(&self) -> Option<chrono::DateTime<Utc>> {
        None
    }
    fn snapshot_time_indication(&self) -> Option<chrono::DateTime<Utc>> {
        None
    }
}

/// The minimal unit of execution: one thread, one view, one sequence.
pub struct SingleThreadViewProcessWorker {
    shared: Arc<WorkerShared>,
    manager: Arc<MarketDataManager>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SingleThreadViewProcessWorker {
    /// Create the worker and start its execution thread immediately.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        context: Arc<dyn ViewProcessWorkerContext>,
        options: ViewExecutionOptions,
        sequence: Box<dyn ViewCycleExecutionSequence>,
        view: ViewDefinition,
        compiler: Arc<dyn ViewCompiler>,
        executor: Arc<dyn CycleExecutor>,
        resolver: Arc<dyn MarketDataProviderResolver>,
        config: WorkerConfig,
    ) -> Arc<Self> {
        let shared = Arc::new(WorkerShared::new());
        let listener = Arc::new(WorkerDataListener {
            shared: Arc::clone(&shared),
        });
        let manager = Arc::new(MarketDataManager::new(listener, resolver));

        let core = WorkerCore {
            shared: Arc::clone(&shared),
            context,
            compiler,
            executor,
            manager: Arc::clone(&manager),
            options,
            config,
        };
        let handle = thread::spawn(move || core.run(sequence, view));

        Arc::new(Self {
            shared,
            manager,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Subscription bookkeeping for this worker's market data.
    pub fn subscriptions(&self) -> &Arc<MarketDataManager> {
        &self.manager
    }

    fn reap_thread(&self) {
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Worker thread panicked");
            }
        }
    }
}

impl ViewProcessWorker for SingleThreadViewProcessWorker {
    fn trigger_cycle(&self) -> bool {
        self.shared.request_cycle()
    }

    fn request_cycle(&self) -> bool {
        self.shared.request_cycle()
    }

    fn update_view_definition(&self, view: ViewDefinition) {
        self.shared.update_view(view);
    }

    fn terminate(&self) {
        self.shared.terminate();
    }

    fn join(&self) {
        self.shared.join();
        self.reap_thread();
    }

    fn join_timeout(&self, timeout: Duration) -> bool {
        if self.shared.join_timeout(timeout) {
            self.reap_thread();
            true
        } else {
            false
        }
    }

    fn is_terminated(&self) -> bool {
        self.shared.is_completed()
    }

    fn force_graph_rebuild(&self) {
        self.shared.force_rebuild();
    }
}

/// Production factory: leaf workers wired to a compiler, an executor, and
/// a provider resolver.
pub struct SingleThreadWorkerFactory {
    compiler: Arc<dyn ViewCompiler>,
    executor: Arc<dyn CycleExecutor>,
    resolver: Arc<dyn MarketDataProviderResolver>,
    config: WorkerConfig,
}

impl SingleThreadWorkerFactory {
    pub fn new(
        compiler: Arc<dyn ViewCompiler>,
        executor: Arc<dyn CycleExecutor>,
        resolver: Arc<dyn MarketDataProviderResolver>,
    ) -> Self {
        Self {
            compiler,
            executor,
            resolver,
            config: WorkerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }
}

impl ViewProcessWorkerFactory for SingleThreadWorkerFactory {
    fn create_worker(
        &self,
        context: Arc<dyn ViewProcessWorkerContext>,
        execution_options: ViewExecutionOptions,
        sequence: Box<dyn ViewCycleExecutionSequence>,
        view: ViewDefinition,
    ) -> Arc<dyn ViewProcessWorker> {
        SingleThreadViewProcessWorker::new(
            context,
            execution_options,
            sequence,
            view,
            Arc::clone(&self.compiler),
            Arc::clone(&self.executor),
            Arc::clone(&self.resolver),
            self.config.clone(),
        )
    }
}

/// Everything the execution thread needs, moved into the thread closure.
struct WorkerCore {
    shared: Arc<WorkerShared>,
    context: Arc<dyn ViewProcessWorkerContext>,
    compiler: Arc<dyn ViewCompiler>,
    executor: Arc<dyn CycleExecutor>,
    manager: Arc<MarketDataManager>,
    options: ViewExecutionOptions,
    config: WorkerConfig,
}

impl WorkerCore {
    fn run(self, mut sequence: Box<dyn ViewCycleExecutionSequence>, mut view: ViewDefinition) {
        let flags = self.options.flags;
        let mut compiled: Option<CompiledViewDefinition> = None;
        let mut last_token: Option<u64> = None;
        let mut first = true;

        'cycles: loop {
            let wait_needed = (first && flags.wait_for_initial_trigger)
                || (!flags.run_as_fast_as_possible && flags.triggers_enabled);
            if wait_needed && !self.shared.wait_for_trigger() {
                break 'cycles;
            }
            if self.shared.terminate_requested() {
                break 'cycles;
            }
            first = false;

            let mut need_recompile = false;
            let (pending_view, force) = self.shared.take_updates();
            if let Some(updated) = pending_view {
                debug!(view = %updated.id, "Applying updated view definition");
                view = updated;
                need_recompile = true;
            }
            if force {
                need_recompile = true;
            }

            let Some(cycle_options) = sequence.poll(&self.options.default_cycle_options) else {
                info!("Execution sequence exhausted");
                self.shared.mark_exhausted();
                break 'cycles;
            };

            if let Some(label) = &cycle_options.market_data_spec {
                self.manager.use_market_data_spec(label);
            }

            // A change in data availability forces recompilation even
            // against the same logical source.
            let token = self.manager.availability_token();
            if token != last_token {
                need_recompile = need_recompile || last_token.is_some() || token.is_some();
                last_token = token;
            }

            let valuation_time = cycle_options.valuation_time.unwrap_or_else(Utc::now);
            match &compiled {
                Some(existing)
                    if !flags.ignore_compilation_validity
                        && !existing.is_valid_for(valuation_time) =>
                {
                    need_recompile = true;
                }
                None => need_recompile = true,
                _ => {}
            }

            if need_recompile {
                let data_provider = cycle_options
                    .market_data_spec
                    .clone()
                    .unwrap_or_else(|| "default".to_string());
                match self.compiler.compile(&view, valuation_time) {
                    Ok(next) => {
                        self.manager
                            .request_subscriptions(&next.market_data_requirements);
                        self.context.view_definition_compiled(&data_provider, &next);
                        compiled = Some(next);
                    }
                    Err(error) => {
                        warn!(view = %view.id, %error, "View compilation failed");
                        self.context
                            .view_definition_compilation_failed(Utc::now(), error);
                        if compiled.is_none() {
                            // The polled cycle is consumed; move on so a
                            // persistent compile error still drains the
                            // sequence.
                            continue 'cycles;
                        }
                    }
                }
            }
            let Some(compiled_view) = compiled.as_ref() else {
                continue 'cycles;
            };

            let requirements = &compiled_view.market_data_requirements;
            let mut snapshot: Box<dyn MarketDataSnapshot> = self
                .manager
                .snapshot()
                .unwrap_or_else(|| Box::new(NoDataSnapshot));
            snapshot.init_with(requirements, self.config.market_data_timeout);
            let mut data_ready = requirements
                .iter()
                .all(|spec| snapshot.query(spec).is_some());

            if !data_ready && flags.await_market_data {
                loop {
                    // Every wakeup re-takes the snapshot before resuming,
                    // so a cycle resumed by a live-data notification runs
                    // against the data that woke it.
                    let resume = match self.shared.wait_for_data(self.config.await_poll_interval) {
                        DataWait::Terminate => break 'cycles,
                        DataWait::Triggered => true,
                        DataWait::Timeout => false,
                    };
                    snapshot = self
                        .manager
                        .snapshot()
                        .unwrap_or_else(|| Box::new(NoDataSnapshot));
                    snapshot.init_with(requirements, self.config.market_data_timeout);
                    data_ready = requirements
                        .iter()
                        .all(|spec| snapshot.query(spec).is_some());
                    if data_ready || resume {
                        break;
                    }
                }
            }

            if !data_ready && flags.skip_cycle_on_no_market_data {
                debug!(valuation_time = %valuation_time, "Skipping cycle, market data missing");
                continue 'cycles;
            }

            let metadata = CycleMetadata {
                cycle_id: CycleId::new(),
                view: compiled_view.view.id,
                valuation_time,
            };
            self.context.cycle_started(&metadata);
            self.context.cycle_fragment_completed(&CycleFragment {
                metadata: metadata.clone(),
                phase: FragmentPhase::PreValuation,
            });
            let started_at = Instant::now();
            let outcome = self
                .executor
                .execute(compiled_view, snapshot.as_ref(), &cycle_options);
            self.context.cycle_fragment_completed(&CycleFragment {
                metadata: metadata.clone(),
                phase: FragmentPhase::PostValuation,
            });
            match outcome {
                Ok(values) => {
                    let result = CycleResult {
                        metadata,
                        values,
                        duration: started_at.elapsed(),
                    };
                    self.context.cycle_completed(&result);
                }
                Err(error) => {
                    warn!(%error, "Cycle execution failed");
                    self.context.cycle_execution_failed(&cycle_options, error);
                }
            }
        }

        self.context.worker_completed();
        self.shared.mark_completed();
    }
}
