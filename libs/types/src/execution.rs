//! Cycle execution options and flags
//!
//! `ViewCycleExecutionOptions` describes one cycle (valuation time plus the
//! market-data specification label to execute it against).
//! `ViewExecutionOptions` is the immutable per-worker bundle: the flag set,
//! the parallel-compilation mode, and the default per-cycle options that
//! fill gaps left by the sequence. Derived options are always new
//! instances; the flag set of an options instance never mutates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Options for one computation cycle.
///
/// Fields left `None` are filled in from the worker's default cycle
/// options when the sequence is polled.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ViewCycleExecutionOptions {
    /// Valuation time for the cycle; `None` means "now" at execution.
    pub valuation_time: Option<DateTime<Utc>>,
    /// Label of the market-data specification to resolve a provider from.
    pub market_data_spec: Option<String>,
}

impl ViewCycleExecutionOptions {
    pub fn new(valuation_time: DateTime<Utc>) -> Self {
        Self {
            valuation_time: Some(valuation_time),
            market_data_spec: None,
        }
    }

    /// Copy with a market-data specification label set.
    pub fn with_market_data_spec(mut self, spec: impl Into<String>) -> Self {
        self.market_data_spec = Some(spec.into());
        self
    }

    /// Field-wise fallback merge: `self` wins where set, `defaults`
    /// fills the gaps.
    pub fn merge_with(&self, defaults: &ViewCycleExecutionOptions) -> Self {
        Self {
            valuation_time: self.valuation_time.or(defaults.valuation_time),
            market_data_spec: self
                .market_data_spec
                .clone()
                .or_else(|| defaults.market_data_spec.clone()),
        }
    }
}

/// Flag set controlling worker scheduling behavior.
///
/// Immutable per options instance; `with_*` methods return copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFlags {
    /// Suspend a cycle until all required market data is available.
    pub await_market_data: bool,
    /// Run cycles back to back without waiting for triggers.
    pub run_as_fast_as_possible: bool,
    /// Skip (rather than suspend) a cycle whose market data is missing.
    pub skip_cycle_on_no_market_data: bool,
    /// Reuse a compiled view outside its validity window.
    pub ignore_compilation_validity: bool,
    /// Honor trigger/request calls between cycles.
    pub triggers_enabled: bool,
    /// Gate the first cycle on an explicit trigger.
    pub wait_for_initial_trigger: bool,
}

impl Default for ExecutionFlags {
    fn default() -> Self {
        Self {
            await_market_data: false,
            run_as_fast_as_possible: false,
            skip_cycle_on_no_market_data: false,
            ignore_compilation_validity: false,
            triggers_enabled: true,
            wait_for_initial_trigger: false,
        }
    }
}

impl ExecutionFlags {
    pub fn with_await_market_data(mut self, v: bool) -> Self {
        self.await_market_data = v;
        self
    }

    pub fn with_run_as_fast_as_possible(mut self, v: bool) -> Self {
        self.run_as_fast_as_possible = v;
        self
    }

    pub fn with_skip_cycle_on_no_market_data(mut self, v: bool) -> Self {
        self.skip_cycle_on_no_market_data = v;
        self
    }

    pub fn with_ignore_compilation_validity(mut self, v: bool) -> Self {
        self.ignore_compilation_validity = v;
        self
    }

    pub fn with_triggers_enabled(mut self, v: bool) -> Self {
        self.triggers_enabled = v;
        self
    }

    pub fn with_wait_for_initial_trigger(mut self, v: bool) -> Self {
        self.wait_for_initial_trigger = v;
        self
    }
}

/// How a worker coordinator handles recompilation against updated view
/// definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ParallelCompilationMode {
    /// No parallel recompilation; updates apply to the single worker.
    #[default]
    None,
    /// Compile and execute the updated definition concurrently, promote
    /// when the running worker yields.
    ParallelExecution,
    /// Compile the updated definition concurrently but defer its execution
    /// until promotion.
    DeferredExecution,
    /// Promote as soon as the updated definition has compiled.
    ImmediateExecution,
}

/// Immutable per-worker execution options.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ViewExecutionOptions {
    /// Scheduling flag set.
    pub flags: ExecutionFlags,
    /// Recompilation handling mode.
    pub parallel_compilation: ParallelCompilationMode,
    /// Fallback per-cycle options merged into every polled element.
    pub default_cycle_options: ViewCycleExecutionOptions,
}

impl ViewExecutionOptions {
    pub fn new(flags: ExecutionFlags) -> Self {
        Self {
            flags,
            parallel_compilation: ParallelCompilationMode::None,
            default_cycle_options: ViewCycleExecutionOptions::default(),
        }
    }

    /// Derived options with a different flag set.
    pub fn with_flags(&self, flags: ExecutionFlags) -> Self {
        let mut derived = self.clone();
        derived.flags = flags;
        derived
    }

    /// Derived options with a different parallel-compilation mode.
    pub fn with_parallel_compilation(&self, mode: ParallelCompilationMode) -> Self {
        let mut derived = self.clone();
        derived.parallel_compilation = mode;
        derived
    }

    /// Derived options with different default cycle options.
    pub fn with_default_cycle_options(&self, defaults: ViewCycleExecutionOptions) -> Self {
        let mut derived = self.clone();
        derived.default_cycle_options = defaults;
        derived
    }
}
