//! Cycle execution sequences
//!
//! A `ViewCycleExecutionSequence` is a lazy, possibly infinite stream of
//! per-cycle options. `poll` is destructive: each call consumes exactly one
//! element or signals exhaustion. Polled elements are merged with the
//! worker's default cycle options.
//!
//! `SharedSequence` and `PartitionSequence` exist for the partitioning
//! coordinator: several budgeted windows drain one shared underlying
//! sequence, and a window's remaining estimate is the minimum of its
//! unspent budget and the underlying estimate.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::execution::ViewCycleExecutionOptions;

/// Remaining-length estimate of a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequenceEstimate {
    /// Exactly this many cycles remain.
    Finite(u64),
    /// The sequence never exhausts.
    Unbounded,
}

impl SequenceEstimate {
    /// The tighter of two estimates.
    pub fn min(self, other: SequenceEstimate) -> SequenceEstimate {
        match (self, other) {
            (SequenceEstimate::Finite(a), SequenceEstimate::Finite(b)) => {
                SequenceEstimate::Finite(a.min(b))
            }
            (SequenceEstimate::Finite(a), SequenceEstimate::Unbounded) => {
                SequenceEstimate::Finite(a)
            }
            (SequenceEstimate::Unbounded, other) => other,
        }
    }

    /// Whether the estimate says nothing remains.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, SequenceEstimate::Finite(0))
    }

    /// Finite count, if the estimate is finite.
    pub fn finite(&self) -> Option<u64> {
        match self {
            SequenceEstimate::Finite(n) => Some(*n),
            SequenceEstimate::Unbounded => None,
        }
    }
}

impl fmt::Display for SequenceEstimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SequenceEstimate::Finite(n) => write!(f, "{}", n),
            SequenceEstimate::Unbounded => write!(f, "unbounded"),
        }
    }
}

/// A lazy stream of per-cycle execution options.
pub trait ViewCycleExecutionSequence: Send {
    /// Consume and return the next element, merged with `defaults`.
    /// Returns `None` once the sequence is exhausted.
    fn poll(&mut self, defaults: &ViewCycleExecutionOptions) -> Option<ViewCycleExecutionOptions>;

    /// Estimate of how many cycles remain.
    fn estimate_remaining(&self) -> SequenceEstimate;
}

/// Finite sequence over an arbitrary list of cycle options.
#[derive(Debug, Clone, Default)]
pub struct ArbitraryViewCycleExecutionSequence {
    queue: VecDeque<ViewCycleExecutionOptions>,
}

impl ArbitraryViewCycleExecutionSequence {
    pub fn new(cycles: impl IntoIterator<Item = ViewCycleExecutionOptions>) -> Self {
        Self {
            queue: cycles.into_iter().collect(),
        }
    }

    /// A sequence of `count` cycles all using the default options.
    pub fn of_length(count: usize) -> Self {
        Self {
            queue: std::iter::repeat(ViewCycleExecutionOptions::default())
                .take(count)
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl ViewCycleExecutionSequence for ArbitraryViewCycleExecutionSequence {
    fn poll(&mut self, defaults: &ViewCycleExecutionOptions) -> Option<ViewCycleExecutionOptions> {
        self.queue.pop_front().map(|options| options.merge_with(defaults))
    }

    fn estimate_remaining(&self) -> SequenceEstimate {
        SequenceEstimate::Finite(self.queue.len() as u64)
    }
}

/// Single-shot sequence: exactly one cycle, then exhausted.
#[derive(Debug, Clone)]
pub struct SingleCycleExecutionSequence {
    options: Option<ViewCycleExecutionOptions>,
}

impl SingleCycleExecutionSequence {
    pub fn new(options: ViewCycleExecutionOptions) -> Self {
        Self {
            options: Some(options),
        }
    }
}

impl ViewCycleExecutionSequence for SingleCycleExecutionSequence {
    fn poll(&mut self, defaults: &ViewCycleExecutionOptions) -> Option<ViewCycleExecutionOptions> {
        self.options.take().map(|options| options.merge_with(defaults))
    }

    fn estimate_remaining(&self) -> SequenceEstimate {
        SequenceEstimate::Finite(self.options.iter().count() as u64)
    }
}

/// Infinite sequence: every poll yields the defaults, with the valuation
/// time filled in from the wall clock when the defaults leave it open.
#[derive(Debug, Clone, Copy, Default)]
pub struct InfiniteViewCycleExecutionSequence;

impl ViewCycleExecutionSequence for InfiniteViewCycleExecutionSequence {
    fn poll(&mut self, defaults: &ViewCycleExecutionOptions) -> Option<ViewCycleExecutionOptions> {
        let mut options = defaults.clone();
        if options.valuation_time.is_none() {
            options.valuation_time = Some(Utc::now());
        }
        Some(options)
    }

    fn estimate_remaining(&self) -> SequenceEstimate {
        SequenceEstimate::Unbounded
    }
}

/// Cheap-clone handle to a sequence shared by several consumers.
///
/// Polls are linearized through the inner mutex, so concurrent partitions
/// each consume distinct elements.
#[derive(Clone)]
pub struct SharedSequence {
    inner: Arc<Mutex<Box<dyn ViewCycleExecutionSequence>>>,
}

impl SharedSequence {
    pub fn new(sequence: Box<dyn ViewCycleExecutionSequence>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(sequence)),
        }
    }
}

impl fmt::Debug for SharedSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedSequence(remaining={})", self.estimate_remaining())
    }
}

impl ViewCycleExecutionSequence for SharedSequence {
    fn poll(&mut self, defaults: &ViewCycleExecutionOptions) -> Option<ViewCycleExecutionOptions> {
        match self.inner.lock() {
            Ok(mut sequence) => sequence.poll(defaults),
            Err(_) => None,
        }
    }

    fn estimate_remaining(&self) -> SequenceEstimate {
        match self.inner.lock() {
            Ok(sequence) => sequence.estimate_remaining(),
            Err(_) => SequenceEstimate::Finite(0),
        }
    }
}

/// A budgeted window over a shared sequence.
///
/// Consumes at most `budget` elements from the underlying sequence; the
/// remaining estimate is min(unspent budget, underlying remaining).
#[derive(Debug)]
pub struct PartitionSequence {
    shared: SharedSequence,
    budget: u64,
}

impl PartitionSequence {
    pub fn new(shared: SharedSequence, budget: u64) -> Self {
        Self { shared, budget }
    }

    /// Unspent cycle budget of this window.
    pub fn budget_remaining(&self) -> u64 {
        self.budget
    }
}

impl ViewCycleExecutionSequence for PartitionSequence {
    fn poll(&mut self, defaults: &ViewCycleExecutionOptions) -> Option<ViewCycleExecutionOptions> {
        if self.budget == 0 {
            return None;
        }
        let polled = self.shared.poll(defaults);
        if polled.is_some() {
            self.budget -= 1;
        }
        polled
    }

    fn estimate_remaining(&self) -> SequenceEstimate {
        SequenceEstimate::Finite(self.budget).min(self.shared.estimate_remaining())
    }
}
