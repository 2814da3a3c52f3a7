//! View Worker Service
//!
//! Runs computation cycles for compiled views: a leaf worker executes one
//! sequence of cycles on a dedicated thread, and two decorator workers
//! compose leaf workers into larger behaviors. All three implement the same
//! `ViewProcessWorker` contract and report upward through a
//! `ViewProcessWorkerContext`.
//!
//! # Architecture
//!
//! ```text
//!          owning context
//!               ▲ events
//!   ┌───────────┴────────────────┐
//!   │ Parallel recompilation     │  ← primary + speculative secondary,
//!   │ coordinator                │    promotion on refusal/completion
//!   └───────────┬────────────────┘
//!   ┌───────────▼────────────────┐
//!   │ Sequence partitioning      │  ← budgeted windows over one shared
//!   │ coordinator                │    sequence, lazy chain advancement
//!   └───────────┬────────────────┘
//!   ┌───────────▼────────────────┐
//!   │ SingleThread leaf worker   │  ← cycle loop: poll, compile,
//!   │ (one thread per worker)    │    subscribe, snapshot, execute
//!   └────────────────────────────┘
//! ```
//!
//! The dependency-graph compiler and the valuation engine sit behind the
//! `ViewCompiler`/`CycleExecutor` traits; market data arrives through the
//! `market-data` crate.

pub mod context;
pub mod parallel;
pub mod partition;
pub mod single;
pub mod testing;
pub mod worker;

// Library version
pub const SERVICE_VERSION: &str = "0.1.0";
