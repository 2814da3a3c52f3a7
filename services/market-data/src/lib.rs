//! Market Data Service
//!
//! Tracks which market-data value specifications the view workers currently
//! need, and exposes the snapshot surface they execute against:
//! - Subscription reconciliation and per-key lifecycle tracking
//!   (pending → active/failed → removed)
//! - Narrow provider/snapshot/listener traits so live feeds and in-memory
//!   snapshots stay behind one interface
//! - A composite snapshot that merges N delegate snapshots into one
//!   queryable snapshot, routing extended specs back to their delegate
//!
//! # Architecture
//!
//! ```text
//!        View Worker
//!            │ desired specs per compilation
//!     ┌──────▼────────┐
//!     │ MarketData    │  ← reconciles desired vs tracked,
//!     │ Manager       │    drives subscribe/unsubscribe
//!     └──────┬────────┘
//!            │ resolve(spec label)
//!     ┌──────▼────────┐
//!     │ Provider(s)   │
//!     └──────┬────────┘
//!            │ snapshot()
//!     ┌──────▼────────┐
//!     │ Composite     │  ← init/query fan-out by provider index
//!     │ Snapshot      │
//!     └───────────────┘
//! ```

pub mod composite;
pub mod provider;
pub mod subscriptions;

// Library version
pub const SERVICE_VERSION: &str = "0.1.0";
