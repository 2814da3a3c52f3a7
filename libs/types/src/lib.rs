//! Types library for the view computation engine
//!
//! This library provides the core type definitions shared by the market-data
//! and view-worker services: identifiers, market-data value specifications,
//! view definitions, cycle execution options and sequences, and the shared
//! error taxonomy.
//!
//! # Modules
//! - `ids`: Unique identifiers (ViewDefinitionId, CycleId)
//! - `value_spec`: Market-data value specifications and subscription keys
//! - `view`: View definitions and compiled view definitions
//! - `execution`: Cycle execution options, flags, and execution modes
//! - `sequence`: Cycle execution sequences (finite, single-shot, infinite)
//! - `errors`: Error taxonomy

// Public modules
pub mod ids;
pub mod value_spec;
pub mod view;
pub mod execution;
pub mod sequence;
pub mod errors;

// Library version constant
pub const LIB_VERSION: &str = "1.0.0";

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::ids::*;
    pub use crate::value_spec::*;
    pub use crate::view::*;
    pub use crate::execution::*;
    pub use crate::sequence::*;
    pub use crate::errors::*;
}
