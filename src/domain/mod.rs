//! Domain types for patchrun
//!
//! - Run: one end-to-end attempt at an issue, carrying its lifecycle state
//! - Iteration: one accepted patch within a run
//! - EventRecord: append-only audit entries

pub mod event;
pub mod iteration;
pub mod run;

pub use event::{EventRecord, event_kinds};
pub use iteration::{Iteration, NewIteration};
pub use run::Run;
