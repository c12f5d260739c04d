//! Replicated state: the variable table, its log, and pagination.
//!
//! - [`store`] - Ordered variable table enforcing fencing and lock ownership
//! - [`log`] - Single-node log implementing [`log::RaftApplier`]
//! - [`paginator`] - Continuation tokens over ordered listings

pub mod log;
pub mod paginator;
pub mod store;

pub use log::{AppliedEntry, LocalLog, RaftApplier};
pub use store::{StateOp, StateOutcome, VarApplyStateRequest, VariableStateStore};
