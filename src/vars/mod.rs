//! Variables: data model and request types.
//!
//! - [`model`] - Metadata, locks, encrypted and decrypted forms, validation
//! - [`ops`] - Apply, read, list and renew request/response types

pub mod model;
pub mod ops;

pub use model::{
    VarKey, VariableData, VariableDecrypted, VariableEncrypted, VariableItems, VariableLock,
    VariableMetadata,
};
pub use ops::{ApplyOutcome, ConflictReason, VarApplyRequest, VarApplyResponse, VarOp};
