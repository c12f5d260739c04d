//! Varvault - replicated, encrypted, versioned variable store.
//!
//! Variables are small maps of string items addressed by `(namespace, path)`.
//! Every mutation is committed through a replicated log and applied to a
//! state store that enforces CAS fencing and lock ownership. Payloads are
//! encrypted before they enter the log. Variables can carry a cooperative
//! lock with a TTL that the leader expires when it is not renewed.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       VariablesService                          │
//! │   Apply │ Read │ List │ ListAll │ RenewLock │ blocking queries   │
//! └─────────────────────────────────────────────────────────────────┘
//!        │            │             │             │
//! ┌────────────┐ ┌──────────┐ ┌───────────┐ ┌──────────────────────┐
//! │ ACL tokens │ │ Keyring  │ │ Membership│ │ Leader lock timers   │
//! └────────────┘ └──────────┘ └───────────┘ └──────────────────────┘
//!        │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │              Replicated log → Variable state store              │
//! │      ordered table │ CAS fencing │ lock ownership │ watch       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! - [`core`] - Configuration, errors, clock and runtime wiring
//! - [`vars`] - Variable model and request/response types
//! - [`state`] - State store, log and pagination
//! - [`acl`] - Identities, policies and capability checks
//! - [`crypto`] - Payload encryption under a rotating keyring
//! - [`cluster`] - Membership and feature version gates
//! - [`locks`] - Leader-local lock TTL timers and lock delay
//! - [`service`] - The variables RPC operations
//! - [`cli`] - CLI command implementations
//!
//! # Key Invariants
//!
//! - Modify indexes come from the log and strictly increase per variable
//! - A CAS or lock mutation is checked and applied in one state machine step
//! - At most one lock is held per variable; only its holder can write it
//! - Plaintext items never enter the log or the state store

pub mod acl;
pub mod cli;
pub mod cluster;
pub mod core;
pub mod crypto;
pub mod locks;
pub mod service;
pub mod state;
pub mod vars;

// Re-exports for convenience
pub use self::core::{config, error, runtime, time};
pub use self::core::error::{VarError, VarResult};
pub use self::service::VariablesService;
