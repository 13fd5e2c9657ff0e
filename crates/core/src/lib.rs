//! Domain types and pure building blocks for the webhook relay.
//!
//! Nothing in this crate performs I/O: signature checks, event identity
//! resolution and retry delay calculation are all deterministic functions
//! that the app crate wires into its HTTP and worker layers.

pub mod identity;
pub mod retry;
pub mod signature;
pub mod types;
