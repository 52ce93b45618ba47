//! Request handlers
//!
//! Client-facing key registration and bundle retrieval, plus operator
//! commands. Handlers take the shared [`AppState`](crate::state::AppState)
//! explicitly and return `CustodyResult`, which serializes errors as their
//! display string.

pub mod admin;
pub mod keys;

pub use admin::*;
pub use keys::*;
