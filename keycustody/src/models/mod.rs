//! Data models for the key custody service
//!
//! These types are used for database rows, cache entries and API serialization.

mod types;

pub use types::*;
