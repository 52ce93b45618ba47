//! Durable storage for keys, trust records, sessions and the rotation audit trail
//!
//! Everything goes through [`Repository`], a cloneable handle around a SQLite
//! pool. Each record type lives in its own file as an `impl Repository` block.
//! Timestamps are stored as unix epoch milliseconds.

mod audit;
mod identity;
mod pool;
mod prekeys;
mod registration;
mod sessions;
mod signed_prekeys;
mod trust;

use chrono::{DateTime, Utc};

use crate::error::{CustodyError, CustodyResult};

pub use pool::Repository;
pub use registration::NewRegistration;

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_default()
}

/// Narrow an INTEGER column back into the u32 id space
pub(crate) fn column_u32(value: i64, column: &str) -> CustodyResult<u32> {
    u32::try_from(value)
        .map_err(|_| CustodyError::Serialization(format!("{} out of range: {}", column, value)))
}
