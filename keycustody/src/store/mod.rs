//! Protocol store facade
//!
//! The single entry point for the protocol engine's storage callbacks.
//! Reads go cache first, then repository; writes go to the repository and
//! are mirrored into the cache only once the repository has accepted them.
//! Trust decisions and one-time pre-key state always come from the
//! repository.

mod facade;
mod traits;

pub use facade::{ProtocolStore, UserProtocolStore, PRIMARY_DEVICE_ID};
pub use traits::{IdentityKeyStore, PreKeyStore, SessionStore, SignedPreKeyStore};
