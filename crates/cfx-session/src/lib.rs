//! # cfx-session — The "Memory" of CONFLUX
//!
//! Scroll sessions outlive any single service instance: cursor state is
//! persisted in an external key/value store, keyed by the stable hash of a
//! logical query and guarded by a fail-fast lock, so that the next page of
//! a query can be served by whichever instance receives it.

pub mod backend;
pub mod session;
pub mod slice;
pub mod store;

pub use backend::{MemorySessionBackend, SessionBackend};
pub use session::ScrollSession;
pub use slice::{advance, SlicePlanner, SlicePolicy, SliceTarget};
pub use store::{SessionConfig, SessionLease, SessionStore};
