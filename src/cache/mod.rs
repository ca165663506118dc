//! Expiring cache over a durable key-value store.
//!
//! This module provides:
//! - TTL-stamped records per collection, with lazy eviction
//! - Pinned (TTL-exempt) entries for unconfirmed optimistic writes
//! - A query index mapping a query to its ordered result ids
//! - Stale-serve lookups that ignore expiry when the network is down

mod expiring;
mod result;

pub use expiring::{CacheRecord, ExpiringCache, QueryEntry, QueryHit, Snapshot};
pub use result::{CacheResult, CacheSource};
