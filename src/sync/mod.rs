//! The sync engine: optimistic mutations, real-time reconciliation and
//! cache-then-network loading over one shared [`ExpiringCache`].
//!
//! All state lives in a single [`SyncEngine`] value. Cache operations are
//! synchronous under one mutex that is never held across an await; remote
//! calls are the only suspension points.
//!
//! [`ExpiringCache`]: crate::cache::ExpiringCache

mod coordinator;
mod engine;
mod notifications;
mod router;
mod tracker;

pub use coordinator::FetchState;
pub use engine::SyncEngine;
pub use notifications::BatchHandle;
pub use router::SubscriptionHandle;
pub use tracker::{Mutation, MutationHandle};
