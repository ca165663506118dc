//! Client-side cache and sync engine for the SocialChat backend.
//!
//! The engine keeps local views of posts, profiles, notifications, messages
//! and groups consistent with a remote data store:
//! - an expiring, durable cache with per-collection TTLs
//! - optimistic mutations with per-record queuing and rollback
//! - real-time change events reconciled by last-write-wins
//! - cache-then-network loading with background refresh and offline mode
//!
//! View code talks to a single [`SyncEngine`] built once per session.

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod record;
pub mod remote;
pub mod social;
pub mod storage;
pub mod sync;

pub use cache::{CacheRecord, CacheResult, CacheSource, ExpiringCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{RemoteError, StorageError, SyncError};
pub use record::{ChangeEvent, ChangeKind, Collection, Filter, Operation, Query, Record};
pub use remote::{MemoryRemote, RemoteSource, RemoteStats, TransportSignal};
pub use social::Entity;
pub use storage::{KeyValueStore, MemoryStore, NoopStore, SqliteStore};
pub use sync::{BatchHandle, FetchState, Mutation, MutationHandle, SubscriptionHandle, SyncEngine};
