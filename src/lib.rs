//! Transactional item-link cache for a message store.
//!
//! Every persisted entity (item streams, reference streams, items and item references) is
//! represented in memory by a [`Link`]. A link tracks where its payload is in the transactional
//! lifecycle, keeps the owning stream's statistics current, and decides when the payload may be
//! handed to a discard cache and rebuilt from the persistence tier later.
//!
//! ```no_run
//! use std::sync::Arc;
//! use msgstore::{ItemRegistry, MemoryStore, MessageStore, StoreOptions};
//!
//! # fn main() -> msgstore::Result<()> {
//! let store = MessageStore::open(
//!     StoreOptions::default(),
//!     Arc::new(MemoryStore::new()),
//!     ItemRegistry::new(),
//! )?;
//! let tran = store.begin();
//! tran.commit()?;
//! println!("{}", store.dump());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod expiry;
pub mod item;
pub mod link;
pub mod logging;
pub mod persistence;
pub mod state;
pub mod stats;
pub mod store;
pub mod transaction;
pub mod tuple;
pub mod types;

pub use cache::{CacheStats, ItemCache, ManagedCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheOptions, SpillLimits, StoreOptions};
pub use error::{Result, StoreError};
pub use item::{Filter, Item, ItemRegistry, MatchAll};
pub use link::Link;
pub use logging::init_logging;
pub use persistence::{MemoryStore, PersistOp, PersistentStore};
pub use state::ItemLinkState;
pub use stats::{Bucket, ListStatistics, StatsSnapshot, WatermarkBreach, Watermarks};
pub use store::MessageStore;
pub use transaction::{CompletionCallback, Task, TaskKind, Transaction, TransactionTable, TxState};
pub use tuple::Tuple;
pub use types::{DataSlice, ItemKind, LinkId, LockId, StorageStrategy, TranId};
