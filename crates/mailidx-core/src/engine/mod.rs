//! Storage engine abstraction
//!
//! The facade drives an IndexedDB-shaped engine through these traits:
//! versioned open with a synchronous upgrade step, scoped transactions,
//! keyed requests, cursor walks and database deletion. Implementations exist
//! for:
//!
//! - **Memory**: [`memory::InMemoryEngine`], native builds and tests
//! - **IndexedDB**: browser WASM (`mailidx-indexeddb` crate)
//!
//! Everything here is single-threaded; returned futures are not `Send`.

use std::future::Future;
use std::time::Duration;

use serde_json::Value;

use crate::error::Result;
use crate::key::Key;
use crate::schema::StoreSchema;

#[cfg(feature = "memory")]
pub mod memory;

/// Transaction access mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
}

impl TransactionMode {
    pub fn from_read_only(read_only: bool) -> Self {
        if read_only {
            TransactionMode::ReadOnly
        } else {
            TransactionMode::ReadWrite
        }
    }
}

/// Stored and requested versions passed to the upgrade step.
///
/// `old_version == 0` means the database did not exist before.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionChange {
    pub old_version: u32,
    pub new_version: u32,
}

impl VersionChange {
    pub fn is_fresh(&self) -> bool {
        self.old_version == 0
    }
}

/// Schema operations available inside the upgrade step.
pub trait SchemaEditor {
    fn store_names(&self) -> Vec<String>;

    /// Delete a store. Fails if no store with this name exists.
    fn delete_store(&mut self, name: &str) -> Result<()>;

    /// Create a store together with its indexes.
    fn create_store(&mut self, schema: &StoreSchema) -> Result<()>;
}

/// Synchronous upgrade step run by the engine on version mismatch.
pub type UpgradeFn = Box<dyn FnMut(&mut dyn SchemaEditor, VersionChange) -> Result<()>>;

/// Called by the engine when it closes a connection on its own.
pub type CloseFn = Box<dyn Fn()>;

/// Called once when a transaction settles.
pub type SettleFn = Box<dyn FnOnce()>;

/// A storage engine capable of opening and deleting named databases.
pub trait StorageEngine: Clone + 'static {
    type Connection: EngineConnection;

    /// Open `name` at `version`, running `upgrade` if the stored version
    /// differs. `on_close` fires if the engine later closes the connection
    /// without being asked to.
    fn open(
        &self,
        name: &str,
        version: u32,
        upgrade: UpgradeFn,
        on_close: CloseFn,
    ) -> impl Future<Output = Result<Self::Connection>>;

    fn delete_database(&self, name: &str) -> impl Future<Output = Result<()>>;

    /// Timer used between `delete_database` retries.
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()>;
}

/// An open database connection.
pub trait EngineConnection: Clone + 'static {
    type Transaction: EngineTransaction;

    /// Start a transaction scoped to exactly `stores`.
    fn transaction(&self, stores: &[&str], mode: TransactionMode) -> Result<Self::Transaction>;

    fn close(&self);
}

/// One engine transaction.
///
/// Requests settle individually. A failed request aborts the transaction,
/// which still counts as a settlement, not a transaction error.
pub trait EngineTransaction: 'static {
    fn get(&self, store: &str, key: &Key) -> impl Future<Output = Result<Option<Value>>>;

    /// First record whose `index` key equals `key`.
    fn get_by_index(
        &self,
        store: &str,
        index: &str,
        key: &Key,
    ) -> impl Future<Output = Result<Option<Value>>>;

    /// Walk the store with a forward cursor, collecting every entry.
    fn cursor_entries(&self, store: &str) -> impl Future<Output = Result<Vec<(Key, Value)>>>;

    /// Insert or overwrite; returns the effective key.
    fn put(&self, store: &str, key: Option<&Key>, value: Value)
        -> impl Future<Output = Result<Key>>;

    fn delete(&self, store: &str, key: &Key) -> impl Future<Output = Result<()>>;

    fn count(&self, store: &str) -> impl Future<Output = Result<u64>>;

    fn clear(&self, store: &str) -> impl Future<Output = Result<()>>;

    fn abort(&self) -> Result<()>;

    /// Resolve on commit or abort, fail on a transaction-level error.
    fn wait(&self) -> impl Future<Output = Result<()>>;

    /// Register a hook run exactly once when the transaction settles. Runs
    /// immediately if it already has.
    fn on_settled(&self, hook: SettleFn);
}
