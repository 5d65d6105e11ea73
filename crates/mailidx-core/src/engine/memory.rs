//! In-memory storage engine
//!
//! A HashMap-backed engine with IndexedDB semantics, for native builds and
//! tests. Not persistent.
//!
//! Transactions read from a snapshot of their scoped stores, log their
//! writes, and replay the log onto the live database when they settle
//! successfully. The snapshot is taken at the first request. Requests
//! complete synchronously, so an earlier overlapping transaction that is
//! still active at that point has nothing in flight and commits first, the
//! way IndexedDB auto-commits an idle transaction. Transactions that overlap
//! with a read-write one therefore run in creation order.
//!
//! Key generators are advanced on the live store at request time and, as in
//! IndexedDB, are not rolled back by an abort.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::rc::{Rc, Weak};
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use super::{
    CloseFn, EngineConnection, EngineTransaction, SchemaEditor, SettleFn, StorageEngine,
    TransactionMode, UpgradeFn, VersionChange,
};
use crate::error::{DbError, Result};
use crate::key::Key;
use crate::schema::StoreSchema;

/// In-memory engine. Clones share the same databases.
#[derive(Clone, Default)]
pub struct InMemoryEngine {
    state: Rc<RefCell<EngineState>>,
}

/// Live transactions on one database, in creation order.
type Schedule = Rc<RefCell<Vec<Weak<TxCore>>>>;

#[derive(Default)]
struct EngineState {
    databases: HashMap<String, Rc<RefCell<MemoryDatabase>>>,
    connections: HashMap<String, Vec<Weak<ConnectionShared>>>,
    schedules: HashMap<String, Schedule>,
    unavailable: bool,
    fail_next_commit: Option<String>,
    fail_store_creation: Option<String>,
}

#[derive(Clone, Default)]
struct MemoryDatabase {
    version: u32,
    stores: BTreeMap<String, MemoryStore>,
}

#[derive(Clone)]
struct MemoryStore {
    schema: StoreSchema,
    records: BTreeMap<Key, Value>,
    next_key: i64,
}

impl MemoryStore {
    fn new(schema: StoreSchema) -> Self {
        Self {
            schema,
            records: BTreeMap::new(),
            next_key: 1,
        }
    }
}

impl InMemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an environment without a storage engine.
    pub fn set_available(&self, available: bool) {
        self.state.borrow_mut().unavailable = !available;
    }

    /// Make the next transaction commit fail with a transaction-level error.
    pub fn fail_next_commit(&self, reason: impl Into<String>) {
        self.state.borrow_mut().fail_next_commit = Some(reason.into());
    }

    /// Make every upgrade step that creates `store` fail.
    pub fn fail_store_creation(&self, store: impl Into<String>) {
        self.state.borrow_mut().fail_store_creation = Some(store.into());
    }

    pub fn clear_faults(&self) {
        let mut state = self.state.borrow_mut();
        state.unavailable = false;
        state.fail_next_commit = None;
        state.fail_store_creation = None;
    }

    /// Close every open connection to `name` as the engine would on its own,
    /// notifying each connection's close hook.
    pub fn close_connections(&self, name: &str) {
        let connections = self
            .state
            .borrow_mut()
            .connections
            .remove(name)
            .unwrap_or_default();
        for connection in connections.iter().filter_map(Weak::upgrade) {
            if !connection.closed.replace(true) {
                (connection.on_close)();
            }
        }
    }

    pub fn database_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.borrow().databases.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn stored_version(&self, name: &str) -> Option<u32> {
        self.state
            .borrow()
            .databases
            .get(name)
            .map(|db| db.borrow().version)
    }

    pub fn store_names(&self, name: &str) -> Vec<String> {
        self.state
            .borrow()
            .databases
            .get(name)
            .map(|db| db.borrow().stores.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of records currently committed to `store`.
    pub fn record_count(&self, name: &str, store: &str) -> usize {
        self.state
            .borrow()
            .databases
            .get(name)
            .and_then(|db| db.borrow().stores.get(store).map(|s| s.records.len()))
            .unwrap_or(0)
    }

    pub fn open_connections(&self, name: &str) -> usize {
        self.state
            .borrow()
            .connections
            .get(name)
            .map(|list| {
                list.iter()
                    .filter_map(Weak::upgrade)
                    .filter(|c| !c.closed.get())
                    .count()
            })
            .unwrap_or(0)
    }

    /// Commit every live transaction on `name`, oldest first.
    fn settle_live_transactions(&self, name: &str) {
        let Some(schedule) = self.state.borrow().schedules.get(name).cloned() else {
            return;
        };
        let live: Vec<Rc<TxCore>> = schedule.borrow().iter().filter_map(Weak::upgrade).collect();
        if !live.is_empty() {
            debug!(name, count = live.len(), "committing live transactions");
        }
        for tx in live {
            tx.commit();
        }
        schedule.borrow_mut().retain(|entry| entry.strong_count() > 0);
    }

    fn ensure_available(&self) -> Result<()> {
        if self.state.borrow().unavailable {
            return Err(DbError::not_available("in-memory engine disabled"));
        }
        Ok(())
    }

    fn open_sync(
        &self,
        name: &str,
        version: u32,
        mut upgrade: UpgradeFn,
        on_close: CloseFn,
    ) -> Result<MemoryConnection> {
        self.ensure_available()?;
        if version == 0 {
            return Err(DbError::open(format!("invalid version 0 for database {}", name))
                .with_cause("TypeError"));
        }

        let existing = self.state.borrow().databases.get(name).cloned();
        let old_version = existing.as_ref().map(|db| db.borrow().version).unwrap_or(0);

        let database = if old_version == version {
            existing.ok_or_else(|| DbError::open(format!("database {} vanished", name)))?
        } else {
            // Live transactions finish and other connections let go before
            // the schema changes.
            if old_version != 0 {
                self.settle_live_transactions(name);
                self.close_connections(name);
            }

            let mut working = existing
                .as_ref()
                .map(|db| db.borrow().clone())
                .unwrap_or_default();
            let fail_store_creation = self.state.borrow().fail_store_creation.clone();
            let mut editor = MemorySchemaEditor {
                database: &mut working,
                fail_store_creation,
            };
            debug!(name, old_version, new_version = version, "running upgrade");
            upgrade(
                &mut editor,
                VersionChange {
                    old_version,
                    new_version: version,
                },
            )?;
            working.version = version;

            // Old connections keep the previous generation.
            let db = Rc::new(RefCell::new(working));
            self.state
                .borrow_mut()
                .databases
                .insert(name.to_string(), db.clone());
            db
        };

        let schedule = self
            .state
            .borrow_mut()
            .schedules
            .entry(name.to_string())
            .or_default()
            .clone();
        let shared = Rc::new(ConnectionShared {
            name: name.to_string(),
            database,
            schedule,
            engine: self.state.clone(),
            closed: Cell::new(false),
            on_close,
        });
        self.state
            .borrow_mut()
            .connections
            .entry(name.to_string())
            .or_default()
            .push(Rc::downgrade(&shared));

        Ok(MemoryConnection { shared })
    }

    fn delete_sync(&self, name: &str) -> Result<()> {
        self.ensure_available()?;
        self.settle_live_transactions(name);
        let connections = {
            let mut state = self.state.borrow_mut();
            state.databases.remove(name);
            state.schedules.remove(name);
            state.connections.remove(name).unwrap_or_default()
        };
        for connection in connections.iter().filter_map(Weak::upgrade) {
            connection.closed.set(true);
        }
        Ok(())
    }
}

impl StorageEngine for InMemoryEngine {
    type Connection = MemoryConnection;

    async fn open(
        &self,
        name: &str,
        version: u32,
        upgrade: UpgradeFn,
        on_close: CloseFn,
    ) -> Result<MemoryConnection> {
        self.open_sync(name, version, upgrade, on_close)
    }

    async fn delete_database(&self, name: &str) -> Result<()> {
        self.delete_sync(name)
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

struct MemorySchemaEditor<'a> {
    database: &'a mut MemoryDatabase,
    fail_store_creation: Option<String>,
}

impl SchemaEditor for MemorySchemaEditor<'_> {
    fn store_names(&self) -> Vec<String> {
        self.database.stores.keys().cloned().collect()
    }

    fn delete_store(&mut self, name: &str) -> Result<()> {
        self.database
            .stores
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| {
                DbError::upgrade("no such object store")
                    .with_store(name)
                    .with_cause("NotFoundError")
            })
    }

    fn create_store(&mut self, schema: &StoreSchema) -> Result<()> {
        if self.fail_store_creation.as_deref() == Some(schema.name) {
            return Err(DbError::upgrade("object store creation rejected")
                .with_store(schema.name)
                .with_cause("UnknownError"));
        }
        if self.database.stores.contains_key(schema.name) {
            return Err(DbError::upgrade("object store already exists")
                .with_store(schema.name)
                .with_cause("ConstraintError"));
        }
        self.database
            .stores
            .insert(schema.name.to_string(), MemoryStore::new(*schema));
        Ok(())
    }
}

struct ConnectionShared {
    name: String,
    database: Rc<RefCell<MemoryDatabase>>,
    schedule: Schedule,
    engine: Rc<RefCell<EngineState>>,
    closed: Cell<bool>,
    on_close: CloseFn,
}

/// Connection to an in-memory database.
#[derive(Clone)]
pub struct MemoryConnection {
    shared: Rc<ConnectionShared>,
}

impl MemoryConnection {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.get()
    }
}

impl EngineConnection for MemoryConnection {
    type Transaction = MemoryTransaction;

    fn transaction(&self, stores: &[&str], mode: TransactionMode) -> Result<MemoryTransaction> {
        if self.shared.closed.get() {
            return Err(DbError::transaction("the database connection is closing")
                .with_cause("InvalidStateError"));
        }
        if stores.is_empty() {
            return Err(DbError::transaction("the store list is empty")
                .with_cause("InvalidAccessError"));
        }

        {
            let database = self.shared.database.borrow();
            for &name in stores {
                if !database.stores.contains_key(name) {
                    return Err(DbError::transaction("no such object store")
                        .with_store(name)
                        .with_cause("NotFoundError"));
                }
            }
        }

        let core = Rc::new(TxCore {
            connection: self.shared.clone(),
            scope: stores.iter().map(|name| name.to_string()).collect(),
            mode,
            started: Cell::new(false),
            working: RefCell::new(BTreeMap::new()),
            log: RefCell::new(Vec::new()),
            status: Cell::new(TxStatus::Active),
            outcome: RefCell::new(None),
            hooks: RefCell::new(Vec::new()),
        });
        let mut schedule = self.shared.schedule.borrow_mut();
        schedule.retain(|entry| {
            entry
                .upgrade()
                .is_some_and(|tx| tx.status.get() == TxStatus::Active)
        });
        schedule.push(Rc::downgrade(&core));
        Ok(MemoryTransaction { core })
    }

    fn close(&self) {
        self.shared.closed.set(true);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxStatus {
    Active,
    Committed,
    Aborted,
    Failed,
}

enum WriteOp {
    Put { store: String, key: Key, value: Value },
    Delete { store: String, key: Key },
    Clear { store: String },
}

/// Transaction over an in-memory database.
///
/// Commits when awaited with [`EngineTransaction::wait`], when dropped while
/// still active, or when a later overlapping transaction starts.
pub struct MemoryTransaction {
    core: Rc<TxCore>,
}

struct TxCore {
    connection: Rc<ConnectionShared>,
    scope: Vec<String>,
    mode: TransactionMode,
    started: Cell<bool>,
    working: RefCell<BTreeMap<String, MemoryStore>>,
    log: RefCell<Vec<WriteOp>>,
    status: Cell<TxStatus>,
    outcome: RefCell<Option<Result<()>>>,
    hooks: RefCell<Vec<SettleFn>>,
}

impl TxCore {
    fn conflicts_with(&self, other: &TxCore) -> bool {
        (self.mode == TransactionMode::ReadWrite || other.mode == TransactionMode::ReadWrite)
            && self.scope.iter().any(|store| other.scope.contains(store))
    }

    /// Take the snapshot on first use, after earlier overlapping
    /// transactions have settled.
    fn start(&self) {
        if self.started.replace(true) {
            return;
        }
        let earlier: Vec<Rc<TxCore>> = self
            .connection
            .schedule
            .borrow()
            .iter()
            .take_while(|entry| !std::ptr::eq(entry.as_ptr(), self))
            .filter_map(Weak::upgrade)
            .filter(|tx| tx.status.get() == TxStatus::Active && tx.conflicts_with(self))
            .collect();
        for tx in earlier {
            debug!(scope = ?tx.scope, "committing idle overlapping transaction");
            tx.commit();
        }

        let database = self.connection.database.borrow();
        let mut working = self.working.borrow_mut();
        for name in &self.scope {
            if let Some(store) = database.stores.get(name) {
                working.insert(name.clone(), store.clone());
            }
        }
    }

    fn check_active(&self, store: &str) -> Result<()> {
        if self.status.get() != TxStatus::Active {
            return Err(DbError::request("transaction is not active")
                .with_store(store)
                .with_cause("TransactionInactiveError"));
        }
        self.start();
        if !self.working.borrow().contains_key(store) {
            return Err(DbError::request("store is not in the transaction scope")
                .with_store(store)
                .with_cause("NotFoundError"));
        }
        Ok(())
    }

    fn check_writable(&self, store: &str) -> Result<()> {
        self.check_active(store)?;
        if self.mode == TransactionMode::ReadOnly {
            return Err(DbError::request("transaction is read-only")
                .with_store(store)
                .with_cause("ReadOnlyError"));
        }
        Ok(())
    }

    /// A request failed after it was accepted: the engine aborts.
    fn fail_request(&self, err: DbError) -> DbError {
        self.settle(TxStatus::Aborted, Ok(()));
        err
    }

    fn settle(&self, status: TxStatus, outcome: Result<()>) {
        if self.status.get() != TxStatus::Active {
            return;
        }
        self.status.set(status);
        if status != TxStatus::Committed {
            self.log.borrow_mut().clear();
        }
        *self.outcome.borrow_mut() = Some(outcome);
        let hooks = std::mem::take(&mut *self.hooks.borrow_mut());
        for hook in hooks {
            hook();
        }
    }

    fn commit(&self) {
        if self.status.get() != TxStatus::Active {
            return;
        }
        let failure = self.connection.engine.borrow_mut().fail_next_commit.take();
        if let Some(reason) = failure {
            self.settle(
                TxStatus::Failed,
                Err(DbError::transaction("commit failed").with_cause(reason)),
            );
            return;
        }

        let log = std::mem::take(&mut *self.log.borrow_mut());
        if !log.is_empty() {
            let mut database = self.connection.database.borrow_mut();
            for op in log {
                match op {
                    WriteOp::Put { store, key, value } => {
                        if let Some(live) = database.stores.get_mut(&store) {
                            live.records.insert(key, value);
                        }
                    }
                    WriteOp::Delete { store, key } => {
                        if let Some(live) = database.stores.get_mut(&store) {
                            live.records.remove(&key);
                        }
                    }
                    WriteOp::Clear { store } => {
                        if let Some(live) = database.stores.get_mut(&store) {
                            live.records.clear();
                        }
                    }
                }
            }
        }
        self.settle(TxStatus::Committed, Ok(()));
    }

    /// Advance the live key generator and return the next key.
    fn generate_key(&self, store: &str) -> Key {
        let mut database = self.connection.database.borrow_mut();
        match database.stores.get_mut(store) {
            Some(live) => {
                let key = live.next_key;
                live.next_key += 1;
                Key::Int(key)
            }
            None => Key::Int(1),
        }
    }

    fn bump_generator(&self, store: &str, key: &Key) {
        if let Some(n) = key.as_int() {
            let mut database = self.connection.database.borrow_mut();
            if let Some(live) = database.stores.get_mut(store) {
                if live.schema.auto_increment && n >= live.next_key {
                    live.next_key = n + 1;
                }
            }
        }
    }

    fn resolve_key(&self, schema: &StoreSchema, key: Option<&Key>, value: &mut Value) -> Result<Key> {
        match (schema.key_path, key) {
            (Some(_), Some(_)) => Err(DbError::request(
                "store uses in-line keys and a key was provided",
            )
            .with_cause("DataError")),
            (Some(path), None) => match Key::from_key_path(value, path) {
                Some(key) => {
                    self.bump_generator(schema.name, &key);
                    Ok(key)
                }
                None if schema.auto_increment => {
                    let key = self.generate_key(schema.name);
                    inject_key(value, path, &key)?;
                    Ok(key)
                }
                None => Err(DbError::request(format!("value has no key at path '{}'", path))
                    .with_cause("DataError")),
            },
            (None, Some(key)) => {
                self.bump_generator(schema.name, key);
                Ok(key.clone())
            }
            (None, None) if schema.auto_increment => Ok(self.generate_key(schema.name)),
            (None, None) => Err(DbError::request(
                "store has no key path or key generator and no key was provided",
            )
            .with_cause("DataError")),
        }
    }

    fn check_unique(store: &MemoryStore, key: &Key, value: &Value) -> Result<()> {
        for index in store.schema.indexes.iter().filter(|index| index.unique) {
            let Some(index_key) = Key::from_key_path(value, index.key_path) else {
                continue;
            };
            let clash = store.records.iter().any(|(other_key, other)| {
                other_key != key
                    && Key::from_key_path(other, index.key_path).as_ref() == Some(&index_key)
            });
            if clash {
                return Err(DbError::request(format!(
                    "unique index '{}' already contains {}",
                    index.name, index_key
                ))
                .with_cause("ConstraintError"));
            }
        }
        Ok(())
    }

    fn put_sync(&self, store: &str, key: Option<&Key>, mut value: Value) -> Result<Key> {
        self.check_writable(store)?;
        let schema = self.working.borrow()[store].schema;

        let key = match self.resolve_key(&schema, key, &mut value) {
            Ok(key) => key,
            Err(err) => return Err(self.fail_request(err)),
        };

        let mut working = self.working.borrow_mut();
        let target = working
            .get_mut(store)
            .ok_or_else(|| DbError::request("store vanished").with_store(store))?;
        if let Err(err) = Self::check_unique(target, &key, &value) {
            drop(working);
            return Err(self.fail_request(err));
        }
        target.records.insert(key.clone(), value.clone());
        self.log.borrow_mut().push(WriteOp::Put {
            store: store.to_string(),
            key: key.clone(),
            value,
        });
        Ok(key)
    }
}

/// Set `key` at `path` inside `value`, creating intermediate objects.
fn inject_key(value: &mut Value, path: &str, key: &Key) -> Result<()> {
    let mut current = value;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        let object = current.as_object_mut().ok_or_else(|| {
            DbError::request(format!("cannot inject generated key at '{}'", path))
                .with_cause("DataError")
        })?;
        if segments.peek().is_none() {
            object.insert(segment.to_string(), key.to_json());
            return Ok(());
        }
        current = object
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
    }
    Ok(())
}

impl EngineTransaction for MemoryTransaction {
    async fn get(&self, store: &str, key: &Key) -> Result<Option<Value>> {
        self.core.check_active(store)?;
        Ok(self.core.working.borrow()[store].records.get(key).cloned())
    }

    async fn get_by_index(&self, store: &str, index: &str, key: &Key) -> Result<Option<Value>> {
        self.core.check_active(store)?;
        let working = self.core.working.borrow();
        let target = &working[store];
        let index = target.schema.index(index).ok_or_else(|| {
            DbError::request(format!("no index named '{}'", index))
                .with_store(store)
                .with_cause("NotFoundError")
        })?;
        Ok(target
            .records
            .values()
            .find(|value| Key::from_key_path(value, index.key_path).as_ref() == Some(key))
            .cloned())
    }

    async fn cursor_entries(&self, store: &str) -> Result<Vec<(Key, Value)>> {
        self.core.check_active(store)?;
        Ok(self.core.working.borrow()[store]
            .records
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn put(&self, store: &str, key: Option<&Key>, value: Value) -> Result<Key> {
        self.core.put_sync(store, key, value)
    }

    async fn delete(&self, store: &str, key: &Key) -> Result<()> {
        self.core.check_writable(store)?;
        if let Some(target) = self.core.working.borrow_mut().get_mut(store) {
            target.records.remove(key);
        }
        self.core.log.borrow_mut().push(WriteOp::Delete {
            store: store.to_string(),
            key: key.clone(),
        });
        Ok(())
    }

    async fn count(&self, store: &str) -> Result<u64> {
        self.core.check_active(store)?;
        Ok(self.core.working.borrow()[store].records.len() as u64)
    }

    async fn clear(&self, store: &str) -> Result<()> {
        self.core.check_writable(store)?;
        if let Some(target) = self.core.working.borrow_mut().get_mut(store) {
            target.records.clear();
        }
        self.core.log.borrow_mut().push(WriteOp::Clear {
            store: store.to_string(),
        });
        Ok(())
    }

    fn abort(&self) -> Result<()> {
        if self.core.status.get() != TxStatus::Active {
            return Err(DbError::transaction("transaction already finished")
                .with_cause("InvalidStateError"));
        }
        self.core.settle(TxStatus::Aborted, Ok(()));
        Ok(())
    }

    async fn wait(&self) -> Result<()> {
        self.core.commit();
        self.core.outcome.borrow().clone().unwrap_or(Ok(()))
    }

    fn on_settled(&self, hook: SettleFn) {
        if self.core.status.get() == TxStatus::Active {
            self.core.hooks.borrow_mut().push(hook);
        } else {
            hook();
        }
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        self.core.commit();
    }
}
