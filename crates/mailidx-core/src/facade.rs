//! Database facade: lazy connection, schema upgrade, transaction tracking
//!
//! The connection moves through `unopened → opening → open`, and back to
//! `opening` whenever the engine closes it, the database is deleted, or
//! [`DbFacade::close`] is called.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use tracing::{debug, info, warn};

use crate::config::DbConfig;
use crate::engine::{
    CloseFn, EngineConnection, EngineTransaction, SchemaEditor, StorageEngine, TransactionMode,
    UpgradeFn, VersionChange,
};
use crate::error::{DbError, ErrorKind, Result};
use crate::lazy::LazyHandle;
use crate::logging::prefix;
use crate::schema::STORES;
use crate::transaction::Transaction;

/// Transaction type produced by a facade over engine `E`.
pub type TransactionOf<E> =
    Transaction<<<E as StorageEngine>::Connection as EngineConnection>::Transaction>;

/// Entry point for the search index storage.
///
/// Cheap to clone; clones share the connection and the transaction count.
pub struct DbFacade<E: StorageEngine> {
    inner: Rc<FacadeInner<E>>,
}

impl<E: StorageEngine> Clone for DbFacade<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct FacadeInner<E: StorageEngine> {
    engine: E,
    config: DbConfig,
    database_id: RefCell<Option<String>>,
    connection: LazyHandle<E::Connection>,
    active: Rc<Cell<usize>>,
    on_upgrade: Rc<dyn Fn()>,
}

/// Counts one live transaction; dropping it releases the count.
struct ActiveTransactionGuard {
    counter: Rc<Cell<usize>>,
}

impl ActiveTransactionGuard {
    fn acquire(counter: Rc<Cell<usize>>) -> Self {
        counter.set(counter.get() + 1);
        Self { counter }
    }
}

impl Drop for ActiveTransactionGuard {
    fn drop(&mut self) {
        self.counter.set(self.counter.get().saturating_sub(1));
    }
}

impl<E: StorageEngine> DbFacade<E> {
    /// Create a facade with the default configuration.
    ///
    /// `on_upgrade` runs once, right before a schema upgrade wipes the stores.
    pub fn new(engine: E, on_upgrade: impl Fn() + 'static) -> Self {
        Self::with_config(engine, DbConfig::default(), on_upgrade)
    }

    pub fn with_config(engine: E, config: DbConfig, on_upgrade: impl Fn() + 'static) -> Self {
        let inner = Rc::new_cyclic(|weak: &Weak<FacadeInner<E>>| {
            let weak = weak.clone();
            FacadeInner {
                engine,
                config,
                database_id: RefCell::new(None),
                connection: LazyHandle::new(move || {
                    let weak = weak.clone();
                    async move {
                        let inner = weak
                            .upgrade()
                            .ok_or_else(|| DbError::open("database facade was dropped"))?;
                        FacadeInner::connect(&inner).await
                    }
                }),
                active: Rc::new(Cell::new(0)),
                on_upgrade: Rc::new(on_upgrade),
            }
        });
        Self { inner }
    }

    /// Record the database to use and wait for the connection.
    ///
    /// Calling it again while the connection is cached does not reopen.
    pub async fn open(&self, database_id: &str) -> Result<()> {
        let previous = self
            .inner
            .database_id
            .replace(Some(database_id.to_string()));
        if let Some(previous) = previous.filter(|prev| prev != database_id) {
            if self.inner.connection.is_loaded() {
                warn!(
                    previous = %previous,
                    requested = %database_id,
                    "database id changed while a connection is cached"
                );
            }
        }

        self.inner.connection.get_async().await.map(|_| ())
    }

    /// Delete the database once no transaction is active.
    ///
    /// Does nothing if no connection is loaded. While transactions are
    /// running it sleeps for the configured delay and checks again.
    pub async fn delete_database(&self) -> Result<()> {
        let inner = &self.inner;
        let mut retries: u32 = 0;

        loop {
            if !inner.connection.is_loaded() {
                return Ok(());
            }
            let active = inner.active.get();
            if active == 0 {
                break;
            }
            if let Some(max) = inner.config.delete_max_retries {
                if retries >= max {
                    return Err(DbError::new(
                        ErrorKind::Busy,
                        format!(
                            "{} transaction(s) still active after {} retries",
                            active, retries
                        ),
                    ));
                }
            }
            debug!(active, retries, "delaying database deletion");
            inner.engine.sleep(inner.config.delete_retry_delay()).await;
            retries += 1;
        }

        let database_id = inner
            .database_id
            .borrow()
            .clone()
            .ok_or_else(|| DbError::new(ErrorKind::NotOpened, "no database id recorded"))?;

        inner.connection.get_loaded().close();
        info!("{} deleting database {}", prefix::DB, database_id);

        inner
            .engine
            .delete_database(&database_id)
            .await
            .map_err(|err| {
                err.wrap(
                    ErrorKind::Open,
                    format!("could not delete database {}", database_id),
                )
            })?;

        inner.connection.reset();
        Ok(())
    }

    /// Start a transaction over exactly `stores`.
    ///
    /// Requires [`open`](Self::open) to have been called; the connection may
    /// still be opening.
    pub async fn create_transaction(
        &self,
        read_only: bool,
        stores: &[&str],
    ) -> Result<TransactionOf<E>> {
        if self.inner.database_id.borrow().is_none() {
            return Err(DbError::new(
                ErrorKind::NotOpened,
                "create_transaction called before open",
            ));
        }

        let connection = self.inner.connection.get_async().await?;
        let mode = TransactionMode::from_read_only(read_only);
        let tx = connection.transaction(stores, mode).map_err(|err| {
            err.wrap(
                ErrorKind::Transaction,
                format!("could not start {:?} transaction on [{}]", mode, stores.join(", ")),
            )
        })?;

        let guard = ActiveTransactionGuard::acquire(self.inner.active.clone());
        tx.on_settled(Box::new(move || drop(guard)));

        Ok(Transaction::new(tx))
    }

    /// Close the connection; the next use reopens it.
    pub fn close(&self) {
        if let Some(connection) = self.inner.connection.reset() {
            info!("{} closing database", prefix::DB);
            connection.close();
        }
    }

    /// Whether a connection is currently established.
    pub fn is_open(&self) -> bool {
        self.inner.connection.is_loaded()
    }

    pub fn active_transactions(&self) -> usize {
        self.inner.active.get()
    }

    pub fn database_id(&self) -> Option<String> {
        self.inner.database_id.borrow().clone()
    }

    pub fn config(&self) -> &DbConfig {
        &self.inner.config
    }

    pub fn engine(&self) -> &E {
        &self.inner.engine
    }
}

impl<E: StorageEngine> FacadeInner<E> {
    async fn connect(inner: &Rc<Self>) -> Result<E::Connection> {
        let database_id = inner
            .database_id
            .borrow()
            .clone()
            .ok_or_else(|| DbError::new(ErrorKind::NotOpened, "open was never called"))?;

        let on_upgrade = inner.on_upgrade.clone();
        let upgrade: UpgradeFn = Box::new(
            move |editor: &mut dyn SchemaEditor, change: VersionChange| {
                upgrade_schema(editor, change, &*on_upgrade)
            },
        );

        let weak = Rc::downgrade(inner);
        let on_close: CloseFn = Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                warn!("{} connection closed by the engine, will reopen on next use", prefix::DB);
                inner.connection.reset();
            }
        });

        info!(
            "{} opening database {} (version {})",
            prefix::DB,
            database_id,
            inner.config.version
        );

        inner
            .engine
            .open(&database_id, inner.config.version, upgrade, on_close)
            .await
            .map_err(|err| match err.kind() {
                ErrorKind::NotAvailable | ErrorKind::Upgrade => err,
                _ => err.wrap(
                    ErrorKind::Open,
                    format!("could not open database {}", database_id),
                ),
            })
    }
}

/// Bring the schema to the current layout.
///
/// A database that existed before (any non-zero old version) is wiped: the
/// caller's hook runs, every known store is deleted, then all stores are
/// created again. Deletion failures are logged and ignored; creation failures
/// abort the open.
fn upgrade_schema(
    editor: &mut dyn SchemaEditor,
    change: VersionChange,
    on_upgrade: &dyn Fn(),
) -> Result<()> {
    if !change.is_fresh() {
        info!(
            "{} schema version {} -> {}, dropping search index",
            prefix::DB,
            change.old_version,
            change.new_version
        );
        on_upgrade();
        for store in STORES {
            if let Err(err) = editor.delete_store(store.name) {
                warn!(store = store.name, error = %err, "could not delete object store");
            }
        }
    }

    for store in STORES {
        editor.create_store(store).map_err(|err| {
            err.wrap(ErrorKind::Upgrade, "could not create object store")
                .with_store(store.name)
        })?;
        debug!(store = store.name, "created object store");
    }

    Ok(())
}
