//! [`StorageEngine`] implementation over the browser's IndexedDB
//!
//! A transaction's settlement handlers are installed when it is created, so
//! the settle hooks run even if nobody awaits [`EngineTransaction::wait`].
//! A request error aborts the transaction (the default IndexedDB reaction);
//! that abort, like an explicit [`EngineTransaction::abort`], resolves the
//! settlement. Only an abort the engine initiates on its own (commit
//! failure, quota, I/O) rejects it.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use futures::channel::oneshot;
use mailidx_core::engine::{CloseFn, SettleFn, UpgradeFn};
use mailidx_core::schema::StoreSchema;
use mailidx_core::{
    DbError, EngineConnection, EngineTransaction, ErrorKind, Key, Result, SchemaEditor,
    StorageEngine, TransactionMode, VersionChange,
};
use serde_json::Value;
use tracing::{debug, warn};
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use wasm_bindgen_futures::JsFuture;
use web_sys::{
    IdbDatabase, IdbIndexParameters, IdbObjectStore, IdbObjectStoreParameters, IdbOpenDbRequest,
    IdbRequest, IdbTransaction, IdbTransactionMode, IdbVersionChangeEvent,
};

use crate::convert::{js_to_json, js_to_key, json_to_js, key_to_js};
use crate::error::{js_error, JsResultExt};
use crate::idb;

type EventClosure = Closure<dyn FnMut(web_sys::Event)>;
type UpgradeClosure = Closure<dyn FnMut(IdbVersionChangeEvent)>;

/// The browser's IndexedDB as a storage engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexedDbEngine;

impl IndexedDbEngine {
    pub fn new() -> Self {
        Self
    }

    /// Whether an IndexedDB factory exists in the current global scope.
    pub fn is_available() -> bool {
        idb::idb_factory().is_ok()
    }
}

impl StorageEngine for IndexedDbEngine {
    type Connection = IdbConnection;

    async fn open(
        &self,
        name: &str,
        version: u32,
        mut upgrade: UpgradeFn,
        on_close: CloseFn,
    ) -> Result<IdbConnection> {
        let factory = idb::idb_factory()?;
        let request: IdbOpenDbRequest = factory
            .open_with_u32(name, version)
            .or_db_error(ErrorKind::Open, format!("could not open {}", name))?;

        // The upgrade callback cannot return an error to the engine. It
        // records it here and aborts the versionchange transaction instead.
        let upgrade_error: Rc<RefCell<Option<DbError>>> = Rc::new(RefCell::new(None));

        let req_u = request.clone();
        let error_slot = upgrade_error.clone();
        let on_upgrade: UpgradeClosure = Closure::wrap(Box::new(move |event: IdbVersionChangeEvent| {
            let change = VersionChange {
                old_version: event.old_version() as u32,
                new_version: event.new_version().map(|v| v as u32).unwrap_or(version),
            };
            let outcome = req_u
                .result()
                .or_db_error(ErrorKind::Upgrade, "no database during upgrade")
                .and_then(|db| {
                    let db: IdbDatabase = db.unchecked_into();
                    upgrade(&mut IdbSchemaEditor { db: &db }, change)
                });
            if let Err(err) = outcome {
                *error_slot.borrow_mut() = Some(err);
                if let Some(tx) = req_u.transaction() {
                    let _ = tx.abort();
                }
            }
        }) as Box<dyn FnMut(IdbVersionChangeEvent)>);

        let db_name = name.to_string();
        let on_blocked: EventClosure = Closure::wrap(Box::new(move |_event: web_sys::Event| {
            warn!(database = %db_name, "open blocked by another connection");
        }) as Box<dyn FnMut(web_sys::Event)>);

        request.set_onupgradeneeded(Some(on_upgrade.as_ref().unchecked_ref()));
        request.set_onblocked(Some(on_blocked.as_ref().unchecked_ref()));

        let result = JsFuture::from(idb::request_to_promise(&request, || {})).await;

        request.set_onupgradeneeded(None);
        request.set_onblocked(None);
        drop(on_upgrade);
        drop(on_blocked);

        if let Some(err) = upgrade_error.borrow_mut().take() {
            return Err(err);
        }

        let db = result
            .map_err(|err| js_error(ErrorKind::Open, format!("could not open {}", name), &err))?
            .dyn_into::<IdbDatabase>()
            .map_err(|_| DbError::open("open result is not an IDBDatabase"))?;

        Ok(IdbConnection::new(db, on_close))
    }

    async fn delete_database(&self, name: &str) -> Result<()> {
        idb::delete_database(name).await
    }

    async fn sleep(&self, duration: Duration) {
        idb::sleep(duration).await;
    }
}

struct IdbSchemaEditor<'a> {
    db: &'a IdbDatabase,
}

impl SchemaEditor for IdbSchemaEditor<'_> {
    fn store_names(&self) -> Vec<String> {
        let names = self.db.object_store_names();
        (0..names.length()).filter_map(|i| names.item(i)).collect()
    }

    fn delete_store(&mut self, name: &str) -> Result<()> {
        self.db.delete_object_store(name).map_err(|err| {
            js_error(ErrorKind::Upgrade, "could not delete object store", &err).with_store(name)
        })
    }

    fn create_store(&mut self, schema: &StoreSchema) -> Result<()> {
        let failed = |err: JsValue| {
            js_error(ErrorKind::Upgrade, "could not create object store", &err)
                .with_store(schema.name)
        };

        let params = IdbObjectStoreParameters::new();
        if let Some(key_path) = schema.key_path {
            js_sys::Reflect::set(&params, &"keyPath".into(), &key_path.into()).map_err(failed)?;
        }
        js_sys::Reflect::set(
            &params,
            &"autoIncrement".into(),
            &JsValue::from_bool(schema.auto_increment),
        )
        .map_err(failed)?;

        let store = self
            .db
            .create_object_store_with_optional_parameters(schema.name, &params)
            .map_err(failed)?;

        for index in schema.indexes {
            let index_params = IdbIndexParameters::new();
            js_sys::Reflect::set(
                &index_params,
                &"unique".into(),
                &JsValue::from_bool(index.unique),
            )
            .map_err(failed)?;
            store
                .create_index_with_str_and_optional_parameters(
                    index.name,
                    index.key_path,
                    &index_params,
                )
                .map_err(failed)?;
        }

        debug!(store = schema.name, "created object store");
        Ok(())
    }
}

/// Open IndexedDB connection.
///
/// When another context requests a version change, the connection closes
/// itself and reports it through the close hook, as it does when the
/// browser closes it (storage cleared, disk failure).
#[derive(Clone)]
pub struct IdbConnection {
    db: IdbDatabase,
    _handlers: Rc<(EventClosure, EventClosure)>,
}

impl IdbConnection {
    fn new(db: IdbDatabase, on_close: CloseFn) -> Self {
        let on_close: Rc<CloseFn> = Rc::new(on_close);

        let hook = on_close.clone();
        let closed_by_engine: EventClosure = Closure::wrap(Box::new(move |_event: web_sys::Event| {
            warn!("IndexedDB connection closed by the browser");
            hook();
        }) as Box<dyn FnMut(web_sys::Event)>);

        let hook = on_close.clone();
        let db_v = db.clone();
        let version_change: EventClosure = Closure::wrap(Box::new(move |_event: web_sys::Event| {
            debug!("version change requested elsewhere, closing connection");
            db_v.close();
            hook();
        }) as Box<dyn FnMut(web_sys::Event)>);

        db.set_onclose(Some(closed_by_engine.as_ref().unchecked_ref()));
        db.set_onversionchange(Some(version_change.as_ref().unchecked_ref()));

        Self {
            db,
            _handlers: Rc::new((closed_by_engine, version_change)),
        }
    }

    pub fn name(&self) -> String {
        self.db.name()
    }

    pub fn version(&self) -> f64 {
        self.db.version()
    }
}

impl EngineConnection for IdbConnection {
    type Transaction = IdbTx;

    fn transaction(&self, stores: &[&str], mode: TransactionMode) -> Result<IdbTx> {
        let names: js_sys::Array = stores.iter().map(|name| JsValue::from_str(name)).collect();
        let idb_mode = match mode {
            TransactionMode::ReadOnly => IdbTransactionMode::Readonly,
            TransactionMode::ReadWrite => IdbTransactionMode::Readwrite,
        };
        let tx = self
            .db
            .transaction_with_str_sequence_and_mode(&names, idb_mode)
            .or_db_error(ErrorKind::Transaction, "could not start transaction")?;
        Ok(IdbTx::new(tx))
    }

    fn close(&self) {
        // Closing on request is not a close event; drop the handlers so a
        // late versionchange does not report it twice.
        self.db.set_onclose(None);
        self.db.set_onversionchange(None);
        self.db.close();
    }
}

struct TxShared {
    outcome: RefCell<Option<Result<()>>>,
    hooks: RefCell<Vec<SettleFn>>,
    waiters: RefCell<Vec<oneshot::Sender<Result<()>>>>,
    abort_requested: Cell<bool>,
    request_failed: Cell<bool>,
    closures: RefCell<Option<(EventClosure, EventClosure)>>,
}

impl TxShared {
    fn settle(&self, outcome: Result<()>) {
        if self.outcome.borrow().is_some() {
            return;
        }
        *self.outcome.borrow_mut() = Some(outcome.clone());

        for waiter in std::mem::take(&mut *self.waiters.borrow_mut()) {
            let _ = waiter.send(outcome.clone());
        }
        let hooks = std::mem::take(&mut *self.hooks.borrow_mut());
        for hook in hooks {
            hook();
        }
        *self.closures.borrow_mut() = None;
    }
}

/// IndexedDB transaction.
pub struct IdbTx {
    tx: IdbTransaction,
    shared: Rc<TxShared>,
}

impl IdbTx {
    fn new(tx: IdbTransaction) -> Self {
        let shared = Rc::new(TxShared {
            outcome: RefCell::new(None),
            hooks: RefCell::new(Vec::new()),
            waiters: RefCell::new(Vec::new()),
            abort_requested: Cell::new(false),
            request_failed: Cell::new(false),
            closures: RefCell::new(None),
        });

        let on_complete_shared = shared.clone();
        let on_complete: EventClosure = Closure::wrap(Box::new(move |_event: web_sys::Event| {
            on_complete_shared.settle(Ok(()));
        }) as Box<dyn FnMut(web_sys::Event)>);

        let on_abort_shared = shared.clone();
        let tx_a = tx.clone();
        let on_abort: EventClosure = Closure::wrap(Box::new(move |_event: web_sys::Event| {
            let shared = &on_abort_shared;
            let outcome = if shared.abort_requested.get() || shared.request_failed.get() {
                Ok(())
            } else {
                match tx_a.error() {
                    Some(err) => Err(js_error(
                        ErrorKind::Transaction,
                        "transaction aborted by the engine",
                        &err.into(),
                    )),
                    None => Ok(()),
                }
            };
            shared.settle(outcome);
        }) as Box<dyn FnMut(web_sys::Event)>);

        tx.set_oncomplete(Some(on_complete.as_ref().unchecked_ref()));
        tx.set_onabort(Some(on_abort.as_ref().unchecked_ref()));
        *shared.closures.borrow_mut() = Some((on_complete, on_abort));

        Self { tx, shared }
    }

    fn object_store(&self, store: &str) -> Result<IdbObjectStore> {
        self.tx.object_store(store).map_err(|err| {
            js_error(ErrorKind::Request, "no such store in scope", &err).with_store(store)
        })
    }

    async fn run(&self, request: std::result::Result<IdbRequest, JsValue>) -> Result<JsValue> {
        let request = request.or_db_error(ErrorKind::Request, "request rejected")?;
        let shared = self.shared.clone();
        JsFuture::from(idb::request_to_promise(&request, move || {
            shared.request_failed.set(true)
        }))
        .await
        .map_err(|err| js_error(ErrorKind::Request, "request failed", &err))
    }
}

impl EngineTransaction for IdbTx {
    async fn get(&self, store: &str, key: &Key) -> Result<Option<Value>> {
        let object_store = self.object_store(store)?;
        let value = self.run(object_store.get(&key_to_js(key)?)).await?;
        js_to_json(&value)
    }

    async fn get_by_index(&self, store: &str, index: &str, key: &Key) -> Result<Option<Value>> {
        let idb_index = self.object_store(store)?.index(index).map_err(|err| {
            js_error(ErrorKind::Request, format!("no index named '{}'", index), &err)
                .with_store(store)
        })?;
        let value = self.run(idb_index.get(&key_to_js(key)?)).await?;
        js_to_json(&value)
    }

    async fn cursor_entries(&self, store: &str) -> Result<Vec<(Key, Value)>> {
        let request = self
            .object_store(store)?
            .open_cursor()
            .or_db_error(ErrorKind::Request, "could not open cursor")?;
        let shared = self.shared.clone();
        let entries = JsFuture::from(idb::cursor_to_promise(&request, move || {
            shared.request_failed.set(true)
        }))
        .await
        .map_err(|err| js_error(ErrorKind::Request, "cursor failed", &err))?;

        js_sys::Array::from(&entries)
            .iter()
            .map(|pair| {
                let pair = js_sys::Array::from(&pair);
                let key = js_to_key(&pair.get(0))?;
                let value = js_to_json(&pair.get(1))?.unwrap_or(Value::Null);
                Ok((key, value))
            })
            .collect()
    }

    async fn put(&self, store: &str, key: Option<&Key>, value: Value) -> Result<Key> {
        let object_store = self.object_store(store)?;
        let value = json_to_js(&value)?;
        let request = match key {
            Some(key) => object_store.put_with_key(&value, &key_to_js(key)?),
            None => object_store.put(&value),
        };
        let key = self.run(request).await?;
        js_to_key(&key)
    }

    async fn delete(&self, store: &str, key: &Key) -> Result<()> {
        let object_store = self.object_store(store)?;
        self.run(object_store.delete(&key_to_js(key)?)).await?;
        Ok(())
    }

    async fn count(&self, store: &str) -> Result<u64> {
        let object_store = self.object_store(store)?;
        let count = self.run(object_store.count()).await?;
        count
            .as_f64()
            .map(|n| n as u64)
            .ok_or_else(|| DbError::request("count did not return a number").with_store(store))
    }

    async fn clear(&self, store: &str) -> Result<()> {
        let object_store = self.object_store(store)?;
        self.run(object_store.clear()).await?;
        Ok(())
    }

    fn abort(&self) -> Result<()> {
        self.shared.abort_requested.set(true);
        self.tx
            .abort()
            .or_db_error(ErrorKind::Transaction, "abort failed")
    }

    async fn wait(&self) -> Result<()> {
        if let Some(outcome) = self.shared.outcome.borrow().as_ref() {
            return outcome.clone();
        }
        let (sender, receiver) = oneshot::channel();
        self.shared.waiters.borrow_mut().push(sender);
        receiver
            .await
            .unwrap_or_else(|_| Err(DbError::transaction("transaction dropped before settling")))
    }

    fn on_settled(&self, hook: SettleFn) {
        if self.shared.outcome.borrow().is_some() {
            hook();
        } else {
            self.shared.hooks.borrow_mut().push(hook);
        }
    }
}
