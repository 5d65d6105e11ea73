//! Awaitable wrapper around one engine transaction
//!
//! Every request becomes a single `Result`. Engine errors are re-tagged with
//! the operation, store, key and (for writes) the serialized value, so the
//! surfaced [`DbError`] is diagnosable on its own.

use std::cell::{Cell, RefCell};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::engine::EngineTransaction;
use crate::error::{DbError, ErrorKind, Result};
use crate::key::Key;
use crate::logging::prefix;

/// A single-use transaction over a fixed set of stores.
///
/// Once [`wait`](Self::wait) has settled, further requests fail with whatever
/// the engine reports for an inactive transaction.
pub struct Transaction<T: EngineTransaction> {
    tx: T,
    aborted: Cell<bool>,
    outcome: RefCell<Option<Result<()>>>,
}

impl<T: EngineTransaction> Transaction<T> {
    pub(crate) fn new(tx: T) -> Self {
        Self {
            tx,
            aborted: Cell::new(false),
            outcome: RefCell::new(None),
        }
    }

    /// Look up one value by primary key, or by `index` when given.
    ///
    /// Returns `Ok(None)` when nothing matches.
    pub async fn get<V: DeserializeOwned>(
        &self,
        store: &str,
        key: impl Into<Key>,
        index: Option<&str>,
    ) -> Result<Option<V>> {
        let key = key.into();
        let found = match index {
            Some(index) => self.tx.get_by_index(store, index, &key).await,
            None => self.tx.get(store, &key).await,
        }
        .map_err(|err| {
            let operation = match index {
                Some(index) => format!("get via index {} failed", index),
                None => "get failed".to_string(),
            };
            err.wrap(ErrorKind::Request, operation)
                .with_store(store)
                .with_key(&key)
        })?;

        found
            .map(|value| decode(value, store, &key))
            .transpose()
    }

    /// Like [`get`](Self::get), but a missing entry reads as an empty list.
    pub async fn get_as_list<V: DeserializeOwned>(
        &self,
        store: &str,
        key: impl Into<Key>,
        index: Option<&str>,
    ) -> Result<Vec<V>> {
        Ok(self
            .get::<Vec<V>>(store, key, index)
            .await?
            .unwrap_or_default())
    }

    /// Every entry of `store` in key order.
    pub async fn get_all<V: DeserializeOwned>(&self, store: &str) -> Result<Vec<(Key, V)>> {
        let entries = self.tx.cursor_entries(store).await.map_err(|err| {
            err.wrap(ErrorKind::Request, "cursor iteration failed")
                .with_store(store)
        })?;

        entries
            .into_iter()
            .map(|(key, value)| {
                let decoded = decode(value, store, &key)?;
                Ok((key, decoded))
            })
            .collect()
    }

    /// Insert or overwrite a value and return its key.
    ///
    /// `key` may be omitted for stores with an in-line key path or a key
    /// generator.
    pub async fn put<V: Serialize + ?Sized>(
        &self,
        store: &str,
        key: Option<Key>,
        value: &V,
    ) -> Result<Key> {
        let value = serde_json::to_value(value).map_err(|err| {
            let mut err = DbError::from(err).with_store(store);
            if let Some(key) = &key {
                err = err.with_key(key);
            }
            err
        })?;
        let serialized = value.to_string();

        self.tx
            .put(store, key.as_ref(), value)
            .await
            .map_err(|err| {
                let mut err = err
                    .wrap(ErrorKind::Request, "put failed")
                    .with_store(store)
                    .with_value(serialized);
                if let Some(key) = &key {
                    err = err.with_key(key);
                }
                err
            })
    }

    /// Remove an entry. Deleting a missing key is not an error.
    pub async fn delete(&self, store: &str, key: impl Into<Key>) -> Result<()> {
        let key = key.into();
        self.tx.delete(store, &key).await.map_err(|err| {
            err.wrap(ErrorKind::Request, "delete failed")
                .with_store(store)
                .with_key(&key)
        })
    }

    pub async fn count(&self, store: &str) -> Result<u64> {
        self.tx
            .count(store)
            .await
            .map_err(|err| err.wrap(ErrorKind::Request, "count failed").with_store(store))
    }

    /// Remove every entry of `store`.
    pub async fn clear(&self, store: &str) -> Result<()> {
        self.tx
            .clear(store)
            .await
            .map_err(|err| err.wrap(ErrorKind::Request, "clear failed").with_store(store))
    }

    /// Abort the transaction. Pending writes are discarded and
    /// [`wait`](Self::wait) resolves.
    pub fn abort(&self) -> Result<()> {
        self.aborted.set(true);
        self.tx
            .abort()
            .map_err(|err| err.wrap(ErrorKind::Transaction, "abort failed"))
    }

    pub fn aborted(&self) -> bool {
        self.aborted.get()
    }

    /// Settle the transaction.
    ///
    /// Resolves on commit or abort, fails on a transaction-level error. The
    /// outcome is computed once; later calls return the same result.
    pub async fn wait(&self) -> Result<()> {
        if let Some(outcome) = self.outcome.borrow().as_ref() {
            return outcome.clone();
        }

        let outcome = self.tx.wait().await.map_err(|err| {
            let err = err.wrap(ErrorKind::Transaction, "transaction failed");
            warn!("{} transaction settled with an error: {}", prefix::TX, err);
            err
        });

        self.outcome
            .borrow_mut()
            .get_or_insert(outcome)
            .clone()
    }
}

fn decode<V: DeserializeOwned>(value: Value, store: &str, key: &Key) -> Result<V> {
    serde_json::from_value(value).map_err(|err| {
        DbError::from(err)
            .with_store(store)
            .with_key(key)
    })
}
