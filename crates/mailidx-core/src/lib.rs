//! Storage facade for the local mail search index
//!
//! This crate persists the search index of the mail client (index rows,
//! per-word metadata, element and group metadata, search term suggestions)
//! in an IndexedDB-style engine. It owns the plumbing only: opening a
//! versioned database, wiping it on schema changes, turning engine requests
//! into awaitable results, and refusing to delete the database under a live
//! transaction.
//!
//! # Engines
//!
//! - `memory` (default feature) - [`InMemoryEngine`], for native builds and tests
//! - IndexedDB - see the `mailidx-indexeddb` crate (browser WASM)
//!
//! The whole API is single-threaded: handles are `Rc`-based and futures are
//! not `Send`.
//!
//! # Example
//!
//! ```rust
//! use mailidx_core::{DbFacade, InMemoryEngine, ELEMENT_DATA_OS};
//! use serde_json::{json, Value};
//!
//! # async fn run() -> mailidx_core::Result<()> {
//! let db = DbFacade::new(InMemoryEngine::new(), || {});
//! db.open("db1").await?;
//!
//! let tx = db.create_transaction(false, &[ELEMENT_DATA_OS]).await?;
//! tx.put(ELEMENT_DATA_OS, Some("k1".into()), &json!({"a": 1})).await?;
//! tx.wait().await?;
//!
//! let tx = db.create_transaction(true, &[ELEMENT_DATA_OS]).await?;
//! let value: Option<Value> = tx.get(ELEMENT_DATA_OS, "k1", None).await?;
//! assert_eq!(value, Some(json!({"a": 1})));
//! # Ok(())
//! # }
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(run()).unwrap();
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod facade;
pub mod key;
pub mod lazy;
pub mod logging;
pub mod schema;
pub mod transaction;

// Re-export main types at crate root
pub use config::DbConfig;
#[cfg(feature = "memory")]
pub use engine::memory::{InMemoryEngine, MemoryConnection, MemoryTransaction};
pub use engine::{
    EngineConnection, EngineTransaction, SchemaEditor, StorageEngine, TransactionMode,
    VersionChange,
};
pub use error::{DbError, ErrorContext, ErrorKind, Result};
pub use facade::{DbFacade, TransactionOf};
pub use key::Key;
pub use lazy::LazyHandle;
pub use schema::{
    DB_VERSION, ELEMENT_DATA_OS, GROUP_DATA_OS, META_DATA_OS, SEARCH_INDEX_META_OS,
    SEARCH_INDEX_OS, SEARCH_INDEX_WORDS_INDEX, SEARCH_TERM_SUGGESTIONS_OS,
};
pub use transaction::Transaction;
