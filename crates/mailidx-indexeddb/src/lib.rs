//! IndexedDB engine for the mail search index (browser WASM)
//!
//! Plugs the browser's IndexedDB into [`mailidx_core::DbFacade`]. Requests
//! and cursors are wrapped into futures, transaction completion and abort
//! events become the single settlement the facade tracks, and `DOMException`s
//! are folded into [`mailidx_core::DbError`].
//!
//! Values are stored as structured-clone copies of their JSON form; keys are
//! numbers, strings, or arrays of those.
//!
//! # Example
//!
//! ```rust,ignore
//! use mailidx_core::{DbFacade, ELEMENT_DATA_OS};
//! use mailidx_indexeddb::IndexedDbEngine;
//!
//! let db = DbFacade::new(IndexedDbEngine::new(), || {
//!     tracing::info!("search index schema changed, reindexing");
//! });
//! db.open("mailbox-search").await?;
//!
//! let tx = db.create_transaction(false, &[ELEMENT_DATA_OS]).await?;
//! tx.put(ELEMENT_DATA_OS, Some("k1".into()), &serde_json::json!({"a": 1})).await?;
//! tx.wait().await?;
//! ```

pub mod convert;
pub mod engine;
pub mod error;
pub mod idb;

pub use engine::{IdbConnection, IdbTx, IndexedDbEngine};
pub use error::{describe, js_error};

/// Facade over the browser's IndexedDB.
pub type IndexedDbFacade = mailidx_core::DbFacade<IndexedDbEngine>;
