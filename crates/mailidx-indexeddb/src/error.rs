//! Conversion of JavaScript error values into [`DbError`]
//!
//! IndexedDB reports failures as `DOMException`s, plain `Error`s, or
//! arbitrary thrown values. All of them end up as the cause of a `DbError`.

use mailidx_core::{DbError, ErrorKind, Result};
use wasm_bindgen::{JsCast, JsValue};
use web_sys::DomException;

/// Build a `DbError` of `kind` whose cause describes `value`.
pub fn js_error(kind: ErrorKind, message: impl Into<String>, value: &JsValue) -> DbError {
    DbError::new(kind, message).with_cause(describe(value))
}

/// Human-readable description of a thrown JavaScript value.
///
/// `DOMException`s render as `"<message>: <name>"` so the exception name
/// always comes last.
pub fn describe(value: &JsValue) -> String {
    if let Some(dom) = value.dyn_ref::<DomException>() {
        let message = dom.message();
        return if message.is_empty() {
            dom.name()
        } else {
            format!("{}: {}", message, dom.name())
        };
    }
    if let Some(err) = value.dyn_ref::<js_sys::Error>() {
        return String::from(err.message());
    }
    if let Some(text) = value.as_string() {
        return text;
    }
    js_sys::JSON::stringify(value)
        .map(String::from)
        .unwrap_or_else(|_| format!("{:?}", value))
}

/// Attach a kind and an operation message to a `Result<T, JsValue>`.
pub(crate) trait JsResultExt<T> {
    fn or_db_error(self, kind: ErrorKind, message: impl Into<String>) -> Result<T>;
}

impl<T> JsResultExt<T> for std::result::Result<T, JsValue> {
    fn or_db_error(self, kind: ErrorKind, message: impl Into<String>) -> Result<T> {
        self.map_err(|value| js_error(kind, message, &value))
    }
}
