//! Key and value conversion between Rust and JavaScript
//!
//! Values cross the boundary as JSON: serialized with serde_json, then
//! materialized with `JSON.parse` (and the reverse on the way out).

use mailidx_core::{DbError, ErrorKind, Key, Result};
use serde_json::Value;
use wasm_bindgen::{JsCast, JsValue};

use crate::error::JsResultExt;

/// Largest integer a JavaScript number holds exactly (`Number.MAX_SAFE_INTEGER`).
pub const MAX_SAFE_INTEGER: i64 = 9_007_199_254_740_991;

fn out_of_range(shown: String) -> DbError {
    DbError::request("integer key outside the safe range")
        .with_cause("DataError")
        .with_value(shown)
}

/// Integer keys must survive the trip through a JS number unchanged.
fn int_to_f64(n: i64) -> Result<f64> {
    if n.unsigned_abs() > MAX_SAFE_INTEGER as u64 {
        return Err(out_of_range(n.to_string()));
    }
    Ok(n as f64)
}

/// `None` for fractional numbers; an error past the safe range.
fn f64_to_int(n: f64) -> Result<Option<i64>> {
    if !n.is_finite() || n.fract() != 0.0 {
        return Ok(None);
    }
    if n.abs() > MAX_SAFE_INTEGER as f64 {
        return Err(out_of_range(n.to_string()));
    }
    Ok(Some(n as i64))
}

pub fn key_to_js(key: &Key) -> Result<JsValue> {
    Ok(match key {
        Key::Int(n) => JsValue::from_f64(int_to_f64(*n)?),
        Key::Text(s) => JsValue::from_str(s),
        Key::Array(items) => items
            .iter()
            .map(key_to_js)
            .collect::<Result<js_sys::Array>>()?
            .into(),
    })
}

/// Convert a key returned by the engine.
///
/// Dates, binary keys and fractional numbers have no [`Key`] counterpart
/// and are rejected, as are integers past `MAX_SAFE_INTEGER`.
pub fn js_to_key(value: &JsValue) -> Result<Key> {
    if let Some(n) = value.as_f64() {
        if let Some(n) = f64_to_int(n)? {
            return Ok(Key::Int(n));
        }
    } else if let Some(s) = value.as_string() {
        return Ok(Key::Text(s));
    } else if let Some(items) = value.dyn_ref::<js_sys::Array>() {
        return items
            .iter()
            .map(|item| js_to_key(&item))
            .collect::<Result<Vec<_>>>()
            .map(Key::Array);
    }
    Err(DbError::request("unsupported key type")
        .with_cause("DataError")
        .with_value(crate::error::describe(value)))
}

pub fn json_to_js(value: &Value) -> Result<JsValue> {
    let json = serde_json::to_string(value)?;
    js_sys::JSON::parse(&json).or_db_error(ErrorKind::Serialization, "JSON.parse failed")
}

/// Convert a stored value; `undefined` means no record.
pub fn js_to_json(value: &JsValue) -> Result<Option<Value>> {
    if value.is_undefined() {
        return Ok(None);
    }
    let json: String = js_sys::JSON::stringify(value)
        .or_db_error(ErrorKind::Serialization, "JSON.stringify failed")?
        .into();
    Ok(Some(serde_json::from_str(&json)?))
}
