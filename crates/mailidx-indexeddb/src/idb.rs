//! Low-level IndexedDB helpers using web-sys
//!
//! Wraps the callback-based IndexedDB API into Rust futures using
//! `wasm_bindgen_futures::JsFuture` and `js_sys::Promise`. Event handler
//! closures live in an `Rc<RefCell<Option<..>>>` and are released as soon as
//! the request settles.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use js_sys::{Array, Function, Promise};
use mailidx_core::{DbError, ErrorKind, Result};
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use wasm_bindgen_futures::JsFuture;
use web_sys::{IdbCursorWithValue, IdbFactory, IdbRequest};

use crate::error::{js_error, JsResultExt};

type EventClosure = Closure<dyn FnMut(web_sys::Event)>;
type ClosurePair = (EventClosure, EventClosure);

/// Get the global IndexedDB factory (window or worker scope).
pub fn idb_factory() -> Result<IdbFactory> {
    let global = js_sys::global();

    let idb = js_sys::Reflect::get(&global, &"indexedDB".into())
        .or_db_error(ErrorKind::NotAvailable, "no indexedDB on global")?;

    if idb.is_undefined() || idb.is_null() {
        return Err(DbError::not_available("indexedDB is null/undefined"));
    }

    idb.dyn_into::<IdbFactory>()
        .map_err(|_| DbError::not_available("indexedDB is not IdbFactory"))
}

/// The request's error as a JS value, for rejecting its promise.
fn request_error(req: &IdbRequest) -> JsValue {
    match req.error() {
        Ok(Some(err)) => err.into(),
        _ => JsValue::from_str("unknown IDB error"),
    }
}

/// Convert an IdbRequest into a JS Promise that resolves with the request's
/// result.
///
/// `on_error` runs synchronously inside the error event, before the engine
/// reacts to it (a failed request aborts its transaction).
pub(crate) fn request_to_promise(req: &IdbRequest, on_error: impl FnOnce() + 'static) -> Promise {
    let mut on_error = Some(on_error);

    Promise::new(&mut |resolve, reject| {
        let closures: Rc<RefCell<Option<ClosurePair>>> = Rc::new(RefCell::new(None));

        let req_s = req.clone();
        let closures_for_success = closures.clone();
        let on_success = Closure::wrap(Box::new(move |_event: web_sys::Event| {
            let result = req_s.result().unwrap_or(JsValue::UNDEFINED);
            let _ = resolve.call1(&JsValue::UNDEFINED, &result);
            *closures_for_success.borrow_mut() = None;
        }) as Box<dyn FnMut(web_sys::Event)>);

        let req_e = req.clone();
        let closures_for_error = closures.clone();
        let mut hook = on_error.take();
        let on_failure = Closure::wrap(Box::new(move |_event: web_sys::Event| {
            if let Some(hook) = hook.take() {
                hook();
            }
            let _ = reject.call1(&JsValue::UNDEFINED, &request_error(&req_e));
            *closures_for_error.borrow_mut() = None;
        }) as Box<dyn FnMut(web_sys::Event)>);

        req.set_onsuccess(Some(on_success.as_ref().unchecked_ref()));
        req.set_onerror(Some(on_failure.as_ref().unchecked_ref()));

        *closures.borrow_mut() = Some((on_success, on_failure));
    })
}

/// Walk a cursor request to its end, resolving with an array of
/// `[key, value]` pairs in cursor order.
pub(crate) fn cursor_to_promise(req: &IdbRequest, on_error: impl FnOnce() + 'static) -> Promise {
    let mut on_error = Some(on_error);

    Promise::new(&mut |resolve, reject| {
        let closures: Rc<RefCell<Option<ClosurePair>>> = Rc::new(RefCell::new(None));
        let entries = Array::new();

        let req_s = req.clone();
        let closures_for_success = closures.clone();
        let reject_s = reject.clone();
        let on_success = Closure::wrap(Box::new(move |_event: web_sys::Event| {
            let result = req_s.result().unwrap_or(JsValue::NULL);
            let Some(cursor) = result.dyn_ref::<IdbCursorWithValue>() else {
                let _ = resolve.call1(&JsValue::UNDEFINED, &entries);
                *closures_for_success.borrow_mut() = None;
                return;
            };

            let step = cursor.key().and_then(|key| {
                let value = cursor.value()?;
                entries.push(&Array::of2(&key, &value));
                cursor.continue_()
            });
            if let Err(err) = step {
                let _ = reject_s.call1(&JsValue::UNDEFINED, &err);
                *closures_for_success.borrow_mut() = None;
            }
        }) as Box<dyn FnMut(web_sys::Event)>);

        let req_e = req.clone();
        let closures_for_error = closures.clone();
        let mut hook = on_error.take();
        let on_failure = Closure::wrap(Box::new(move |_event: web_sys::Event| {
            if let Some(hook) = hook.take() {
                hook();
            }
            let _ = reject.call1(&JsValue::UNDEFINED, &request_error(&req_e));
            *closures_for_error.borrow_mut() = None;
        }) as Box<dyn FnMut(web_sys::Event)>);

        req.set_onsuccess(Some(on_success.as_ref().unchecked_ref()));
        req.set_onerror(Some(on_failure.as_ref().unchecked_ref()));

        *closures.borrow_mut() = Some((on_success, on_failure));
    })
}

/// Delete an IndexedDB database by name.
pub async fn delete_database(db_name: &str) -> Result<()> {
    let factory = idb_factory()?;
    let req = factory
        .delete_database(db_name)
        .or_db_error(ErrorKind::Open, format!("could not delete {}", db_name))?;
    JsFuture::from(request_to_promise(req.unchecked_ref(), || {}))
        .await
        .map_err(|err| js_error(ErrorKind::Open, format!("could not delete {}", db_name), &err))?;
    Ok(())
}

/// Resolve after `duration` using the global `setTimeout`.
pub async fn sleep(duration: Duration) {
    let millis = duration.as_millis().min(i32::MAX as u128) as i32;
    let promise = Promise::new(&mut |resolve, _reject| {
        let global = js_sys::global();
        let scheduled = js_sys::Reflect::get(&global, &"setTimeout".into())
            .and_then(|set_timeout| set_timeout.dyn_into::<Function>())
            .and_then(|set_timeout| {
                set_timeout.call2(&global, &resolve, &JsValue::from(millis))
            });
        // Without a timer, resolve right away rather than hang.
        if scheduled.is_err() {
            let _ = resolve.call0(&JsValue::UNDEFINED);
        }
    });
    let _ = JsFuture::from(promise).await;
}
