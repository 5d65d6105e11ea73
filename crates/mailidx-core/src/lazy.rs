//! Memoised, resettable asynchronous initialiser
//!
//! Concurrent callers of [`LazyHandle::get_async`] share a single in-flight
//! future. The outcome, success or failure, stays cached until
//! [`LazyHandle::reset`].

use std::cell::{Cell, RefCell};
use std::future::Future;

use futures::future::{FutureExt, LocalBoxFuture, Shared};

use crate::error::{DbError, Result};

type Loader<T> = Box<dyn Fn() -> LocalBoxFuture<'static, Result<T>>>;

enum State<T> {
    Empty,
    Pending(Shared<LocalBoxFuture<'static, Result<T>>>),
    Loaded(T),
    Failed(DbError),
}

/// Single-flight lazy value.
pub struct LazyHandle<T> {
    loader: Loader<T>,
    state: RefCell<State<T>>,
    // Bumped on reset so a load started earlier cannot repopulate the cache.
    generation: Cell<u64>,
}

impl<T: Clone + 'static> LazyHandle<T> {
    pub fn new<F, Fut>(loader: F) -> Self
    where
        F: Fn() -> Fut + 'static,
        Fut: Future<Output = Result<T>> + 'static,
    {
        Self {
            loader: Box::new(move || loader().boxed_local()),
            state: RefCell::new(State::Empty),
            generation: Cell::new(0),
        }
    }

    /// Return the cached outcome, joining or starting the load as needed.
    pub async fn get_async(&self) -> Result<T> {
        let (pending, generation) = {
            let mut state = self.state.borrow_mut();
            let pending = match &*state {
                State::Loaded(value) => return Ok(value.clone()),
                State::Failed(err) => return Err(err.clone()),
                State::Pending(pending) => pending.clone(),
                State::Empty => {
                    let pending = (self.loader)().shared();
                    *state = State::Pending(pending.clone());
                    pending
                }
            };
            (pending, self.generation.get())
        };

        let outcome = pending.await;

        if self.generation.get() == generation {
            let mut state = self.state.borrow_mut();
            if matches!(*state, State::Pending(_)) {
                *state = match &outcome {
                    Ok(value) => State::Loaded(value.clone()),
                    Err(err) => State::Failed(err.clone()),
                };
            }
        }

        outcome
    }

    /// Whether a successfully loaded value is cached.
    pub fn is_loaded(&self) -> bool {
        matches!(*self.state.borrow(), State::Loaded(_))
    }

    /// The cached value.
    ///
    /// # Panics
    ///
    /// Panics unless [`is_loaded`](Self::is_loaded) is true.
    pub fn get_loaded(&self) -> T {
        match &*self.state.borrow() {
            State::Loaded(value) => value.clone(),
            _ => panic!("LazyHandle::get_loaded called before the value was loaded"),
        }
    }

    /// Drop the cached outcome; the next `get_async` loads again.
    ///
    /// Returns the value that was loaded, if any.
    pub fn reset(&self) -> Option<T> {
        self.generation.set(self.generation.get() + 1);
        match self.state.replace(State::Empty) {
            State::Loaded(value) => Some(value),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn counting_handle(calls: Rc<Cell<u32>>) -> LazyHandle<u32> {
        LazyHandle::new(move || {
            let calls = calls.clone();
            async move {
                tokio::task::yield_now().await;
                calls.set(calls.get() + 1);
                Ok(calls.get())
            }
        })
    }

    #[tokio::test]
    async fn test_loads_once() {
        let calls = Rc::new(Cell::new(0));
        let handle = counting_handle(calls.clone());

        assert!(!handle.is_loaded());
        assert_eq!(handle.get_async().await.unwrap(), 1);
        assert_eq!(handle.get_async().await.unwrap(), 1);
        assert!(handle.is_loaded());
        assert_eq!(handle.get_loaded(), 1);
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_load() {
        let calls = Rc::new(Cell::new(0));
        let handle = counting_handle(calls.clone());

        let (a, b, c) = tokio::join!(handle.get_async(), handle.get_async(), handle.get_async());
        assert_eq!((a.unwrap(), b.unwrap(), c.unwrap()), (1, 1, 1));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn test_reset_reloads() {
        let calls = Rc::new(Cell::new(0));
        let handle = counting_handle(calls.clone());

        handle.get_async().await.unwrap();
        assert_eq!(handle.reset(), Some(1));
        assert!(!handle.is_loaded());
        assert_eq!(handle.get_async().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_failure_is_cached() {
        let calls = Rc::new(Cell::new(0));
        let counter = calls.clone();
        let handle: LazyHandle<u32> = LazyHandle::new(move || {
            counter.set(counter.get() + 1);
            async { Err(DbError::open("boom")) }
        });

        assert!(handle.get_async().await.is_err());
        assert!(handle.get_async().await.is_err());
        assert!(!handle.is_loaded());
        assert_eq!(calls.get(), 1);

        assert_eq!(handle.reset(), None);
        assert!(handle.get_async().await.is_err());
        assert_eq!(calls.get(), 2);
    }

    #[tokio::test]
    async fn test_reset_during_load_discards_stale_result() {
        let calls = Rc::new(Cell::new(0));
        let handle = counting_handle(calls.clone());

        let (first, _) = tokio::join!(handle.get_async(), async {
            handle.reset();
        });
        assert_eq!(first.unwrap(), 1);
        assert!(!handle.is_loaded());
        assert_eq!(handle.get_async().await.unwrap(), 2);
    }

    #[test]
    #[should_panic(expected = "before the value was loaded")]
    fn test_get_loaded_before_load_panics() {
        let handle = counting_handle(Rc::new(Cell::new(0)));
        handle.get_loaded();
    }
}
