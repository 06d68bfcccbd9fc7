//! Single-assignment result cell for CALLs that settle later.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::warn;

use crate::error::SagaError;
use crate::value::Value;

type Listener = Box<dyn FnOnce(Result<Value, SagaError>)>;

#[derive(Default)]
struct DeferredState {
    outcome: RefCell<Option<Result<Value, SagaError>>>,
    listener: RefCell<Option<Listener>>,
    abort: RefCell<Option<AbortHandle>>,
}

/// A result that is not available yet.
///
/// Settled at most once, either by hand ([`resolve`](Self::resolve),
/// [`reject`](Self::reject)) or by a future spawned with
/// [`spawn_local`](Self::spawn_local). Feeds exactly one CALL.
#[derive(Clone, Default)]
pub struct Deferred {
    state: Rc<DeferredState>,
}

impl Deferred {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolved(value: impl Into<Value>) -> Self {
        let deferred = Self::new();
        deferred.resolve(value);
        deferred
    }

    /// Run `future` on the current tokio `LocalSet` and settle with its output.
    ///
    /// Outside a `LocalSet` the deferred comes back already rejected with
    /// [`SagaError::NoLocalSet`], so the CALL fails at its yield point.
    pub fn spawn_local<F, V, E>(future: F) -> Self
    where
        F: Future<Output = Result<V, E>> + 'static,
        V: Into<Value>,
        E: Into<SagaError>,
    {
        let deferred = Self::new();
        if Handle::try_current().is_err() {
            deferred.reject(SagaError::NoLocalSet);
            return deferred;
        }

        let settle = deferred.clone();
        let task = async move {
            let outcome = future.await.map(Into::into).map_err(Into::into);
            settle.settle(outcome);
        };
        // tokio only reports a missing LocalSet by panicking
        match panic::catch_unwind(AssertUnwindSafe(|| tokio::task::spawn_local(task))) {
            Ok(handle) => *deferred.state.abort.borrow_mut() = Some(handle.abort_handle()),
            Err(_) => {
                warn!("spawn_local called outside a LocalSet");
                deferred.reject(SagaError::NoLocalSet);
            }
        }
        deferred
    }

    pub fn resolve(&self, value: impl Into<Value>) -> bool {
        self.settle(Ok(value.into()))
    }

    pub fn reject(&self, error: impl Into<SagaError>) -> bool {
        self.settle(Err(error.into()))
    }

    /// Returns false if the deferred was already settled.
    pub fn settle(&self, outcome: Result<Value, SagaError>) -> bool {
        if self.state.outcome.borrow().is_some() {
            return false;
        }
        *self.state.outcome.borrow_mut() = Some(outcome.clone());
        self.state.abort.borrow_mut().take();

        let listener = self.state.listener.borrow_mut().take();
        if let Some(listener) = listener {
            listener(outcome);
        }
        true
    }

    pub fn is_settled(&self) -> bool {
        self.state.outcome.borrow().is_some()
    }

    pub fn outcome(&self) -> Option<Result<Value, SagaError>> {
        self.state.outcome.borrow().clone()
    }

    /// Runs `listener` now if already settled, otherwise on settlement.
    pub(crate) fn subscribe(&self, listener: impl FnOnce(Result<Value, SagaError>) + 'static) {
        let ready = self.state.outcome.borrow().clone();
        match ready {
            Some(outcome) => listener(outcome),
            None => *self.state.listener.borrow_mut() = Some(Box::new(listener)),
        }
    }

    /// Drop the listener and stop any backing future.
    pub(crate) fn unsubscribe(&self) {
        let listener = self.state.listener.borrow_mut().take();
        drop(listener);
        if let Some(handle) = self.state.abort.borrow_mut().take() {
            handle.abort();
        }
    }
}

impl fmt::Debug for Deferred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("outcome", &*self.state.outcome.borrow())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settles_once() {
        let deferred = Deferred::new();
        assert!(deferred.resolve(1));
        assert!(!deferred.resolve(2));
        assert!(!deferred.reject(SagaError::msg("late")));
        assert_eq!(deferred.outcome().unwrap().unwrap(), Value::from(1));
    }

    #[test]
    fn listener_fires_on_settle_or_immediately() {
        let seen = Rc::new(RefCell::new(Vec::new()));

        let pending = Deferred::new();
        let sink = seen.clone();
        pending.subscribe(move |r| sink.borrow_mut().push(r.unwrap()));
        assert!(seen.borrow().is_empty());
        pending.resolve("later");

        let sink = seen.clone();
        Deferred::resolved("now").subscribe(move |r| sink.borrow_mut().push(r.unwrap()));

        assert_eq!(*seen.borrow(), vec![Value::from("later"), Value::from("now")]);
    }

    #[test]
    fn unsubscribed_listener_is_dropped() {
        let seen = Rc::new(RefCell::new(0));
        let deferred = Deferred::new();
        let sink = seen.clone();
        deferred.subscribe(move |_| *sink.borrow_mut() += 1);
        deferred.unsubscribe();
        deferred.resolve(());
        assert_eq!(*seen.borrow(), 0);
    }

    fn rejected_with_no_local_set(deferred: &Deferred) -> bool {
        matches!(deferred.outcome(), Some(Err(SagaError::NoLocalSet)))
    }

    #[test]
    fn spawn_local_without_runtime_rejects() {
        let deferred = Deferred::spawn_local(async { Ok::<_, SagaError>(1) });
        assert!(rejected_with_no_local_set(&deferred));
    }

    #[tokio::test]
    async fn spawn_local_outside_local_set_rejects() {
        let deferred = Deferred::spawn_local(async { Ok::<_, SagaError>(1) });
        assert!(rejected_with_no_local_set(&deferred));
    }

    #[tokio::test]
    async fn spawn_local_inside_local_set_settles() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let deferred = Deferred::spawn_local(async { Ok::<_, SagaError>(5) });
                while !deferred.is_settled() {
                    tokio::task::yield_now().await;
                }
                assert_eq!(deferred.outcome().unwrap().unwrap(), Value::from(5));
            })
            .await;
    }
}
