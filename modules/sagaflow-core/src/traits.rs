//! Contracts between the interpreter and the outside world.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::Result;
use serde::Serialize;
use tracing::warn;

use crate::monitor::MonitorEvent;
use crate::value::Action;

/// The host's side of the dispatch path.
///
/// Every action reaching the bus is forwarded here before any taker sees it,
/// so state changes made by the host are visible to the sagas it wakes.
pub trait Host {
    /// Hand the action to the rest of the host's dispatch chain.
    fn forward(&self, action: &Action) -> Result<()>;

    /// Snapshot of host state, read by `select`. Stateless hosts return null.
    fn state(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

/// A host with no state and no reducers.
impl Host for () {
    fn forward(&self, _action: &Action) -> Result<()> {
        Ok(())
    }
}

impl<H: Host + ?Sized> Host for Rc<H> {
    fn forward(&self, action: &Action) -> Result<()> {
        (**self).forward(action)
    }

    fn state(&self) -> serde_json::Value {
        (**self).state()
    }
}

/// Pure state updates. No I/O, no side effects.
pub trait Reducer<S> {
    fn reduce(&self, state: &mut S, action: &Action);
}

impl<S, F> Reducer<S> for F
where
    F: Fn(&mut S, &Action),
{
    fn reduce(&self, state: &mut S, action: &Action) {
        self(state, action)
    }
}

/// Minimal store: one state value updated by one reducer.
pub struct ReducerHost<S, R> {
    state: RefCell<S>,
    reducer: R,
}

impl<S, R> ReducerHost<S, R>
where
    R: Reducer<S>,
{
    pub fn new(initial: S, reducer: R) -> Self {
        Self {
            state: RefCell::new(initial),
            reducer,
        }
    }

    pub fn with_state<T>(&self, f: impl FnOnce(&S) -> T) -> T {
        f(&self.state.borrow())
    }
}

impl<S, R> Host for ReducerHost<S, R>
where
    S: Serialize,
    R: Reducer<S>,
{
    fn forward(&self, action: &Action) -> Result<()> {
        self.reducer.reduce(&mut self.state.borrow_mut(), action);
        Ok(())
    }

    fn state(&self) -> serde_json::Value {
        serde_json::to_value(&*self.state.borrow()).unwrap_or_else(|err| {
            warn!(error = %err, "host state is not serializable");
            serde_json::Value::Null
        })
    }
}

/// Observer of interpreter activity.
///
/// Called synchronously from the driver loop; implementations must not block.
pub trait Monitor {
    fn record(&self, event: MonitorEvent);
}

impl<M: Monitor + ?Sized> Monitor for Rc<M> {
    fn record(&self, event: MonitorEvent) {
        (**self).record(event)
    }
}
