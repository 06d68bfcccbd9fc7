//! Public entry point: binds sagas to a host's dispatch path.

use std::rc::Rc;

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::config::SagaConfig;
use crate::coroutine::Saga;
use crate::error::Result;
use crate::runner::Runtime;
use crate::task::Task;
use crate::traits::{Host, Monitor};
use crate::value::Action;

/// Runs sagas against a [`Host`].
///
/// Every action the host dispatches must go through [`dispatch`](Self::dispatch):
/// it is forwarded to the host first and then offered to waiting sagas.
/// Single-threaded: neither the middleware nor its tasks are `Send`.
#[derive(Clone)]
pub struct SagaMiddleware {
    runtime: Rc<Runtime>,
}

impl SagaMiddleware {
    pub fn new(host: impl Host + 'static) -> Self {
        Self::with_config(host, SagaConfig::default())
    }

    pub fn with_config(host: impl Host + 'static, config: SagaConfig) -> Self {
        Self {
            runtime: Runtime::new(Rc::new(host), config),
        }
    }

    pub fn with_monitor(self, monitor: impl Monitor + 'static) -> Self {
        self.runtime.set_monitor(Rc::new(monitor));
        self
    }

    /// Start `saga` as a root task. It runs until its first suspension
    /// before this returns.
    pub fn run(&self, saga: Saga) -> Task {
        self.runtime.run(saga)
    }

    /// Forward `action` to the host, then wake matching takers.
    ///
    /// Called from inside a saga turn (a CALL function, a host reducer), the
    /// action is queued behind the current turn and failures are only logged.
    pub fn dispatch(&self, action: impl Into<Action>) -> Result<()> {
        self.runtime.dispatch(action.into())
    }

    /// Deliver END: pending and future bus takes of existing tasks end.
    pub fn end(&self) {
        self.runtime.end()
    }

    pub fn state(&self) -> serde_json::Value {
        self.runtime.host_state()
    }

    pub fn config(&self) -> &SagaConfig {
        self.runtime.config()
    }

    /// Unbounded channel sized by `expanding_buffer_initial`.
    pub fn channel(&self) -> Channel {
        Channel::new(Buffer::expanding(self.config().expanding_buffer_initial))
    }

    /// Tasks that have not reached a terminal state.
    pub fn live_tasks(&self) -> usize {
        self.runtime.live_tasks()
    }
}
