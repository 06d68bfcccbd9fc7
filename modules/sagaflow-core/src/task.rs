//! Public task handles and their completion signal.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};

use serde::Serialize;

use crate::error::SagaError;
use crate::runner::Runtime;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TaskId(pub(crate) u64);

impl TaskId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Running,
    /// Waiting on an effect, or on attached children after the body returned.
    Suspended,
    Done,
    Cancelled,
    Aborted,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Cancelled | TaskStatus::Aborted
        )
    }
}

#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Done(Value),
    Cancelled,
    Aborted(SagaError),
}

impl TaskOutcome {
    pub fn status(&self) -> TaskStatus {
        match self {
            TaskOutcome::Done(_) => TaskStatus::Done,
            TaskOutcome::Cancelled => TaskStatus::Cancelled,
            TaskOutcome::Aborted(_) => TaskStatus::Aborted,
        }
    }

    /// Cancellation is not a failure: it yields unit.
    pub fn into_result(self) -> Result<Value, SagaError> {
        match self {
            TaskOutcome::Done(value) => Ok(value),
            TaskOutcome::Cancelled => Ok(Value::Unit),
            TaskOutcome::Aborted(err) => Err(err),
        }
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            TaskOutcome::Done(value) => Some(value),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&SagaError> {
        match self {
            TaskOutcome::Aborted(err) => Some(err),
            _ => None,
        }
    }
}

/// Fires once when the task becomes terminal.
#[derive(Default)]
pub(crate) struct Completion {
    outcome: RefCell<Option<TaskOutcome>>,
    wakers: RefCell<Vec<Waker>>,
}

impl Completion {
    pub(crate) fn complete(&self, outcome: TaskOutcome) {
        if self.outcome.borrow().is_some() {
            return;
        }
        *self.outcome.borrow_mut() = Some(outcome);
        let wakers = std::mem::take(&mut *self.wakers.borrow_mut());
        for waker in wakers {
            waker.wake();
        }
    }

    pub(crate) fn outcome(&self) -> Option<TaskOutcome> {
        self.outcome.borrow().clone()
    }
}

/// Handle to a running or finished task.
#[derive(Clone)]
pub struct Task {
    pub(crate) id: TaskId,
    pub(crate) name: Rc<str>,
    pub(crate) completion: Rc<Completion>,
    pub(crate) runtime: Weak<Runtime>,
}

impl Task {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn outcome(&self) -> Option<TaskOutcome> {
        self.completion.outcome()
    }

    pub fn status(&self) -> TaskStatus {
        if let Some(outcome) = self.completion.outcome() {
            return outcome.status();
        }
        self.runtime
            .upgrade()
            .and_then(|rt| rt.status_of(self.id))
            .unwrap_or(TaskStatus::Cancelled)
    }

    pub fn is_running(&self) -> bool {
        !self.status().is_terminal()
    }

    pub fn is_cancelled(&self) -> bool {
        self.status() == TaskStatus::Cancelled
    }

    /// Cancel this task and its attached subtree. No-op once terminal.
    pub fn cancel(&self) {
        if let Some(rt) = self.runtime.upgrade() {
            rt.enter(|rt| rt.cancel_task(self.id));
        }
    }

    /// Resolves with the outcome once the task is terminal.
    pub fn done(&self) -> Done {
        Done {
            completion: self.completion.clone(),
        }
    }

    pub(crate) fn belongs_to(&self, runtime: &Weak<Runtime>) -> bool {
        Weak::ptr_eq(&self.runtime, runtime)
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Rc::ptr_eq(&self.completion, &other.completion)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status())
            .finish()
    }
}

/// Future returned by [`Task::done`].
pub struct Done {
    completion: Rc<Completion>,
}

impl Future for Done {
    type Output = TaskOutcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<TaskOutcome> {
        match self.completion.outcome() {
            Some(outcome) => Poll::Ready(outcome),
            None => {
                let mut wakers = self.completion.wakers.borrow_mut();
                if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use futures::task::{noop_waker_ref, waker, ArcWake};

    use super::*;

    #[derive(Default)]
    struct CountingWaker(AtomicUsize);

    impl ArcWake for CountingWaker {
        fn wake_by_ref(arc_self: &Arc<Self>) {
            arc_self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn poll_once(done: &mut Done, waker: &Waker) -> Poll<TaskOutcome> {
        Pin::new(done).poll(&mut Context::from_waker(waker))
    }

    #[test]
    fn repeated_polls_register_one_waker() {
        let completion = Rc::new(Completion::default());
        let mut done = Done {
            completion: completion.clone(),
        };

        for _ in 0..5 {
            assert!(poll_once(&mut done, noop_waker_ref()).is_pending());
        }
        assert_eq!(completion.wakers.borrow().len(), 1);

        completion.complete(TaskOutcome::Cancelled);
        assert!(matches!(
            poll_once(&mut done, noop_waker_ref()),
            Poll::Ready(TaskOutcome::Cancelled)
        ));
        assert!(completion.wakers.borrow().is_empty());
    }

    #[test]
    fn each_distinct_waker_is_woken_once() {
        let completion = Rc::new(Completion::default());
        let counter = Arc::new(CountingWaker::default());
        let counting = waker(counter.clone());

        let mut first = Done {
            completion: completion.clone(),
        };
        let mut second = Done {
            completion: completion.clone(),
        };
        assert!(poll_once(&mut first, &counting).is_pending());
        assert!(poll_once(&mut first, &counting).is_pending());
        assert!(poll_once(&mut second, noop_waker_ref()).is_pending());
        assert_eq!(completion.wakers.borrow().len(), 2);

        completion.complete(TaskOutcome::Done(Value::Unit));
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }
}
