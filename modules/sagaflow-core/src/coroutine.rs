//! Bridges `async` saga bodies to the interpreter.
//!
//! A saga body is an ordinary `async` block that talks to the interpreter
//! through its [`Ctx`]. Awaiting [`Ctx::perform`] parks the effect in the
//! task's [`Exchange`] and returns `Pending`; the interpreter picks the
//! effect up, runs it, and polls the body again with the result in place.
//! Bodies are only ever polled by the interpreter, with a no-op waker.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::{FutureExt, LocalBoxFuture};
use futures::task::noop_waker_ref;

use crate::channel::Channel;
use crate::effect::Effect;
use crate::effects;
use crate::error::{Result, SagaError};
use crate::task::{Task, TaskId};
use crate::value::{Action, Pattern, Value};

type Body = Box<dyn FnOnce(Ctx) -> LocalBoxFuture<'static, Result<Value>>>;

/// A named, not-yet-started computation.
pub struct Saga {
    name: Rc<str>,
    body: Body,
}

impl Saga {
    /// ```ignore
    /// let saga = Saga::new("watch-login", |ctx| async move {
    ///     let action = ctx.take("LOGIN").await?;
    ///     ctx.put(Action::new("LOGGED_IN").with_payload(action.payload)).await?;
    ///     Ok(())
    /// });
    /// ```
    pub fn new<F, Fut, V>(name: impl Into<String>, body: F) -> Self
    where
        F: FnOnce(Ctx) -> Fut + 'static,
        Fut: Future<Output = Result<V>> + 'static,
        V: Into<Value>,
    {
        let name: String = name.into();
        Self {
            name: Rc::from(name),
            body: Box::new(move |ctx| async move { body(ctx).await.map(Into::into) }.boxed_local()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn shared_name(&self) -> Rc<str> {
        self.name.clone()
    }
}

impl fmt::Debug for Saga {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Saga").field("name", &self.name).finish()
    }
}

// ---------------------------------------------------------------------------
// Exchange
// ---------------------------------------------------------------------------

/// One-slot mailbox between a body and the interpreter.
#[derive(Default)]
pub(crate) struct Exchange {
    effect: RefCell<Option<Effect>>,
    /// Set when a second effect arrives in the same step.
    extra: Cell<bool>,
    input: RefCell<Option<Result<Value>>>,
}

/// Future returned by [`Ctx::perform`].
pub struct Perform {
    effect: Option<Effect>,
    exchange: Rc<Exchange>,
}

impl Future for Perform {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(effect) = self.effect.take() {
            let mut slot = self.exchange.effect.borrow_mut();
            if slot.is_some() {
                self.exchange.extra.set(true);
            } else {
                *slot = Some(effect);
            }
            return Poll::Pending;
        }
        match self.exchange.input.borrow_mut().take() {
            Some(result) => Poll::Ready(result),
            None => Poll::Pending,
        }
    }
}

// ---------------------------------------------------------------------------
// Ctx
// ---------------------------------------------------------------------------

/// A saga's handle on the interpreter.
#[derive(Clone)]
pub struct Ctx {
    task: TaskId,
    exchange: Rc<Exchange>,
}

impl Ctx {
    pub fn task_id(&self) -> TaskId {
        self.task
    }

    /// Yield `effect` and resume with its result.
    pub fn perform(&self, effect: Effect) -> Perform {
        Perform {
            effect: Some(effect),
            exchange: self.exchange.clone(),
        }
    }

    pub async fn take(&self, pattern: impl Into<Pattern>) -> Result<Action> {
        let value = self.perform(effects::take(pattern)).await?;
        value
            .into_action()
            .ok_or_else(|| SagaError::invalid("bus delivered a value that is not an action"))
    }

    pub async fn take_from(&self, channel: &Channel, pattern: impl Into<Pattern>) -> Result<Value> {
        self.perform(effects::take_from(channel, pattern)).await
    }

    pub async fn put(&self, action: impl Into<Action>) -> Result<()> {
        self.perform(effects::put(action)).await.map(drop)
    }

    pub async fn put_to(&self, channel: &Channel, value: impl Into<Value>) -> Result<()> {
        self.perform(effects::put_to(channel, value)).await.map(drop)
    }

    pub async fn call<F, R>(&self, name: impl Into<String>, func: F) -> Result<Value>
    where
        F: FnOnce() -> R + 'static,
        R: Into<crate::effect::CallResult>,
    {
        self.perform(effects::call(name, func)).await
    }

    pub async fn fork(&self, saga: Saga) -> Result<Task> {
        let value = self.perform(effects::fork(saga)).await?;
        value
            .into_task()
            .ok_or_else(|| SagaError::invalid("fork resumed without a task handle"))
    }

    pub async fn spawn(&self, saga: Saga) -> Result<Task> {
        let value = self.perform(effects::spawn(saga)).await?;
        value
            .into_task()
            .ok_or_else(|| SagaError::invalid("spawn resumed without a task handle"))
    }

    pub async fn join(&self, task: &Task) -> Result<Value> {
        self.perform(effects::join(task)).await
    }

    pub async fn all(&self, members: Vec<Effect>) -> Result<Vec<Value>> {
        let value = self.perform(effects::all(members)).await?;
        value
            .into_list()
            .ok_or_else(|| SagaError::invalid("all resumed without a result list"))
    }

    pub async fn race<K, I>(&self, members: I) -> Result<Value>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Effect)>,
    {
        self.perform(effects::race(members)).await
    }

    pub async fn cancel(&self, task: &Task) -> Result<()> {
        self.perform(effects::cancel(task)).await.map(drop)
    }

    /// Never resumes: the task is cancelled at this point.
    pub async fn cancel_self(&self) -> Result<()> {
        self.perform(effects::cancel_self()).await.map(drop)
    }

    pub async fn select<F, V>(&self, selector: F) -> Result<Value>
    where
        F: FnOnce(&serde_json::Value) -> V + 'static,
        V: Into<Value>,
    {
        self.perform(effects::select(selector)).await
    }

    pub async fn delay(&self, duration: Duration) -> Result<()> {
        self.perform(effects::delay(duration)).await.map(drop)
    }
}

// ---------------------------------------------------------------------------
// Coroutine
// ---------------------------------------------------------------------------

pub(crate) enum Step {
    Yield(Effect),
    Complete(Result<Value>),
}

/// A started body. Dropping it runs the body's destructors.
pub(crate) struct Coroutine {
    future: LocalBoxFuture<'static, Result<Value>>,
    exchange: Rc<Exchange>,
}

impl Coroutine {
    /// The body closure itself runs on the first [`resume`](Self::resume).
    pub(crate) fn new(saga: Saga, task: TaskId) -> Self {
        let exchange = Rc::new(Exchange::default());
        let ctx = Ctx {
            task,
            exchange: exchange.clone(),
        };
        let body = saga.body;
        Self {
            future: Box::pin(async move { body(ctx).await }),
            exchange,
        }
    }

    pub(crate) fn resume(&mut self, input: Option<Result<Value>>) -> Step {
        *self.exchange.input.borrow_mut() = input;
        let mut cx = Context::from_waker(noop_waker_ref());
        let poll = self.future.as_mut().poll(&mut cx);

        self.exchange.input.borrow_mut().take();
        let effect = self.exchange.effect.borrow_mut().take();
        let extra = self.exchange.extra.replace(false);

        match poll {
            Poll::Ready(result) => Step::Complete(result),
            Poll::Pending if extra => Step::Complete(Err(SagaError::invalid(
                "more than one effect yielded in a single step; combine them with `all` or `race`",
            ))),
            Poll::Pending => match effect {
                Some(effect) => Step::Yield(effect),
                None => Step::Complete(Err(SagaError::ForeignAwait)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(saga: Saga) -> Coroutine {
        Coroutine::new(saga, TaskId(1))
    }

    #[test]
    fn yields_then_completes_with_input() {
        let mut co = started(Saga::new("echo", |ctx| async move {
            let action = ctx.take("ping").await?;
            Ok(action.kind)
        }));

        let Step::Yield(effect) = co.resume(None) else {
            panic!("expected a yielded effect");
        };
        assert_eq!(effect.kind(), "take");

        match co.resume(Some(Ok(Action::new("ping").into()))) {
            Step::Complete(Ok(value)) => assert_eq!(value, Value::from("ping")),
            _ => panic!("expected completion"),
        }
    }

    #[test]
    fn error_input_surfaces_at_the_yield_point() {
        let mut co = started(Saga::new("caught", |ctx| async move {
            match ctx.call("boom", || Err::<(), _>(SagaError::msg("boom"))).await {
                Ok(_) => Ok("no error"),
                Err(_) => Ok("caught"),
            }
        }));

        assert!(matches!(co.resume(None), Step::Yield(_)));
        match co.resume(Some(Err(SagaError::msg("boom")))) {
            Step::Complete(Ok(value)) => assert_eq!(value, Value::from("caught")),
            _ => panic!("expected completion"),
        }
    }

    #[test]
    fn two_effects_in_one_step_are_rejected() {
        let mut co = started(Saga::new("greedy", |ctx| async move {
            let (a, b) = futures::join!(ctx.take("a"), ctx.take("b"));
            a?;
            b?;
            Ok(())
        }));

        match co.resume(None) {
            Step::Complete(Err(SagaError::InvalidEffect(_))) => {}
            _ => panic!("expected an invalid effect error"),
        }
    }

    #[test]
    fn foreign_future_is_reported() {
        let mut co = started(Saga::new("foreign", |_ctx| async move {
            futures::future::pending::<()>().await;
            Ok(())
        }));

        assert!(matches!(
            co.resume(None),
            Step::Complete(Err(SagaError::ForeignAwait))
        ));
    }
}
