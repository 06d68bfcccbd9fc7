//! Watcher sagas built from the core effects.

use crate::coroutine::{Ctx, Saga};
use crate::error::Result;
use crate::task::Task;
use crate::value::{Action, Pattern, Value};

/// Fork `worker` for every matching action. Workers run concurrently.
pub fn take_every<F>(pattern: impl Into<Pattern>, worker: F) -> Saga
where
    F: Fn(Action) -> Saga + 'static,
{
    let pattern = pattern.into();
    Saga::new("take_every", move |ctx| every(ctx, pattern, worker))
}

/// Fork `worker` for every matching action, cancelling the previous worker
/// if it is still running.
pub fn take_latest<F>(pattern: impl Into<Pattern>, worker: F) -> Saga
where
    F: Fn(Action) -> Saga + 'static,
{
    let pattern = pattern.into();
    Saga::new("take_latest", move |ctx| latest(ctx, pattern, worker))
}

async fn every<F>(ctx: Ctx, pattern: Pattern, worker: F) -> Result<Value>
where
    F: Fn(Action) -> Saga,
{
    loop {
        let action = ctx.take(pattern.clone()).await?;
        ctx.fork(worker(action)).await?;
    }
}

async fn latest<F>(ctx: Ctx, pattern: Pattern, worker: F) -> Result<Value>
where
    F: Fn(Action) -> Saga,
{
    let mut last: Option<Task> = None;
    loop {
        let action = ctx.take(pattern.clone()).await?;
        if let Some(previous) = last.take() {
            ctx.cancel(&previous).await?;
        }
        last = Some(ctx.fork(worker(action)).await?);
    }
}
