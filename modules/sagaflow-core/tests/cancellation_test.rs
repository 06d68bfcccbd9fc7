//! Cancellation, abort propagation and malformed effects.

use std::cell::RefCell;
use std::rc::Rc;

use futures::executor::block_on;

use sagaflow_core::{
    effects, MemoryMonitor, MonitorEvent, Saga, SagaError, SagaMiddleware, Task, TaskOutcome,
    TaskStatus, Value,
};

type Log<T> = Rc<RefCell<Vec<T>>>;

fn log<T>() -> Log<T> {
    Rc::new(RefCell::new(Vec::new()))
}

/// Records its name when the owning saga body is dropped.
struct Guard {
    name: &'static str,
    log: Log<&'static str>,
}

impl Drop for Guard {
    fn drop(&mut self) {
        self.log.borrow_mut().push(self.name);
    }
}

fn guarded_waiter(name: &'static str, log: Log<&'static str>) -> Saga {
    Saga::new(name, move |ctx| async move {
        let _guard = Guard { name, log };
        ctx.take("never").await?;
        Ok(())
    })
}

fn failing(name: &'static str, message: &'static str) -> Saga {
    Saga::new(name, move |ctx| async move {
        ctx.call("boom", move || Err::<(), _>(SagaError::msg(message)))
            .await?;
        Ok(())
    })
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[test]
fn cancel_runs_children_cleanup_before_parent_cleanup() {
    let cleanups = log();
    let mw = SagaMiddleware::new(());

    let guards = cleanups.clone();
    let task = mw.run(Saga::new("parent", move |ctx| async move {
        let _guard = Guard {
            name: "parent",
            log: guards.clone(),
        };
        ctx.fork(guarded_waiter("child", guards)).await?;
        ctx.take("never").await?;
        Ok(())
    }));
    assert_eq!(task.status(), TaskStatus::Suspended);
    assert_eq!(mw.live_tasks(), 2);

    task.cancel();

    assert_eq!(*cleanups.borrow(), vec!["child", "parent"]);
    assert!(task.is_cancelled());
    assert!(matches!(task.outcome(), Some(TaskOutcome::Cancelled)));
    assert_eq!(mw.live_tasks(), 0);

    // takers went away with their tasks
    mw.dispatch("never").unwrap();
    assert_eq!(cleanups.borrow().len(), 2);
}

#[test]
fn cancelling_twice_is_a_noop() {
    let cleanups = log();
    let mw = SagaMiddleware::new(());

    let task = mw.run(guarded_waiter("waiter", cleanups.clone()));
    task.cancel();
    task.cancel();

    assert_eq!(*cleanups.borrow(), vec!["waiter"]);
    assert_eq!(task.status(), TaskStatus::Cancelled);
}

#[test]
fn cancelling_a_finished_task_keeps_its_outcome() {
    let mw = SagaMiddleware::new(());
    let task = mw.run(Saga::new("quick", |_ctx| async move { Ok(7) }));

    task.cancel();

    assert!(matches!(
        task.outcome(),
        Some(TaskOutcome::Done(Value::Json(n))) if n == 7
    ));
}

#[test]
fn joining_a_cancelled_task_yields_unit() {
    let results: Log<Value> = log();
    let cleanups = log();
    let mw = SagaMiddleware::new(());

    let (sink, guards) = (results.clone(), cleanups.clone());
    let task = mw.run(Saga::new("root", move |ctx| async move {
        let child = ctx.fork(guarded_waiter("child", guards)).await?;
        ctx.cancel(&child).await?;
        // a second cancel is accepted and does nothing
        ctx.cancel(&child).await?;
        let joined = ctx.join(&child).await?;
        sink.borrow_mut().push(joined);
        Ok(child.is_cancelled())
    }));

    assert_eq!(*results.borrow(), vec![Value::Unit]);
    assert_eq!(*cleanups.borrow(), vec!["child"]);
    assert!(matches!(
        task.outcome(),
        Some(TaskOutcome::Done(Value::Json(serde_json::Value::Bool(true))))
    ));
}

#[test]
fn cancel_self_stops_the_body_at_that_point() {
    let cleanups = log();
    let reached = Rc::new(RefCell::new(false));
    let mw = SagaMiddleware::new(());

    let (guards, flag) = (cleanups.clone(), reached.clone());
    let task = mw.run(Saga::new("quitter", move |ctx| async move {
        let _guard = Guard {
            name: "quitter",
            log: guards,
        };
        ctx.cancel_self().await?;
        *flag.borrow_mut() = true;
        Ok(())
    }));

    assert!(!*reached.borrow());
    assert_eq!(*cleanups.borrow(), vec!["quitter"]);
    assert_eq!(task.status(), TaskStatus::Cancelled);
}

#[test]
fn race_cancels_the_losing_effects() {
    let monitor = Rc::new(MemoryMonitor::new());
    let mw = SagaMiddleware::new(()).with_monitor(monitor.clone());

    let task = mw.run(Saga::new("racer", |ctx| async move {
        let winner = ctx
            .race([("a", effects::take("a")), ("b", effects::take("b"))])
            .await?;
        let kind = winner.as_map().and_then(|m| m.keys().next().cloned());
        Ok(kind.unwrap_or_default())
    }));

    mw.dispatch("a").unwrap();

    assert!(matches!(
        task.outcome(),
        Some(TaskOutcome::Done(Value::Json(serde_json::Value::String(k)))) if k == "a"
    ));
    let cancelled = monitor
        .events()
        .into_iter()
        .filter(|e| matches!(e, MonitorEvent::EffectCancelled { .. }))
        .count();
    assert_eq!(cancelled, 1);
}

// ---------------------------------------------------------------------------
// Abort propagation
// ---------------------------------------------------------------------------

#[test]
fn child_failure_aborts_parent_and_cancels_siblings() {
    let cleanups = log();
    let mw = SagaMiddleware::new(());

    let guards = cleanups.clone();
    let task = mw.run(Saga::new("root", move |ctx| async move {
        ctx.fork(guarded_waiter("sibling", guards)).await?;
        ctx.fork(failing("doomed", "kaput")).await?;
        ctx.take("never").await?;
        Ok(())
    }));

    assert_eq!(*cleanups.borrow(), vec!["sibling"]);
    let outcome = task.outcome().expect("root should be terminal");
    assert_eq!(outcome.status(), TaskStatus::Aborted);
    assert_eq!(outcome.error().map(|e| e.to_string()), Some("kaput".into()));
    assert_eq!(mw.live_tasks(), 0);
}

#[test]
fn caught_effect_error_does_not_abort() {
    let mw = SagaMiddleware::new(());

    let task = mw.run(Saga::new("careful", |ctx| async move {
        let recovered = match ctx
            .call("boom", || Err::<(), _>(SagaError::msg("nope")))
            .await
        {
            Ok(_) => "ok".to_string(),
            Err(err) => format!("caught: {err}"),
        };
        Ok(recovered)
    }));

    let value = task.outcome().and_then(|o| o.value().cloned());
    assert_eq!(value, Some(Value::from("caught: nope")));
}

#[test]
fn parallel_failure_cancels_remaining_members() {
    let monitor = Rc::new(MemoryMonitor::new());
    let mw = SagaMiddleware::new(()).with_monitor(monitor.clone());

    let task = mw.run(Saga::new("root", |ctx| async move {
        let result = ctx
            .all(vec![
                effects::take("never"),
                effects::call("boom", || Err::<(), _>(SagaError::msg("first failure"))),
            ])
            .await;
        Ok(result.err().map(|e| e.to_string()).unwrap_or_default())
    }));

    assert_eq!(
        task.outcome().and_then(|o| o.value().cloned()),
        Some(Value::from("first failure"))
    );
    assert!(monitor
        .events()
        .iter()
        .any(|e| matches!(e, MonitorEvent::EffectCancelled { .. })));
}

#[test]
fn parent_waits_for_attached_children() {
    let mw = SagaMiddleware::new(());

    let task = mw.run(Saga::new("root", |ctx| async move {
        ctx.fork(Saga::new("child", |ctx| async move {
            ctx.take("go").await?;
            Ok(())
        }))
        .await?;
        Ok(42)
    }));

    assert_eq!(task.status(), TaskStatus::Suspended);
    assert!(task.outcome().is_none());

    mw.dispatch("go").unwrap();

    assert_eq!(task.outcome().and_then(|o| o.value().cloned()), Some(Value::from(42)));
}

#[test]
fn spawned_failure_stays_detached() {
    let mw = SagaMiddleware::new(());
    let spawned: Rc<RefCell<Option<Task>>> = Rc::new(RefCell::new(None));

    let slot = spawned.clone();
    let task = mw.run(Saga::new("root", move |ctx| async move {
        let child = ctx.spawn(failing("loner", "detached failure")).await?;
        *slot.borrow_mut() = Some(child);
        ctx.spawn(Saga::new("idler", |ctx| async move {
            ctx.take("never").await?;
            Ok(())
        }))
        .await?;
        Ok(())
    }));

    assert!(matches!(task.outcome(), Some(TaskOutcome::Done(Value::Unit))));
    let child = spawned.borrow().clone().unwrap();
    assert_eq!(child.status(), TaskStatus::Aborted);
    // the idler is not waited for and keeps running
    assert_eq!(mw.live_tasks(), 1);
}

#[test]
fn joining_a_failed_task_raises_at_the_join() {
    let results: Log<String> = log();
    let mw = SagaMiddleware::new(());

    let sink = results.clone();
    let task = mw.run(Saga::new("root", move |ctx| async move {
        let child = ctx
            .spawn(Saga::new("worker", |ctx| async move {
                ctx.take("go").await?;
                Err::<(), _>(SagaError::msg("worker failed"))
            }))
            .await?;
        if let Err(err) = ctx.join(&child).await {
            sink.borrow_mut().push(err.to_string());
        }
        Ok(())
    }));

    assert!(task.is_running());
    mw.dispatch("go").unwrap();

    assert_eq!(*results.borrow(), vec!["worker failed"]);
    assert!(matches!(block_on(task.done()), TaskOutcome::Done(_)));
}

#[test]
fn root_failure_surfaces_on_its_handle() {
    let mw = SagaMiddleware::new(());
    let task = mw.run(failing("root", "root failed"));

    let outcome = block_on(task.done());
    assert_eq!(outcome.status(), TaskStatus::Aborted);
    assert_eq!(
        outcome.into_result().unwrap_err().to_string(),
        "root failed"
    );
}

// ---------------------------------------------------------------------------
// Malformed effects
// ---------------------------------------------------------------------------

fn invalid_effect(outcome: Option<TaskOutcome>) -> bool {
    matches!(
        outcome,
        Some(TaskOutcome::Aborted(SagaError::InvalidEffect(_)))
    )
}

#[test]
fn empty_race_is_rejected() {
    let mw = SagaMiddleware::new(());
    let task = mw.run(Saga::new("root", |ctx| async move {
        ctx.race(Vec::<(String, _)>::new()).await?;
        Ok(())
    }));
    assert!(invalid_effect(task.outcome()));
}

#[test]
fn duplicate_race_keys_are_rejected() {
    let mw = SagaMiddleware::new(());
    let task = mw.run(Saga::new("root", |ctx| async move {
        ctx.race([("x", effects::take("a")), ("x", effects::take("b"))])
            .await?;
        Ok(())
    }));
    assert!(invalid_effect(task.outcome()));
}

#[test]
fn joining_itself_is_rejected() {
    let mw = SagaMiddleware::new(());
    let handle: Rc<RefCell<Option<Task>>> = Rc::new(RefCell::new(None));

    let slot = handle.clone();
    let child_slot = handle.clone();
    mw.run(Saga::new("root", move |ctx| async move {
        let child = ctx
            .fork(Saga::new("narcissist", move |ctx| async move {
                ctx.take("go").await?;
                let me = child_slot.borrow().clone().unwrap();
                let verdict = match ctx.join(&me).await {
                    Err(SagaError::InvalidEffect(_)) => "rejected",
                    _ => "accepted",
                };
                Ok(verdict)
            }))
            .await?;
        *slot.borrow_mut() = Some(child);
        Ok(())
    }));

    mw.dispatch("go").unwrap();

    let child = handle.borrow().clone().unwrap();
    assert_eq!(
        child.outcome().and_then(|o| o.value().cloned()),
        Some(Value::from("rejected"))
    );
}

#[test]
fn joining_a_task_from_another_middleware_is_rejected() {
    let other = SagaMiddleware::new(());
    let foreign = other.run(Saga::new("elsewhere", |ctx| async move {
        ctx.take("never").await?;
        Ok(())
    }));

    let mw = SagaMiddleware::new(());
    let task = mw.run(Saga::new("root", move |ctx| async move {
        ctx.join(&foreign).await?;
        Ok(())
    }));
    assert!(invalid_effect(task.outcome()));
}

#[test]
fn awaiting_a_foreign_future_aborts_the_task() {
    let mw = SagaMiddleware::new(());
    let task = mw.run(Saga::new("root", |_ctx| async move {
        futures::future::pending::<()>().await;
        Ok(())
    }));
    assert!(matches!(
        task.outcome(),
        Some(TaskOutcome::Aborted(SagaError::ForeignAwait))
    ));
}
