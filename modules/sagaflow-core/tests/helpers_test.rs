//! Watcher helpers, host state selection and monitoring.

use std::cell::RefCell;
use std::rc::Rc;

use serde_json::json;

use sagaflow_core::{
    take_every, take_latest, Action, MemoryMonitor, MonitorEvent, ReducerHost, Saga,
    SagaMiddleware, TaskStatus, Value,
};

type Log<T> = Rc<RefCell<Vec<T>>>;

fn log<T>() -> Log<T> {
    Rc::new(RefCell::new(Vec::new()))
}

/// Logs the payload of `action` once a `finish` action arrives.
fn slow_worker(action: Action, sink: Log<serde_json::Value>) -> Saga {
    Saga::new("worker", move |ctx| async move {
        ctx.take("finish").await?;
        sink.borrow_mut().push(action.payload);
        Ok(())
    })
}

// ---------------------------------------------------------------------------
// take_every / take_latest
// ---------------------------------------------------------------------------

#[test]
fn take_every_runs_a_worker_per_action() {
    let seen = log();
    let mw = SagaMiddleware::new(());

    let sink = seen.clone();
    mw.run(take_every("start", move |action| slow_worker(action, sink.clone())));

    for n in 1..=3 {
        mw.dispatch(Action::new("start").with_payload(n)).unwrap();
    }
    // watcher plus three workers
    assert_eq!(mw.live_tasks(), 4);

    mw.dispatch("finish").unwrap();

    assert_eq!(*seen.borrow(), vec![json!(1), json!(2), json!(3)]);
    assert_eq!(mw.live_tasks(), 1);
}

#[test]
fn take_latest_cancels_the_previous_worker() {
    let seen = log();
    let mw = SagaMiddleware::new(());

    let sink = seen.clone();
    mw.run(take_latest("start", move |action| slow_worker(action, sink.clone())));

    mw.dispatch(Action::new("start").with_payload(1)).unwrap();
    mw.dispatch(Action::new("start").with_payload(2)).unwrap();
    assert_eq!(mw.live_tasks(), 2);

    mw.dispatch("finish").unwrap();

    assert_eq!(*seen.borrow(), vec![json!(2)]);
}

#[test]
fn take_latest_tolerates_a_finished_previous_worker() {
    let seen: Log<serde_json::Value> = log();
    let mw = SagaMiddleware::new(());

    let sink = seen.clone();
    let watcher = mw.run(take_latest("start", move |action: Action| {
        let sink = sink.clone();
        Saga::new("instant", move |_ctx| async move {
            sink.borrow_mut().push(action.payload);
            Ok(())
        })
    }));

    mw.dispatch(Action::new("start").with_payload("a")).unwrap();
    mw.dispatch(Action::new("start").with_payload("b")).unwrap();

    assert_eq!(*seen.borrow(), vec![json!("a"), json!("b")]);
    assert_eq!(watcher.status(), TaskStatus::Suspended);
}

// ---------------------------------------------------------------------------
// select
// ---------------------------------------------------------------------------

#[test]
fn select_reads_state_after_puts() {
    let host = Rc::new(ReducerHost::new(0i64, |count: &mut i64, action: &Action| {
        if action.kind == "inc" {
            *count += 1;
        }
    }));
    let mw = SagaMiddleware::new(host.clone());

    let task = mw.run(Saga::new("counter", |ctx| async move {
        ctx.put("inc").await?;
        ctx.put("inc").await?;
        ctx.select(|state| state.clone()).await
    }));

    assert_eq!(
        task.outcome().and_then(|o| o.value().cloned()),
        Some(Value::from(2i64))
    );
    assert_eq!(host.with_state(|count| *count), 2);
    assert_eq!(mw.state(), json!(2));
}

// ---------------------------------------------------------------------------
// Monitoring
// ---------------------------------------------------------------------------

#[test]
fn monitor_sees_task_lifecycle_and_dispatches() {
    let monitor = Rc::new(MemoryMonitor::new());
    let mw = SagaMiddleware::new(()).with_monitor(monitor.clone());

    mw.run(Saga::new("pinger", |ctx| async move {
        ctx.put("ping").await?;
        ctx.take("pong").await?;
        Ok(())
    }));
    mw.dispatch("pong").unwrap();

    assert_eq!(monitor.dispatched(), vec!["ping", "pong"]);

    let events = monitor.events();
    assert!(matches!(
        events.first(),
        Some(MonitorEvent::TaskStarted { parent: None, name, .. }) if name == "pinger"
    ));
    assert!(matches!(
        events.last(),
        Some(MonitorEvent::TaskFinished {
            status: TaskStatus::Done,
            ..
        })
    ));

    let kinds: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            MonitorEvent::EffectTriggered { kind, .. } => Some(kind.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(kinds, vec!["put", "take"]);

    let records = monitor.records();
    assert!(records.windows(2).all(|w| w[0].seq < w[1].seq));
}
