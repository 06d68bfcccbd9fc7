use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tokio::task::LocalSet;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sagaflow_core::{
    effects, take_every, Action, Ctx, ReducerHost, Saga, SagaConfig, SagaMiddleware,
    TracingMonitor, Value,
};

/// Host state for the ping/pong session.
#[derive(Debug, Default, Serialize)]
struct Session {
    pings: u64,
    pongs: u64,
    timeouts: u64,
}

fn reduce(session: &mut Session, action: &Action) {
    match action.kind.as_str() {
        "PING" => session.pings += 1,
        "PONG" => session.pongs += 1,
        "TIMEOUT" => session.timeouts += 1,
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Sagas
// ---------------------------------------------------------------------------

/// Answers every PING after a latency that grows with the round number.
fn ponger(base_latency: Duration) -> Saga {
    take_every("PING", move |ping: Action| {
        let round = ping.payload.as_u64().unwrap_or(1) as u32;
        Saga::new("pong", move |ctx| async move {
            ctx.delay(base_latency * round.pow(2)).await?;
            ctx.put(Action::new("PONG").with_payload(round)).await?;
            Ok(())
        })
    })
}

fn pinger(rounds: u64, timeout: Duration) -> Saga {
    Saga::new("pinger", move |ctx| ping_rounds(ctx, rounds, timeout))
}

async fn ping_rounds(ctx: Ctx, rounds: u64, timeout: Duration) -> sagaflow_core::Result<Value> {
    let mut answered = 0i64;
    for round in 1..=rounds {
        ctx.put(Action::new("PING").with_payload(round)).await?;
        let winner = ctx
            .race([
                ("pong", effects::take("PONG")),
                ("timeout", effects::delay(timeout)),
            ])
            .await?;

        if winner.get("timeout").is_some() {
            warn!(round, "no pong before timeout");
            ctx.put(Action::new("TIMEOUT").with_payload(round)).await?;
        } else {
            answered += 1;
        }
    }
    Ok(Value::from(answered))
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("sagaflow=info".parse()?))
        .init();

    info!("sagaflow demo starting...");

    let config = SagaConfig::from_env()?;
    config.log_summary();

    let host = ReducerHost::new(Session::default(), reduce);
    let mw = SagaMiddleware::with_config(host, config).with_monitor(TracingMonitor);

    LocalSet::new()
        .run_until(async move {
            let watcher = mw.run(ponger(Duration::from_millis(20)));
            let session = mw.run(pinger(3, Duration::from_millis(100)));

            let answered = session.done().await.into_result()?;
            info!(answered = %answered.to_json(), "pinger finished");

            // stop the watcher; the late pong still in flight completes first
            mw.end();
            let outcome = watcher.done().await;
            info!(status = ?outcome.status(), "watcher stopped");

            info!(state = %mw.state(), "final session");
            Ok(())
        })
        .await
}
