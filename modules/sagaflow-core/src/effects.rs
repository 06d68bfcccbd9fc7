//! Effect constructors.

use std::collections::BTreeSet;
use std::time::Duration;

use crate::channel::Channel;
use crate::coroutine::Saga;
use crate::deferred::Deferred;
use crate::effect::{CallResult, CancelTarget, Effect, PutTarget, RaceMembers, TakeSource};
use crate::error::SagaError;
use crate::task::Task;
use crate::value::{Action, Pattern, Value};

/// Wait for a matching action on the bus.
pub fn take(pattern: impl Into<Pattern>) -> Effect {
    Effect::Take {
        source: TakeSource::Bus,
        pattern: pattern.into(),
    }
}

/// Wait for a matching value on `channel`.
pub fn take_from(channel: &Channel, pattern: impl Into<Pattern>) -> Effect {
    Effect::Take {
        source: TakeSource::Channel(channel.clone()),
        pattern: pattern.into(),
    }
}

/// Dispatch an action through the host and the bus.
pub fn put(action: impl Into<Action>) -> Effect {
    Effect::Put(PutTarget::Bus(action.into()))
}

pub fn put_to(channel: &Channel, value: impl Into<Value>) -> Effect {
    Effect::Put(PutTarget::Channel(channel.clone(), value.into()))
}

/// Invoke `func`. A ready result resumes the saga in the same turn; a
/// [`Deferred`] suspends it until settlement.
pub fn call<F, R>(name: impl Into<String>, func: F) -> Effect
where
    F: FnOnce() -> R + 'static,
    R: Into<CallResult>,
{
    Effect::Call {
        name: name.into(),
        func: Box::new(move || func().into()),
    }
}

pub fn call_deferred<F>(name: impl Into<String>, func: F) -> Effect
where
    F: FnOnce() -> Deferred + 'static,
{
    call(name, func)
}

pub fn fork(saga: Saga) -> Effect {
    Effect::Fork {
        saga,
        detached: false,
    }
}

/// Like [`fork`], but the child outlives the parent and its failures stay
/// with it.
pub fn spawn(saga: Saga) -> Effect {
    Effect::Fork {
        saga,
        detached: true,
    }
}

pub fn join(task: &Task) -> Effect {
    Effect::Join(task.clone())
}

/// First member to settle wins; the result maps the winner's key to its value.
pub fn race<K, I>(members: I) -> Effect
where
    K: Into<String>,
    I: IntoIterator<Item = (K, Effect)>,
{
    Effect::Race(RaceMembers::Keyed(
        members.into_iter().map(|(k, e)| (k.into(), e)).collect(),
    ))
}

/// First member to settle wins; the result is a list with the winner's value
/// at its index and unit everywhere else.
pub fn race_positional(members: Vec<Effect>) -> Effect {
    Effect::Race(RaceMembers::Positional(members))
}

pub fn all(members: Vec<Effect>) -> Effect {
    Effect::Parallel(members)
}

pub fn cancel(task: &Task) -> Effect {
    Effect::Cancel(CancelTarget::Task(task.clone()))
}

pub fn cancel_self() -> Effect {
    Effect::Cancel(CancelTarget::Current)
}

/// Read from the host's state snapshot.
pub fn select<F, V>(selector: F) -> Effect
where
    F: FnOnce(&serde_json::Value) -> V + 'static,
    V: Into<Value>,
{
    Effect::Select(Box::new(move |state| selector(state).into()))
}

/// Resume after `duration`. Needs a tokio `LocalSet`.
pub fn delay(duration: Duration) -> Effect {
    call_deferred("delay", move || {
        Deferred::spawn_local(async move {
            tokio::time::sleep(duration).await;
            Ok::<_, SagaError>(())
        })
    })
}

pub(crate) fn duplicate_key(members: &[(String, Effect)]) -> Option<&str> {
    let mut seen = BTreeSet::new();
    members
        .iter()
        .map(|(key, _)| key.as_str())
        .find(|key| !seen.insert(*key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effects_report_their_kind() {
        assert_eq!(take("a").kind(), "take");
        assert_eq!(put("a").kind(), "put");
        assert_eq!(call("f", || Ok::<_, SagaError>(1)).kind(), "call");
        assert_eq!(cancel_self().kind(), "cancel");
        assert_eq!(Effect::from(vec![take("a"), take("b")]).kind(), "all");
        assert_eq!(race_positional(vec![take("a")]).kind(), "race");
    }

    #[test]
    fn duplicate_race_keys_are_detected() {
        let Effect::Race(RaceMembers::Keyed(members)) =
            race([("a", take("x")), ("b", take("y")), ("a", take("z"))])
        else {
            panic!("expected keyed race");
        };
        assert_eq!(duplicate_key(&members), Some("a"));
    }
}
