//! Effect descriptors.
//!
//! An [`Effect`] is inert data. Nothing happens until a saga yields it and
//! the interpreter runs it. Build them with the constructors in
//! [`effects`](crate::effects).

use std::fmt;

use crate::channel::Channel;
use crate::coroutine::Saga;
use crate::deferred::Deferred;
use crate::error::SagaError;
use crate::task::Task;
use crate::value::{Action, Pattern, Value};

pub type CallFn = Box<dyn FnOnce() -> CallResult>;
pub type Selector = Box<dyn FnOnce(&serde_json::Value) -> Value>;

pub enum Effect {
    Take {
        source: TakeSource,
        pattern: Pattern,
    },
    Put(PutTarget),
    Call {
        name: String,
        func: CallFn,
    },
    Fork {
        saga: Saga,
        /// Spawned tasks are not attached to the parent.
        detached: bool,
    },
    Join(Task),
    Race(RaceMembers),
    Parallel(Vec<Effect>),
    Cancel(CancelTarget),
    Select(Selector),
}

impl Effect {
    pub fn kind(&self) -> &'static str {
        match self {
            Effect::Take { .. } => "take",
            Effect::Put(_) => "put",
            Effect::Call { .. } => "call",
            Effect::Fork { detached: false, .. } => "fork",
            Effect::Fork { detached: true, .. } => "spawn",
            Effect::Join(_) => "join",
            Effect::Race(_) => "race",
            Effect::Parallel(_) => "all",
            Effect::Cancel(_) => "cancel",
            Effect::Select(_) => "select",
        }
    }
}

impl fmt::Debug for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Effect::Take { source, pattern } => f
                .debug_struct("Take")
                .field("source", source)
                .field("pattern", pattern)
                .finish(),
            Effect::Put(target) => f.debug_tuple("Put").field(target).finish(),
            Effect::Call { name, .. } => f.debug_struct("Call").field("name", name).finish(),
            Effect::Fork { saga, detached } => f
                .debug_struct("Fork")
                .field("saga", &saga.name())
                .field("detached", detached)
                .finish(),
            Effect::Join(task) => f.debug_tuple("Join").field(&task.id()).finish(),
            Effect::Race(members) => f.debug_tuple("Race").field(members).finish(),
            Effect::Parallel(members) => f.debug_tuple("Parallel").field(members).finish(),
            Effect::Cancel(target) => f.debug_tuple("Cancel").field(target).finish(),
            Effect::Select(_) => f.write_str("Select"),
        }
    }
}

impl From<Vec<Effect>> for Effect {
    fn from(effects: Vec<Effect>) -> Self {
        Effect::Parallel(effects)
    }
}

#[derive(Debug, Clone)]
pub enum TakeSource {
    Bus,
    Channel(Channel),
}

#[derive(Debug, Clone)]
pub enum PutTarget {
    Bus(Action),
    Channel(Channel, Value),
}

#[derive(Debug)]
pub enum RaceMembers {
    Keyed(Vec<(String, Effect)>),
    Positional(Vec<Effect>),
}

impl RaceMembers {
    pub fn len(&self) -> usize {
        match self {
            RaceMembers::Keyed(members) => members.len(),
            RaceMembers::Positional(members) => members.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
pub enum CancelTarget {
    Task(Task),
    Current,
}

/// What a CALL function hands back.
pub enum CallResult {
    Ready(Result<Value, SagaError>),
    Deferred(Deferred),
}

impl<V, E> From<Result<V, E>> for CallResult
where
    V: Into<Value>,
    E: Into<SagaError>,
{
    fn from(result: Result<V, E>) -> Self {
        CallResult::Ready(result.map(Into::into).map_err(Into::into))
    }
}

impl From<Deferred> for CallResult {
    fn from(deferred: Deferred) -> Self {
        CallResult::Deferred(deferred)
    }
}

impl From<Value> for CallResult {
    fn from(value: Value) -> Self {
        CallResult::Ready(Ok(value))
    }
}
