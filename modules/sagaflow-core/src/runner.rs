//! The effect interpreter.
//!
//! One [`Runtime`] backs one middleware. It owns the task tree, the table of
//! pending effects ("waits") and a single driver loop:
//!
//! - `stack`: synchronous reactions, newest-first so that the reactions of
//!   one job run depth first and in the order they were produced;
//! - `actions`: FIFO queue of puts, re-entrant dispatches and END, taken
//!   only when the stack is empty.
//!
//! All state sits behind one `RefCell`. No borrow is held while user code
//! runs: saga bodies, CALL functions, matchers, the host, monitors, and the
//! destructors of dropped bodies.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::{debug, error, trace, warn};

use crate::bus::Bus;
use crate::channel::{Channel, Delivery, TakerId};
use crate::config::SagaConfig;
use crate::coroutine::{Coroutine, Saga, Step};
use crate::deferred::Deferred;
use crate::effect::{CallFn, CallResult, CancelTarget, Effect, PutTarget, RaceMembers, TakeSource};
use crate::effects::duplicate_key;
use crate::error::SagaError;
use crate::monitor::MonitorEvent;
use crate::task::{Completion, Task, TaskId, TaskOutcome, TaskStatus};
use crate::traits::{Host, Monitor};
use crate::value::{Action, Pattern, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct EffectId(u64);

impl fmt::Display for EffectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// What a suspended effect settles with.
#[derive(Debug, Clone)]
pub(crate) enum Outcome {
    Value(Value),
    Error(SagaError),
    /// The source ended; the waiting task terminates gracefully.
    End,
}

impl From<Delivery> for Outcome {
    fn from(delivery: Delivery) -> Self {
        match delivery {
            Delivery::Value(value) => Outcome::Value(value),
            Delivery::End => Outcome::End,
        }
    }
}

impl From<Result<Value, SagaError>> for Outcome {
    fn from(result: Result<Value, SagaError>) -> Self {
        match result {
            Ok(value) => Outcome::Value(value),
            Err(err) => Outcome::Error(err),
        }
    }
}

fn join_outcome(outcome: &TaskOutcome) -> Outcome {
    match outcome {
        TaskOutcome::Done(value) => Outcome::Value(value.clone()),
        TaskOutcome::Cancelled => Outcome::Value(Value::Unit),
        TaskOutcome::Aborted(err) => Outcome::Error(err.clone()),
    }
}

pub(crate) enum Work {
    Start(TaskId),
    Resume(TaskId, Outcome),
    Settle(EffectId, Outcome),
    Dispatch {
        action: Action,
        reply: Option<EffectId>,
    },
    ChannelPut {
        channel: Channel,
        value: Value,
        reply: EffectId,
    },
    End,
}

// ---------------------------------------------------------------------------
// Bookkeeping types
// ---------------------------------------------------------------------------

/// Where a wait reports when it settles.
#[derive(Debug, Clone, Copy)]
enum Link {
    Task,
    Race { race: EffectId, slot: usize },
    All { all: EffectId, slot: usize },
}

impl Link {
    fn parent(self) -> Option<EffectId> {
        match self {
            Link::Task => None,
            Link::Race { race, .. } => Some(race),
            Link::All { all, .. } => Some(all),
        }
    }
}

enum WaitKind {
    Take {
        source: TakeSource,
        taker: TakerId,
    },
    Put,
    Call {
        deferred: Deferred,
    },
    Join {
        target: TaskId,
    },
    Race {
        keys: Option<Vec<String>>,
        members: Vec<Option<EffectId>>,
    },
    All {
        results: Vec<Option<Value>>,
        members: Vec<Option<EffectId>>,
        remaining: usize,
    },
}

struct Wait {
    task: TaskId,
    link: Link,
    kind: WaitKind,
}

enum Started {
    Immediate(Outcome),
    Pending(EffectId),
    /// The issuing task was cancelled or aborted while running the effect.
    Halt,
}

enum Exit {
    Suspended(EffectId),
    /// Parked so queued reactions run first; resumes with the outcome.
    Yielded(Outcome),
    Finished(Result<Value, SagaError>),
    Ended,
    Halted,
}

enum Cascade {
    Abort(TaskId, SagaError),
    Complete(TaskId),
}

enum Merge {
    Complete,
    Failed(Outcome),
}

struct TaskNode {
    name: Rc<str>,
    completion: Rc<Completion>,
    parent: Option<TaskId>,
    detached: bool,
    /// Live attached children, in fork order.
    children: Vec<TaskId>,
    status: TaskStatus,
    coroutine: Option<Coroutine>,
    pending: Option<EffectId>,
    /// Body result, held until the last attached child finishes.
    main: Option<Value>,
    joiners: Vec<EffectId>,
}

#[derive(Default)]
struct State {
    tasks: HashMap<TaskId, TaskNode>,
    waits: HashMap<EffectId, Wait>,
    next_task: u64,
    next_effect: u64,
    stack: Vec<Work>,
    fresh: Vec<Work>,
    actions: VecDeque<Work>,
    driving: bool,
    current: Option<TaskId>,
    /// Terminal outcome of `current`, applied once its step unwinds.
    halted: Option<TaskOutcome>,
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

pub(crate) struct Runtime {
    weak_self: Weak<Runtime>,
    bus: Bus,
    config: SagaConfig,
    monitor: RefCell<Option<Rc<dyn Monitor>>>,
    state: RefCell<State>,
}

struct DrivingGuard<'a> {
    runtime: &'a Runtime,
}

impl Drop for DrivingGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.runtime.state.try_borrow_mut() {
            state.driving = false;
        }
    }
}

impl Runtime {
    pub(crate) fn new(host: Rc<dyn Host>, config: SagaConfig) -> Rc<Self> {
        Rc::new_cyclic(|weak| Runtime {
            weak_self: weak.clone(),
            bus: Bus::new(host),
            config,
            monitor: RefCell::new(None),
            state: RefCell::new(State {
                next_task: 1,
                next_effect: 1,
                ..State::default()
            }),
        })
    }

    pub(crate) fn set_monitor(&self, monitor: Rc<dyn Monitor>) {
        *self.monitor.borrow_mut() = Some(monitor);
    }

    pub(crate) fn config(&self) -> &SagaConfig {
        &self.config
    }

    pub(crate) fn host_state(&self) -> serde_json::Value {
        self.bus.state()
    }

    pub(crate) fn status_of(&self, id: TaskId) -> Option<TaskStatus> {
        self.state.borrow().tasks.get(&id).map(|node| node.status)
    }

    pub(crate) fn live_tasks(&self) -> usize {
        self.state.borrow().tasks.len()
    }

    /// Run `f` inside the driver. When the driver is idle this also runs
    /// everything `f` scheduled, to quiescence, before returning.
    pub(crate) fn enter<T>(&self, f: impl FnOnce(&Runtime) -> T) -> T {
        if self.state.borrow().driving {
            return f(self);
        }
        self.state.borrow_mut().driving = true;
        let _driving = DrivingGuard { runtime: self };
        let out = f(self);
        self.drain();
        out
    }

    pub(crate) fn run(&self, saga: Saga) -> Task {
        self.enter(|rt| {
            let task = rt.create_task(saga, None, false);
            rt.schedule(Work::Start(task.id()));
            task
        })
    }

    /// Forward to the host and broadcast. Re-entrant calls are queued and
    /// report success; their failures are logged.
    pub(crate) fn dispatch(&self, action: Action) -> Result<(), SagaError> {
        if self.state.borrow().driving {
            self.queue(Work::Dispatch {
                action,
                reply: None,
            });
            return Ok(());
        }
        self.enter(|rt| rt.emit(&action))
    }

    pub(crate) fn end(&self) {
        if self.state.borrow().driving {
            self.queue(Work::End);
            return;
        }
        self.enter(|rt| rt.end_bus());
    }

    // -- driver ---------------------------------------------------------------

    fn drain(&self) {
        loop {
            self.flush_fresh();
            let work = {
                let mut st = self.state.borrow_mut();
                match st.stack.pop() {
                    Some(work) => work,
                    None => match st.actions.pop_front() {
                        Some(work) => work,
                        None => break,
                    },
                }
            };
            self.perform(work);
        }
    }

    fn flush_fresh(&self) {
        let mut st = self.state.borrow_mut();
        let fresh = std::mem::take(&mut st.fresh);
        st.stack.extend(fresh.into_iter().rev());
    }

    fn schedule(&self, work: Work) {
        self.state.borrow_mut().fresh.push(work);
    }

    fn has_fresh(&self) -> bool {
        !self.state.borrow().fresh.is_empty()
    }

    fn queue(&self, work: Work) {
        let queued = {
            let mut st = self.state.borrow_mut();
            st.actions.push_back(work);
            st.actions.len()
        };
        if queued == self.config.queue_warn_threshold {
            warn!(queued, "action queue reached its warning threshold");
        }
    }

    fn perform(&self, work: Work) {
        match work {
            Work::Start(id) => self.step(id, None, None),
            Work::Resume(id, outcome) => self.step(id, None, Some(outcome)),
            Work::Settle(eid, outcome) => self.settle(eid, outcome),
            Work::Dispatch { action, reply } => {
                let result = self.emit(&action);
                match reply {
                    Some(reply) => {
                        self.schedule(Work::Settle(reply, result.map(|()| Value::Unit).into()))
                    }
                    None => {
                        if let Err(err) = result {
                            warn!(action = %action.kind, error = %err, "queued dispatch failed");
                        }
                    }
                }
            }
            Work::ChannelPut {
                channel,
                value,
                reply,
            } => {
                let result = channel
                    .put(value)
                    .map(|()| Value::Unit)
                    .map_err(SagaError::from);
                self.schedule(Work::Settle(reply, result.into()));
            }
            Work::End => self.end_bus(),
        }
    }

    fn emit(&self, action: &Action) -> Result<(), SagaError> {
        self.record(MonitorEvent::ActionDispatched {
            action: action.clone(),
        });
        self.bus.emit(action)
    }

    fn end_bus(&self) {
        let watermark = TaskId(self.state.borrow().next_task);
        self.bus.end(watermark);
    }

    fn record(&self, event: MonitorEvent) {
        let monitor = self.monitor.borrow().clone();
        if let Some(monitor) = monitor {
            monitor.record(event);
        }
    }

    fn record_settlement(&self, eid: EffectId, outcome: &Outcome) {
        let event = match outcome {
            Outcome::Error(err) => MonitorEvent::EffectRejected {
                effect: eid.0,
                error: err.to_string(),
            },
            _ => MonitorEvent::EffectResolved { effect: eid.0 },
        };
        self.record(event);
    }

    /// Continuation that settles `eid` through the driver.
    fn settler<T>(&self, eid: EffectId) -> impl FnOnce(T) + 'static
    where
        T: Into<Outcome> + 'static,
    {
        let runtime = self.weak_self.clone();
        move |delivered: T| {
            if let Some(rt) = runtime.upgrade() {
                rt.enter(|rt| rt.schedule(Work::Settle(eid, delivered.into())));
            }
        }
    }

    // -- tasks ----------------------------------------------------------------

    fn create_task(&self, saga: Saga, parent: Option<TaskId>, detached: bool) -> Task {
        let name = saga.shared_name();
        let task = {
            let mut st = self.state.borrow_mut();
            let id = TaskId(st.next_task);
            st.next_task += 1;

            let completion = Rc::new(Completion::default());
            st.tasks.insert(
                id,
                TaskNode {
                    name: name.clone(),
                    completion: completion.clone(),
                    parent,
                    detached,
                    children: Vec::new(),
                    status: TaskStatus::Created,
                    coroutine: Some(Coroutine::new(saga, id)),
                    pending: None,
                    main: None,
                    joiners: Vec::new(),
                },
            );
            if !detached {
                if let Some(parent) = parent.and_then(|p| st.tasks.get_mut(&p)) {
                    parent.children.push(id);
                }
            }
            Task {
                id,
                name: name.clone(),
                completion,
                runtime: self.weak_self.clone(),
            }
        };

        debug!(task = %task.id(), name = %name, parent = ?parent.map(TaskId::get), detached, "task created");
        self.record(MonitorEvent::TaskStarted {
            task: task.id().get(),
            parent: parent.map(TaskId::get),
            name: name.to_string(),
        });
        task
    }

    fn is_halted(&self, id: TaskId) -> bool {
        self.state
            .borrow()
            .tasks
            .get(&id)
            .map_or(true, |node| node.status.is_terminal())
    }

    /// Resume `id` with `input`. `expected` must name the wait the task is
    /// blocked on; anything else is a stale settlement and is ignored.
    fn step(&self, id: TaskId, expected: Option<EffectId>, input: Option<Outcome>) {
        let mut coroutine = {
            let mut st = self.state.borrow_mut();
            let Some(node) = st.tasks.get_mut(&id) else {
                return;
            };
            if node.status.is_terminal() || node.pending != expected {
                return;
            }
            let Some(coroutine) = node.coroutine.take() else {
                return;
            };
            node.status = TaskStatus::Running;
            st.current = Some(id);
            coroutine
        };

        let exit = match input {
            Some(Outcome::End) => Exit::Ended,
            Some(Outcome::Value(value)) => self.drive(id, &mut coroutine, Some(Ok(value))),
            Some(Outcome::Error(err)) => self.drive(id, &mut coroutine, Some(Err(err))),
            None => self.drive(id, &mut coroutine, None),
        };

        self.state.borrow_mut().current = None;
        self.exit(id, coroutine, exit);
    }

    fn drive(
        &self,
        id: TaskId,
        coroutine: &mut Coroutine,
        mut input: Option<Result<Value, SagaError>>,
    ) -> Exit {
        loop {
            let step = coroutine.resume(input.take());
            if self.is_halted(id) {
                return Exit::Halted;
            }
            let effect = match step {
                Step::Complete(result) => return Exit::Finished(result),
                Step::Yield(effect) => effect,
            };

            match self.run_effect(id, effect, Link::Task) {
                Started::Halt => return Exit::Halted,
                Started::Pending(eid) => {
                    if self.is_halted(id) {
                        self.cancel_wait(eid);
                        return Exit::Halted;
                    }
                    return Exit::Suspended(eid);
                }
                Started::Immediate(outcome) => {
                    if self.is_halted(id) {
                        return Exit::Halted;
                    }
                    match outcome {
                        Outcome::End => return Exit::Ended,
                        // let forked children and woken joiners run first
                        outcome if self.has_fresh() => return Exit::Yielded(outcome),
                        Outcome::Value(value) => input = Some(Ok(value)),
                        Outcome::Error(err) => input = Some(Err(err)),
                    }
                }
            }
        }
    }

    fn exit(&self, id: TaskId, coroutine: Coroutine, exit: Exit) {
        match exit {
            Exit::Suspended(eid) => self.park(id, coroutine, Some(eid)),
            Exit::Yielded(outcome) => {
                self.park(id, coroutine, None);
                self.schedule(Work::Resume(id, outcome));
            }
            Exit::Finished(Ok(value)) => {
                drop(coroutine);
                self.finish_main(id, value);
            }
            Exit::Ended => {
                drop(coroutine);
                trace!(task = %id, "task reached END");
                self.finish_main(id, Value::Unit);
            }
            Exit::Finished(Err(err)) => {
                drop(coroutine);
                if let Some(cascade) = self.abort_one(id, err) {
                    self.run_cascade(cascade);
                }
            }
            Exit::Halted => {
                drop(coroutine);
                let outcome = self
                    .state
                    .borrow_mut()
                    .halted
                    .take()
                    .unwrap_or(TaskOutcome::Cancelled);
                if let Some(cascade) = self.finalize(id, outcome) {
                    self.run_cascade(cascade);
                }
            }
        }
    }

    fn park(&self, id: TaskId, coroutine: Coroutine, pending: Option<EffectId>) {
        let orphan = {
            let mut st = self.state.borrow_mut();
            match st.tasks.get_mut(&id) {
                Some(node) => {
                    node.coroutine = Some(coroutine);
                    node.pending = pending;
                    node.status = TaskStatus::Suspended;
                    None
                }
                None => Some(coroutine),
            }
        };
        drop(orphan);
    }

    fn finish_main(&self, id: TaskId, value: Value) {
        let complete = {
            let mut st = self.state.borrow_mut();
            let Some(node) = st.tasks.get_mut(&id) else {
                return;
            };
            if node.status.is_terminal() {
                return;
            }
            node.main = Some(value);
            if node.children.is_empty() {
                true
            } else {
                node.status = TaskStatus::Suspended;
                trace!(task = %id, children = node.children.len(), "body done, waiting on children");
                false
            }
        };
        if complete {
            self.run_cascade(Cascade::Complete(id));
        }
    }

    fn run_cascade(&self, first: Cascade) {
        let mut next = Some(first);
        while let Some(cascade) = next {
            next = match cascade {
                Cascade::Abort(id, err) => self.abort_one(id, err),
                Cascade::Complete(id) => {
                    let value = {
                        let mut st = self.state.borrow_mut();
                        st.tasks
                            .get_mut(&id)
                            .filter(|node| !node.status.is_terminal())
                            .and_then(|node| node.main.take())
                    };
                    value.and_then(|value| self.finalize(id, TaskOutcome::Done(value)))
                }
            };
        }
    }

    /// Abort `id`: cancel its pending effect and live children, drop its body.
    fn abort_one(&self, id: TaskId, err: SagaError) -> Option<Cascade> {
        let (pending, children, coroutine, is_current) = {
            let mut st = self.state.borrow_mut();
            let is_current = st.current == Some(id);
            let node = st.tasks.get_mut(&id)?;
            if node.status.is_terminal() {
                return None;
            }
            node.status = TaskStatus::Aborted;
            (
                node.pending.take(),
                node.children.clone(),
                node.coroutine.take(),
                is_current,
            )
        };
        debug!(task = %id, error = %err, "task aborting");

        if let Some(eid) = pending {
            self.cancel_wait(eid);
        }
        for child in children {
            self.cancel_task(child);
        }
        drop(coroutine);

        if is_current {
            self.state.borrow_mut().halted = Some(TaskOutcome::Aborted(err));
            return None;
        }
        self.finalize(id, TaskOutcome::Aborted(err))
    }

    /// Cancel `root` and its attached subtree, children before parents.
    /// No-op on terminal tasks.
    pub(crate) fn cancel_task(&self, root: TaskId) {
        let order = {
            let mut st = self.state.borrow_mut();
            match st.tasks.get(&root) {
                Some(node) if !node.status.is_terminal() => {}
                _ => return,
            }

            let mut order = Vec::new();
            let mut walk = vec![(root, false)];
            while let Some((id, expanded)) = walk.pop() {
                if expanded {
                    order.push(id);
                    continue;
                }
                walk.push((id, true));
                if let Some(node) = st.tasks.get(&id) {
                    for child in node.children.iter().rev() {
                        let live = st
                            .tasks
                            .get(child)
                            .is_some_and(|c| !c.status.is_terminal());
                        if live {
                            walk.push((*child, false));
                        }
                    }
                }
            }
            for id in &order {
                if let Some(node) = st.tasks.get_mut(id) {
                    node.status = TaskStatus::Cancelled;
                }
            }
            order
        };
        debug!(task = %root, subtree = order.len(), "cancelling");

        let mut cascades = Vec::new();
        for id in order {
            let (pending, coroutine, is_current) = {
                let mut st = self.state.borrow_mut();
                let is_current = st.current == Some(id);
                match st.tasks.get_mut(&id) {
                    Some(node) => (node.pending.take(), node.coroutine.take(), is_current),
                    None => continue,
                }
            };
            if let Some(eid) = pending {
                self.cancel_wait(eid);
            }
            // runs the body's destructors before the task is recorded as cancelled
            drop(coroutine);

            if is_current {
                self.state.borrow_mut().halted = Some(TaskOutcome::Cancelled);
            } else if let Some(cascade) = self.finalize(id, TaskOutcome::Cancelled) {
                cascades.push(cascade);
            }
        }
        for cascade in cascades {
            self.run_cascade(cascade);
        }
    }

    /// Record the terminal outcome, wake joiners, and report to the parent.
    fn finalize(&self, id: TaskId, outcome: TaskOutcome) -> Option<Cascade> {
        let mut node = self.state.borrow_mut().tasks.remove(&id)?;
        drop(node.coroutine.take());
        node.completion.complete(outcome.clone());

        let joined = join_outcome(&outcome);
        for joiner in &node.joiners {
            self.schedule(Work::Settle(*joiner, joined.clone()));
        }

        let status = outcome.status();
        match &outcome {
            TaskOutcome::Aborted(err) => {
                debug!(task = %id, name = %node.name, error = %err, "task finished: aborted")
            }
            _ => debug!(task = %id, name = %node.name, ?status, "task finished"),
        }
        self.record(MonitorEvent::TaskFinished {
            task: id.get(),
            status,
        });

        let Some(parent) = node.parent.filter(|_| !node.detached) else {
            if let TaskOutcome::Aborted(err) = &outcome {
                if self.config.log_uncaught {
                    error!(task = %id, name = %node.name, error = %err, "uncaught saga failure");
                }
            }
            return None;
        };

        let mut st = self.state.borrow_mut();
        let parent_node = st.tasks.get_mut(&parent)?;
        if parent_node.status.is_terminal() {
            return None;
        }
        parent_node.children.retain(|child| *child != id);
        match outcome {
            TaskOutcome::Aborted(err) => Some(Cascade::Abort(parent, err)),
            _ if parent_node.main.is_some() && parent_node.children.is_empty() => {
                Some(Cascade::Complete(parent))
            }
            _ => None,
        }
    }

    // -- waits ----------------------------------------------------------------

    fn alloc_effect(&self) -> EffectId {
        let mut st = self.state.borrow_mut();
        let id = EffectId(st.next_effect);
        st.next_effect += 1;
        id
    }

    fn insert_wait(&self, eid: EffectId, wait: Wait) {
        self.state.borrow_mut().waits.insert(eid, wait);
    }

    fn take_wait(&self, eid: EffectId) -> Option<Wait> {
        self.state.borrow_mut().waits.remove(&eid)
    }

    fn set_member(&self, parent: EffectId, slot: usize, member: EffectId) {
        let mut st = self.state.borrow_mut();
        if let Some(wait) = st.waits.get_mut(&parent) {
            match &mut wait.kind {
                WaitKind::Race { members, .. } | WaitKind::All { members, .. } => {
                    members[slot] = Some(member)
                }
                _ => {}
            }
        }
    }

    /// Deregister a wait and everything nested under it.
    fn cancel_wait(&self, root: EffectId) {
        let mut pending = vec![root];
        while let Some(eid) = pending.pop() {
            let Some(wait) = self.take_wait(eid) else {
                continue;
            };
            match wait.kind {
                WaitKind::Take {
                    source: TakeSource::Bus,
                    taker,
                } => {
                    self.bus.cancel_taker(taker);
                }
                WaitKind::Take {
                    source: TakeSource::Channel(channel),
                    taker,
                } => {
                    channel.cancel_taker(taker);
                }
                WaitKind::Put => {}
                WaitKind::Call { deferred } => deferred.unsubscribe(),
                WaitKind::Join { target } => {
                    if let Some(node) = self.state.borrow_mut().tasks.get_mut(&target) {
                        node.joiners.retain(|joiner| *joiner != eid);
                    }
                }
                WaitKind::Race { members, .. } | WaitKind::All { members, .. } => {
                    pending.extend(members.into_iter().flatten())
                }
            }
            trace!(effect = %eid, "effect cancelled");
            self.record(MonitorEvent::EffectCancelled { effect: eid.0 });
        }
    }

    fn drop_members(&self, kind: WaitKind) {
        if let WaitKind::Race { members, .. } | WaitKind::All { members, .. } = kind {
            for member in members.into_iter().flatten() {
                self.cancel_wait(member);
            }
        }
    }

    fn close_race(&self, kind: WaitKind, slot: usize, outcome: Outcome) -> Outcome {
        let WaitKind::Race { keys, members } = kind else {
            return outcome;
        };
        let width = members.len();
        for member in members.into_iter().flatten() {
            self.cancel_wait(member);
        }

        let value = match outcome {
            Outcome::Value(value) => value,
            other => return other,
        };
        match keys {
            Some(mut keys) => {
                let key = keys.swap_remove(slot);
                Outcome::Value(Value::Map(BTreeMap::from([(key, value)])))
            }
            None => {
                let mut list = vec![Value::Unit; width];
                list[slot] = value;
                Outcome::Value(Value::List(list))
            }
        }
    }

    fn merge_into_all(&self, all: EffectId, slot: usize, outcome: Outcome) -> Option<Merge> {
        let mut st = self.state.borrow_mut();
        let wait = st.waits.get_mut(&all)?;
        let WaitKind::All {
            results,
            members,
            remaining,
        } = &mut wait.kind
        else {
            return None;
        };
        members[slot] = None;
        match outcome {
            Outcome::Value(value) => {
                results[slot] = Some(value);
                *remaining -= 1;
                (*remaining == 0).then_some(Merge::Complete)
            }
            failure => Some(Merge::Failed(failure)),
        }
    }

    fn collect_all(kind: WaitKind) -> Outcome {
        match kind {
            WaitKind::All { results, .. } => Outcome::Value(Value::List(
                results.into_iter().map(Option::unwrap_or_default).collect(),
            )),
            _ => Outcome::Value(Value::List(Vec::new())),
        }
    }

    /// Deliver `outcome` to the wait `eid`, climbing through enclosing races
    /// and `all`s until a task resumes or a combinator is still incomplete.
    fn settle(&self, eid: EffectId, outcome: Outcome) {
        let Some(wait) = self.take_wait(eid) else {
            trace!(effect = %eid, "stale settlement ignored");
            return;
        };
        self.record_settlement(eid, &outcome);

        let (mut eid, mut task, mut link, mut outcome) = (eid, wait.task, wait.link, outcome);
        loop {
            match link {
                Link::Task => {
                    self.step(task, Some(eid), Some(outcome));
                    return;
                }
                Link::Race { race, slot } => {
                    let Some(parent) = self.take_wait(race) else {
                        return;
                    };
                    outcome = self.close_race(parent.kind, slot, outcome);
                    (eid, task, link) = (race, parent.task, parent.link);
                }
                Link::All { all, slot } => {
                    let Some(merge) = self.merge_into_all(all, slot, outcome) else {
                        return;
                    };
                    let Some(parent) = self.take_wait(all) else {
                        return;
                    };
                    outcome = match merge {
                        Merge::Complete => Self::collect_all(parent.kind),
                        Merge::Failed(failure) => {
                            self.drop_members(parent.kind);
                            failure
                        }
                    };
                    (eid, task, link) = (all, parent.task, parent.link);
                }
            }
            self.record_settlement(eid, &outcome);
        }
    }

    // -- effects --------------------------------------------------------------

    fn run_effect(&self, task: TaskId, effect: Effect, link: Link) -> Started {
        if self.is_halted(task) {
            return Started::Halt;
        }
        let eid = self.alloc_effect();
        let kind = effect.kind();
        trace!(task = %task, effect = %eid, kind, "effect triggered");
        self.record(MonitorEvent::EffectTriggered {
            task: task.get(),
            effect: eid.0,
            parent: link.parent().map(|p| p.0),
            kind: kind.to_string(),
        });

        let started = match effect {
            Effect::Take { source, pattern } => self.run_take(task, eid, link, source, pattern),
            Effect::Put(target) => self.run_put(task, eid, link, target),
            Effect::Call { name, func } => self.run_call(task, eid, link, name, func),
            Effect::Fork { saga, detached } => {
                let child = self.create_task(saga, Some(task), detached);
                self.schedule(Work::Start(child.id()));
                Started::Immediate(Outcome::Value(Value::Task(child)))
            }
            Effect::Join(target) => self.run_join(task, eid, link, target),
            Effect::Race(members) => self.run_race(task, eid, link, members),
            Effect::Parallel(members) => self.run_all(task, eid, link, members),
            Effect::Cancel(target) => self.run_cancel(task, target),
            Effect::Select(selector) => {
                Started::Immediate(Outcome::Value(selector(&self.bus.state())))
            }
        };

        if let Started::Immediate(outcome) = &started {
            self.record_settlement(eid, outcome);
        }
        started
    }

    fn run_take(
        &self,
        task: TaskId,
        eid: EffectId,
        link: Link,
        source: TakeSource,
        pattern: Pattern,
    ) -> Started {
        // A buffered value (or END) handed over during registration resumes
        // the task in this turn, so an enclosing race closes before its
        // later members can drain their own sources.
        let early: Rc<RefCell<Option<Delivery>>> = Rc::new(RefCell::new(None));
        let registering = Rc::new(Cell::new(true));
        let continuation = {
            let (early, registering) = (early.clone(), registering.clone());
            let settle = self.settler::<Delivery>(eid);
            move |delivery: Delivery| {
                if registering.get() {
                    *early.borrow_mut() = Some(delivery);
                } else {
                    settle(delivery);
                }
            }
        };
        let taker = match &source {
            TakeSource::Bus => self.bus.take(task, pattern, continuation),
            TakeSource::Channel(channel) => channel.take(pattern, continuation),
        };
        registering.set(false);

        let delivered = early.borrow_mut().take();
        if let Some(delivery) = delivered {
            return Started::Immediate(delivery.into());
        }
        self.insert_wait(
            eid,
            Wait {
                task,
                link,
                kind: WaitKind::Take { source, taker },
            },
        );
        Started::Pending(eid)
    }

    fn run_put(&self, task: TaskId, eid: EffectId, link: Link, target: PutTarget) -> Started {
        let work = match target {
            PutTarget::Bus(action) => Work::Dispatch {
                action,
                reply: Some(eid),
            },
            PutTarget::Channel(channel, value) => Work::ChannelPut {
                channel,
                value,
                reply: eid,
            },
        };
        self.insert_wait(
            eid,
            Wait {
                task,
                link,
                kind: WaitKind::Put,
            },
        );
        self.queue(work);
        Started::Pending(eid)
    }

    fn run_call(
        &self,
        task: TaskId,
        eid: EffectId,
        link: Link,
        name: String,
        func: CallFn,
    ) -> Started {
        match func() {
            CallResult::Ready(Ok(value)) => Started::Immediate(Outcome::Value(value)),
            CallResult::Ready(Err(err)) => {
                debug!(task = %task, call = %name, error = %err, "call failed");
                Started::Immediate(Outcome::Error(err))
            }
            CallResult::Deferred(deferred) => {
                self.insert_wait(
                    eid,
                    Wait {
                        task,
                        link,
                        kind: WaitKind::Call {
                            deferred: deferred.clone(),
                        },
                    },
                );
                deferred.subscribe(self.settler::<Result<Value, SagaError>>(eid));
                Started::Pending(eid)
            }
        }
    }

    fn run_join(&self, task: TaskId, eid: EffectId, link: Link, target: Task) -> Started {
        if !target.belongs_to(&self.weak_self) {
            return Started::Immediate(Outcome::Error(SagaError::invalid(
                "cannot join a task owned by another middleware",
            )));
        }
        if target.id() == task {
            return Started::Immediate(Outcome::Error(SagaError::invalid(
                "a task cannot join itself",
            )));
        }
        if let Some(outcome) = target.outcome() {
            return Started::Immediate(join_outcome(&outcome));
        }

        let registered = {
            let mut st = self.state.borrow_mut();
            match st.tasks.get_mut(&target.id()) {
                Some(node) => {
                    node.joiners.push(eid);
                    true
                }
                None => false,
            }
        };
        if !registered {
            return Started::Immediate(Outcome::Value(Value::Unit));
        }
        self.insert_wait(
            eid,
            Wait {
                task,
                link,
                kind: WaitKind::Join {
                    target: target.id(),
                },
            },
        );
        Started::Pending(eid)
    }

    fn run_race(&self, task: TaskId, eid: EffectId, link: Link, members: RaceMembers) -> Started {
        let (keys, effects): (Option<Vec<String>>, Vec<Effect>) = match members {
            RaceMembers::Keyed(members) => {
                if let Some(key) = duplicate_key(&members) {
                    return Started::Immediate(Outcome::Error(SagaError::invalid(format!(
                        "race has duplicate key `{key}`"
                    ))));
                }
                let (keys, effects) = members.into_iter().unzip();
                (Some(keys), effects)
            }
            RaceMembers::Positional(effects) => (None, effects),
        };
        if effects.is_empty() {
            return Started::Immediate(Outcome::Error(SagaError::invalid(
                "race needs at least one member",
            )));
        }

        self.insert_wait(
            eid,
            Wait {
                task,
                link,
                kind: WaitKind::Race {
                    keys,
                    members: vec![None; effects.len()],
                },
            },
        );
        for (slot, effect) in effects.into_iter().enumerate() {
            match self.run_effect(task, effect, Link::Race { race: eid, slot }) {
                Started::Pending(member) => self.set_member(eid, slot, member),
                Started::Immediate(outcome) => {
                    let Some(wait) = self.take_wait(eid) else {
                        return Started::Halt;
                    };
                    return Started::Immediate(self.close_race(wait.kind, slot, outcome));
                }
                Started::Halt => {
                    self.cancel_wait(eid);
                    return Started::Halt;
                }
            }
        }
        Started::Pending(eid)
    }

    fn run_all(&self, task: TaskId, eid: EffectId, link: Link, effects: Vec<Effect>) -> Started {
        if effects.is_empty() {
            return Started::Immediate(Outcome::Value(Value::List(Vec::new())));
        }
        let width = effects.len();
        self.insert_wait(
            eid,
            Wait {
                task,
                link,
                kind: WaitKind::All {
                    results: vec![None; width],
                    members: vec![None; width],
                    remaining: width,
                },
            },
        );

        for (slot, effect) in effects.into_iter().enumerate() {
            match self.run_effect(task, effect, Link::All { all: eid, slot }) {
                Started::Pending(member) => self.set_member(eid, slot, member),
                Started::Immediate(Outcome::Value(value)) => {
                    self.merge_into_all(eid, slot, Outcome::Value(value));
                }
                Started::Immediate(failure) => {
                    if let Some(wait) = self.take_wait(eid) {
                        self.drop_members(wait.kind);
                    }
                    return Started::Immediate(failure);
                }
                Started::Halt => {
                    self.cancel_wait(eid);
                    return Started::Halt;
                }
            }
        }

        let complete = matches!(
            self.state.borrow().waits.get(&eid),
            Some(Wait { kind: WaitKind::All { remaining: 0, .. }, .. })
        );
        if !complete {
            return Started::Pending(eid);
        }
        match self.take_wait(eid) {
            Some(wait) => Started::Immediate(Self::collect_all(wait.kind)),
            None => Started::Halt,
        }
    }

    fn run_cancel(&self, task: TaskId, target: CancelTarget) -> Started {
        let target = match target {
            CancelTarget::Current => task,
            CancelTarget::Task(handle) => {
                if !handle.belongs_to(&self.weak_self) {
                    return Started::Immediate(Outcome::Error(SagaError::invalid(
                        "cannot cancel a task owned by another middleware",
                    )));
                }
                handle.id()
            }
        };
        self.cancel_task(target);
        if self.is_halted(task) {
            Started::Halt
        } else {
            Started::Immediate(Outcome::Value(Value::Unit))
        }
    }
}
