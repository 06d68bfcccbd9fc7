//! Action bus: the host's dispatch path as seen by sagas.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::channel::{Continuation, Delivery, TakerId};
use crate::error::SagaError;
use crate::task::TaskId;
use crate::traits::Host;
use crate::value::{Action, Pattern, Value};

struct BusTaker {
    id: TakerId,
    owner: TaskId,
    pattern: Pattern,
    continuation: Continuation,
}

pub(crate) struct Bus {
    host: Rc<dyn Host>,
    takers: RefCell<Vec<BusTaker>>,
    next_taker: Cell<u64>,
    /// Tasks with an id below this saw END; their bus takes end at once.
    end_watermark: Cell<Option<TaskId>>,
}

impl Bus {
    pub(crate) fn new(host: Rc<dyn Host>) -> Self {
        Self {
            host,
            takers: RefCell::new(Vec::new()),
            next_taker: Cell::new(1),
            end_watermark: Cell::new(None),
        }
    }

    pub(crate) fn state(&self) -> serde_json::Value {
        self.host.state()
    }

    pub(crate) fn take(
        &self,
        owner: TaskId,
        pattern: Pattern,
        continuation: impl FnOnce(Delivery) + 'static,
    ) -> TakerId {
        let id = TakerId(self.next_taker.get());
        self.next_taker.set(id.0 + 1);

        if self.end_watermark.get().is_some_and(|mark| owner < mark) {
            continuation(Delivery::End);
            return id;
        }
        self.takers.borrow_mut().push(BusTaker {
            id,
            owner,
            pattern,
            continuation: Box::new(continuation),
        });
        id
    }

    pub(crate) fn cancel_taker(&self, id: TakerId) -> bool {
        let removed = {
            let mut takers = self.takers.borrow_mut();
            let index = takers.iter().position(|t| t.id == id);
            index.map(|i| takers.remove(i))
        };
        removed.is_some()
    }

    /// Forward to the host, then wake every matching taker, at most one per
    /// owning task. A host failure stops the broadcast.
    pub(crate) fn emit(&self, action: &Action) -> Result<(), SagaError> {
        self.host.forward(action)?;

        let value = Value::Action(action.clone());
        let matched = {
            let mut takers = self.takers.borrow_mut();
            let mut served = HashSet::new();
            let mut matched = Vec::new();
            let mut index = 0;
            while index < takers.len() {
                let taker = &takers[index];
                if !served.contains(&taker.owner) && taker.pattern.matches(&value) {
                    served.insert(taker.owner);
                    matched.push(takers.remove(index));
                } else {
                    index += 1;
                }
            }
            matched
        };

        trace!(action = %action.kind, woken = matched.len(), "action broadcast");
        for taker in matched {
            (taker.continuation)(Delivery::Value(value.clone()));
        }
        Ok(())
    }

    /// Deliver END to every pending taker and to later takes by tasks older
    /// than `watermark`.
    pub(crate) fn end(&self, watermark: TaskId) {
        self.end_watermark.set(Some(watermark));
        let takers = std::mem::take(&mut *self.takers.borrow_mut());
        debug!(pending = takers.len(), %watermark, "bus ended");
        for taker in takers {
            (taker.continuation)(Delivery::End);
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_takers(&self) -> usize {
        self.takers.borrow().len()
    }
}
