//! In-process pub/sub queue.
//!
//! A channel pairs a [`Buffer`] with a FIFO list of pending takers. A put
//! goes straight to the oldest matching taker when there is one and is
//! buffered otherwise. Closing is terminal: buffered values stay takeable,
//! every other taker receives [`Delivery::End`].

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use tracing::debug;

use crate::buffer::Buffer;
use crate::error::ChannelError;
use crate::value::{Pattern, Value};

/// What a taker's continuation receives.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Value(Value),
    /// The source is closed and nothing buffered matches.
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TakerId(pub(crate) u64);

pub(crate) type Continuation = Box<dyn FnOnce(Delivery)>;

struct Taker {
    id: TakerId,
    pattern: Pattern,
    continuation: Continuation,
}

struct ChannelState {
    buffer: Buffer,
    takers: VecDeque<Taker>,
    closed: bool,
    next_taker: u64,
}

/// Cheaply cloneable handle; clones share the same queue.
#[derive(Clone)]
pub struct Channel {
    state: Rc<RefCell<ChannelState>>,
}

impl Channel {
    pub fn new(buffer: Buffer) -> Self {
        Self {
            state: Rc::new(RefCell::new(ChannelState {
                buffer,
                takers: VecDeque::new(),
                closed: false,
                next_taker: 1,
            })),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(Buffer::unbounded())
    }

    /// Deliver `value` to the oldest matching taker, or buffer it.
    ///
    /// Puts on a closed channel are ignored. Matching predicates run while
    /// the channel is borrowed and must not touch the channel themselves.
    pub fn put(&self, value: impl Into<Value>) -> Result<(), ChannelError> {
        let value = value.into();
        let taker = {
            let mut state = self.state.borrow_mut();
            if state.closed {
                debug!("put on closed channel ignored");
                return Ok(());
            }
            match state.takers.iter().position(|t| t.pattern.matches(&value)) {
                Some(index) => state.takers.remove(index),
                None => {
                    state.buffer.put(value)?;
                    return Ok(());
                }
            }
        };

        if let Some(taker) = taker {
            (taker.continuation)(Delivery::Value(value));
        }
        Ok(())
    }

    /// Register a taker. If a buffered value matches, or the channel is
    /// closed, `continuation` runs before this returns.
    pub fn take(
        &self,
        pattern: impl Into<Pattern>,
        continuation: impl FnOnce(Delivery) + 'static,
    ) -> TakerId {
        let pattern = pattern.into();
        let (id, ready) = {
            let mut state = self.state.borrow_mut();
            let id = TakerId(state.next_taker);
            state.next_taker += 1;

            if let Some(value) = state.buffer.take(&pattern) {
                (id, Some(Delivery::Value(value)))
            } else if state.closed {
                (id, Some(Delivery::End))
            } else {
                (id, None)
            }
        };

        match ready {
            Some(delivery) => continuation(delivery),
            None => self.state.borrow_mut().takers.push_back(Taker {
                id,
                pattern,
                continuation: Box::new(continuation),
            }),
        }
        id
    }

    /// Deregister a pending taker. Returns false if it already fired.
    pub fn cancel_taker(&self, id: TakerId) -> bool {
        let removed = {
            let mut state = self.state.borrow_mut();
            let index = state.takers.iter().position(|t| t.id == id);
            index.and_then(|i| state.takers.remove(i))
        };
        // dropped outside the borrow: the continuation may own channel clones
        removed.is_some()
    }

    /// Close the channel. Idempotent.
    pub fn close(&self) {
        let takers = {
            let mut state = self.state.borrow_mut();
            if state.closed {
                return;
            }
            state.closed = true;
            // No buffered value matched any of these when they registered, and
            // no further put can arrive.
            std::mem::take(&mut state.takers)
        };
        debug!(pending = takers.len(), "channel closed");
        for taker in takers {
            (taker.continuation)(Delivery::End);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }

    pub fn buffered(&self) -> usize {
        self.state.borrow().buffer.len()
    }

    pub fn pending_takers(&self) -> usize {
        self.state.borrow().takers.len()
    }
}

/// Shorthand for [`Channel::new`].
pub fn channel(buffer: Buffer) -> Channel {
    Channel::new(buffer)
}

impl Default for Channel {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.state, &other.state)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Channel")
            .field("buffered", &state.buffer.len())
            .field("takers", &state.takers.len())
            .field("closed", &state.closed)
            .finish()
    }
}
