//! Storage policies backing a [`Channel`](crate::Channel).

use std::collections::VecDeque;

use tracing::trace;

use crate::error::ChannelError;
use crate::value::{Pattern, Value};

/// Initial capacity hint for unbounded buffers.
pub const DEFAULT_EXPANDING_INITIAL: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    /// Rendezvous: nothing is ever stored.
    None,
    Bounded(usize),
    Unbounded,
}

/// What a bounded buffer does with a value that doesn't fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overflow {
    Reject,
    DropNewest,
    DropOldest,
}

#[derive(Debug)]
pub struct Buffer {
    capacity: Capacity,
    overflow: Overflow,
    items: VecDeque<Value>,
}

impl Buffer {
    /// Zero capacity. A put only lands if a taker is already waiting.
    pub fn none() -> Self {
        Self::with_policy(Capacity::None, Overflow::DropNewest, 0)
    }

    /// Holds up to `limit` values; a put beyond that fails with
    /// [`ChannelError::Overflow`].
    pub fn fixed(limit: usize) -> Self {
        Self::with_policy(Capacity::Bounded(limit), Overflow::Reject, limit)
    }

    /// Holds up to `limit` values; further puts are discarded.
    pub fn dropping(limit: usize) -> Self {
        Self::with_policy(Capacity::Bounded(limit), Overflow::DropNewest, limit)
    }

    /// Holds the `limit` most recent values; the oldest is evicted to make room.
    pub fn sliding(limit: usize) -> Self {
        Self::with_policy(Capacity::Bounded(limit), Overflow::DropOldest, limit)
    }

    /// Unbounded FIFO, preallocated for `initial` values.
    pub fn expanding(initial: usize) -> Self {
        Self::with_policy(Capacity::Unbounded, Overflow::Reject, initial)
    }

    pub fn unbounded() -> Self {
        Self::expanding(DEFAULT_EXPANDING_INITIAL)
    }

    fn with_policy(capacity: Capacity, overflow: Overflow, prealloc: usize) -> Self {
        Self {
            capacity,
            overflow,
            items: VecDeque::with_capacity(prealloc),
        }
    }

    pub fn capacity(&self) -> Capacity {
        self.capacity
    }

    pub fn overflow(&self) -> Overflow {
        self.overflow
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn put(&mut self, value: Value) -> Result<(), ChannelError> {
        let limit = match self.capacity {
            Capacity::Unbounded => {
                self.items.push_back(value);
                return Ok(());
            }
            Capacity::None => {
                trace!("no taker waiting, value discarded");
                return Ok(());
            }
            Capacity::Bounded(limit) => limit,
        };

        if self.items.len() < limit {
            self.items.push_back(value);
            return Ok(());
        }

        match self.overflow {
            Overflow::Reject => Err(ChannelError::Overflow { limit }),
            Overflow::DropNewest => {
                trace!(limit, "buffer full, newest value dropped");
                Ok(())
            }
            Overflow::DropOldest => {
                if limit > 0 {
                    self.items.pop_front();
                    self.items.push_back(value);
                }
                Ok(())
            }
        }
    }

    /// Remove the oldest value matching `pattern`.
    pub fn take(&mut self, pattern: &Pattern) -> Option<Value> {
        let index = self.items.iter().position(|v| pattern.matches(v))?;
        self.items.remove(index)
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::unbounded()
    }
}
