//! Cooperative saga interpreter.
//!
//! Sagas are `async` bodies that describe side effects as data (take an
//! action, put one, call a function, fork a child, race, join, cancel). The
//! interpreter runs those effects against a host's dispatch path and
//! in-process channels, on a single thread, in a deterministic order.
//!
//! Hosts plug in through [`Host`]; [`ReducerHost`] adapts a plain
//! [`Reducer`] for small programs and tests.

pub mod buffer;
mod bus;
pub mod channel;
pub mod config;
mod coroutine;
pub mod deferred;
pub mod effect;
pub mod effects;
pub mod error;
pub mod helpers;
pub mod middleware;
pub mod monitor;
mod runner;
pub mod task;
pub mod traits;
pub mod value;

pub use buffer::Buffer;
pub use channel::{channel, Channel, Delivery};
pub use config::SagaConfig;
pub use coroutine::{Ctx, Perform, Saga};
pub use deferred::Deferred;
pub use effect::{CallResult, Effect};
pub use error::{ChannelError, ConfigError, Result, SagaError};
pub use helpers::{take_every, take_latest};
pub use middleware::SagaMiddleware;
pub use monitor::{MemoryMonitor, MonitorEvent, TracingMonitor};
pub use task::{Task, TaskId, TaskOutcome, TaskStatus};
pub use traits::{Host, Monitor, Reducer, ReducerHost};
pub use value::{Action, Pattern, Value};
