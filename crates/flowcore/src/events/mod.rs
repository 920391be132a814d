// crates/flowcore/src/events/mod.rs

mod base;
mod bus;

pub use base::{EventEmitter, ExecutionEvent, ExecutionId};
pub use bus::{EventBus, EventHandler};
