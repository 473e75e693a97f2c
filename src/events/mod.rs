//! Typed event bus with room-scoped fan-out.

mod bus;
mod types;

pub use bus::{EventBus, Subscription, DEFAULT_BUFFER};
pub use types::{Event, EventKind, ReasoningPhase, Room};
