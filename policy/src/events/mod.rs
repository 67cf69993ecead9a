//! Domain events and the broadcast bus that carries them

pub mod bus;
pub mod types;

pub use bus::{EventBus, EventBusError, EventBusResult, EventFilter, FilteredReceiver, SharedEventBus};
pub use types::DomainEvent;
