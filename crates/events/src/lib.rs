//! `fieldqueue-events`: observable sync events and the pub/sub channel carrying them.
//!
//! The sync core publishes [`SyncEvent`]s; presentation layers subscribe and poll.
//! Nothing here depends on a UI framework or an async runtime.

pub mod bus;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use event::SyncEvent;
pub use in_memory_bus::{BusError, InMemoryEventBus};
