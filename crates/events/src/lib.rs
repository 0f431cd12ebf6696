//! Wake notifications for idle queue consumers.
//!
//! A wake is a hint that a queue may have new work. It carries no payload and
//! no delivery guarantee; consumers always fall back to polling.

pub mod bus;
pub mod in_memory_bus;

pub use bus::{WakeBus, WakeError, WakeSubscription};
pub use in_memory_bus::InMemoryWakeBus;
