//! Wake bus backends that cross process boundaries.
//!
//! Both forward wire notifications into a local `InMemoryWakeBus`, so
//! subscribing never touches the network.

pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis;

pub use postgres::PgNotifyWakeBus;
#[cfg(feature = "redis")]
pub use self::redis::RedisPubSubWakeBus;
