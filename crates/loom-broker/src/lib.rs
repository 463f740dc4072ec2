//! Stream/hash broker abstraction: the `Broker` trait plus a real Redis
//! backend and a deterministic in-memory fake.
//!
//! See `SPEC_FULL.md` §4.1 and §6 for the wire contract both backends must
//! honor identically.

pub mod config;
pub mod error;
pub mod memory;
pub mod redis_broker;
pub mod trait_def;

pub use config::BrokerConfig;
pub use error::BrokerError;
pub use memory::InMemoryBroker;
pub use redis_broker::RedisBroker;
pub use trait_def::{Broker, StreamEntry};
