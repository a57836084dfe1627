//! Broker implementations of the session seam.

pub mod memory;

pub use memory::{BrokerCall, InMemoryBroker, InMemorySession, QueueSpec};
