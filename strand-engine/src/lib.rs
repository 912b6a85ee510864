//! The strand engine: DHT adapter, subscription manager, and the command
//! surface that the admin layer and CLI dispatch to.

pub mod commands;
pub mod config;
pub mod dht;
pub mod engine;
pub mod keys;
pub mod subscriptions;

pub use commands::EngineError;
pub use config::EngineConfig;
pub use dht::{Dht, DhtAdapter, DhtError, DhtEvent, MemoryDht, MutableItem};
pub use engine::{Engine, EngineEvent};
pub use subscriptions::{Subscription, SubscriptionManager};
