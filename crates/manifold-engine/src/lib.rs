//! Store-backed backplane engine for clustering real-time messaging nodes.
//!
//! Several identical nodes connect to the same Redis-compatible store; a
//! client connected to any node receives messages published on any other
//! node. The engine delegates fan-out, presence, short-term history and
//! inter-node control traffic to the store and exposes a small operation
//! surface ([`Engine`]) to the embedding node.
//!
//! The engine is built from shards. Every logical channel is routed to
//! exactly one shard by a deterministic hash, so publishes and subscribes
//! on the same channel always meet on the same store. Each shard runs
//! three supervised loops over its own connection pool:
//!
//! * a pub/sub loop holding one long-lived subscription connection,
//! * a publish pipeline batching outbound publishes into single flushes,
//! * a data pipeline batching presence/history/channel-list operations.
//!
//! Everything the engine needs from the surrounding process (codecs,
//! message sinks, the local hub, channel options, shutdown) is consumed
//! through the [`Node`] trait.

pub mod config;
pub mod error;
pub mod node;

mod conn;
mod data;
mod engine;
mod keys;
mod pool;
mod publish;
mod pubsub;
mod requests;
mod scripts;
mod sentinel;
mod shard;

pub use config::{EngineConfig, ShardConfig};
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use node::{ChannelOptions, HistoryFilter, Node};
pub use requests::PublishAck;
