// The engine facade. Channel-carrying operations are routed to exactly
// one shard by a deterministic hash of the channel name, so publishes and
// subscribes on the same channel always meet on the same store. Control
// traffic has no sharding dimension and always uses shard 0.
use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::keys::bucket_index;
use crate::node::{ChannelOptions, HistoryFilter, Node};
use crate::requests::PublishAck;
use crate::shard::Shard;

pub struct Engine {
    shards: Vec<Arc<Shard>>,
    sharding: bool,
}

impl Engine {
    pub fn new(node: Arc<dyn Node>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        if config.shards.len() > 1 {
            tracing::info!(shards = config.shards.len(), "store sharding enabled");
        }
        let shards: Vec<Arc<Shard>> = config
            .shards
            .into_iter()
            .map(|shard_config| Shard::new(Arc::clone(&node), shard_config))
            .collect();
        Ok(Self {
            sharding: shards.len() > 1,
            shards,
        })
    }

    pub fn name(&self) -> &'static str {
        "redis"
    }

    /// Starts every shard's background loops. Operations may be issued
    /// before `run`; they park in the bounded request channels until the
    /// loops drain them.
    pub fn run(&self) -> Result<()> {
        for shard in &self.shards {
            shard.run()?;
        }
        Ok(())
    }

    fn shard(&self, channel: &str) -> &Arc<Shard> {
        if !self.sharding {
            return &self.shards[0];
        }
        &self.shards[bucket_index(channel.as_bytes(), self.shards.len())]
    }

    /// Publishes an encoded client message, appending it to the channel's
    /// history when the options ask for it. Returns a single-use reply
    /// channel; the store round trip happens on the publish pipeline.
    pub async fn publish(&self, channel: &str, payload: &[u8], opts: &ChannelOptions) -> PublishAck {
        self.shard(channel).publish(channel, payload, opts).await
    }

    pub async fn publish_join(&self, channel: &str, payload: &[u8]) -> PublishAck {
        self.shard(channel).publish_join(channel, payload).await
    }

    pub async fn publish_leave(&self, channel: &str, payload: &[u8]) -> PublishAck {
        self.shard(channel).publish_leave(channel, payload).await
    }

    /// Control commands always travel through shard 0.
    pub async fn publish_control(&self, command: &[u8]) -> PublishAck {
        self.shards[0].publish_control(command).await
    }

    pub async fn subscribe(&self, channel: &str) -> Result<()> {
        self.shard(channel).subscribe(channel).await
    }

    pub async fn unsubscribe(&self, channel: &str) -> Result<()> {
        self.shard(channel).unsubscribe(channel).await
    }

    pub async fn add_presence(
        &self,
        channel: &str,
        uid: &str,
        info: &[u8],
        expire_secs: i64,
    ) -> Result<()> {
        self.shard(channel)
            .add_presence(channel, uid, info, expire_secs)
            .await
    }

    pub async fn remove_presence(&self, channel: &str, uid: &str) -> Result<()> {
        self.shard(channel).remove_presence(channel, uid).await
    }

    /// Live presence map for a channel. Expired entries are swept by the
    /// read itself.
    pub async fn presence(&self, channel: &str) -> Result<HashMap<String, Bytes>> {
        self.shard(channel).presence(channel).await
    }

    /// Encoded publications, newest first. Decoding is the node's concern.
    pub async fn history(&self, channel: &str, filter: HistoryFilter) -> Result<Vec<Bytes>> {
        self.shard(channel).history(channel, filter).await
    }

    /// Deferred upstream; succeeds without removing anything.
    pub async fn remove_history(&self, channel: &str) -> Result<()> {
        self.shard(channel).remove_history(channel).await
    }

    /// Union of the logical channels currently subscribed across shards.
    pub async fn channels(&self) -> Result<Vec<String>> {
        let mut union = std::collections::HashSet::new();
        for shard in &self.shards {
            let channels = shard.channels().await?;
            if !self.sharding {
                // Exactly one shard holds every channel.
                return Ok(channels);
            }
            union.extend(channels);
        }
        Ok(union.into_iter().collect())
    }
}
