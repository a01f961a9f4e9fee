// Store-level name derivation and deterministic bucket routing.
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use bytes::Bytes;

pub(crate) const CONTROL_CHANNEL_SUFFIX: &str = ".control";
pub(crate) const PING_CHANNEL_SUFFIX: &str = ".ping";
pub(crate) const CLIENT_CHANNEL_INFIX: &str = ".client.";

/// Pure functions from `(prefix, logical channel)` to the names a shard
/// uses in the store. One instance per shard, built from its key prefix.
#[derive(Debug, Clone)]
pub(crate) struct KeySchema {
    prefix: String,
    message_prefix: String,
}

impl KeySchema {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            message_prefix: format!("{prefix}{CLIENT_CHANNEL_INFIX}"),
        }
    }

    /// Prefix shared by every message channel, also used as the
    /// `PUBSUB CHANNELS` glob (with a trailing `*`).
    pub fn message_prefix(&self) -> &str {
        &self.message_prefix
    }

    pub fn message_channel(&self, channel: &str) -> Bytes {
        Bytes::from(format!("{}{channel}", self.message_prefix))
    }

    pub fn control_channel(&self) -> Bytes {
        Bytes::from(format!("{}{CONTROL_CHANNEL_SUFFIX}", self.prefix))
    }

    pub fn ping_channel(&self) -> Bytes {
        Bytes::from(format!("{}{PING_CHANNEL_SUFFIX}", self.prefix))
    }

    pub fn history_list(&self, channel: &str) -> Bytes {
        Bytes::from(format!("{}.history.list.{channel}", self.prefix))
    }

    pub fn history_touch(&self, channel: &str) -> Bytes {
        Bytes::from(format!("{}.history.touch.{channel}", self.prefix))
    }

    pub fn presence_data(&self, channel: &str) -> Bytes {
        Bytes::from(format!("{}.presence.data.{channel}", self.prefix))
    }

    pub fn presence_expire(&self, channel: &str) -> Bytes {
        Bytes::from(format!("{}.presence.expire.{channel}", self.prefix))
    }

    /// Recovers the logical channel from a store-level message channel
    /// name. Returns `None` for names outside the message namespace.
    pub fn logical_channel<'a>(&self, store_name: &'a str) -> Option<&'a str> {
        store_name.strip_prefix(self.message_prefix.as_str())
    }
}

/// Deterministic bucket assignment used for shard routing and worker-lane
/// affinity. The same name and bucket count always map to the same bucket
/// for the lifetime of the engine, which is what keeps per-channel
/// ordering intact across parallel workers.
pub(crate) fn bucket_index(name: &[u8], buckets: usize) -> usize {
    debug_assert!(buckets > 0);
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    (hasher.finish() as usize) % buckets
}

#[cfg(test)]
mod tests {
    use super::{KeySchema, bucket_index};

    #[test]
    fn derives_store_level_names() {
        let keys = KeySchema::new("manifold");
        assert_eq!(&keys.message_channel("news")[..], b"manifold.client.news");
        assert_eq!(&keys.control_channel()[..], b"manifold.control");
        assert_eq!(&keys.ping_channel()[..], b"manifold.ping");
        assert_eq!(&keys.history_list("news")[..], b"manifold.history.list.news");
        assert_eq!(&keys.history_touch("news")[..], b"manifold.history.touch.news");
        assert_eq!(&keys.presence_data("news")[..], b"manifold.presence.data.news");
        assert_eq!(
            &keys.presence_expire("news")[..],
            b"manifold.presence.expire.news"
        );
    }

    #[test]
    fn logical_channel_strips_the_message_prefix() {
        let keys = KeySchema::new("manifold");
        assert_eq!(keys.logical_channel("manifold.client.news"), Some("news"));
        assert_eq!(keys.logical_channel("manifold.control"), None);
        assert_eq!(keys.logical_channel("other.client.news"), None);
    }

    #[test]
    fn bucket_index_is_deterministic_and_bounded() {
        for buckets in [1, 2, 7, 64] {
            for name in ["a", "news", "presence:room-42", ""] {
                let first = bucket_index(name.as_bytes(), buckets);
                assert_eq!(first, bucket_index(name.as_bytes(), buckets));
                assert!(first < buckets);
            }
        }
    }

    #[test]
    fn bucket_index_spreads_names() {
        let buckets = 8;
        let hit: std::collections::HashSet<usize> = (0..256)
            .map(|i| bucket_index(format!("channel-{i}").as_bytes(), buckets))
            .collect();
        assert!(hit.len() > 1);
    }
}
