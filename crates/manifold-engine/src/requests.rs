// Typed request envelopes flowing into the shard loops. A producer that
// does not care about per-operation success omits the reply sender; that
// is the documented fire-and-forget contract, and it costs the pipeline
// nothing.
use bytes::Bytes;
use redis_protocol::resp2::types::BytesFrame;
use tokio::sync::oneshot;

use crate::error::Result;

/// Single-use reply channel handed back by the asynchronous publish
/// operations. Await it to learn whether the store accepted the publish.
pub type PublishAck = oneshot::Receiver<Result<()>>;

/// Subscribe or unsubscribe one or more store-level channels on the
/// shard's subscription connection.
pub(crate) struct SubRequest {
    pub channels: Vec<Bytes>,
    pub subscribe: bool,
    pub reply: Option<oneshot::Sender<Result<()>>>,
}

impl SubRequest {
    pub fn done(mut self, result: Result<()>) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(result);
        }
    }
}

/// History parameters attached to a publish when the channel options
/// enable history retention.
pub(crate) struct HistoryMeta {
    pub history_key: Bytes,
    pub touch_key: Bytes,
    pub size: usize,
    pub lifetime_secs: u64,
    pub drop_inactive: bool,
}

/// One outbound publish: an encoded envelope addressed to a store-level
/// channel, optionally with a history append.
pub(crate) struct PubRequest {
    pub channel: Bytes,
    pub payload: Bytes,
    pub history: Option<HistoryMeta>,
    pub reply: Option<oneshot::Sender<Result<()>>>,
}

impl PubRequest {
    pub fn done(mut self, result: Result<()>) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(result);
        }
    }
}

/// Operations serialised through the data pipeline.
pub(crate) enum DataOp {
    AddPresence {
        set_key: Bytes,
        hash_key: Bytes,
        key_expire_secs: i64,
        expire_at: i64,
        uid: String,
        info: Bytes,
    },
    RemovePresence {
        set_key: Bytes,
        hash_key: Bytes,
        uid: String,
    },
    /// Reads the live presence map, sweeping expired UIDs first.
    Presence {
        set_key: Bytes,
        hash_key: Bytes,
        now: i64,
    },
    History {
        history_key: Bytes,
        range_bound: i64,
    },
    Channels {
        pattern: Bytes,
    },
    /// Refreshes the drop-inactive touch key.
    HistoryTouch {
        touch_key: Bytes,
        lifetime_secs: u64,
    },
}

pub(crate) struct DataRequest {
    pub op: DataOp,
    pub reply: Option<oneshot::Sender<Result<BytesFrame>>>,
}

impl DataRequest {
    pub fn done(mut self, result: Result<BytesFrame>) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;

    #[tokio::test]
    async fn reply_is_delivered_once() {
        let (tx, rx) = oneshot::channel();
        let request = SubRequest {
            channels: vec![Bytes::from_static(b"p.client.a")],
            subscribe: true,
            reply: Some(tx),
        };
        request.done(Err(EngineError::Timeout));
        assert!(matches!(rx.await, Ok(Err(EngineError::Timeout))));
    }

    #[test]
    fn fire_and_forget_ignores_results() {
        let request = PubRequest {
            channel: Bytes::from_static(b"p.ping"),
            payload: Bytes::new(),
            history: None,
            reply: None,
        };
        // No reply channel to notify; must not panic.
        request.done(Ok(()));
    }
}
