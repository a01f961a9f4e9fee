// One shard: a connection pool, the scripts, and three bounded request
// channels feeding three supervised loops. Everything here is immutable
// after construction; the loops own all connection state.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use redis_protocol::resp2::types::BytesFrame;
use tokio::sync::{mpsc, oneshot};

use crate::config::{DATA_CHANNEL_SIZE, PUBLISH_CHANNEL_SIZE, ShardConfig};
use crate::data;
use crate::error::{EngineError, Result};
use crate::keys::KeySchema;
use crate::node::{ChannelOptions, HistoryFilter, Node};
use crate::pool::Pool;
use crate::publish;
use crate::pubsub::{self, SubReceiver};
use crate::requests::{DataOp, DataRequest, HistoryMeta, PubRequest, PublishAck, SubRequest};
use crate::scripts::{
    ADD_PRESENCE, LPOP_MANY, PRESENCE, PUBLISH_WITH_HISTORY, REMOVE_PRESENCE, Script,
};
use crate::sentinel::Sentinel;

pub(crate) struct Shard {
    pub config: Arc<ShardConfig>,
    pub node: Arc<dyn Node>,
    pub keys: KeySchema,
    pub pool: Pool,
    pub publish_script: Script,
    pub add_presence_script: Script,
    pub remove_presence_script: Script,
    pub presence_script: Script,
    /// Reserved for the node's API queue; not exercised by the engine
    /// surface itself.
    #[allow(dead_code)]
    pub lpop_many_script: Script,
    pub sub_tx: mpsc::Sender<SubRequest>,
    pub sub_rx: SubReceiver,
    pub_tx: mpsc::Sender<PubRequest>,
    data_tx: mpsc::Sender<DataRequest>,
    sentinel: Option<Arc<Sentinel>>,
    pub_rx: Mutex<Option<mpsc::Receiver<PubRequest>>>,
    data_rx: Mutex<Option<mpsc::Receiver<DataRequest>>>,
}

impl Shard {
    pub fn new(node: Arc<dyn Node>, config: ShardConfig) -> Arc<Self> {
        let config = Arc::new(config);
        let sentinel = config
            .use_sentinel()
            .then(|| Arc::new(Sentinel::new(&config)));
        let keys = KeySchema::new(&config.prefix);
        let (sub_tx, sub_rx) = pubsub::sub_channel();
        let (pub_tx, pub_rx) = mpsc::channel(PUBLISH_CHANNEL_SIZE);
        let (data_tx, data_rx) = mpsc::channel(DATA_CHANNEL_SIZE);
        Arc::new(Self {
            pool: Pool::new(Arc::clone(&config), sentinel.clone()),
            keys,
            node,
            publish_script: Script::new(2, PUBLISH_WITH_HISTORY),
            add_presence_script: Script::new(2, ADD_PRESENCE),
            remove_presence_script: Script::new(2, REMOVE_PRESENCE),
            presence_script: Script::new(2, PRESENCE),
            lpop_many_script: Script::new(1, LPOP_MANY),
            sub_tx,
            sub_rx,
            pub_tx,
            data_tx,
            sentinel,
            pub_rx: Mutex::new(Some(pub_rx)),
            data_rx: Mutex::new(Some(data_rx)),
            config,
        })
    }

    /// Starts the shard's supervised loops. Valid exactly once.
    pub fn run(self: &Arc<Self>) -> Result<()> {
        let pub_rx = self
            .pub_rx
            .lock()
            .expect("publish receiver lock")
            .take()
            .ok_or(EngineError::AlreadyRunning)?;
        let data_rx = self
            .data_rx
            .lock()
            .expect("data receiver lock")
            .take()
            .ok_or(EngineError::AlreadyRunning)?;
        let shutdown = self.node.shutdown_token();
        if let Some(sentinel) = &self.sentinel {
            sentinel.spawn_refresh(shutdown.clone());
        }
        tokio::spawn(publish::supervisor(
            Arc::clone(self),
            pub_rx,
            shutdown.clone(),
        ));
        tokio::spawn(data::supervisor(
            Arc::clone(self),
            data_rx,
            shutdown.clone(),
        ));
        tokio::spawn(pubsub::supervisor(Arc::clone(self), shutdown));
        Ok(())
    }

    pub async fn publish(
        &self,
        channel: &str,
        payload: &[u8],
        opts: &ChannelOptions,
    ) -> PublishAck {
        let (reply_tx, reply_rx) = oneshot::channel();
        let data = match self.node.encode_publication(channel, payload) {
            Ok(data) => data,
            Err(err) => {
                let _ = reply_tx.send(Err(EngineError::encode(err)));
                return reply_rx;
            }
        };
        let history = opts.history_enabled().then(|| HistoryMeta {
            history_key: self.keys.history_list(channel),
            touch_key: self.keys.history_touch(channel),
            size: opts.history_size,
            lifetime_secs: opts.history_lifetime_secs,
            drop_inactive: opts.history_drop_inactive,
        });
        self.enqueue_publish(PubRequest {
            channel: self.keys.message_channel(channel),
            payload: data,
            history,
            reply: Some(reply_tx),
        })
        .await;
        reply_rx
    }

    pub async fn publish_join(&self, channel: &str, payload: &[u8]) -> PublishAck {
        let (reply_tx, reply_rx) = oneshot::channel();
        let data = match self.node.encode_join(channel, payload) {
            Ok(data) => data,
            Err(err) => {
                let _ = reply_tx.send(Err(EngineError::encode(err)));
                return reply_rx;
            }
        };
        self.enqueue_publish(PubRequest {
            channel: self.keys.message_channel(channel),
            payload: data,
            history: None,
            reply: Some(reply_tx),
        })
        .await;
        reply_rx
    }

    pub async fn publish_leave(&self, channel: &str, payload: &[u8]) -> PublishAck {
        let (reply_tx, reply_rx) = oneshot::channel();
        let data = match self.node.encode_leave(channel, payload) {
            Ok(data) => data,
            Err(err) => {
                let _ = reply_tx.send(Err(EngineError::encode(err)));
                return reply_rx;
            }
        };
        self.enqueue_publish(PubRequest {
            channel: self.keys.message_channel(channel),
            payload: data,
            history: None,
            reply: Some(reply_tx),
        })
        .await;
        reply_rx
    }

    pub async fn publish_control(&self, command: &[u8]) -> PublishAck {
        let (reply_tx, reply_rx) = oneshot::channel();
        let data = match self.node.encode_control(command) {
            Ok(data) => data,
            Err(err) => {
                let _ = reply_tx.send(Err(EngineError::encode(err)));
                return reply_rx;
            }
        };
        self.enqueue_publish(PubRequest {
            channel: self.keys.control_channel(),
            payload: data,
            history: None,
            reply: Some(reply_tx),
        })
        .await;
        reply_rx
    }

    async fn enqueue_publish(&self, request: PubRequest) {
        // A full publish channel blocks the caller here; that is the
        // engine's flow control against a slow store.
        if let Err(mpsc::error::SendError(request)) = self.pub_tx.send(request).await {
            request.done(Err(EngineError::Shutdown));
        }
    }

    pub async fn subscribe(&self, channel: &str) -> Result<()> {
        tracing::debug!(channel, "subscribe node on channel");
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = SubRequest {
            channels: vec![self.keys.message_channel(channel)],
            subscribe: true,
            reply: Some(reply_tx),
        };
        self.sub_tx
            .send(request)
            .await
            .map_err(|_| EngineError::Shutdown)?;
        reply_rx.await.map_err(|_| EngineError::ReplyDropped)??;
        // A successful subscribe refreshes the drop-inactive touch key so
        // history retention resumes for this channel.
        if let Some(opts) = self.node.channel_options(channel)
            && opts.history_drop_inactive
        {
            let _ = self.touch_history(channel, &opts).await;
        }
        Ok(())
    }

    pub async fn unsubscribe(&self, channel: &str) -> Result<()> {
        tracing::debug!(channel, "unsubscribe node from channel");
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = SubRequest {
            channels: vec![self.keys.message_channel(channel)],
            subscribe: false,
            reply: Some(reply_tx),
        };
        self.sub_tx
            .send(request)
            .await
            .map_err(|_| EngineError::Shutdown)?;
        if let Some(opts) = self.node.channel_options(channel)
            && opts.history_drop_inactive
        {
            // Waiting here serialises the drop-inactive handshake: a
            // publish that follows this unsubscribe must not observe a
            // stale touch key.
            let _ = self.touch_history(channel, &opts).await;
        }
        reply_rx.await.map_err(|_| EngineError::ReplyDropped)?
    }

    async fn touch_history(&self, channel: &str, opts: &ChannelOptions) -> Result<BytesFrame> {
        self.data_call(DataOp::HistoryTouch {
            touch_key: self.keys.history_touch(channel),
            lifetime_secs: opts.history_lifetime_secs,
        })
        .await
    }

    pub async fn add_presence(
        &self,
        channel: &str,
        uid: &str,
        info: &[u8],
        expire_secs: i64,
    ) -> Result<()> {
        let expire_at = unix_now() + expire_secs;
        self.data_call(DataOp::AddPresence {
            set_key: self.keys.presence_expire(channel),
            hash_key: self.keys.presence_data(channel),
            key_expire_secs: expire_secs,
            expire_at,
            uid: uid.to_string(),
            info: Bytes::copy_from_slice(info),
        })
        .await
        .map(|_| ())
    }

    pub async fn remove_presence(&self, channel: &str, uid: &str) -> Result<()> {
        self.data_call(DataOp::RemovePresence {
            set_key: self.keys.presence_expire(channel),
            hash_key: self.keys.presence_data(channel),
            uid: uid.to_string(),
        })
        .await
        .map(|_| ())
    }

    pub async fn presence(&self, channel: &str) -> Result<HashMap<String, Bytes>> {
        let reply = self
            .data_call(DataOp::Presence {
                set_key: self.keys.presence_expire(channel),
                hash_key: self.keys.presence_data(channel),
                now: unix_now(),
            })
            .await?;
        data::presence_from_reply(reply)
    }

    pub async fn history(&self, channel: &str, filter: HistoryFilter) -> Result<Vec<Bytes>> {
        // The store includes the last index, so a limit of k reads 0..=k-1;
        // zero means everything.
        let range_bound = if filter.limit > 0 {
            filter.limit as i64 - 1
        } else {
            -1
        };
        let reply = self
            .data_call(DataOp::History {
                history_key: self.keys.history_list(channel),
                range_bound,
            })
            .await?;
        data::history_from_reply(reply)
    }

    /// Accepted for API parity; history removal is deferred and this
    /// returns success without touching the store.
    pub async fn remove_history(&self, _channel: &str) -> Result<()> {
        Ok(())
    }

    pub async fn channels(&self) -> Result<Vec<String>> {
        let pattern = Bytes::from(format!("{}*", self.keys.message_prefix()));
        let reply = self.data_call(DataOp::Channels { pattern }).await?;
        data::channels_from_reply(reply, &self.keys)
    }

    async fn data_call(&self, op: DataOp) -> Result<BytesFrame> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.data_tx
            .send(DataRequest {
                op,
                reply: Some(reply_tx),
            })
            .await
            .map_err(|_| EngineError::Shutdown)?;
        reply_rx.await.map_err(|_| EngineError::ReplyDropped)?
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or_default()
}
