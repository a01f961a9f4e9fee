// The subscription plane. One long-lived subscription connection per
// shard, a subscriber actor serialising (un)subscribe commands over it,
// and W worker lanes fanning incoming messages out with per-channel
// affinity so same-channel ordering survives parallel processing.
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::{BytesFrame, Resp2Frame};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;

use crate::config::{
    PUBSUB_WORKER_CHANNEL_SIZE, RESTART_BACKOFF, SUBSCRIBE_BATCH_LIMIT, SUBSCRIBE_CHANNEL_SIZE,
};
use crate::conn::{cmd_owned, with_timeout};
use crate::error::{EngineError, Result};
use crate::keys::bucket_index;
use crate::requests::SubRequest;
use crate::shard::Shard;

pub(crate) type SubReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<SubRequest>>>;

pub(crate) fn sub_channel() -> (mpsc::Sender<SubRequest>, SubReceiver) {
    let (tx, rx) = mpsc::channel(SUBSCRIBE_CHANNEL_SIZE);
    (tx, Arc::new(tokio::sync::Mutex::new(rx)))
}

struct StoreMessage {
    channel: Bytes,
    payload: Bytes,
}

/// Re-runs the pub/sub loop until shutdown, pausing between attempts.
/// Each run owns a fresh connection and performs a full resubscribe, which
/// is what makes a loop exit the unit of failure recovery.
pub(crate) async fn supervisor(shard: Arc<Shard>, shutdown: CancellationToken) {
    loop {
        if shutdown.is_cancelled() {
            return;
        }
        let result = tokio::select! {
            _ = shutdown.cancelled() => return,
            result = run_pub_sub(&shard) => result,
        };
        if let Err(err) = result {
            tracing::error!(error = %err, "store pub/sub loop stopped");
        }
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(RESTART_BACKOFF) => {}
        }
    }
}

async fn run_pub_sub(shard: &Arc<Shard>) -> Result<()> {
    let workers = shard.config.worker_count();
    tracing::debug!(workers, "running store pub/sub");

    let (conn, _permit) = shard.pool.get().await?.detach();
    let (mut reader, writer) = conn.split();

    // Cancelling this token tears down the actor and every lane; the guard
    // fires on any exit path of this function.
    let stop = CancellationToken::new();
    let _stop_guard = stop.clone().drop_guard();

    tokio::spawn(subscriber_actor(
        writer,
        shard.sub_rx.clone(),
        stop.clone(),
        shard.config.write_timeout,
    ));

    let mut lanes = Vec::with_capacity(workers);
    for _ in 0..workers {
        let (tx, rx) = mpsc::channel(PUBSUB_WORKER_CHANNEL_SIZE);
        lanes.push(tx);
        tokio::spawn(worker_lane(rx, Arc::clone(shard), stop.clone()));
    }

    // Initial subscription set: control, ping, and every channel the local
    // hub currently knows about, in bounded batches.
    let mut channels = vec![shard.keys.control_channel(), shard.keys.ping_channel()];
    for channel in shard.node.hub_channels() {
        channels.push(shard.keys.message_channel(&channel));
    }
    for batch in channels.chunks(SUBSCRIBE_BATCH_LIMIT) {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = SubRequest {
            channels: batch.to_vec(),
            subscribe: true,
            reply: Some(reply_tx),
        };
        shard
            .sub_tx
            .send(request)
            .await
            .map_err(|_| EngineError::Shutdown)?;
        reply_rx.await.map_err(|_| EngineError::ReplyDropped)??;
    }
    tracing::debug!(count = channels.len(), "subscribed to store channels");

    let read_timeout = shard.config.read_timeout;
    loop {
        let frame = tokio::select! {
            _ = stop.cancelled() => return Err(EngineError::ConnectionClosed),
            frame = with_timeout(read_timeout, async {
                match reader.next().await {
                    Some(Ok(frame)) => Ok(frame),
                    Some(Err(err)) => Err(EngineError::from(err)),
                    None => Err(EngineError::ConnectionClosed),
                }
            }) => frame?,
        };
        match parse_push(frame)? {
            Push::Message { channel, payload } => {
                metrics::counter!("manifold_pubsub_messages_total").increment(1);
                let lane = bucket_index(&channel, workers);
                if lanes[lane]
                    .send(StoreMessage { channel, payload })
                    .await
                    .is_err()
                {
                    return Err(EngineError::ConnectionClosed);
                }
            }
            // Subscription acks just confirm commands the actor already
            // reported on; nothing to do.
            Push::Ack => {}
            Push::Other => {}
        }
    }
}

enum Push {
    Message { channel: Bytes, payload: Bytes },
    Ack,
    Other,
}

fn parse_push(frame: BytesFrame) -> Result<Push> {
    let BytesFrame::Array(items) = frame else {
        return Ok(Push::Other);
    };
    let kind = items
        .first()
        .and_then(|kind| kind.as_str())
        .map(|kind| kind.to_string());
    match kind.as_deref() {
        Some("message") => {
            let mut items = items.into_iter();
            let _kind = items.next();
            let (Some(BytesFrame::BulkString(channel)), Some(BytesFrame::BulkString(payload))) =
                (items.next(), items.next())
            else {
                return Err(EngineError::Protocol(
                    "malformed pub/sub message frame".to_string(),
                ));
            };
            Ok(Push::Message { channel, payload })
        }
        Some("subscribe") | Some("unsubscribe") => Ok(Push::Ack),
        _ => Ok(Push::Other),
    }
}

/// Serialises subscribe/unsubscribe commands over the subscription
/// connection. On a store error the whole loop is torn down; the restart
/// performs a full resubscribe.
async fn subscriber_actor(
    mut writer: FramedWrite<OwnedWriteHalf, Resp2>,
    sub_rx: SubReceiver,
    stop: CancellationToken,
    write_timeout: Duration,
) {
    tracing::debug!("starting pub/sub subscriber");
    let mut rx = tokio::select! {
        biased;
        _ = stop.cancelled() => return,
        guard = sub_rx.lock() => guard,
    };
    loop {
        let request = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            request = rx.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };
        let verb = if request.subscribe {
            Bytes::from_static(b"SUBSCRIBE")
        } else {
            Bytes::from_static(b"UNSUBSCRIBE")
        };
        let mut parts = Vec::with_capacity(request.channels.len() + 1);
        parts.push(verb);
        parts.extend(request.channels.iter().cloned());
        let send = writer.send(cmd_owned(parts));
        let result = with_timeout(write_timeout, async { send.await.map_err(EngineError::from) }).await;
        match result {
            Ok(()) => request.done(Ok(())),
            Err(err) => {
                tracing::error!(error = %err, "pub/sub subscriber error");
                request.done(Err(err));
                // Force the receiver out as well so the loop restarts.
                stop.cancel();
                break;
            }
        }
    }
    tracing::debug!("stopping pub/sub subscriber");
}

/// One worker lane. Discriminates by store channel name and hands traffic
/// to the node's sinks; a sink failure drops the single message.
async fn worker_lane(
    mut rx: mpsc::Receiver<StoreMessage>,
    shard: Arc<Shard>,
    stop: CancellationToken,
) {
    let control_channel = shard.keys.control_channel();
    let ping_channel = shard.keys.ping_channel();
    loop {
        let message = tokio::select! {
            _ = stop.cancelled() => return,
            message = rx.recv() => match message {
                Some(message) => message,
                None => return,
            },
        };
        if message.payload.is_empty() {
            continue;
        }
        if message.channel == control_channel {
            if let Err(err) = shard.node.handle_control(message.payload) {
                metrics::counter!("manifold_pubsub_dropped_total").increment(1);
                tracing::error!(error = %err, "dropping control message");
            }
        } else if message.channel == ping_channel {
            // Keep-alive traffic only.
        } else if let Err(err) = shard.node.handle_client_message(message.payload) {
            metrics::counter!("manifold_pubsub_dropped_total").increment(1);
            tracing::error!(error = %err, "dropping client message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(text: &str) -> BytesFrame {
        BytesFrame::BulkString(Bytes::copy_from_slice(text.as_bytes()))
    }

    #[test]
    fn message_frames_parse_into_channel_and_payload() {
        let frame = BytesFrame::Array(vec![bulk("message"), bulk("p.client.news"), bulk("hello")]);
        match parse_push(frame).expect("parse") {
            Push::Message { channel, payload } => {
                assert_eq!(&channel[..], b"p.client.news");
                assert_eq!(&payload[..], b"hello");
            }
            _ => panic!("expected message push"),
        }
    }

    #[test]
    fn subscription_acks_are_consumed_silently() {
        let frame = BytesFrame::Array(vec![bulk("subscribe"), bulk("p.control"), BytesFrame::Integer(1)]);
        assert!(matches!(parse_push(frame), Ok(Push::Ack)));
        let frame = BytesFrame::Array(vec![
            bulk("unsubscribe"),
            bulk("p.client.news"),
            BytesFrame::Integer(0),
        ]);
        assert!(matches!(parse_push(frame), Ok(Push::Ack)));
    }

    #[test]
    fn truncated_message_frames_are_protocol_errors() {
        let frame = BytesFrame::Array(vec![bulk("message"), bulk("p.client.news")]);
        assert!(parse_push(frame).is_err());
    }

    #[test]
    fn unknown_frames_are_ignored() {
        assert!(matches!(
            parse_push(BytesFrame::Integer(1)),
            Ok(Push::Other)
        ));
        assert!(matches!(
            parse_push(BytesFrame::Array(vec![bulk("pmessage")])),
            Ok(Push::Other)
        ));
    }
}
