// The data pipeline. Presence, history, channel-list and history-touch
// operations share one batching loop with the same flush-once, reply-in-
// order discipline as the publish pipeline. Presence reads double as the
// sweeper: expired UIDs are evicted server-side before the live map comes
// back, so no background reaper exists anywhere in the engine.
use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use redis_protocol::resp2::types::{BytesFrame, Resp2Frame};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{DATA_CHANNEL_SIZE, RESTART_BACKOFF};
use crate::conn::{arg_int, cmd_owned};
use crate::error::{EngineError, Result};
use crate::keys::KeySchema;
use crate::requests::{DataOp, DataRequest};
use crate::shard::Shard;

pub(crate) async fn supervisor(
    shard: Arc<Shard>,
    mut rx: mpsc::Receiver<DataRequest>,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            return;
        }
        let result = tokio::select! {
            _ = shutdown.cancelled() => return,
            result = run_data_pipeline(&shard, &mut rx) => result,
        };
        if let Err(err) = result {
            tracing::error!(error = %err, "data pipeline stopped");
        }
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(RESTART_BACKOFF) => {}
        }
    }
}

async fn run_data_pipeline(shard: &Arc<Shard>, rx: &mut mpsc::Receiver<DataRequest>) -> Result<()> {
    {
        let mut conn = shard.pool.get().await?;
        let scripts = [
            &shard.add_presence_script,
            &shard.presence_script,
            &shard.remove_presence_script,
        ];
        for script in scripts {
            if let Err(err) = script.load(&mut conn).await {
                conn.mark_broken();
                tracing::error!(error = %err, "failed to load presence script");
                return Err(err);
            }
        }
    }

    loop {
        let Some(first) = rx.recv().await else {
            return Ok(());
        };
        let mut batch = vec![first];
        while batch.len() < DATA_CHANNEL_SIZE {
            match rx.try_recv() {
                Ok(request) => batch.push(request),
                Err(_) => break,
            }
        }
        flush_batch(shard, batch).await?;
    }
}

async fn flush_batch(shard: &Arc<Shard>, batch: Vec<DataRequest>) -> Result<()> {
    let mut conn = match shard.pool.get().await {
        Ok(conn) => conn,
        Err(err) => {
            fail_batch(batch, &err);
            return Err(err);
        }
    };

    let mut frames = Vec::with_capacity(batch.len());
    let mut build_err = None;
    for request in &batch {
        match data_command(shard, &request.op) {
            Ok(frame) => frames.push(frame),
            Err(err) => {
                build_err = Some(err);
                break;
            }
        }
    }
    if let Some(err) = build_err {
        conn.mark_broken();
        fail_batch(batch, &err);
        return Err(err);
    }
    for frame in frames {
        if let Err(err) = conn.feed(frame).await {
            conn.mark_broken();
            fail_batch(batch, &err);
            return Err(err);
        }
    }
    if let Err(err) = conn.flush().await {
        conn.mark_broken();
        tracing::error!(error = %err, "error flushing data pipeline");
        fail_batch(batch, &err);
        return Err(err);
    }

    metrics::counter!("manifold_data_batches_total").increment(1);

    let mut no_script = false;
    for request in batch {
        let result = conn.receive().await;
        if let Err(err) = &result
            && err.is_no_script()
        {
            no_script = true;
        }
        request.done(result);
    }
    if no_script {
        conn.mark_broken();
        tracing::error!("store reported NOSCRIPT, reloading presence scripts");
        return Err(EngineError::ScriptNotLoaded);
    }
    Ok(())
}

fn data_command(shard: &Shard, op: &DataOp) -> Result<BytesFrame> {
    match op {
        DataOp::AddPresence {
            set_key,
            hash_key,
            key_expire_secs,
            expire_at,
            uid,
            info,
        } => shard.add_presence_script.eval_command(
            &[set_key.clone(), hash_key.clone()],
            vec![
                arg_int(*key_expire_secs),
                arg_int(*expire_at),
                Bytes::from(uid.clone()),
                info.clone(),
            ],
        ),
        DataOp::RemovePresence {
            set_key,
            hash_key,
            uid,
        } => shard.remove_presence_script.eval_command(
            &[set_key.clone(), hash_key.clone()],
            vec![Bytes::from(uid.clone())],
        ),
        DataOp::Presence {
            set_key,
            hash_key,
            now,
        } => shard.presence_script.eval_command(
            &[set_key.clone(), hash_key.clone()],
            vec![arg_int(*now)],
        ),
        DataOp::History {
            history_key,
            range_bound,
        } => Ok(cmd_owned(vec![
            Bytes::from_static(b"LRANGE"),
            history_key.clone(),
            arg_int(0),
            arg_int(*range_bound),
        ])),
        DataOp::Channels { pattern } => Ok(cmd_owned(vec![
            Bytes::from_static(b"PUBSUB"),
            Bytes::from_static(b"CHANNELS"),
            pattern.clone(),
        ])),
        DataOp::HistoryTouch {
            touch_key,
            lifetime_secs,
        } => Ok(cmd_owned(vec![
            Bytes::from_static(b"SETEX"),
            touch_key.clone(),
            arg_int(*lifetime_secs as i64),
            Bytes::new(),
        ])),
    }
}

fn fail_batch(batch: Vec<DataRequest>, err: &EngineError) {
    for request in batch {
        request.done(Err(err.clone()));
    }
}

/// Decodes the flat field/value array a presence read returns.
pub(crate) fn presence_from_reply(frame: BytesFrame) -> Result<HashMap<String, Bytes>> {
    let BytesFrame::Array(items) = frame else {
        return Err(EngineError::Protocol(
            "presence reply is not an array".to_string(),
        ));
    };
    if items.len() % 2 != 0 {
        return Err(EngineError::Protocol(
            "presence reply has a dangling field".to_string(),
        ));
    }
    let mut presence = HashMap::with_capacity(items.len() / 2);
    let mut items = items.into_iter();
    while let (Some(field), Some(value)) = (items.next(), items.next()) {
        let uid = field
            .as_str()
            .map(|text| text.to_string())
            .ok_or_else(|| EngineError::Protocol("non-text presence uid".to_string()))?;
        let info = match value {
            BytesFrame::BulkString(info) | BytesFrame::SimpleString(info) => info,
            other => {
                return Err(EngineError::Protocol(format!(
                    "unexpected presence info frame: {other:?}"
                )));
            }
        };
        presence.insert(uid, info);
    }
    Ok(presence)
}

/// Decodes a history read into encoded publications, newest first.
pub(crate) fn history_from_reply(frame: BytesFrame) -> Result<Vec<Bytes>> {
    let BytesFrame::Array(items) = frame else {
        return Err(EngineError::Protocol(
            "history reply is not an array".to_string(),
        ));
    };
    items
        .into_iter()
        .map(|item| match item {
            BytesFrame::BulkString(data) | BytesFrame::SimpleString(data) => Ok(data),
            other => Err(EngineError::Protocol(format!(
                "unexpected history entry frame: {other:?}"
            ))),
        })
        .collect()
}

/// Decodes a channel listing, stripping the shard's message prefix.
/// Names outside the message namespace are skipped.
pub(crate) fn channels_from_reply(frame: BytesFrame, keys: &KeySchema) -> Result<Vec<String>> {
    let BytesFrame::Array(items) = frame else {
        return Err(EngineError::Protocol(
            "channels reply is not an array".to_string(),
        ));
    };
    let mut channels = Vec::with_capacity(items.len());
    for item in items {
        let name = item
            .as_str()
            .ok_or_else(|| EngineError::Protocol("non-text channel name".to_string()))?;
        if let Some(logical) = keys.logical_channel(name) {
            channels.push(logical.to_string());
        }
    }
    Ok(channels)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(text: &str) -> BytesFrame {
        BytesFrame::BulkString(Bytes::copy_from_slice(text.as_bytes()))
    }

    #[test]
    fn presence_reply_decodes_pairs() {
        let reply = BytesFrame::Array(vec![
            bulk("uid-1"),
            bulk("info-1"),
            bulk("uid-2"),
            bulk("info-2"),
        ]);
        let presence = presence_from_reply(reply).expect("decode");
        assert_eq!(presence.len(), 2);
        assert_eq!(&presence["uid-1"][..], b"info-1");
        assert_eq!(&presence["uid-2"][..], b"info-2");
    }

    #[test]
    fn empty_presence_reply_is_an_empty_map() {
        let presence = presence_from_reply(BytesFrame::Array(Vec::new())).expect("decode");
        assert!(presence.is_empty());
    }

    #[test]
    fn dangling_presence_field_is_rejected() {
        let reply = BytesFrame::Array(vec![bulk("uid-1")]);
        assert!(presence_from_reply(reply).is_err());
    }

    #[test]
    fn history_reply_preserves_order() {
        let reply = BytesFrame::Array(vec![bulk("m3"), bulk("m2"), bulk("m1")]);
        let history = history_from_reply(reply).expect("decode");
        let entries: Vec<&[u8]> = history.iter().map(|entry| &entry[..]).collect();
        assert_eq!(entries, vec![b"m3".as_slice(), b"m2", b"m1"]);
    }

    #[test]
    fn channel_reply_strips_prefix_and_skips_foreign_names() {
        let keys = KeySchema::new("manifold");
        let reply = BytesFrame::Array(vec![
            bulk("manifold.client.news"),
            bulk("manifold.control"),
            bulk("other.client.chat"),
            bulk("manifold.client.chat"),
        ]);
        let mut channels = channels_from_reply(reply, &keys).expect("decode");
        channels.sort();
        assert_eq!(channels, vec!["chat".to_string(), "news".to_string()]);
    }
}
