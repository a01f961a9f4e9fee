// The publish pipeline. Outbound publishes are drained into batches and
// sent over one pooled connection with a single flush, which amortises
// round-trip latency and keeps a total order within the flush. The same
// loop paces keep-alive pings so the subscription connection never trips
// the store's idle read timeout.
use std::sync::Arc;

use bytes::Bytes;
use redis_protocol::resp2::types::BytesFrame;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{PUBLISH_BATCH_LIMIT, RESTART_BACKOFF};
use crate::conn::{arg_int, cmd_owned};
use crate::error::{EngineError, Result};
use crate::requests::PubRequest;
use crate::shard::Shard;

pub(crate) async fn supervisor(
    shard: Arc<Shard>,
    mut rx: mpsc::Receiver<PubRequest>,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            return;
        }
        let result = tokio::select! {
            _ = shutdown.cancelled() => return,
            result = run_publish_pipeline(&shard, &mut rx) => result,
        };
        if let Err(err) = result {
            tracing::error!(error = %err, "publish pipeline stopped");
        }
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(RESTART_BACKOFF) => {}
        }
    }
}

async fn run_publish_pipeline(
    shard: &Arc<Shard>,
    rx: &mut mpsc::Receiver<PubRequest>,
) -> Result<()> {
    {
        // Publishing with history goes through EVALSHA, so the script must
        // be resident before the first request is served.
        let mut conn = shard.pool.get().await?;
        if let Err(err) = shard.publish_script.load(&mut conn).await {
            conn.mark_broken();
            tracing::error!(error = %err, "failed to load publish script");
            return Err(err);
        }
    }

    let ping_interval = shard.config.read_timeout / 3;
    let ping_channel = shard.keys.ping_channel();

    loop {
        tokio::select! {
            _ = tokio::time::sleep(ping_interval) => {
                // The subscription connection only ever reads; these pings
                // are what keep it inside the store's idle read timeout.
                let mut conn = shard.pool.get().await?;
                let ping = cmd_owned(vec![
                    Bytes::from_static(b"PUBLISH"),
                    ping_channel.clone(),
                    Bytes::new(),
                ]);
                if let Err(err) = conn.call(ping).await {
                    conn.mark_broken();
                    tracing::error!(error = %err, "ping publish failed");
                    return Err(err);
                }
            }
            first = rx.recv() => {
                let Some(first) = first else { return Ok(()) };
                let mut batch = vec![first];
                while batch.len() < PUBLISH_BATCH_LIMIT {
                    match rx.try_recv() {
                        Ok(request) => batch.push(request),
                        Err(_) => break,
                    }
                }
                flush_batch(shard, batch).await?;
            }
        }
    }
}

async fn flush_batch(shard: &Arc<Shard>, batch: Vec<PubRequest>) -> Result<()> {
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
        match publish_command(shard, request) {
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
        tracing::error!(error = %err, "error flushing publish pipeline");
        fail_batch(batch, &err);
        return Err(err);
    }

    metrics::counter!("manifold_publish_batches_total").increment(1);
    metrics::counter!("manifold_publish_requests_total").increment(batch.len() as u64);

    let mut no_script = false;
    for request in batch {
        let result = conn.receive().await.map(|_| ());
        if let Err(err) = &result
            && err.is_no_script()
        {
            // Scripts were flushed on the store. Finish delivering replies,
            // then exit so the restarted loop loads them again.
            no_script = true;
        }
        request.done(result);
    }
    if no_script {
        conn.mark_broken();
        tracing::error!("store reported NOSCRIPT, reloading publish script");
        return Err(EngineError::ScriptNotLoaded);
    }
    Ok(())
}

fn publish_command(shard: &Shard, request: &PubRequest) -> Result<BytesFrame> {
    match &request.history {
        Some(history) => shard.publish_script.eval_command(
            &[history.history_key.clone(), history.touch_key.clone()],
            vec![
                request.channel.clone(),
                request.payload.clone(),
                // Trim bound is inclusive: size - 1 keeps exactly `size`.
                arg_int(history.size.saturating_sub(1) as i64),
                arg_int(history.lifetime_secs as i64),
                Bytes::from_static(if history.drop_inactive { b"1" } else { b"0" }),
            ],
        ),
        None => Ok(cmd_owned(vec![
            Bytes::from_static(b"PUBLISH"),
            request.channel.clone(),
            request.payload.clone(),
        ])),
    }
}

fn fail_batch(batch: Vec<PubRequest>, err: &EngineError) {
    for request in batch {
        request.done(Err(err.clone()));
    }
}
