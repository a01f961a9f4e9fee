// Leader discovery through sentinels. The pool's dialer asks for the
// current leader address before every dial; a background task refreshes
// the answer periodically so leader changes show up in the logs even on
// an otherwise idle pool.
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::{BytesFrame, Resp2Frame};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::config::{SENTINEL_DIAL_TIMEOUT, SENTINEL_REFRESH_INTERVAL, ShardConfig};
use crate::conn::{cmd, with_timeout};
use crate::error::{EngineError, Result};

pub(crate) struct Sentinel {
    master_name: String,
    addrs: Vec<String>,
    last_master: Mutex<Option<String>>,
}

impl Sentinel {
    pub fn new(config: &ShardConfig) -> Self {
        Self {
            master_name: config.master_name.clone().unwrap_or_default(),
            addrs: config.sentinel_addrs.clone(),
            last_master: Mutex::new(None),
        }
    }

    /// Asks the sentinels, in order, for the current leader of the
    /// monitored name. Logs when the answer changes.
    pub async fn master_addr(&self) -> Result<String> {
        for addr in &self.addrs {
            match self.query(addr).await {
                Ok(Some(master)) => {
                    let mut last = self.last_master.lock().expect("sentinel master lock");
                    if last.as_deref() != Some(master.as_str()) {
                        tracing::info!(master = %master, "store leader discovered");
                        *last = Some(master.clone());
                    }
                    return Ok(master);
                }
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(sentinel = %addr, error = %err, "sentinel query failed");
                    continue;
                }
            }
        }
        Err(EngineError::Store(
            "no sentinel returned a leader address".to_string(),
        ))
    }

    async fn query(&self, addr: &str) -> Result<Option<String>> {
        let stream = with_timeout(SENTINEL_DIAL_TIMEOUT, async {
            TcpStream::connect(addr).await.map_err(EngineError::from)
        })
        .await?;
        let mut framed = Framed::new(stream, Resp2::default());
        with_timeout(SENTINEL_DIAL_TIMEOUT, async {
            framed
                .send(cmd(&[
                    b"SENTINEL",
                    b"get-master-addr-by-name",
                    self.master_name.as_bytes(),
                ]))
                .await
                .map_err(EngineError::from)
        })
        .await?;
        let reply = with_timeout(SENTINEL_DIAL_TIMEOUT, async {
            match framed.next().await {
                Some(Ok(frame)) => Ok(frame),
                Some(Err(err)) => Err(err.into()),
                None => Err(EngineError::ConnectionClosed),
            }
        })
        .await?;
        match reply {
            BytesFrame::Array(items) if items.len() == 2 => {
                let host = frame_text(&items[0])?;
                let port = frame_text(&items[1])?;
                Ok(Some(format!("{host}:{port}")))
            }
            BytesFrame::Null => Ok(None),
            BytesFrame::Error(message) => Err(EngineError::Store(message.to_string())),
            other => Err(EngineError::Protocol(format!(
                "unexpected sentinel reply: {other:?}"
            ))),
        }
    }

    /// Periodic re-discovery; stops with the node's shutdown token.
    pub fn spawn_refresh(self: &Arc<Self>, shutdown: CancellationToken) {
        let sentinel = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(SENTINEL_REFRESH_INTERVAL) => {
                        if let Err(err) = sentinel.master_addr().await {
                            tracing::error!(error = %err, "sentinel refresh failed");
                        }
                    }
                }
            }
        });
    }
}

fn frame_text(frame: &BytesFrame) -> Result<String> {
    frame
        .as_str()
        .map(|text| text.to_string())
        .ok_or_else(|| EngineError::Protocol("non-text sentinel reply element".to_string()))
}
