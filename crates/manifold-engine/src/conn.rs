// Framed RESP connection with the shard's timeouts applied per call.
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::{BytesFrame, Resp2Frame};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{Framed, FramedRead, FramedWrite};

use crate::config::ShardConfig;
use crate::error::{EngineError, Result};

/// Builds a command frame from borrowed parts.
pub(crate) fn cmd(parts: &[&[u8]]) -> BytesFrame {
    BytesFrame::Array(
        parts
            .iter()
            .map(|part| BytesFrame::BulkString(Bytes::copy_from_slice(part)))
            .collect(),
    )
}

/// Builds a command frame from owned parts without copying.
pub(crate) fn cmd_owned(parts: Vec<Bytes>) -> BytesFrame {
    BytesFrame::Array(parts.into_iter().map(BytesFrame::BulkString).collect())
}

/// Integers travel as bulk strings in client commands.
pub(crate) fn arg_int(value: i64) -> Bytes {
    Bytes::from(value.to_string())
}

/// Maps an error reply onto the engine error type; everything else passes
/// through untouched.
pub(crate) fn reply_result(frame: BytesFrame) -> Result<BytesFrame> {
    match frame {
        BytesFrame::Error(message) => Err(EngineError::Store(message.to_string())),
        other => Ok(other),
    }
}

/// Runs `future` under `limit` unless the limit is zero.
pub(crate) async fn with_timeout<F, T>(limit: Duration, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if limit.is_zero() {
        return future.await;
    }
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::Timeout),
    }
}

/// One framed connection to the store. Commands are buffered with `feed`
/// and go out on `flush`, which is what lets the pipelines amortise a
/// whole batch into a single round trip.
pub(crate) struct Conn {
    framed: Framed<TcpStream, Resp2>,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl Conn {
    /// Dials `addr` and performs the optional `AUTH` and `SELECT` steps.
    pub async fn connect(config: &ShardConfig, addr: &str) -> Result<Self> {
        let stream = with_timeout(config.connect_timeout, async {
            TcpStream::connect(addr).await.map_err(EngineError::from)
        })
        .await?;
        stream.set_nodelay(true)?;
        let mut conn = Self {
            framed: Framed::new(stream, Resp2::default()),
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
        };
        if let Some(password) = config.password.as_deref() {
            conn.call(cmd(&[b"AUTH", password.as_bytes()])).await?;
        }
        if config.db != 0 {
            conn.call(cmd_owned(vec![
                Bytes::from_static(b"SELECT"),
                arg_int(i64::from(config.db)),
            ]))
            .await?;
        }
        Ok(conn)
    }

    /// Buffers one command without flushing.
    pub async fn feed(&mut self, frame: BytesFrame) -> Result<()> {
        self.framed.feed(frame).await.map_err(EngineError::from)
    }

    pub async fn flush(&mut self) -> Result<()> {
        let flush = <Framed<TcpStream, Resp2> as SinkExt<BytesFrame>>::flush(&mut self.framed);
        with_timeout(self.write_timeout, async {
            flush.await.map_err(EngineError::from)
        })
        .await
    }

    /// Reads one reply, mapping error replies to [`EngineError::Store`].
    pub async fn receive(&mut self) -> Result<BytesFrame> {
        let next = self.framed.next();
        let frame = with_timeout(self.read_timeout, async {
            match next.await {
                Some(Ok(frame)) => Ok(frame),
                Some(Err(err)) => Err(err.into()),
                None => Err(EngineError::ConnectionClosed),
            }
        })
        .await?;
        reply_result(frame)
    }

    /// One full command round trip.
    pub async fn call(&mut self, frame: BytesFrame) -> Result<BytesFrame> {
        self.feed(frame).await?;
        self.flush().await?;
        self.receive().await
    }

    /// Liveness probe used by the pool on borrow.
    pub async fn ping(&mut self) -> Result<()> {
        self.call(cmd(&[b"PING"])).await.map(|_| ())
    }

    /// Role probe used instead of `PING` when leader discovery is
    /// configured: a connection to a demoted leader must be rejected.
    pub async fn is_master(&mut self) -> Result<bool> {
        let reply = self.call(cmd(&[b"ROLE"])).await?;
        Ok(matches!(
            &reply,
            BytesFrame::Array(items) if items.first().and_then(|item| item.as_str()) == Some("master")
        ))
    }

    /// Splits into read/write halves for the subscription connection,
    /// where one task blocks on incoming frames while another issues
    /// subscribe commands.
    pub fn split(
        self,
    ) -> (
        FramedRead<OwnedReadHalf, Resp2>,
        FramedWrite<OwnedWriteHalf, Resp2>,
    ) {
        let stream = self.framed.into_inner();
        let (read_half, write_half) = stream.into_split();
        (
            FramedRead::new(read_half, Resp2::default()),
            FramedWrite::new(write_half, Resp2::default()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmd_builds_bulk_string_arrays() {
        let frame = cmd(&[b"PUBLISH", b"p.client.news", b"payload"]);
        let BytesFrame::Array(items) = frame else {
            panic!("expected array frame");
        };
        assert_eq!(items.len(), 3);
        assert!(matches!(&items[0], BytesFrame::BulkString(s) if &s[..] == b"PUBLISH"));
        assert!(matches!(&items[2], BytesFrame::BulkString(s) if &s[..] == b"payload"));
    }

    #[test]
    fn arg_int_renders_decimal() {
        assert_eq!(&arg_int(42)[..], b"42");
        assert_eq!(&arg_int(-1)[..], b"-1");
    }

    #[test]
    fn error_replies_become_store_errors() {
        let err = reply_result(BytesFrame::Error("NOSCRIPT missing".into())).expect_err("error");
        assert!(err.is_no_script());
        let ok = reply_result(BytesFrame::Integer(3)).expect("integer passes");
        assert!(matches!(ok, BytesFrame::Integer(3)));
    }

    #[tokio::test]
    async fn with_timeout_zero_means_unbounded() {
        let value = with_timeout(Duration::ZERO, async { Ok::<_, EngineError>(7) })
            .await
            .expect("no timeout");
        assert_eq!(value, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn with_timeout_expires() {
        let result = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok::<_, EngineError>(())
        })
        .await;
        assert!(matches!(result, Err(EngineError::Timeout)));
    }
}
