// Recording `Node` implementation. Envelopes use a small length-prefixed
// wire format so tests can assert on the kind, channel and payload of
// everything that comes back through the sinks.
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use manifold_engine::{ChannelOptions, Node};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Publication,
    Join,
    Leave,
}

impl MessageKind {
    fn as_u8(self) -> u8 {
        match self {
            MessageKind::Publication => 1,
            MessageKind::Join => 2,
            MessageKind::Leave => 3,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Publication),
            2 => Some(Self::Join),
            3 => Some(Self::Leave),
            _ => None,
        }
    }
}

/// A decoded client message as observed by the node's sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientEnvelope {
    pub kind: MessageKind,
    pub channel: String,
    pub payload: Bytes,
}

pub struct TestNode {
    shutdown: CancellationToken,
    hub: Mutex<BTreeSet<String>>,
    options: Mutex<HashMap<String, ChannelOptions>>,
    fail_encode: AtomicBool,
    client_tx: mpsc::UnboundedSender<ClientEnvelope>,
    control_tx: mpsc::UnboundedSender<Bytes>,
}

/// Receiving ends of the node's sinks, handed to the test.
pub struct TestNodeEvents {
    pub client: mpsc::UnboundedReceiver<ClientEnvelope>,
    pub control: mpsc::UnboundedReceiver<Bytes>,
}

impl TestNode {
    pub fn new() -> (Arc<Self>, TestNodeEvents) {
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let node = Arc::new(Self {
            shutdown: CancellationToken::new(),
            hub: Mutex::new(BTreeSet::new()),
            options: Mutex::new(HashMap::new()),
            fail_encode: AtomicBool::new(false),
            client_tx,
            control_tx,
        });
        (
            node,
            TestNodeEvents {
                client: client_rx,
                control: control_rx,
            },
        )
    }

    pub fn add_hub_channel(&self, channel: &str) {
        self.hub.lock().expect("hub lock").insert(channel.to_string());
    }

    pub fn set_channel_options(&self, channel: &str, opts: ChannelOptions) {
        self.options
            .lock()
            .expect("options lock")
            .insert(channel.to_string(), opts);
    }

    /// Makes every encoder fail, for exercising the pre-enqueue error path.
    pub fn set_fail_encode(&self, fail: bool) {
        self.fail_encode.store(fail, Ordering::Relaxed);
    }

    pub fn trigger_shutdown(&self) {
        self.shutdown.cancel();
    }

    fn encode(&self, kind: MessageKind, channel: &str, payload: &[u8]) -> anyhow::Result<Bytes> {
        if self.fail_encode.load(Ordering::Relaxed) {
            bail!("encoder disabled");
        }
        let mut buf = BytesMut::with_capacity(3 + channel.len() + payload.len());
        buf.put_u8(kind.as_u8());
        buf.put_u16(channel.len() as u16);
        buf.put_slice(channel.as_bytes());
        buf.put_slice(payload);
        Ok(buf.freeze())
    }
}

pub fn decode_envelope(mut data: Bytes) -> anyhow::Result<ClientEnvelope> {
    if data.remaining() < 3 {
        bail!("envelope too short");
    }
    let kind = MessageKind::from_u8(data.get_u8()).context("unknown message kind")?;
    let channel_len = data.get_u16() as usize;
    if data.remaining() < channel_len {
        bail!("truncated channel name");
    }
    let channel = String::from_utf8(data.split_to(channel_len).to_vec())
        .context("channel name not utf-8")?;
    Ok(ClientEnvelope {
        kind,
        channel,
        payload: data,
    })
}

impl Node for TestNode {
    fn encode_publication(&self, channel: &str, payload: &[u8]) -> anyhow::Result<Bytes> {
        self.encode(MessageKind::Publication, channel, payload)
    }

    fn encode_join(&self, channel: &str, payload: &[u8]) -> anyhow::Result<Bytes> {
        self.encode(MessageKind::Join, channel, payload)
    }

    fn encode_leave(&self, channel: &str, payload: &[u8]) -> anyhow::Result<Bytes> {
        self.encode(MessageKind::Leave, channel, payload)
    }

    fn encode_control(&self, command: &[u8]) -> anyhow::Result<Bytes> {
        if self.fail_encode.load(Ordering::Relaxed) {
            bail!("encoder disabled");
        }
        Ok(Bytes::copy_from_slice(command))
    }

    fn handle_client_message(&self, data: Bytes) -> anyhow::Result<()> {
        let envelope = decode_envelope(data)?;
        self.client_tx
            .send(envelope)
            .context("client sink closed")?;
        Ok(())
    }

    fn handle_control(&self, data: Bytes) -> anyhow::Result<()> {
        self.control_tx.send(data).context("control sink closed")?;
        Ok(())
    }

    fn hub_channels(&self) -> Vec<String> {
        self.hub.lock().expect("hub lock").iter().cloned().collect()
    }

    fn channel_options(&self, channel: &str) -> Option<ChannelOptions> {
        self.options
            .lock()
            .expect("options lock")
            .get(channel)
            .copied()
    }

    fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}
