// Seam between the engine and the embedding node process.
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

/// Per-channel options the node resolves for the engine. History is only
/// maintained when both `history_size` and `history_lifetime_secs` are
/// positive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelOptions {
    /// Upper bound on the number of publications kept in the channel's
    /// history list.
    pub history_size: usize,
    /// TTL of the history list (and of the drop-inactive touch key).
    pub history_lifetime_secs: u64,
    /// Stop appending to history once no live subscribers exist on the
    /// backplane; resumed by the next local subscribe.
    pub history_drop_inactive: bool,
}

impl ChannelOptions {
    pub fn history_enabled(&self) -> bool {
        self.history_size > 0 && self.history_lifetime_secs > 0
    }
}

/// Filter for history reads. `limit == 0` returns everything up to the
/// channel's configured history size; otherwise at most `limit` newest
/// entries come back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoryFilter {
    pub limit: usize,
}

/// Services the embedding node provides to the engine.
///
/// Message encoding formats are the node's business: the engine only
/// carries the opaque envelopes the encoders produce, publishes them on
/// the wire and appends them to history. Inbound traffic goes back through
/// the sinks, which decode and dispatch internally; a sink error drops the
/// single offending message.
pub trait Node: Send + Sync + 'static {
    fn encode_publication(&self, channel: &str, payload: &[u8]) -> anyhow::Result<Bytes>;

    fn encode_join(&self, channel: &str, payload: &[u8]) -> anyhow::Result<Bytes>;

    fn encode_leave(&self, channel: &str, payload: &[u8]) -> anyhow::Result<Bytes>;

    fn encode_control(&self, command: &[u8]) -> anyhow::Result<Bytes>;

    /// Sink for messages received on a message channel of this node's
    /// prefix. Called from a pub/sub worker lane; messages from the same
    /// store channel arrive in order.
    fn handle_client_message(&self, data: Bytes) -> anyhow::Result<()>;

    /// Sink for inter-node control commands.
    fn handle_control(&self, data: Bytes) -> anyhow::Result<()>;

    /// Logical channels currently known to the local hub; resubscribed on
    /// every pub/sub loop (re)start.
    fn hub_channels(&self) -> Vec<String>;

    fn channel_options(&self, channel: &str) -> Option<ChannelOptions>;

    /// Token cancelled when the node shuts down; supervisors stop at the
    /// next loop boundary.
    fn shutdown_token(&self) -> CancellationToken;
}
