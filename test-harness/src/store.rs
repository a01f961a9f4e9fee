// In-process RESP2 mock store. Implements just enough of the store
// surface for engine tests: pub/sub with fan-out counts, the engine's
// server-side scripts executed natively, bounded lists, presence keys
// with lazy TTLs, and a sentinel answering leader queries. State is
// inspectable so tests can assert on what the engine actually wrote.
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::BytesFrame;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

pub struct MockStore {
    addr: SocketAddr,
    state: Arc<Mutex<State>>,
    shutdown: CancellationToken,
}

#[derive(Default)]
struct State {
    strings: HashMap<String, Entry<Bytes>>,
    lists: HashMap<String, Entry<VecDeque<Bytes>>>,
    hashes: HashMap<String, Entry<HashMap<String, Bytes>>>,
    zsets: HashMap<String, Entry<BTreeMap<String, i64>>>,
    scripts: HashMap<String, ScriptKind>,
    script_seq: u64,
    conns: HashMap<u64, ConnState>,
    next_conn: u64,
}

struct Entry<T> {
    value: T,
    deadline: Option<Instant>,
}

impl<T> Entry<T> {
    fn expired(&self) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= Instant::now())
    }
}

struct ConnState {
    tx: mpsc::UnboundedSender<BytesFrame>,
    channels: HashSet<String>,
}

#[derive(Clone, Copy, Debug)]
enum ScriptKind {
    PublishWithHistory,
    AddPresence,
    RemovePresence,
    PresenceRead,
    PopMany,
}

impl MockStore {
    pub async fn spawn() -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("bind mock store")?;
        let addr = listener.local_addr().context("mock store addr")?;
        let state: Arc<Mutex<State>> = Arc::default();
        let shutdown = CancellationToken::new();

        let accept_state = Arc::clone(&state);
        let accept_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = accept_shutdown.cancelled() => return,
                    accepted = listener.accept() => accepted,
                };
                let Ok((socket, _)) = accepted else { return };
                tokio::spawn(handle_conn(
                    socket,
                    Arc::clone(&accept_state),
                    accept_shutdown.clone(),
                ));
            }
        });

        Ok(Self {
            addr,
            state,
            shutdown,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Drops every cached script, like `SCRIPT FLUSH` on a real store.
    pub fn script_flush(&self) {
        self.state.lock().expect("store state").scripts.clear();
    }

    pub fn list_entries(&self, key: &str) -> Vec<Bytes> {
        let mut state = self.state.lock().expect("store state");
        match state.live_list(key) {
            Some(list) => list.iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    pub fn key_exists(&self, key: &str) -> bool {
        let mut state = self.state.lock().expect("store state");
        state.live_string(key).is_some()
    }

    pub fn hash_contains(&self, key: &str, field: &str) -> bool {
        let mut state = self.state.lock().expect("store state");
        state
            .live_hash(key)
            .is_some_and(|hash| hash.contains_key(field))
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        let state = self.state.lock().expect("store state");
        state
            .conns
            .values()
            .filter(|conn| conn.channels.contains(channel))
            .count()
    }
}

impl Drop for MockStore {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn handle_conn(socket: TcpStream, state: Arc<Mutex<State>>, shutdown: CancellationToken) {
    let (read_half, write_half) = socket.into_split();
    let mut reader = FramedRead::new(read_half, Resp2::default());
    let mut writer = FramedWrite::new(write_half, Resp2::default());
    let (tx, mut rx) = mpsc::unbounded_channel::<BytesFrame>();

    let conn_id = {
        let mut state = state.lock().expect("store state");
        let id = state.next_conn;
        state.next_conn += 1;
        state.conns.insert(
            id,
            ConnState {
                tx,
                channels: HashSet::new(),
            },
        );
        id
    };

    let writer_shutdown = shutdown.clone();
    let writer_task = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                _ = writer_shutdown.cancelled() => return,
                frame = rx.recv() => match frame {
                    Some(frame) => frame,
                    None => return,
                },
            };
            if writer.send(frame).await.is_err() {
                return;
            }
        }
    });

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = reader.next() => frame,
        };
        let Some(Ok(frame)) = frame else { break };
        let replies = {
            let mut state = state.lock().expect("store state");
            state.execute(conn_id, frame)
        };
        let sender = {
            let state = state.lock().expect("store state");
            state.conns.get(&conn_id).map(|conn| conn.tx.clone())
        };
        let Some(sender) = sender else { break };
        let mut closed = false;
        for reply in replies {
            if sender.send(reply).is_err() {
                closed = true;
                break;
            }
        }
        if closed {
            break;
        }
    }

    state.lock().expect("store state").conns.remove(&conn_id);
    writer_task.abort();
    tracing::debug!(conn_id, "mock store connection closed");
}

impl State {
    fn execute(&mut self, conn_id: u64, frame: BytesFrame) -> Vec<BytesFrame> {
        let Some(parts) = command_parts(frame) else {
            return vec![error("ERR expected array of bulk strings")];
        };
        if parts.is_empty() {
            return Vec::new();
        }
        let command = String::from_utf8_lossy(&parts[0]).to_ascii_uppercase();
        match command.as_str() {
            "PING" => vec![BytesFrame::SimpleString(Bytes::from_static(b"PONG"))],
            "AUTH" | "SELECT" => vec![ok()],
            "ROLE" => vec![BytesFrame::Array(vec![
                BytesFrame::BulkString(Bytes::from_static(b"master")),
                BytesFrame::Integer(0),
                BytesFrame::Array(Vec::new()),
            ])],
            "SUBSCRIBE" => self.subscribe(conn_id, &parts[1..], true),
            "UNSUBSCRIBE" => self.subscribe(conn_id, &parts[1..], false),
            "PUBLISH" => {
                if parts.len() != 3 {
                    return vec![error("ERR wrong number of arguments for PUBLISH")];
                }
                let channel = String::from_utf8_lossy(&parts[1]).to_string();
                let receivers = self.publish_message(&channel, parts[2].clone());
                vec![BytesFrame::Integer(receivers)]
            }
            "SCRIPT" => self.script(&parts[1..]),
            "EVALSHA" => vec![self.evalsha(&parts[1..])],
            "LRANGE" => vec![self.lrange(&parts[1..])],
            "SETEX" => vec![self.setex(&parts[1..])],
            "PUBSUB" => vec![self.pubsub(&parts[1..])],
            other => vec![error(&format!("ERR unknown command '{other}'"))],
        }
    }

    fn subscribe(&mut self, conn_id: u64, channels: &[Bytes], subscribe: bool) -> Vec<BytesFrame> {
        let Some(conn) = self.conns.get_mut(&conn_id) else {
            return Vec::new();
        };
        let mut acks = Vec::with_capacity(channels.len());
        let verb: &[u8] = if subscribe {
            b"subscribe"
        } else {
            b"unsubscribe"
        };
        for channel in channels {
            let name = String::from_utf8_lossy(channel).to_string();
            if subscribe {
                conn.channels.insert(name.clone());
            } else {
                conn.channels.remove(&name);
            }
            acks.push(BytesFrame::Array(vec![
                BytesFrame::BulkString(Bytes::copy_from_slice(verb)),
                BytesFrame::BulkString(channel.clone()),
                BytesFrame::Integer(conn.channels.len() as i64),
            ]));
        }
        acks
    }

    fn publish_message(&mut self, channel: &str, payload: Bytes) -> i64 {
        let mut receivers = 0;
        for conn in self.conns.values() {
            if conn.channels.contains(channel) {
                let push = BytesFrame::Array(vec![
                    BytesFrame::BulkString(Bytes::from_static(b"message")),
                    BytesFrame::BulkString(Bytes::copy_from_slice(channel.as_bytes())),
                    BytesFrame::BulkString(payload.clone()),
                ]);
                if conn.tx.send(push).is_ok() {
                    receivers += 1;
                }
            }
        }
        receivers
    }

    fn script(&mut self, args: &[Bytes]) -> Vec<BytesFrame> {
        let Some(subcommand) = args.first() else {
            return vec![error("ERR wrong number of arguments for SCRIPT")];
        };
        match String::from_utf8_lossy(subcommand)
            .to_ascii_uppercase()
            .as_str()
        {
            "LOAD" => {
                let Some(source) = args.get(1) else {
                    return vec![error("ERR SCRIPT LOAD needs a source")];
                };
                let Some(kind) = classify_script(source) else {
                    return vec![error("ERR unrecognised script source")];
                };
                self.script_seq += 1;
                let sha = format!("{:040x}", self.script_seq);
                self.scripts.insert(sha.clone(), kind);
                vec![BytesFrame::BulkString(Bytes::from(sha))]
            }
            "FLUSH" => {
                self.scripts.clear();
                vec![ok()]
            }
            other => vec![error(&format!("ERR unknown SCRIPT subcommand '{other}'"))],
        }
    }

    fn evalsha(&mut self, args: &[Bytes]) -> BytesFrame {
        if args.len() < 2 {
            return error("ERR wrong number of arguments for EVALSHA");
        }
        let sha = String::from_utf8_lossy(&args[0]).to_string();
        let Some(kind) = self.scripts.get(&sha).copied() else {
            return error("NOSCRIPT No matching script. Please use EVAL.");
        };
        let Some(num_keys) = parse_int(&args[1]) else {
            return error("ERR invalid numkeys");
        };
        let num_keys = num_keys as usize;
        if args.len() < 2 + num_keys {
            return error("ERR not enough keys");
        }
        let keys: Vec<String> = args[2..2 + num_keys]
            .iter()
            .map(|key| String::from_utf8_lossy(key).to_string())
            .collect();
        let script_args = &args[2 + num_keys..];
        match kind {
            ScriptKind::PublishWithHistory => self.run_publish_with_history(&keys, script_args),
            ScriptKind::AddPresence => self.run_add_presence(&keys, script_args),
            ScriptKind::RemovePresence => self.run_remove_presence(&keys, script_args),
            ScriptKind::PresenceRead => self.run_presence_read(&keys, script_args),
            ScriptKind::PopMany => self.run_pop_many(&keys, script_args),
        }
    }

    fn run_publish_with_history(&mut self, keys: &[String], args: &[Bytes]) -> BytesFrame {
        if keys.len() != 2 || args.len() != 5 {
            return error("ERR publish script arity");
        }
        let (history_key, touch_key) = (&keys[0], &keys[1]);
        let channel = String::from_utf8_lossy(&args[0]).to_string();
        let payload = args[1].clone();
        let Some(trim_bound) = parse_int(&args[2]) else {
            return error("ERR invalid trim bound");
        };
        let Some(lifetime) = parse_int(&args[3]) else {
            return error("ERR invalid lifetime");
        };
        let drop_inactive = &args[4][..] == b"1";

        let receivers = self.publish_message(&channel, payload.clone());

        let touch_exists = self.live_string(touch_key).is_some();
        let appended = if drop_inactive && receivers == 0 && !touch_exists {
            // lpushx: only append when the list already exists.
            match self.live_list_mut(history_key) {
                Some(list) => {
                    list.push_front(payload);
                    list.len() as i64
                }
                None => 0,
            }
        } else {
            let entry = self
                .lists
                .entry(history_key.clone())
                .or_insert_with(|| Entry {
                    value: VecDeque::new(),
                    deadline: None,
                });
            entry.value.push_front(payload);
            entry.value.len() as i64
        };
        if appended > 0 {
            if let Some(entry) = self.lists.get_mut(history_key) {
                // ltrim 0..=trim_bound
                let keep = (trim_bound + 1).max(0) as usize;
                entry.value.truncate(keep);
                entry.deadline = Some(Instant::now() + Duration::from_secs(lifetime.max(0) as u64));
            }
        }
        BytesFrame::Integer(receivers)
    }

    fn run_add_presence(&mut self, keys: &[String], args: &[Bytes]) -> BytesFrame {
        if keys.len() != 2 || args.len() != 4 {
            return error("ERR add presence arity");
        }
        let (set_key, hash_key) = (&keys[0], &keys[1]);
        let Some(key_expire) = parse_int(&args[0]) else {
            return error("ERR invalid key expire");
        };
        let Some(expire_at) = parse_int(&args[1]) else {
            return error("ERR invalid expire at");
        };
        let uid = String::from_utf8_lossy(&args[2]).to_string();
        let info = args[3].clone();

        let deadline = Some(Instant::now() + Duration::from_secs(key_expire.max(0) as u64));
        let set = self.zsets.entry(set_key.clone()).or_insert_with(|| Entry {
            value: BTreeMap::new(),
            deadline: None,
        });
        set.value.insert(uid.clone(), expire_at);
        set.deadline = deadline;
        let hash = self.hashes.entry(hash_key.clone()).or_insert_with(|| Entry {
            value: HashMap::new(),
            deadline: None,
        });
        hash.value.insert(uid, info);
        hash.deadline = deadline;
        BytesFrame::Null
    }

    fn run_remove_presence(&mut self, keys: &[String], args: &[Bytes]) -> BytesFrame {
        if keys.len() != 2 || args.len() != 1 {
            return error("ERR remove presence arity");
        }
        let (set_key, hash_key) = (&keys[0], &keys[1]);
        let uid = String::from_utf8_lossy(&args[0]).to_string();
        if let Some(hash) = self.live_hash_mut(hash_key) {
            hash.remove(&uid);
        }
        if let Some(set) = self.live_zset_mut(set_key) {
            set.remove(&uid);
        }
        BytesFrame::Null
    }

    fn run_presence_read(&mut self, keys: &[String], args: &[Bytes]) -> BytesFrame {
        if keys.len() != 2 || args.len() != 1 {
            return error("ERR presence read arity");
        }
        let (set_key, hash_key) = (&keys[0], &keys[1]);
        let Some(now) = parse_int(&args[0]) else {
            return error("ERR invalid now");
        };
        let expired: Vec<String> = match self.live_zset_mut(set_key) {
            Some(set) => set
                .iter()
                .filter(|(_, score)| **score >= 0 && **score <= now)
                .map(|(member, _)| member.clone())
                .collect(),
            None => Vec::new(),
        };
        if !expired.is_empty() {
            if let Some(hash) = self.live_hash_mut(hash_key) {
                for member in &expired {
                    hash.remove(member);
                }
            }
            if let Some(set) = self.live_zset_mut(set_key) {
                for member in &expired {
                    set.remove(member);
                }
            }
        }
        let mut flat = Vec::new();
        if let Some(hash) = self.live_hash(hash_key) {
            for (field, value) in hash {
                flat.push(BytesFrame::BulkString(Bytes::copy_from_slice(
                    field.as_bytes(),
                )));
                flat.push(BytesFrame::BulkString(value.clone()));
            }
        }
        BytesFrame::Array(flat)
    }

    fn run_pop_many(&mut self, keys: &[String], args: &[Bytes]) -> BytesFrame {
        if keys.len() != 1 || args.len() != 1 {
            return error("ERR pop many arity");
        }
        let Some(bound) = parse_int(&args[0]) else {
            return error("ERR invalid bound");
        };
        let Some(list) = self.live_list_mut(&keys[0]) else {
            return BytesFrame::Array(Vec::new());
        };
        let take = ((bound + 1).max(0) as usize).min(list.len());
        let entries: Vec<BytesFrame> = list
            .drain(..take)
            .map(BytesFrame::BulkString)
            .collect();
        BytesFrame::Array(entries)
    }

    fn lrange(&mut self, args: &[Bytes]) -> BytesFrame {
        if args.len() != 3 {
            return error("ERR wrong number of arguments for LRANGE");
        }
        let key = String::from_utf8_lossy(&args[0]).to_string();
        let (Some(start), Some(stop)) = (parse_int(&args[1]), parse_int(&args[2])) else {
            return error("ERR invalid range");
        };
        let Some(list) = self.live_list(&key) else {
            return BytesFrame::Array(Vec::new());
        };
        let len = list.len() as i64;
        let start = normalize_index(start, len).max(0);
        let stop = normalize_index(stop, len).min(len - 1);
        if start > stop || len == 0 {
            return BytesFrame::Array(Vec::new());
        }
        let entries: Vec<BytesFrame> = list
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .map(|entry| BytesFrame::BulkString(entry.clone()))
            .collect();
        BytesFrame::Array(entries)
    }

    fn setex(&mut self, args: &[Bytes]) -> BytesFrame {
        if args.len() != 3 {
            return error("ERR wrong number of arguments for SETEX");
        }
        let key = String::from_utf8_lossy(&args[0]).to_string();
        let Some(seconds) = parse_int(&args[1]) else {
            return error("ERR invalid expire");
        };
        self.strings.insert(
            key,
            Entry {
                value: args[2].clone(),
                deadline: Some(Instant::now() + Duration::from_secs(seconds.max(0) as u64)),
            },
        );
        ok()
    }

    fn pubsub(&mut self, args: &[Bytes]) -> BytesFrame {
        let Some(subcommand) = args.first() else {
            return error("ERR wrong number of arguments for PUBSUB");
        };
        if !String::from_utf8_lossy(subcommand).eq_ignore_ascii_case("channels") {
            return error("ERR unsupported PUBSUB subcommand");
        }
        let pattern = args
            .get(1)
            .map(|pattern| String::from_utf8_lossy(pattern).to_string());
        let mut channels: HashSet<&String> = HashSet::new();
        for conn in self.conns.values() {
            for channel in &conn.channels {
                if pattern
                    .as_deref()
                    .is_none_or(|pattern| glob_match(pattern, channel))
                {
                    channels.insert(channel);
                }
            }
        }
        BytesFrame::Array(
            channels
                .into_iter()
                .map(|channel| BytesFrame::BulkString(Bytes::copy_from_slice(channel.as_bytes())))
                .collect(),
        )
    }

    fn live_string(&mut self, key: &str) -> Option<&Bytes> {
        if self.strings.get(key).is_some_and(Entry::expired) {
            self.strings.remove(key);
        }
        self.strings.get(key).map(|entry| &entry.value)
    }

    fn live_list(&mut self, key: &str) -> Option<&VecDeque<Bytes>> {
        if self.lists.get(key).is_some_and(Entry::expired) {
            self.lists.remove(key);
        }
        self.lists.get(key).map(|entry| &entry.value)
    }

    fn live_list_mut(&mut self, key: &str) -> Option<&mut VecDeque<Bytes>> {
        if self.lists.get(key).is_some_and(Entry::expired) {
            self.lists.remove(key);
        }
        self.lists.get_mut(key).map(|entry| &mut entry.value)
    }

    fn live_hash(&mut self, key: &str) -> Option<&HashMap<String, Bytes>> {
        if self.hashes.get(key).is_some_and(Entry::expired) {
            self.hashes.remove(key);
        }
        self.hashes.get(key).map(|entry| &entry.value)
    }

    fn live_hash_mut(&mut self, key: &str) -> Option<&mut HashMap<String, Bytes>> {
        if self.hashes.get(key).is_some_and(Entry::expired) {
            self.hashes.remove(key);
        }
        self.hashes.get_mut(key).map(|entry| &mut entry.value)
    }

    fn live_zset_mut(&mut self, key: &str) -> Option<&mut BTreeMap<String, i64>> {
        if self.zsets.get(key).is_some_and(Entry::expired) {
            self.zsets.remove(key);
        }
        self.zsets.get_mut(key).map(|entry| &mut entry.value)
    }
}

fn command_parts(frame: BytesFrame) -> Option<Vec<Bytes>> {
    let BytesFrame::Array(items) = frame else {
        return None;
    };
    items
        .into_iter()
        .map(|item| match item {
            BytesFrame::BulkString(part) | BytesFrame::SimpleString(part) => Some(part),
            _ => None,
        })
        .collect()
}

fn classify_script(source: &Bytes) -> Option<ScriptKind> {
    let text = String::from_utf8_lossy(source);
    if text.contains("lpushx") {
        Some(ScriptKind::PublishWithHistory)
    } else if text.contains("zadd") {
        Some(ScriptKind::AddPresence)
    } else if text.contains("zrangebyscore") {
        Some(ScriptKind::PresenceRead)
    } else if text.contains("zrem") {
        Some(ScriptKind::RemovePresence)
    } else if text.contains("lrange") {
        Some(ScriptKind::PopMany)
    } else {
        None
    }
}

fn parse_int(raw: &Bytes) -> Option<i64> {
    std::str::from_utf8(raw).ok()?.parse().ok()
}

fn normalize_index(index: i64, len: i64) -> i64 {
    if index < 0 { len + index } else { index }
}

/// Minimal glob: `*` matches any run of characters. This covers the
/// `prefix*` patterns the engine issues.
fn glob_match(pattern: &str, name: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == name,
        Some((prefix, rest)) => {
            if !name.starts_with(prefix) {
                return false;
            }
            let mut remainder = &name[prefix.len()..];
            let mut segments = rest.split('*').peekable();
            while let Some(segment) = segments.next() {
                if segments.peek().is_none() {
                    return segment.is_empty() || remainder.ends_with(segment);
                }
                match remainder.find(segment) {
                    Some(position) => remainder = &remainder[position + segment.len()..],
                    None => return false,
                }
            }
            true
        }
    }
}

fn ok() -> BytesFrame {
    BytesFrame::SimpleString(Bytes::from_static(b"OK"))
}

fn error(message: &str) -> BytesFrame {
    BytesFrame::Error(message.to_string().into())
}

/// Answers `SENTINEL get-master-addr-by-name` with a fixed leader, enough
/// to exercise the engine's leader-discovery dialing.
pub struct MockSentinel {
    addr: SocketAddr,
    shutdown: CancellationToken,
}

impl MockSentinel {
    pub async fn spawn(master: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("bind mock sentinel")?;
        let addr = listener.local_addr().context("mock sentinel addr")?;
        let shutdown = CancellationToken::new();

        let accept_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = accept_shutdown.cancelled() => return,
                    accepted = listener.accept() => accepted,
                };
                let Ok((socket, _)) = accepted else { return };
                tokio::spawn(handle_sentinel_conn(socket, master, accept_shutdown.clone()));
            }
        });

        Ok(Self { addr, shutdown })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for MockSentinel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn handle_sentinel_conn(
    socket: TcpStream,
    master: SocketAddr,
    shutdown: CancellationToken,
) {
    let (read_half, write_half) = socket.into_split();
    let mut reader = FramedRead::new(read_half, Resp2::default());
    let mut writer = FramedWrite::new(write_half, Resp2::default());
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => return,
            frame = reader.next() => frame,
        };
        let Some(Ok(frame)) = frame else { return };
        let Some(parts) = command_parts(frame) else {
            return;
        };
        let command = parts
            .first()
            .map(|part| String::from_utf8_lossy(part).to_ascii_uppercase())
            .unwrap_or_default();
        let reply = match command.as_str() {
            "PING" => BytesFrame::SimpleString(Bytes::from_static(b"PONG")),
            "SENTINEL" => BytesFrame::Array(vec![
                BytesFrame::BulkString(Bytes::from(master.ip().to_string())),
                BytesFrame::BulkString(Bytes::from(master.port().to_string())),
            ]),
            _ => error("ERR unknown sentinel command"),
        };
        if writer.send(reply).await.is_err() {
            return;
        }
    }
}
