// Server-side scripts invoked through EVALSHA. Each script runs atomically
// in the store, which is what turns publish-plus-history-append and the
// presence sweep into single round trips.
use std::sync::Mutex;

use bytes::Bytes;
use redis_protocol::resp2::types::BytesFrame;

use crate::conn::{Conn, arg_int, cmd, cmd_owned};
use crate::error::{EngineError, Result};

/// Publishes the payload and appends it to the history list in one call.
/// When the drop-inactive flag is set, a publish that reached zero
/// subscribers only appends if the touch key exists (via the
/// list-must-exist push). The list is then trimmed and its TTL refreshed.
///
/// KEYS[1] history list, KEYS[2] history touch key.
/// ARGV[1] channel, ARGV[2] payload, ARGV[3] trim bound (inclusive),
/// ARGV[4] lifetime seconds, ARGV[5] drop-inactive flag "0"/"1".
pub(crate) const PUBLISH_WITH_HISTORY: &str = r#"
local n = redis.call("publish", ARGV[1], ARGV[2])
local m = 0
if ARGV[5] == "1" and n == 0 and redis.call("exists", KEYS[2]) == 0 then
  m = redis.call("lpushx", KEYS[1], ARGV[2])
else
  m = redis.call("lpush", KEYS[1], ARGV[2])
end
if m > 0 then
  redis.call("ltrim", KEYS[1], 0, ARGV[3])
  redis.call("expire", KEYS[1], ARGV[4])
end
return n
"#;

/// KEYS[1] presence set, KEYS[2] presence hash.
/// ARGV[1] key expire seconds, ARGV[2] member expire-at, ARGV[3] uid,
/// ARGV[4] serialised client info.
pub(crate) const ADD_PRESENCE: &str = r#"
redis.call("zadd", KEYS[1], ARGV[2], ARGV[3])
redis.call("hset", KEYS[2], ARGV[3], ARGV[4])
redis.call("expire", KEYS[1], ARGV[1])
redis.call("expire", KEYS[2], ARGV[1])
"#;

/// KEYS[1] presence set, KEYS[2] presence hash. ARGV[1] uid.
pub(crate) const REMOVE_PRESENCE: &str = r#"
redis.call("hdel", KEYS[2], ARGV[1])
redis.call("zrem", KEYS[1], ARGV[1])
"#;

/// Lazy sweep on read: members whose expiry score is not past ARGV[1] stay,
/// the rest are evicted from both keys before the hash is returned.
///
/// KEYS[1] presence set, KEYS[2] presence hash. ARGV[1] now.
pub(crate) const PRESENCE: &str = r#"
local expired = redis.call("zrangebyscore", KEYS[1], "0", ARGV[1])
if #expired > 0 then
  for num = 1, #expired do
    redis.call("hdel", KEYS[2], expired[num])
  end
  redis.call("zremrangebyscore", KEYS[1], "0", ARGV[1])
end
return redis.call("hgetall", KEYS[2])
"#;

/// Atomically pops up to ARGV[1] entries from an API queue list.
/// KEYS[1] queue key.
pub(crate) const LPOP_MANY: &str = r#"
local entries = redis.call("lrange", KEYS[1], "0", ARGV[1])
if #entries > 0 then
  redis.call("ltrim", KEYS[1], #entries, -1)
end
return entries
"#;

/// A script plus the SHA the store assigned it on load. Pipelines load
/// their scripts on every (re)entry; if the store later reports the SHA
/// missing (scripts were flushed), the owning loop exits so the restart
/// loads it again.
pub(crate) struct Script {
    source: &'static str,
    num_keys: usize,
    sha: Mutex<Option<Bytes>>,
}

impl Script {
    pub const fn new(num_keys: usize, source: &'static str) -> Self {
        Self {
            source,
            num_keys,
            sha: Mutex::new(None),
        }
    }

    pub async fn load(&self, conn: &mut Conn) -> Result<()> {
        let reply = conn
            .call(cmd(&[b"SCRIPT", b"LOAD", self.source.as_bytes()]))
            .await?;
        let sha = match reply {
            BytesFrame::BulkString(sha) | BytesFrame::SimpleString(sha) => sha,
            other => {
                return Err(EngineError::Protocol(format!(
                    "unexpected SCRIPT LOAD reply: {other:?}"
                )));
            }
        };
        *self.sha.lock().expect("script sha lock") = Some(sha);
        Ok(())
    }

    /// Builds the `EVALSHA` command for a load-complete script.
    pub fn eval_command(&self, keys: &[Bytes], args: Vec<Bytes>) -> Result<BytesFrame> {
        debug_assert_eq!(keys.len(), self.num_keys);
        let sha = self
            .sha
            .lock()
            .expect("script sha lock")
            .clone()
            .ok_or(EngineError::ScriptNotLoaded)?;
        let mut parts = Vec::with_capacity(3 + keys.len() + args.len());
        parts.push(Bytes::from_static(b"EVALSHA"));
        parts.push(sha);
        parts.push(arg_int(self.num_keys as i64));
        parts.extend(keys.iter().cloned());
        parts.extend(args);
        Ok(cmd_owned(parts))
    }
}
