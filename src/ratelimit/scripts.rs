//! Lua scripts executed atomically by the coordinator, and their reply schema.
//!
//! Every limiting script takes `KEYS[1]` plus the same argument layout:
//! `ARGV = {limit, window_ms, now_ms, burst, member}` and returns
//! `{allowed, count, remaining, reset_ms}` as integers.

use redis::{Script, Value};

use crate::error::{LimiterError, Result};

use super::policy::Algorithm;

pub const SLIDING_WINDOW: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local burst = tonumber(ARGV[4])
local member = ARGV[5]

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)

local allowed = 0
local reset = now + window
if count < limit + burst then
    allowed = 1
    redis.call('ZADD', key, now, member)
    redis.call('PEXPIRE', key, window)
    count = count + 1
else
    local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
    if oldest[2] then
        reset = tonumber(oldest[2]) + window
    end
end

return {allowed, count, math.max(0, limit - count), reset}
"#;

pub const TOKEN_BUCKET: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local burst = tonumber(ARGV[4])
local per_token = refill / capacity

local state = redis.call('HMGET', key, 'tokens', 'last_refill')
local tokens = tonumber(state[1])
local last = tonumber(state[2])
if tokens == nil or last == nil then
    tokens = capacity
    last = now
end

if now > last then
    local added = math.floor((now - last) / per_token)
    if added > 0 then
        tokens = tokens + added
        last = last + added * per_token
    end
end
if tokens >= capacity then
    tokens = capacity
    last = now
end

local allowed = 0
if tokens >= 1 or tokens + burst >= 1 then
    allowed = 1
    tokens = tokens - 1
end

redis.call('HSET', key, 'tokens', tokens, 'last_refill', last)
redis.call('PEXPIRE', key, refill * 2)

local reset = now
if tokens < capacity then
    reset = math.ceil(last + per_token)
end

return {allowed, capacity - tokens, math.max(0, tokens), reset}
"#;

pub const FIXED_WINDOW: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local start = math.floor(now / window) * window

local state = redis.call('HMGET', key, 'start', 'count')
local count = tonumber(state[2]) or 0
if tonumber(state[1]) ~= start then
    count = 0
end

local allowed = 0
if count < limit then
    allowed = 1
    count = count + 1
    redis.call('HSET', key, 'start', start, 'count', count)
    redis.call('PEXPIRE', key, math.max(1, start + window - now))
end

return {allowed, count, math.max(0, limit - count), start + window}
"#;

pub const LEAKY_BUCKET: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local burst = tonumber(ARGV[4])
local rate = limit / window
local capacity = limit + burst

local state = redis.call('HMGET', key, 'level', 'last_leak')
local level = tonumber(state[1]) or 0
local last = tonumber(state[2]) or now
if now > last then
    level = math.max(0, level - (now - last) * rate)
end

local allowed = 0
local reset
if level + 1 <= capacity then
    allowed = 1
    level = level + 1
    reset = now + math.ceil(level / rate)
else
    reset = now + math.ceil((level + 1 - capacity) / rate)
end

redis.call('HSET', key, 'level', level, 'last_leak', now)
redis.call('PEXPIRE', key, math.ceil(capacity / rate))

local count = math.ceil(level)
return {allowed, count, math.max(0, limit - count), reset}
"#;

/// Deletes the given keys that carry no TTL; returns how many were deleted.
pub const CLEANUP: &str = r#"
local deleted = 0
for i = 1, #KEYS do
    if redis.call('TTL', KEYS[i]) == -1 then
        redis.call('DEL', KEYS[i])
        deleted = deleted + 1
    end
end
return deleted
"#;

/// The compiled (hashed) scripts for one limiter.
pub struct Scripts {
    pub sliding_window: Script,
    pub token_bucket: Script,
    pub fixed_window: Script,
    pub leaky_bucket: Script,
    pub cleanup: Script,
}

impl Scripts {
    pub fn new() -> Self {
        Self {
            sliding_window: Script::new(SLIDING_WINDOW),
            token_bucket: Script::new(TOKEN_BUCKET),
            fixed_window: Script::new(FIXED_WINDOW),
            leaky_bucket: Script::new(LEAKY_BUCKET),
            cleanup: Script::new(CLEANUP),
        }
    }

    pub fn for_algorithm(&self, algorithm: Algorithm) -> &Script {
        match algorithm {
            Algorithm::SlidingWindow => &self.sliding_window,
            Algorithm::TokenBucket => &self.token_bucket,
            Algorithm::FixedWindow => &self.fixed_window,
            Algorithm::LeakyBucket => &self.leaky_bucket,
        }
    }

    /// Sources in load order, for `SCRIPT LOAD`.
    pub fn sources() -> [&'static str; 5] {
        [SLIDING_WINDOW, TOKEN_BUCKET, FIXED_WINDOW, LEAKY_BUCKET, CLEANUP]
    }
}

impl Default for Scripts {
    fn default() -> Self {
        Self::new()
    }
}

/// A decoded limiting-script reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptReply {
    pub allowed: bool,
    pub count: u64,
    pub remaining: u64,
    pub reset_ms: i64,
}

impl ScriptReply {
    /// Decode `{allowed, count, remaining, reset_ms}`; anything else is a script error.
    pub fn decode(value: &Value) -> Result<Self> {
        let items = match value {
            Value::Array(items) => items,
            other => {
                return Err(LimiterError::Script(format!(
                    "expected a 4-element array, got {:?}",
                    other
                )))
            }
        };
        if items.len() != 4 {
            return Err(LimiterError::Script(format!(
                "expected 4 elements, got {}",
                items.len()
            )));
        }

        let int = |index: usize, name: &str| -> Result<i64> {
            match &items[index] {
                Value::Int(n) => Ok(*n),
                other => Err(LimiterError::Script(format!(
                    "field '{}' is not an integer: {:?}",
                    name, other
                ))),
            }
        };
        let non_negative = |index: usize, name: &str| -> Result<u64> {
            let n = int(index, name)?;
            u64::try_from(n).map_err(|_| {
                LimiterError::Script(format!("field '{}' is negative: {}", name, n))
            })
        };

        let allowed = match int(0, "allowed")? {
            0 => false,
            1 => true,
            n => {
                return Err(LimiterError::Script(format!(
                    "field 'allowed' must be 0 or 1, got {}",
                    n
                )))
            }
        };

        Ok(Self {
            allowed,
            count: non_negative(1, "count")?,
            remaining: non_negative(2, "remaining")?,
            reset_ms: int(3, "reset_ms")?,
        })
    }
}
