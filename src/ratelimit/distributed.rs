//! Distributed rate limiter coordinated through Redis.
//!
//! Each algorithm runs as a single Lua script, so the read-check-write
//! sequence for a key is indivisible across every process sharing the
//! coordinator. Scripts are addressed by their SHA1 and loaded lazily.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError, Value};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use super::backend::Limiter;
use super::decision::LimitDecision;
use super::policy::RateLimitPolicy;
use super::scripts::{ScriptReply, Scripts};
use crate::clock::{datetime_from_ms, Clock, SystemClock};
use crate::config::CoordinatorConfig;
use crate::error::{LimiterError, Result};

/// TTL and type information for one coordinator key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyStats {
    pub key: String,
    pub full_key: String,
    /// Redis type name, `none` when the key does not exist
    pub kind: String,
    /// Remaining TTL in milliseconds; -1 without TTL, -2 when missing
    pub ttl_ms: i64,
}

struct CachedConnection {
    conn: MultiplexedConnection,
    scripts_loaded: bool,
}

/// A rate limiter whose state lives in Redis.
pub struct DistributedLimiter {
    client: Client,
    connection: Mutex<Option<CachedConnection>>,
    scripts: Scripts,
    key_prefix: String,
    connect_timeout: Duration,
    io_timeout: Duration,
    cleanup_batch_size: usize,
    cleanup_max_batches: usize,
    clock: Arc<dyn Clock>,
}

fn timed_out(what: &str, after: Duration) -> RedisError {
    RedisError::from(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("{} timed out after {:?}", what, after),
    ))
}

impl DistributedLimiter {
    /// Create a limiter. No connection is made until the first command.
    pub fn new(config: &CoordinatorConfig, key_prefix: &str) -> Result<Self> {
        Self::with_clock(config, key_prefix, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: &CoordinatorConfig,
        key_prefix: &str,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let client = Client::open(config.url.as_str()).map_err(|e| {
            LimiterError::Config(format!("invalid coordinator url: {}", e))
        })?;

        Ok(Self {
            client,
            connection: Mutex::new(None),
            scripts: Scripts::new(),
            key_prefix: key_prefix.to_string(),
            connect_timeout: config.connect_timeout,
            io_timeout: config.io_timeout,
            cleanup_batch_size: config.cleanup_batch_size.max(1),
            cleanup_max_batches: config.cleanup_max_batches.max(1),
            clock,
        })
    }

    /// Create a limiter and verify the coordinator answers.
    pub async fn connect(config: &CoordinatorConfig, key_prefix: &str) -> Result<Self> {
        let limiter = Self::new(config, key_prefix)?;
        limiter.is_healthy().await?;
        info!("Connected to rate limit coordinator");
        Ok(limiter)
    }

    fn build_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    /// Get the cached connection, dialing if there is none.
    async fn connection(&self) -> Result<(MultiplexedConnection, bool)> {
        let mut slot = self.connection.lock().await;
        if let Some(cached) = slot.as_ref() {
            return Ok((cached.conn.clone(), cached.scripts_loaded));
        }

        debug!("Dialing rate limit coordinator");
        let conn = tokio::time::timeout(
            self.connect_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| {
            LimiterError::coordinator("connect", timed_out("connect", self.connect_timeout))
        })?
        .map_err(|e| LimiterError::coordinator("connect", e))?;

        *slot = Some(CachedConnection {
            conn: conn.clone(),
            scripts_loaded: false,
        });
        Ok((conn, false))
    }

    async fn invalidate(&self) {
        let mut slot = self.connection.lock().await;
        if slot.take().is_some() {
            warn!("Dropped coordinator connection after failure");
        }
    }

    async fn mark_scripts(&self, loaded: bool) {
        if let Some(cached) = self.connection.lock().await.as_mut() {
            cached.scripts_loaded = loaded;
        }
    }

    /// Run one coordinator operation under the io timeout.
    async fn run<T, F, Fut>(&self, context: &str, op: F) -> Result<T>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        let (conn, _) = self.connection().await?;
        match tokio::time::timeout(self.io_timeout, op(conn)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                if e.kind() == redis::ErrorKind::NoScriptError {
                    self.mark_scripts(false).await;
                } else if e.is_io_error() || e.is_connection_dropped() {
                    self.invalidate().await;
                }
                Err(LimiterError::coordinator(context, e))
            }
            Err(_) => {
                self.invalidate().await;
                Err(LimiterError::coordinator(
                    context,
                    timed_out(context, self.io_timeout),
                ))
            }
        }
    }

    /// Load every script on the current connection unless already done.
    async fn ensure_scripts_loaded(&self) -> Result<()> {
        let (_, loaded) = self.connection().await?;
        if loaded {
            return Ok(());
        }

        self.run("load scripts", |mut conn| async move {
            let mut pipe = redis::pipe();
            for source in Scripts::sources() {
                pipe.cmd("SCRIPT").arg("LOAD").arg(source);
            }
            let _: Vec<String> = pipe.query_async(&mut conn).await?;
            Ok(())
        })
        .await?;

        self.mark_scripts(true).await;
        debug!("Loaded rate limit scripts");
        Ok(())
    }

    fn decision_from_reply(
        &self,
        value: &Value,
        key: &str,
        policy: &RateLimitPolicy,
        now_ms: i64,
    ) -> Result<LimitDecision> {
        let reply = ScriptReply::decode(value)?;
        let mut decision = LimitDecision::new(
            reply.allowed,
            reply.count,
            policy,
            key,
            datetime_from_ms(now_ms),
            datetime_from_ms(reply.reset_ms),
        );
        decision.remaining = reply.remaining;
        Ok(decision)
    }

    /// Delete keys that have no TTL, one bounded SCAN page at a time.
    ///
    /// Returns the number of keys deleted.
    pub async fn cleanup(&self) -> Result<u64> {
        let pattern = format!("{}*", self.key_prefix);
        let batch = self.cleanup_batch_size;
        let mut cursor: u64 = 0;
        let mut deleted: u64 = 0;

        for _ in 0..self.cleanup_max_batches {
            let pattern = pattern.clone();
            let (next, keys): (u64, Vec<String>) = self
                .run("cleanup scan", |mut conn| async move {
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(batch)
                        .query_async(&mut conn)
                        .await
                })
                .await?;

            if !keys.is_empty() {
                let script = &self.scripts.cleanup;
                let removed: i64 = self
                    .run("cleanup script", |mut conn| async move {
                        let mut invocation = script.prepare_invoke();
                        for key in &keys {
                            invocation.key(key);
                        }
                        invocation.invoke_async(&mut conn).await
                    })
                    .await?;
                deleted += removed.max(0) as u64;
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        if deleted > 0 {
            info!(deleted, "Cleaned up rate limit keys without TTL");
        }
        Ok(deleted)
    }

    /// Type and TTL of the coordinator key behind `key`.
    pub async fn stats(&self, key: &str) -> Result<KeyStats> {
        let full_key = self.build_key(key);
        let lookup = full_key.clone();
        let (kind, ttl_ms): (String, i64) = self
            .run("stats", |mut conn| async move {
                redis::pipe()
                    .cmd("TYPE")
                    .arg(&lookup)
                    .cmd("PTTL")
                    .arg(&lookup)
                    .query_async(&mut conn)
                    .await
            })
            .await?;

        Ok(KeyStats {
            key: key.to_string(),
            full_key,
            kind,
            ttl_ms,
        })
    }

    /// Raw `INFO` output from the coordinator.
    pub async fn info(&self) -> Result<String> {
        self.run("info", |mut conn| async move {
            redis::cmd("INFO").query_async(&mut conn).await
        })
        .await
    }
}

#[async_trait]
impl Limiter for DistributedLimiter {
    fn name(&self) -> &'static str {
        "distributed"
    }

    async fn check(&self, key: &str, policy: &RateLimitPolicy) -> Result<LimitDecision> {
        policy.check().map_err(|e| LimiterError::Validation(e.to_string()))?;
        if key.is_empty() {
            return Err(LimiterError::Validation("rate limit key cannot be empty".to_string()));
        }

        let full_key = self.build_key(key);
        let now_ms = self.clock.now_ms();
        let member = format!("{}:{}", now_ms, rand::random::<u64>());
        let script = self.scripts.for_algorithm(policy.algorithm);

        trace!(
            key = %full_key,
            algorithm = %policy.algorithm,
            limit = policy.limit,
            "Checking distributed rate limit"
        );

        let (limit, window_ms, burst) = (policy.limit, policy.window_ms(), policy.burst);
        let value: Value = self
            .run(policy.algorithm.as_str(), |mut conn| async move {
                script
                    .key(&full_key)
                    .arg(limit)
                    .arg(window_ms)
                    .arg(now_ms)
                    .arg(burst)
                    .arg(member)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;

        let decision = self.decision_from_reply(&value, key, policy, now_ms)?;
        if !decision.allowed {
            debug!(
                key = %key,
                count = decision.count,
                limit = decision.limit,
                "Distributed rate limit exceeded"
            );
        }
        Ok(decision)
    }

    async fn check_multiple(
        &self,
        checks: &[(String, RateLimitPolicy)],
    ) -> Result<Vec<LimitDecision>> {
        if checks.is_empty() {
            return Ok(Vec::new());
        }
        for (key, policy) in checks {
            if key.is_empty() {
                return Err(LimiterError::Validation("rate limit key cannot be empty".to_string()));
            }
            policy.check().map_err(|e| {
                LimiterError::Validation(format!("invalid policy for key {}: {}", key, e))
            })?;
        }

        self.ensure_scripts_loaded().await?;

        let now_ms = self.clock.now_ms();
        let mut pipe = redis::pipe();
        for (key, policy) in checks {
            let script = self.scripts.for_algorithm(policy.algorithm);
            pipe.cmd("EVALSHA")
                .arg(script.get_hash())
                .arg(1)
                .arg(self.build_key(key))
                .arg(policy.limit)
                .arg(policy.window_ms())
                .arg(now_ms)
                .arg(policy.burst)
                .arg(format!("{}:{}", now_ms, rand::random::<u64>()));
        }

        let replies: Vec<Value> = self
            .run("pipelined check", |mut conn| async move {
                pipe.query_async(&mut conn).await
            })
            .await?;

        if replies.len() != checks.len() {
            return Err(LimiterError::Script(format!(
                "pipeline returned {} replies for {} checks",
                replies.len(),
                checks.len()
            )));
        }

        let now = datetime_from_ms(now_ms);
        Ok(checks
            .iter()
            .zip(replies.iter())
            .map(|((key, policy), value)| {
                self.decision_from_reply(value, key, policy, now_ms)
                    .unwrap_or_else(|e| {
                        warn!(key = %key, error = %e, "Discarding malformed script reply");
                        LimitDecision::failed(policy, key, now, e.to_string())
                    })
            })
            .collect())
    }

    async fn reset(&self, key: &str) -> Result<()> {
        let full_key = self.build_key(key);
        let _: i64 = self
            .run("reset", |mut conn| async move {
                redis::cmd("DEL").arg(&full_key).query_async(&mut conn).await
            })
            .await?;
        Ok(())
    }

    async fn reset_multiple(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let full_keys: Vec<String> = keys.iter().map(|k| self.build_key(k)).collect();
        let _: i64 = self
            .run("reset multiple", |mut conn| async move {
                redis::cmd("DEL").arg(&full_keys).query_async(&mut conn).await
            })
            .await?;
        Ok(())
    }

    async fn is_healthy(&self) -> Result<()> {
        let _: String = self
            .run("ping", |mut conn| async move {
                redis::cmd("PING").query_async(&mut conn).await
            })
            .await?;
        Ok(())
    }
}
