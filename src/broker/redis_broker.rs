//! Broker backed by Redis
//!
//! Key layout, per queue `q`:
//!
//! - `td:task:{id}` hash with `msg` (JSON [`TaskMessage`]) and `state`
//! - `td:{q}:pending` list of ids, LPUSH in / RPOP out
//! - `td:{q}:active` sorted set of leased ids, scored by lease time
//! - `td:{q}:scheduled`, `td:{q}:retry` sorted sets scored by eligibility time
//! - `td:{q}:archived` sorted set scored by archive time
//! - `td:{q}:completed` counter
//!
//! Every score is a Unix timestamp in milliseconds.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{Client, Script};
use tracing::{debug, info};

use super::{Broker, QueueStats};
use crate::error::{TaskError, TaskResult};
use crate::task::{TaskId, TaskMessage, TaskState};

const TASK_KEY_PREFIX: &str = "td:task:";
const KEY_PREFIX: &str = "td";

/// Stores a new message and pushes its id onto the pending list.
///
/// KEYS[1] task key, KEYS[2] pending list
/// ARGV[1] message JSON, ARGV[2] task id
/// Returns 0 when the task key already exists.
const ENQUEUE_SCRIPT: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 1 then
  return 0
end
redis.call("HSET", KEYS[1], "msg", ARGV[1], "state", "pending")
redis.call("LPUSH", KEYS[2], ARGV[2])
return 1
"#;

/// Stores a new message and adds its id to the scheduled set.
///
/// KEYS[1] task key, KEYS[2] scheduled set
/// ARGV[1] message JSON, ARGV[2] task id, ARGV[3] eligibility score
/// Returns 0 when the task key already exists.
const SCHEDULE_SCRIPT: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 1 then
  return 0
end
redis.call("HSET", KEYS[1], "msg", ARGV[1], "state", "scheduled")
redis.call("ZADD", KEYS[2], ARGV[3], ARGV[2])
return 1
"#;

/// Pops the oldest pending id and leases it in one step.
///
/// KEYS[1] pending list, KEYS[2] active set
/// ARGV[1] lease score, ARGV[2] task key prefix
const DEQUEUE_SCRIPT: &str = r#"
local id = redis.call("RPOP", KEYS[1])
if not id then
  return nil
end
redis.call("ZADD", KEYS[2], ARGV[1], id)
redis.call("HSET", ARGV[2] .. id, "state", "active")
return redis.call("HGET", ARGV[2] .. id, "msg")
"#;

/// Moves every id in a sorted set whose score is due onto the pending list.
///
/// KEYS[1] source set, KEYS[2] pending list
/// ARGV[1] now, ARGV[2] task key prefix
const FORWARD_SCRIPT: &str = r#"
local ids = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1], "LIMIT", 0, 100)
for _, id in ipairs(ids) do
  redis.call("LPUSH", KEYS[2], id)
  redis.call("ZREM", KEYS[1], id)
  redis.call("HSET", ARGV[2] .. id, "state", "pending")
end
return #ids
"#;

/// Configuration for the Redis broker
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Redis connection URL
    pub redis_url: String,
    /// Completed task retention in seconds
    pub result_ttl: u64,
    /// Archived task retention in seconds
    pub archive_ttl: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            result_ttl: 86400,   // 24 hours
            archive_ttl: 604800, // 7 days
        }
    }
}

impl BrokerConfig {
    /// Build a config from `host:port` or a full `redis://` URL
    pub fn from_addr(addr: &str) -> Self {
        let redis_url = if addr.starts_with("redis://") || addr.starts_with("rediss://") {
            addr.to_string()
        } else {
            format!("redis://{}", addr)
        };
        Self {
            redis_url,
            ..Self::default()
        }
    }
}

fn queue_key(queue: &str, set: &str) -> String {
    format!("{}:{}:{}", KEY_PREFIX, queue, set)
}

fn task_key(id: TaskId) -> String {
    format!("{}{}", TASK_KEY_PREFIX, id)
}

/// Sorted set score for a point in time
fn score(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Exclusive upper bound for archived entries older than the retention window
fn archive_cutoff(now: DateTime<Utc>, archive_ttl: u64) -> String {
    let ttl_ms = i64::try_from(archive_ttl.saturating_mul(1000)).unwrap_or(i64::MAX);
    format!("({}", score(now).saturating_sub(ttl_ms))
}

/// Broker backed by a single multiplexed Redis connection shared by every caller
pub struct RedisBroker {
    conn: MultiplexedConnection,
    config: BrokerConfig,
    enqueue_script: Script,
    schedule_script: Script,
    dequeue_script: Script,
    forward_script: Script,
}

impl std::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBroker")
            .field("redis_url", &self.config.redis_url)
            .finish()
    }
}

impl RedisBroker {
    /// Connect to Redis and verify the connection
    pub async fn new(config: BrokerConfig) -> TaskResult<Self> {
        let client = Client::open(config.redis_url.as_str()).map_err(|e| {
            TaskError::config(format!("invalid redis url {}: {}", config.redis_url, e))
        })?;

        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| TaskError::from_redis("connect", e))?;

        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| TaskError::from_redis("ping", e))?;

        info!("Connected to Redis at {}", config.redis_url);

        Ok(Self {
            conn,
            config,
            enqueue_script: Script::new(ENQUEUE_SCRIPT),
            schedule_script: Script::new(SCHEDULE_SCRIPT),
            dequeue_script: Script::new(DEQUEUE_SCRIPT),
            forward_script: Script::new(FORWARD_SCRIPT),
        })
    }

    fn connection(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    async fn write_terminal(
        &self,
        msg: &TaskMessage,
        state: TaskState,
        operation: &str,
    ) -> TaskResult<()> {
        let mut conn = self.connection();
        let json = serde_json::to_string(msg)?;
        let id = msg.id.to_string();
        let key = task_key(msg.id);
        let now = Utc::now();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .zrem(queue_key(&msg.queue, "active"), &id)
            .ignore()
            .hset(&key, "msg", &json)
            .ignore()
            .hset(&key, "state", state.as_str())
            .ignore();

        match state {
            TaskState::Completed => {
                pipe.incr(queue_key(&msg.queue, "completed"), 1)
                    .ignore()
                    .cmd("EXPIRE")
                    .arg(&key)
                    .arg(self.config.result_ttl)
                    .ignore();
            }
            _ => {
                let archived = queue_key(&msg.queue, "archived");
                // Ids outlive their hash otherwise; drop the ones past retention
                pipe.zadd(&archived, &id, score(now))
                    .ignore()
                    .cmd("ZREMRANGEBYSCORE")
                    .arg(&archived)
                    .arg("-inf")
                    .arg(archive_cutoff(now, self.config.archive_ttl))
                    .ignore()
                    .cmd("EXPIRE")
                    .arg(&key)
                    .arg(self.config.archive_ttl)
                    .ignore();
            }
        }

        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| TaskError::from_redis(operation, e))?;

        debug!("Task {} is now {}", msg.id, state.as_str());
        Ok(())
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn ping(&self) -> TaskResult<()> {
        let mut conn = self.connection();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| TaskError::from_redis("ping", e))?;
        Ok(())
    }

    async fn enqueue(&self, msg: &TaskMessage) -> TaskResult<()> {
        let mut conn = self.connection();
        let json = serde_json::to_string(msg)?;

        let created: i64 = self
            .enqueue_script
            .key(task_key(msg.id))
            .key(queue_key(&msg.queue, "pending"))
            .arg(&json)
            .arg(msg.id.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| TaskError::from_redis("enqueue", e))?;
        if created == 0 {
            return Err(TaskError::enqueue(format!("task {} already exists", msg.id)));
        }

        debug!("Enqueued task {} on queue {}", msg.id, msg.queue);
        Ok(())
    }

    async fn schedule(&self, msg: &TaskMessage) -> TaskResult<()> {
        let mut conn = self.connection();
        let process_at = msg
            .process_at
            .ok_or_else(|| TaskError::enqueue("scheduled task without process_at"))?;
        let json = serde_json::to_string(msg)?;

        let created: i64 = self
            .schedule_script
            .key(task_key(msg.id))
            .key(queue_key(&msg.queue, "scheduled"))
            .arg(&json)
            .arg(msg.id.to_string())
            .arg(score(process_at))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| TaskError::from_redis("schedule", e))?;
        if created == 0 {
            return Err(TaskError::enqueue(format!("task {} already exists", msg.id)));
        }

        debug!("Scheduled task {} for {}", msg.id, process_at);
        Ok(())
    }

    async fn dequeue(&self, queues: &[String]) -> TaskResult<Option<TaskMessage>> {
        let mut conn = self.connection();
        let now = score(Utc::now());

        for queue in queues {
            let json: Option<String> = self
                .dequeue_script
                .key(queue_key(queue, "pending"))
                .key(queue_key(queue, "active"))
                .arg(now)
                .arg(TASK_KEY_PREFIX)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| TaskError::from_redis("dequeue", e))?;

            if let Some(json) = json {
                let mut msg: TaskMessage = serde_json::from_str(&json)?;
                msg.state = TaskState::Active;
                debug!("Dequeued task {} from queue {}", msg.id, queue);
                return Ok(Some(msg));
            }
        }
        Ok(None)
    }

    async fn done(&self, msg: &TaskMessage) -> TaskResult<()> {
        self.write_terminal(msg, TaskState::Completed, "done").await
    }

    async fn retry(&self, msg: &TaskMessage) -> TaskResult<()> {
        let mut conn = self.connection();
        let retry_at = msg
            .process_at
            .ok_or_else(|| TaskError::queue_operation("retry", "missing retry time"))?;
        let json = serde_json::to_string(msg)?;
        let id = msg.id.to_string();
        let key = task_key(msg.id);

        redis::pipe()
            .atomic()
            .zrem(queue_key(&msg.queue, "active"), &id)
            .ignore()
            .hset(&key, "msg", &json)
            .ignore()
            .hset(&key, "state", TaskState::Retry.as_str())
            .ignore()
            .zadd(queue_key(&msg.queue, "retry"), &id, score(retry_at))
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| TaskError::from_redis("retry", e))?;

        debug!("Task {} parked for retry until {}", msg.id, retry_at);
        Ok(())
    }

    async fn archive(&self, msg: &TaskMessage) -> TaskResult<()> {
        self.write_terminal(msg, TaskState::Archived, "archive").await
    }

    async fn requeue(&self, msg: &TaskMessage) -> TaskResult<()> {
        let mut conn = self.connection();
        let json = serde_json::to_string(msg)?;
        let id = msg.id.to_string();
        let key = task_key(msg.id);

        redis::pipe()
            .atomic()
            .zrem(queue_key(&msg.queue, "active"), &id)
            .ignore()
            .hset(&key, "msg", &json)
            .ignore()
            .hset(&key, "state", TaskState::Pending.as_str())
            .ignore()
            .rpush(queue_key(&msg.queue, "pending"), &id)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| TaskError::from_redis("requeue", e))?;

        debug!("Requeued task {}", msg.id);
        Ok(())
    }

    async fn forward_ready(&self, queues: &[String]) -> TaskResult<u64> {
        let mut conn = self.connection();
        let now = score(Utc::now());
        let mut moved = 0;

        for queue in queues {
            for set in ["scheduled", "retry"] {
                let count: u64 = self
                    .forward_script
                    .key(queue_key(queue, set))
                    .key(queue_key(queue, "pending"))
                    .arg(now)
                    .arg(TASK_KEY_PREFIX)
                    .invoke_async(&mut conn)
                    .await
                    .map_err(|e| TaskError::from_redis("forward", e))?;
                moved += count;
            }
        }

        if moved > 0 {
            info!("Forwarded {} scheduled tasks", moved);
        }
        Ok(moved)
    }

    async fn get_task(&self, id: TaskId) -> TaskResult<Option<TaskMessage>> {
        let mut conn = self.connection();

        let (json, state): (Option<String>, Option<String>) = redis::cmd("HMGET")
            .arg(task_key(id))
            .arg("msg")
            .arg("state")
            .query_async(&mut conn)
            .await
            .map_err(|e| TaskError::from_redis("get_task", e))?;

        match json {
            Some(json) => {
                let mut msg: TaskMessage = serde_json::from_str(&json)?;
                if let Some(state) = state.as_deref().and_then(TaskState::parse) {
                    msg.state = state;
                }
                Ok(Some(msg))
            }
            None => Ok(None),
        }
    }

    async fn queue_stats(&self, queue: &str) -> TaskResult<QueueStats> {
        let mut conn = self.connection();

        let (pending, active, scheduled, retry, archived, completed): (
            u64,
            u64,
            u64,
            u64,
            u64,
            Option<u64>,
        ) = redis::pipe()
            .llen(queue_key(queue, "pending"))
            .zcard(queue_key(queue, "active"))
            .zcard(queue_key(queue, "scheduled"))
            .zcard(queue_key(queue, "retry"))
            .zcard(queue_key(queue, "archived"))
            .get(queue_key(queue, "completed"))
            .query_async(&mut conn)
            .await
            .map_err(|e| TaskError::from_redis("queue_stats", e))?;

        Ok(QueueStats {
            pending,
            active,
            scheduled,
            retry,
            archived,
            completed: completed.unwrap_or(0),
        })
    }

    /// Nothing to flush: the multiplexed connection is released when the
    /// last clone of the broker is dropped.
    async fn close(&self) -> TaskResult<()> {
        info!("Closing Redis broker at {}", self.config.redis_url);
        Ok(())
    }
}
