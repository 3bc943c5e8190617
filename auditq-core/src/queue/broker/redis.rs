use std::{
    fmt,
    sync::{Arc, LazyLock},
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::{
    AsyncCommands, Script,
    aio::{ConnectionManager, MultiplexedConnection},
};
use tracing::info;

use super::Broker;
use crate::{
    error::{PipelineError, Result},
    ids::JobId,
};

/// KEYS: pending, processing. ARGV: lease key prefix, worker id, ttl ms.
static CLAIM: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        local id = redis.call('RPOPLPUSH', KEYS[1], KEYS[2])
        if not id then
            return false
        end
        redis.call('SET', ARGV[1] .. id, ARGV[2], 'PX', ARGV[3])
        return id
        "#,
    )
});

/// KEYS: lease key. ARGV: worker id, ttl ms.
static EXTEND: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            return redis.call('PEXPIRE', KEYS[1], ARGV[2])
        end
        return 0
        "#,
    )
});

/// KEYS: processing, lease key. ARGV: job id.
static RELEASE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        redis.call('LREM', KEYS[1], 1, ARGV[1])
        redis.call('DEL', KEYS[2])
        return 1
        "#,
    )
});

/// KEYS: processing, lease key, pending. ARGV: job id.
static REQUEUE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        redis.call('LREM', KEYS[1], 1, ARGV[1])
        redis.call('DEL', KEYS[2])
        redis.call('LPUSH', KEYS[3], ARGV[1])
        return 1
        "#,
    )
});

/// KEYS: processing, pending. ARGV: lease key prefix.
static REAP: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        local ids = redis.call('LRANGE', KEYS[1], 0, -1)
        local reaped = {}
        for _, id in ipairs(ids) do
            if redis.call('EXISTS', ARGV[1] .. id) == 0 then
                redis.call('LREM', KEYS[1], 1, id)
                redis.call('RPUSH', KEYS[2], id)
                table.insert(reaped, id)
            end
        end
        return reaped
        "#,
    )
});

/// KEYS: pending, processing. ARGV: job id.
static ENSURE_PENDING: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        if redis.call('LPOS', KEYS[1], ARGV[1]) then
            return 0
        end
        if redis.call('LPOS', KEYS[2], ARGV[1]) then
            return 0
        end
        redis.call('LPUSH', KEYS[1], ARGV[1])
        return 1
        "#,
    )
});

fn parse_id(raw: &str) -> Result<JobId> {
    raw.parse().map_err(|e| {
        PipelineError::Internal(format!("broker held malformed job id '{raw}': {e}"))
    })
}

fn ttl_ms(lease: Duration) -> u64 {
    u64::try_from(lease.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Reliable queue on Redis lists: `{prefix}:pending`, `{prefix}:processing`
/// and one `{prefix}:lease:{job_id}` key per claimed id.
#[derive(Clone)]
pub struct RedisBroker {
    client: redis::Client,
    conn: ConnectionManager,
    /// Dedicated connections for `BLMOVE`, checked out one per waiter.
    idle_waiters: Arc<Mutex<Vec<MultiplexedConnection>>>,
    pending_key: String,
    processing_key: String,
    lease_prefix: String,
}

impl fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBroker")
            .field("connection", &"ConnectionManager")
            .field("pending_key", &self.pending_key)
            .field("processing_key", &self.processing_key)
            .field("idle_waiters", &self.idle_waiters.lock().len())
            .finish()
    }
}

impl RedisBroker {
    pub async fn connect(redis_url: &str, key_prefix: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        info!(target: "auditq::queue", key_prefix, "connected to Redis broker");
        Ok(Self {
            client,
            conn,
            idle_waiters: Arc::new(Mutex::new(Vec::new())),
            pending_key: format!("{key_prefix}:pending"),
            processing_key: format!("{key_prefix}:processing"),
            lease_prefix: format!("{key_prefix}:lease:"),
        })
    }

    fn lease_key(&self, job_id: JobId) -> String {
        format!("{}{}", self.lease_prefix, job_id)
    }

    pub async fn pending_len(&self) -> Result<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(&self.pending_key).await?)
    }

    pub async fn processing_ids(&self) -> Result<Vec<JobId>> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn.lrange(&self.processing_key, 0, -1).await?;
        raw.iter().map(|id| parse_id(id)).collect()
    }

    /// Blocking-wait connections parked between waits.
    pub fn idle_wait_connections(&self) -> usize {
        self.idle_waiters.lock().len()
    }

    async fn checkout_waiter(&self) -> Result<MultiplexedConnection> {
        let parked = self.idle_waiters.lock().pop();
        match parked {
            Some(conn) => Ok(conn),
            None => Ok(self.client.get_multiplexed_async_connection().await?),
        }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn push_pending(&self, job_id: JobId) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.lpush(&self.pending_key, job_id.to_string()).await?;
        Ok(())
    }

    async fn claim(
        &self,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<JobId>> {
        let mut conn = self.conn.clone();
        let claimed: Option<String> = CLAIM
            .key(&self.pending_key)
            .key(&self.processing_key)
            .arg(&self.lease_prefix)
            .arg(worker_id)
            .arg(ttl_ms(lease))
            .invoke_async(&mut conn)
            .await?;
        claimed.as_deref().map(parse_id).transpose()
    }

    async fn extend_lease(
        &self,
        job_id: JobId,
        worker_id: &str,
        lease: Duration,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let extended: i64 = EXTEND
            .key(self.lease_key(job_id))
            .arg(worker_id)
            .arg(ttl_ms(lease))
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    async fn release(&self, job_id: JobId) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = RELEASE
            .key(&self.processing_key)
            .key(self.lease_key(job_id))
            .arg(job_id.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn requeue(&self, job_id: JobId) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = REQUEUE
            .key(&self.processing_key)
            .key(self.lease_key(job_id))
            .key(&self.pending_key)
            .arg(job_id.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn reap_expired(&self) -> Result<Vec<JobId>> {
        let mut conn = self.conn.clone();
        let reaped: Vec<String> = REAP
            .key(&self.processing_key)
            .key(&self.pending_key)
            .arg(&self.lease_prefix)
            .invoke_async(&mut conn)
            .await?;
        reaped.iter().map(|id| parse_id(id)).collect()
    }

    async fn ensure_pending(&self, job_id: JobId) -> Result<bool> {
        let mut conn = self.conn.clone();
        let pushed: i64 = ENSURE_PENDING
            .key(&self.pending_key)
            .key(&self.processing_key)
            .arg(job_id.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(pushed == 1)
    }

    /// Rotates the claim end of `pending` onto itself with `BLMOVE`, which
    /// blocks server-side until an id shows up and leaves the order intact.
    async fn wait_for_pending(&self, timeout: Duration) -> Result<bool> {
        // A blocked connection serves nobody else, so concurrent waiters
        // never share one. Connections are parked again after a clean reply.
        let mut conn = self.checkout_waiter().await?;
        let found: std::result::Result<Option<String>, redis::RedisError> =
            redis::cmd("BLMOVE")
                .arg(&self.pending_key)
                .arg(&self.pending_key)
                .arg("RIGHT")
                .arg("RIGHT")
                .arg(timeout.as_secs_f64())
                .query_async(&mut conn)
                .await;
        match found {
            Ok(found) => {
                self.idle_waiters.lock().push(conn);
                Ok(found.is_some())
            }
            // A client-side response timeout only means nothing arrived yet,
            // but the reply may still be in flight, so the connection goes.
            Err(err) if err.is_timeout() => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}
