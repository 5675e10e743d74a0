use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use mongodb::{
    bson::{self, doc, Document},
    error::{ErrorKind, WriteFailure},
    Collection, Database,
};
use uuid::Uuid;

use crate::errors::{AppError, Result};

pub const LEASES_COLLECTION: &str = "leases";

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Proof of holding a lease; only the holder's token can release it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseToken {
    pub key: String,
    pub token: String,
}

impl LeaseToken {
    fn fresh(key: &str) -> Self {
        LeaseToken {
            key: key.to_string(),
            token: Uuid::new_v4().to_string(),
        }
    }
}

/// Named, expiring mutual exclusion shared by every instance of the service.
#[async_trait]
pub trait LeaseLock: Send + Sync {
    /// Takes the lease if nobody holds a live one. Never waits.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LeaseToken>>;

    async fn release(&self, lease: &LeaseToken) -> Result<()>;

    /// Whether `lease` is still the live holder. False once it has expired,
    /// even if nobody else has taken it yet.
    async fn is_held(&self, lease: &LeaseToken) -> Result<bool>;
}

/// Retries `try_acquire` until `wait` runs out.
pub async fn acquire(lock: &dyn LeaseLock, key: &str, ttl: Duration, wait: Duration) -> Result<LeaseToken> {
    let deadline = Instant::now() + wait;
    let mut backoff = Duration::from_millis(10);

    loop {
        if let Some(lease) = lock.try_acquire(key, ttl).await? {
            return Ok(lease);
        }
        if Instant::now() >= deadline {
            tracing::warn!(key, "lease still held after waiting {:?}", wait);
            return Err(AppError::ServiceUnavailable(format!("lock {} is busy", key)));
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(Duration::from_millis(200));
    }
}

/// Lease documents keyed by name; a live document blocks the upsert through
/// the unique `_id`.
#[derive(Clone)]
pub struct MongoLeaseLock {
    collection: Collection<Document>,
}

impl MongoLeaseLock {
    pub fn new(db: &Database) -> Self {
        MongoLeaseLock {
            collection: db.collection(LEASES_COLLECTION),
        }
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(e)) => e.code == 11000,
        ErrorKind::Command(e) => e.code == 11000,
        _ => false,
    }
}

#[async_trait]
impl LeaseLock for MongoLeaseLock {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LeaseToken>> {
        let lease = LeaseToken::fresh(key);
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).map_err(|e| AppError::service(e.to_string()))?;

        let result = self
            .collection
            .update_one(
                doc! { "_id": key, "expires_at": { "$lt": bson::DateTime::from_chrono(now) } },
                doc! { "$set": {
                    "token": &lease.token,
                    "expires_at": bson::DateTime::from_chrono(now + ttl),
                }},
            )
            .upsert(true)
            .await;

        match result {
            Ok(_) => Ok(Some(lease)),
            Err(e) if is_duplicate_key(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn release(&self, lease: &LeaseToken) -> Result<()> {
        self.collection
            .delete_one(doc! { "_id": &lease.key, "token": &lease.token })
            .await?;
        Ok(())
    }

    async fn is_held(&self, lease: &LeaseToken) -> Result<bool> {
        let live = self
            .collection
            .find_one(doc! {
                "_id": &lease.key,
                "token": &lease.token,
                "expires_at": { "$gt": bson::DateTime::from_chrono(Utc::now()) },
            })
            .await?;
        Ok(live.is_some())
    }
}

/// `SET NX PX` lease with a compare-and-delete release.
#[derive(Clone)]
pub struct RedisLeaseLock {
    client: redis::Client,
}

impl RedisLeaseLock {
    pub fn new(redis_url: &str) -> Result<Self> {
        Ok(RedisLeaseLock {
            client: redis::Client::open(redis_url)?,
        })
    }
}

#[async_trait]
impl LeaseLock for RedisLeaseLock {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LeaseToken>> {
        let lease = LeaseToken::fresh(key);
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&lease.token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;

        Ok(reply.map(|_| lease))
    }

    async fn release(&self, lease: &LeaseToken) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(&lease.key)
            .arg(&lease.token)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn is_held(&self, lease: &LeaseToken) -> Result<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let current: Option<String> = redis::cmd("GET").arg(&lease.key).query_async(&mut conn).await?;
        Ok(current.as_deref() == Some(lease.token.as_str()))
    }
}

/// Single-process leases for tests and single-node runs.
#[derive(Default)]
pub struct LocalLeaseLock {
    held: Mutex<HashMap<String, (String, Instant)>>,
}

impl LocalLeaseLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseLock for LocalLeaseLock {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LeaseToken>> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| AppError::service("lease table poisoned"))?;
        let now = Instant::now();

        match held.get(key) {
            Some((_, expires)) if *expires > now => Ok(None),
            _ => {
                let lease = LeaseToken::fresh(key);
                held.insert(key.to_string(), (lease.token.clone(), now + ttl));
                Ok(Some(lease))
            }
        }
    }

    async fn release(&self, lease: &LeaseToken) -> Result<()> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| AppError::service("lease table poisoned"))?;
        if held.get(&lease.key).map(|(token, _)| token == &lease.token).unwrap_or(false) {
            held.remove(&lease.key);
        }
        Ok(())
    }

    async fn is_held(&self, lease: &LeaseToken) -> Result<bool> {
        let held = self
            .held
            .lock()
            .map_err(|_| AppError::service("lease table poisoned"))?;
        Ok(matches!(
            held.get(&lease.key),
            Some((token, expires)) if token == &lease.token && *expires > Instant::now()
        ))
    }
}
