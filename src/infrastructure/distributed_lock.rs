//! 地址分配锁
//!
//! 同一 owner 的分配串行执行：进程内使用按 owner 的异步互斥锁，
//! 多实例部署时再叠加基于 Redis 的分布式锁 (SET NX EX + 校验持有者后删除)。

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use redis::{aio::ConnectionManager, AsyncCommands, Client};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::error::{Result, WalletError};

/// 分布式锁
#[derive(Clone)]
pub struct DistributedLock {
    redis_client: ConnectionManager,
}

/// 锁守卫（drop 时异步释放）
pub struct LockGuard {
    lock: DistributedLock,
    lock_key: String,
    lock_value: String,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let lock = self.lock.clone();
        let key = std::mem::take(&mut self.lock_key);
        let value = std::mem::take(&mut self.lock_value);

        tokio::spawn(async move {
            if let Err(e) = lock.release_internal(&key, &value).await {
                tracing::warn!(
                    error = %e,
                    lock_key = %key,
                    "Failed to release lock in Drop"
                );
            }
        });
    }
}

impl DistributedLock {
    /// 创建分布式锁实例
    ///
    /// - `redis_url`: Redis连接字符串，格式：redis://host:port
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { redis_client: conn })
    }

    /// 获取分布式锁（重试直到成功或超时）
    ///
    /// 超时返回 `AllocationConflict`，调用方可以重试。
    pub async fn acquire(&self, lock_key: &str, ttl_secs: u64, timeout: Duration) -> Result<LockGuard> {
        let lock_value = Uuid::new_v4().to_string();
        let start = std::time::Instant::now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            if self
                .try_acquire_internal(lock_key, &lock_value, ttl_secs)
                .await?
            {
                tracing::debug!(
                    lock_key = %lock_key,
                    attempt = attempt,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Acquired distributed lock"
                );

                return Ok(LockGuard {
                    lock: self.clone(),
                    lock_key: lock_key.to_string(),
                    lock_value,
                });
            }

            if start.elapsed() >= timeout {
                return Err(WalletError::AllocationConflict(format!(
                    "lock '{}' not acquired within {:?} after {} attempts",
                    lock_key, timeout, attempt
                )));
            }

            // 指数退避（最大500ms）
            let backoff_ms = std::cmp::min(50 * 2u64.pow(attempt.min(4)), 500);
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
        }
    }

    async fn try_acquire_internal(
        &self,
        lock_key: &str,
        lock_value: &str,
        ttl_secs: u64,
    ) -> Result<bool> {
        let mut conn = self.redis_client.clone();

        // SET key value NX EX ttl
        let result: Option<String> = redis::cmd("SET")
            .arg(lock_key)
            .arg(lock_value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;

        Ok(result.is_some())
    }

    /// 只有持有者才能释放（Lua 脚本保证原子性）
    async fn release_internal(&self, lock_key: &str, lock_value: &str) -> Result<()> {
        let mut conn = self.redis_client.clone();

        let script = r#"
            if redis.call("GET", KEYS[1]) == ARGV[1] then
                return redis.call("DEL", KEYS[1])
            else
                return 0
            end
        "#;

        let result: i32 = redis::Script::new(script)
            .key(lock_key)
            .arg(lock_value)
            .invoke_async(&mut conn)
            .await?;

        if result == 1 {
            tracing::debug!(lock_key = %lock_key, "Released distributed lock");
        } else {
            tracing::warn!(
                lock_key = %lock_key,
                "Lock not owned by current instance (may have expired)"
            );
        }

        Ok(())
    }

    pub async fn is_locked(&self, lock_key: &str) -> Result<bool> {
        let mut conn = self.redis_client.clone();
        let exists: bool = conn.exists(lock_key).await?;
        Ok(exists)
    }
}

/// 进程内按 owner 的异步互斥锁
#[derive(Default)]
pub struct OwnerLocks {
    locks: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

impl OwnerLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, owner_id: Uuid) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            // 只保留仍被引用的锁
            locks.retain(|_, m| Arc::strong_count(m) > 1);
            locks.entry(owner_id).or_default().clone()
        };
        mutex.lock_owned().await
    }
}

/// 分配锁：进程内锁 + 可选 Redis 锁
pub struct AllocationLock {
    local: OwnerLocks,
    remote: Option<DistributedLock>,
    ttl_secs: u64,
    wait: Duration,
}

/// 同时持有两把锁，drop 时一并释放
pub struct AllocationGuard {
    _remote: Option<LockGuard>,
    _local: OwnedMutexGuard<()>,
}

impl AllocationLock {
    pub fn local_only() -> Self {
        Self {
            local: OwnerLocks::new(),
            remote: None,
            ttl_secs: 0,
            wait: Duration::ZERO,
        }
    }

    pub fn with_remote(remote: DistributedLock, ttl_secs: u64, wait: Duration) -> Self {
        Self {
            local: OwnerLocks::new(),
            remote: Some(remote),
            ttl_secs,
            wait,
        }
    }

    pub fn lock_key(owner_id: Uuid) -> String {
        format!("wallet:alloc:{}", owner_id)
    }

    pub async fn acquire(&self, owner_id: Uuid) -> Result<AllocationGuard> {
        let local = self.local.lock(owner_id).await;
        let remote = match &self.remote {
            Some(lock) => Some(
                lock.acquire(&Self::lock_key(owner_id), self.ttl_secs, self.wait)
                    .await?,
            ),
            None => None,
        };
        Ok(AllocationGuard {
            _remote: remote,
            _local: local,
        })
    }
}
