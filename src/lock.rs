use crate::backoff::{Backoff, FixedBackoff};
use crate::config::LockDefaults;
use crate::error::{LockError, Result};
use crate::models::{self, LockKeys, LockOptions, LockSnapshot, Strategy};
use crate::owner;
use crate::storage::{Expect, LockStore};
use chrono::Utc;
use futures::FutureExt;
use log::{debug, info, warn};
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::time::Instant;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

// 持有时长上限：十年
const MAX_LIFE: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

// 双键模式下给两个键附加的兜底 TTL 为 life 的倍数
const HOUSEKEEPING_FACTOR: u32 = 2;

/// 基于 [`LockStore`] 协调的单资源互斥锁
///
/// 持有者标识在构造时确定，所有修改操作都以它作为比较值。
/// `Lock` 除配置外不保存状态，克隆出的实例可以互换使用。
#[derive(Clone)]
pub struct Lock {
    store: Arc<dyn LockStore>,
    resource: String,
    keys: LockKeys,
    owner: String,
    life: Duration,
    strategy: Strategy,
    backoff: Arc<dyn Backoff>,
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock")
            .field("resource", &self.resource)
            .field("owner", &self.owner)
            .field("life", &self.life)
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

impl Lock {
    pub fn new(
        store: Arc<dyn LockStore>,
        resource: impl Into<String>,
        options: LockOptions,
    ) -> Result<Self> {
        Self::with_defaults(store, resource, options, &LockDefaults::default())
    }

    /// 同 [`Lock::new`]，未设置的配置项取自 `defaults`
    pub fn with_defaults(
        store: Arc<dyn LockStore>,
        resource: impl Into<String>,
        options: LockOptions,
        defaults: &LockDefaults,
    ) -> Result<Self> {
        let resource = resource.into();
        if resource.is_empty() {
            return Err(LockError::config("resource key must not be empty"));
        }

        let owner = match options.owner {
            Some(owner) if owner.is_empty() => {
                return Err(LockError::config("owner must not be empty"));
            }
            Some(owner) => owner,
            None => owner::process_owner(),
        };

        let life = match options.life {
            Some(secs) => Duration::try_from_secs_f64(secs).map_err(|_| {
                LockError::config(format!("life must be a number of seconds, got {}", secs))
            })?,
            None => defaults.life,
        };
        check_life(life, "life")?;

        let sleep = options
            .sleep
            .map(Duration::from_millis)
            .unwrap_or(defaults.sleep);
        if sleep.is_zero() {
            return Err(LockError::config("sleep must be at least 1ms"));
        }

        let strategy = options.strategy.unwrap_or_default();
        Ok(Self {
            store,
            keys: LockKeys::new(&resource, strategy),
            resource,
            owner,
            life,
            strategy,
            backoff: Arc::new(FixedBackoff(sleep)),
        })
    }

    /// 替换 [`Lock::acquire`] 的轮询策略
    pub fn with_backoff(mut self, backoff: impl Backoff + 'static) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn life(&self) -> Duration {
        self.life
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn keys(&self) -> &LockKeys {
        &self.keys
    }

    /// 轮询直到获取锁或 `timeout` 到期
    ///
    /// 不会睡过截止时间：下一次等待会超过截止时间时，
    /// 直接返回 [`LockError::NotAcquired`]。
    /// `Duration::MAX` 之类无法表示的截止时间视为一直等待。
    pub async fn acquire(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now().checked_add(timeout);
        let mut attempt = 0u32;

        loop {
            if self.try_acquire().await {
                return Ok(());
            }

            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => Duration::MAX,
            };
            let delay = self
                .backoff
                .delay(attempt, remaining)
                .max(MIN_POLL_INTERVAL);
            if delay > remaining {
                debug!(
                    "[TIMEOUT] Gave up acquiring lock - resource: {}, owner: {}, attempts: {}",
                    self.resource,
                    self.owner,
                    attempt + 1
                );
                return Err(LockError::not_acquired(&self.resource));
            }

            tokio::time::sleep(delay).await;
            attempt = attempt.saturating_add(1);
        }
    }

    /// 尝试获取一次，不等待
    pub async fn try_acquire(&self) -> bool {
        let claimed = match &self.keys.expire {
            None => self.claim_single().await,
            Some(expire) => self.claim_two_key(expire).await,
        };

        if claimed {
            info!(
                "[ACQUIRE SUCCESS] Lock acquired - resource: {}, owner: {}, life: {:?}",
                self.resource, self.owner, self.life
            );
        }
        claimed
    }

    /// 获取锁、执行 `body`、释放锁
    ///
    /// `body` panic 时先释放锁再继续向上传播 panic。
    /// future 中途被丢弃时也会释放：多线程运行时中在丢弃时同步完成，
    /// 单线程运行时中交给运行时在后台执行。
    /// 获取失败时 `body` 不会执行。
    pub async fn with_lock<F, Fut, T>(&self, timeout: Duration, body: F) -> Result<T>
    where
        F: FnOnce(Lock) -> Fut,
        Fut: Future<Output = T>,
    {
        self.acquire(timeout).await?;

        let guard = ReleaseGuard::arm(self.clone());
        let lock = self.clone();
        let outcome = AssertUnwindSafe(async move { body(lock).await })
            .catch_unwind()
            .await;

        self.release().await;
        guard.disarm();

        match outcome {
            Ok(output) => Ok(output),
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    /// 仅当锁仍属于当前持有者时删除
    ///
    /// 尽力而为：失败只记录日志，残留的键由存储 TTL 回收
    pub async fn release(&self) {
        let keys = self.keys.all();
        let conditions = [Expect::present(&self.keys.owner, &self.owner)];

        match self.store.compare_and_delete(&conditions, &keys).await {
            Ok(true) => info!(
                "[RELEASE] Lock released - resource: {}, owner: {}",
                self.resource, self.owner
            ),
            Ok(false) => debug!(
                "[RELEASE] Lock not owned, nothing released - resource: {}, owner: {}",
                self.resource, self.owner
            ),
            Err(e) => warn!(
                "[RELEASE] Failed to release lock - resource: {}, owner: {}: {}",
                self.resource, self.owner, e
            ),
        }
    }

    /// 仍持有锁时，将过期时间重置为从现在起 `new_life`
    pub async fn extend(&self, new_life: Duration) -> Result<()> {
        check_life(new_life, "new life")?;

        let extended = match &self.keys.expire {
            None => {
                self.store
                    .compare_and_set_ttl(&self.keys.owner, &self.owner, new_life)
                    .await
            }
            // 记录的过期时间必须仍在未来，已过期的锁不能被续期复活
            Some(expire) => {
                let now = now_millis();
                let expiry = now.saturating_add(as_millis(new_life)).to_string();
                self.store
                    .compare_and_set(
                        Expect::present(&self.keys.owner, &self.owner),
                        expire,
                        &expiry,
                        Some(now),
                        Some(new_life * HOUSEKEEPING_FACTOR),
                    )
                    .await
            }
        };

        match extended {
            Ok(true) => {
                info!(
                    "[EXTEND] Lock extended - resource: {}, owner: {}, life: {:?}",
                    self.resource, self.owner, new_life
                );
                Ok(())
            }
            Ok(false) => {
                debug!(
                    "[EXTEND] Lock no longer owned - resource: {}, owner: {}",
                    self.resource, self.owner
                );
                Err(LockError::not_acquired(&self.resource))
            }
            Err(e) => {
                warn!(
                    "[EXTEND] Failed to extend lock - resource: {}, owner: {}: {}",
                    self.resource, self.owner, e
                );
                Err(LockError::not_acquired(&self.resource))
            }
        }
    }

    /// 当前持有者是否持有未过期的锁
    pub async fn locked(&self) -> bool {
        let now = now_millis();
        match self.snapshot(now).await {
            Ok(snapshot) => snapshot.is_held_by(&self.owner, now),
            Err(e) => {
                warn!(
                    "Failed to read lock state - resource: {}: {}",
                    self.resource, e
                );
                false
            }
        }
    }

    pub fn is_locked(&self, owner: Option<&str>, expiry: Option<i64>, now: i64) -> bool {
        models::is_locked(&self.owner, owner, expiry, now)
    }

    pub fn is_deletable(&self, owner: Option<&str>, expiry: Option<i64>, now: i64) -> bool {
        models::is_deletable(owner, expiry, now)
    }

    async fn claim_single(&self) -> bool {
        match self
            .store
            .set_if_absent(&self.keys.owner, &self.owner, self.life)
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                warn!(
                    "[ACQUIRE] Claim failed - resource: {}, owner: {}: {}",
                    self.resource, self.owner, e
                );
                false
            }
        }
    }

    // 先尝试占用；失败时检查一次是否为过期锁，清理成功则再占用一次
    async fn claim_two_key(&self, expire: &str) -> bool {
        if self.claim_both(expire).await {
            return true;
        }
        if !self.reclaim_if_stale(expire).await {
            return false;
        }
        self.claim_both(expire).await
    }

    async fn claim_both(&self, expire: &str) -> bool {
        let expiry = now_millis().saturating_add(as_millis(self.life)).to_string();
        let entries = [
            (self.keys.owner.as_str(), self.owner.as_str()),
            (expire, expiry.as_str()),
        ];

        match self.store.multi_set_if_absent(&entries).await {
            Ok(true) => {
                let ttl = self.life * HOUSEKEEPING_FACTOR;
                for key in self.keys.all() {
                    if let Err(e) = self.store.expire(key, ttl).await {
                        debug!("[ACQUIRE] Failed to set housekeeping TTL on {}: {}", key, e);
                    }
                }
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(
                    "[ACQUIRE] Claim failed - resource: {}, owner: {}: {}",
                    self.resource, self.owner, e
                );
                false
            }
        }
    }

    // 只有读到的两个值在删除时仍未改变才会删除
    async fn reclaim_if_stale(&self, expire: &str) -> bool {
        let keys = self.keys.all();
        let mut values = match self.store.multi_get(&keys).await {
            Ok(values) => values.into_iter(),
            Err(e) => {
                warn!(
                    "[STALE] Failed to read lock state - resource: {}: {}",
                    self.resource, e
                );
                return false;
            }
        };
        let owner = values.next().flatten();
        let expiry = values.next().flatten();

        let snapshot = LockSnapshot::from_raw(owner.clone(), expiry.as_deref());
        if !snapshot.is_deletable(now_millis()) {
            return false;
        }

        let conditions = [
            Expect::new(&self.keys.owner, owner.as_deref()),
            Expect::new(expire, expiry.as_deref()),
        ];
        match self.store.compare_and_delete(&conditions, &keys).await {
            Ok(true) => {
                info!(
                    "[STALE] Deleted stale lock - resource: {}, previous_owner: {:?}, expiry: {:?}",
                    self.resource, snapshot.owner, snapshot.expiry
                );
                true
            }
            Ok(false) => {
                debug!(
                    "[STALE] Lock changed while reclaiming - resource: {}",
                    self.resource
                );
                false
            }
            Err(e) => {
                warn!(
                    "[STALE] Failed to delete stale lock - resource: {}: {}",
                    self.resource, e
                );
                false
            }
        }
    }

    async fn snapshot(&self, now: i64) -> anyhow::Result<LockSnapshot> {
        match &self.keys.expire {
            None => {
                let state = self.store.get_with_ttl(&self.keys.owner).await?;
                Ok(match state {
                    Some((owner, ttl)) => LockSnapshot {
                        owner: Some(owner),
                        expiry: ttl.map(|ttl| now.saturating_add(as_millis(ttl))),
                    },
                    None => LockSnapshot::default(),
                })
            }
            Some(expire) => {
                let keys = [self.keys.owner.as_str(), expire.as_str()];
                let mut values = self.store.multi_get(&keys).await?.into_iter();
                let owner = values.next().flatten();
                let expiry = values.next().flatten();
                Ok(LockSnapshot::from_raw(owner, expiry.as_deref()))
            }
        }
    }
}

/// 构造锁并在 `timeout` 内获取，成功时返回已持有的锁
pub async fn lock(
    store: Arc<dyn LockStore>,
    resource: impl Into<String>,
    options: LockOptions,
    timeout: Duration,
) -> Result<Lock> {
    let lock = Lock::new(store, resource, options)?;
    lock.acquire(timeout).await?;
    Ok(lock)
}

/// 以 `options` 中的持有者身份释放 `resource`（校验持有者）
pub async fn unlock(
    store: Arc<dyn LockStore>,
    resource: impl Into<String>,
    options: LockOptions,
) -> Result<()> {
    Lock::new(store, resource, options)?.release().await;
    Ok(())
}

// 保护区的 future 被丢弃时释放锁
struct ReleaseGuard {
    lock: Option<Lock>,
}

impl ReleaseGuard {
    fn arm(lock: Lock) -> Self {
        Self { lock: Some(lock) }
    }

    fn disarm(mut self) {
        self.lock = None;
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        let Some(lock) = self.lock.take() else {
            return;
        };

        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                warn!(
                    "[RELEASE] Protected section cancelled, releasing - resource: {}",
                    lock.resource
                );
                tokio::task::block_in_place(|| handle.block_on(lock.release()));
            }
            Ok(handle) => {
                warn!(
                    "[RELEASE] Protected section cancelled, releasing in background - resource: {}",
                    lock.resource
                );
                handle.spawn(async move { lock.release().await });
            }
            Err(_) => warn!(
                "[RELEASE] Protected section cancelled outside a runtime, lock will expire via TTL - resource: {}",
                lock.resource
            ),
        }
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn as_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn check_life(life: Duration, name: &str) -> Result<()> {
    if life < MIN_POLL_INTERVAL {
        return Err(LockError::config(format!("{} must be at least 1ms", name)));
    }
    if life > MAX_LIFE {
        return Err(LockError::config(format!(
            "{} must not exceed {}s",
            name,
            MAX_LIFE.as_secs()
        )));
    }
    Ok(())
}
