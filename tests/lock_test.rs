use anyhow::Result as StoreResult;
use async_trait::async_trait;
use redis_lock::{Expect, Lock, LockError, LockOptions, LockStore, MemoryStore, Strategy};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn lock_on(store: &Arc<MemoryStore>, resource: &str, options: LockOptions) -> Lock {
    Lock::new(store.clone(), resource, options).unwrap()
}

fn owned(owner: &str) -> LockOptions {
    LockOptions::new().owner(owner)
}

/// 统计 compare_and_delete 调用次数
#[derive(Default)]
struct CountingStore {
    inner: MemoryStore,
    deletes: AtomicUsize,
}

#[async_trait]
impl LockStore for CountingStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn multi_set_if_absent(&self, entries: &[(&str, &str)]) -> StoreResult<bool> {
        self.inner.multi_set_if_absent(entries).await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.inner.get(key).await
    }

    async fn multi_get(&self, keys: &[&str]) -> StoreResult<Vec<Option<String>>> {
        self.inner.multi_get(keys).await
    }

    async fn get_with_ttl(&self, key: &str) -> StoreResult<Option<(String, Option<Duration>)>> {
        self.inner.get_with_ttl(key).await
    }

    async fn compare_and_delete(
        &self,
        conditions: &[Expect<'_>],
        keys: &[&str],
    ) -> StoreResult<bool> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.inner.compare_and_delete(conditions, keys).await
    }

    async fn compare_and_set_ttl(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        self.inner.compare_and_set_ttl(key, expected, ttl).await
    }

    async fn compare_and_set(
        &self,
        guard: Expect<'_>,
        key: &str,
        value: &str,
        min_current: Option<i64>,
        housekeeping_ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        self.inner
            .compare_and_set(guard, key, value, min_current, housekeeping_ttl)
            .await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.inner.expire(key, ttl).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mutual_exclusion_under_contention() {
    init();
    for strategy in [Strategy::SingleKey, Strategy::TwoKey] {
        let store = Arc::new(MemoryStore::new());
        let holders = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for i in 0..8 {
            let lock = lock_on(
                &store,
                "shared",
                owned(&format!("worker-{}", i))
                    .sleep(Duration::from_millis(5))
                    .strategy(strategy),
            );
            let observer = lock_on(&store, "shared", owned("observer").strategy(strategy));
            let holders = holders.clone();
            let completed = completed.clone();

            tasks.push(tokio::spawn(async move {
                lock.with_lock(Duration::from_secs(10), |lock| async move {
                    assert_eq!(holders.fetch_add(1, Ordering::SeqCst), 0);
                    assert!(lock.locked().await);
                    assert!(!observer.locked().await);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    holders.fetch_sub(1, Ordering::SeqCst);
                    completed.fetch_add(1, Ordering::SeqCst);
                })
                .await
            }));
        }

        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(completed.load(Ordering::SeqCst), 8);
        assert!(!store.contains("lock:shared"));
        assert!(!store.contains("lock:owner:shared"));
    }
}

#[tokio::test]
async fn test_acquire_times_out_on_held_lock() {
    init();
    let store = Arc::new(MemoryStore::new());
    let holder = lock_on(&store, "one", owned("first"));
    let waiter = lock_on(&store, "one", owned("second"));
    assert!(holder.try_acquire().await);

    let start = Instant::now();
    let err = waiter.acquire(Duration::from_secs(1)).await.unwrap_err();
    let elapsed = start.elapsed().as_secs_f64();

    assert_eq!(
        err,
        LockError::NotAcquired {
            resource: "one".to_string()
        }
    );
    assert!((0.8..=1.2).contains(&elapsed), "took {}s", elapsed);
    assert!(holder.locked().await);
}

#[tokio::test]
async fn test_release_then_locked_is_false() {
    init();
    for strategy in [Strategy::SingleKey, Strategy::TwoKey] {
        let store = Arc::new(MemoryStore::new());
        let lock = lock_on(&store, "one", owned("first").strategy(strategy));

        lock.acquire(Duration::from_secs(1)).await.unwrap();
        assert!(lock.locked().await);
        lock.release().await;
        assert!(!lock.locked().await);

        // 再次释放不会报错
        lock.release().await;
        assert!(!lock.locked().await);
    }
}

#[tokio::test]
async fn test_with_lock_releases_once_and_returns_body_error() {
    init();
    let store = Arc::new(CountingStore::default());
    let lock = Lock::new(store.clone(), "one", owned("first")).unwrap();

    let result: Result<Result<(), String>, LockError> = lock
        .with_lock(Duration::from_secs(1), |lock| async move {
            assert!(lock.locked().await);
            Err("boom".to_string())
        })
        .await;

    assert_eq!(result, Ok(Err("boom".to_string())));
    assert_eq!(store.deletes.load(Ordering::SeqCst), 1);
    assert!(!lock.locked().await);
}

#[tokio::test]
async fn test_with_lock_skips_body_when_not_acquired() {
    init();
    let store = Arc::new(CountingStore::default());
    let holder = Lock::new(store.clone(), "one", owned("first")).unwrap();
    let waiter = Lock::new(store.clone(), "one", owned("second")).unwrap();
    assert!(holder.try_acquire().await);

    let called = AtomicUsize::new(0);
    let counter = &called;
    let err = waiter
        .with_lock(Duration::from_millis(200), |_| async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap_err();

    assert_eq!(err, LockError::not_acquired("one"));
    assert_eq!(called.load(Ordering::SeqCst), 0);
    assert_eq!(store.deletes.load(Ordering::SeqCst), 0);
    assert!(holder.locked().await);
}

#[tokio::test]
async fn test_with_lock_releases_before_panic_propagates() {
    init();
    let store = Arc::new(CountingStore::default());
    let lock = Lock::new(store.clone(), "one", owned("first")).unwrap();

    let task = {
        let lock = lock.clone();
        tokio::spawn(async move {
            lock.with_lock(Duration::from_secs(1), |_| async { panic!("boom") })
                .await
        })
    };

    let err = task.await.unwrap_err();
    assert!(err.is_panic());
    assert_eq!(store.deletes.load(Ordering::SeqCst), 1);
    assert!(!store.inner.contains("lock:one"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_with_lock_releases_when_future_is_dropped() {
    init();
    let store = Arc::new(CountingStore::default());
    let lock = Lock::new(store.clone(), "one", owned("first")).unwrap();

    let outcome = tokio::time::timeout(
        Duration::from_millis(50),
        lock.with_lock(Duration::from_secs(1), |_| {
            tokio::time::sleep(Duration::from_secs(10))
        }),
    )
    .await;

    assert!(outcome.is_err());
    assert_eq!(store.deletes.load(Ordering::SeqCst), 1);
    assert!(!store.inner.contains("lock:one"));
}

#[tokio::test(start_paused = true)]
async fn test_extend_keeps_others_out_until_new_expiry() {
    init();
    let store = Arc::new(MemoryStore::new());
    let a = lock_on(&store, "one", owned("first").life(Duration::from_secs(1)));
    let b = lock_on(&store, "one", owned("second"));

    assert!(a.try_acquire().await);
    a.extend(Duration::from_secs(5)).await.unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!b.try_acquire().await);
    assert!(a.locked().await);

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(b.try_acquire().await);
}

#[tokio::test]
async fn test_extend_requires_ownership() {
    init();
    for strategy in [Strategy::SingleKey, Strategy::TwoKey] {
        let store = Arc::new(MemoryStore::new());
        let a = lock_on(&store, "one", owned("first").strategy(strategy));
        let b = lock_on(&store, "one", owned("second").strategy(strategy));

        let err = a.extend(Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err, LockError::not_acquired("one"));

        assert!(b.try_acquire().await);
        let err = a.extend(Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err, LockError::not_acquired("one"));
        assert!(b.extend(Duration::from_secs(5)).await.is_ok());
    }
}

#[tokio::test(start_paused = true)]
async fn test_expired_lock_is_acquirable_without_release() {
    init();
    let store = Arc::new(MemoryStore::new());
    let a = lock_on(&store, "one", owned("first").life(Duration::from_secs(1)));
    let b = lock_on(&store, "one", owned("second"));

    assert!(a.try_acquire().await);
    b.acquire(Duration::from_secs(3)).await.unwrap();
    assert!(!a.locked().await);
    assert!(b.locked().await);
}

#[tokio::test]
async fn test_two_key_expired_lock_is_reclaimed() {
    init();
    let store = Arc::new(MemoryStore::new());
    let a = lock_on(
        &store,
        "one",
        owned("first")
            .life(Duration::from_millis(200))
            .strategy(Strategy::TwoKey),
    );
    let b = lock_on(
        &store,
        "one",
        owned("second")
            .sleep(Duration::from_millis(50))
            .strategy(Strategy::TwoKey),
    );

    assert!(a.try_acquire().await);
    assert!(!b.try_acquire().await);

    b.acquire(Duration::from_secs(2)).await.unwrap();
    assert!(!a.locked().await);
    assert!(b.locked().await);
    assert_eq!(
        store.get("lock:owner:one").await.unwrap().as_deref(),
        Some("second")
    );
}

#[tokio::test]
async fn test_two_key_lock_past_recorded_expiry_is_acquirable() {
    init();
    let store = Arc::new(MemoryStore::new());
    let lock = lock_on(&store, "one", owned("second").strategy(Strategy::TwoKey));

    store.set("lock:owner:one", "first", None);
    store.set("lock:expire:one", "1", None);

    lock.acquire(Duration::from_secs(1)).await.unwrap();
    assert!(lock.locked().await);
    assert_eq!(
        store.get("lock:owner:one").await.unwrap().as_deref(),
        Some("second")
    );
}

#[tokio::test]
async fn test_two_key_broken_lock_is_reclaimed() {
    init();
    let store = Arc::new(MemoryStore::new());
    let lock = lock_on(&store, "one", owned("first").strategy(Strategy::TwoKey));

    // 只有持有者键，没有过期时间键
    store.set("lock:owner:one", "ghost", None);
    assert!(lock.try_acquire().await);
    assert!(lock.locked().await);

    lock.release().await;

    // 只有过期时间键
    store.set("lock:expire:one", "99999999999999", None);
    assert!(lock.try_acquire().await);
    assert!(lock.locked().await);
}

#[tokio::test]
async fn test_two_key_current_lock_is_not_reclaimed() {
    init();
    let store = Arc::new(MemoryStore::new());
    let a = lock_on(&store, "one", owned("first").strategy(Strategy::TwoKey));
    let b = lock_on(&store, "one", owned("second").strategy(Strategy::TwoKey));

    assert!(a.try_acquire().await);
    assert!(!b.try_acquire().await);
    assert!(a.locked().await);
    assert_eq!(
        store.get("lock:owner:one").await.unwrap().as_deref(),
        Some("first")
    );
}

#[tokio::test]
async fn test_two_key_locked_requires_future_expiry() {
    init();
    let store = Arc::new(MemoryStore::new());
    let lock = lock_on(&store, "one", owned("first").strategy(Strategy::TwoKey));

    store.set("lock:owner:one", "first", None);
    assert!(!lock.locked().await);

    store.set("lock:expire:one", "1", None);
    assert!(!lock.locked().await);
}

#[tokio::test]
async fn test_two_key_extend_pushes_expiry() {
    init();
    let store = Arc::new(MemoryStore::new());
    let a = lock_on(
        &store,
        "one",
        owned("first")
            .life(Duration::from_millis(300))
            .strategy(Strategy::TwoKey),
    );
    let b = lock_on(&store, "one", owned("second").strategy(Strategy::TwoKey));

    assert!(a.try_acquire().await);
    a.extend(Duration::from_secs(5)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(a.locked().await);
    assert!(!b.try_acquire().await);
}

#[tokio::test(start_paused = true)]
async fn test_single_key_extend_after_expiry_fails() {
    init();
    let store = Arc::new(MemoryStore::new());
    let a = lock_on(&store, "one", owned("first").life(Duration::from_secs(1)));

    assert!(a.try_acquire().await);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!a.locked().await);

    let err = a.extend(Duration::from_secs(5)).await.unwrap_err();
    assert_eq!(err, LockError::not_acquired("one"));
    assert!(!store.contains("lock:one"));
}

#[tokio::test]
async fn test_two_key_extend_after_expiry_fails() {
    init();
    let store = Arc::new(MemoryStore::new());
    let a = lock_on(
        &store,
        "one",
        owned("first")
            .life(Duration::from_millis(200))
            .strategy(Strategy::TwoKey),
    );
    let b = lock_on(&store, "one", owned("second").strategy(Strategy::TwoKey));

    assert!(a.try_acquire().await);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!a.locked().await);

    let err = a.extend(Duration::from_secs(5)).await.unwrap_err();
    assert_eq!(err, LockError::not_acquired("one"));
    assert!(!a.locked().await);
    assert!(b.try_acquire().await);
}

#[tokio::test]
async fn test_two_key_extend_rejects_recorded_past_expiry() {
    init();
    let store = Arc::new(MemoryStore::new());
    let a = lock_on(&store, "one", owned("first").strategy(Strategy::TwoKey));

    store.set("lock:owner:one", "first", None);
    store.set("lock:expire:one", "1", None);
    let err = a.extend(Duration::from_secs(5)).await.unwrap_err();
    assert_eq!(err, LockError::not_acquired("one"));
    assert_eq!(
        store.get("lock:expire:one").await.unwrap().as_deref(),
        Some("1")
    );

    // 缺少过期时间键同样不算持有
    store.set("lock:expire:one", "1", Some(Duration::from_millis(1)));
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(a.extend(Duration::from_secs(5)).await.is_err());
    assert!(!store.contains("lock:expire:one"));
}

#[tokio::test]
async fn test_lock_returns_held_lock() {
    init();
    let store = Arc::new(MemoryStore::new());

    let held = redis_lock::lock(store.clone(), "one", owned("first"), Duration::from_secs(1))
        .await
        .unwrap();
    assert!(held.locked().await);
    assert_eq!(held.owner(), "first");

    let err = redis_lock::lock(
        store.clone(),
        "one",
        owned("second"),
        Duration::from_millis(200),
    )
    .await
    .unwrap_err();
    assert_eq!(err, LockError::not_acquired("one"));

    held.release().await;
    assert!(!store.contains("lock:one"));
}

#[tokio::test]
async fn test_unlock_only_removes_named_owner() {
    init();
    let store = Arc::new(MemoryStore::new());
    let a = lock_on(&store, "one", owned("first"));
    assert!(a.try_acquire().await);

    redis_lock::unlock(store.clone(), "one", owned("second"))
        .await
        .unwrap();
    assert!(a.locked().await);

    redis_lock::unlock(store.clone(), "one", owned("first"))
        .await
        .unwrap();
    assert!(!a.locked().await);
}

#[test]
fn test_unknown_option_fails_fast() {
    let err = LockOptions::from_value(serde_json::json!({ "owner": "a", "slep": 10 })).unwrap_err();
    assert!(matches!(err, LockError::Configuration(_)));
}
