use crate::storage::{Expect, LockStore};
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: &str, ttl: Option<Duration>) -> Self {
        Self {
            value: value.to_string(),
            expires_at: ttl.and_then(|ttl| expiry(Instant::now(), ttl)),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// 进程内存储，所有操作在同一把互斥锁内完成，因此跨键也是原子的
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>, // key -> Entry
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 无条件写入，测试中用来伪造过期或损坏的锁
    pub fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        self.entries
            .lock()
            .insert(key.to_string(), Entry::new(value, ttl));
    }

    pub fn contains(&self, key: &str) -> bool {
        let mut entries = self.entries.lock();
        current(&mut entries, key, Instant::now()).is_some()
    }

    /// 清理过期键，返回清理数量
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let purged = before - entries.len();

        if purged > 0 {
            log::info!("[CLEANUP] Removed {} expired keys", purged);
        }
        purged
    }

    /// 启动后台清理任务
    pub fn spawn_reaper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                store.purge_expired();
            }
        })
    }
}

// 超出 Instant 表示范围的 TTL 视为永不过期
fn expiry(now: Instant, ttl: Duration) -> Option<Instant> {
    now.checked_add(ttl)
}

// 读取前先淘汰已过期的键
fn current<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
    now: Instant,
) -> Option<&'a mut Entry> {
    if entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

fn matches(entries: &mut HashMap<String, Entry>, condition: &Expect<'_>, now: Instant) -> bool {
    let value = current(entries, condition.key, now).map(|entry| entry.value.as_str());
    value == condition.value
}

#[async_trait]
impl LockStore for MemoryStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock();
        if current(&mut entries, key, Instant::now()).is_some() {
            return Ok(false);
        }
        entries.insert(key.to_string(), Entry::new(value, Some(ttl)));
        Ok(true)
    }

    async fn multi_set_if_absent(&self, items: &[(&str, &str)]) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        for (key, _) in items {
            if current(&mut entries, key, now).is_some() {
                return Ok(false);
            }
        }
        for (key, value) in items {
            entries.insert(key.to_string(), Entry::new(value, None));
        }
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock();
        Ok(current(&mut entries, key, Instant::now()).map(|entry| entry.value.clone()))
    }

    async fn multi_get(&self, keys: &[&str]) -> Result<Vec<Option<String>>> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        Ok(keys
            .iter()
            .map(|key| current(&mut entries, key, now).map(|entry| entry.value.clone()))
            .collect())
    }

    async fn get_with_ttl(&self, key: &str) -> Result<Option<(String, Option<Duration>)>> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        Ok(current(&mut entries, key, now).map(|entry| {
            let remaining = entry.expires_at.map(|at| at.saturating_duration_since(now));
            (entry.value.clone(), remaining)
        }))
    }

    async fn compare_and_delete(&self, conditions: &[Expect<'_>], keys: &[&str]) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if !conditions
            .iter()
            .all(|condition| matches(&mut entries, condition, now))
        {
            return Ok(false);
        }
        for key in keys {
            entries.remove(*key);
        }
        Ok(true)
    }

    async fn compare_and_set_ttl(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match current(&mut entries, key, now) {
            Some(entry) if entry.value == expected => {
                entry.expires_at = expiry(now, ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn compare_and_set(
        &self,
        guard: Expect<'_>,
        key: &str,
        value: &str,
        min_current: Option<i64>,
        housekeeping_ttl: Option<Duration>,
    ) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if !matches(&mut entries, &guard, now) {
            return Ok(false);
        }
        if let Some(floor) = min_current {
            let existing = current(&mut entries, key, now)
                .and_then(|entry| entry.value.parse::<i64>().ok());
            if !existing.is_some_and(|existing| existing > floor) {
                return Ok(false);
            }
        }

        entries.insert(key.to_string(), Entry::new(value, housekeeping_ttl));
        if let Some(ttl) = housekeeping_ttl {
            if let Some(entry) = current(&mut entries, guard.key, now) {
                entry.expires_at = expiry(now, ttl);
            }
        }
        Ok(true)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match current(&mut entries, key, now) {
            Some(entry) => {
                entry.expires_at = expiry(now, ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
