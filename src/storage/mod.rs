pub mod memory;
pub mod redis;
mod scripts;

use crate::config::{Config, StorageType};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// 比较操作中对单个键的期望值
///
/// `value` 为 `None` 表示该键必须不存在
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expect<'a> {
    pub key: &'a str,
    pub value: Option<&'a str>,
}

impl<'a> Expect<'a> {
    pub fn new(key: &'a str, value: Option<&'a str>) -> Self {
        Self { key, value }
    }

    pub fn present(key: &'a str, value: &'a str) -> Self {
        Self {
            key,
            value: Some(value),
        }
    }
}

/// 锁所依赖的键值存储能力
///
/// 每个方法都是对存储的一次原子操作
#[async_trait]
pub trait LockStore: Send + Sync {
    /// 仅在键不存在时写入，并设置过期时间
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// 所有键都不存在时一次性写入，否则全部不写
    async fn multi_set_if_absent(&self, entries: &[(&str, &str)]) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// 一次性读取多个键（一致快照）
    async fn multi_get(&self, keys: &[&str]) -> Result<Vec<Option<String>>>;

    /// 同时读取值和剩余过期时间，无过期时间的键返回 `Some((value, None))`
    async fn get_with_ttl(&self, key: &str) -> Result<Option<(String, Option<Duration>)>>;

    /// 所有条件都满足时才删除 `keys`
    async fn compare_and_delete(&self, conditions: &[Expect<'_>], keys: &[&str]) -> Result<bool>;

    /// 仅当 `key` 的值等于 `expected` 时重置过期时间
    async fn compare_and_set_ttl(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool>;

    /// 仅当 `guard` 满足时写入 `key = value`；
    /// 给出 `min_current` 时 `key` 的当前值还必须是大于它的整数。
    /// 若给出 `housekeeping_ttl`，同时作用于 guard 键和 `key`
    async fn compare_and_set(
        &self,
        guard: Expect<'_>,
        key: &str,
        value: &str,
        min_current: Option<i64>,
        housekeeping_ttl: Option<Duration>,
    ) -> Result<bool>;

    /// 设置过期时间（尽力而为）
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;
}

/// 根据配置创建存储
pub async fn connect(config: &Config) -> Result<Arc<dyn LockStore>> {
    match config.storage_type {
        StorageType::Memory => {
            log::info!("Using memory storage");
            Ok(Arc::new(memory::MemoryStore::new()))
        }
        StorageType::Redis => {
            log::info!("Using Redis storage");
            let redis_url = config
                .redis_url
                .as_deref()
                .context("Redis URL not configured")?;
            let store = redis::RedisStore::new(
                redis_url,
                config.redis_username.clone(),
                config.redis_password.clone(),
                config.redis_db,
            )
            .await
            .context("Failed to connect to Redis")?;
            Ok(Arc::new(store))
        }
    }
}
