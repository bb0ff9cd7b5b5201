use crate::storage::scripts;
use crate::storage::{Expect, LockStore};
use anyhow::Result;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::str::FromStr;
use std::time::Duration;

pub struct RedisStore {
    client: ConnectionManager,
    compare_and_delete: Script,
    compare_and_set_ttl: Script,
    compare_and_set: Script,
}

impl RedisStore {
    pub async fn new(
        redis_url: &str,
        username: Option<String>,
        password: Option<String>,
        db: Option<i64>,
    ) -> Result<Self> {
        // 构建连接信息
        let mut connection_info = redis::ConnectionInfo::from_str(redis_url)?;

        // 设置认证信息
        if let Some(pwd) = password {
            connection_info.redis.password = Some(pwd);
        }
        if let Some(user) = username {
            connection_info.redis.username = Some(user);
        }
        if let Some(database) = db {
            connection_info.redis.db = database;
        }

        let client = redis::Client::open(connection_info)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self::from_connection(connection))
    }

    pub fn from_connection(client: ConnectionManager) -> Self {
        Self {
            client,
            compare_and_delete: Script::new(scripts::COMPARE_AND_DELETE),
            compare_and_set_ttl: Script::new(scripts::COMPARE_AND_SET_TTL),
            compare_and_set: Script::new(scripts::COMPARE_AND_SET),
        }
    }
}

fn millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1)
}

fn presence(value: Option<&str>) -> (&'static str, &str) {
    match value {
        Some(value) => ("1", value),
        None => ("0", ""),
    }
}

#[async_trait]
impl LockStore for RedisStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.client.clone();

        // SET key value NX PX milliseconds，成功返回 "OK"，失败返回 nil
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(result.is_some())
    }

    async fn multi_set_if_absent(&self, entries: &[(&str, &str)]) -> Result<bool> {
        let mut conn = self.client.clone();
        let result: bool = conn.mset_nx(entries).await?;
        Ok(result)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.client.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn multi_get(&self, keys: &[&str]) -> Result<Vec<Option<String>>> {
        let mut conn = self.client.clone();
        // MGET 本身是原子的
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await?;
        Ok(values)
    }

    async fn get_with_ttl(&self, key: &str) -> Result<Option<(String, Option<Duration>)>> {
        let mut conn = self.client.clone();
        let (value, pttl): (Option<String>, i64) = redis::pipe()
            .atomic()
            .get(key)
            .pttl(key)
            .query_async(&mut conn)
            .await?;

        // PTTL: -1 表示没有过期时间，-2 表示键不存在
        Ok(value.map(|value| {
            let remaining = (pttl >= 0).then(|| Duration::from_millis(pttl as u64));
            (value, remaining)
        }))
    }

    async fn compare_and_delete(&self, conditions: &[Expect<'_>], keys: &[&str]) -> Result<bool> {
        let mut conn = self.client.clone();
        let mut invocation = self.compare_and_delete.prepare_invoke();
        invocation.arg(conditions.len());
        for condition in conditions {
            let (flag, value) = presence(condition.value);
            invocation.key(condition.key).arg(flag).arg(value);
        }
        for key in keys {
            invocation.key(*key);
        }

        let result: i32 = invocation.invoke_async(&mut conn).await?;
        Ok(result == 1)
    }

    async fn compare_and_set_ttl(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.client.clone();
        let result: i32 = self
            .compare_and_set_ttl
            .key(key)
            .arg(expected)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(result == 1)
    }

    async fn compare_and_set(
        &self,
        guard: Expect<'_>,
        key: &str,
        value: &str,
        min_current: Option<i64>,
        housekeeping_ttl: Option<Duration>,
    ) -> Result<bool> {
        let mut conn = self.client.clone();
        let (flag, expected) = presence(guard.value);
        let floor = min_current.map(|n| n.to_string()).unwrap_or_default();
        let result: i32 = self
            .compare_and_set
            .key(guard.key)
            .key(key)
            .arg(flag)
            .arg(expected)
            .arg(value)
            .arg(housekeeping_ttl.map(millis).unwrap_or(0))
            .arg(floor)
            .invoke_async(&mut conn)
            .await?;
        Ok(result == 1)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.client.clone();
        let result: bool = conn.pexpire(key, millis(ttl)).await?;
        Ok(result)
    }
}
