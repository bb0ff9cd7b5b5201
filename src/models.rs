use crate::error::{LockError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const KEY_PREFIX: &str = "lock:";

/// 锁在存储中的布局方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// 单键，SET NX 并附带存储 TTL
    #[default]
    SingleKey,
    /// 持有者键加显式过期时间键，用于不支持条件写入带 TTL 的存储
    TwoKey,
}

/// 一个资源对应的存储键
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockKeys {
    pub owner: String,
    pub expire: Option<String>,
}

impl LockKeys {
    pub fn new(resource: &str, strategy: Strategy) -> Self {
        match strategy {
            Strategy::SingleKey => Self {
                owner: format!("{}{}", KEY_PREFIX, resource),
                expire: None,
            },
            Strategy::TwoKey => Self {
                owner: format!("{}owner:{}", KEY_PREFIX, resource),
                expire: Some(format!("{}expire:{}", KEY_PREFIX, resource)),
            },
        }
    }

    /// 锁使用的全部键，持有者键在前
    pub fn all(&self) -> Vec<&str> {
        let mut keys = vec![self.owner.as_str()];
        if let Some(expire) = &self.expire {
            keys.push(expire.as_str());
        }
        keys
    }
}

/// 调用方提供的锁配置
///
/// 反序列化时拒绝未知字段，拼错的配置项会直接报错
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LockOptions {
    /// 持有者标识，默认 `<hostname>:<pid>`
    pub owner: Option<String>,
    /// 预计持有锁的时长（秒）
    pub life: Option<f64>,
    /// 获取锁的轮询间隔（毫秒）
    pub sleep: Option<u64>,
    pub strategy: Option<Strategy>,
}

impl LockOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn life(mut self, life: Duration) -> Self {
        self.life = Some(life.as_secs_f64());
        self
    }

    pub fn sleep(mut self, sleep: Duration) -> Self {
        self.sleep = Some(sleep.as_millis() as u64);
        self
    }

    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| LockError::config(e.to_string()))
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| LockError::config(e.to_string()))
    }
}

/// 同时从存储读出的持有者和过期时间
///
/// `expiry` 为 Unix 毫秒时间戳，`now < expiry` 时锁有效
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockSnapshot {
    pub owner: Option<String>,
    pub expiry: Option<i64>,
}

impl LockSnapshot {
    /// 由存储中的原始值构造，无法解析的过期时间按 0 处理
    pub fn from_raw(owner: Option<String>, expiry: Option<&str>) -> Self {
        Self {
            owner,
            expiry: expiry.map(|raw| raw.trim().parse().unwrap_or(0)),
        }
    }

    pub fn is_deletable(&self, now: i64) -> bool {
        is_deletable(self.owner.as_deref(), self.expiry, now)
    }

    pub fn is_held_by(&self, owner: &str, now: i64) -> bool {
        is_locked(owner, self.owner.as_deref(), self.expiry, now)
    }
}

/// 锁记录存在，但已损坏或已过期
pub fn is_deletable(owner: Option<&str>, expiry: Option<i64>, now: i64) -> bool {
    let expiry = expiry.unwrap_or(0);
    (owner.is_some() || expiry > 0) && (owner.is_none() || expiry <= now)
}

/// `me` 持有锁，且锁既未损坏也未过期
pub fn is_locked(me: &str, owner: Option<&str>, expiry: Option<i64>, now: i64) -> bool {
    owner == Some(me) && !is_deletable(owner, expiry, now)
}
