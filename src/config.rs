use crate::error::{LockError, Result};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub storage_type: StorageType,
    pub redis_url: Option<String>,
    pub redis_username: Option<String>,
    pub redis_password: Option<String>,
    pub redis_db: Option<i64>,
    pub defaults: LockDefaults,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    Memory,
    Redis,
}

/// 调用方未设置时使用的默认值
#[derive(Debug, Clone, PartialEq)]
pub struct LockDefaults {
    /// 获取锁的默认等待时间
    pub timeout: Duration,
    /// 默认持有时长
    pub life: Duration,
    /// 轮询间隔
    pub sleep: Duration,
}

impl Default for LockDefaults {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            life: Duration::from_secs(60),
            sleep: Duration::from_millis(125),
        }
    }
}

impl LockDefaults {
    pub fn from_env() -> Result<Self> {
        let fallback = Self::default();
        Ok(Self {
            timeout: Duration::from_secs(parse_var(
                "LOCK_DEFAULT_TIMEOUT",
                fallback.timeout.as_secs(),
            )?),
            life: Duration::from_secs(parse_var("LOCK_DEFAULT_LIFE", fallback.life.as_secs())?),
            sleep: Duration::from_millis(parse_var(
                "LOCK_DEFAULT_SLEEP",
                fallback.sleep.as_millis() as u64,
            )?),
        })
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let storage_type = env::var("STORAGE_TYPE")
            .unwrap_or_else(|_| "memory".to_string())
            .to_lowercase();

        let storage_type = match storage_type.as_str() {
            "redis" => StorageType::Redis,
            "memory" => StorageType::Memory,
            other => {
                return Err(LockError::config(format!("unknown STORAGE_TYPE {}", other)));
            }
        };

        let redis_url = if storage_type == StorageType::Redis {
            Some(env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()))
        } else {
            None
        };

        let redis_username = env::var("REDIS_USERNAME").ok();
        let redis_password = env::var("REDIS_PASSWORD").ok();
        let redis_db = match env::var("REDIS_DB") {
            Ok(raw) => Some(
                raw.parse::<i64>()
                    .map_err(|_| LockError::config(format!("REDIS_DB is not a number: {}", raw)))?,
            ),
            Err(_) => None,
        };

        Ok(Self {
            storage_type,
            redis_url,
            redis_username,
            redis_password,
            redis_db,
            defaults: LockDefaults::from_env()?,
        })
    }
}

fn parse_var(name: &str, default: u64) -> Result<u64> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| LockError::config(format!("{} is not a number: {}", name, raw))),
        Err(_) => Ok(default),
    }
}
