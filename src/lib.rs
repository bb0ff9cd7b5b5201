//! 基于共享键值存储的分布式互斥锁
//!
//! 多个进程（或主机）只通过存储就能在同一资源上选出唯一持有者。
//! 获取、释放、续期和过期清理都是对存储的单次原子操作，
//! 持有者崩溃后由存储的键过期回收锁。
//!
//! ```ignore
//! let store = storage::connect(&Config::from_env()?).await?;
//! let lock = Lock::new(store, "user-1", LockOptions::new().life(Duration::from_secs(30)))?;
//!
//! lock.with_lock(Duration::from_secs(10), |_lock| async {
//!     do_critical_work().await
//! })
//! .await?;
//! ```

pub mod backoff;
pub mod config;
pub mod error;
pub mod lock;
pub mod models;
pub mod owner;
pub mod storage;

pub use backoff::{Backoff, ExponentialBackoff, FixedBackoff};
pub use config::{Config, LockDefaults, StorageType};
pub use error::{LockError, Result};
pub use lock::{lock, unlock, Lock};
pub use models::{is_deletable, is_locked, LockKeys, LockOptions, LockSnapshot, Strategy};
pub use storage::memory::MemoryStore;
pub use storage::redis::RedisStore;
pub use storage::{Expect, LockStore};
