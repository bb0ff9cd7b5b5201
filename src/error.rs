use thiserror::Error;

/// 锁对调用方暴露的错误
///
/// 存储层错误（连接断开、比较操作失败等）不会出现在这里，
/// 它们只算作一次失败的尝试，由轮询重试或在释放时忽略。
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LockError {
    /// 超时前未能获取锁，或续期时锁已不属于调用方
    #[error("lock not acquired: {resource}")]
    NotAcquired { resource: String },

    /// 未知或取值非法的配置项
    #[error("invalid lock configuration: {0}")]
    Configuration(String),
}

impl LockError {
    pub fn not_acquired(resource: impl Into<String>) -> Self {
        LockError::NotAcquired {
            resource: resource.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        LockError::Configuration(message.into())
    }
}

pub type Result<T> = std::result::Result<T, LockError>;
