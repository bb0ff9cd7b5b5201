//! 锁持有者标识
//!
//! 仅在调用方未设置 `LockOptions::owner` 时使用

use std::env;
use std::fs;
use uuid::Uuid;

/// `<hostname>:<pid>`
pub fn process_owner() -> String {
    format!("{}:{}", hostname(), std::process::id())
}

/// `<hostname>:<pid>:<uuid>`，同一进程内的多个持有者互不相同
pub fn unique_owner() -> String {
    format!("{}:{}", process_owner(), Uuid::new_v4())
}

fn hostname() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .filter_map(|name| env::var(name).ok())
        .chain(fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .find(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
