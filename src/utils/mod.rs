mod config;
mod logger;

pub use config::{Config, ConfigError};
pub use logger::{parse_log_level, setup_logger};

use std::sync::{Mutex, MutexGuard};

/// 获取应用程序版本
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// 获取应用程序名称
pub fn name() -> &'static str {
    env!("CARGO_PKG_NAME")
}

/// 加锁，锁被毒化时继续使用内部数据
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
