//! 日志初始化
//!
//! 全部代码通过 `log` 门面输出，由 `env_logger` 落地。`RUST_LOG` 优先于
//! 传入的默认级别。

use log::LevelFilter;

/// 安装全局日志器
///
/// 重复调用是安全的：已安装时返回 `false`，不做任何事。
pub fn init_logging(default_level: LevelFilter) -> bool {
    env_logger::Builder::from_env(
        env_logger::Env::default().filter_or("RUST_LOG", default_level.as_str()),
    )
    .format_timestamp_micros()
    .try_init()
    .is_ok()
}

/// 测试用日志器，输出被测试框架捕获
pub fn init_test_logging() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(LevelFilter::Debug)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_test_logging();
        assert!(!init_logging(LevelFilter::Info));
        log::debug!("logging still works after a second init");
    }
}
