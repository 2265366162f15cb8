//! EAL 通用库
//!
//! 进程本地的内存配置、日志初始化与对齐工具，供 `eal-mem` 使用。

pub mod config;
pub mod logging;
pub mod utils;

pub use config::{
    Config, ConfigBuilder, ConfigError, HugepageDir, IovaMode, MemoryConfig, ProcessType,
};
pub use logging::{init_logging, init_test_logging};
pub use utils::*;

/// 支持的最大 NUMA 节点数
pub const MAX_NUMA_NODES: usize = 8;
