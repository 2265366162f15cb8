//! 进程级单例
//!
//! 大多数程序每个进程只需要一个 [`MemConfig`]；这里提供一次性初始化和全局访问。
//! 需要多个上下文的场合（测试等）直接使用 [`MemConfig::init`]。

use std::sync::OnceLock;

use eal_common::MemoryConfig;

use crate::error::{MemError, MemResult};
use crate::mcfg::MemConfig;

static MEM_CONFIG: OnceLock<MemConfig> = OnceLock::new();

/// 初始化进程的内存上下文；重复初始化返回 `AlreadyExists`
pub fn init(config: MemoryConfig) -> MemResult<&'static MemConfig> {
    if MEM_CONFIG.get().is_some() {
        return Err(MemError::AlreadyExists("process memory config".into()));
    }
    let mc = MemConfig::init(config)?;
    MEM_CONFIG
        .set(mc)
        .map_err(|_| MemError::AlreadyExists("process memory config".into()))?;
    mem_config()
}

/// 已初始化的内存上下文
pub fn mem_config() -> MemResult<&'static MemConfig> {
    MEM_CONFIG
        .get()
        .ok_or(MemError::NotSupported("memory config is not initialized"))
}

/// 是否已初始化
pub fn is_initialized() -> bool {
    MEM_CONFIG.get().is_some()
}
