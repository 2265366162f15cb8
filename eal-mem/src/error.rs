//! 内存核心错误类型

use eal_common::ConfigError;
use eal_osal::OsalError;

/// 内存核心结果类型
pub type MemResult<T> = Result<T, MemError>;

/// 分配失败的具体原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocFailure {
    /// 空闲链表中没有合适元素，且增长后仍然没有
    NoFit,
    /// 注册表无法增长（没有空闲槽位或列表）
    GrowthFailed,
    /// 校验回调否决了增长
    Vetoed,
    /// 页来源未能提供物理页
    PageAllocFailed,
    /// 当前模式不允许增长（旧式内存模型、外部堆）
    GrowthDisabled,
}

impl std::fmt::Display for AllocFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AllocFailure::NoFit => "no fitting free element",
            AllocFailure::GrowthFailed => "registry growth failed",
            AllocFailure::Vetoed => "growth vetoed by validator",
            AllocFailure::PageAllocFailed => "page allocation failed",
            AllocFailure::GrowthDisabled => "growth disabled",
        };
        f.write_str(s)
    }
}

/// 内存核心错误
#[derive(Debug, thiserror::Error)]
pub enum MemError {
    /// 资源不足，附带原因码
    #[error("out of memory: {size} bytes on socket {socket} ({cause})")]
    OutOfMemory {
        size: usize,
        socket: i32,
        cause: AllocFailure,
    },

    /// 调用方参数错误（对齐非 2 的幂、未知指针、重复释放等）
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("{0} not found")]
    NotFound(String),

    /// 当前构建或配置不支持该能力
    #[error("not supported: {0}")]
    NotSupported(&'static str),

    /// 资源仍在使用
    #[error("busy: {0}")]
    Busy(String),

    /// 固定容量的表已满
    #[error("no space left: {0}")]
    NoSpace(&'static str),

    /// 共享配置文件存在但主进程还没有写入戳
    #[error("shared config {0} has not been stamped by a primary process")]
    NotInitialized(String),

    /// 共享配置魔数不符
    #[error("shared config magic mismatch: expected 0x{expected:08x}, found 0x{found:08x}")]
    MagicMismatch { expected: u32, found: u32 },

    /// 共享配置版本不符
    #[error("shared config version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    /// 无法把共享配置映射到主进程的地址
    #[error("shared config must map at 0x{expected:x}, got 0x{actual:x}")]
    AddressMismatch { expected: usize, actual: usize },

    /// 堆元数据自检失败
    #[error("heap corrupted: {0}")]
    Corrupted(String),

    /// 只有主进程可以执行的操作
    #[error("operation requires the primary process: {0}")]
    PrimaryOnly(&'static str),

    #[error(transparent)]
    Os(#[from] OsalError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl MemError {
    pub(crate) fn oom(size: usize, socket: i32, cause: AllocFailure) -> Self {
        MemError::OutOfMemory {
            size,
            socket,
            cause,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        MemError::InvalidArgument(msg.into())
    }

    /// 分配失败原因；非 OOM 错误返回 `None`
    pub fn alloc_failure(&self) -> Option<AllocFailure> {
        match self {
            MemError::OutOfMemory { cause, .. } => Some(*cause),
            _ => None,
        }
    }
}
