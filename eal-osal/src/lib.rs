//! eal-osal: 操作系统抽象层
//!
//! 为大页内存核心提供底层 OS 原语：
//! - 虚拟地址区间预留与固定地址映射（匿名 / 文件）
//! - 跨进程共享配置文件的映射
//! - NUMA 拓扑探测与内存绑定
//! - 大页规格探测、计时与 TSC 频率估计

pub mod mapping;
pub mod numa;
pub mod platform;

pub use mapping::*;
pub use platform::PlatformInfo;

// ============================================================================
// 错误类型
// ============================================================================

/// OS 抽象层结果类型
pub type OsalResult<T> = Result<T, OsalError>;

/// OS 抽象层错误
#[derive(Debug, thiserror::Error)]
pub enum OsalError {
    /// mmap 失败
    #[error("mmap of {len} bytes at 0x{addr:x} failed (errno {errno})")]
    MapFailed { addr: usize, len: usize, errno: i32 },

    /// 内核未能把映射放到请求的地址
    #[error("mapping requested at 0x{requested:x} landed at 0x{actual:x}")]
    AddressMismatch { requested: usize, actual: usize },

    /// 参数非法（未对齐、长度为零等）
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// 当前平台不支持
    #[error("not supported on this platform: {0}")]
    Unsupported(&'static str),

    /// 文件已被另一个进程独占锁定
    #[error("file {0} is locked by another process")]
    Locked(String),

    /// 底层 IO 错误
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl OsalError {
    pub(crate) fn last_map_error(addr: usize, len: usize) -> Self {
        OsalError::MapFailed {
            addr,
            len,
            errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
        }
    }
}

// ============================================================================
// 平台检测
// ============================================================================

pub fn host_os() -> &'static str {
    #[cfg(target_os = "linux")]
    {
        return "linux";
    }
    #[cfg(target_os = "freebsd")]
    {
        return "freebsd";
    }
    #[cfg(target_os = "macos")]
    {
        return "macos";
    }
    #[allow(unreachable_code)]
    "unknown"
}

pub fn host_arch() -> &'static str {
    #[cfg(target_arch = "x86_64")]
    {
        return "x86_64";
    }
    #[cfg(target_arch = "aarch64")]
    {
        return "aarch64";
    }
    #[cfg(target_arch = "riscv64")]
    {
        return "riscv64";
    }
    #[allow(unreachable_code)]
    "unknown"
}

/// 系统常规页大小
pub fn system_page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as usize } else { 4096 }
}

/// 当前进程 ID
pub fn current_pid() -> u32 {
    std::process::id()
}

// ============================================================================
// 高精度计时器
// ============================================================================

/// 高精度单调时间戳（纳秒）
pub fn timestamp_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    (ts.tv_sec as u64) * 1_000_000_000 + (ts.tv_nsec as u64)
}

/// 读取周期计数器；无 TSC 的架构退化为纳秒时钟
#[inline]
pub fn read_cycles() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        unsafe { core::arch::x86_64::_rdtsc() }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        timestamp_ns()
    }
}

/// 估计周期计数器频率（Hz）
///
/// 以单调时钟为参照采样 `sample_ms` 毫秒。
pub fn estimate_tsc_hz(sample_ms: u64) -> u64 {
    let sample_ms = sample_ms.max(1);
    let ns_start = timestamp_ns();
    let cycles_start = read_cycles();
    std::thread::sleep(std::time::Duration::from_millis(sample_ms));
    let cycles = read_cycles().wrapping_sub(cycles_start);
    let ns = timestamp_ns().saturating_sub(ns_start).max(1);
    ((cycles as u128) * 1_000_000_000 / ns as u128) as u64
}

// ============================================================================
// 测试
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_detection() {
        assert!(!host_os().is_empty());
        assert!(!host_arch().is_empty());
    }

    #[test]
    fn test_system_page_size() {
        let size = system_page_size();
        assert!(size.is_power_of_two());
        assert!(size >= 4096);
    }

    #[test]
    fn test_timestamp() {
        let t1 = timestamp_ns();
        std::thread::sleep(std::time::Duration::from_millis(1));
        let t2 = timestamp_ns();
        assert!(t2 > t1);
    }

    #[test]
    fn test_estimate_tsc_hz_is_plausible() {
        let hz = estimate_tsc_hz(5);
        // 至少 1MHz，至多 100GHz
        assert!(hz > 1_000_000, "hz = {hz}");
        assert!(hz < 100_000_000_000, "hz = {hz}");
    }
}
