//! 虚拟地址预留与固定地址映射
//!
//! 段列表在初始化时预留一整段 `PROT_NONE` 地址空间，之后按页把真实内存
//! 映射到预留区间中的固定地址上；释放页时再把该地址退回成 `PROT_NONE`
//! 占位，保证区间内地址不会被其他映射复用。

use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::ptr;

use crate::{OsalError, OsalResult};

#[cfg(target_os = "linux")]
const NOREPLACE: libc::c_int = libc::MAP_FIXED_NOREPLACE;
#[cfg(not(target_os = "linux"))]
const NOREPLACE: libc::c_int = 0;

fn check_len(len: usize) -> OsalResult<()> {
    if len == 0 {
        return Err(OsalError::InvalidArgument("zero-length mapping".into()));
    }
    Ok(())
}

/// 在 `hint` 处精确映射，若内核放到了别处则撤销并报告 `AddressMismatch`
///
/// # Safety
///
/// `fd` 必须是有效描述符或 -1（匿名映射）。
unsafe fn map_at_hint(
    hint: usize,
    len: usize,
    prot: libc::c_int,
    flags: libc::c_int,
    fd: RawFd,
    offset: libc::off_t,
) -> OsalResult<usize> {
    let flags = if hint != 0 { flags | NOREPLACE } else { flags };
    // SAFETY: 不带 MAP_FIXED，不会覆盖已有映射
    let ret = unsafe { libc::mmap(hint as *mut libc::c_void, len, prot, flags, fd, offset) };
    if ret == libc::MAP_FAILED {
        let err = std::io::Error::last_os_error();
        if hint != 0 && err.raw_os_error() == Some(libc::EEXIST) {
            return Err(OsalError::AddressMismatch {
                requested: hint,
                actual: 0,
            });
        }
        return Err(OsalError::MapFailed {
            addr: hint,
            len,
            errno: err.raw_os_error().unwrap_or(0),
        });
    }
    let actual = ret as usize;
    if hint != 0 && actual != hint {
        // 旧内核忽略 NOREPLACE，把它当普通提示处理
        unsafe {
            libc::munmap(ret, len);
        }
        return Err(OsalError::AddressMismatch {
            requested: hint,
            actual,
        });
    }
    Ok(actual)
}

// ============================================================================
// 地址空间预留
// ============================================================================

/// 一段 `PROT_NONE` 的虚拟地址预留
///
/// Drop 时整体 munmap，包括其中已经映射进来的页。
#[derive(Debug)]
pub struct VaReservation {
    base: usize,
    len: usize,
}

// SAFETY: 预留只记录地址区间，对区间内存的访问由上层加锁协调
unsafe impl Send for VaReservation {}
unsafe impl Sync for VaReservation {}

impl VaReservation {
    /// 预留 `len` 字节、按 `align` 对齐的地址区间
    ///
    /// # 参数
    /// - `align`: 2 的幂；通常是列表的页大小
    /// - `hint`: 期望的起始地址，0 表示由内核挑选；提示地址不可用时退回到任意地址
    pub fn reserve(len: usize, align: usize, hint: usize) -> OsalResult<Self> {
        check_len(len)?;
        if !align.is_power_of_two() {
            return Err(OsalError::InvalidArgument(format!(
                "reservation alignment {align} is not a power of two"
            )));
        }
        let prot = libc::PROT_NONE;
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;

        if hint != 0 && hint % align == 0 {
            // SAFETY: 匿名映射，fd = -1
            match unsafe { map_at_hint(hint, len, prot, flags, -1, 0) } {
                Ok(base) => return Ok(Self { base, len }),
                Err(e) => log::debug!("reservation at hint 0x{hint:x} unavailable: {e}"),
            }
        }

        // 多预留 align 字节，再裁掉首尾得到对齐区间
        let total = len
            .checked_add(align)
            .ok_or_else(|| OsalError::InvalidArgument("reservation too large".into()))?;
        // SAFETY: 匿名映射，由内核挑选地址
        let raw = unsafe { libc::mmap(ptr::null_mut(), total, prot, flags, -1, 0) };
        if raw == libc::MAP_FAILED {
            return Err(OsalError::last_map_error(0, total));
        }
        let raw = raw as usize;
        let base = (raw + align - 1) & !(align - 1);
        let head = base - raw;
        let tail = total - head - len;
        unsafe {
            if head > 0 {
                libc::munmap(raw as *mut libc::c_void, head);
            }
            if tail > 0 {
                libc::munmap((base + len) as *mut libc::c_void, tail);
            }
        }
        Ok(Self { base, len })
    }

    /// 恰好在 `addr` 处预留，地址已被占用时返回 `AddressMismatch`
    ///
    /// 用于在本进程中重建其他进程创建的段列表，两边的地址必须一致。
    pub fn reserve_exact(addr: usize, len: usize) -> OsalResult<Self> {
        check_len(len)?;
        if addr == 0 {
            return Err(OsalError::InvalidArgument("exact reservation at address 0".into()));
        }
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
        // SAFETY: 匿名映射，fd = -1；带 NOREPLACE，不会覆盖已有映射
        let base = unsafe { map_at_hint(addr, len, libc::PROT_NONE, flags, -1, 0) }?;
        Ok(Self { base, len })
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, addr: usize, len: usize) -> bool {
        addr >= self.base && addr.saturating_add(len) <= self.base + self.len
    }
}

impl Drop for VaReservation {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}

// ============================================================================
// 固定地址映射
// ============================================================================

/// 在预留区间内的固定地址映射匿名可读写内存
///
/// # Safety
///
/// `[addr, addr + len)` 必须完全位于调用方持有的预留区间内且当前未被使用，
/// 否则会覆盖其他映射。
pub unsafe fn map_anonymous_fixed(addr: usize, len: usize, shared: bool) -> OsalResult<()> {
    check_len(len)?;
    let share = if shared {
        libc::MAP_SHARED
    } else {
        libc::MAP_PRIVATE
    };
    // SAFETY: 调用方保证地址区间归属
    let ret = unsafe {
        libc::mmap(
            addr as *mut libc::c_void,
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            share | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
            -1,
            0,
        )
    };
    if ret == libc::MAP_FAILED {
        return Err(OsalError::last_map_error(addr, len));
    }
    Ok(())
}

/// 把文件的 `[offset, offset + len)` 以共享方式映射到固定地址
///
/// `populate` 为真时立即缺页，使大页不足在映射时而不是首次访问时暴露。
///
/// # Safety
///
/// 同 [`map_anonymous_fixed`]；`fd` 必须在调用期间有效。
pub unsafe fn map_file_fixed(
    addr: usize,
    len: usize,
    fd: RawFd,
    offset: u64,
    populate: bool,
) -> OsalResult<()> {
    check_len(len)?;
    let mut flags = libc::MAP_SHARED | libc::MAP_FIXED;
    #[cfg(target_os = "linux")]
    if populate {
        flags |= libc::MAP_POPULATE;
    }
    #[cfg(not(target_os = "linux"))]
    let _ = populate;
    // SAFETY: 调用方保证地址区间归属与 fd 有效
    let ret = unsafe {
        libc::mmap(
            addr as *mut libc::c_void,
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            flags,
            fd,
            offset as libc::off_t,
        )
    };
    if ret == libc::MAP_FAILED {
        return Err(OsalError::last_map_error(addr, len));
    }
    Ok(())
}

/// 把已映射的页退回成 `PROT_NONE` 占位
///
/// # Safety
///
/// 区间内的内存此后不可再被访问。
pub unsafe fn release_to_reservation(addr: usize, len: usize) -> OsalResult<()> {
    check_len(len)?;
    // SAFETY: 调用方保证区间属于自己的预留
    let ret = unsafe {
        libc::mmap(
            addr as *mut libc::c_void,
            len,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_FIXED,
            -1,
            0,
        )
    };
    if ret == libc::MAP_FAILED {
        return Err(OsalError::last_map_error(addr, len));
    }
    Ok(())
}

/// 在文件中打洞，释放单文件模式下某一页的后备存储
pub fn punch_hole(fd: RawFd, offset: u64, len: usize) -> OsalResult<()> {
    #[cfg(target_os = "linux")]
    {
        let ret = unsafe {
            libc::fallocate(
                fd,
                libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                offset as libc::off_t,
                len as libc::off_t,
            )
        };
        if ret != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (fd, offset, len);
        Err(OsalError::Unsupported("fallocate punch hole"))
    }
}

/// 首选 NUMA 节点绑定（`MPOL_PREFERRED`）
///
/// 必须在首次访问前调用才会影响落点。
pub fn bind_to_node(addr: usize, len: usize, node: u32) -> OsalResult<()> {
    #[cfg(target_os = "linux")]
    {
        const MPOL_PREFERRED: libc::c_long = 1;
        if node >= 64 {
            return Err(OsalError::InvalidArgument(format!("numa node {node} out of range")));
        }
        let mask: libc::c_ulong = 1 << node;
        let ret = unsafe {
            libc::syscall(
                libc::SYS_mbind,
                addr as *mut libc::c_void,
                len as libc::c_ulong,
                MPOL_PREFERRED,
                &mask as *const libc::c_ulong,
                (node as libc::c_ulong) + 2,
                0 as libc::c_uint,
            )
        };
        if ret != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (addr, len, node);
        Err(OsalError::Unsupported("mbind"))
    }
}

/// 通过 `/proc/self/pagemap` 把虚拟地址翻译成物理地址
///
/// 没有 `CAP_SYS_ADMIN` 时内核把 PFN 置零，此时返回 `None`。
/// 页必须已经缺页驻留。
pub fn virt2phys(addr: usize) -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::fs::FileExt;

        let page = crate::system_page_size();
        let file = File::open("/proc/self/pagemap").ok()?;
        let mut entry = [0u8; 8];
        let offset = (addr / page) as u64 * 8;
        file.read_exact_at(&mut entry, offset).ok()?;
        let entry = u64::from_ne_bytes(entry);
        let present = entry & (1 << 63) != 0;
        let pfn = entry & ((1 << 55) - 1);
        if !present || pfn == 0 {
            return None;
        }
        Some(pfn * page as u64 + (addr % page) as u64)
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = addr;
        None
    }
}

// ============================================================================
// 共享配置映射
// ============================================================================

/// 跨进程共享的映射，用于承载共享配置记录
///
/// 文件后备时持有文件句柄（连同其上的独占锁）直到 Drop。
#[derive(Debug)]
pub struct SharedFileMapping {
    ptr: *mut u8,
    len: usize,
    file: Option<File>,
    path: Option<PathBuf>,
}

// SAFETY: 映射内容只通过原子类型或上层加锁后访问
unsafe impl Send for SharedFileMapping {}
unsafe impl Sync for SharedFileMapping {}

impl SharedFileMapping {
    /// 创建（或截断重建）共享文件并映射
    ///
    /// 文件先被截断为 0 再扩展，保证新内容全零。
    pub fn create(path: &Path, len: usize, hint: usize) -> OsalResult<Self> {
        Self::create_with(path, len, hint, false)
    }

    /// 先对文件加独占锁，成功后才截断重建并映射
    ///
    /// 锁随返回的映射存活；文件已被其他句柄锁定时返回 `Locked`，文件内容
    /// 保持不变。
    pub fn create_exclusive(path: &Path, len: usize, hint: usize) -> OsalResult<Self> {
        Self::create_with(path, len, hint, true)
    }

    fn create_with(path: &Path, len: usize, hint: usize, exclusive: bool) -> OsalResult<Self> {
        check_len(len)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        if exclusive {
            lock_exclusive(&file, path)?;
        }
        file.set_len(0)?;
        file.set_len(len as u64)?;
        let ptr = Self::map_file(&file, len, hint)?;
        Ok(Self {
            ptr,
            len,
            file: Some(file),
            path: Some(path.to_path_buf()),
        })
    }

    /// 映射已有的共享文件，地址由内核挑选
    pub fn open(path: &Path, len: usize) -> OsalResult<Self> {
        check_len(len)?;
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let actual = file.metadata()?.len();
        if actual < len as u64 {
            return Err(OsalError::InvalidArgument(format!(
                "{} holds {actual} bytes, expected {len}",
                path.display()
            )));
        }
        let ptr = Self::map_file(&file, len, 0)?;
        Ok(Self {
            ptr,
            len,
            file: Some(file),
            path: Some(path.to_path_buf()),
        })
    }

    /// 无文件后备的共享匿名映射（进程内模式）
    pub fn anonymous(len: usize) -> OsalResult<Self> {
        check_len(len)?;
        let ret = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ret == libc::MAP_FAILED {
            return Err(OsalError::last_map_error(0, len));
        }
        Ok(Self {
            ptr: ret as *mut u8,
            len,
            file: None,
            path: None,
        })
    }

    fn map_file(file: &File, len: usize, hint: usize) -> OsalResult<*mut u8> {
        let prot = libc::PROT_READ | libc::PROT_WRITE;
        // SAFETY: fd 来自仍然存活的 File
        let addr = unsafe { map_at_hint(hint, len, prot, libc::MAP_SHARED, file.as_raw_fd(), 0) }?;
        Ok(addr as *mut u8)
    }

    /// 在 `addr` 处重新映射同一文件，成功后释放旧映射
    pub fn remap_at(self, addr: usize) -> OsalResult<Self> {
        if addr == self.ptr as usize {
            return Ok(self);
        }
        let file = self
            .file
            .as_ref()
            .ok_or(OsalError::Unsupported("remapping an anonymous shared mapping"))?;
        let ptr = Self::map_file(file, self.len, addr)?;
        let mut this = self;
        unsafe {
            libc::munmap(this.ptr as *mut libc::c_void, this.len);
        }
        this.ptr = ptr;
        Ok(this)
    }

    /// 检查文件是否被其他句柄独占锁定（不保留锁）
    pub fn is_locked_elsewhere(path: &Path) -> OsalResult<bool> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_SH | libc::LOCK_NB) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                return Ok(true);
            }
            return Err(err.into());
        }
        unsafe {
            libc::flock(file.as_raw_fd(), libc::LOCK_UN);
        }
        Ok(false)
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn addr(&self) -> usize {
        self.ptr as usize
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

}

/// 非阻塞地加独占锁；锁随文件句柄存活
fn lock_exclusive(file: &File, path: &Path) -> OsalResult<()> {
    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            return Err(OsalError::Locked(path.display().to_string()));
        }
        return Err(err.into());
    }
    Ok(())
}

impl Drop for SharedFileMapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

// ============================================================================
// 测试
// ============================================================================
