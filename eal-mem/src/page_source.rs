//! 页来源
//!
//! 注册表只负责地址预留和簿记，真正把一页内存放到某个地址上的是
//! [`PageSource`]：
//!
//! - [`AnonymousPageSource`]：不使用 hugetlbfs，以匿名内存模拟大页；
//! - [`HugetlbfsPageSource`]：每页一个文件，或单文件模式下每个列表一个文件。
//!   同一组文件也可以由其他进程经 [`PageSource::attach_page`] 映射到相同地址。

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::Arc;

use eal_common::{HugepageDir, IovaMode, MemoryConfig};
use parking_lot::Mutex;

use crate::error::{AllocFailure, MemError, MemResult};
use crate::segment::ListId;
use crate::BAD_IOVA;

/// 一次映射请求；只能由注册表构造，地址必然位于它持有的预留区间内
#[derive(Debug, Clone, Copy)]
pub struct PageRequest {
    pub addr: usize,
    pub page_size: usize,
    pub socket_id: i32,
    pub list: ListId,
    pub slot: usize,
    _sealed: (),
}

impl PageRequest {
    pub(crate) fn new(addr: usize, page_size: usize, socket_id: i32, list: ListId, slot: usize) -> Self {
        Self {
            addr,
            page_size,
            socket_id,
            list,
            slot,
            _sealed: (),
        }
    }
}

/// 段的后备文件描述符及其在文件中的偏移
#[derive(Debug, Clone)]
pub struct SegmentFd {
    fd: Arc<OwnedFd>,
    offset: u64,
}

impl SegmentFd {
    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }
}

/// 已映射的页
#[derive(Debug, Clone)]
pub struct MappedPage {
    pub iova: u64,
    pub fd: Option<SegmentFd>,
}

/// 物理页的提供者
pub trait PageSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// 支持的页规格，升序
    fn page_sizes(&self) -> &[usize];

    /// 把一页内存映射到 `req.addr`
    fn map_page(&self, req: &PageRequest) -> MemResult<MappedPage>;

    /// 归还一页，地址退回为预留占位
    fn unmap_page(&self, req: &PageRequest, page: &MappedPage) -> MemResult<()>;

    /// 把另一个进程已经放好的页映射到 `req.addr`
    fn attach_page(&self, req: &PageRequest) -> MemResult<Option<SegmentFd>> {
        let _ = req;
        Err(MemError::NotSupported("pages of this source are private to one process"))
    }

    /// 撤销 [`Self::attach_page`] 的映射，后备文件保持不动
    fn detach_page(&self, req: &PageRequest) -> MemResult<()> {
        // SAFETY: PageRequest 只由注册表在自己的预留区间内构造
        unsafe { eal_osal::release_to_reservation(req.addr, req.page_size)? };
        Ok(())
    }

    /// 列表不再使用，丢弃为它缓存的资源
    fn release_list(&self, _list: ListId) {}
}

fn page_alloc_failed(req: &PageRequest, e: impl std::fmt::Display) -> MemError {
    log::warn!(
        "failed to map {}-byte page at 0x{:x} on socket {}: {e}",
        req.page_size,
        req.addr,
        req.socket_id
    );
    MemError::oom(req.page_size, req.socket_id, AllocFailure::PageAllocFailed)
}

fn iova_for(mode: IovaMode, addr: usize) -> u64 {
    match mode {
        IovaMode::Va => addr as u64,
        IovaMode::Pa => eal_osal::virt2phys(addr).unwrap_or_else(|| {
            log::debug!("no physical address for 0x{addr:x}");
            BAD_IOVA
        }),
    }
}

fn prefer_node(req: &PageRequest) {
    if req.socket_id < 0 || eal_osal::numa::sockets().len() < 2 {
        return;
    }
    if let Err(e) = eal_osal::bind_to_node(req.addr, req.page_size, req.socket_id as u32) {
        log::debug!("mbind to node {} failed: {e}", req.socket_id);
    }
}

/// 预先缺页，让 PA 模式能读到物理地址
fn touch(addr: usize) {
    // SAFETY: 页刚刚映射为可读写
    unsafe { std::ptr::write_volatile(addr as *mut u8, 0) };
}

// ============================================================================
// 匿名页
// ============================================================================

/// 匿名内存页来源
#[derive(Debug, Clone)]
pub struct AnonymousPageSource {
    page_sizes: Vec<usize>,
    iova_mode: IovaMode,
}

impl AnonymousPageSource {
    pub fn new(mut page_sizes: Vec<usize>, iova_mode: IovaMode) -> Self {
        page_sizes.sort_unstable();
        page_sizes.dedup();
        Self {
            page_sizes,
            iova_mode,
        }
    }

    pub fn from_config(cfg: &MemoryConfig) -> Self {
        Self::new(cfg.no_huge_page_sizes.clone(), cfg.iova_mode)
    }
}

impl PageSource for AnonymousPageSource {
    fn name(&self) -> &'static str {
        "anonymous"
    }

    fn page_sizes(&self) -> &[usize] {
        &self.page_sizes
    }

    fn map_page(&self, req: &PageRequest) -> MemResult<MappedPage> {
        // SAFETY: PageRequest 只由注册表在自己的预留区间内构造
        unsafe { eal_osal::map_anonymous_fixed(req.addr, req.page_size, false) }
            .map_err(|e| page_alloc_failed(req, e))?;
        prefer_node(req);
        if self.iova_mode == IovaMode::Pa {
            touch(req.addr);
        }
        Ok(MappedPage {
            iova: iova_for(self.iova_mode, req.addr),
            fd: None,
        })
    }

    fn unmap_page(&self, req: &PageRequest, _page: &MappedPage) -> MemResult<()> {
        // SAFETY: 同上
        unsafe { eal_osal::release_to_reservation(req.addr, req.page_size)? };
        Ok(())
    }
}

// ============================================================================
// hugetlbfs
// ============================================================================

/// hugetlbfs 文件页来源
pub struct HugetlbfsPageSource {
    dirs: Vec<HugepageDir>,
    page_sizes: Vec<usize>,
    prefix: String,
    single_file: bool,
    unlink: bool,
    iova_mode: IovaMode,
    list_files: Mutex<HashMap<ListId, Arc<OwnedFd>>>,
}

impl HugetlbfsPageSource {
    pub fn new(
        dirs: Vec<HugepageDir>,
        prefix: impl Into<String>,
        single_file: bool,
        unlink: bool,
        iova_mode: IovaMode,
    ) -> MemResult<Self> {
        if dirs.is_empty() {
            return Err(MemError::NotSupported("no hugetlbfs mount available"));
        }
        let mut page_sizes: Vec<usize> = dirs.iter().map(|d| d.page_size).collect();
        page_sizes.sort_unstable();
        page_sizes.dedup();
        Ok(Self {
            dirs,
            page_sizes,
            prefix: prefix.into(),
            single_file,
            unlink,
            iova_mode,
            list_files: Mutex::new(HashMap::new()),
        })
    }

    /// 普通文件后备：所有页规格都放在 `dir` 下，用于不挂 hugetlbfs 的多进程部署
    pub fn file_backed(cfg: &MemoryConfig, dir: PathBuf) -> MemResult<Self> {
        std::fs::create_dir_all(&dir).map_err(eal_osal::OsalError::from)?;
        let dirs = cfg
            .no_huge_page_sizes
            .iter()
            .map(|&page_size| HugepageDir {
                page_size,
                dir: dir.clone(),
            })
            .collect();
        Self::new(
            dirs,
            cfg.hugefile_prefix.clone(),
            cfg.single_file_segments,
            cfg.unlink_hugepages(),
            cfg.iova_mode,
        )
    }

    /// 使用配置中的目录，未配置时探测挂载点
    pub fn from_config(cfg: &MemoryConfig) -> MemResult<Self> {
        let dirs = if cfg.hugepage_dirs.is_empty() {
            eal_osal::platform::hugetlbfs_mounts()
                .into_iter()
                .map(|m| HugepageDir {
                    page_size: m.page_size,
                    dir: m.path,
                })
                .collect()
        } else {
            cfg.hugepage_dirs.clone()
        };
        Self::new(
            dirs,
            cfg.hugefile_prefix.clone(),
            cfg.single_file_segments,
            cfg.unlink_hugepages(),
            cfg.iova_mode,
        )
    }

    fn dir_for(&self, page_size: usize) -> MemResult<&PathBuf> {
        self.dirs
            .iter()
            .find(|d| d.page_size == page_size)
            .map(|d| &d.dir)
            .ok_or_else(|| MemError::invalid(format!("no hugetlbfs dir for page size {page_size}")))
    }

    fn page_path(&self, req: &PageRequest) -> MemResult<PathBuf> {
        let dir = self.dir_for(req.page_size)?;
        Ok(if self.single_file {
            dir.join(format!("{}map_{}", self.prefix, req.list.0))
        } else {
            dir.join(format!("{}map_{}_{}", self.prefix, req.list.0, req.slot))
        })
    }

    fn open(path: &PathBuf, create: bool) -> std::io::Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(false)
            .open(path)
    }

    /// 单文件模式下取得列表文件；`create` 为假时只打开别的进程建好的文件
    fn list_file(&self, req: &PageRequest, create: bool) -> MemResult<Arc<OwnedFd>> {
        let mut files = self.list_files.lock();
        if let Some(fd) = files.get(&req.list) {
            return Ok(fd.clone());
        }
        let path = self.page_path(req)?;
        let file = if create {
            let file = Self::open(&path, true).map_err(|e| page_alloc_failed(req, e))?;
            if self.unlink {
                let _ = std::fs::remove_file(&path);
            }
            file
        } else {
            Self::open(&path, false).map_err(|e| missing_page_file(&path, e))?
        };
        let fd = Arc::new(OwnedFd::from(file));
        files.insert(req.list, fd.clone());
        Ok(fd)
    }
}

fn missing_page_file(path: &std::path::Path, e: std::io::Error) -> MemError {
    log::warn!("cannot open page file {}: {e}", path.display());
    MemError::NotFound(format!("page file {}", path.display()))
}

impl PageSource for HugetlbfsPageSource {
    fn name(&self) -> &'static str {
        "hugetlbfs"
    }

    fn page_sizes(&self) -> &[usize] {
        &self.page_sizes
    }

    fn map_page(&self, req: &PageRequest) -> MemResult<MappedPage> {
        let (fd, offset) = if self.single_file {
            let fd = self.list_file(req, true)?;
            let offset = (req.slot * req.page_size) as u64;
            let file = File::from(fd.try_clone().map_err(|e| page_alloc_failed(req, e))?);
            if file.metadata().map(|m| m.len()).unwrap_or(0) < offset + req.page_size as u64 {
                file.set_len(offset + req.page_size as u64)
                    .map_err(|e| page_alloc_failed(req, e))?;
            }
            (fd, offset)
        } else {
            let path = self.page_path(req)?;
            let file = Self::open(&path, true).map_err(|e| page_alloc_failed(req, e))?;
            file.set_len(req.page_size as u64)
                .map_err(|e| page_alloc_failed(req, e))?;
            if self.unlink {
                let _ = std::fs::remove_file(&path);
            }
            (Arc::new(OwnedFd::from(file)), 0)
        };

        // SAFETY: 地址位于注册表的预留区间，fd 在调用期间有效
        unsafe {
            eal_osal::map_file_fixed(req.addr, req.page_size, fd.as_raw_fd(), offset, true)
        }
        .map_err(|e| page_alloc_failed(req, e))?;
        prefer_node(req);
        if self.iova_mode == IovaMode::Pa {
            touch(req.addr);
        }
        Ok(MappedPage {
            iova: iova_for(self.iova_mode, req.addr),
            fd: Some(SegmentFd { fd, offset }),
        })
    }

    fn unmap_page(&self, req: &PageRequest, page: &MappedPage) -> MemResult<()> {
        // SAFETY: 地址位于注册表的预留区间
        unsafe { eal_osal::release_to_reservation(req.addr, req.page_size)? };
        if self.single_file {
            if let Some(fd) = &page.fd
                && let Err(e) = eal_osal::punch_hole(fd.raw_fd(), fd.offset, req.page_size)
            {
                log::debug!("punch hole at offset {} failed: {e}", fd.offset);
            }
        } else if !self.unlink {
            let _ = std::fs::remove_file(self.page_path(req)?);
        }
        Ok(())
    }

    fn attach_page(&self, req: &PageRequest) -> MemResult<Option<SegmentFd>> {
        let (fd, offset) = if self.single_file {
            (self.list_file(req, false)?, (req.slot * req.page_size) as u64)
        } else {
            let path = self.page_path(req)?;
            let file = Self::open(&path, false).map_err(|e| missing_page_file(&path, e))?;
            (Arc::new(OwnedFd::from(file)), 0)
        };
        // SAFETY: 地址位于注册表的预留区间，fd 在调用期间有效
        unsafe {
            eal_osal::map_file_fixed(req.addr, req.page_size, fd.as_raw_fd(), offset, true)?
        };
        Ok(Some(SegmentFd { fd, offset }))
    }

    fn release_list(&self, list: ListId) {
        self.list_files.lock().remove(&list);
    }
}
