//! 内存区
//!
//! 内存区是带名字的连续区间，从堆中按 IOVA 连续方式分配，生命周期与名字绑定。
//! 表的槽位在共享配置区里，受 zone 锁保护，挂接同一共享区的进程看到同一张表。

use std::cell::UnsafeCell;
use std::io::Write;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

use eal_common::utils::format_bytes;

use crate::error::{MemError, MemResult};
use crate::malloc::AllocRequest;
use crate::mcfg::MemConfig;
use crate::shared::{SharedRegion, decode_name, encode_name};
use crate::{BAD_IOVA, MAX_MEMZONES, MEMZONE_NAMESIZE};

/// 一个已预留的内存区
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Memzone {
    pub name: String,
    pub addr: usize,
    pub iova: u64,
    pub len: usize,
    pub page_size: usize,
    pub socket_id: i32,
}

impl Memzone {
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr as *mut u8
    }
}

/// 共享区中的一条内存区记录，全零为空槽
#[repr(C)]
#[derive(Debug)]
pub(crate) struct MemzoneSlot {
    used: AtomicU32,
    socket_id: AtomicI32,
    addr: AtomicU64,
    iova: AtomicU64,
    len: AtomicU64,
    page_size: AtomicU64,
    name: UnsafeCell<[u8; MEMZONE_NAMESIZE]>,
}

impl MemzoneSlot {
    fn is_used(&self) -> bool {
        self.used.load(Ordering::Acquire) != 0
    }

    fn name(&self) -> &str {
        // SAFETY: 名字只在持有 zone 锁时改写，调用方持有该锁
        decode_name(unsafe { &*self.name.get() })
    }

    fn load(&self) -> Memzone {
        Memzone {
            name: self.name().to_string(),
            addr: self.addr.load(Ordering::Relaxed) as usize,
            iova: self.iova.load(Ordering::Relaxed),
            len: self.len.load(Ordering::Relaxed) as usize,
            page_size: self.page_size.load(Ordering::Relaxed) as usize,
            socket_id: self.socket_id.load(Ordering::Relaxed),
        }
    }

    fn store(&self, mz: &Memzone) {
        // SAFETY: 同上，调用方持有 zone 写锁
        unsafe { *self.name.get() = encode_name(&mz.name) };
        self.addr.store(mz.addr as u64, Ordering::Relaxed);
        self.iova.store(mz.iova, Ordering::Relaxed);
        self.len.store(mz.len as u64, Ordering::Relaxed);
        self.page_size.store(mz.page_size as u64, Ordering::Relaxed);
        self.socket_id.store(mz.socket_id, Ordering::Relaxed);
        self.used.store(1, Ordering::Release);
    }
}

/// 共享内存区表的本地视图，只能经 `MemConfig::memzones` 的锁访问
pub(crate) struct MemzoneTable {
    region: Arc<SharedRegion>,
}

impl MemzoneTable {
    pub fn new(region: Arc<SharedRegion>) -> Self {
        Self { region }
    }

    fn slots(&self) -> &[MemzoneSlot] {
        self.region.memzone_slots()
    }

    fn find(&self, name: &str) -> Option<usize> {
        self.slots()
            .iter()
            .position(|s| s.is_used() && s.name() == name)
    }

    fn get(&self, idx: usize) -> Memzone {
        self.slots()[idx].load()
    }

    fn len(&self) -> usize {
        self.slots().iter().filter(|s| s.is_used()).count()
    }

    fn insert(&mut self, mz: &Memzone) -> MemResult<()> {
        let slot = self
            .slots()
            .iter()
            .find(|s| !s.is_used())
            .ok_or(MemError::NoSpace("memzones"))?;
        slot.store(mz);
        Ok(())
    }

    fn remove(&mut self, idx: usize) {
        self.slots()[idx].used.store(0, Ordering::Release);
    }

    fn iter(&self) -> impl Iterator<Item = Memzone> + '_ {
        self.slots().iter().filter(|s| s.is_used()).map(MemzoneSlot::load)
    }
}

impl std::fmt::Debug for MemzoneTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemzoneTable")
            .field("len", &self.len())
            .finish()
    }
}

fn check_name(name: &str) -> MemResult<()> {
    if name.is_empty() || name.len() >= MEMZONE_NAMESIZE {
        return Err(MemError::invalid(format!(
            "memzone name must be 1..{} bytes",
            MEMZONE_NAMESIZE - 1
        )));
    }
    Ok(())
}

impl MemConfig {
    /// 预留内存区
    ///
    /// `len` 为 0 时取当前能放下的最大连续块。
    pub fn memzone_reserve(
        &self,
        name: &str,
        len: usize,
        socket: i32,
        align: usize,
        bound: usize,
    ) -> MemResult<Memzone> {
        check_name(name)?;
        let mut table = self.memzones.write();
        if table.find(name).is_some() {
            return Err(MemError::AlreadyExists(format!("memzone '{name}'")));
        }
        if table.len() >= MAX_MEMZONES {
            return Err(MemError::NoSpace("memzones"));
        }
        let (ptr, len) = if len == 0 {
            if bound != 0 {
                return Err(MemError::invalid("a bound needs an explicit length"));
            }
            self.allocate_biggest(socket, align, true)?
        } else {
            let req = AllocRequest::new(len).align(align).bound(bound).contig();
            (self.allocate(socket, req)?, len)
        };
        let addr = ptr.as_ptr() as usize;
        let (iova, page_size, socket_id) = match self.registry.virt2memseg(addr) {
            Some(seg) => (seg.iova_of(addr), seg.page_size, seg.socket_id),
            None => (BAD_IOVA, 0, socket),
        };
        let mz = Memzone {
            name: name.to_string(),
            addr,
            iova,
            len,
            page_size,
            socket_id,
        };
        if let Err(e) = table.insert(&mz) {
            self.free(ptr)?;
            return Err(e);
        }
        log::debug!(
            "reserved memzone '{name}' at 0x{addr:x} ({})",
            format_bytes(len as u64)
        );
        Ok(mz)
    }

    pub fn memzone_lookup(&self, name: &str) -> Option<Memzone> {
        let table = self.memzones.read();
        table.find(name).map(|i| table.get(i))
    }

    /// 释放内存区并把内存还给堆
    ///
    /// 内存归还失败时记录保留。
    pub fn memzone_free(&self, name: &str) -> MemResult<()> {
        let mut table = self.memzones.write();
        let idx = table
            .find(name)
            .ok_or_else(|| MemError::NotFound(format!("memzone '{name}'")))?;
        let mz = table.get(idx);
        let ptr = NonNull::new(mz.as_ptr())
            .ok_or_else(|| MemError::invalid("memzone with a null address"))?;
        self.free(ptr)?;
        table.remove(idx);
        log::debug!("freed memzone '{name}'");
        Ok(())
    }

    pub fn memzone_walk<F>(&self, mut f: F)
    where
        F: FnMut(&Memzone),
    {
        let table = self.memzones.read();
        for mz in table.iter() {
            f(&mz);
        }
    }

    pub fn memzone_count(&self) -> usize {
        self.memzones.read().len()
    }

    pub fn memzone_dump(&self, out: &mut dyn Write) -> std::io::Result<()> {
        let table = self.memzones.read();
        for (i, mz) in table.iter().enumerate() {
            writeln!(
                out,
                "Zone {i}: name:<{}>, IO:0x{:x}, len:0x{:x}, virt:0x{:x}, socket_id:{}, pagesz:0x{:x}",
                mz.name, mz.iova, mz.len, mz.addr, mz.socket_id, mz.page_size
            )?;
        }
        Ok(())
    }
}
