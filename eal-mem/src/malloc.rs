//! 分配接口
//!
//! 在 [`MemConfig`] 上提供按节点或按具名堆的分配、释放、原地调整，以及
//! 堆的创建、销毁与外部内存挂载。堆元数据在共享配置区中，任一进程都可以
//! 在任一堆上分配和释放；分配返回前先同步注册表，保证块所在的页已映射。
//!
//! 缺页时的增长流程（持堆锁，再持 hotplug 写锁）：
//!
//! 1. 校验回调检查增长后的用量，任一否决即失败；
//! 2. 注册表映射一段页，检查 IOVA 连续性与 DMA 掩码，不满足则撤销；
//! 3. 提交并发出 `Alloc` 事件，新内存加入堆，再试一次分配。
//!
//! 释放后合并出的空闲元素若覆盖整页，先发出 `Free` 事件再把页还给页来源。

use std::io::Write;
use std::ptr::NonNull;
use std::sync::Arc;

use eal_common::utils::{checked_align_up, format_bytes, is_aligned, is_power_of_two};

use crate::callbacks::MemEvent;
use crate::error::{AllocFailure, MemError, MemResult};
use crate::heap::{Heap, HeapInner, HeapStats, SocketStats};
use crate::mcfg::MemConfig;
use crate::segment::SegmentFlags;
use crate::{CACHE_LINE_SIZE, HEAP_NAME_MAX_LEN, SOCKET_ID_ANY};

/// 一次分配请求
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocRequest {
    pub size: usize,
    /// 0 表示缓存行对齐
    pub align: usize,
    /// 返回区间不得跨越的边界，0 表示不限
    pub bound: usize,
    /// 要求 IOVA 连续
    pub contig: bool,
}

impl AllocRequest {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            align: 0,
            bound: 0,
            contig: false,
        }
    }

    pub fn align(mut self, align: usize) -> Self {
        self.align = align;
        self
    }

    pub fn bound(mut self, bound: usize) -> Self {
        self.bound = bound;
        self
    }

    pub fn contig(mut self) -> Self {
        self.contig = true;
        self
    }

    /// 校验并返回 (取整后的大小, 实际对齐)
    fn normalize(&self) -> MemResult<(usize, usize)> {
        if self.size == 0 {
            return Err(MemError::invalid("zero-sized allocation"));
        }
        let align = normalize_align(self.align)?;
        if self.bound != 0 && !is_power_of_two(self.bound) {
            return Err(MemError::invalid(format!("bound {} is not a power of two", self.bound)));
        }
        let size = checked_align_up(self.size, CACHE_LINE_SIZE)
            .ok_or_else(|| MemError::invalid(format!("allocation of {} bytes overflows", self.size)))?;
        if self.bound != 0 && (size > self.bound || align > self.bound) {
            return Err(MemError::invalid(format!(
                "{} bytes aligned to {align} cannot fit within bound {}",
                self.size, self.bound
            )));
        }
        Ok((size, align))
    }
}

fn normalize_align(align: usize) -> MemResult<usize> {
    if align == 0 {
        return Ok(CACHE_LINE_SIZE);
    }
    if !is_power_of_two(align) {
        return Err(MemError::invalid(format!("alignment {align} is not a power of two")));
    }
    Ok(align.max(CACHE_LINE_SIZE))
}

fn to_ptr(addr: usize) -> MemResult<NonNull<u8>> {
    NonNull::new(addr as *mut u8).ok_or_else(|| MemError::invalid("null element address"))
}

impl MemConfig {
    // ------------------------------------------------------------------------
    // 堆选择
    // ------------------------------------------------------------------------

    /// 按尝试顺序排列的候选堆；任意节点时本地节点优先
    fn heap_candidates(&self, socket: i32) -> MemResult<Vec<Arc<Heap>>> {
        let heaps = self.heaps.read();
        if socket == SOCKET_ID_ANY {
            let local = eal_osal::numa::current_socket() as i32;
            let sockets = self.sockets();
            let order = sockets
                .iter()
                .copied()
                .filter(|&s| s == local)
                .chain(sockets.iter().copied().filter(|&s| s != local));
            return Ok(order.filter_map(|s| heaps.by_socket(s)).collect());
        }
        heaps
            .by_socket(socket)
            .map(|h| vec![h])
            .ok_or_else(|| MemError::invalid(format!("no heap for socket {socket}")))
    }

    fn heap_by_name(&self, name: &str) -> MemResult<Arc<Heap>> {
        self.heaps
            .read()
            .by_name(name)
            .ok_or_else(|| MemError::NotFound(format!("heap '{name}'")))
    }

    /// 管理 `addr` 的堆
    fn heap_of(&self, addr: usize) -> MemResult<Arc<Heap>> {
        let id = self
            .registry
            .read()
            .list_containing(addr)
            .and_then(|l| l.owner_heap);
        id.and_then(|id| self.heaps.read().get(id))
            .ok_or_else(|| MemError::invalid(format!("0x{addr:x} does not belong to any heap")))
    }

    /// 节点对应的堆下标
    pub fn socket_to_heap_id(&self, socket: i32) -> Option<usize> {
        self.heaps.read().by_socket(socket).map(|h| h.id())
    }

    // ------------------------------------------------------------------------
    // 分配与增长
    // ------------------------------------------------------------------------

    fn try_place(
        &self,
        h: &mut HeapInner,
        size: usize,
        align: usize,
        bound: usize,
        contig: bool,
    ) -> Option<usize> {
        if contig {
            let st = self.registry.read();
            h.alloc(size, align, bound, Some(&*st))
        } else {
            h.alloc(size, align, bound, None)
        }
    }

    fn alloc_on_heap(
        &self,
        heap: &Heap,
        size: usize,
        align: usize,
        bound: usize,
        contig: bool,
    ) -> MemResult<usize> {
        let mut h = heap.lock();
        h.check_live()?;
        if let Some(p) = self.try_place(&mut h, size, align, bound, contig) {
            return Ok(p);
        }
        let socket = h.socket_id();
        if h.is_external() || self.legacy_mem() {
            return Err(MemError::oom(size, socket, AllocFailure::GrowthDisabled));
        }
        self.grow_heap(&mut h, heap.id(), size, align, bound, contig)?;
        self.try_place(&mut h, size, align, bound, contig)
            .ok_or_else(|| MemError::oom(size, socket, AllocFailure::NoFit))
    }

    /// 按页规格从小到大尝试增长；否决立即失败
    fn grow_heap(
        &self,
        h: &mut HeapInner,
        heap_id: usize,
        size: usize,
        align: usize,
        bound: usize,
        contig: bool,
    ) -> MemResult<()> {
        let socket = h.socket_id();
        let page_sizes = self.registry.page_source().page_sizes().to_vec();
        let mut last_err = None;
        for pg in page_sizes {
            let mut need = size + (align - CACHE_LINE_SIZE);
            if bound > pg {
                need += bound;
            }
            let Some(alloc_sz) = checked_align_up(need, pg) else {
                continue;
            };
            match self.grow_once(h, heap_id, socket, pg, alloc_sz / pg, contig) {
                Ok(()) => return Ok(()),
                Err(e) if e.alloc_failure() == Some(AllocFailure::Vetoed) => return Err(e),
                Err(e) => {
                    log::debug!(
                        "growth of heap '{}' with {} pages failed: {e}",
                        h.name(),
                        format_bytes(pg as u64)
                    );
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| MemError::oom(size, socket, AllocFailure::GrowthFailed)))
    }

    fn grow_once(
        &self,
        h: &mut HeapInner,
        heap_id: usize,
        socket: i32,
        page_size: usize,
        n_pages: usize,
        contig: bool,
    ) -> MemResult<()> {
        let len = page_size * n_pages;
        h.ensure_room(1)
            .map_err(|_| MemError::oom(len, socket, AllocFailure::GrowthFailed))?;
        let mut st = self.registry.write();
        let current = h.mapped_size();
        self.callbacks.validate(socket, current, current + len)?;

        let run = self
            .registry
            .map_run(&mut st, socket, page_size, n_pages, heap_id)?;
        if contig && !run.is_iova_contig() {
            self.registry.rollback_run(&mut st, run);
            return Err(MemError::oom(len, socket, AllocFailure::GrowthFailed));
        }
        let maskbits = self.shared.dma_maskbits();
        if !run.fits_dma_mask(maskbits) {
            log::warn!("new pages on socket {socket} exceed the {maskbits}-bit DMA mask");
            self.registry.rollback_run(&mut st, run);
            return Err(MemError::oom(len, socket, AllocFailure::GrowthFailed));
        }
        let list = run.list();
        let (addr, len) = self.registry.commit_run(&mut st, run, SegmentFlags::empty());
        self.callbacks.notify(MemEvent::Alloc, addr, len);
        h.add_memory(addr, len, list)?;
        log::debug!(
            "heap '{}' grew by {} at 0x{addr:x}",
            h.name(),
            format_bytes(len as u64)
        );
        Ok(())
    }

    /// 在节点 `socket`（或任意节点、或具名堆的 socket id）上分配
    pub fn allocate(&self, socket: i32, req: AllocRequest) -> MemResult<NonNull<u8>> {
        let (size, align) = req.normalize()?;
        let mut first_err = None;
        for heap in self.heap_candidates(socket)? {
            match self.alloc_on_heap(&heap, size, align, req.bound, req.contig) {
                Ok(p) => {
                    // 块可能位于其他进程新发布的列表上
                    self.registry.refresh();
                    return to_ptr(p);
                }
                Err(e) if e.alloc_failure().is_some() => {
                    first_err.get_or_insert(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(first_err.unwrap_or_else(|| MemError::oom(size, socket, AllocFailure::NoFit)))
    }

    /// 分配当前能放下的最大块，不触发增长；返回 (指针, 大小)
    pub fn allocate_biggest(
        &self,
        socket: i32,
        align: usize,
        contig: bool,
    ) -> MemResult<(NonNull<u8>, usize)> {
        let align = normalize_align(align)?;
        for heap in self.heap_candidates(socket)? {
            let mut h = heap.lock();
            if h.check_live().is_err() {
                continue;
            }
            let got = if contig {
                let st = self.registry.read();
                h.alloc_biggest(align, Some(&*st))
            } else {
                h.alloc_biggest(align, None)
            };
            if let Some((p, size)) = got {
                drop(h);
                self.registry.refresh();
                return Ok((to_ptr(p)?, size));
            }
        }
        Err(MemError::oom(0, socket, AllocFailure::NoFit))
    }

    pub fn malloc(&self, size: usize, align: usize) -> MemResult<NonNull<u8>> {
        self.malloc_socket(size, align, SOCKET_ID_ANY)
    }

    pub fn malloc_socket(&self, size: usize, align: usize, socket: i32) -> MemResult<NonNull<u8>> {
        self.allocate(socket, AllocRequest::new(size).align(align))
    }

    pub fn zmalloc(&self, size: usize, align: usize) -> MemResult<NonNull<u8>> {
        self.zmalloc_socket(size, align, SOCKET_ID_ANY)
    }

    /// 分配并清零
    pub fn zmalloc_socket(&self, size: usize, align: usize, socket: i32) -> MemResult<NonNull<u8>> {
        let p = self.malloc_socket(size, align, socket)?;
        // SAFETY: 刚分配的元素至少 `size` 字节且独占
        unsafe { std::ptr::write_bytes(p.as_ptr(), 0, size) };
        Ok(p)
    }

    /// 元素的可用大小
    pub fn usable_size(&self, ptr: NonNull<u8>) -> MemResult<usize> {
        let addr = ptr.as_ptr() as usize;
        self.heap_of(addr)?.lock().usable_size(addr)
    }

    // ------------------------------------------------------------------------
    // 释放与调整
    // ------------------------------------------------------------------------

    /// 释放；未知指针与重复释放返回 `InvalidArgument`
    pub fn free(&self, ptr: NonNull<u8>) -> MemResult<()> {
        let addr = ptr.as_ptr() as usize;
        let heap = self.heap_of(addr)?;
        let mut h = heap.lock();
        h.check_live()?;
        let (free_addr, free_len) = h.free(addr)?;
        if !self.legacy_mem() && !h.is_external() {
            self.release_free_memory(&mut h, free_addr, free_len);
        }
        Ok(())
    }

    /// 把空闲元素中可归还的页还给页来源
    fn release_free_memory(&self, h: &mut HeapInner, addr: usize, len: usize) {
        let mut st = self.registry.write();
        let units = st.releasable_units(addr, len, self.config.match_allocations);
        for (unit, unit_len) in units {
            if let Err(e) = h.remove_range(unit, unit_len) {
                log::warn!("cannot take 0x{unit:x}+{unit_len} out of heap '{}': {e}", h.name());
                continue;
            }
            self.callbacks.notify(MemEvent::Free, unit, unit_len);
            if let Err(e) = self.registry.release_pages(&mut st, unit, unit_len) {
                log::error!("failed to release 0x{unit:x}+{unit_len}: {e}");
            }
        }
    }

    /// 原地调整大小；后继不够时失败，由调用方改用 [`Self::realloc`]
    pub fn resize(&self, ptr: NonNull<u8>, size: usize) -> MemResult<()> {
        if size == 0 {
            return Err(MemError::invalid("resize to zero bytes"));
        }
        let new_size = checked_align_up(size, CACHE_LINE_SIZE)
            .ok_or_else(|| MemError::invalid(format!("resize to {size} bytes overflows")))?;
        let addr = ptr.as_ptr() as usize;
        self.heap_of(addr)?.lock().resize(addr, new_size)
    }

    /// 原地调整失败时分配新块、拷贝并释放旧块
    pub fn realloc(
        &self,
        ptr: Option<NonNull<u8>>,
        size: usize,
        align: usize,
        socket: i32,
    ) -> MemResult<NonNull<u8>> {
        let Some(old) = ptr else {
            return self.malloc_socket(size, align, socket);
        };
        let align = normalize_align(align)?;
        let addr = old.as_ptr() as usize;
        let heap = self.heap_of(addr)?;
        let same_heap = socket == SOCKET_ID_ANY || self.heaps.read().by_socket(socket).is_some_and(|h| h.id() == heap.id());
        if same_heap && is_aligned(addr, align) && self.resize(old, size).is_ok() {
            return Ok(old);
        }
        let old_size = heap.lock().usable_size(addr)?;
        drop(heap);
        let new = self.malloc_socket(size, align, socket)?;
        // SAFETY: 两块内存都由本分配器持有且互不重叠
        unsafe { std::ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), old_size.min(size)) };
        self.free(old)?;
        Ok(new)
    }

    // ------------------------------------------------------------------------
    // 具名堆
    // ------------------------------------------------------------------------

    /// 创建具名外部堆，返回分配给它的 socket id
    pub fn create_heap(&self, name: &str) -> MemResult<i32> {
        if name.is_empty() || name.len() >= HEAP_NAME_MAX_LEN {
            return Err(MemError::invalid(format!(
                "heap name must be 1..{} bytes",
                HEAP_NAME_MAX_LEN - 1
            )));
        }
        let mut heaps = self.heaps.write();
        if heaps.by_name(name).is_some() {
            return Err(MemError::AlreadyExists(format!("heap '{name}'")));
        }
        let socket = self.shared.alloc_socket_id();
        heaps.insert(name, socket, true)?;
        log::info!("created heap '{name}' with socket id {socket}");
        Ok(socket)
    }

    /// 销毁具名堆；仍有占用元素时返回 `Busy`
    pub fn destroy_heap(&self, name: &str) -> MemResult<()> {
        let mut heaps = self.heaps.write();
        let heap = heaps
            .by_name(name)
            .ok_or_else(|| MemError::NotFound(format!("heap '{name}'")))?;
        let h = heap.lock();
        if !h.is_external() {
            return Err(MemError::invalid(format!("'{name}' is a socket heap")));
        }
        if h.alloc_count() > 0 {
            return Err(MemError::Busy(format!(
                "heap '{name}' has {} live allocations",
                h.alloc_count()
            )));
        }
        {
            let mut st = self.registry.write();
            let owned: Vec<_> = st
                .lists()
                .filter(|l| l.owner_heap == Some(heap.id()))
                .map(|l| l.id())
                .collect();
            for id in owned {
                self.registry.set_list_heap(&mut st, id, None);
            }
        }
        drop(h);
        heaps.remove(heap.id());
        log::info!("destroyed heap '{name}'");
        Ok(())
    }

    /// 具名堆的 socket id
    pub fn heap_get_socket(&self, name: &str) -> MemResult<i32> {
        Ok(self.heap_by_name(name)?.lock().socket_id())
    }

    /// 把调用方的内存注册为外部段列表并交给具名堆管理
    pub fn heap_add_external_memory(
        &self,
        name: &str,
        addr: usize,
        len: usize,
        iovas: &[u64],
        page_size: usize,
    ) -> MemResult<()> {
        let heap = self.heap_by_name(name)?;
        let mut h = heap.lock();
        h.check_live()?;
        if !h.is_external() {
            return Err(MemError::invalid(format!("'{name}' is a socket heap")));
        }
        h.ensure_room(1)?;
        let socket = h.socket_id();
        let mut st = self.registry.write();
        let id = self
            .registry
            .register_external_locked(&mut st, addr, len, iovas, page_size)?;
        if let Some(list) = st.list_mut(id) {
            list.socket_id = socket;
        }
        self.registry.set_list_heap(&mut st, id, Some(heap.id()));
        self.callbacks.notify(MemEvent::Alloc, addr, len);
        drop(st);
        h.add_memory(addr, len, id)?;
        log::info!(
            "heap '{name}': added external memory 0x{addr:x}+{}",
            format_bytes(len as u64)
        );
        Ok(())
    }

    /// 从具名堆中取回外部内存；区间内仍有占用元素时返回 `Busy`
    pub fn heap_remove_external_memory(&self, name: &str, addr: usize, len: usize) -> MemResult<()> {
        let heap = self.heap_by_name(name)?;
        let mut h = heap.lock();
        h.check_live()?;
        let mut st = self.registry.write();
        let id = match st.list_containing(addr) {
            Some(l) if l.owner_heap == Some(heap.id()) => l.id(),
            _ => return Err(MemError::NotFound(format!("external memory 0x{addr:x} in heap '{name}'"))),
        };
        h.remove_memory(addr, len)?;
        self.callbacks.notify(MemEvent::Free, addr, len);
        self.registry.set_list_heap(&mut st, id, None);
        self.registry.unregister_external_locked(&mut st, addr, len)?;
        log::info!("heap '{name}': removed external memory 0x{addr:x}");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // 统计与自检
    // ------------------------------------------------------------------------

    pub fn heap_stats(&self, name: &str) -> MemResult<HeapStats> {
        Ok(self.heap_by_name(name)?.lock().stats())
    }

    /// 某节点上所有堆的汇总
    pub fn socket_stats(&self, socket: i32) -> MemResult<SocketStats> {
        let heaps = self.heaps.read();
        let mut out = SocketStats::new(socket);
        for heap in heaps.all() {
            let h = heap.lock();
            if h.socket_id() == socket {
                out.add(&h.stats());
            }
        }
        if out.heap_count == 0 {
            return Err(MemError::invalid(format!("no heap for socket {socket}")));
        }
        Ok(out)
    }

    pub fn dump_stats(&self, out: &mut dyn Write) -> std::io::Result<()> {
        let heaps = self.heaps.read();
        for heap in heaps.all() {
            let h = heap.lock();
            let s = h.stats();
            writeln!(
                out,
                "heap '{}' socket {}: total={} free={} alloc={} greatest_free={} free_elems={} busy_elems={}",
                h.name(),
                h.socket_id(),
                s.heap_totalsz_bytes,
                s.heap_freesz_bytes,
                s.heap_allocsz_bytes,
                s.greatest_free_size,
                s.free_count,
                s.alloc_count
            )?;
        }
        Ok(())
    }

    pub fn dump_heaps(&self, out: &mut dyn Write) -> std::io::Result<()> {
        let heaps = self.heaps.read();
        for heap in heaps.all() {
            heap.lock().dump(out)?;
        }
        Ok(())
    }

    /// 逐个检查堆的元数据
    pub fn malloc_validate(&self) -> MemResult<()> {
        let heaps = self.heaps.read();
        for heap in heaps.all() {
            heap.lock().validate().map_err(MemError::Corrupted)?;
        }
        Ok(())
    }
}
