//! 堆
//!
//! 每个堆管理若干段列表中的地址区间，切分为空闲或占用的元素：
//!
//! - 元素按地址顺序双向链接，释放时与同一列表内相邻的空闲元素双向合并；
//! - 空闲元素按大小进入 13 个桶之一，分配从能容纳请求的最小桶开始，
//!   桶内首次适配；
//! - 分配总是从选中元素的低地址端切出，剩余的首尾部分留作空闲元素。
//!
//! 元素地址与大小都是 [`CACHE_LINE_SIZE`] 的整数倍，用户指针就是元素起始
//! 地址。堆不负责增长，缺页时由 [`crate::malloc`] 向注册表申请后调用
//! [`HeapInner::add_memory`]。
//!
//! 元数据是定长的纯数据（元素竞技场、按地址排序的索引、桶表头），放在共享
//! 配置区的堆槽位中，每个堆最多 [`MAX_HEAP_ELEMS`] 个元素。任何进程都可以
//! 在持有堆锁时分配或释放别的进程分配的内存。

pub(crate) mod element;
pub(crate) mod freelist;
pub(crate) mod index;

use std::cell::UnsafeCell;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use eal_common::utils::{align_down, align_up, crosses_boundary, format_bytes, is_aligned};

use crate::error::{MemError, MemResult};
use crate::registry::IovaOracle;
use crate::segment::ListId;
use crate::shared::{LockWord, SharedRegion, decode_name, encode_name};
use crate::sync::{LockRank, RankedMutex, RankedMutexGuard, SharedLockRef};
use crate::{CACHE_LINE_SIZE, HEAP_NAME_MAX_LEN, HEAP_NUM_FREELISTS, MAX_HEAP_ELEMS, MAX_HEAPS};

use element::{Elem, ElemArena, ElemId, ElemState};
use freelist::{FreeLists, free_list_index};
use index::AddrIndex;

/// 堆统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// 堆管理的全部内存
    pub heap_totalsz_bytes: usize,
    pub heap_freesz_bytes: usize,
    /// 占用元素大小之和
    pub heap_allocsz_bytes: usize,
    pub greatest_free_size: usize,
    pub free_count: usize,
    pub alloc_count: usize,
}

impl HeapStats {
    fn accumulate(&mut self, other: &HeapStats) {
        self.heap_totalsz_bytes += other.heap_totalsz_bytes;
        self.heap_freesz_bytes += other.heap_freesz_bytes;
        self.heap_allocsz_bytes += other.heap_allocsz_bytes;
        self.greatest_free_size = self.greatest_free_size.max(other.greatest_free_size);
        self.free_count += other.free_count;
        self.alloc_count += other.alloc_count;
    }
}

/// 某个节点上所有堆的汇总
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocketStats {
    pub socket_id: i32,
    pub heap_count: usize,
    pub totals: HeapStats,
}

impl SocketStats {
    pub(crate) fn new(socket_id: i32) -> Self {
        Self {
            socket_id,
            ..Default::default()
        }
    }

    pub(crate) fn add(&mut self, stats: &HeapStats) {
        self.heap_count += 1;
        self.totals.accumulate(stats);
    }
}

/// 堆的元素与计数，由堆锁保护
///
/// 纯数据布局，全零即空堆，整体放在共享配置区的堆槽位里，各进程看到的是
/// 同一份元数据。
#[repr(C)]
pub struct HeapInner {
    name: [u8; HEAP_NAME_MAX_LEN],
    socket_id: i32,
    external: bool,
    /// 槽位被销毁后置假，持有旧句柄的调用方据此失败
    live: bool,
    first: Option<ElemId>,
    last: Option<ElemId>,
    total_size: usize,
    alloc_count: usize,
    mapped_size: usize,
    free: FreeLists,
    by_addr: AddrIndex,
    elems: ElemArena,
}

impl HeapInner {
    /// 在原地把（已清空的）槽位初始化为一个新堆
    pub(crate) fn init(&mut self, name: &str, socket_id: i32, external: bool) {
        self.clear();
        self.name = encode_name(name);
        self.socket_id = socket_id;
        self.external = external;
        self.live = true;
    }

    /// 丢弃全部元素，回到空槽位状态
    pub(crate) fn clear(&mut self) {
        self.name = [0; HEAP_NAME_MAX_LEN];
        self.socket_id = 0;
        self.external = false;
        self.live = false;
        self.first = None;
        self.last = None;
        self.total_size = 0;
        self.alloc_count = 0;
        self.mapped_size = 0;
        self.free.clear();
        self.by_addr.clear();
        self.elems.clear();
    }

    pub fn name(&self) -> &str {
        decode_name(&self.name)
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    /// 堆已被销毁时返回 `NotFound`
    pub(crate) fn check_live(&self) -> MemResult<()> {
        if self.live {
            Ok(())
        } else {
            Err(MemError::NotFound("heap was destroyed".to_string()))
        }
    }

    pub(crate) fn ensure_room(&self, n: usize) -> MemResult<()> {
        if self.elems.vacancies() < n {
            log::warn!("heap '{}': element table full ({MAX_HEAP_ELEMS})", self.name());
            return Err(MemError::NoSpace("heap elements"));
        }
        Ok(())
    }

    pub fn socket_id(&self) -> i32 {
        self.socket_id
    }

    /// 具名外部堆，不会自动增长
    pub fn is_external(&self) -> bool {
        self.external
    }

    /// 占用元素大小之和
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn alloc_count(&self) -> usize {
        self.alloc_count
    }

    /// 加入本堆的内存总量
    pub fn mapped_size(&self) -> usize {
        self.mapped_size
    }

    /// 元素个数（空闲与占用）
    pub fn elem_count(&self) -> usize {
        self.elems.len()
    }

    /// 按地址顺序的 (地址, 大小, 是否空闲)
    pub fn elements(&self) -> Vec<(usize, usize, bool)> {
        self.iter()
            .map(|id| {
                let e = &self.elems[id];
                (e.addr, e.size, e.is_free())
            })
            .collect()
    }

    fn iter(&self) -> impl Iterator<Item = ElemId> + '_ {
        std::iter::successors(self.first, move |&id| self.elems[id].next)
    }

    // ------------------------------------------------------------------------
    // 地址链
    // ------------------------------------------------------------------------

    fn link(&mut self, id: ElemId) {
        let addr = self.elems[id].addr;
        let prev = self.by_addr.before(addr);
        let next = match prev {
            Some(p) => self.elems[p].next,
            None => self.first,
        };
        {
            let e = &mut self.elems[id];
            e.prev = prev;
            e.next = next;
        }
        match prev {
            Some(p) => self.elems[p].next = Some(id),
            None => self.first = Some(id),
        }
        match next {
            Some(n) => self.elems[n].prev = Some(id),
            None => self.last = Some(id),
        }
        self.by_addr.insert(addr, id);
    }

    /// 从桶、地址链和竞技场中移除
    fn unlink(&mut self, id: ElemId) -> Elem {
        self.free.remove(&mut self.elems, id);
        let (prev, next) = (self.elems[id].prev, self.elems[id].next);
        match prev {
            Some(p) => self.elems[p].next = next,
            None => self.first = next,
        }
        match next {
            Some(n) => self.elems[n].prev = prev,
            None => self.last = prev,
        }
        let Some(elem) = self.elems.remove(id) else {
            unreachable!("unlinked element {id:?} vanished")
        };
        self.by_addr.remove(elem.addr);
        elem
    }

    fn insert_free(&mut self, addr: usize, size: usize, list: ListId) -> ElemId {
        let id = self.elems.insert(Elem::new(addr, size, list));
        self.link(id);
        id
    }

    /// 与相邻空闲元素合并；`id` 必须空闲且不在桶中，返回合并后的元素
    fn join_free(&mut self, id: ElemId) -> ElemId {
        if let Some(n) = self.elems[id].next
            && self.elems[n].is_free()
            && self.elems[id].adjoins(&self.elems[n])
        {
            let absorbed = self.unlink(n);
            self.elems[id].size += absorbed.size;
        }
        if let Some(p) = self.elems[id].prev
            && self.elems[p].is_free()
            && self.elems[p].adjoins(&self.elems[id])
        {
            self.free.remove(&mut self.elems, p);
            let absorbed = self.unlink(id);
            self.elems[p].size += absorbed.size;
            return p;
        }
        id
    }

    // ------------------------------------------------------------------------
    // 内存加入与移除
    // ------------------------------------------------------------------------

    /// 把 `[addr, addr + len)` 作为空闲内存加入本堆
    pub(crate) fn add_memory(&mut self, addr: usize, len: usize, list: ListId) -> MemResult<()> {
        debug_assert!(is_aligned(addr, CACHE_LINE_SIZE) && is_aligned(len, CACHE_LINE_SIZE));
        self.ensure_room(1)?;
        let id = self.insert_free(addr, len, list);
        self.mapped_size += len;
        let id = self.join_free(id);
        self.free.insert(&mut self.elems, id);
        log::debug!(
            "heap '{}': added {} at 0x{addr:x}",
            self.name(),
            format_bytes(len as u64)
        );
        Ok(())
    }

    /// 从本堆移除 `[addr, addr + len)`；区间必须完全落在一个空闲元素内
    pub(crate) fn remove_range(&mut self, addr: usize, len: usize) -> MemResult<()> {
        let id = self
            .by_addr
            .at_or_before(addr)
            .ok_or_else(|| MemError::NotFound(format!("heap memory at 0x{addr:x}")))?;
        let (start, end, list, free) = {
            let e = &self.elems[id];
            (e.addr, e.end(), e.list, e.is_free())
        };
        if addr + len > end {
            return Err(MemError::NotFound(format!("heap memory at 0x{addr:x}+{len}")));
        }
        if !free {
            return Err(MemError::Busy(format!("heap memory at 0x{addr:x} is in use")));
        }
        // 移除一个元素后最多补回首尾两个
        if addr > start && addr + len < end {
            self.ensure_room(1)?;
        }
        self.unlink(id);
        if addr > start {
            let lead = self.insert_free(start, addr - start, list);
            self.free.insert(&mut self.elems, lead);
        }
        if addr + len < end {
            let trail = self.insert_free(addr + len, end - addr - len, list);
            self.free.insert(&mut self.elems, trail);
        }
        self.mapped_size -= len;
        Ok(())
    }

    /// 完全空闲且恰好覆盖 `[addr, addr + len)` 的元素存在时移除它
    pub(crate) fn remove_memory(&mut self, addr: usize, len: usize) -> MemResult<()> {
        let id = self
            .by_addr
            .get(addr)
            .ok_or_else(|| MemError::NotFound(format!("heap memory at 0x{addr:x}")))?;
        let e = &self.elems[id];
        if !e.is_free() || e.size != len {
            return Err(MemError::Busy(format!(
                "heap '{}' still has allocations in 0x{addr:x}+{len}",
                self.name()
            )));
        }
        self.remove_range(addr, len)
    }

    // ------------------------------------------------------------------------
    // 分配
    // ------------------------------------------------------------------------

    /// 在元素内按对齐与边界找到放置地址
    fn place_in(
        &self,
        id: ElemId,
        size: usize,
        align: usize,
        bound: usize,
        contig: Option<&dyn IovaOracle>,
    ) -> Option<usize> {
        let e = &self.elems[id];
        let mut p = align_up(e.addr, align);
        if crosses_boundary(p, size, bound) {
            p = align_up(p, bound);
        }
        if p.checked_add(size)? > e.end() {
            return None;
        }
        if let Some(oracle) = contig
            && !oracle.is_iova_contig(p, size)
        {
            return None;
        }
        Some(p)
    }

    fn find_fit(
        &self,
        size: usize,
        align: usize,
        bound: usize,
        contig: Option<&dyn IovaOracle>,
    ) -> Option<(ElemId, usize)> {
        (free_list_index(size)..HEAP_NUM_FREELISTS).find_map(|idx| {
            self.free.iter(&self.elems, idx).find_map(|id| {
                if self.elems[id].size < size {
                    return None;
                }
                self.place_in(id, size, align, bound, contig).map(|p| (id, p))
            })
        })
    }

    /// 把空闲元素 `id` 中 `[p, p + size)` 切出为占用元素
    fn carve(&mut self, id: ElemId, p: usize, size: usize) -> ElemId {
        self.free.remove(&mut self.elems, id);
        let (start, end, list) = {
            let e = &self.elems[id];
            (e.addr, e.end(), e.list)
        };
        let mut busy = id;
        if p > start {
            self.elems[id].size = p - start;
            self.free.insert(&mut self.elems, id);
            busy = self.insert_free(p, end - p, list);
        }
        if p + size < end {
            self.elems[busy].size = size;
            let trail = self.insert_free(p + size, end - p - size, list);
            self.free.insert(&mut self.elems, trail);
        }
        self.elems[busy].state = ElemState::Busy;
        self.total_size += size;
        self.alloc_count += 1;
        busy
    }

    /// 分配；参数已由调用方校验，`size` 已按缓存行取整
    pub(crate) fn alloc(
        &mut self,
        size: usize,
        align: usize,
        bound: usize,
        contig: Option<&dyn IovaOracle>,
    ) -> Option<usize> {
        if self.elems.vacancies() < 2 {
            return None;
        }
        let (id, p) = self.find_fit(size, align, bound, contig)?;
        self.carve(id, p, size);
        Some(p)
    }

    /// 分配当前能放下的最大块；返回 (地址, 大小)
    pub(crate) fn alloc_biggest(
        &mut self,
        align: usize,
        contig: Option<&dyn IovaOracle>,
    ) -> Option<(usize, usize)> {
        if self.elems.vacancies() < 2 {
            return None;
        }
        let mut best: Option<(ElemId, usize, usize)> = None;
        for idx in 0..HEAP_NUM_FREELISTS {
            for id in self.free.iter(&self.elems, idx) {
                let e = &self.elems[id];
                let p = align_up(e.addr, align);
                if p >= e.end() {
                    continue;
                }
                let avail = align_down(e.end() - p, CACHE_LINE_SIZE);
                if avail == 0 || best.is_some_and(|(_, _, b)| b >= avail) {
                    continue;
                }
                if let Some(oracle) = contig
                    && !oracle.is_iova_contig(p, avail)
                {
                    continue;
                }
                best = Some((id, p, avail));
            }
        }
        let (id, p, size) = best?;
        self.carve(id, p, size);
        Some((p, size))
    }

    fn busy_at(&self, addr: usize) -> MemResult<ElemId> {
        let id = self
            .by_addr
            .get(addr)
            .ok_or_else(|| MemError::invalid(format!("0x{addr:x} was not allocated from heap '{}'", self.name())))?;
        if self.elems[id].is_free() {
            return Err(MemError::invalid(format!("double free of 0x{addr:x}")));
        }
        Ok(id)
    }

    /// 占用元素的大小
    pub(crate) fn usable_size(&self, addr: usize) -> MemResult<usize> {
        self.busy_at(addr).map(|id| self.elems[id].size)
    }

    /// 释放；返回合并后空闲元素的 (地址, 大小)
    pub(crate) fn free(&mut self, addr: usize) -> MemResult<(usize, usize)> {
        let id = self.busy_at(addr)?;
        let size = self.elems[id].size;
        self.elems[id].state = ElemState::Free;
        self.total_size -= size;
        self.alloc_count -= 1;
        let id = self.join_free(id);
        self.free.insert(&mut self.elems, id);
        let e = &self.elems[id];
        Ok((e.addr, e.size))
    }

    /// 原地调整大小：缩小时尾部归还，增大时只从紧邻的空闲后继中借
    pub(crate) fn resize(&mut self, addr: usize, new_size: usize) -> MemResult<()> {
        let id = self.busy_at(addr)?;
        let (cur, list) = (self.elems[id].size, self.elems[id].list);
        if new_size == cur {
            return Ok(());
        }
        if new_size < cur {
            self.ensure_room(1)?;
            let rest = cur - new_size;
            self.elems[id].size = new_size;
            self.total_size -= rest;
            let trail = self.insert_free(addr + new_size, rest, list);
            let trail = self.join_free(trail);
            self.free.insert(&mut self.elems, trail);
            return Ok(());
        }

        let need = new_size - cur;
        let next = self.elems[id]
            .next
            .filter(|&n| {
                let (e, ne) = (&self.elems[id], &self.elems[n]);
                ne.is_free() && e.adjoins(ne) && ne.size >= need
            })
            .ok_or_else(|| MemError::oom(new_size, self.socket_id, crate::AllocFailure::NoFit))?;
        if self.elems[next].size == need {
            self.unlink(next);
        } else {
            self.free.remove(&mut self.elems, next);
            let old = self.elems[next].addr;
            self.by_addr.remove(old);
            self.elems[next].addr += need;
            self.elems[next].size -= need;
            self.by_addr.insert(old + need, next);
            self.free.insert(&mut self.elems, next);
        }
        self.elems[id].size = new_size;
        self.total_size += need;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // 统计与自检
    // ------------------------------------------------------------------------

    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            heap_totalsz_bytes: self.mapped_size,
            heap_allocsz_bytes: self.total_size,
            alloc_count: self.alloc_count,
            free_count: self.free.total(),
            ..Default::default()
        };
        for idx in 0..HEAP_NUM_FREELISTS {
            for id in self.free.iter(&self.elems, idx) {
                let size = self.elems[id].size;
                stats.heap_freesz_bytes += size;
                stats.greatest_free_size = stats.greatest_free_size.max(size);
            }
        }
        stats
    }

    pub fn dump(&self, out: &mut dyn Write) -> std::io::Result<()> {
        let s = self.stats();
        writeln!(
            out,
            "heap '{}' socket={}{}: total={} alloc={} free={} busy_elems={} free_elems={}",
            self.name(),
            self.socket_id,
            if self.external { " external" } else { "" },
            format_bytes(s.heap_totalsz_bytes as u64),
            format_bytes(s.heap_allocsz_bytes as u64),
            format_bytes(s.heap_freesz_bytes as u64),
            s.alloc_count,
            s.free_count,
        )?;
        for idx in 0..HEAP_NUM_FREELISTS {
            if self.free.count(idx) > 0 {
                writeln!(out, "  bucket {idx}: {} elements", self.free.count(idx))?;
            }
        }
        for id in self.iter() {
            let e = &self.elems[id];
            writeln!(
                out,
                "  0x{:x} size={} {} {}",
                e.addr,
                e.size,
                if e.is_free() { "free" } else { "busy" },
                e.list
            )?;
        }
        Ok(())
    }

    /// 检查元数据一致性
    pub fn validate(&self) -> Result<(), String> {
        let name = self.name();
        let mut count = 0;
        let mut busy_size = 0;
        let mut busy_count = 0;
        let mut all_size = 0;
        let mut free_count = 0;
        let mut prev: Option<ElemId> = None;
        for id in self.iter() {
            let e = &self.elems[id];
            count += 1;
            if count > self.elems.len() {
                return Err(format!("heap '{name}': address chain loops"));
            }
            if e.prev != prev {
                return Err(format!("heap '{name}': broken back link at 0x{:x}", e.addr));
            }
            if !is_aligned(e.addr, CACHE_LINE_SIZE) || !is_aligned(e.size, CACHE_LINE_SIZE) || e.size == 0 {
                return Err(format!("heap '{name}': misaligned element 0x{:x}+{}", e.addr, e.size));
            }
            if self.by_addr.get(e.addr) != Some(id) {
                return Err(format!("heap '{name}': element 0x{:x} not indexed", e.addr));
            }
            if let Some(p) = prev {
                let pe = &self.elems[p];
                if pe.end() > e.addr {
                    return Err(format!("heap '{name}': elements overlap at 0x{:x}", e.addr));
                }
                if pe.is_free() && e.is_free() && pe.adjoins(e) {
                    return Err(format!("heap '{name}': adjacent free elements at 0x{:x}", e.addr));
                }
            }
            match e.state {
                ElemState::Free => {
                    free_count += 1;
                    if e.bucket() != Some(free_list_index(e.size)) {
                        return Err(format!("heap '{name}': free element 0x{:x} in wrong bucket", e.addr));
                    }
                }
                ElemState::Busy => {
                    busy_count += 1;
                    busy_size += e.size;
                    if e.bucket().is_some() {
                        return Err(format!("heap '{name}': busy element 0x{:x} on a free list", e.addr));
                    }
                }
                ElemState::Vacant => {
                    return Err(format!("heap '{name}': vacant slot linked at 0x{:x}", e.addr));
                }
            }
            all_size += e.size;
            prev = Some(id);
        }
        if prev != self.last {
            return Err(format!("heap '{name}': last element mismatch"));
        }
        if count != self.elems.len() || count != self.by_addr.len() {
            return Err(format!("heap '{name}': {count} linked elements, {} stored", self.elems.len()));
        }
        let bucketed: usize = (0..HEAP_NUM_FREELISTS)
            .map(|idx| self.free.iter(&self.elems, idx).count())
            .sum();
        if bucketed != free_count || self.free.total() != free_count {
            return Err(format!("heap '{name}': {free_count} free elements, {bucketed} bucketed"));
        }
        if busy_size != self.total_size || busy_count != self.alloc_count {
            return Err(format!(
                "heap '{name}': counters {}/{} disagree with elements {busy_size}/{busy_count}",
                self.total_size, self.alloc_count
            ));
        }
        if all_size != self.mapped_size {
            return Err(format!("heap '{name}': mapped size {} but elements cover {all_size}", self.mapped_size));
        }
        Ok(())
    }
}

// ============================================================================
// 堆与堆表
// ============================================================================

const SLOT_FREE: u32 = 0;
const SLOT_LIVE: u32 = 1;

/// 堆表查找用的键，受堆表锁保护
#[repr(C)]
#[derive(Clone, Copy)]
struct HeapKey {
    name: [u8; HEAP_NAME_MAX_LEN],
    socket_id: i32,
}

/// 共享配置区中的一个堆槽位
#[repr(C)]
#[derive(Debug)]
pub(crate) struct HeapSlot {
    /// 堆锁的跨进程锁字
    pub(crate) lock: AtomicI32,
    state: AtomicU32,
    key: UnsafeCell<HeapKey>,
    data: UnsafeCell<HeapInner>,
}

impl HeapSlot {
    fn is_live(&self) -> bool {
        self.state.load(Ordering::Acquire) == SLOT_LIVE
    }
}

/// 一个堆的句柄
///
/// 元数据在共享配置区的槽位里；进程内互斥锁之外还要拿槽位上的锁字，
/// 各进程对同一个堆的修改因此互斥。
pub struct Heap {
    id: usize,
    lock: RankedMutex<()>,
    region: Arc<SharedRegion>,
}

impl Heap {
    fn new(id: usize, region: Arc<SharedRegion>) -> Self {
        Self {
            id,
            lock: RankedMutex::with_shared(
                LockRank::Heap,
                SharedLockRef::new(region.clone(), LockWord::Heap(id)),
                (),
            ),
            region,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn lock(&self) -> HeapGuard<'_> {
        let guard = self.lock.lock();
        let cell = &self.region.heap_slot(self.id).data;
        // SAFETY: 进程内锁与跨进程锁字都已持有，槽位数据此刻只有本守卫访问
        let inner = unsafe { &mut *cell.get() };
        HeapGuard {
            inner,
            _guard: guard,
        }
    }
}

/// 持有堆锁期间对堆元数据的独占访问
pub struct HeapGuard<'a> {
    inner: &'a mut HeapInner,
    _guard: RankedMutexGuard<'a, ()>,
}

impl std::ops::Deref for HeapGuard<'_> {
    type Target = HeapInner;
    fn deref(&self) -> &HeapInner {
        self.inner
    }
}

impl std::ops::DerefMut for HeapGuard<'_> {
    fn deref_mut(&mut self) -> &mut HeapInner {
        self.inner
    }
}

/// 堆表，由 heap table 锁保护
///
/// 每个槽位预先建好句柄；哪些槽位在用、名字与 socket id 都读自共享区，
/// 所以其他进程创建的堆同样可见。
pub(crate) struct HeapTable {
    region: Arc<SharedRegion>,
    handles: Vec<Arc<Heap>>,
}

impl HeapTable {
    pub fn new(region: Arc<SharedRegion>) -> Self {
        let handles = (0..MAX_HEAPS)
            .map(|id| Arc::new(Heap::new(id, region.clone())))
            .collect();
        Self { region, handles }
    }

    fn slot(&self, id: usize) -> &HeapSlot {
        self.region.heap_slot(id)
    }

    fn key(&self, id: usize) -> Option<HeapKey> {
        let slot = self.slot(id);
        // SAFETY: 本表只能经由 heap table 锁访问，键只在写锁下修改
        slot.is_live().then(|| unsafe { *slot.key.get() })
    }

    pub fn insert(&mut self, name: &str, socket_id: i32, external: bool) -> MemResult<Arc<Heap>> {
        if self.by_name(name).is_some() {
            return Err(MemError::AlreadyExists(format!("heap '{name}'")));
        }
        let id = (0..MAX_HEAPS)
            .find(|&i| !self.slot(i).is_live())
            .ok_or(MemError::NoSpace("heaps"))?;
        let heap = self.handles[id].clone();
        heap.lock().init(name, socket_id, external);
        let slot = self.slot(id);
        // SAFETY: 持有 heap table 写锁
        unsafe {
            *slot.key.get() = HeapKey {
                name: encode_name(name),
                socket_id,
            }
        };
        slot.state.store(SLOT_LIVE, Ordering::Release);
        Ok(heap)
    }

    pub fn remove(&mut self, id: usize) -> Option<Arc<Heap>> {
        let heap = self.get(id)?;
        self.slot(id).state.store(SLOT_FREE, Ordering::Release);
        heap.lock().clear();
        Some(heap)
    }

    pub fn get(&self, id: usize) -> Option<Arc<Heap>> {
        (id < MAX_HEAPS && self.slot(id).is_live()).then(|| self.handles[id].clone())
    }

    fn position(&self, pred: impl Fn(&HeapKey) -> bool) -> Option<usize> {
        (0..MAX_HEAPS).find(|&i| self.key(i).is_some_and(|k| pred(&k)))
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<Heap>> {
        self.position(|k| decode_name(&k.name) == name)
            .and_then(|i| self.get(i))
    }

    pub fn by_socket(&self, socket_id: i32) -> Option<Arc<Heap>> {
        self.position(|k| k.socket_id == socket_id)
            .and_then(|i| self.get(i))
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<Heap>> {
        self.handles.iter().filter(|h| self.slot(h.id).is_live())
    }
}
