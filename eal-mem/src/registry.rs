//! 段注册表
//!
//! 持有本进程看到的全部段列表（自己创建的、注册的外部内存、挂接的外部内存，
//! 以及其他进程创建的列表的镜像），由 hotplug 锁保护：结构变化持写锁，遍历
//! 与查询持读锁。每个列表在共享区里有一个描述符槽位，版本号随结构变化递增；
//! 每页的状态记在列表自己的 [`SegmentTable`] 里。
//!
//! 取锁时先比较共享区的列表代数，落后就按段表把其他进程的列表映射到相同
//! 地址，或撤掉已经消失的页。
//!
//! 增长分两步：[`SegmentRegistry::map_run`] 把页映射到一段空槽位上，
//! 检查通过后 [`SegmentRegistry::commit_run`] 才写入列表；失败则
//! [`SegmentRegistry::rollback_run`] 撤销映射，不留下任何已提交状态。

use std::collections::HashMap;
use std::io::Write;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use eal_common::utils::{format_bytes, is_aligned};
use eal_osal::VaReservation;

use crate::error::{AllocFailure, MemError, MemResult};
use crate::page_source::{MappedPage, PageRequest, PageSource, SegmentFd};
use crate::seg_table::SegmentTable;
use crate::segment::{
    ListId, MemorySegment, SegmentFlags, SegmentList, SegmentListInfo, WalkOutcome, WalkStep,
};
use crate::shared::{ListDescriptor, LockWord, SharedRegion};
use crate::sync::{LockRank, RankedReadGuard, RankedRwLock, RankedWriteGuard, SharedLockRef};
use crate::{BAD_IOVA, MAX_MEMSEG_LISTS};

/// IOVA 连续性查询，堆分配带 `contig` 要求时使用
pub trait IovaOracle {
    fn is_iova_contig(&self, addr: usize, len: usize) -> bool;
}

/// 不检查连续性
pub struct AlwaysContig;

impl IovaOracle for AlwaysContig {
    fn is_iova_contig(&self, _addr: usize, _len: usize) -> bool {
        true
    }
}

/// hotplug 锁保护的注册表状态
pub struct RegistryState {
    lists: Vec<Option<SegmentList>>,
    tables: Vec<Option<SegmentTable>>,
    fds: HashMap<(ListId, usize), SegmentFd>,
    /// 每个描述符槽位最近一次处理过的 (认领代数, 版本)
    seen: Vec<(u64, u64)>,
    /// 镜像页映射时段表里的代数
    mirror_gens: HashMap<(ListId, usize), u32>,
}

impl std::fmt::Debug for RegistryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryState")
            .field("lists", &self.lists().count())
            .field("fds", &self.fds.len())
            .finish()
    }
}

impl RegistryState {
    fn new() -> Self {
        Self {
            lists: (0..MAX_MEMSEG_LISTS).map(|_| None).collect(),
            tables: (0..MAX_MEMSEG_LISTS).map(|_| None).collect(),
            fds: HashMap::new(),
            seen: vec![(0, 0); MAX_MEMSEG_LISTS],
            mirror_gens: HashMap::new(),
        }
    }

    pub fn lists(&self) -> impl Iterator<Item = &SegmentList> {
        self.lists.iter().flatten()
    }

    pub fn list(&self, id: ListId) -> Option<&SegmentList> {
        self.lists.get(id.index()).and_then(|l| l.as_ref())
    }

    pub(crate) fn list_mut(&mut self, id: ListId) -> Option<&mut SegmentList> {
        self.lists.get_mut(id.index()).and_then(|l| l.as_mut())
    }

    pub fn list_containing(&self, addr: usize) -> Option<&SegmentList> {
        self.lists().find(|l| l.contains(addr))
    }

    pub fn segment_at(&self, addr: usize) -> Option<(&SegmentList, &MemorySegment)> {
        let list = self.list_containing(addr)?;
        let seg = list.segment(list.slot_of(addr)?)?;
        Some((list, seg))
    }

    fn overlaps(&self, addr: usize, len: usize) -> bool {
        self.lists()
            .any(|l| addr < l.end() && l.base < addr + len)
    }

    /// `[addr, addr + len)` 中可以归还给 OS 的单元（页，或匹配模式下的整段增长）
    ///
    /// 只有创建列表的进程归还它的页。
    pub(crate) fn releasable_units(
        &self,
        addr: usize,
        len: usize,
        match_allocations: bool,
    ) -> Vec<(usize, usize)> {
        let Some(list) = self.list_containing(addr) else {
            return Vec::new();
        };
        if list.external || list.attached || list.mirrored {
            return Vec::new();
        }
        let end = addr + len;
        let pg = list.page_size;
        let free_page = |a: usize| {
            list.slot_of(a)
                .and_then(|i| list.segment(i))
                .is_some_and(|s| !s.flags.contains(SegmentFlags::DO_NOT_FREE))
        };

        if match_allocations {
            let Some(table) = self.tables[list.id.index()].as_ref() else {
                return Vec::new();
            };
            let first = (eal_common::align_up(addr, pg) - list.base) / pg;
            return (first..list.capacity())
                .take_while(|&s| list.slot_addr(s) < end)
                .filter_map(|s| {
                    let n = table.run(s);
                    (n > 0).then(|| (list.slot_addr(s), n * pg))
                })
                .filter(|&(a, l)| a + l <= end && (a..a + l).step_by(pg).all(&free_page))
                .collect();
        }

        let first = eal_common::align_up(addr, pg);
        let last = eal_common::align_down(end, pg);
        let mut units: Vec<(usize, usize)> = Vec::new();
        let mut a = first;
        while a < last {
            if free_page(a) {
                // 相邻页合并成一个单元
                match units.last_mut() {
                    Some((s, l)) if *s + *l == a => *l += pg,
                    _ => units.push((a, pg)),
                }
            }
            a += pg;
        }
        units
    }
}

impl IovaOracle for RegistryState {
    fn is_iova_contig(&self, addr: usize, len: usize) -> bool {
        self.list_containing(addr)
            .is_some_and(|l| l.is_iova_contig(addr, len))
    }
}

/// 已映射、未提交的一段页
#[derive(Debug)]
pub(crate) struct PendingRun {
    list: ListId,
    first_slot: usize,
    page_size: usize,
    socket_id: i32,
    pages: Vec<MappedPage>,
    created_list: bool,
}

impl PendingRun {
    pub(crate) fn addr(&self, st: &RegistryState) -> usize {
        st.list(self.list)
            .map(|l| l.slot_addr(self.first_slot))
            .unwrap_or(0)
    }

    pub(crate) fn len(&self) -> usize {
        self.pages.len() * self.page_size
    }

    pub(crate) fn list(&self) -> ListId {
        self.list
    }

    /// IOVA 是否连续
    pub(crate) fn is_iova_contig(&self) -> bool {
        self.pages.windows(2).all(|w| {
            w[0].iova != BAD_IOVA && w[1].iova == w[0].iova + self.page_size as u64
        }) && self.pages.first().is_some_and(|p| p.iova != BAD_IOVA)
    }

    /// 所有页的 IOVA 都落在 `maskbits` 位以内
    pub(crate) fn fits_dma_mask(&self, maskbits: u32) -> bool {
        maskbits == 0
            || maskbits >= 64
            || self
                .pages
                .iter()
                .all(|p| p.iova != BAD_IOVA && (p.iova + self.page_size as u64 - 1) >> maskbits == 0)
    }
}

/// 段注册表
pub struct SegmentRegistry {
    state: RankedRwLock<RegistryState>,
    source: Arc<dyn PageSource>,
    shared: Arc<SharedRegion>,
    segs_per_list: usize,
    base_hint: usize,
    /// 最近一次同步时共享区的列表代数
    synced: AtomicU64,
    /// 本进程创建了共享区，退出时收回自己的全部列表
    owns_region: bool,
}

impl SegmentRegistry {
    pub(crate) fn new(
        source: Arc<dyn PageSource>,
        shared: Arc<SharedRegion>,
        segs_per_list: usize,
        base_hint: usize,
        owns_region: bool,
    ) -> Self {
        Self {
            state: RankedRwLock::with_shared(
                LockRank::Hotplug,
                SharedLockRef::new(shared.clone(), LockWord::Hotplug),
                RegistryState::new(),
            ),
            source,
            shared,
            segs_per_list,
            base_hint,
            synced: AtomicU64::new(u64::MAX),
            owns_region,
        }
    }

    pub fn page_source(&self) -> &dyn PageSource {
        &*self.source
    }

    fn is_stale(&self) -> bool {
        self.synced.load(Ordering::Acquire) != self.shared.list_generation()
    }

    /// 把其他进程发布的列表变化同步到本地视图
    pub(crate) fn refresh(&self) {
        if self.is_stale() {
            drop(self.write());
        }
    }

    /// hotplug 读锁；视图落后于共享区时先同步
    pub fn read(&self) -> RankedReadGuard<'_, RegistryState> {
        self.refresh();
        self.state.read()
    }

    /// hotplug 写锁，取得后视图与共享区一致
    pub(crate) fn write(&self) -> RankedWriteGuard<'_, RegistryState> {
        let mut st = self.state.write();
        self.sync_locked(&mut st);
        st
    }

    /// 调用方已持有 hotplug 锁时使用
    ///
    /// # Safety
    ///
    /// 见 [`RankedRwLock::data_unlocked`]。
    pub unsafe fn state_thread_unsafe(&self) -> &RegistryState {
        // SAFETY: 由调用方保证
        unsafe { self.state.data_unlocked() }
    }

    // ------------------------------------------------------------------------
    // 跨进程同步
    // ------------------------------------------------------------------------

    /// 发布本进程列表的变化
    fn publish(&self, st: &mut RegistryState, info: &SegmentListInfo) {
        let idx = info.id.index();
        st.seen[idx] = (self.shared.list_epoch(idx), self.shared.publish_list(info));
        self.synced
            .store(self.shared.list_generation(), Ordering::Release);
    }

    /// 交还本进程的列表槽位
    fn retire(&self, st: &mut RegistryState, idx: usize) {
        st.lists[idx] = None;
        if let Some(table) = st.tables[idx].take() {
            table.unlink();
        }
        st.fds.retain(|&(id, _), _| id.index() != idx);
        self.source.release_list(ListId(idx as u16));
        self.shared.release_list_slot(idx);
        st.seen[idx] = (self.shared.list_epoch(idx), self.shared.list_version(idx));
        self.synced
            .store(self.shared.list_generation(), Ordering::Release);
    }

    fn sync_locked(&self, st: &mut RegistryState) {
        let generation = self.shared.list_generation();
        if self.synced.load(Ordering::Acquire) == generation {
            return;
        }
        for idx in 0..MAX_MEMSEG_LISTS {
            let mirror = match st.lists[idx].as_ref() {
                Some(l) if !l.mirrored => continue,
                Some(l) => Some((l.epoch, l.base, l.page_size)),
                None => None,
            };
            let desc = self.shared.list_descriptor(idx).filter(|d| !d.external);
            match (desc, mirror) {
                (None, None) => {}
                (None, Some(_)) => self.drop_mirror(st, idx),
                (Some(d), Some(m)) if m == (d.epoch, d.base, d.page_size) => {
                    if (d.epoch, d.version) != st.seen[idx] {
                        self.refresh_mirror(st, &d);
                    }
                }
                (Some(d), m) => {
                    if m.is_some() {
                        self.drop_mirror(st, idx);
                    }
                    if (d.epoch, d.version) != st.seen[idx] || m.is_some() {
                        self.create_mirror(st, &d);
                    }
                }
            }
        }
        self.synced.store(generation, Ordering::Release);
    }

    /// 在相同地址预留另一个进程的列表并映射它已有的页
    fn create_mirror(&self, st: &mut RegistryState, d: &ListDescriptor) {
        let idx = d.index;
        st.seen[idx] = (d.epoch, d.version);
        let Some(path) = self.shared.list_table_path(idx) else {
            log::debug!("msl{idx} lives in an in-process region, not mirrored");
            return;
        };
        let reservation = match VaReservation::reserve_exact(d.base, d.len) {
            Ok(r) => r,
            Err(e) => {
                log::error!(
                    "cannot mirror msl{idx} at 0x{:x}+{}: {e}",
                    d.base,
                    format_bytes(d.len as u64)
                );
                return;
            }
        };
        let table = match SegmentTable::open(&path, d.capacity) {
            Ok(t) => t,
            Err(e) => {
                log::error!("cannot open segment table {}: {e}", path.display());
                return;
            }
        };
        let id = ListId(idx as u16);
        let mut list = SegmentList::reserved(id, d.page_size, d.socket_id, reservation);
        list.mirrored = true;
        list.epoch = d.epoch;
        st.lists[idx] = Some(list);
        st.tables[idx] = Some(table);
        log::debug!("mirroring {id} of pid {} at 0x{:x}", d.owner_pid, d.base);
        self.refresh_mirror(st, d);
    }

    /// 按段表补上新页、撤掉已释放或换过的页
    fn refresh_mirror(&self, st: &mut RegistryState, d: &ListDescriptor) {
        let (nchannel, nrank) = (self.shared.nchannel(), self.shared.nrank());
        let RegistryState {
            lists,
            tables,
            fds,
            seen,
            mirror_gens,
        } = st;
        let (Some(list), Some(table)) = (lists[d.index].as_mut(), tables[d.index].as_ref()) else {
            return;
        };
        list.heap = d.heap;
        list.owner_heap = d.owner_heap;
        for slot in 0..list.capacity() {
            let key = (list.id, slot);
            let want = table.get(slot);
            let generation = table.generation(slot);
            let stale = list.segment(slot).is_some()
                && (want.is_none() || mirror_gens.get(&key) != Some(&generation));
            let req = PageRequest::new(list.slot_addr(slot), list.page_size, list.socket_id, list.id, slot);
            if stale {
                list.remove(slot);
                fds.remove(&key);
                mirror_gens.remove(&key);
                if let Err(e) = self.source.detach_page(&req) {
                    log::warn!("detach of {} slot {slot} failed: {e}", list.id);
                }
            }
            let Some((iova, flags)) = want else {
                continue;
            };
            if list.segment(slot).is_some() {
                continue;
            }
            match self.source.attach_page(&req) {
                Ok(fd) => {
                    list.insert(
                        slot,
                        MemorySegment {
                            iova,
                            addr: req.addr,
                            len: list.page_size,
                            page_size: list.page_size,
                            socket_id: list.socket_id,
                            nchannel,
                            nrank,
                            flags,
                        },
                    );
                    mirror_gens.insert(key, generation);
                    if let Some(fd) = fd {
                        fds.insert(key, fd);
                    }
                }
                Err(e) => log::error!("cannot attach {} slot {slot}: {e}", list.id),
            }
        }
        list.version = d.version;
        seen[d.index] = (d.epoch, d.version);
    }

    fn drop_mirror(&self, st: &mut RegistryState, idx: usize) {
        if let Some(list) = st.lists[idx].take() {
            log::debug!("{} is gone, dropping its mirror", list.id);
        }
        st.tables[idx] = None;
        st.fds.retain(|&(id, _), _| id.index() != idx);
        st.mirror_gens.retain(|&(id, _), _| id.index() != idx);
        self.source.release_list(ListId(idx as u16));
    }

    // ------------------------------------------------------------------------
    // 增长与释放
    // ------------------------------------------------------------------------

    fn create_heap_list(
        &self,
        st: &mut RegistryState,
        socket_id: i32,
        page_size: usize,
        n_pages: usize,
        heap_id: usize,
    ) -> MemResult<ListId> {
        let capacity = self.segs_per_list.max(n_pages);
        let len = capacity
            .checked_mul(page_size)
            .ok_or_else(|| MemError::invalid("segment list too large"))?;
        let idx = self
            .shared
            .claim_list_slot()
            .ok_or_else(|| MemError::oom(len, socket_id, AllocFailure::GrowthFailed))?;
        let table = match SegmentTable::create(self.shared.list_table_path(idx).as_deref(), capacity) {
            Ok(t) => t,
            Err(e) => {
                self.shared.release_list_slot(idx);
                log::warn!("cannot create the segment table for msl{idx}: {e}");
                return Err(MemError::oom(len, socket_id, AllocFailure::GrowthFailed));
            }
        };
        let reservation = match VaReservation::reserve(len, page_size, self.base_hint) {
            Ok(r) => r,
            Err(e) => {
                table.unlink();
                self.shared.release_list_slot(idx);
                log::warn!("cannot reserve {} for a new segment list: {e}", format_bytes(len as u64));
                return Err(MemError::oom(len, socket_id, AllocFailure::GrowthFailed));
            }
        };
        let id = ListId(idx as u16);
        let mut list = SegmentList::reserved(id, page_size, socket_id, reservation);
        list.owner_heap = Some(heap_id);
        list.epoch = self.shared.list_epoch(idx);
        log::debug!(
            "created {id}: {} pages of {} on socket {socket_id} at 0x{:x}",
            capacity,
            format_bytes(page_size as u64),
            list.base
        );
        let info = list.info();
        st.lists[idx] = Some(list);
        st.tables[idx] = Some(table);
        self.publish(st, &info);
        Ok(id)
    }

    /// 在某个堆的列表中找 `n_pages` 个连续空槽位并映射
    pub(crate) fn map_run(
        &self,
        st: &mut RegistryState,
        socket_id: i32,
        page_size: usize,
        n_pages: usize,
        heap_id: usize,
    ) -> MemResult<PendingRun> {
        let found = st.lists().find_map(|l| {
            (l.heap
                && !l.external
                && !l.mirrored
                && l.owner_heap == Some(heap_id)
                && l.page_size == page_size
                && l.socket_id == socket_id)
                .then(|| l.find_free_run(n_pages).map(|s| (l.id, s)))
                .flatten()
        });
        let (list_id, first_slot, created_list) = match found {
            Some((id, slot)) => (id, slot, false),
            None => {
                let id = self.create_heap_list(st, socket_id, page_size, n_pages, heap_id)?;
                (id, 0, true)
            }
        };

        let base = st
            .list(list_id)
            .map(|l| l.slot_addr(first_slot))
            .ok_or_else(|| MemError::NotFound(list_id.to_string()))?;
        let mut run = PendingRun {
            list: list_id,
            first_slot,
            page_size,
            socket_id,
            pages: Vec::with_capacity(n_pages),
            created_list,
        };
        for i in 0..n_pages {
            let req = PageRequest::new(
                base + i * page_size,
                page_size,
                socket_id,
                list_id,
                first_slot + i,
            );
            match self.source.map_page(&req) {
                Ok(page) => run.pages.push(page),
                Err(e) => {
                    self.rollback_run(st, run);
                    return Err(e);
                }
            }
        }
        Ok(run)
    }

    /// 撤销未提交的映射
    pub(crate) fn rollback_run(&self, st: &mut RegistryState, run: PendingRun) {
        let Some(list) = st.list(run.list) else {
            return;
        };
        for (i, page) in run.pages.iter().enumerate() {
            let slot = run.first_slot + i;
            let req = PageRequest::new(list.slot_addr(slot), run.page_size, run.socket_id, run.list, slot);
            if let Err(e) = self.source.unmap_page(&req, page) {
                log::warn!("rollback of {} slot {slot} failed: {e}", run.list);
            }
        }
        if run.created_list && list.is_empty() {
            self.retire(st, run.list.index());
        }
    }

    /// 把映射好的页写入列表与段表并发布；返回 (地址, 长度)
    pub(crate) fn commit_run(
        &self,
        st: &mut RegistryState,
        run: PendingRun,
        flags: SegmentFlags,
    ) -> (usize, usize) {
        let nchannel = self.shared.nchannel();
        let nrank = self.shared.nrank();
        let len = run.len();
        let idx = run.list.index();
        let (Some(list), Some(table)) = (st.lists[idx].as_mut(), st.tables[idx].as_ref()) else {
            return (0, 0);
        };
        let addr = list.slot_addr(run.first_slot);
        let n_pages = run.pages.len();
        let mut fds = Vec::new();
        for (i, page) in run.pages.into_iter().enumerate() {
            let slot = run.first_slot + i;
            list.insert(
                slot,
                MemorySegment {
                    iova: page.iova,
                    addr: list.slot_addr(slot),
                    len: run.page_size,
                    page_size: run.page_size,
                    socket_id: run.socket_id,
                    nchannel,
                    nrank,
                    flags,
                },
            );
            table.set(slot, page.iova, flags);
            if let Some(fd) = page.fd {
                fds.push(((run.list, slot), fd));
            }
        }
        table.set_run(run.first_slot, n_pages);
        let info = list.info();
        st.fds.extend(fds);
        self.publish(st, &info);
        log::debug!(
            "committed {} at 0x{addr:x} in {} (version {})",
            format_bytes(len as u64),
            info.id,
            info.version
        );
        (addr, len)
    }

    /// 归还 `[addr, addr + len)` 的页；区间必须由 `releasable_units` 给出
    ///
    /// 某页归还失败时其余页照常归还，列表照常发布，返回第一个错误。
    pub(crate) fn release_pages(&self, st: &mut RegistryState, addr: usize, len: usize) -> MemResult<()> {
        let list_id = st
            .list_containing(addr)
            .map(|l| l.id)
            .ok_or_else(|| MemError::NotFound(format!("segment list for 0x{addr:x}")))?;
        let idx = list_id.index();
        let (Some(list), Some(table)) = (st.lists[idx].as_mut(), st.tables[idx].as_ref()) else {
            return Err(MemError::NotFound(list_id.to_string()));
        };
        let (page_size, socket_id) = (list.page_size, list.socket_id);
        let first = list.slot_of(addr).unwrap_or(0);
        let n = len / page_size;
        table.cut_runs(first, n);
        let mut released = Vec::with_capacity(n);
        for slot in first..first + n {
            if let Some(seg) = list.remove(slot) {
                table.clear(slot);
                released.push((slot, seg));
            }
        }
        let info = list.info();
        let mut result = Ok(());
        for (slot, seg) in released {
            let fd = st.fds.remove(&(list_id, slot));
            let page = MappedPage { iova: seg.iova, fd };
            let req = PageRequest::new(seg.addr, page_size, socket_id, list_id, slot);
            if let Err(e) = self.source.unmap_page(&req, &page) {
                log::warn!("release of {list_id} slot {slot} failed: {e}");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        self.publish(st, &info);
        log::debug!(
            "released {} at 0x{addr:x} from {list_id} (version {})",
            format_bytes(len as u64),
            info.version
        );
        result
    }

    /// 把列表交给堆管理或收回
    pub(crate) fn set_list_heap(&self, st: &mut RegistryState, id: ListId, heap: Option<usize>) {
        if let Some(list) = st.list_mut(id) {
            list.heap = heap.is_some();
            list.owner_heap = heap;
            list.version += 1;
            let info = list.info();
            self.publish(st, &info);
        }
    }

    // ------------------------------------------------------------------------
    // 外部内存
    // ------------------------------------------------------------------------

    /// 注册调用方拥有的内存
    ///
    /// `iovas` 为空时所有页的 IOVA 为 [`BAD_IOVA`]，否则必须每页一个。每页的
    /// IOVA 写进段表，挂接的进程原样读回。
    pub fn register_external(
        &self,
        addr: usize,
        len: usize,
        iovas: &[u64],
        page_size: usize,
    ) -> MemResult<ListId> {
        let mut st = self.write();
        self.register_external_locked(&mut st, addr, len, iovas, page_size)
    }

    pub(crate) fn register_external_locked(
        &self,
        st: &mut RegistryState,
        addr: usize,
        len: usize,
        iovas: &[u64],
        page_size: usize,
    ) -> MemResult<ListId> {
        if addr == 0 || len == 0 || !page_size.is_power_of_two() {
            return Err(MemError::invalid("external memory needs a non-empty range and a power-of-two page size"));
        }
        if !is_aligned(addr, page_size) || !is_aligned(len, page_size) {
            return Err(MemError::invalid(format!(
                "external range 0x{addr:x}+{len} is not aligned to {page_size}"
            )));
        }
        let n_pages = len / page_size;
        if !iovas.is_empty() && iovas.len() != n_pages {
            return Err(MemError::invalid(format!(
                "{} IOVAs given for {n_pages} pages",
                iovas.len()
            )));
        }
        if st.overlaps(addr, len) {
            return Err(MemError::AlreadyExists(format!("memory at 0x{addr:x}")));
        }
        let idx = self
            .shared
            .claim_list_slot()
            .ok_or(MemError::NoSpace("segment lists"))?;
        let table = match SegmentTable::create(self.shared.list_table_path(idx).as_deref(), n_pages) {
            Ok(t) => t,
            Err(e) => {
                self.shared.release_list_slot(idx);
                return Err(e);
            }
        };
        let id = ListId(idx as u16);
        let mut list = SegmentList::external(id, addr, page_size, crate::SOCKET_ID_ANY, iovas, n_pages);
        list.epoch = self.shared.list_epoch(idx);
        for (slot, seg) in list.slots.iter().enumerate() {
            if let Some(seg) = seg {
                table.set(slot, seg.iova, seg.flags);
            }
        }
        let info = list.info();
        st.lists[idx] = Some(list);
        st.tables[idx] = Some(table);
        self.publish(st, &info);
        log::info!("registered external memory 0x{addr:x}+{} as {id}", format_bytes(len as u64));
        Ok(id)
    }

    /// 注销外部内存；仍由堆管理时返回 `Busy`
    pub fn unregister_external(&self, addr: usize, len: usize) -> MemResult<()> {
        let mut st = self.write();
        self.unregister_external_locked(&mut st, addr, len)
    }

    pub(crate) fn unregister_external_locked(
        &self,
        st: &mut RegistryState,
        addr: usize,
        len: usize,
    ) -> MemResult<()> {
        let list = st
            .lists()
            .find(|l| l.external && !l.attached && l.base == addr && l.len() == len)
            .ok_or_else(|| MemError::NotFound(format!("external memory at 0x{addr:x}")))?;
        if list.heap {
            return Err(MemError::Busy(format!(
                "external memory at 0x{addr:x} is managed by a heap"
            )));
        }
        let idx = list.id.index();
        self.retire(st, idx);
        log::info!("unregistered external memory 0x{addr:x}");
        Ok(())
    }

    /// 挂接另一个进程注册的外部内存，每页 IOVA 取自注册者的段表
    pub fn attach_external(&self, addr: usize, len: usize) -> MemResult<ListId> {
        let mut st = self.write();
        if let Some(l) = st
            .lists()
            .find(|l| l.external && l.base == addr && l.len() == len)
        {
            return Ok(l.id);
        }
        let desc = self
            .shared
            .list_descriptors()
            .into_iter()
            .find(|d| d.external && d.base == addr && d.len == len)
            .ok_or_else(|| MemError::NotFound(format!("registered external memory at 0x{addr:x}")))?;
        let path = self
            .shared
            .list_table_path(desc.index)
            .ok_or(MemError::NotSupported("attaching external memory needs a shared config file"))?;
        let n_pages = desc.len / desc.page_size;
        let table = SegmentTable::open(&path, n_pages)?;
        let iovas: Vec<u64> = (0..n_pages)
            .map(|slot| table.get(slot).map_or(BAD_IOVA, |(iova, _)| iova))
            .collect();
        let id = ListId(desc.index as u16);
        let mut list = SegmentList::external(id, addr, desc.page_size, desc.socket_id, &iovas, n_pages);
        list.attached = true;
        list.version = desc.version;
        list.epoch = desc.epoch;
        st.lists[desc.index] = Some(list);
        st.seen[desc.index] = (desc.epoch, desc.version);
        log::info!("attached external memory 0x{addr:x} ({id})");
        Ok(id)
    }

    /// 解除挂接
    pub fn detach_external(&self, addr: usize, len: usize) -> MemResult<()> {
        let mut st = self.write();
        let idx = st
            .lists()
            .find(|l| l.attached && l.base == addr && l.len() == len)
            .map(|l| l.id.index())
            .ok_or_else(|| MemError::NotFound(format!("attached external memory at 0x{addr:x}")))?;
        st.lists[idx] = None;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // 遍历
    // ------------------------------------------------------------------------

    fn walk_segments_in<F>(st: &RegistryState, mut f: F) -> WalkOutcome
    where
        F: FnMut(&SegmentList, &MemorySegment) -> WalkStep,
    {
        for list in st.lists() {
            for seg in list.segments() {
                match f(list, seg) {
                    WalkStep::Continue => {}
                    WalkStep::Stop => return WalkOutcome::Stopped,
                    WalkStep::Fail => return WalkOutcome::Failed,
                }
            }
        }
        WalkOutcome::Completed
    }

    fn walk_contig_in<F>(st: &RegistryState, mut f: F) -> WalkOutcome
    where
        F: FnMut(&SegmentList, &MemorySegment, usize) -> WalkStep,
    {
        for list in st.lists() {
            for (first, len) in list.contig_runs() {
                match f(list, &first, len) {
                    WalkStep::Continue => {}
                    WalkStep::Stop => return WalkOutcome::Stopped,
                    WalkStep::Fail => return WalkOutcome::Failed,
                }
            }
        }
        WalkOutcome::Completed
    }

    fn walk_lists_in<F>(st: &RegistryState, mut f: F) -> WalkOutcome
    where
        F: FnMut(&SegmentList) -> WalkStep,
    {
        for list in st.lists() {
            match f(list) {
                WalkStep::Continue => {}
                WalkStep::Stop => return WalkOutcome::Stopped,
                WalkStep::Fail => return WalkOutcome::Failed,
            }
        }
        WalkOutcome::Completed
    }

    /// 遍历所有段（持 hotplug 读锁）
    ///
    /// 不能在事件或校验回调中调用，那时 hotplug 锁已被持有，应使用
    /// [`Self::walk_segments_thread_unsafe`]。
    pub fn walk_segments<F>(&self, f: F) -> WalkOutcome
    where
        F: FnMut(&SegmentList, &MemorySegment) -> WalkStep,
    {
        Self::walk_segments_in(&self.read(), f)
    }

    /// # Safety
    ///
    /// 调用方必须已持有 hotplug 锁。
    pub unsafe fn walk_segments_thread_unsafe<F>(&self, f: F) -> WalkOutcome
    where
        F: FnMut(&SegmentList, &MemorySegment) -> WalkStep,
    {
        // SAFETY: 由调用方保证
        Self::walk_segments_in(unsafe { self.state_thread_unsafe() }, f)
    }

    /// 遍历虚拟地址连续的区间：(列表, 首段, 总长度)
    pub fn walk_contig<F>(&self, f: F) -> WalkOutcome
    where
        F: FnMut(&SegmentList, &MemorySegment, usize) -> WalkStep,
    {
        Self::walk_contig_in(&self.read(), f)
    }

    /// # Safety
    ///
    /// 调用方必须已持有 hotplug 锁。
    pub unsafe fn walk_contig_thread_unsafe<F>(&self, f: F) -> WalkOutcome
    where
        F: FnMut(&SegmentList, &MemorySegment, usize) -> WalkStep,
    {
        // SAFETY: 由调用方保证
        Self::walk_contig_in(unsafe { self.state_thread_unsafe() }, f)
    }

    /// 遍历段列表
    pub fn walk_lists<F>(&self, f: F) -> WalkOutcome
    where
        F: FnMut(&SegmentList) -> WalkStep,
    {
        Self::walk_lists_in(&self.read(), f)
    }

    /// # Safety
    ///
    /// 调用方必须已持有 hotplug 锁。
    pub unsafe fn walk_lists_thread_unsafe<F>(&self, f: F) -> WalkOutcome
    where
        F: FnMut(&SegmentList) -> WalkStep,
    {
        // SAFETY: 由调用方保证
        Self::walk_lists_in(unsafe { self.state_thread_unsafe() }, f)
    }

    // ------------------------------------------------------------------------
    // 查询
    // ------------------------------------------------------------------------

    /// 地址所在的段
    pub fn virt2memseg(&self, addr: usize) -> Option<MemorySegment> {
        self.read().segment_at(addr).map(|(_, s)| *s)
    }

    /// 地址所在的段列表
    pub fn virt2memseg_list(&self, addr: usize) -> Option<SegmentListInfo> {
        self.read().list_containing(addr).map(|l| l.info())
    }

    /// IOVA 对应的虚拟地址
    pub fn iova2virt(&self, iova: u64) -> Option<usize> {
        if iova == BAD_IOVA {
            return None;
        }
        let st = self.read();
        st.lists().flat_map(|l| l.segments()).find_map(|s| {
            (s.iova != BAD_IOVA && iova >= s.iova && iova < s.iova + s.len as u64)
                .then(|| s.addr + (iova - s.iova) as usize)
        })
    }

    /// 本进程映射的非外部内存总量
    pub fn physmem_size(&self) -> usize {
        let st = self.read();
        st.lists()
            .filter(|l| !l.external)
            .map(|l| l.used * l.page_size)
            .sum()
    }

    pub fn list_infos(&self) -> Vec<SegmentListInfo> {
        self.read().lists().map(|l| l.info()).collect()
    }

    /// 打印物理内存布局
    pub fn dump_physmem_layout(&self, out: &mut dyn Write) -> std::io::Result<()> {
        let st = self.read();
        for list in st.lists() {
            writeln!(
                out,
                "{}: base=0x{:x} page_size={} socket={} used={}/{} version={}{}{}{}",
                list.id,
                list.base,
                format_bytes(list.page_size as u64),
                list.socket_id,
                list.used,
                list.capacity(),
                list.version,
                if list.external { " external" } else { "" },
                if list.heap { " heap" } else { "" },
                if list.mirrored { " mirrored" } else { "" },
            )?;
            for (i, seg) in list.segments().enumerate() {
                writeln!(
                    out,
                    "  segment {i}: iova=0x{:x} addr=0x{:x} len={} flags={:?}",
                    seg.iova, seg.addr, seg.len, seg.flags
                )?;
            }
        }
        Ok(())
    }

    fn check_dma_mask_in(st: &RegistryState, maskbits: u32) -> MemResult<()> {
        if !(1..=64).contains(&maskbits) {
            return Err(MemError::invalid(format!("DMA mask of {maskbits} bits")));
        }
        if maskbits == 64 {
            return Ok(());
        }
        let limit = 1u64 << maskbits;
        for list in st.lists() {
            for seg in list.segments() {
                if seg.iova == BAD_IOVA {
                    continue;
                }
                if seg.iova + seg.len as u64 > limit {
                    return Err(MemError::invalid(format!(
                        "segment iova 0x{:x}+{} exceeds a {maskbits}-bit DMA mask",
                        seg.iova, seg.len
                    )));
                }
            }
        }
        Ok(())
    }

    /// 检查所有段的 IOVA 是否都在 `maskbits` 位以内
    pub fn check_dma_mask(&self, maskbits: u32) -> MemResult<()> {
        Self::check_dma_mask_in(&self.read(), maskbits)
    }

    /// # Safety
    ///
    /// 调用方必须已持有 hotplug 锁。
    pub unsafe fn check_dma_mask_thread_unsafe(&self, maskbits: u32) -> MemResult<()> {
        // SAFETY: 由调用方保证
        Self::check_dma_mask_in(unsafe { self.state_thread_unsafe() }, maskbits)
    }

    /// 记录设备的 DMA 掩码，之后的增长必须满足它
    pub fn set_dma_mask(&self, maskbits: u32) -> MemResult<()> {
        let st = self.read();
        Self::check_dma_mask_in(&st, maskbits)?;
        self.shared.tighten_dma_mask(maskbits);
        Ok(())
    }

    fn fd_in(st: &RegistryState, addr: usize) -> MemResult<SegmentFd> {
        let (list, seg) = st
            .segment_at(addr)
            .ok_or_else(|| MemError::invalid(format!("0x{addr:x} is not in any segment")))?;
        let slot = list.slot_of(seg.addr).unwrap_or(0);
        st.fds
            .get(&(list.id, slot))
            .cloned()
            .ok_or(MemError::NotSupported("segment has no backing file"))
    }

    /// 段的后备文件描述符
    pub fn get_fd(&self, addr: usize) -> MemResult<RawFd> {
        Self::fd_in(&self.read(), addr).map(|f| f.raw_fd())
    }

    /// # Safety
    ///
    /// 调用方必须已持有 hotplug 锁。
    pub unsafe fn get_fd_thread_unsafe(&self, addr: usize) -> MemResult<RawFd> {
        // SAFETY: 由调用方保证
        Self::fd_in(unsafe { self.state_thread_unsafe() }, addr).map(|f| f.raw_fd())
    }

    /// 段在后备文件中的偏移
    pub fn get_fd_offset(&self, addr: usize) -> MemResult<u64> {
        Self::fd_in(&self.read(), addr).map(|f| f.offset())
    }

    /// # Safety
    ///
    /// 调用方必须已持有 hotplug 锁。
    pub unsafe fn get_fd_offset_thread_unsafe(&self, addr: usize) -> MemResult<u64> {
        // SAFETY: 由调用方保证
        Self::fd_in(unsafe { self.state_thread_unsafe() }, addr).map(|f| f.offset())
    }
}

impl Drop for SegmentRegistry {
    fn drop(&mut self) {
        let Self {
            state,
            shared,
            source,
            owns_region,
            ..
        } = self;
        let st = state.get_mut();
        for idx in 0..MAX_MEMSEG_LISTS {
            let Some(list) = st.lists[idx].as_ref() else {
                continue;
            };
            if list.mirrored || list.attached {
                continue;
            }
            // 共享堆可能仍引用从进程增长出的页
            if !*owns_region && list.heap && !list.external && !list.is_empty() {
                log::debug!("leaving {} published for the other processes", list.id);
                continue;
            }
            st.lists[idx] = None;
            if let Some(table) = st.tables[idx].take() {
                table.unlink();
            }
            source.release_list(ListId(idx as u16));
            shared.release_list_slot(idx);
        }
    }
}
