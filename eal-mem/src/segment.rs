//! 内存段与段列表
//!
//! 一个 [`MemorySegment`] 对应一页已映射的物理内存；同一页规格、同一节点的
//! 段放在一个 [`SegmentList`] 里。列表预留一段连续虚拟地址，第 `i` 个槽位
//! 固定对应 `base + i * page_size`。

use bitflags::bitflags;
use eal_osal::VaReservation;

use crate::BAD_IOVA;

bitflags! {
    /// 段标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SegmentFlags: u32 {
        /// 页在进程生命周期内不归还给 OS
        const DO_NOT_FREE = 1 << 0;
    }
}

/// 一页物理内存，提交后不可变
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySegment {
    /// 设备可见地址
    pub iova: u64,
    /// 虚拟地址
    pub addr: usize,
    pub len: usize,
    pub page_size: usize,
    pub socket_id: i32,
    pub nchannel: u32,
    pub nrank: u32,
    pub flags: SegmentFlags,
}

impl MemorySegment {
    pub fn end(&self) -> usize {
        self.addr + self.len
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.addr && addr < self.end()
    }

    /// 段内地址对应的 IOVA
    pub fn iova_of(&self, addr: usize) -> u64 {
        if self.iova == BAD_IOVA {
            return BAD_IOVA;
        }
        self.iova + (addr - self.addr) as u64
    }
}

/// 段列表在列表数组中的下标
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListId(pub(crate) u16);

impl ListId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for ListId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "msl{}", self.0)
    }
}

/// 遍历回调的返回值
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkStep {
    Continue,
    /// 停止遍历，遍历报告成功
    Stop,
    /// 停止遍历，遍历报告错误
    Fail,
}

/// 遍历结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkOutcome {
    Completed,
    Stopped,
    Failed,
}

impl WalkOutcome {
    /// 传统返回码：0 走完，1 提前成功停止，-1 出错停止
    pub fn code(self) -> i32 {
        match self {
            WalkOutcome::Completed => 0,
            WalkOutcome::Stopped => 1,
            WalkOutcome::Failed => -1,
        }
    }
}

/// 段列表的只读快照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentListInfo {
    pub id: ListId,
    pub base: usize,
    pub len: usize,
    pub page_size: usize,
    pub socket_id: i32,
    pub capacity: usize,
    pub used: usize,
    pub version: u64,
    pub external: bool,
    pub heap: bool,
    /// 管理本列表内存的堆
    pub owner_heap: Option<usize>,
}

/// 段列表
#[derive(Debug)]
pub struct SegmentList {
    pub(crate) id: ListId,
    pub(crate) base: usize,
    pub(crate) page_size: usize,
    pub(crate) socket_id: i32,
    pub(crate) slots: Vec<Option<MemorySegment>>,
    pub(crate) used: usize,
    pub(crate) version: u64,
    pub(crate) external: bool,
    pub(crate) heap: bool,
    /// 管理本列表内存的堆
    pub(crate) owner_heap: Option<usize>,
    /// 本进程拥有的地址预留；外部列表为 `None`
    pub(crate) reservation: Option<VaReservation>,
    /// 本进程只是挂接了别处注册的外部列表
    pub(crate) attached: bool,
    /// 列表由其他进程创建，本进程在相同地址上映射它的页
    pub(crate) mirrored: bool,
    /// 创建时共享描述符槽位的认领代数
    pub(crate) epoch: u64,
}

impl SegmentList {
    /// 基于地址预留创建空列表
    pub(crate) fn reserved(
        id: ListId,
        page_size: usize,
        socket_id: i32,
        reservation: VaReservation,
    ) -> Self {
        let capacity = reservation.len() / page_size;
        Self {
            id,
            base: reservation.base(),
            page_size,
            socket_id,
            slots: vec![None; capacity],
            used: 0,
            version: 0,
            external: false,
            heap: true,
            owner_heap: None,
            reservation: Some(reservation),
            attached: false,
            mirrored: false,
            epoch: 0,
        }
    }

    /// 调用方拥有的外部内存，所有页立即就位
    pub(crate) fn external(
        id: ListId,
        base: usize,
        page_size: usize,
        socket_id: i32,
        iovas: &[u64],
        n_pages: usize,
    ) -> Self {
        let slots = (0..n_pages)
            .map(|i| {
                Some(MemorySegment {
                    iova: iovas.get(i).copied().unwrap_or(BAD_IOVA),
                    addr: base + i * page_size,
                    len: page_size,
                    page_size,
                    socket_id,
                    nchannel: 0,
                    nrank: 0,
                    flags: SegmentFlags::empty(),
                })
            })
            .collect();
        Self {
            id,
            base,
            page_size,
            socket_id,
            slots,
            used: n_pages,
            version: 1,
            external: true,
            heap: false,
            owner_heap: None,
            reservation: None,
            attached: false,
            mirrored: false,
            epoch: 0,
        }
    }

    pub fn id(&self) -> ListId {
        self.id
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn socket_id(&self) -> i32 {
        self.socket_id
    }

    /// 已占用槽位数
    pub fn used(&self) -> usize {
        self.used
    }

    pub fn is_external(&self) -> bool {
        self.external
    }

    pub fn is_heap(&self) -> bool {
        self.heap
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.len() * self.page_size
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn end(&self) -> usize {
        self.base + self.len()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end()
    }

    pub(crate) fn slot_of(&self, addr: usize) -> Option<usize> {
        self.contains(addr)
            .then(|| (addr - self.base) / self.page_size)
    }

    pub(crate) fn slot_addr(&self, idx: usize) -> usize {
        self.base + idx * self.page_size
    }

    pub(crate) fn segment(&self, idx: usize) -> Option<&MemorySegment> {
        self.slots.get(idx).and_then(|s| s.as_ref())
    }

    /// 第一段连续 `n` 个空槽位的起始下标
    pub(crate) fn find_free_run(&self, n: usize) -> Option<usize> {
        let mut run = 0;
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.is_none() {
                run += 1;
                if run == n {
                    return Some(i + 1 - n);
                }
            } else {
                run = 0;
            }
        }
        None
    }

    pub(crate) fn insert(&mut self, idx: usize, seg: MemorySegment) {
        debug_assert!(self.slots[idx].is_none(), "slot {idx} of {} in use", self.id);
        self.slots[idx] = Some(seg);
        self.used += 1;
        self.version += 1;
    }

    pub(crate) fn remove(&mut self, idx: usize) -> Option<MemorySegment> {
        let seg = self.slots[idx].take()?;
        self.used -= 1;
        self.version += 1;
        Some(seg)
    }

    pub(crate) fn segments(&self) -> impl Iterator<Item = &MemorySegment> {
        self.slots.iter().flatten()
    }

    /// 连续占用槽位组成的虚拟地址连续区间：(起始段, 总长度)
    pub(crate) fn contig_runs(&self) -> Vec<(MemorySegment, usize)> {
        let mut runs = Vec::new();
        let mut cur: Option<(MemorySegment, usize)> = None;
        for slot in &self.slots {
            match slot {
                Some(seg) => {
                    if let Some((_, len)) = cur.as_mut() {
                        *len += seg.len;
                    } else {
                        cur = Some((*seg, seg.len));
                    }
                }
                None => runs.extend(cur.take()),
            }
        }
        runs.extend(cur);
        runs
    }

    /// `[addr, addr + len)` 覆盖的页全部就位且 IOVA 连续
    pub(crate) fn is_iova_contig(&self, addr: usize, len: usize) -> bool {
        if len == 0 {
            return true;
        }
        let (Some(first), Some(last)) = (self.slot_of(addr), self.slot_of(addr + len - 1)) else {
            return false;
        };
        let mut expect = None;
        for idx in first..=last {
            let Some(seg) = self.segment(idx) else {
                return false;
            };
            if seg.iova == BAD_IOVA {
                return false;
            }
            if let Some(e) = expect
                && seg.iova != e
            {
                return false;
            }
            expect = Some(seg.iova + seg.len as u64);
        }
        true
    }

    pub fn info(&self) -> SegmentListInfo {
        SegmentListInfo {
            id: self.id,
            base: self.base,
            len: self.len(),
            page_size: self.page_size,
            socket_id: self.socket_id,
            capacity: self.capacity(),
            used: self.used,
            version: self.version,
            external: self.external,
            heap: self.heap,
            owner_heap: self.owner_heap,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PG: usize = 4096;

    fn seg(addr: usize, iova: u64) -> MemorySegment {
        MemorySegment {
            iova,
            addr,
            len: PG,
            page_size: PG,
            socket_id: 0,
            nchannel: 0,
            nrank: 0,
            flags: SegmentFlags::empty(),
        }
    }

    fn list(n: usize) -> SegmentList {
        let r = VaReservation::reserve(n * PG, PG, 0).unwrap();
        SegmentList::reserved(ListId(0), PG, 0, r)
    }

    #[test]
    fn test_version_strictly_increases() {
        let mut l = list(4);
        let mut last = l.version();
        for i in 0..4 {
            l.insert(i, seg(l.slot_addr(i), i as u64 * PG as u64));
            assert!(l.version() > last);
            last = l.version();
        }
        l.remove(1);
        assert!(l.version() > last);
        assert_eq!(l.used, 3);
    }

    #[test]
    fn test_find_free_run() {
        let mut l = list(6);
        assert_eq!(l.find_free_run(6), Some(0));
        l.insert(1, seg(l.slot_addr(1), 0));
        assert_eq!(l.find_free_run(1), Some(0));
        assert_eq!(l.find_free_run(2), Some(2));
        assert_eq!(l.find_free_run(5), None);
    }

    #[test]
    fn test_contig_runs() {
        let mut l = list(5);
        for i in [0, 1, 3] {
            l.insert(i, seg(l.slot_addr(i), 0));
        }
        let runs = l.contig_runs();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].0.addr, l.base);
        assert_eq!(runs[0].1, 2 * PG);
        assert_eq!(runs[1].1, PG);
    }

    #[test]
    fn test_iova_contiguity() {
        let mut l = list(3);
        l.insert(0, seg(l.slot_addr(0), 0x10_0000));
        l.insert(1, seg(l.slot_addr(1), 0x10_1000));
        l.insert(2, seg(l.slot_addr(2), 0x50_0000));
        assert!(l.is_iova_contig(l.base, 2 * PG));
        assert!(!l.is_iova_contig(l.base + PG, 2 * PG));
        assert!(l.is_iova_contig(l.base + 2 * PG + 8, 64));
    }

    #[test]
    fn test_walk_codes() {
        assert_eq!(WalkOutcome::Completed.code(), 0);
        assert_eq!(WalkOutcome::Stopped.code(), 1);
        assert_eq!(WalkOutcome::Failed.code(), -1);
    }
}
