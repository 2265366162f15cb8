//! 段表
//!
//! 每个段列表一张跨进程共享的定长槽位表：槽位上是否有页、页的 IOVA 与标志，
//! 以及以该槽位开头的增长批次页数。列表的真实状态以段表为准，各进程的
//! [`crate::segment::SegmentList`] 只是本地镜像。
//!
//! 文件后备的共享区下段表放在 `{配置文件}.msl{下标}`；进程内模式用匿名映射。

use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use eal_common::utils::align_up;
use eal_osal::SharedFileMapping;
use static_assertions::const_assert_eq;

use crate::error::MemResult;
use crate::segment::SegmentFlags;

#[repr(C)]
struct SlotEntry {
    used: AtomicU32,
    flags: AtomicU32,
    /// 以本槽位开头的增长批次页数，0 表示不是批次起点
    run_pages: AtomicU32,
    /// 每次放入新页加一，其他进程据此发现同一槽位换过页
    generation: AtomicU32,
    iova: AtomicU64,
}

const_assert_eq!(std::mem::size_of::<SlotEntry>(), 24);

pub(crate) struct SegmentTable {
    map: SharedFileMapping,
    capacity: usize,
}

impl SegmentTable {
    fn byte_len(capacity: usize) -> usize {
        align_up(capacity.max(1) * std::mem::size_of::<SlotEntry>(), 4096)
    }

    /// 新建全零的段表；同名旧文件先删除，仍映射着它的进程不受影响
    pub fn create(path: Option<&Path>, capacity: usize) -> MemResult<Self> {
        let len = Self::byte_len(capacity);
        let map = match path {
            Some(p) => {
                let _ = std::fs::remove_file(p);
                SharedFileMapping::create(p, len, 0)?
            }
            None => SharedFileMapping::anonymous(len)?,
        };
        Ok(Self { map, capacity })
    }

    /// 打开其他进程创建的段表
    pub fn open(path: &Path, capacity: usize) -> MemResult<Self> {
        Ok(Self {
            map: SharedFileMapping::open(path, Self::byte_len(capacity))?,
            capacity,
        })
    }

    /// 删除段表文件
    pub fn unlink(&self) {
        if let Some(p) = self.map.path() {
            let _ = std::fs::remove_file(p);
        }
    }

    fn entries(&self) -> &[SlotEntry] {
        // SAFETY: 映射页对齐且至少 capacity 个条目长，全零是合法值
        unsafe {
            std::slice::from_raw_parts(self.map.as_ptr() as *const SlotEntry, self.capacity)
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn set(&self, slot: usize, iova: u64, flags: SegmentFlags) {
        let e = &self.entries()[slot];
        e.iova.store(iova, Ordering::Relaxed);
        e.flags.store(flags.bits(), Ordering::Relaxed);
        e.generation.fetch_add(1, Ordering::Relaxed);
        e.used.store(1, Ordering::Release);
    }

    pub fn clear(&self, slot: usize) {
        let e = &self.entries()[slot];
        e.run_pages.store(0, Ordering::Relaxed);
        e.used.store(0, Ordering::Release);
    }

    /// 槽位上的页：(IOVA, 标志)
    pub fn get(&self, slot: usize) -> Option<(u64, SegmentFlags)> {
        let e = self.entries().get(slot)?;
        if e.used.load(Ordering::Acquire) == 0 {
            return None;
        }
        Some((
            e.iova.load(Ordering::Relaxed),
            SegmentFlags::from_bits_truncate(e.flags.load(Ordering::Relaxed)),
        ))
    }

    pub fn generation(&self, slot: usize) -> u32 {
        self.entries()
            .get(slot)
            .map_or(0, |e| e.generation.load(Ordering::Relaxed))
    }

    pub fn set_run(&self, slot: usize, pages: usize) {
        self.entries()[slot]
            .run_pages
            .store(pages as u32, Ordering::Relaxed);
    }

    pub fn run(&self, slot: usize) -> usize {
        self.entries()
            .get(slot)
            .map_or(0, |e| e.run_pages.load(Ordering::Relaxed) as usize)
    }

    /// 从批次记录中挖掉 `[first, first + n)`，两侧剩下的部分各自成为批次
    pub fn cut_runs(&self, first: usize, n: usize) {
        let end = first + n;
        for s in 0..end.min(self.capacity) {
            let run = self.run(s);
            if run == 0 || s + run <= first {
                continue;
            }
            let run_end = s + run;
            self.set_run(s, first.saturating_sub(s));
            if run_end > end && end < self.capacity {
                self.set_run(end, run_end - end);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_visible_through_second_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.msl0");
        let a = SegmentTable::create(Some(&path), 16).unwrap();
        a.set(3, 0x8000_0000, SegmentFlags::DO_NOT_FREE);
        a.set_run(3, 2);
        let b = SegmentTable::open(&path, 16).unwrap();
        assert_eq!(b.get(3), Some((0x8000_0000, SegmentFlags::DO_NOT_FREE)));
        assert_eq!(b.run(3), 2);
        assert_eq!(b.generation(3), 1);
        assert_eq!(b.get(4), None);
        b.clear(3);
        assert_eq!(a.get(3), None);
        assert_eq!(a.run(3), 0);
        assert_eq!(a.get(99), None);
        a.set(3, 0x9000_0000, SegmentFlags::empty());
        assert_eq!(b.generation(3), 2);
    }

    #[test]
    fn test_recreate_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.msl1");
        let old = SegmentTable::create(Some(&path), 4).unwrap();
        old.set(0, 1, SegmentFlags::empty());
        let new = SegmentTable::create(Some(&path), 4).unwrap();
        assert_eq!(new.get(0), None);
        // 旧映射仍指向旧文件
        assert_eq!(old.get(0), Some((1, SegmentFlags::empty())));
        new.unlink();
        assert!(!path.exists());
    }

    #[test]
    fn test_cut_runs_keeps_both_sides() {
        let t = SegmentTable::create(None, 16).unwrap();
        t.set_run(0, 6);
        t.set_run(6, 2);
        t.set_run(8, 4);
        t.cut_runs(2, 7);
        assert_eq!(t.run(0), 2);
        assert_eq!(t.run(6), 0);
        assert_eq!(t.run(8), 0);
        assert_eq!(t.run(9), 3);
        t.cut_runs(9, 3);
        assert_eq!(t.run(9), 0);
        assert_eq!((0..16).map(|s| t.run(s)).sum::<usize>(), 2);
    }

    #[test]
    fn test_anonymous_table() {
        let t = SegmentTable::create(None, 8).unwrap();
        assert_eq!(t.capacity(), 8);
        t.set(7, 42, SegmentFlags::empty());
        assert_eq!(t.get(7), Some((42, SegmentFlags::empty())));
    }
}
