//! 空闲链表桶
//!
//! 13 个桶按 4 倍几何级数划分：
//!
//! | 桶 | 元素大小 |
//! |----|----------|
//! | 0  | ≤ 256 B |
//! | 1  | (256 B, 1 KiB] |
//! | 2  | (1 KiB, 4 KiB] |
//! | …  | 每级 ×4 |
//! | 12 | > 1 GiB |
//!
//! 桶内是双向链表，新元素插到表头。

use eal_common::utils::ceil_log2;

use super::element::{ElemArena, ElemId};
use crate::HEAP_NUM_FREELISTS;

const MIN_BUCKET_LOG2: u32 = 8;

/// 大小对应的桶
pub(crate) fn free_list_index(size: usize) -> usize {
    if size <= 1 << MIN_BUCKET_LOG2 {
        return 0;
    }
    let log2 = ceil_log2(size);
    (((log2 - MIN_BUCKET_LOG2 + 1) / 2) as usize).min(HEAP_NUM_FREELISTS - 1)
}

#[repr(C)]
#[derive(Debug, Default)]
pub(crate) struct FreeLists {
    heads: [Option<ElemId>; HEAP_NUM_FREELISTS],
    counts: [usize; HEAP_NUM_FREELISTS],
}

impl FreeLists {
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn insert(&mut self, arena: &mut ElemArena, id: ElemId) {
        let idx = free_list_index(arena[id].size);
        let head = self.heads[idx];
        {
            let e = &mut arena[id];
            debug_assert!(e.bucket().is_none(), "element already on a free list");
            e.set_bucket(idx);
            e.free_prev = None;
            e.free_next = head;
        }
        if let Some(h) = head {
            arena[h].free_prev = Some(id);
        }
        self.heads[idx] = Some(id);
        self.counts[idx] += 1;
    }

    pub fn remove(&mut self, arena: &mut ElemArena, id: ElemId) {
        let (idx, prev, next) = {
            let e = &mut arena[id];
            let Some(idx) = e.take_bucket() else {
                return;
            };
            (idx, e.free_prev.take(), e.free_next.take())
        };
        match prev {
            Some(p) => arena[p].free_next = next,
            None => self.heads[idx] = next,
        }
        if let Some(n) = next {
            arena[n].free_prev = prev;
        }
        self.counts[idx] -= 1;
    }

    /// 桶 `idx` 中的元素，从表头开始
    pub fn iter<'a>(&self, arena: &'a ElemArena, idx: usize) -> impl Iterator<Item = ElemId> + use<'a> {
        std::iter::successors(self.heads[idx], move |&id| arena[id].free_next)
    }

    pub fn count(&self, idx: usize) -> usize {
        self.counts[idx]
    }

    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::element::{Elem, zeroed_box};
    use crate::segment::ListId;

    #[test]
    fn test_bucket_thresholds() {
        assert_eq!(free_list_index(64), 0);
        assert_eq!(free_list_index(256), 0);
        assert_eq!(free_list_index(257), 1);
        assert_eq!(free_list_index(1024), 1);
        assert_eq!(free_list_index(1025), 2);
        assert_eq!(free_list_index(4096), 2);
        assert_eq!(free_list_index(1 << 20), 6);
        assert_eq!(free_list_index(6 << 20), 8);
        assert_eq!(free_list_index(usize::MAX / 2), HEAP_NUM_FREELISTS - 1);
    }

    #[test]
    fn test_buckets_monotonic() {
        let mut last = 0;
        for shift in 6..40 {
            let idx = free_list_index(1usize << shift);
            assert!(idx >= last);
            last = idx;
        }
    }

    #[test]
    fn test_insert_remove_links() {
        let mut arena = zeroed_box::<ElemArena>();
        let mut lists = FreeLists::default();
        let ids: Vec<_> = (0..3)
            .map(|i| arena.insert(Elem::new(0x1000 * (i + 1), 128, ListId(0))))
            .collect();
        for &id in &ids {
            lists.insert(&mut arena, id);
        }
        // 表头插入，逆序
        let order: Vec<_> = lists.iter(&arena, 0).collect();
        assert_eq!(order, vec![ids[2], ids[1], ids[0]]);
        lists.remove(&mut arena, ids[1]);
        let order: Vec<_> = lists.iter(&arena, 0).collect();
        assert_eq!(order, vec![ids[2], ids[0]]);
        assert!(arena[ids[1]].bucket().is_none());
        lists.remove(&mut arena, ids[2]);
        assert_eq!(lists.iter(&arena, 0).collect::<Vec<_>>(), vec![ids[0]]);
        assert_eq!(lists.total(), 1);
        // 不在桶中的元素移除无效果
        lists.remove(&mut arena, ids[1]);
        assert_eq!(lists.count(0), 1);
        lists.clear();
        assert_eq!(lists.total(), 0);
    }
}
