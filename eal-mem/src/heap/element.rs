//! 堆元素与元素竞技场
//!
//! 元素元数据不放在被管理的内存里，而是放在定长的 [`ElemArena`] 中，
//! 以 [`ElemId`] 句柄互相引用：地址顺序上的前后邻居，以及空闲时所在桶的
//! 前后节点。竞技场不含指针和堆分配，全零即空，可以整体放进共享配置区。

use std::num::NonZeroU32;
use std::ops::{Index, IndexMut};

use crate::MAX_HEAP_ELEMS;
use crate::segment::ListId;

/// 元素句柄，内部是下标加一；元素被移除后句柄可能被复用
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct ElemId(NonZeroU32);

impl ElemId {
    fn at(index: usize) -> Self {
        ElemId(NonZeroU32::MIN.saturating_add(index as u32))
    }

    fn index(self) -> usize {
        self.0.get() as usize - 1
    }

    pub(crate) fn to_raw(self) -> u32 {
        self.0.get()
    }

    pub(crate) fn from_raw(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(ElemId)
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ElemState {
    /// 竞技场空位
    Vacant = 0,
    Free = 1,
    Busy = 2,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct Elem {
    pub addr: usize,
    pub size: usize,
    pub prev: Option<ElemId>,
    pub next: Option<ElemId>,
    pub free_prev: Option<ElemId>,
    pub free_next: Option<ElemId>,
    /// 所在段列表；只有同一列表内地址相邻的元素才会合并
    pub list: ListId,
    pub state: ElemState,
    /// 空闲时所在的桶加一，0 表示不在桶中
    bucket: u8,
}

impl Elem {
    pub fn new(addr: usize, size: usize, list: ListId) -> Self {
        Self {
            addr,
            size,
            prev: None,
            next: None,
            free_prev: None,
            free_next: None,
            list,
            state: ElemState::Free,
            bucket: 0,
        }
    }

    pub fn end(&self) -> usize {
        self.addr + self.size
    }

    pub fn is_free(&self) -> bool {
        self.state == ElemState::Free
    }

    /// `other` 紧跟在本元素之后且属于同一列表
    pub fn adjoins(&self, other: &Elem) -> bool {
        self.end() == other.addr && self.list == other.list
    }

    pub fn bucket(&self) -> Option<usize> {
        (self.bucket != 0).then(|| self.bucket as usize - 1)
    }

    pub fn set_bucket(&mut self, idx: usize) {
        self.bucket = idx as u8 + 1;
    }

    pub fn take_bucket(&mut self) -> Option<usize> {
        let b = self.bucket();
        self.bucket = 0;
        b
    }
}

/// 元素存储
///
/// 从未使用过的槽位不被读取；空位经 `next` 串成链表。
#[repr(C)]
pub(crate) struct ElemArena {
    high_water: u32,
    live: u32,
    vacant: Option<ElemId>,
    slots: [Elem; MAX_HEAP_ELEMS],
}

impl ElemArena {
    pub fn clear(&mut self) {
        self.high_water = 0;
        self.live = 0;
        self.vacant = None;
    }

    /// 还能放入的元素个数
    pub fn vacancies(&self) -> usize {
        MAX_HEAP_ELEMS - self.live as usize
    }

    /// 放入元素；调用方先用 [`Self::vacancies`] 确认有空位
    pub fn insert(&mut self, elem: Elem) -> ElemId {
        debug_assert_ne!(elem.state, ElemState::Vacant);
        let id = match self.vacant {
            Some(id) => {
                self.vacant = self.slots[id.index()].next;
                id
            }
            None => {
                let id = ElemId::at(self.high_water as usize);
                self.high_water += 1;
                id
            }
        };
        self.slots[id.index()] = elem;
        self.live += 1;
        id
    }

    pub fn remove(&mut self, id: ElemId) -> Option<Elem> {
        let vacant = self.vacant;
        let slot = self.slot_mut(id)?;
        let elem = *slot;
        slot.state = ElemState::Vacant;
        slot.next = vacant;
        self.vacant = Some(id);
        self.live -= 1;
        Some(elem)
    }

    fn slot_mut(&mut self, id: ElemId) -> Option<&mut Elem> {
        if id.index() >= self.high_water as usize {
            return None;
        }
        let e = &mut self.slots[id.index()];
        (e.state != ElemState::Vacant).then_some(e)
    }

    pub fn get(&self, id: ElemId) -> Option<&Elem> {
        if id.index() >= self.high_water as usize {
            return None;
        }
        let e = &self.slots[id.index()];
        (e.state != ElemState::Vacant).then_some(e)
    }

    pub fn len(&self) -> usize {
        self.live as usize
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}

impl Index<ElemId> for ElemArena {
    type Output = Elem;

    fn index(&self, id: ElemId) -> &Elem {
        match self.get(id) {
            Some(e) => e,
            None => panic!("stale heap element handle {id:?}"),
        }
    }
}

impl IndexMut<ElemId> for ElemArena {
    fn index_mut(&mut self, id: ElemId) -> &mut Elem {
        match self.slot_mut(id) {
            Some(e) => e,
            None => panic!("stale heap element handle {id:?}"),
        }
    }
}

#[cfg(test)]
pub(crate) fn zeroed_box<T>() -> Box<T> {
    let layout = std::alloc::Layout::new::<T>();
    // SAFETY: 只用于全零即合法的纯数据结构，布局来自 T 本身
    unsafe {
        let p = std::alloc::alloc_zeroed(layout) as *mut T;
        if p.is_null() {
            std::alloc::handle_alloc_error(layout);
        }
        Box::from_raw(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_reused() {
        let mut arena = zeroed_box::<ElemArena>();
        let a = arena.insert(Elem::new(0x1000, 64, ListId(0)));
        let b = arena.insert(Elem::new(0x1040, 64, ListId(0)));
        assert_eq!(arena.len(), 2);
        assert!(arena[a].adjoins(&arena[b]));
        arena.remove(a).unwrap();
        assert!(arena.get(a).is_none());
        assert!(arena.remove(a).is_none());
        let c = arena.insert(Elem::new(0x2000, 128, ListId(1)));
        assert_eq!(c, a);
        assert_eq!(arena.len(), 2);
        assert!(!arena[b].adjoins(&arena[c]));
    }

    #[test]
    fn test_vacancies_track_capacity() {
        let mut arena = zeroed_box::<ElemArena>();
        assert_eq!(arena.vacancies(), MAX_HEAP_ELEMS);
        let a = arena.insert(Elem::new(0x1000, 64, ListId(0)));
        assert_eq!(arena.vacancies(), MAX_HEAP_ELEMS - 1);
        arena.remove(a);
        arena.clear();
        assert!(arena.is_empty());
        assert!(arena.get(a).is_none());
    }

    #[test]
    fn test_raw_handle_roundtrip() {
        assert!(ElemId::from_raw(0).is_none());
        let id = ElemId::at(41);
        assert_eq!(ElemId::from_raw(id.to_raw()), Some(id));
        assert_eq!(std::mem::size_of::<Option<ElemId>>(), 4);
    }

    #[test]
    fn test_adjacency_needs_same_list() {
        let a = Elem::new(0x1000, 0x1000, ListId(0));
        let b = Elem::new(0x2000, 0x1000, ListId(1));
        assert!(!a.adjoins(&b));
    }

    #[test]
    fn test_bucket_encoding() {
        let mut e = Elem::new(0x1000, 64, ListId(0));
        assert_eq!(e.bucket(), None);
        e.set_bucket(0);
        assert_eq!(e.bucket(), Some(0));
        assert_eq!(e.take_bucket(), Some(0));
        assert_eq!(e.bucket(), None);
    }
}
