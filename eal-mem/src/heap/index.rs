//! 按起始地址排序的元素索引
//!
//! 定长有序数组加二分查找，插入和删除时搬移尾部。

use super::element::ElemId;
use crate::MAX_HEAP_ELEMS;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct Entry {
    addr: usize,
    id: u32,
    _pad: u32,
}

#[repr(C)]
pub(crate) struct AddrIndex {
    len: u32,
    _pad: u32,
    entries: [Entry; MAX_HEAP_ELEMS],
}

impl AddrIndex {
    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    fn live(&self) -> &[Entry] {
        &self.entries[..self.len as usize]
    }

    fn search(&self, addr: usize) -> Result<usize, usize> {
        self.live().binary_search_by_key(&addr, |e| e.addr)
    }

    fn id_at(&self, pos: usize) -> Option<ElemId> {
        ElemId::from_raw(self.entries[pos].id)
    }

    pub fn get(&self, addr: usize) -> Option<ElemId> {
        self.search(addr).ok().and_then(|pos| self.id_at(pos))
    }

    /// 起始地址小于 `addr` 的最后一个元素
    pub fn before(&self, addr: usize) -> Option<ElemId> {
        let pos = self.search(addr).unwrap_or_else(|p| p);
        pos.checked_sub(1).and_then(|p| self.id_at(p))
    }

    /// 起始地址不大于 `addr` 的最后一个元素
    pub fn at_or_before(&self, addr: usize) -> Option<ElemId> {
        match self.search(addr) {
            Ok(pos) => self.id_at(pos),
            Err(pos) => pos.checked_sub(1).and_then(|p| self.id_at(p)),
        }
    }

    pub fn insert(&mut self, addr: usize, id: ElemId) {
        let entry = Entry {
            addr,
            id: id.to_raw(),
            _pad: 0,
        };
        match self.search(addr) {
            Ok(pos) => self.entries[pos] = entry,
            Err(pos) => {
                let len = self.len as usize;
                self.entries.copy_within(pos..len, pos + 1);
                self.entries[pos] = entry;
                self.len += 1;
            }
        }
    }

    pub fn remove(&mut self, addr: usize) -> Option<ElemId> {
        let pos = self.search(addr).ok()?;
        let id = self.id_at(pos);
        let len = self.len as usize;
        self.entries.copy_within(pos + 1..len, pos);
        self.len -= 1;
        id
    }
}
