//! 锁与加锁顺序
//!
//! 进程内用 `parking_lot` 锁；需要跨进程互斥的锁（hotplug、pool、queue、zone、
//! 堆表与每个堆）额外在共享配置区里有一个读写锁字，先拿进程内锁再拿锁字，释放顺序相反。
//!
//! 全局加锁顺序由 [`LockRank`] 定义，debug 构建下每个线程记录已持有的锁，
//! 逆序加锁立即 panic。

use std::cell::RefCell;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use crossbeam_utils::Backoff;
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::shared::{LockWord, SharedRegion};

/// 加锁顺序，数值小的先拿
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockRank {
    Pool = 1,
    Queue = 2,
    Zone = 3,
    HeapTable = 4,
    Heap = 5,
    Hotplug = 6,
    Callbacks = 7,
}

thread_local! {
    static HELD_RANKS: RefCell<Vec<LockRank>> = const { RefCell::new(Vec::new()) };
}

/// 持锁期间存活的顺序令牌
pub(crate) struct RankToken {
    #[cfg_attr(not(debug_assertions), allow(dead_code))]
    rank: LockRank,
}

impl RankToken {
    pub(crate) fn acquire(rank: LockRank) -> Self {
        #[cfg(debug_assertions)]
        HELD_RANKS.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(&top) = held.iter().max() {
                assert!(
                    top < rank,
                    "lock order violation: acquiring {rank:?} while holding {top:?}"
                );
            }
            held.push(rank);
        });
        Self { rank }
    }
}

impl Drop for RankToken {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        HELD_RANKS.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|&r| r == self.rank) {
                held.remove(pos);
            }
        });
    }
}

/// 当前线程持有的锁（仅 debug 构建有记录）
pub fn held_ranks() -> Vec<LockRank> {
    HELD_RANKS.with(|held| held.borrow().clone())
}

// ============================================================================
// 跨进程锁字
// ============================================================================

// 锁字：0 空闲，>0 读者数，-1 写者

fn snooze(backoff: &Backoff) {
    if backoff.is_completed() {
        std::thread::yield_now();
    } else {
        backoff.snooze();
    }
}

fn word_read_lock(word: &AtomicI32) {
    let backoff = Backoff::new();
    loop {
        let cur = word.load(Ordering::Relaxed);
        if cur >= 0
            && word
                .compare_exchange_weak(cur, cur + 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        {
            return;
        }
        snooze(&backoff);
    }
}

fn word_read_unlock(word: &AtomicI32) {
    word.fetch_sub(1, Ordering::Release);
}

fn word_write_lock(word: &AtomicI32) {
    let backoff = Backoff::new();
    while word
        .compare_exchange_weak(0, -1, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        snooze(&backoff);
    }
}

fn word_write_unlock(word: &AtomicI32) {
    word.store(0, Ordering::Release);
}

/// 共享配置区中某个锁字的引用
#[derive(Clone)]
pub(crate) struct SharedLockRef {
    region: Arc<SharedRegion>,
    word: LockWord,
}

impl SharedLockRef {
    pub(crate) fn new(region: Arc<SharedRegion>, word: LockWord) -> Self {
        Self { region, word }
    }

    fn atomic(&self) -> &AtomicI32 {
        self.region.lock_word(self.word)
    }
}

// ============================================================================
// 带顺序的读写锁
// ============================================================================

pub struct RankedRwLock<T> {
    rank: LockRank,
    shared: Option<SharedLockRef>,
    inner: RwLock<T>,
}

impl<T> RankedRwLock<T> {
    pub(crate) fn new(rank: LockRank, value: T) -> Self {
        Self {
            rank,
            shared: None,
            inner: RwLock::new(value),
        }
    }

    pub(crate) fn with_shared(rank: LockRank, shared: SharedLockRef, value: T) -> Self {
        Self {
            rank,
            shared: Some(shared),
            inner: RwLock::new(value),
        }
    }

    pub fn read(&self) -> RankedReadGuard<'_, T> {
        let rank = RankToken::acquire(self.rank);
        let guard = self.inner.read();
        if let Some(s) = &self.shared {
            word_read_lock(s.atomic());
        }
        RankedReadGuard {
            guard: ManuallyDrop::new(guard),
            shared: self.shared.as_ref(),
            _rank: rank,
        }
    }

    pub fn write(&self) -> RankedWriteGuard<'_, T> {
        let rank = RankToken::acquire(self.rank);
        let guard = self.inner.write();
        if let Some(s) = &self.shared {
            word_write_lock(s.atomic());
        }
        RankedWriteGuard {
            guard: ManuallyDrop::new(guard),
            shared: self.shared.as_ref(),
            _rank: rank,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    pub(crate) fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    /// 不加锁读取
    ///
    /// # Safety
    ///
    /// 调用方所在的调用链必须已经持有本锁（读或写），且持有者在返回的引用
    /// 存活期间不会修改数据。典型场景是在事件回调中遍历注册表。
    pub(crate) unsafe fn data_unlocked(&self) -> &T {
        debug_assert!(self.inner.is_locked(), "thread-unsafe access without the lock");
        // SAFETY: 由调用方保证锁已被持有且没有活跃的可变借用
        unsafe { &*self.inner.data_ptr() }
    }
}

pub struct RankedReadGuard<'a, T> {
    guard: ManuallyDrop<RwLockReadGuard<'a, T>>,
    shared: Option<&'a SharedLockRef>,
    _rank: RankToken,
}

impl<T> Deref for RankedReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> Drop for RankedReadGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(s) = self.shared {
            word_read_unlock(s.atomic());
        }
        // SAFETY: 只在这里释放一次
        unsafe { ManuallyDrop::drop(&mut self.guard) };
    }
}

pub struct RankedWriteGuard<'a, T> {
    guard: ManuallyDrop<RwLockWriteGuard<'a, T>>,
    shared: Option<&'a SharedLockRef>,
    _rank: RankToken,
}

impl<T> Deref for RankedWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for RankedWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for RankedWriteGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(s) = self.shared {
            word_write_unlock(s.atomic());
        }
        // SAFETY: 只在这里释放一次
        unsafe { ManuallyDrop::drop(&mut self.guard) };
    }
}

// ============================================================================
// 带顺序的互斥锁
// ============================================================================

pub struct RankedMutex<T> {
    rank: LockRank,
    shared: Option<SharedLockRef>,
    inner: Mutex<T>,
}

impl<T> RankedMutex<T> {
    pub(crate) fn new(rank: LockRank, value: T) -> Self {
        Self {
            rank,
            shared: None,
            inner: Mutex::new(value),
        }
    }

    /// 同时以共享配置区中的锁字做跨进程互斥（按写者加锁）
    pub(crate) fn with_shared(rank: LockRank, shared: SharedLockRef, value: T) -> Self {
        Self {
            rank,
            shared: Some(shared),
            inner: Mutex::new(value),
        }
    }

    pub fn lock(&self) -> RankedMutexGuard<'_, T> {
        let rank = RankToken::acquire(self.rank);
        let guard = self.inner.lock();
        if let Some(s) = &self.shared {
            word_write_lock(s.atomic());
        }
        RankedMutexGuard {
            guard: ManuallyDrop::new(guard),
            shared: self.shared.as_ref(),
            _rank: rank,
        }
    }
}

pub struct RankedMutexGuard<'a, T> {
    guard: ManuallyDrop<MutexGuard<'a, T>>,
    shared: Option<&'a SharedLockRef>,
    _rank: RankToken,
}

impl<T> Deref for RankedMutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for RankedMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for RankedMutexGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(s) = self.shared {
            word_write_unlock(s.atomic());
        }
        // SAFETY: 只在这里释放一次
        unsafe { ManuallyDrop::drop(&mut self.guard) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_nesting() {
        let pool = RankedRwLock::new(LockRank::Pool, ());
        let heap = RankedMutex::new(LockRank::Heap, 0u32);
        let hotplug = RankedRwLock::new(LockRank::Hotplug, ());
        let _p = pool.write();
        let mut h = heap.lock();
        *h += 1;
        let _r = hotplug.read();
        if cfg!(debug_assertions) {
            assert_eq!(
                held_ranks(),
                vec![LockRank::Pool, LockRank::Heap, LockRank::Hotplug]
            );
        }
    }

    #[test]
    fn test_ranks_released() {
        let heap = RankedMutex::new(LockRank::Heap, ());
        {
            let _h = heap.lock();
        }
        assert!(held_ranks().is_empty());
        let _h = heap.lock();
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "lock order violation")]
    fn test_reverse_order_panics() {
        let heap = RankedMutex::new(LockRank::Heap, ());
        let hotplug = RankedRwLock::new(LockRank::Hotplug, ());
        let _r = hotplug.read();
        let _h = heap.lock();
    }

    #[test]
    fn test_word_lock_excludes_writer() {
        let word = AtomicI32::new(0);
        word_read_lock(&word);
        word_read_lock(&word);
        assert_eq!(word.load(Ordering::Relaxed), 2);
        word_read_unlock(&word);
        word_read_unlock(&word);
        word_write_lock(&word);
        assert_eq!(word.load(Ordering::Relaxed), -1);
        word_write_unlock(&word);
        assert_eq!(word.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_data_unlocked_under_lock() {
        let lock = RankedRwLock::new(LockRank::Hotplug, 7u32);
        let _g = lock.read();
        assert_eq!(unsafe { *lock.data_unlocked() }, 7);
    }
}
