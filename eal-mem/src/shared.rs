//! 跨进程共享配置区
//!
//! 定长 `repr(C)` 记录，所有字段都是原子类型，主进程创建并初始化，从进程以
//! 相同地址映射。挂接流程：
//!
//! 1. 任意地址映射文件，得到 [`PendingRegion`]，此时只能读魔数与版本戳；
//! 2. [`PendingRegion::validate`] 校验戳，不符立即失败；
//! 3. [`ValidatedRegion::wait_complete`] 退避轮询初始化完成标志；
//! 4. 读取主进程记录的映射地址并在该地址重新映射。
//!
//! 记录里除了锁字与段列表描述符，还有全部堆槽位（元数据本身）和内存区表，
//! 这两部分不是原子类型，只在持有对应的跨进程锁时访问。

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_utils::Backoff;
use eal_common::utils::align_up;
use eal_osal::{OsalError, SharedFileMapping};
use static_assertions::const_assert_eq;

use crate::error::{MemError, MemResult};
use crate::heap::HeapSlot;
use crate::memzone::MemzoneSlot;
use crate::segment::SegmentListInfo;
use crate::{MAX_HEAPS, MAX_MEMSEG_LISTS, MAX_MEMZONES, MAX_NUMA_NODES};

/// 共享配置魔数
pub const MEM_CONFIG_MAGIC: u32 = 0x4541_4c4d;
/// 共享记录布局版本，布局变化时递增
pub const MEM_CONFIG_VERSION: u32 = 4;

/// 从进程等待主进程写戳的时限
const STAMP_WAIT: Duration = Duration::from_secs(2);

/// 魔数与版本戳，固定位于记录开头
#[repr(C)]
#[derive(Debug)]
pub struct ConfigStamp {
    pub magic: AtomicU32,
    pub version: AtomicU32,
}

/// 期望的戳值
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stamp {
    pub magic: u32,
    pub version: u32,
}

impl Stamp {
    pub const CURRENT: Stamp = Stamp {
        magic: MEM_CONFIG_MAGIC,
        version: MEM_CONFIG_VERSION,
    };
}

/// 多进程状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MpStatus {
    Unknown = 0,
    Enabled = 1,
    Disabled = 2,
}

/// 段列表描述符槽位状态
const DESC_FREE: u32 = 0;
const DESC_CLAIMED: u32 = 1;
const DESC_PUBLISHED: u32 = 2;

const DESC_FLAG_EXTERNAL: u32 = 1 << 0;
const DESC_FLAG_HEAP: u32 = 1 << 1;

/// 段列表在共享区中的镜像；每页的状态在列表自己的段表文件里
#[repr(C)]
#[derive(Debug)]
pub struct SharedListDesc {
    state: AtomicU32,
    owner_pid: AtomicU32,
    version: AtomicU64,
    /// 槽位每被认领一次加一，用来区分复用同一下标的不同列表
    epoch: AtomicU64,
    base: AtomicU64,
    len: AtomicU64,
    page_size: AtomicU64,
    socket_id: AtomicI32,
    flags: AtomicU32,
    capacity: AtomicU32,
    used: AtomicU32,
    /// 管理本列表的堆下标加一，0 表示无
    owner_heap: AtomicU32,
    _pad: u32,
}

/// 从共享区读到的段列表描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListDescriptor {
    pub index: usize,
    pub owner_pid: u32,
    pub version: u64,
    pub epoch: u64,
    pub base: usize,
    pub len: usize,
    pub page_size: usize,
    pub socket_id: i32,
    pub capacity: usize,
    pub used: usize,
    pub external: bool,
    pub heap: bool,
    pub owner_heap: Option<usize>,
}

/// 共享配置记录
#[repr(C)]
#[derive(Debug)]
pub struct SharedHeader {
    pub stamp: ConfigStamp,
    pub nchannel: AtomicU32,
    pub nrank: AtomicU32,
    hotplug_lock: AtomicI32,
    pool_lock: AtomicI32,
    queue_lock: AtomicI32,
    zone_lock: AtomicI32,
    heap_table_lock: AtomicI32,
    mp_status: AtomicU32,
    init_complete: AtomicU32,
    next_socket_id: AtomicU32,
    legacy_mem: AtomicU32,
    single_file_segments: AtomicU32,
    /// 已提交段中最严格的 DMA 地址位宽，0 表示尚无限制
    dma_maskbits: AtomicU32,
    /// 主进程映射本记录的地址
    mem_cfg_addr: AtomicU64,
    tsc_hz: AtomicU64,
    /// 任一列表描述符变化时加一
    list_generation: AtomicU64,
    lists: [SharedListDesc; MAX_MEMSEG_LISTS],
    heaps: [HeapSlot; MAX_HEAPS],
    memzones: [MemzoneSlot; MAX_MEMZONES],
}

const_assert_eq!(std::mem::offset_of!(SharedHeader, stamp), 0);
const_assert_eq!(std::mem::offset_of!(ConfigStamp, magic), 0);
const_assert_eq!(std::mem::offset_of!(ConfigStamp, version), 4);
const_assert_eq!(std::mem::size_of::<SharedListDesc>() % 8, 0);

/// 共享区映射长度
pub const SHARED_REGION_SIZE: usize = align_up(std::mem::size_of::<SharedHeader>(), 4096);

/// 跨进程锁字
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockWord {
    Hotplug,
    Pool,
    Queue,
    Zone,
    HeapTable,
    Heap(usize),
}

/// 定长、以 NUL 结尾的名字；调用方已保证长度小于 `N`
pub(crate) fn encode_name<const N: usize>(name: &str) -> [u8; N] {
    let mut out = [0u8; N];
    let n = name.len().min(N - 1);
    out[..n].copy_from_slice(&name.as_bytes()[..n]);
    out
}

pub(crate) fn decode_name(bytes: &[u8]) -> &str {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    std::str::from_utf8(&bytes[..end]).unwrap_or("")
}

fn header_of(map: &SharedFileMapping) -> &SharedHeader {
    // SAFETY: 映射页对齐、长度不小于记录，全零是所有字段的合法值
    unsafe { &*(map.as_ptr() as *const SharedHeader) }
}

fn os_to_mem(e: OsalError) -> MemError {
    match e {
        OsalError::AddressMismatch { requested, actual } => MemError::AddressMismatch {
            expected: requested,
            actual,
        },
        e => e.into(),
    }
}

// ============================================================================
// 挂接流程
// ============================================================================

/// 已映射但未校验的共享区：只暴露戳
pub struct PendingRegion {
    map: SharedFileMapping,
}

impl PendingRegion {
    pub fn open(path: &Path) -> MemResult<Self> {
        Ok(Self {
            map: SharedFileMapping::open(path, SHARED_REGION_SIZE)?,
        })
    }

    pub fn stamp(&self) -> &ConfigStamp {
        &header_of(&self.map).stamp
    }

    /// 先校验魔数再校验版本，任一不符立即返回
    ///
    /// 戳仍为全零说明主进程刚创建文件还没写戳，先有限等待；超时仍为零返回
    /// `NotInitialized`。
    pub fn validate(self, expected: Stamp) -> MemResult<ValidatedRegion> {
        self.validate_within(expected, STAMP_WAIT)
    }

    pub fn validate_within(self, expected: Stamp, wait: Duration) -> MemResult<ValidatedRegion> {
        let magic = wait_stamped(&self.stamp().magic, wait);
        if magic == 0 && self.stamp().version.load(Ordering::Acquire) == 0 {
            let path = self
                .map
                .path()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            log::error!("shared config {path} was never stamped");
            return Err(MemError::NotInitialized(path));
        }
        if magic != expected.magic {
            log::error!(
                "shared config magic 0x{magic:08x} != 0x{:08x}",
                expected.magic
            );
            return Err(MemError::MagicMismatch {
                expected: expected.magic,
                found: magic,
            });
        }
        let version = self.stamp().version.load(Ordering::Acquire);
        if version != expected.version {
            log::error!(
                "shared config version {version} != {}, refusing to attach",
                expected.version
            );
            return Err(MemError::VersionMismatch {
                expected: expected.version,
                found: version,
            });
        }
        Ok(ValidatedRegion { map: self.map })
    }
}

/// 魔数最后写入；等到它非零或超时，返回最后读到的值
fn wait_stamped(magic: &AtomicU32, wait: Duration) -> u32 {
    let deadline = Instant::now() + wait;
    let mut delay = Duration::from_micros(50);
    loop {
        let m = magic.load(Ordering::Acquire);
        if m != 0 || Instant::now() >= deadline {
            return m;
        }
        std::thread::sleep(delay);
        delay = (delay * 2).min(Duration::from_millis(10));
    }
}

/// 戳已校验，等待主进程完成初始化
pub struct ValidatedRegion {
    map: SharedFileMapping,
}

impl ValidatedRegion {
    /// 阻塞直到初始化完成，然后迁移到主进程的地址
    pub fn wait_complete(self) -> MemResult<SharedRegion> {
        let header = header_of(&self.map);
        wait_flag(&header.init_complete);
        let addr = header.mem_cfg_addr.load(Ordering::Acquire) as usize;
        let map = self.map.remap_at(addr).map_err(os_to_mem)?;
        log::debug!("attached shared config at 0x{addr:x}");
        Ok(SharedRegion { map })
    }
}

/// 退避轮询，先自旋再以 50µs 起倍增、上限 10ms 的睡眠等待
fn wait_flag(flag: &AtomicU32) {
    let backoff = Backoff::new();
    while !backoff.is_completed() {
        if flag.load(Ordering::Acquire) != 0 {
            return;
        }
        backoff.snooze();
    }
    let mut delay = Duration::from_micros(50);
    while flag.load(Ordering::Acquire) == 0 {
        std::thread::sleep(delay);
        delay = (delay * 2).min(Duration::from_millis(10));
    }
}

// ============================================================================
// 共享区
// ============================================================================

/// 已校验、位于约定地址的共享配置区
pub struct SharedRegion {
    map: SharedFileMapping,
}

impl SharedRegion {
    /// 主进程创建文件后备的共享区并写入戳
    ///
    /// 先对文件加独占锁再清空内容；另一个主进程仍存活时返回 `Locked`，
    /// 它的记录保持原样。
    pub fn create_file(path: &Path, hint: usize, stamp: Stamp) -> MemResult<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(OsalError::from)?;
        }
        let map = match SharedFileMapping::create_exclusive(path, SHARED_REGION_SIZE, hint) {
            Err(OsalError::AddressMismatch { .. }) if hint != 0 => {
                log::warn!("shared config hint 0x{hint:x} unavailable, mapping anywhere");
                SharedFileMapping::create_exclusive(path, SHARED_REGION_SIZE, 0)?
            }
            r => r?,
        };
        let region = Self { map };
        region.stamp(stamp);
        Ok(region)
    }

    /// 进程内模式：匿名共享映射
    pub fn create_anonymous(stamp: Stamp) -> MemResult<Self> {
        let region = Self {
            map: SharedFileMapping::anonymous(SHARED_REGION_SIZE)?,
        };
        region.stamp(stamp);
        Ok(region)
    }

    /// 从进程挂接：校验、等待、迁移地址
    pub fn attach(path: &Path, expected: Stamp) -> MemResult<Self> {
        PendingRegion::open(path)?
            .validate(expected)?
            .wait_complete()
    }

    fn stamp(&self, stamp: Stamp) {
        let h = self.header();
        h.mem_cfg_addr
            .store(self.map.addr() as u64, Ordering::Relaxed);
        h.next_socket_id
            .store(MAX_NUMA_NODES as u32, Ordering::Relaxed);
        h.stamp.version.store(stamp.version, Ordering::Relaxed);
        h.stamp.magic.store(stamp.magic, Ordering::Release);
    }

    pub fn header(&self) -> &SharedHeader {
        header_of(&self.map)
    }

    pub fn addr(&self) -> usize {
        self.map.addr()
    }

    pub fn path(&self) -> Option<&Path> {
        self.map.path()
    }

    pub(crate) fn lock_word(&self, word: LockWord) -> &AtomicI32 {
        let h = self.header();
        match word {
            LockWord::Hotplug => &h.hotplug_lock,
            LockWord::Pool => &h.pool_lock,
            LockWord::Queue => &h.queue_lock,
            LockWord::Zone => &h.zone_lock,
            LockWord::HeapTable => &h.heap_table_lock,
            LockWord::Heap(id) => &h.heaps[id].lock,
        }
    }

    pub(crate) fn heap_slot(&self, id: usize) -> &HeapSlot {
        &self.header().heaps[id]
    }

    pub(crate) fn memzone_slots(&self) -> &[MemzoneSlot] {
        &self.header().memzones
    }

    /// 第 `idx` 个段列表的段表文件；匿名共享区没有
    pub(crate) fn list_table_path(&self, idx: usize) -> Option<PathBuf> {
        let path = self.path()?;
        let mut name = path.as_os_str().to_owned();
        name.push(format!(".msl{idx}"));
        Some(PathBuf::from(name))
    }

    /// 主进程写入通道/rank 与时钟频率
    pub(crate) fn set_platform(&self, nchannel: u32, nrank: u32, tsc_hz: u64) {
        let h = self.header();
        h.nchannel.store(nchannel, Ordering::Relaxed);
        h.nrank.store(nrank, Ordering::Relaxed);
        h.tsc_hz.store(tsc_hz, Ordering::Relaxed);
    }

    /// 标记初始化完成，唤醒等待的从进程
    pub(crate) fn complete(&self) {
        self.header().init_complete.store(1, Ordering::Release);
    }

    pub fn is_complete(&self) -> bool {
        self.header().init_complete.load(Ordering::Acquire) != 0
    }

    pub fn nchannel(&self) -> u32 {
        self.header().nchannel.load(Ordering::Relaxed)
    }

    pub fn nrank(&self) -> u32 {
        self.header().nrank.load(Ordering::Relaxed)
    }

    pub fn tsc_hz(&self) -> u64 {
        self.header().tsc_hz.load(Ordering::Relaxed)
    }

    pub fn mem_cfg_addr(&self) -> usize {
        self.header().mem_cfg_addr.load(Ordering::Relaxed) as usize
    }

    // ------------------------------------------------------------------------
    // 模式位
    // ------------------------------------------------------------------------

    pub(crate) fn set_mode_flags(&self, legacy_mem: bool, single_file_segments: bool) {
        let h = self.header();
        h.legacy_mem.store(legacy_mem as u32, Ordering::Release);
        h.single_file_segments
            .store(single_file_segments as u32, Ordering::Release);
    }

    /// (legacy_mem, single_file_segments)
    pub fn mode_flags(&self) -> (bool, bool) {
        let h = self.header();
        (
            h.legacy_mem.load(Ordering::Acquire) != 0,
            h.single_file_segments.load(Ordering::Acquire) != 0,
        )
    }

    // ------------------------------------------------------------------------
    // 多进程状态
    // ------------------------------------------------------------------------

    pub fn mp_status(&self) -> MpStatus {
        match self.header().mp_status.load(Ordering::Acquire) {
            1 => MpStatus::Enabled,
            2 => MpStatus::Disabled,
            _ => MpStatus::Unknown,
        }
    }

    /// 把状态从 Unknown 推进到 `to`；已经是 `to` 也算成功
    pub(crate) fn set_mp_status(&self, to: MpStatus) -> bool {
        let word = &self.header().mp_status;
        match word.compare_exchange(
            MpStatus::Unknown as u32,
            to as u32,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => true,
            Err(cur) => cur == to as u32,
        }
    }

    // ------------------------------------------------------------------------
    // 外部堆 socket id
    // ------------------------------------------------------------------------

    pub(crate) fn alloc_socket_id(&self) -> i32 {
        self.header().next_socket_id.fetch_add(1, Ordering::AcqRel) as i32
    }

    // ------------------------------------------------------------------------
    // DMA 掩码
    // ------------------------------------------------------------------------

    pub fn dma_maskbits(&self) -> u32 {
        self.header().dma_maskbits.load(Ordering::Acquire)
    }

    /// 记录更严格（更窄）的掩码
    pub(crate) fn tighten_dma_mask(&self, bits: u32) {
        let _ = self.header().dma_maskbits.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |cur| (cur == 0 || bits < cur).then_some(bits),
        );
    }

    // ------------------------------------------------------------------------
    // 段列表描述符
    // ------------------------------------------------------------------------

    /// 跨进程认领一个空闲列表槽位
    pub(crate) fn claim_list_slot(&self) -> Option<usize> {
        let pid = eal_osal::current_pid();
        self.header().lists.iter().position(|d| {
            let won = d
                .state
                .compare_exchange(DESC_FREE, DESC_CLAIMED, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok();
            if won {
                d.owner_pid.store(pid, Ordering::Relaxed);
                d.epoch.fetch_add(1, Ordering::AcqRel);
            }
            won
        })
    }

    /// 槽位当前的认领代数
    pub(crate) fn list_epoch(&self, idx: usize) -> u64 {
        self.header().lists[idx].epoch.load(Ordering::Acquire)
    }

    pub(crate) fn release_list_slot(&self, idx: usize) {
        let d = &self.header().lists[idx];
        d.version.fetch_add(1, Ordering::AcqRel);
        d.state.store(DESC_FREE, Ordering::Release);
        self.header().list_generation.fetch_add(1, Ordering::AcqRel);
    }

    /// 发布（或刷新）列表描述；返回发布后的版本
    pub(crate) fn publish_list(&self, info: &SegmentListInfo) -> u64 {
        let d = &self.header().lists[info.id.index()];
        d.base.store(info.base as u64, Ordering::Relaxed);
        d.len.store(info.len as u64, Ordering::Relaxed);
        d.page_size.store(info.page_size as u64, Ordering::Relaxed);
        d.owner_heap
            .store(info.owner_heap.map_or(0, |h| h as u32 + 1), Ordering::Relaxed);
        d.socket_id.store(info.socket_id, Ordering::Relaxed);
        let mut flags = 0;
        if info.external {
            flags |= DESC_FLAG_EXTERNAL;
        }
        if info.heap {
            flags |= DESC_FLAG_HEAP;
        }
        d.flags.store(flags, Ordering::Relaxed);
        d.capacity.store(info.capacity as u32, Ordering::Relaxed);
        d.used.store(info.used as u32, Ordering::Relaxed);
        let prev = d.version.fetch_max(info.version, Ordering::AcqRel);
        d.state.store(DESC_PUBLISHED, Ordering::Release);
        self.header().list_generation.fetch_add(1, Ordering::AcqRel);
        prev.max(info.version)
    }

    /// 描述符整体的变化计数，不变说明没有任何列表被发布或释放
    pub fn list_generation(&self) -> u64 {
        self.header().list_generation.load(Ordering::Acquire)
    }

    /// 共享区记录的列表版本；调用方比较它来判断缓存是否过期
    pub fn list_version(&self, idx: usize) -> u64 {
        self.header().lists[idx].version.load(Ordering::Acquire)
    }

    /// 读取已发布的列表描述
    pub fn list_descriptor(&self, idx: usize) -> Option<ListDescriptor> {
        let d = self.header().lists.get(idx)?;
        if d.state.load(Ordering::Acquire) != DESC_PUBLISHED {
            return None;
        }
        let flags = d.flags.load(Ordering::Relaxed);
        Some(ListDescriptor {
            index: idx,
            owner_pid: d.owner_pid.load(Ordering::Relaxed),
            version: d.version.load(Ordering::Acquire),
            epoch: d.epoch.load(Ordering::Acquire),
            base: d.base.load(Ordering::Relaxed) as usize,
            len: d.len.load(Ordering::Relaxed) as usize,
            page_size: d.page_size.load(Ordering::Relaxed) as usize,
            socket_id: d.socket_id.load(Ordering::Relaxed),
            capacity: d.capacity.load(Ordering::Relaxed) as usize,
            used: d.used.load(Ordering::Relaxed) as usize,
            external: flags & DESC_FLAG_EXTERNAL != 0,
            heap: flags & DESC_FLAG_HEAP != 0,
            owner_heap: d.owner_heap.load(Ordering::Relaxed).checked_sub(1).map(|h| h as usize),
        })
    }

    pub fn list_descriptors(&self) -> Vec<ListDescriptor> {
        (0..MAX_MEMSEG_LISTS)
            .filter_map(|i| self.list_descriptor(i))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::ListId;

    #[test]
    fn test_region_size_covers_header() {
        assert!(SHARED_REGION_SIZE >= std::mem::size_of::<SharedHeader>());
        assert_eq!(SHARED_REGION_SIZE % 4096, 0);
    }

    #[test]
    fn test_anonymous_region_stamp() {
        let r = SharedRegion::create_anonymous(Stamp::CURRENT).unwrap();
        assert_eq!(
            r.header().stamp.magic.load(Ordering::Relaxed),
            MEM_CONFIG_MAGIC
        );
        assert_eq!(r.mem_cfg_addr(), r.addr());
        assert!(!r.is_complete());
        r.complete();
        assert!(r.is_complete());
    }

    #[test]
    fn test_mode_flags_roundtrip() {
        let r = SharedRegion::create_anonymous(Stamp::CURRENT).unwrap();
        assert_eq!(r.mode_flags(), (false, false));
        r.set_mode_flags(true, false);
        assert_eq!(r.mode_flags(), (true, false));
    }

    #[test]
    fn test_mp_status_transitions() {
        let r = SharedRegion::create_anonymous(Stamp::CURRENT).unwrap();
        assert_eq!(r.mp_status(), MpStatus::Unknown);
        assert!(r.set_mp_status(MpStatus::Disabled));
        assert!(r.set_mp_status(MpStatus::Disabled));
        assert!(!r.set_mp_status(MpStatus::Enabled));
    }

    #[test]
    fn test_dma_mask_only_tightens() {
        let r = SharedRegion::create_anonymous(Stamp::CURRENT).unwrap();
        assert_eq!(r.dma_maskbits(), 0);
        r.tighten_dma_mask(48);
        r.tighten_dma_mask(52);
        assert_eq!(r.dma_maskbits(), 48);
        r.tighten_dma_mask(39);
        assert_eq!(r.dma_maskbits(), 39);
    }

    #[test]
    fn test_socket_ids_start_after_numa_nodes() {
        let r = SharedRegion::create_anonymous(Stamp::CURRENT).unwrap();
        assert_eq!(r.alloc_socket_id(), MAX_NUMA_NODES as i32);
        assert_eq!(r.alloc_socket_id(), MAX_NUMA_NODES as i32 + 1);
    }

    #[test]
    fn test_list_slot_claim_and_publish() {
        let r = SharedRegion::create_anonymous(Stamp::CURRENT).unwrap();
        let a = r.claim_list_slot().unwrap();
        let b = r.claim_list_slot().unwrap();
        assert_ne!(a, b);
        assert!(r.list_descriptor(a).is_none());

        let info = SegmentListInfo {
            id: ListId(a as u16),
            base: 0x4000_0000,
            len: 8 << 20,
            page_size: 2 << 20,
            socket_id: 0,
            capacity: 4,
            used: 1,
            version: 1,
            external: true,
            heap: false,
            owner_heap: Some(0),
        };
        let epoch = r.list_epoch(a);
        let generation = r.list_generation();
        assert_eq!(r.publish_list(&info), 1);
        assert_eq!(r.list_generation(), generation + 1);
        let d = r.list_descriptor(a).unwrap();
        assert!(d.external);
        assert_eq!(d.owner_heap, Some(0));
        assert_eq!(d.version, 1);
        assert_eq!(d.epoch, epoch);

        r.release_list_slot(a);
        assert!(r.list_descriptor(a).is_none());
        assert!(r.list_version(a) > 1);
        assert_eq!(r.list_generation(), generation + 2);
        assert_eq!(r.claim_list_slot(), Some(a));
        assert_eq!(r.list_epoch(a), epoch + 1);
    }

    #[test]
    fn test_name_encoding() {
        let bytes: [u8; 8] = encode_name("ring");
        assert_eq!(&bytes[..5], b"ring\0");
        assert_eq!(decode_name(&bytes), "ring");
        let full: [u8; 4] = encode_name("abcdef");
        assert_eq!(decode_name(&full), "abc");
    }

    #[test]
    fn test_list_table_path() {
        let anon = SharedRegion::create_anonymous(Stamp::CURRENT).unwrap();
        assert!(anon.list_table_path(0).is_none());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rte.config");
        let r = SharedRegion::create_file(&path, 0, Stamp::CURRENT).unwrap();
        assert_eq!(r.list_table_path(7), Some(dir.path().join("rte.config.msl7")));
    }

    #[test]
    fn test_validate_rejects_wrong_magic_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        let primary = SharedRegion::create_file(
            &path,
            0,
            Stamp {
                magic: 0xdead_beef,
                version: 99,
            },
        )
        .unwrap();
        let err = PendingRegion::open(&path)
            .unwrap()
            .validate(Stamp::CURRENT)
            .err()
            .unwrap();
        assert!(matches!(err, MemError::MagicMismatch { found: 0xdead_beef, .. }));
        drop(primary);
    }

    #[test]
    fn test_zero_stamp_is_not_initialized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::File::create(&path)
            .unwrap()
            .set_len(SHARED_REGION_SIZE as u64)
            .unwrap();
        let err = PendingRegion::open(&path)
            .unwrap()
            .validate_within(Stamp::CURRENT, Duration::from_millis(20))
            .err()
            .unwrap();
        assert!(matches!(err, MemError::NotInitialized(_)));
    }

    #[test]
    fn test_late_stamp_is_awaited() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::File::create(&path)
            .unwrap()
            .set_len(SHARED_REGION_SIZE as u64)
            .unwrap();
        let writer = PendingRegion::open(&path).unwrap();
        let stamper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            let stamp = writer.stamp();
            stamp.version.store(MEM_CONFIG_VERSION, Ordering::Relaxed);
            stamp.magic.store(MEM_CONFIG_MAGIC, Ordering::Release);
            writer
        });
        let validated = PendingRegion::open(&path)
            .unwrap()
            .validate_within(Stamp::CURRENT, Duration::from_secs(10));
        let _writer = stamper.join().unwrap();
        assert!(validated.is_ok());
    }

    #[test]
    fn test_second_primary_leaves_live_record_intact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        let first = SharedRegion::create_file(&path, 0, Stamp::CURRENT).unwrap();
        let idx = first.claim_list_slot().unwrap();
        first.complete();

        let err = SharedRegion::create_file(&path, 0, Stamp::CURRENT).err().unwrap();
        assert!(matches!(err, MemError::Os(OsalError::Locked(_))));

        assert_eq!(first.header().stamp.magic.load(Ordering::Acquire), MEM_CONFIG_MAGIC);
        assert!(first.is_complete());
        assert_eq!(first.list_epoch(idx), 1);
        // 从另一个映射读到的也是原记录
        let reader = PendingRegion::open(&path).unwrap();
        assert_eq!(reader.stamp().magic.load(Ordering::Acquire), MEM_CONFIG_MAGIC);
    }
}
