//! 进程内存上下文
//!
//! [`MemConfig`] 把共享配置区、段注册表、堆表、回调表和内存区表组合在一起，
//! 生命周期明确：
//!
//! - 主进程 [`MemConfig::init_primary_with`]：创建并写戳共享区，推送模式位，
//!   建立每节点的堆，完成初始预留，最后置完成标志；
//! - 从进程 [`MemConfig::attach_secondary_with`]：先校验魔数与版本，等待完成
//!   标志，再拉取模式位。
//!
//! 堆元数据与内存区表都在共享配置区里，从进程看到的是同一批堆；段列表经
//! 描述符与段表在各进程间镜像。

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use eal_common::utils::{align_up, format_bytes};
use eal_common::{Config, MemoryConfig, ProcessType};
use eal_osal::SharedFileMapping;

use crate::callbacks::{CallbackRegistry, EventCallback, MemEvent, ValidatorCallback};
use crate::error::{MemError, MemResult};
use crate::heap::HeapTable;
use crate::memzone::MemzoneTable;
use crate::page_source::{AnonymousPageSource, HugetlbfsPageSource, PageSource};
use crate::registry::SegmentRegistry;
use crate::segment::{ListId, MemorySegment, SegmentFlags, SegmentList, WalkOutcome, WalkStep};
use crate::shared::{ListDescriptor, LockWord, MpStatus, SharedRegion, Stamp};
use crate::sync::{LockRank, RankedReadGuard, RankedRwLock, RankedWriteGuard, SharedLockRef};
use crate::MAX_NUMA_NODES;

/// 旧式内存模型下没有请求任何内存时的默认预留
pub const LEGACY_DEFAULT_MEMORY: usize = 64 << 20;

/// 由 `socket_limit` 安装的校验回调名
pub const SOCKET_LIMIT_VALIDATOR: &str = "socket-limit";

/// 进程内存上下文
pub struct MemConfig {
    pub(crate) config: MemoryConfig,
    process_type: ProcessType,
    pub(crate) shared: Arc<SharedRegion>,
    pub(crate) registry: SegmentRegistry,
    pub(crate) heaps: RankedRwLock<HeapTable>,
    pub(crate) callbacks: CallbackRegistry,
    pub(crate) memzones: RankedRwLock<MemzoneTable>,
    pool_lock: RankedRwLock<()>,
    queue_lock: RankedRwLock<()>,
    legacy_mem: AtomicBool,
    single_file_segments: AtomicBool,
    sockets: Vec<i32>,
}

impl MemConfig {
    /// 按配置初始化：决定进程类型，选择页来源，然后创建或挂接
    pub fn init(config: MemoryConfig) -> MemResult<Self> {
        config.validate()?;
        match resolve_process_type(&config)? {
            ProcessType::Secondary => {
                let (shared, config) = attach_region(config)?;
                let source = page_source_for(&config)?;
                Self::finish_attach(config, shared, source)
            }
            _ => {
                let source = page_source_for(&config)?;
                Self::init_primary_with(config, source)
            }
        }
    }

    /// 以主进程身份初始化
    pub fn init_primary_with(config: MemoryConfig, source: Arc<dyn PageSource>) -> MemResult<Self> {
        config.validate()?;
        let shared = if config.uses_shared_file() {
            SharedRegion::create_file(&config.config_file_path(), 0, Stamp::CURRENT)?
        } else {
            SharedRegion::create_anonymous(Stamp::CURRENT)?
        };
        let shared = Arc::new(shared);
        shared.set_platform(
            config.force_nchannel,
            config.force_nrank,
            eal_osal::estimate_tsc_hz(5),
        );
        let (legacy, single) = (config.legacy_mem, config.single_file_segments);
        let mc = Self::assemble(config, ProcessType::Primary, shared, source, legacy, single);
        mc.update_from_internal()?;
        let mp = if mc.config.uses_shared_file() {
            MpStatus::Enabled
        } else {
            MpStatus::Disabled
        };
        mc.shared.set_mp_status(mp);
        mc.create_socket_heaps()?;
        mc.reserve_initial_memory()?;
        mc.install_socket_limits()?;
        mc.shared.complete();
        log::info!(
            "primary memory config ready at 0x{:x}: sockets {:?}, {} mapped, page source '{}'",
            mc.shared.addr(),
            mc.sockets,
            format_bytes(mc.registry.physmem_size() as u64),
            mc.registry.page_source().name()
        );
        Ok(mc)
    }

    /// 以从进程身份挂接
    ///
    /// 校验失败（魔数或版本）时立即返回，不读取其他字段；之后阻塞到主进程
    /// 完成初始化。
    pub fn attach_secondary_with(config: MemoryConfig, source: Arc<dyn PageSource>) -> MemResult<Self> {
        config.validate()?;
        let (shared, config) = attach_region(config)?;
        Self::finish_attach(config, shared, source)
    }

    fn finish_attach(
        config: MemoryConfig,
        shared: Arc<SharedRegion>,
        source: Arc<dyn PageSource>,
    ) -> MemResult<Self> {
        if !shared.set_mp_status(MpStatus::Enabled) {
            return Err(MemError::NotSupported("multi-process disabled by the primary"));
        }
        let (legacy, single) = (config.legacy_mem, config.single_file_segments);
        let mc = Self::assemble(config, ProcessType::Secondary, shared, source, legacy, single);
        mc.update_internal();
        mc.create_socket_heaps()?;
        log::info!(
            "secondary attached to memory config at 0x{:x} ({} lists published)",
            mc.shared.addr(),
            mc.shared.list_descriptors().len()
        );
        Ok(mc)
    }

    fn assemble(
        config: MemoryConfig,
        process_type: ProcessType,
        shared: Arc<SharedRegion>,
        source: Arc<dyn PageSource>,
        legacy: bool,
        single_file: bool,
    ) -> Self {
        let sockets = detect_sockets(&config);
        let registry = SegmentRegistry::new(
            source,
            shared.clone(),
            config.segs_per_list,
            config.base_virtaddr,
            process_type == ProcessType::Primary,
        );
        let ranked = |rank: LockRank, word: LockWord| {
            RankedRwLock::with_shared(rank, SharedLockRef::new(shared.clone(), word), ())
        };
        Self {
            pool_lock: ranked(LockRank::Pool, LockWord::Pool),
            queue_lock: ranked(LockRank::Queue, LockWord::Queue),
            memzones: RankedRwLock::with_shared(
                LockRank::Zone,
                SharedLockRef::new(shared.clone(), LockWord::Zone),
                MemzoneTable::new(shared.clone()),
            ),
            heaps: RankedRwLock::with_shared(
                LockRank::HeapTable,
                SharedLockRef::new(shared.clone(), LockWord::HeapTable),
                HeapTable::new(shared.clone()),
            ),
            callbacks: CallbackRegistry::new(!legacy),
            legacy_mem: AtomicBool::new(legacy),
            single_file_segments: AtomicBool::new(single_file),
            config,
            process_type,
            shared,
            registry,
            sockets,
        }
    }

    /// 为每个节点建堆；从进程只补上主进程没有建的
    fn create_socket_heaps(&self) -> MemResult<()> {
        let mut heaps = self.heaps.write();
        for &socket in &self.sockets {
            let name = format!("socket_{socket}");
            if heaps.by_name(&name).is_none() {
                heaps.insert(&name, socket, false)?;
            }
        }
        Ok(())
    }

    /// 能放下 `bytes` 的最大页规格，没有则取最小规格
    fn initial_page_size(&self, bytes: usize) -> MemResult<usize> {
        let sizes = self.registry.page_source().page_sizes();
        sizes
            .iter()
            .rev()
            .find(|&&pg| pg <= bytes)
            .or_else(|| sizes.first())
            .copied()
            .ok_or(MemError::NotSupported("page source offers no page sizes"))
    }

    /// 初始预留，页标记为不归还
    fn reserve_initial_memory(&self) -> MemResult<()> {
        let first = self.sockets.first().copied().unwrap_or(0);
        let mut plan: Vec<(i32, usize)> = if self.config.memory > 0 {
            vec![(first, self.config.memory)]
        } else {
            (0..self.config.socket_mem.len())
                .map(|s| (s as i32, self.config.socket_mem_for(s as u32)))
                .filter(|&(_, bytes)| bytes > 0)
                .collect()
        };
        if plan.is_empty() && self.legacy_mem() {
            plan.push((first, LEGACY_DEFAULT_MEMORY));
        }

        for (socket, bytes) in plan {
            let heap = self.heaps.read().by_socket(socket).ok_or_else(|| {
                MemError::invalid(format!("memory requested on socket {socket}, which is not present"))
            })?;
            let pg = self.initial_page_size(bytes)?;
            let n_pages = align_up(bytes, pg) / pg;
            let mut h = heap.lock();
            let mut st = self.registry.write();
            let run = self.registry.map_run(&mut st, socket, pg, n_pages, heap.id())?;
            let list = run.list();
            let (addr, len) = self.registry.commit_run(&mut st, run, SegmentFlags::DO_NOT_FREE);
            self.callbacks.notify(MemEvent::Alloc, addr, len);
            h.add_memory(addr, len, list)?;
            log::info!(
                "reserved {} on socket {socket} in {} pages of {}",
                format_bytes(len as u64),
                n_pages,
                format_bytes(pg as u64)
            );
        }
        Ok(())
    }

    fn install_socket_limits(&self) -> MemResult<()> {
        for &socket in &self.sockets {
            let limit = self.config.socket_limit_for(socket as u32);
            if limit == 0 {
                continue;
            }
            let cb: ValidatorCallback = Arc::new(move |socket, current, proposed| {
                log::warn!(
                    "socket {socket} limit of {} reached: {} requested",
                    format_bytes(limit as u64),
                    format_bytes(proposed.saturating_sub(current) as u64)
                );
                -1
            });
            self.callbacks
                .register_validator(SOCKET_LIMIT_VALIDATOR, cb, socket, limit)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // 模式位
    // ------------------------------------------------------------------------

    /// 把本进程的旧式内存/单文件段标志推送到共享区（仅主进程）
    pub fn update_from_internal(&self) -> MemResult<()> {
        if !self.is_primary() {
            return Err(MemError::PrimaryOnly("update_from_internal"));
        }
        self.shared
            .set_mode_flags(self.legacy_mem(), self.single_file_segments());
        Ok(())
    }

    /// 从共享区拉取模式位到本进程
    pub fn update_internal(&self) -> (bool, bool) {
        let (legacy, single) = self.shared.mode_flags();
        self.legacy_mem.store(legacy, Ordering::Release);
        self.single_file_segments.store(single, Ordering::Release);
        (legacy, single)
    }

    pub fn legacy_mem(&self) -> bool {
        self.legacy_mem.load(Ordering::Acquire)
    }

    pub fn single_file_segments(&self) -> bool {
        self.single_file_segments.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------------
    // 访问器
    // ------------------------------------------------------------------------

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn process_type(&self) -> ProcessType {
        self.process_type
    }

    pub fn is_primary(&self) -> bool {
        self.process_type == ProcessType::Primary
    }

    pub fn shared(&self) -> &SharedRegion {
        &self.shared
    }

    pub fn registry(&self) -> &SegmentRegistry {
        &self.registry
    }

    pub fn callbacks(&self) -> &CallbackRegistry {
        &self.callbacks
    }

    pub fn sockets(&self) -> &[i32] {
        &self.sockets
    }

    pub fn mp_status(&self) -> MpStatus {
        self.shared.mp_status()
    }

    pub fn nchannel(&self) -> u32 {
        self.shared.nchannel()
    }

    pub fn nrank(&self) -> u32 {
        self.shared.nrank()
    }

    pub fn tsc_hz(&self) -> u64 {
        self.shared.tsc_hz()
    }

    /// 可用的最大 SIMD 位宽；0 表示不限制
    pub fn max_simd_bitwidth(&self) -> u16 {
        self.config.max_simd_bitwidth
    }

    /// 所有进程发布的段列表
    pub fn shared_lists(&self) -> Vec<ListDescriptor> {
        self.shared.list_descriptors()
    }

    // ------------------------------------------------------------------------
    // 跨进程锁
    // ------------------------------------------------------------------------

    pub fn pool_read(&self) -> RankedReadGuard<'_, ()> {
        self.pool_lock.read()
    }

    pub fn pool_write(&self) -> RankedWriteGuard<'_, ()> {
        self.pool_lock.write()
    }

    pub fn queue_read(&self) -> RankedReadGuard<'_, ()> {
        self.queue_lock.read()
    }

    pub fn queue_write(&self) -> RankedWriteGuard<'_, ()> {
        self.queue_lock.write()
    }

    // ------------------------------------------------------------------------
    // 段遍历与外部内存
    // ------------------------------------------------------------------------

    pub fn memseg_walk<F>(&self, f: F) -> WalkOutcome
    where
        F: FnMut(&SegmentList, &MemorySegment) -> WalkStep,
    {
        self.registry.walk_segments(f)
    }

    /// # Safety
    ///
    /// 只能在已持有 hotplug 锁的调用链中使用，例如事件或校验回调内。
    pub unsafe fn memseg_walk_thread_unsafe<F>(&self, f: F) -> WalkOutcome
    where
        F: FnMut(&SegmentList, &MemorySegment) -> WalkStep,
    {
        // SAFETY: 由调用方保证
        unsafe { self.registry.walk_segments_thread_unsafe(f) }
    }

    pub fn memseg_contig_walk<F>(&self, f: F) -> WalkOutcome
    where
        F: FnMut(&SegmentList, &MemorySegment, usize) -> WalkStep,
    {
        self.registry.walk_contig(f)
    }

    /// # Safety
    ///
    /// 同 [`Self::memseg_walk_thread_unsafe`]。
    pub unsafe fn memseg_contig_walk_thread_unsafe<F>(&self, f: F) -> WalkOutcome
    where
        F: FnMut(&SegmentList, &MemorySegment, usize) -> WalkStep,
    {
        // SAFETY: 由调用方保证
        unsafe { self.registry.walk_contig_thread_unsafe(f) }
    }

    pub fn memseg_list_walk<F>(&self, f: F) -> WalkOutcome
    where
        F: FnMut(&SegmentList) -> WalkStep,
    {
        self.registry.walk_lists(f)
    }

    /// # Safety
    ///
    /// 同 [`Self::memseg_walk_thread_unsafe`]。
    pub unsafe fn memseg_list_walk_thread_unsafe<F>(&self, f: F) -> WalkOutcome
    where
        F: FnMut(&SegmentList) -> WalkStep,
    {
        // SAFETY: 由调用方保证
        unsafe { self.registry.walk_lists_thread_unsafe(f) }
    }

    pub fn extmem_register(
        &self,
        addr: usize,
        len: usize,
        iovas: &[u64],
        page_size: usize,
    ) -> MemResult<ListId> {
        self.registry.register_external(addr, len, iovas, page_size)
    }

    pub fn extmem_unregister(&self, addr: usize, len: usize) -> MemResult<()> {
        self.registry.unregister_external(addr, len)
    }

    pub fn extmem_attach(&self, addr: usize, len: usize) -> MemResult<ListId> {
        self.registry.attach_external(addr, len)
    }

    pub fn extmem_detach(&self, addr: usize, len: usize) -> MemResult<()> {
        self.registry.detach_external(addr, len)
    }

    pub fn dump_physmem_layout(&self, out: &mut dyn Write) -> std::io::Result<()> {
        self.registry.dump_physmem_layout(out)
    }

    // ------------------------------------------------------------------------
    // 回调
    // ------------------------------------------------------------------------

    pub fn register_mem_event_callback(
        &self,
        name: &str,
        cb: EventCallback,
        arg: usize,
    ) -> MemResult<()> {
        self.callbacks.register_event(name, cb, arg)
    }

    pub fn unregister_mem_event_callback(&self, name: &str, arg: usize) -> MemResult<()> {
        self.callbacks.unregister_event(name, arg)
    }

    pub fn register_mem_alloc_validator(
        &self,
        name: &str,
        cb: ValidatorCallback,
        socket_id: i32,
        limit: usize,
    ) -> MemResult<()> {
        self.callbacks.register_validator(name, cb, socket_id, limit)
    }

    pub fn unregister_mem_alloc_validator(&self, name: &str, socket_id: i32) -> MemResult<()> {
        self.callbacks.unregister_validator(name, socket_id)
    }
}

fn resolve_process_type(config: &MemoryConfig) -> MemResult<ProcessType> {
    Ok(match config.process_type {
        ProcessType::Auto if !config.uses_shared_file() => ProcessType::Primary,
        ProcessType::Auto => {
            if SharedFileMapping::is_locked_elsewhere(&config.config_file_path())? {
                ProcessType::Secondary
            } else {
                ProcessType::Primary
            }
        }
        t => t,
    })
}

/// 挂接共享区并用主进程的模式位覆盖本地配置
fn attach_region(mut config: MemoryConfig) -> MemResult<(Arc<SharedRegion>, MemoryConfig)> {
    if !config.uses_shared_file() {
        return Err(MemError::NotSupported("secondary process without a shared config file"));
    }
    let shared = SharedRegion::attach(&config.config_file_path(), Stamp::CURRENT)?;
    let (legacy, single) = shared.mode_flags();
    config.legacy_mem = legacy;
    config.single_file_segments = single;
    Ok((Arc::new(shared), config))
}

/// 不用 hugetlbfs 时，多进程部署把页放在运行时目录下的普通文件里，其他进程才能映射
fn page_source_for(config: &MemoryConfig) -> MemResult<Arc<dyn PageSource>> {
    Ok(if config.no_hugetlbfs && config.uses_shared_file() {
        Arc::new(HugetlbfsPageSource::file_backed(config, config.runtime_dir())?)
    } else if config.no_hugetlbfs {
        Arc::new(AnonymousPageSource::from_config(config))
    } else {
        Arc::new(HugetlbfsPageSource::from_config(config)?)
    })
}

fn detect_sockets(config: &MemoryConfig) -> Vec<i32> {
    let mut sockets: Vec<u32> = if config.numa_sockets.is_empty() {
        eal_osal::numa::sockets()
    } else {
        config.numa_sockets.clone()
    };
    sockets.retain(|&s| (s as usize) < MAX_NUMA_NODES);
    sockets.sort_unstable();
    sockets.dedup();
    if sockets.is_empty() {
        sockets.push(0);
    }
    sockets.into_iter().map(|s| s as i32).collect()
}
