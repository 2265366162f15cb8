//! eal-mem: 大页内存核心
//!
//! 用户态网络运行时的内存子系统，面向多个协作进程：
//!
//! - **段注册表**（[`registry`]）：按页规格与 NUMA 节点分组的大页段列表，
//!   支持遍历、外部内存注册/挂接、地址查询；
//! - **堆分配器**（[`heap`], [`malloc`]）：每节点一个堆（外加具名外部堆），
//!   13 个按几何级数划分的空闲链表桶，释放时双向合并，缺页时向注册表申请增长；
//! - **共享配置区**（[`shared`]）：各进程以相同地址映射的定长记录，带魔数与
//!   版本戳、跨进程锁和初始化完成握手；
//! - **回调注册表**（[`callbacks`]）：内存事件回调与增长前的校验回调。
//!
//! 入口是 [`MemConfig`]：主进程用 [`MemConfig::init`] 创建，从进程挂接并校验。
//!
//! ## 锁顺序
//!
//! pool → queue → zone → heap table → heap → hotplug → callbacks。
//! debug 构建下逆序加锁会触发断言。

pub mod callbacks;
pub mod error;
pub mod global;
pub mod heap;
pub mod malloc;
pub mod mcfg;
pub mod memzone;
pub mod page_source;
pub mod registry;
mod seg_table;
pub mod segment;
pub mod shared;
pub mod sync;

pub use callbacks::{EventCallback, MemEvent, ValidatorCallback};
pub use error::{AllocFailure, MemError, MemResult};
pub use heap::{HeapStats, SocketStats};
pub use malloc::AllocRequest;
pub use mcfg::{LEGACY_DEFAULT_MEMORY, MemConfig, SOCKET_LIMIT_VALIDATOR};
pub use memzone::Memzone;
pub use page_source::{AnonymousPageSource, HugetlbfsPageSource, PageSource};
pub use segment::{
    ListId, MemorySegment, SegmentFlags, SegmentListInfo, WalkOutcome, WalkStep,
};

// ============================================================================
// 常量
// ============================================================================

/// 段列表上限
pub const MAX_MEMSEG_LISTS: usize = 64;
/// 堆上限（每 NUMA 节点一个，其余给外部堆）
pub const MAX_HEAPS: usize = 32;
/// 每个堆的元素上限（空闲与占用合计）
pub const MAX_HEAP_ELEMS: usize = 8192;
/// 内存区上限
pub const MAX_MEMZONES: usize = 2560;
/// 每个堆的空闲链表桶数
pub const HEAP_NUM_FREELISTS: usize = 13;
/// 堆名最大长度（含结尾）
pub const HEAP_NAME_MAX_LEN: usize = 32;
/// 回调名最大长度（含结尾）
pub const CALLBACK_NAME_MAX_LEN: usize = 64;
/// 内存区名最大长度（含结尾）
pub const MEMZONE_NAMESIZE: usize = 32;
/// 缓存行大小，也是堆元素的地址粒度
pub const CACHE_LINE_SIZE: usize = 64;
/// 最小元素大小
pub const MIN_ELEM_SIZE: usize = CACHE_LINE_SIZE;

/// 任意节点
pub const SOCKET_ID_ANY: i32 = -1;
/// 无效 IOVA
pub const BAD_IOVA: u64 = u64::MAX;

pub const PGSIZE_4K: usize = 1 << 12;
pub const PGSIZE_64K: usize = 1 << 16;
pub const PGSIZE_2M: usize = 1 << 21;
pub const PGSIZE_16M: usize = 1 << 24;
pub const PGSIZE_1G: usize = 1 << 30;

pub use eal_common::MAX_NUMA_NODES;
pub use shared::{MEM_CONFIG_MAGIC, MEM_CONFIG_VERSION};
