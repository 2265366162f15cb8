//! 多进程挂接：戳校验、模式位传递、跨进程共享的段列表、堆与内存区
//!
//! 跨进程用例重新执行本测试二进制，子进程通过环境变量得知自己的角色。

use std::path::{Path, PathBuf};
use std::process::Command;

use eal_common::{MemoryConfig, ProcessType};
use eal_mem::shared::{MpStatus, SharedRegion, Stamp};
use eal_mem::{MEM_CONFIG_MAGIC, MEM_CONFIG_VERSION, MemConfig, MemError, WalkStep};
use eal_osal::OsalError;

const CHILD_ENV: &str = "EAL_MEM_TEST_CHILD_DIR";
const PTR_ENV: &str = "EAL_MEM_TEST_PTR";
const MB: usize = 1 << 20;

fn file_backed(dir: &Path, process_type: ProcessType) -> MemoryConfig {
    eal_common::init_test_logging();
    MemoryConfig {
        no_hugetlbfs: true,
        numa_sockets: vec![0],
        runtime_dir: Some(dir.to_path_buf()),
        hugefile_prefix: "mptest".to_string(),
        process_type,
        ..MemoryConfig::default()
    }
}

fn init_err(config: MemoryConfig) -> MemError {
    match MemConfig::init(config) {
        Ok(_) => panic!("init unexpectedly succeeded"),
        Err(e) => e,
    }
}

#[test]
fn secondary_rejects_version_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = file_backed(dir.path(), ProcessType::Secondary);
    let stamp = Stamp {
        magic: MEM_CONFIG_MAGIC,
        version: MEM_CONFIG_VERSION + 1,
    };
    let _primary = SharedRegion::create_file(&cfg.config_file_path(), 0, stamp).unwrap();
    match init_err(cfg) {
        MemError::VersionMismatch { expected, found } => {
            assert_eq!(expected, MEM_CONFIG_VERSION);
            assert_eq!(found, MEM_CONFIG_VERSION + 1);
        }
        e => panic!("unexpected error: {e}"),
    }
}

#[test]
fn secondary_rejects_foreign_magic() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = file_backed(dir.path(), ProcessType::Secondary);
    let stamp = Stamp {
        magic: 0xdead_beef,
        version: MEM_CONFIG_VERSION,
    };
    let _primary = SharedRegion::create_file(&cfg.config_file_path(), 0, stamp).unwrap();
    assert!(matches!(
        init_err(cfg),
        MemError::MagicMismatch { found: 0xdead_beef, .. }
    ));
}

#[test]
fn secondary_needs_a_shared_file() {
    let cfg = MemoryConfig {
        in_memory: true,
        no_hugetlbfs: true,
        process_type: ProcessType::Secondary,
        ..MemoryConfig::default()
    };
    assert!(matches!(init_err(cfg), MemError::Config(_)));
}

#[test]
fn second_primary_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let first = MemConfig::init(file_backed(dir.path(), ProcessType::Primary)).unwrap();
    let p = first.malloc_socket(4096, 0, 0).unwrap();
    assert!(matches!(
        init_err(file_backed(dir.path(), ProcessType::Primary)),
        MemError::Os(OsalError::Locked(_))
    ));
    // 第一个主进程的记录未被改写
    assert!(first.registry().virt2memseg(p.as_ptr() as usize).is_some());
    assert_eq!(first.heap_stats("socket_0").unwrap().alloc_count, 1);
    first.free(p).unwrap();
}

#[test]
fn file_backed_primary_enables_multiprocess() {
    let dir = tempfile::tempdir().unwrap();
    let mc = MemConfig::init(file_backed(dir.path(), ProcessType::Primary)).unwrap();
    assert_eq!(mc.mp_status(), MpStatus::Enabled);
    assert!(mc.config().config_file_path().exists());
    assert_eq!(mc.shared().path(), Some(mc.config().config_file_path().as_path()));
}

/// 子进程：以 Auto 身份启动，应当发现主进程并挂接
fn run_secondary(dir: PathBuf) {
    let mc = MemConfig::init(file_backed(&dir, ProcessType::Auto)).unwrap();
    assert_eq!(mc.process_type(), ProcessType::Secondary);
    assert!(!mc.is_primary());
    assert_eq!((mc.nchannel(), mc.nrank()), (3, 1));
    assert_eq!(mc.shared().mode_flags(), (false, true));
    assert!(mc.single_file_segments());
    assert!(matches!(
        mc.update_from_internal(),
        Err(MemError::PrimaryOnly(_))
    ));

    let lists = mc.shared_lists();
    let heap_list = lists
        .iter()
        .find(|d| d.heap && !d.external)
        .expect("primary's heap list is published");
    assert_eq!(heap_list.page_size, 2 * MB);
    assert_eq!(heap_list.used, 2);
    assert_eq!(heap_list.socket_id, 0);
    assert_ne!(heap_list.owner_pid, std::process::id());
}

#[test]
fn secondary_sees_primary_segment_lists() {
    if let Ok(dir) = std::env::var(CHILD_ENV) {
        run_secondary(PathBuf::from(dir));
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let mc = MemConfig::init(MemoryConfig {
        memory: 4 * MB,
        force_nchannel: 3,
        force_nrank: 1,
        single_file_segments: true,
        ..file_backed(dir.path(), ProcessType::Primary)
    })
    .unwrap();
    assert!(mc.is_primary());

    let status = Command::new(std::env::current_exe().unwrap())
        .args(["secondary_sees_primary_segment_lists", "--exact", "--nocapture"])
        .env(CHILD_ENV, dir.path())
        .status()
        .unwrap();
    assert!(status.success(), "secondary process failed: {status}");
    assert_eq!(mc.mp_status(), MpStatus::Enabled);
}

/// 子进程：遍历主进程的段，读取并释放主进程分配的块
fn run_secondary_user(dir: PathBuf, ptr: usize) {
    let mc = MemConfig::init(file_backed(&dir, ProcessType::Secondary)).unwrap();

    let mut walked = 0;
    mc.memseg_walk(|_, seg| {
        walked += seg.len;
        WalkStep::Continue
    });
    assert_eq!(walked, 4 * MB);
    assert_eq!(mc.registry().physmem_size(), 4 * MB);

    let seg = mc.registry().virt2memseg(ptr).expect("primary's segment is mirrored");
    assert!(seg.addr <= ptr && ptr < seg.end());
    // SAFETY: 主进程写入的 64 字节，此时已映射到同一地址
    let bytes = unsafe { std::slice::from_raw_parts(ptr as *const u8, 64) };
    assert!(bytes.iter().all(|&b| b == 0x5a));

    let zone = mc.memzone_lookup("mp_zone").expect("primary's memzone is shared");
    assert_eq!(zone.len, 8192);
    assert_eq!(mc.registry().virt2memseg(zone.addr).map(|s| s.iova_of(zone.addr)), Some(zone.iova));

    assert_eq!(mc.heap_stats("socket_0").unwrap().alloc_count, 2);
    mc.free(std::ptr::NonNull::new(ptr as *mut u8).unwrap()).unwrap();
    assert_eq!(mc.heap_stats("socket_0").unwrap().alloc_count, 1);

    // 本进程分配的块同样落在共享堆上
    let own = mc.malloc_socket(4096, 0, 0).unwrap();
    mc.free(own).unwrap();
    mc.malloc_validate().unwrap();
}

#[test]
fn secondary_frees_primary_allocation() {
    if let (Ok(dir), Ok(ptr)) = (std::env::var(CHILD_ENV), std::env::var(PTR_ENV)) {
        run_secondary_user(PathBuf::from(dir), ptr.parse().unwrap());
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let mc = MemConfig::init(MemoryConfig {
        memory: 4 * MB,
        ..file_backed(dir.path(), ProcessType::Primary)
    })
    .unwrap();
    let p = mc.malloc_socket(64, 0, 0).unwrap();
    // SAFETY: 64 字节的新块
    unsafe { std::ptr::write_bytes(p.as_ptr(), 0x5a, 64) };
    mc.memzone_reserve("mp_zone", 8192, 0, 0, 0).unwrap();

    let status = Command::new(std::env::current_exe().unwrap())
        .args(["secondary_frees_primary_allocation", "--exact", "--nocapture"])
        .env(CHILD_ENV, dir.path())
        .env(PTR_ENV, (p.as_ptr() as usize).to_string())
        .status()
        .unwrap();
    assert!(status.success(), "secondary process failed: {status}");

    // 子进程的释放在共享堆上生效
    assert_eq!(mc.heap_stats("socket_0").unwrap().alloc_count, 1);
    assert!(matches!(mc.free(p), Err(MemError::InvalidArgument(_))));
    mc.memzone_free("mp_zone").unwrap();
    mc.malloc_validate().unwrap();
}
