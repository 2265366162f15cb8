//! 分配器集成测试：增长、归还、校验回调、事件顺序与具名堆

use std::alloc::{Layout, alloc, dealloc};
use std::sync::Arc;

use eal_common::MemoryConfig;
use eal_mem::{
    AllocFailure, AllocRequest, CACHE_LINE_SIZE, EventCallback, MemConfig, MemError, MemEvent,
    SegmentFlags, ValidatorCallback, WalkOutcome, WalkStep,
};
use parking_lot::Mutex;
use proptest::prelude::*;
use proptest::test_runner::TestRunner;

const MB: usize = 1 << 20;

fn in_memory() -> MemoryConfig {
    eal_common::init_test_logging();
    MemoryConfig {
        no_hugetlbfs: true,
        in_memory: true,
        numa_sockets: vec![0],
        ..MemoryConfig::default()
    }
}

fn init(config: MemoryConfig) -> MemConfig {
    match MemConfig::init(config) {
        Ok(mc) => mc,
        Err(e) => panic!("init failed: {e}"),
    }
}

fn addr(p: std::ptr::NonNull<u8>) -> usize {
    p.as_ptr() as usize
}

#[test]
fn freed_block_is_reused_first() {
    let mc = init(MemoryConfig {
        memory: 8 * MB,
        ..in_memory()
    });
    let a = mc.malloc_socket(MB, 0, 0).unwrap();
    let b = mc.malloc_socket(MB, 0, 0).unwrap();
    assert_eq!(addr(b), addr(a) + MB);
    mc.free(a).unwrap();
    let c = mc.malloc_socket(MB, 0, 0).unwrap();
    assert_eq!(a, c);
    assert_eq!(mc.registry().physmem_size(), 8 * MB);
    // 初始预留不归还
    mc.free(b).unwrap();
    mc.free(c).unwrap();
    assert_eq!(mc.registry().physmem_size(), 8 * MB);
}

#[test]
fn validator_vetoes_growth_past_limit() {
    let mc = init(MemoryConfig {
        no_huge_page_sizes: vec![MB],
        ..in_memory()
    });
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    let cb: ValidatorCallback = Arc::new(move |socket, current, proposed| {
        log.lock().push((socket, current, proposed));
        -1
    });
    mc.register_mem_alloc_validator("cap", cb, 0, 8 * MB).unwrap();

    let big = mc.malloc_socket(8 * MB, 0, 0).unwrap();
    assert!(seen.lock().is_empty());
    assert_eq!(mc.registry().physmem_size(), 8 * MB);

    let err = mc.malloc_socket(MB, 0, 0).unwrap_err();
    assert_eq!(err.alloc_failure(), Some(AllocFailure::Vetoed));
    assert_eq!(*seen.lock(), vec![(0, 8 * MB, 9 * MB)]);
    assert_eq!(mc.registry().physmem_size(), 8 * MB);

    mc.unregister_mem_alloc_validator("cap", 0).unwrap();
    let small = mc.malloc_socket(MB, 0, 0).unwrap();
    mc.free(small).unwrap();
    mc.free(big).unwrap();
}

#[test]
fn socket_limit_from_config() {
    let mc = init(MemoryConfig {
        no_huge_page_sizes: vec![2 * MB],
        socket_limit: vec![4 * MB],
        ..in_memory()
    });
    let a = mc.malloc_socket(3 * MB, 0, 0).unwrap();
    let err = mc.malloc_socket(3 * MB, 0, 0).unwrap_err();
    assert_eq!(err.alloc_failure(), Some(AllocFailure::Vetoed));
    mc.free(a).unwrap();
}

#[test]
fn fully_freed_growth_is_released() {
    let mc = init(in_memory());
    let a = mc.malloc_socket(100 << 10, 0, 0).unwrap();
    let b = mc.malloc_socket(300 << 10, 0, 0).unwrap();
    assert_eq!(mc.registry().physmem_size(), 2 * MB);
    let seg = mc.registry().virt2memseg(addr(a)).unwrap();
    assert!(!seg.flags.contains(SegmentFlags::DO_NOT_FREE));
    assert_eq!(mc.registry().virt2memseg(addr(b)).unwrap().addr, seg.addr);

    mc.free(a).unwrap();
    assert_eq!(mc.registry().physmem_size(), 2 * MB);
    mc.free(b).unwrap();
    assert_eq!(mc.registry().physmem_size(), 0);
    assert!(mc.registry().virt2memseg(addr(a)).is_none());

    let stats = mc.heap_stats("socket_0").unwrap();
    assert_eq!(stats.heap_totalsz_bytes, 0);
    assert_eq!(stats.free_count, 0);
    assert_eq!(stats.alloc_count, 0);
    mc.malloc_validate().unwrap();
}

#[test]
fn match_allocations_releases_whole_runs() {
    let mc = init(MemoryConfig {
        match_allocations: true,
        ..in_memory()
    });
    let a = mc.malloc_socket(3 * MB, 0, 0).unwrap();
    assert_eq!(mc.registry().physmem_size(), 4 * MB);
    mc.free(a).unwrap();
    assert_eq!(mc.registry().physmem_size(), 0);
}

#[test]
fn events_follow_growth_and_release() {
    let mc = init(in_memory());
    let events = Arc::new(Mutex::new(Vec::new()));
    let log = events.clone();
    let cb: EventCallback = Arc::new(move |ev, addr, len, arg| {
        log.lock().push((ev, addr, len, arg));
    });
    mc.register_mem_event_callback("recorder", cb.clone(), 7).unwrap();
    assert!(matches!(
        mc.register_mem_event_callback("recorder", cb, 7),
        Err(MemError::AlreadyExists(_))
    ));

    let p = mc.malloc_socket(MB, 0, 0).unwrap();
    mc.free(p).unwrap();

    let events = events.lock().clone();
    assert_eq!(events.len(), 2);
    let (ev, base, len, arg) = events[0];
    assert_eq!((ev, len, arg), (MemEvent::Alloc, 2 * MB, 7));
    assert!(base <= addr(p) && addr(p) < base + len);
    assert_eq!(events[1], (MemEvent::Free, base, len, 7));

    mc.unregister_mem_event_callback("recorder", 7).unwrap();
    assert!(matches!(
        mc.unregister_mem_event_callback("recorder", 7),
        Err(MemError::NotFound(_))
    ));
    let noop: EventCallback = Arc::new(|_, _, _, _| {});
    mc.register_mem_event_callback("recorder", noop, 7).unwrap();
}

#[test]
fn event_callback_walks_segments_without_locking() {
    let mc = Arc::new(init(in_memory()));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    let weak = Arc::downgrade(&mc);
    let cb: EventCallback = Arc::new(move |ev, base, len, _| {
        let Some(mc) = weak.upgrade() else {
            return;
        };
        let mut covered = 0;
        // SAFETY: 事件回调在持有 hotplug 写锁的调用链中执行
        let outcome = unsafe {
            mc.memseg_walk_thread_unsafe(|_, seg| {
                if seg.addr >= base && seg.end() <= base + len {
                    covered += seg.len;
                }
                WalkStep::Continue
            })
        };
        log.lock().push((ev, covered, outcome));
    });
    mc.register_mem_event_callback("walker", cb, 0).unwrap();

    let p = mc.malloc_socket(MB, 0, 0).unwrap();
    mc.free(p).unwrap();

    // 增长时新页已可见，归还时页还未被收回
    let seen = seen.lock().clone();
    assert_eq!(
        seen,
        vec![
            (MemEvent::Alloc, 2 * MB, WalkOutcome::Completed),
            (MemEvent::Free, 2 * MB, WalkOutcome::Completed),
        ]
    );
    assert_eq!(mc.registry().physmem_size(), 0);
    mc.unregister_mem_event_callback("walker", 0).unwrap();
}

#[test]
fn legacy_mode_never_grows() {
    let mc = init(MemoryConfig {
        legacy_mem: true,
        memory: 4 * MB,
        ..in_memory()
    });
    let err = mc.malloc_socket(8 * MB, 0, 0).unwrap_err();
    assert_eq!(err.alloc_failure(), Some(AllocFailure::GrowthDisabled));
    let p = mc.malloc_socket(MB, 0, 0).unwrap();
    mc.free(p).unwrap();
    assert_eq!(mc.registry().physmem_size(), 4 * MB);
}

#[test]
fn zmalloc_clears_and_realloc_preserves() {
    let mc = init(MemoryConfig {
        memory: 4 * MB,
        ..in_memory()
    });
    let dirty = mc.malloc_socket(4096, 0, 0).unwrap();
    // SAFETY: 4096 字节的新块
    unsafe { std::ptr::write_bytes(dirty.as_ptr(), 0xab, 4096) };
    mc.free(dirty).unwrap();

    let p = mc.zmalloc_socket(4096, 0, 0).unwrap();
    // SAFETY: 同上
    let bytes = unsafe { std::slice::from_raw_parts(p.as_ptr(), 4096) };
    assert!(bytes.iter().all(|&b| b == 0));
    // SAFETY: 同上
    unsafe { std::ptr::write_bytes(p.as_ptr(), 0x5a, 4096) };

    // 后继空闲，原地扩大
    let q = mc.realloc(Some(p), 8192, 0, 0).unwrap();
    assert_eq!(p, q);
    assert!(mc.usable_size(q).unwrap() >= 8192);

    // 后继被占用，搬迁并保留内容
    let blocker = mc.malloc_socket(64, 0, 0).unwrap();
    let r = mc.realloc(Some(q), 64 << 10, 0, 0).unwrap();
    assert_ne!(q, r);
    // SAFETY: 新块至少 64 KiB
    let moved = unsafe { std::slice::from_raw_parts(r.as_ptr(), 4096) };
    assert!(moved.iter().all(|&b| b == 0x5a));
    mc.free(r).unwrap();
    mc.free(blocker).unwrap();
    assert!(mc.free(r).is_err());
}

#[test]
fn double_free_and_foreign_pointer_rejected() {
    let mc = init(MemoryConfig {
        memory: 2 * MB,
        ..in_memory()
    });
    let p = mc.malloc(256, 0).unwrap();
    mc.free(p).unwrap();
    assert!(matches!(mc.free(p), Err(MemError::InvalidArgument(_))));
    let mut local = 0u64;
    let foreign = std::ptr::NonNull::from(&mut local).cast::<u8>();
    assert!(matches!(mc.free(foreign), Err(MemError::InvalidArgument(_))));
}

#[test]
fn contiguous_allocations_span_contiguous_iova() {
    let mc = init(in_memory());
    let p = mc
        .allocate(0, AllocRequest::new(3 * MB).align(MB).contig())
        .unwrap();
    assert_eq!(addr(p) % MB, 0);
    let first = mc.registry().virt2memseg(addr(p)).unwrap();
    let last = mc.registry().virt2memseg(addr(p) + 3 * MB - 1).unwrap();
    assert_eq!(
        last.iova_of(addr(p) + 3 * MB - 1) - first.iova_of(addr(p)),
        (3 * MB - 1) as u64
    );
    mc.free(p).unwrap();
}

#[test]
fn aligned_bounded_allocations_hold_their_contract() {
    let mc = init(MemoryConfig {
        memory: 16 * MB,
        ..in_memory()
    });
    let strategy = (1usize..64 << 10, 6u32..13, 0u32..4).prop_map(|(size, align_shift, extra)| {
        let align = 1usize << align_shift;
        let bound = (size.max(align)).next_power_of_two() << extra;
        (size, align, bound)
    });
    let mut runner = TestRunner::new(ProptestConfig::with_cases(128));
    runner
        .run(&strategy, |(size, align, bound)| {
            let req = AllocRequest::new(size).align(align).bound(bound);
            let p = mc.allocate(0, req).map_err(|e| TestCaseError::fail(e.to_string()))?;
            let a = addr(p);
            prop_assert_eq!(a % align, 0);
            prop_assert_eq!(a % CACHE_LINE_SIZE, 0);
            prop_assert_eq!(a / bound, (a + size - 1) / bound);
            prop_assert!(mc.usable_size(p).unwrap() >= size);
            mc.free(p).map_err(|e| TestCaseError::fail(e.to_string()))?;
            Ok(())
        })
        .unwrap();
    mc.malloc_validate().unwrap();
    let stats = mc.heap_stats("socket_0").unwrap();
    assert_eq!(stats.alloc_count, 0);
    assert_eq!(stats.free_count, 1);
}

#[test]
fn live_allocations_never_overlap() {
    let mc = init(MemoryConfig {
        memory: 8 * MB,
        ..in_memory()
    });
    let mut live: Vec<(usize, usize)> = Vec::new();
    for i in 0..200usize {
        let size = 64 + (i * 977) % 20_000;
        let p = mc.malloc(size, 0).unwrap();
        live.push((addr(p), size));
        if i % 3 == 0 {
            let (a, _) = live.remove(i % live.len());
            mc.free(std::ptr::NonNull::new(a as *mut u8).unwrap()).unwrap();
        }
    }
    let mut sorted = live.clone();
    sorted.sort_unstable();
    for w in sorted.windows(2) {
        assert!(w[0].0 + w[0].1 <= w[1].0, "{:x?} overlaps {:x?}", w[0], w[1]);
    }
    let stats = mc.heap_stats("socket_0").unwrap();
    assert_eq!(stats.alloc_count, live.len());
    assert_eq!(
        stats.heap_allocsz_bytes + stats.heap_freesz_bytes,
        stats.heap_totalsz_bytes
    );
    mc.malloc_validate().unwrap();
}

#[test]
fn named_heap_with_external_memory() {
    let mc = init(in_memory());
    let socket = mc.create_heap("ext").unwrap();
    assert!(socket >= eal_mem::MAX_NUMA_NODES as i32);
    assert_eq!(mc.heap_get_socket("ext").unwrap(), socket);
    assert!(matches!(mc.create_heap("ext"), Err(MemError::AlreadyExists(_))));

    let len = MB;
    let layout = Layout::from_size_align(len, 4096).unwrap();
    // SAFETY: 非零大小
    let base = unsafe { alloc(layout) } as usize;
    assert_ne!(base, 0);
    let iovas: Vec<u64> = (0..len / 4096).map(|i| 0x1_0000_0000 + (i * 4096) as u64).collect();
    mc.heap_add_external_memory("ext", base, len, &iovas, 4096).unwrap();

    let p = mc.malloc_socket(4096, 4096, socket).unwrap();
    assert!(addr(p) >= base && addr(p) + 4096 <= base + len);
    let mz_iova = mc.registry().virt2memseg(addr(p)).unwrap().iova_of(addr(p));
    assert_eq!(mz_iova, 0x1_0000_0000 + (addr(p) - base) as u64);

    // 外部堆不增长
    let err = mc.malloc_socket(2 * MB, 0, socket).unwrap_err();
    assert_eq!(err.alloc_failure(), Some(AllocFailure::GrowthDisabled));

    assert!(matches!(
        mc.heap_remove_external_memory("ext", base, len),
        Err(MemError::Busy(_))
    ));
    assert!(matches!(mc.destroy_heap("ext"), Err(MemError::Busy(_))));
    mc.free(p).unwrap();
    // 外部内存不归还给页来源
    assert!(mc.registry().virt2memseg(base).is_some());

    mc.heap_remove_external_memory("ext", base, len).unwrap();
    assert!(mc.registry().virt2memseg(base).is_none());
    mc.destroy_heap("ext").unwrap();
    assert!(mc.heap_get_socket("ext").is_err());
    assert!(matches!(mc.destroy_heap("socket_0"), Err(MemError::InvalidArgument(_))));
    // SAFETY: 与上面的 alloc 配对
    unsafe { dealloc(base as *mut u8, layout) };
}

#[test]
fn socket_stats_and_dumps() {
    let mc = init(MemoryConfig {
        memory: 4 * MB,
        ..in_memory()
    });
    let p = mc.malloc_socket(1000, 0, 0).unwrap();
    let stats = mc.socket_stats(0).unwrap();
    assert_eq!(stats.heap_count, 1);
    assert_eq!(stats.totals.alloc_count, 1);
    assert_eq!(stats.totals.heap_totalsz_bytes, 4 * MB);
    assert!(mc.socket_stats(5).is_err());

    let mut out = Vec::new();
    mc.dump_stats(&mut out).unwrap();
    mc.dump_heaps(&mut out).unwrap();
    mc.dump_physmem_layout(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("socket_0"));
    mc.free(p).unwrap();
}

#[test]
fn walks_report_their_outcome() {
    let mc = init(MemoryConfig {
        memory: 8 * MB,
        ..in_memory()
    });
    let mut pages = 0;
    let done = mc.memseg_walk(|_, _| {
        pages += 1;
        WalkStep::Continue
    });
    assert_eq!((done.code(), pages), (0, 4));
    assert_eq!(mc.memseg_walk(|_, _| WalkStep::Stop).code(), 1);
    assert_eq!(mc.memseg_walk(|_, _| WalkStep::Fail).code(), -1);

    let mut contig = Vec::new();
    mc.memseg_contig_walk(|_, seg, len| {
        contig.push((seg.addr, len));
        WalkStep::Continue
    });
    assert_eq!(contig.len(), 1);
    assert_eq!(contig[0].1, 8 * MB);

    let mut lists = 0;
    assert_eq!(
        mc.memseg_list_walk(|_| {
            lists += 1;
            WalkStep::Continue
        })
        .code(),
        0
    );
    assert_eq!(lists, 1);
}

#[test]
fn concurrent_allocations_from_threads() {
    let mc = Arc::new(init(MemoryConfig {
        memory: 16 * MB,
        ..in_memory()
    }));
    let handles: Vec<_> = (0..4)
        .map(|t| {
            let mc = mc.clone();
            std::thread::spawn(move || {
                for i in 0..200usize {
                    let size = 64 * (1 + (i + t) % 50);
                    let p = mc.malloc_socket(size, 0, 0).unwrap();
                    // SAFETY: 独占的新块
                    unsafe { std::ptr::write_bytes(p.as_ptr(), t as u8, size) };
                    mc.free(p).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    let stats = mc.heap_stats("socket_0").unwrap();
    assert_eq!(stats.alloc_count, 0);
    assert_eq!(stats.heap_freesz_bytes, 16 * MB);
    mc.malloc_validate().unwrap();
}
