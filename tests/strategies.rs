use core::ptr::NonNull;

use placement_alloc::{
    BlockInfo, MmapRegions, Pool, PoolError, Strategy, ALIGNMENT, HEADER_SIZE, MAX_ALLOC_SIZE,
};

use test_env_log::test;

const MIB: usize = 1024 * 1024;

fn snapshot<P>(pool: &Pool<P>) -> Vec<BlockInfo> {
    pool.dump().collect()
}

fn addr(ptr: NonNull<u8>) -> usize {
    ptr.as_ptr() as usize
}

/// Allocate 5000, 1000 and 3000 bytes, free the 1000, then ask for 800.
///
/// Returns the pool and the pointers for (1000, 3000, 800).
fn scenario(
    region_size: usize,
    strategy: Strategy,
) -> (Pool<MmapRegions>, NonNull<u8>, NonNull<u8>, NonNull<u8>) {
    let mut pool = Pool::new(MmapRegions::new());
    pool.init(region_size, strategy).unwrap();

    let _a = pool.alloc(5000).unwrap();
    let b = pool.alloc(1000).unwrap();
    let c = pool.alloc(3000).unwrap();
    unsafe { pool.free(b.as_ptr()).unwrap() };
    let d = pool.alloc(800).unwrap();

    for block in pool.dump() {
        log::info!("{}: {}", strategy, block);
    }
    (pool, b, c, d)
}

#[test]
fn test_freed_block_reused_first_and_best_fit() {
    for &strategy in [Strategy::FirstFit, Strategy::BestFit].iter() {
        let (pool, b, _c, d) = scenario(MIB, strategy);
        assert_eq!(d, b, "{} should reuse the freed block", strategy);

        let blocks = snapshot(&pool);
        // 5000, 800, the 176 byte remainder of the freed block, 3000, tail
        assert_eq!(blocks.len(), 5);
        assert_eq!((blocks[1].size, blocks[1].free), (800, false));
        assert_eq!((blocks[2].size, blocks[2].free), (1000 - 800 - HEADER_SIZE, true));

        let (validity, stats) = pool.stats();
        assert!(validity.is_valid());
        assert_eq!(stats.footprint(), MIB);
    }
}

#[test]
fn test_worst_and_next_fit_take_the_tail() {
    for &strategy in [Strategy::WorstFit, Strategy::NextFit].iter() {
        let (pool, b, c, d) = scenario(MIB, strategy);
        assert_ne!(d, b);
        // The free remainder right after the 3000 byte block.
        assert_eq!(addr(d), addr(c) + 3000 + HEADER_SIZE, "{}", strategy);

        let freed = pool
            .dump()
            .find(|block| block.payload() == b.as_ptr() as *const u8)
            .unwrap();
        assert!(freed.free);
        assert_eq!(freed.size, 1000);
    }
}

#[test]
fn test_single_candidate() {
    // Sized so the 3000 byte request swallows the rest of the region, leaving
    // the freed 1000 byte block as the only free one.
    let region_size = 3 * HEADER_SIZE + 5000 + 1000 + 3000;

    for &strategy in [Strategy::FirstFit, Strategy::BestFit, Strategy::WorstFit].iter() {
        let (pool, b, _c, d) = scenario(region_size, strategy);
        assert_eq!(d, b, "{}", strategy);
        assert_eq!(pool.stats().1.footprint(), region_size);
    }

    // Next fit resumes at the 3000 byte block and does not wrap around, so
    // it grows the heap instead.
    let (pool, b, _c, d) = scenario(region_size, Strategy::NextFit);
    assert_ne!(d, b);
    let tail = pool.blocks().tail().map(BlockInfo::from).unwrap();
    assert_eq!(tail.payload(), d.as_ptr() as *const u8);
    assert_eq!((tail.size, tail.free), (800, false));
    assert_eq!(pool.provider().growths(), 2);
}

/// Free blocks of 100, 500 and 50 bytes, in that order, with nothing else
/// free in the pool.
fn fragmented(strategy: Strategy) -> (Pool<MmapRegions>, [NonNull<u8>; 3]) {
    let sizes = [100, 8, 500, 8, 50, 8];
    let region_size: usize =
        sizes.len() * HEADER_SIZE + sizes.iter().map(|&s| (s + 7) / 8 * 8).sum::<usize>();

    let mut pool = Pool::new(MmapRegions::new());
    pool.init(region_size, strategy).unwrap();
    let ptrs: Vec<NonNull<u8>> = sizes.iter().map(|&s| pool.alloc(s).unwrap()).collect();
    assert_eq!(pool.stats().1.free_blocks, 0);

    let freed = [ptrs[0], ptrs[2], ptrs[4]];
    for ptr in freed.iter() {
        unsafe { pool.free(ptr.as_ptr()).unwrap() };
    }
    (pool, freed)
}

#[test]
fn test_best_fit_picks_tightest() {
    let (mut pool, [_p100, _p500, p50]) = fragmented(Strategy::BestFit);
    assert_eq!(pool.alloc(40), Some(p50));
}

#[test]
fn test_worst_fit_picks_largest() {
    let (mut pool, [_p100, p500, _p50]) = fragmented(Strategy::WorstFit);
    assert_eq!(pool.alloc(40), Some(p500));
}

#[test]
fn test_first_fit_picks_earliest() {
    let (mut pool, [p100, _p500, _p50]) = fragmented(Strategy::FirstFit);
    assert_eq!(pool.alloc(40), Some(p100));
}

#[test]
fn test_next_fit_does_not_wrap() {
    let (mut pool, freed) = fragmented(Strategy::NextFit);
    // The cursor sits on the last block carved out, at the tail, so the free
    // blocks before it are out of reach and the heap grows.
    let p = pool.alloc(40).unwrap();
    assert!(!freed.contains(&p));
    let tail = pool.blocks().tail().map(BlockInfo::from).unwrap();
    assert_eq!(tail.payload(), p.as_ptr() as *const u8);
    assert_eq!(pool.stats().1.free_blocks, 3);
}

#[test]
fn test_alignment_across_sizes() {
    let mut pool = Pool::new(MmapRegions::new());
    pool.init(MIB, Strategy::FirstFit).unwrap();

    let sizes = [1, 3, 7, 8, 9, 15, 17, 100, 4095, 4096, 65_537, MIB, MAX_ALLOC_SIZE];
    for &size in sizes.iter() {
        let ptr = pool
            .alloc(size)
            .unwrap_or_else(|| panic!("alloc({}) failed", size));
        assert_eq!(addr(ptr) % ALIGNMENT, 0, "alloc({})", size);
        unsafe { ptr.as_ptr().write_bytes(0x5A, size) };

        let block = pool
            .dump()
            .find(|b| b.payload() == ptr.as_ptr() as *const u8)
            .unwrap();
        assert!(block.size >= size);
        assert!(!block.free);
    }

    let (validity, _) = pool.stats();
    assert!(validity.is_valid());
}

#[test]
fn test_invalid_sizes_any_state() {
    let mut pool = Pool::new(MmapRegions::new());
    assert_eq!(pool.alloc(0), None);
    assert_eq!(pool.alloc(usize::MAX), None);

    pool.init(MIB, Strategy::WorstFit).unwrap();
    let _p = pool.alloc(64).unwrap();
    let before = snapshot(&pool);
    assert_eq!(pool.alloc(0), None);
    assert_eq!(pool.alloc(usize::MAX), None);
    assert_eq!(pool.alloc(MAX_ALLOC_SIZE + 1), None);
    assert_eq!(snapshot(&pool), before);
}

#[test]
fn test_double_free_is_harmless() {
    for &strategy in Strategy::ALL.iter() {
        let mut pool = Pool::new(MmapRegions::new());
        pool.init(MIB, strategy).unwrap();

        let p = pool.alloc(50).unwrap();
        let q = pool.alloc(70).unwrap();
        assert_eq!(unsafe { pool.free(p.as_ptr()) }, Ok(()));
        let once = snapshot(&pool);
        assert_eq!(unsafe { pool.free(p.as_ptr()) }, Ok(()));
        assert_eq!(snapshot(&pool), once);

        let r = pool.alloc(20).unwrap();
        let s = pool.alloc(30).unwrap();
        assert_ne!(r, s);
        assert_ne!(r, q);
        assert_ne!(s, q);

        let (validity, _) = pool.stats();
        assert!(validity.is_valid());
        assert_eq!(
            unsafe { pool.free(core::ptr::null_mut()) },
            Err(PoolError::InvalidFree)
        );
    }
}

#[test]
fn test_reinit_rejected() {
    let mut pool = Pool::new(MmapRegions::new());
    pool.init(MIB, Strategy::FirstFit).unwrap();
    let p = pool.alloc(5000).unwrap();
    unsafe { p.as_ptr().write_bytes(0xC3, 5000) };
    let before = snapshot(&pool);

    assert_eq!(pool.init(MIB, Strategy::BestFit), Err(PoolError::DoubleInit));
    assert_eq!(pool.strategy(), Strategy::FirstFit);
    assert_eq!(snapshot(&pool), before);

    let contents = unsafe { core::slice::from_raw_parts(p.as_ptr(), 5000) };
    assert!(contents.iter().all(|&b| b == 0xC3));
}
