//! Walks a pool through basic use, edge cases, and the same fragmentation
//! scenario under every placement strategy, dumping the chain after each.
//!
//! Pass a strategy name (`first`, `best`, `worst`, `next`) to run the
//! scenario for that strategy only.

use placement_alloc::{MmapRegions, Pool, Strategy};

const REGION_SIZE: usize = 1024 * 1024;

fn print_pool(pool: &Pool<MmapRegions>) {
    println!("\n Mem state:");
    for block in pool.dump() {
        println!("{}", block);
    }
    println!();
}

fn basic_operations(pool: &mut Pool<MmapRegions>) {
    let a = pool.alloc(100).expect("100 bytes should fit");
    println!("Allocated 100 bytes at: {:p}", a);
    assert_eq!(a.as_ptr() as usize % 8, 0, "Memory isn't aligned to 8 bytes");
    unsafe { pool.free(a.as_ptr()).expect("a was just allocated") };
    print_pool(pool);
}

fn edge_cases(pool: &mut Pool<MmapRegions>) {
    println!("Edge:");
    assert!(pool.alloc(0).is_none(), "Size 0 should be refused");
    assert!(pool.alloc(usize::MAX).is_none(), "Huge sizes should be refused");

    let c = pool.alloc(50).expect("50 bytes should fit");
    unsafe {
        pool.free(c.as_ptr()).expect("c was just allocated");
        pool.free(c.as_ptr()).expect("a repeated free is accepted");
    }
    println!("Repeated free of {:p} accepted.", c);

    let d = pool.alloc(20).expect("20 bytes should fit");
    let e = pool.alloc(30).expect("30 bytes should fit");
    unsafe { pool.free(d.as_ptr()).expect("d was just allocated") };
    let f = pool.alloc(10).expect("10 bytes should fit");
    unsafe {
        pool.free(e.as_ptr()).expect("e is live");
        pool.free(f.as_ptr()).expect("f is live");
    }
    print_pool(pool);
}

fn fragmentation(strategy: Strategy) {
    println!("== {}", strategy);
    let mut pool = Pool::new(MmapRegions::new());
    if let Err(err) = pool.init(REGION_SIZE, strategy) {
        eprintln!("Could not initialize a {} pool: {}", strategy, err);
        return;
    }

    let a = pool.alloc(5000);
    let b = pool.alloc(1000);
    let c = pool.alloc(3000);
    println!("Alloc 5000, 1000, 3000 bytes at: {:?}, {:?}, {:?}", a, b, c);
    if let Some(b) = b {
        unsafe { pool.free(b.as_ptr()).expect("b is live") };
    }
    let d = pool.alloc(800);
    println!("Alloc 800 bytes at: {:?}", d);
    print_pool(&pool);
}

fn main() {
    env_logger::init();

    let only: Option<Strategy> = match std::env::args().nth(1) {
        None => None,
        Some(arg) => match arg.parse() {
            Ok(strategy) => Some(strategy),
            Err(err) => {
                eprintln!("{}: {}", arg, err);
                std::process::exit(2);
            }
        },
    };

    let mut pool = Pool::new(MmapRegions::new());
    pool.init(REGION_SIZE, Strategy::FirstFit)
        .expect("Could not reserve the demo region");
    basic_operations(&mut pool);
    edge_cases(&mut pool);

    match only {
        Some(strategy) => fragmentation(strategy),
        None => Strategy::ALL.iter().copied().for_each(fragmentation),
    }
}
