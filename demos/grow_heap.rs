//! This is a very minimal example to show using the RegionProvider functions.

use placement_alloc::{MmapRegions, RegionProvider};

fn main() {
    // MmapRegions uses libc to call mmap
    let mut regions = MmapRegions::default();
    let (p, sz) = unsafe { regions.reserve(8).unwrap() };
    println!("Returned: ({:p}={}, {})", p, p.as_ptr() as usize, sz);

    let (q, sz) = unsafe { regions.extend(3 * sz).unwrap() };
    println!("Extended: ({:p}={}, {})", q, q.as_ptr() as usize, sz);
    println!(
        "Pages: {}, growths: {}",
        regions.pages(),
        regions.growths()
    );
}
