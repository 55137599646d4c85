use super::*;
use crate::fault::Link;
use crate::header::HEADER_SIZE;
use crate::region::ArenaRegion;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};


const PAGE: usize = 4096;

#[derive(Clone)]
#[repr(C, align(4096))]
struct Page([u8; PAGE]);

/// Backing memory for an [`ArenaRegion`], page aligned so that chunk
/// addresses are predictable.
struct Arena {
    pages: Vec<Page>,
}

impl Arena {
    fn new(pages: usize) -> Self {
        format::init();
        Arena {
            pages: vec![Page([0; PAGE]); pages],
        }
    }

    fn heap(&mut self) -> RawHeap<ArenaRegion> {
        let len = self.pages.len() * PAGE;
        let region = ArenaRegion::new(self.pages.as_mut_ptr().cast(), len, PAGE);
        unsafe { RawHeap::with_region(region) }
    }
}

fn alloc(heap: &mut RawHeap<ArenaRegion>, size: usize) -> *mut u8 {
    heap.allocate(size)
        .expect("heap should be intact")
        .expect("arena should not be exhausted")
        .as_ptr()
}

fn free(heap: &mut RawHeap<ArenaRegion>, ptr: *mut u8) {
    unsafe { heap.release(ptr) }.expect("release should succeed")
}

fn header_of(ptr: *mut u8) -> *mut ChunkHeader {
    ChunkHeader::from_data(ptr)
}

#[test]
fn test_small_allocation_takes_one_page() {
    let mut arena = Arena::new(8);
    let mut heap = arena.heap();

    let p = alloc(&mut heap, 4);
    assert_eq!(heap.region().used(), PAGE);
    assert_eq!(p as usize % CHUNK_ALIGN, 0);
    unsafe { p.cast::<u32>().write(5) };

    free(&mut heap, p);
    assert_eq!(heap.region().used(), 0);
    assert!(heap.is_empty());
    assert_eq!(heap.chunks().count(), 0);
}

#[test]
fn test_round_trip_from_empty_heap() {
    let mut arena = Arena::new(16);
    let mut heap = arena.heap();

    for size in [0, 1, 15, 16, 100, 4000, 4064, 4065, 5000, 10_000, 3 * PAGE] {
        let p = alloc(&mut heap, size);
        assert!(heap.region().used() >= size + HEADER_SIZE);
        assert_eq!(heap.region().used() % PAGE, 0);
        free(&mut heap, p);
        assert_eq!(heap.region().used(), 0, "size {size}");
    }
}

#[test]
fn test_round_trip_with_live_allocation() {
    let mut arena = Arena::new(16);
    let mut heap = arena.heap();

    let live = alloc(&mut heap, 16);
    let before = heap.region().used();
    assert_eq!(before, PAGE);

    for size in [1, 100, 4016, 4017, 5000, 10_000, 20_000] {
        let p = alloc(&mut heap, size);
        free(&mut heap, p);
        assert_eq!(heap.region().used(), before, "size {size}");
        assert!(heap.verify().is_ok());
    }

    free(&mut heap, live);
    assert_eq!(heap.region().used(), 0);
}

#[test]
fn test_first_fit_reuse() {
    let mut arena = Arena::new(8);
    let mut heap = arena.heap();

    let a = alloc(&mut heap, 20);
    let c = alloc(&mut heap, 30);
    let used = heap.region().used();

    free(&mut heap, a);
    let b = alloc(&mut heap, 1);
    assert_eq!(a, b);
    assert_eq!(heap.region().used(), used);

    free(&mut heap, b);
    free(&mut heap, c);
    assert_eq!(heap.region().used(), 0);
}

#[test]
fn test_first_fit_prefers_lowest_address() {
    let mut arena = Arena::new(8);
    let mut heap = arena.heap();

    let a = alloc(&mut heap, 256);
    let _b = alloc(&mut heap, 16);
    let c = alloc(&mut heap, 64);
    let _d = alloc(&mut heap, 16);

    free(&mut heap, c);
    free(&mut heap, a);
    // Both holes fit, the one closer to the heap start wins even though
    // the other one is a tighter fit.
    assert_eq!(alloc(&mut heap, 48), a);
    assert_eq!(alloc(&mut heap, 48) as usize, a as usize + 48 + HEADER_SIZE);
}

#[test]
fn test_bulk_small_allocations_share_a_page() {
    let mut arena = Arena::new(8);
    let mut heap = arena.heap();

    let count = PAGE / (2 * (HEADER_SIZE + 16));
    let ptrs: Vec<*mut u8> = (0..count).map(|_| alloc(&mut heap, 16)).collect();
    assert_eq!(heap.region().used(), PAGE);

    for w in ptrs.windows(2) {
        assert_eq!(w[1] as usize - w[0] as usize, HEADER_SIZE + 16);
    }

    for p in ptrs.iter().step_by(2) {
        free(&mut heap, *p);
    }
    assert_eq!(heap.region().used(), PAGE);
    for p in ptrs.iter().skip(1).step_by(2) {
        free(&mut heap, *p);
    }
    assert_eq!(heap.region().used(), 0);
}

#[test]
fn test_zero_size_allocations() {
    let mut arena = Arena::new(4);
    let mut heap = arena.heap();

    let p1 = alloc(&mut heap, 0);
    let p2 = alloc(&mut heap, 0);
    assert!(!p1.is_null());
    assert!(!p2.is_null());
    assert_ne!(p1, p2);

    free(&mut heap, p1);
    free(&mut heap, p2);
    assert!(heap.is_empty());
}

#[test]
fn test_release_null_is_noop() {
    let mut arena = Arena::new(4);
    let mut heap = arena.heap();

    assert_eq!(unsafe { heap.release(null_mut()) }, Ok(()));
    let p = alloc(&mut heap, 8);
    assert_eq!(unsafe { heap.release(null_mut()) }, Ok(()));
    free(&mut heap, p);
}

#[test]
fn test_coalescing_backwards() {
    let mut arena = Arena::new(8);
    let mut heap = arena.heap();

    let a = alloc(&mut heap, 64);
    let b = alloc(&mut heap, 64);
    let _c = alloc(&mut heap, 64);
    let used = heap.region().used();

    free(&mut heap, b);
    free(&mut heap, a);

    let ab = alloc(&mut heap, 128);
    assert_eq!(ab, a);
    assert_eq!(heap.region().used(), used);
}

#[test]
fn test_coalescing_forwards() {
    let mut arena = Arena::new(8);
    let mut heap = arena.heap();

    let a = alloc(&mut heap, 64);
    let b = alloc(&mut heap, 64);
    let _c = alloc(&mut heap, 64);

    free(&mut heap, a);
    free(&mut heap, b);

    let free_chunks: Vec<ChunkInfo> = heap.chunks().filter(|c| c.available).collect();
    assert_eq!(free_chunks[0].addr, header_of(a) as usize);
    assert_eq!(free_chunks[0].data_size, 2 * 64 + HEADER_SIZE);
    assert_eq!(alloc(&mut heap, 64 + HEADER_SIZE + 64), a);
}

#[test]
fn test_no_adjacent_free_chunks() {
    let mut arena = Arena::new(8);
    let mut heap = arena.heap();

    let ptrs: Vec<*mut u8> = (0..6).map(|i| alloc(&mut heap, 32 * (i + 1))).collect();
    for i in [1, 3, 2, 5] {
        free(&mut heap, ptrs[i]);
    }

    let chunks: Vec<ChunkInfo> = heap.chunks().collect();
    for w in chunks.windows(2) {
        assert!(!(w[0].available && w[1].available));
    }
}

#[test]
fn test_split_keeps_small_remainder() {
    let mut arena = Arena::new(8);
    let mut heap = arena.heap();

    let a = alloc(&mut heap, 64);
    let _b = alloc(&mut heap, 16);
    free(&mut heap, a);

    // 64 - 32 leaves exactly a header's worth, not worth a chunk.
    let c = alloc(&mut heap, 32);
    assert_eq!(c, a);
    let chunk = heap.chunks().next().unwrap();
    assert_eq!(chunk.data_size, 64);
    assert!(!chunk.available);
}

#[test]
fn test_split_creates_free_chunk() {
    let mut arena = Arena::new(8);
    let mut heap = arena.heap();

    let a = alloc(&mut heap, 256);
    let _b = alloc(&mut heap, 16);
    free(&mut heap, a);

    let c = alloc(&mut heap, 64);
    assert_eq!(c, a);
    let chunks: Vec<ChunkInfo> = heap.chunks().collect();
    assert_eq!(chunks[0].data_size, 64);
    assert!(chunks[1].available);
    assert_eq!(chunks[1].data_size, 256 - 64 - HEADER_SIZE);
    assert_eq!(chunks[1].prev, chunks[0].addr);
    assert_eq!(chunks[2].prev, chunks[1].addr);
}

#[test]
fn test_growth_absorbs_free_tail() {
    let mut arena = Arena::new(8);
    let mut heap = arena.heap();

    let a = alloc(&mut heap, 16);
    let tail = heap.chunks().last().unwrap();
    assert!(tail.available);
    assert_eq!(tail.data_size, PAGE - 2 * HEADER_SIZE - 16);

    // Does not fit into the tail, but the tail is reused instead of wasted.
    let b = alloc(&mut heap, 5000);
    assert_eq!(b as usize, tail.data);
    assert_eq!(heap.region().used(), 2 * PAGE);
    assert_eq!(heap.chunks().next().unwrap().data, a as usize);
}

#[test]
fn test_partial_shrink_releases_whole_pages() {
    let mut arena = Arena::new(8);
    let mut heap = arena.heap();

    let _a = alloc(&mut heap, 16);
    let big = alloc(&mut heap, 3 * PAGE);
    assert_eq!(heap.region().used(), 4 * PAGE);

    free(&mut heap, big);
    assert_eq!(heap.region().used(), PAGE);

    let tail = heap.chunks().last().unwrap();
    assert!(tail.available);
    assert!(tail.data_size >= HEADER_SIZE);
    assert!(tail.data_size - HEADER_SIZE < PAGE);
    assert!(heap.verify().is_ok());
}

#[test]
fn test_tail_smaller_than_a_page_is_kept() {
    let mut arena = Arena::new(8);
    let mut heap = arena.heap();

    // Fills the first page exactly.
    let a = alloc(&mut heap, PAGE - HEADER_SIZE);
    let b = alloc(&mut heap, 16);
    assert_eq!(heap.region().used(), 2 * PAGE);

    free(&mut heap, b);
    assert_eq!(heap.region().used(), 2 * PAGE);
    assert_eq!(heap.chunks().count(), 2);

    free(&mut heap, a);
    assert_eq!(heap.region().used(), 0);
}

#[test]
fn test_exhaustion_is_recoverable() {
    let mut arena = Arena::new(4);
    let mut heap = arena.heap();

    let a = alloc(&mut heap, 100);
    assert_eq!(heap.allocate(5 * PAGE), Ok(None));
    assert!(heap.verify().is_ok());

    let b = alloc(&mut heap, 2 * PAGE);
    free(&mut heap, a);
    free(&mut heap, b);
    assert_eq!(heap.region().used(), 0);
}

#[test]
fn test_overflowing_requests() {
    let mut arena = Arena::new(4);
    let mut heap = arena.heap();

    assert_eq!(
        heap.allocate(usize::MAX - 5),
        Err(HeapFault::Overflow {
            size: usize::MAX - 5
        })
    );
    assert_eq!(heap.region().used(), 0);
}

#[test]
fn test_unroundable_request_is_out_of_memory() {
    let mut arena = Arena::new(4);
    let mut heap = arena.heap();

    // Fits a header but not the page rounding.
    let size = usize::MAX - HEADER_SIZE - CHUNK_ALIGN + 1;
    assert_eq!(heap.allocate(size), Ok(None));
    assert_eq!(heap.region().used(), 0);

    // Same with a free tail chunk to absorb.
    let a = alloc(&mut heap, 16);
    assert_eq!(heap.allocate(size), Ok(None));
    assert_eq!(heap.region().used(), PAGE);
    assert!(heap.verify().is_ok());
    free(&mut heap, a);
    assert_eq!(heap.region().used(), 0);
}

#[test]
fn test_double_free() {
    let mut arena = Arena::new(4);
    let mut heap = arena.heap();

    let a = alloc(&mut heap, 64);
    let _b = alloc(&mut heap, 40);
    free(&mut heap, a);
    assert_eq!(
        unsafe { heap.release(a) },
        Err(HeapFault::DoubleFree { ptr: a as usize })
    );
}

#[test]
fn test_double_free_of_merged_chunk() {
    let mut arena = Arena::new(4);
    let mut heap = arena.heap();

    let a = alloc(&mut heap, 64);
    let b = alloc(&mut heap, 64);
    let _c = alloc(&mut heap, 64);
    free(&mut heap, a);
    free(&mut heap, b);
    // b's header was folded into a, it must not pass for a live one.
    assert_eq!(
        unsafe { heap.release(b) },
        Err(HeapFault::CorruptedHeader {
            chunk: header_of(b) as usize
        })
    );
}

#[test]
fn test_free_of_offset_pointer() {
    let mut arena = Arena::new(4);
    let mut heap = arena.heap();

    let a = alloc(&mut heap, 64);
    let _b = alloc(&mut heap, 40);

    let p = unsafe { a.add(1) };
    assert_eq!(
        unsafe { heap.release(p) },
        Err(HeapFault::Misaligned { ptr: p as usize })
    );

    // Aligned but in the middle of a's header.
    let p = unsafe { a.add(16) };
    assert_eq!(
        unsafe { heap.release(p) },
        Err(HeapFault::CorruptedHeader {
            chunk: header_of(p) as usize
        })
    );
}

#[test]
fn test_free_outside_of_heap() {
    let mut arena = Arena::new(4);
    let mut heap = arena.heap();

    let mut local = [0_u8; 64];
    assert_eq!(
        unsafe { heap.release(local.as_mut_ptr()) },
        Err(HeapFault::OutOfBounds {
            ptr: local.as_mut_ptr() as usize
        })
    );

    let a = alloc(&mut heap, 64);
    let past_end = unsafe { a.add(2 * PAGE) };
    assert_eq!(
        unsafe { heap.release(past_end) },
        Err(HeapFault::OutOfBounds {
            ptr: past_end as usize
        })
    );
    let before_start = unsafe { a.sub(HEADER_SIZE) };
    assert_eq!(
        unsafe { heap.release(before_start) },
        Err(HeapFault::OutOfBounds {
            ptr: before_start as usize
        })
    );
}

#[test]
fn test_overwritten_sentinel() {
    let mut arena = Arena::new(4);
    let mut heap = arena.heap();

    let a = alloc(&mut heap, 16);
    let b = alloc(&mut heap, 16);
    // Writes past the end of a, over b's sentinel.
    unsafe { a.write_bytes(b'A', 16 + 4) };

    assert_eq!(
        unsafe { heap.release(a) },
        Err(HeapFault::CorruptedHeader {
            chunk: header_of(b) as usize
        })
    );
    // Allocation verifies too.
    assert_eq!(
        heap.allocate(8),
        Err(HeapFault::CorruptedHeader {
            chunk: header_of(b) as usize
        })
    );
}

#[test]
fn test_overwritten_free_flag() {
    let mut arena = Arena::new(4);
    let mut heap = arena.heap();

    let a = alloc(&mut heap, 16);
    let b = alloc(&mut heap, 16);
    unsafe { (*header_of(b)).available = 7 };
    assert_eq!(
        heap.verify(),
        Err(HeapFault::CorruptedHeader {
            chunk: header_of(b) as usize
        })
    );
    unsafe { (*header_of(b)).available = 0 };
    free(&mut heap, a);
}

#[test]
fn test_overwritten_data_size() {
    let mut arena = Arena::new(4);
    let mut heap = arena.heap();

    let a = alloc(&mut heap, 16);
    let b = alloc(&mut heap, 16);
    unsafe { (*header_of(a)).data_size = 64 };
    assert_eq!(
        heap.verify(),
        Err(HeapFault::BrokenChain {
            chunk: header_of(a) as usize,
            expected: a as usize + 64,
            found: header_of(b) as usize,
        })
    );
}

#[test]
fn test_overwritten_links() {
    let mut arena = Arena::new(4);
    let mut heap = arena.heap();

    let a = alloc(&mut heap, 16);
    let b = alloc(&mut heap, 16);
    let (ha, hb) = (header_of(a), header_of(b));

    unsafe { (*ha).prev = hb };
    assert_eq!(
        heap.verify(),
        Err(HeapFault::LinkOutOfRange {
            chunk: ha as usize,
            link: Link::Prev,
            target: hb as usize,
        })
    );
    unsafe { (*ha).prev = null_mut() };

    unsafe { (*hb).prev = hb };
    assert_eq!(
        heap.verify(),
        Err(HeapFault::BrokenBackLink {
            chunk: ha as usize,
            next: hb as usize,
        })
    );
    unsafe { (*hb).prev = ha };

    unsafe { (*ha).next = ha };
    assert_eq!(
        heap.verify(),
        Err(HeapFault::LinkOutOfRange {
            chunk: ha as usize,
            link: Link::Next,
            target: ha as usize,
        })
    );
    unsafe { (*ha).next = hb };

    // The tail chunk after b now claims a as its predecessor.
    let tail = heap.heap_end;
    unsafe { (*tail).prev = ha };
    assert_eq!(
        heap.verify(),
        Err(HeapFault::BrokenBackLink {
            chunk: hb as usize,
            next: tail as usize,
        })
    );
    unsafe { (*tail).prev = hb };

    assert!(heap.verify().is_ok());
}

#[test]
fn test_chain_ending_early() {
    let mut arena = Arena::new(4);
    let mut heap = arena.heap();

    let _a = alloc(&mut heap, 16);
    let b = alloc(&mut heap, 16);
    let hb = header_of(b);
    unsafe { (*hb).next = null_mut() };
    assert_eq!(
        heap.verify(),
        Err(HeapFault::TailMismatch {
            last: hb as usize,
            heap_end: heap.heap_end as usize,
        })
    );
}

#[test]
fn test_break_moved_behind_back() {
    let mut arena = Arena::new(4);
    let mut heap = arena.heap();

    let _a = alloc(&mut heap, 16);
    let brk = heap.region().brk().unwrap().as_ptr() as usize;
    heap.region.move_behind_back(PAGE);
    assert_eq!(
        heap.verify(),
        Err(HeapFault::BreakMismatch {
            tail_end: brk,
            brk: brk + PAGE,
        })
    );
}

#[test]
fn test_merge_overflow_is_reported() {
    let mut arena = Arena::new(4);
    let mut heap = arena.heap();

    let a = alloc(&mut heap, 16);
    let b = alloc(&mut heap, 16);
    let (ha, hb) = (header_of(a), header_of(b));
    unsafe {
        (*hb).set_available(true);
        (*ha).data_size = usize::MAX - 8;
        assert_eq!(
            heap.merge(ha),
            Err(HeapFault::MergeOverflow {
                chunk: ha as usize,
                absorbed: hb as usize,
            })
        );
    }
}

#[test]
fn test_usable_size() {
    let mut arena = Arena::new(4);
    let mut heap = arena.heap();

    let a = alloc(&mut heap, 10);
    let _b = alloc(&mut heap, 10);
    assert_eq!(unsafe { heap.usable_size(a) }, Ok(CHUNK_ALIGN));
    free(&mut heap, a);
    assert_eq!(
        unsafe { heap.usable_size(a) },
        Err(HeapFault::UseAfterFree { ptr: a as usize })
    );
}

#[test]
fn test_dump() {
    let mut arena = Arena::new(4);
    let mut heap = arena.heap();

    let a = alloc(&mut heap, 16);
    let _b = alloc(&mut heap, 16);
    free(&mut heap, a);

    let mut out = Vec::new();
    heap.dump(&mut out, Some("after free")).unwrap();
    let out = String::from_utf8(out).unwrap();

    assert!(out.contains("STATUS    : after free"));
    assert!(out.contains(&format!("HEAP START: {:p}", header_of(a))));
    assert_eq!(out.matches("------------").count(), 3);
    assert_eq!(out.matches("available: true").count(), 2);
    assert!(!out.contains("(corrupted)"));
}

#[test]
fn test_random_workload() {
    let mut arena = Arena::new(256);
    let mut heap = arena.heap();
    let mut rng = StdRng::seed_from_u64(0x5EED);

    let mut live: Vec<(*mut u8, usize, u8)> = vec![];
    for round in 0..4000 {
        if live.is_empty() || rng.gen_bool(0.55) {
            let size = match rng.gen_range(0..10) {
                0 => rng.gen_range(PAGE..4 * PAGE),
                _ => rng.gen_range(0..512),
            };
            let Some(p) = heap.allocate(size).unwrap() else {
                continue;
            };
            let fill = round as u8;
            unsafe { p.as_ptr().write_bytes(fill, size) };
            live.push((p.as_ptr(), size, fill));
        } else {
            let (p, size, fill) = live.swap_remove(rng.gen_range(0..live.len()));
            let data = unsafe { core::slice::from_raw_parts(p, size) };
            assert!(data.iter().all(|&b| b == fill), "allocation was clobbered");
            free(&mut heap, p);
        }
    }

    while let Some((p, _, _)) = live.pop() {
        free(&mut heap, p);
    }
    assert!(heap.is_empty());
    assert_eq!(heap.region().used(), 0);
}

#[test]
fn test_aligned_allocation_places_padding_chunk() {
    let mut arena = Arena::new(8);
    let mut heap = arena.heap();
    let base = heap.region().base() as usize;

    let a = alloc(&mut heap, 16);
    assert_eq!(a as usize, base + HEADER_SIZE);

    // The first fit starts its data at base + 80, the next 128 aligned
    // address with room for a header in front of it is base + 128.
    let p = heap.allocate_aligned(100, 128).unwrap().unwrap().as_ptr();
    assert_eq!(p as usize, base + 128);

    let chunks: Vec<ChunkInfo> = heap.chunks().collect();
    assert_eq!(chunks.len(), 4);
    assert!(chunks[1].available);
    assert_eq!(chunks[1].data_size, 16);
    assert_eq!(chunks[2].data, p as usize);
    assert_eq!(chunks[2].data_size, 112);
    assert!(!chunks[2].available);
    assert!(chunks[3].available);
    assert!(heap.verify().is_ok());

    assert_eq!(unsafe { heap.usable_size(p) }, Ok(112));
    free(&mut heap, p);
    assert_eq!(heap.chunks().count(), 2);
    free(&mut heap, a);
    assert_eq!(heap.region().used(), 0);
}

#[test]
fn test_aligned_allocation_without_padding() {
    let mut arena = Arena::new(8);
    let mut heap = arena.heap();
    let base = heap.region().base() as usize;

    // The first data pointer is base + 32, already 32 aligned.
    let p = heap.allocate_aligned(64, 32).unwrap().unwrap().as_ptr();
    assert_eq!(p as usize, base + HEADER_SIZE);

    let chunks: Vec<ChunkInfo> = heap.chunks().collect();
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].data_size, 64);
    assert!(chunks[1].available);

    free(&mut heap, p);
    assert!(heap.is_empty());
}

#[test]
fn test_aligned_allocations() {
    let mut arena = Arena::new(64);
    let mut heap = arena.heap();

    let mut live = vec![];
    for (i, align) in [1, 8, 16, 32, 64, 128, 256, 4096, 128, 32].into_iter().enumerate() {
        let size = 24 * i + 1;
        let p = heap.allocate_aligned(size, align).unwrap().unwrap().as_ptr();
        assert_eq!(p as usize % align, 0, "align {align}");
        unsafe { p.write_bytes(i as u8, size) };
        live.push((p, size, i as u8));

        assert!(heap.verify().is_ok());
        let chunks: Vec<ChunkInfo> = heap.chunks().collect();
        for w in chunks.windows(2) {
            assert!(!(w[0].available && w[1].available));
        }
    }

    for (p, size, fill) in live.iter().step_by(2) {
        let data = unsafe { core::slice::from_raw_parts(*p, *size) };
        assert!(data.iter().all(|b| b == fill));
        free(&mut heap, *p);
    }
    for (p, _, _) in live.iter().skip(1).step_by(2) {
        free(&mut heap, *p);
    }
    assert!(heap.is_empty());
    assert_eq!(heap.region().used(), 0);
}

#[test]
#[should_panic]
fn test_aligned_allocation_rejects_odd_alignment() {
    let mut arena = Arena::new(4);
    let mut heap = arena.heap();
    let _ = heap.allocate_aligned(16, 48);
}
