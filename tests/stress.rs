//! Stress tests with fill-pattern corruption detection.
//!
//! The allocator is installed as the global allocator, so the test
//! harness itself runs on it too. Buffers are filled with a pattern
//! derived from their address and verified before each free: any
//! use-after-free, double free or overflow shows up as a mismatch.

use scmalloc::ScMalloc;
use std::alloc::{GlobalAlloc, Layout};
use std::sync::mpsc;
use std::thread;

#[global_allocator]
static GLOBAL: ScMalloc = ScMalloc;

fn fill_pattern(ptr: *mut u8, size: usize) {
    let seed = ptr as usize ^ size;
    for i in 0..size {
        unsafe {
            *ptr.add(i) = ((seed.wrapping_add(i).wrapping_mul(0x9E37_79B9)) & 0xFF) as u8;
        }
    }
}

fn check_pattern(ptr: *mut u8, size: usize) -> bool {
    let seed = ptr as usize ^ size;
    for i in 0..size {
        let expected = ((seed.wrapping_add(i).wrapping_mul(0x9E37_79B9)) & 0xFF) as u8;
        if unsafe { *ptr.add(i) } != expected {
            return false;
        }
    }
    true
}

#[test]
fn stress_single_thread_churn() {
    let sizes: &[usize] = &[8, 16, 32, 64, 128, 256, 512, 1024, 4096, 8192, 40_000];
    let rounds = 50;

    let mut live: Vec<(*mut u8, Layout)> = Vec::new();

    for round in 0..rounds {
        for &size in sizes {
            let layout = Layout::from_size_align(size, 8).unwrap();
            let ptr = unsafe { GLOBAL.alloc(layout) };
            assert!(!ptr.is_null(), "alloc failed for size {size}");
            fill_pattern(ptr, size);
            live.push((ptr, layout));
        }

        for &(ptr, layout) in &live {
            assert!(
                check_pattern(ptr, layout.size()),
                "corruption at round {round}, size {}",
                layout.size()
            );
        }

        // Free half, interleaved, to churn the free lists.
        let drain_count = live.len() / 2;
        for _ in 0..drain_count {
            let idx = (round * 7 + 3) % live.len();
            let (ptr, layout) = live.swap_remove(idx);
            assert!(
                check_pattern(ptr, layout.size()),
                "corruption before free at round {round}"
            );
            unsafe { GLOBAL.dealloc(ptr, layout) };
        }
    }

    for (ptr, layout) in live {
        assert!(check_pattern(ptr, layout.size()));
        unsafe { GLOBAL.dealloc(ptr, layout) };
    }
}

struct SendPtr(*mut u8, usize);
unsafe impl Send for SendPtr {}

#[test]
fn stress_cross_thread_free() {
    // Producers allocate and fill; consumers verify and free. Every
    // free lands on a foreign thread, driving the public free lists
    // and the privatization machinery.
    let num_producers = 4;
    let per_producer = 2000;
    let sizes: &[usize] = &[16, 48, 200, 1024, 2688, 8128, 20_000];

    let (tx, rx) = mpsc::channel::<SendPtr>();

    let producers: Vec<_> = (0..num_producers)
        .map(|_| {
            let tx = tx.clone();
            thread::spawn(move || {
                for i in 0..per_producer {
                    let size = sizes[i % sizes.len()];
                    let ptr = scmalloc::api::malloc(size);
                    assert!(!ptr.is_null());
                    fill_pattern(ptr, size);
                    tx.send(SendPtr(ptr, size)).unwrap();
                }
            })
        })
        .collect();
    drop(tx);

    let consumer = thread::spawn(move || {
        let mut freed = 0usize;
        while let Ok(SendPtr(ptr, size)) = rx.recv() {
            assert!(check_pattern(ptr, size), "corruption crossing threads");
            unsafe { scmalloc::api::free(ptr) };
            freed += 1;
        }
        freed
    });

    for p in producers {
        p.join().unwrap();
    }
    assert_eq!(consumer.join().unwrap(), num_producers * per_producer);
}

#[test]
fn stress_foreign_free_then_reuse() {
    // A thread's freed-by-others memory must satisfy its next
    // allocations without growing the heap: allocate a batch, have
    // another thread free it, then allocate the same batch again.
    let size = 2688; // six objects per slab, so a batch spans many slabs
    let batch = 100;

    let ptrs: Vec<SendPtr> = (0..batch)
        .map(|_| {
            let p = scmalloc::api::malloc(size);
            assert!(!p.is_null());
            SendPtr(p, size)
        })
        .collect();

    thread::spawn(move || {
        for SendPtr(p, _) in ptrs {
            unsafe { scmalloc::api::free(p) };
        }
    })
    .join()
    .unwrap();

    // The next batch must come out of the privatized public free
    // lists; the exact pointers return in some order.
    let again: Vec<*mut u8> = (0..batch)
        .map(|_| {
            let p = scmalloc::api::malloc(size);
            assert!(!p.is_null());
            p
        })
        .collect();
    for p in again {
        unsafe { scmalloc::api::free(p) };
    }
}

#[test]
fn stress_thread_exit_orphans_are_adopted() {
    // Threads die holding partially-used slabs; later threads of the
    // same size class must adopt them instead of growing the heap
    // without bound.
    for _ in 0..8 {
        let keep: Vec<SendPtr> = thread::spawn(|| {
            (0..64)
                .map(|_| {
                    let p = scmalloc::api::malloc(640);
                    assert!(!p.is_null());
                    fill_pattern(p, 640);
                    SendPtr(p, 640)
                })
                .collect()
        })
        .join()
        .unwrap();

        // The owning thread is gone; these blocks are orphaned now.
        let adopted = thread::spawn(move || {
            for SendPtr(p, size) in &keep {
                assert!(check_pattern(*p, *size), "orphaned slab corrupted");
            }
            for SendPtr(p, _) in keep {
                unsafe { scmalloc::api::free(p) };
            }
            // Allocating in the same class picks the orphans up.
            let p = scmalloc::api::malloc(640);
            assert!(!p.is_null());
            unsafe { scmalloc::api::free(p) };
        });
        adopted.join().unwrap();
    }
}

#[test]
fn stress_mixed_sizes_concurrent() {
    let num_threads = 8;
    let iters = 5_000;

    let handles: Vec<_> = (0..num_threads)
        .map(|t| {
            thread::spawn(move || {
                let mut live: Vec<(*mut u8, usize)> = Vec::new();
                for i in 0..iters {
                    let size = 1 + ((i * 2654435761 + t * 97) % 11_000);
                    let p = scmalloc::api::malloc(size);
                    assert!(!p.is_null());
                    unsafe {
                        *p = t as u8;
                        *p.add(size - 1) = t as u8;
                    }
                    live.push((p, size));
                    if live.len() > 64 {
                        let (q, sz) = live.swap_remove(i % live.len());
                        unsafe {
                            assert_eq!(*q, t as u8);
                            assert_eq!(*q.add(sz - 1), t as u8);
                            scmalloc::api::free(q);
                        }
                    }
                }
                for (q, _) in live {
                    unsafe { scmalloc::api::free(q) };
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
}
