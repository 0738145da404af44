//! Lock-free operation combining for large-object cache bins.
//!
//! Threads publish operation records onto a pending list; the thread
//! whose push turns the list non-empty becomes the next drainer and
//! applies the whole batch while holding a handler-busy flag, so all
//! mutations of one bin are serialized without a mutex. Waiters spin on
//! their record's status; non-blocking operations (whose records live
//! inside the memory being inserted) return immediately.

use crate::sync::Backoff;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

/// Operation statuses. `DONE` is published with release ordering and
/// observed by waiters with acquire.
pub const OP_WAIT: usize = 0;
pub const OP_NOWAIT: usize = 1;
pub const OP_DONE: usize = 2;

/// Access to the intrusive fields every aggregated operation carries.
///
/// # Safety
/// `next` and `status` must reference fields inside the operation record
/// that stay valid until the record is marked `OP_DONE` (blocking ops)
/// or until the batch handler finishes with it (non-blocking ops).
pub unsafe trait AggNode: Sized {
    unsafe fn set_next(this: *mut Self, next: *mut Self);
    unsafe fn next(this: *mut Self) -> *mut Self;
    unsafe fn status<'a>(this: *mut Self) -> &'a AtomicUsize;
}

pub struct Aggregator<T> {
    pending: AtomicPtr<T>,
    handler_busy: AtomicBool,
}

impl<T: AggNode> Aggregator<T> {
    pub const fn new() -> Self {
        Self {
            pending: AtomicPtr::new(core::ptr::null_mut()),
            handler_busy: AtomicBool::new(false),
        }
    }

    /// Enqueue `op` and either drain the batch (if this push made the
    /// list non-empty) or wait for another drainer to process it.
    ///
    /// The handler receives the batch newest-first and must mark every
    /// blocking record `OP_DONE`.
    ///
    /// # Safety
    /// `op` must stay valid per the `AggNode` contract; `blocking` must
    /// match the record's initial status.
    pub unsafe fn execute(&self, op: *mut T, blocking: bool, handler: impl FnOnce(*mut T)) {
        let mut head = self.pending.load(Ordering::Acquire);
        loop {
            unsafe { T::set_next(op, head) };
            match self
                .pending
                .compare_exchange(head, op, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(observed) => head = observed,
            }
        }

        if head.is_null() {
            // This push made the list non-empty: we drain the next batch
            // once the previous drainer (if any) lets go.
            let mut backoff = Backoff::new();
            while self
                .handler_busy
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                backoff.pause();
            }
            let batch = self.pending.swap(core::ptr::null_mut(), Ordering::Acquire);
            debug_assert!(!batch.is_null());
            handler(batch);
            self.handler_busy.store(false, Ordering::Release);
        } else if blocking {
            let mut backoff = Backoff::new();
            while unsafe { T::status(op) }.load(Ordering::Acquire) != OP_DONE {
                backoff.pause();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;
    use core::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    struct TestOp {
        next: *mut TestOp,
        status: AtomicUsize,
        value: usize,
    }

    unsafe impl AggNode for TestOp {
        unsafe fn set_next(this: *mut Self, next: *mut Self) {
            unsafe { (*this).next = next };
        }
        unsafe fn next(this: *mut Self) -> *mut Self {
            unsafe { (*this).next }
        }
        unsafe fn status<'a>(this: *mut Self) -> &'a AtomicUsize {
            unsafe { &(*this).status }
        }
    }

    #[test]
    fn test_single_op_executes() {
        let agg = Aggregator::<TestOp>::new();
        let mut op = TestOp {
            next: core::ptr::null_mut(),
            status: AtomicUsize::new(OP_WAIT),
            value: 7,
        };
        let mut seen = 0;
        unsafe {
            agg.execute(&mut op, true, |batch| {
                let mut op = batch;
                while !op.is_null() {
                    seen += (*op).value;
                    TestOp::status(op).store(OP_DONE, Ordering::Release);
                    op = TestOp::next(op);
                }
            });
        }
        assert_eq!(seen, 7);
        assert_eq!(op.status.load(Ordering::Relaxed), OP_DONE);
    }

    #[test]
    fn test_concurrent_ops_all_processed() {
        // Every op adds its value to a shared sum inside the handler;
        // the aggregator must serialize handlers, so no updates go
        // missing even with plain (non-atomic-add) accumulation.
        struct Shared {
            agg: Aggregator<TestOp>,
            sum: AtomicUsize,
        }
        let shared = Arc::new(Shared {
            agg: Aggregator::new(),
            sum: AtomicUsize::new(0),
        });

        let num_threads = 8;
        let per_thread = 500;
        let handles: Vec<_> = (0..num_threads)
            .map(|_| {
                let sh = Arc::clone(&shared);
                std::thread::spawn(move || {
                    for i in 0..per_thread {
                        let mut op = TestOp {
                            next: core::ptr::null_mut(),
                            status: AtomicUsize::new(OP_WAIT),
                            value: i,
                        };
                        unsafe {
                            let sum = &sh.sum;
                            sh.agg.execute(&mut op, true, |batch| {
                                let mut op = batch;
                                while !op.is_null() {
                                    sum.fetch_add((*op).value, Ordering::Relaxed);
                                    TestOp::status(op).store(OP_DONE, Ordering::Release);
                                    op = TestOp::next(op);
                                }
                            });
                        }
                        assert_eq!(op.status.load(Ordering::Relaxed), OP_DONE);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let expected = num_threads * (per_thread * (per_thread - 1)) / 2;
        assert_eq!(shared.sum.load(Ordering::Relaxed), expected);
    }
}
