//! Seqlock-protected values.

use std::cell::UnsafeCell;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::barrier::{read_barrier, write_barrier};

/// Protects `T` with a seqlock.
///
/// Readers never block: they retry until they observe the same even
/// sequence number on both sides of a copy of the value. Writers are
/// serialized by an internal mutex and bump the sequence to odd for the
/// duration of the store.
///
/// The sequence counter only provides atomicity; visibility of the value
/// itself comes from the explicit read / write barriers around the copy.
///
/// `T` must be `Copy`: a reader may copy the value while a writer is
/// mid-store and throw the torn copy away.
pub struct Seqlocked<T> {
    writer_lock: Mutex<()>,
    seq: AtomicUsize,
    value: UnsafeCell<T>,
}

// Readers copy `value` concurrently with writers; both sides go through
// volatile accesses fenced by the barriers and torn reads are discarded.
unsafe impl<T: Copy + Send> Sync for Seqlocked<T> {}
unsafe impl<T: Copy + Send> Send for Seqlocked<T> {}

impl<T: Copy> Seqlocked<T> {
    pub fn new(value: T) -> Self {
        Seqlocked {
            writer_lock: Mutex::new(()),
            seq: AtomicUsize::new(0),
            value: UnsafeCell::new(value),
        }
    }

    /// Loads the value. Always returns a consistent view of a previous
    /// `store` / `update`.
    pub fn load(&self) -> T {
        loop {
            let seq1 = self.seq.load(Ordering::Acquire);
            let value = self.load_ordered();
            let seq2 = self.seq.load(Ordering::Relaxed);
            if seq1 == seq2 && seq1 % 2 == 0 {
                return value;
            }
            std::hint::spin_loop();
        }
    }

    /// Stores `value`.
    pub fn store(&self, value: T) {
        let _guard = self.writer_lock.lock().unwrap();
        let seq = self.seq.load(Ordering::Relaxed);
        self.seq.store(seq + 1, Ordering::Release);
        self.store_ordered(value);
        self.seq.store(seq + 2, Ordering::Release);
    }

    /// Mutates the value in place.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut T),
    {
        let _guard = self.writer_lock.lock().unwrap();
        let seq = self.seq.load(Ordering::Relaxed);
        self.seq.store(seq + 1, Ordering::Release);
        write_barrier();
        // Writers are serialized by `writer_lock`, readers discard any copy
        // taken while the sequence is odd.
        unsafe { f(&mut *self.value.get()) };
        write_barrier();
        self.seq.store(seq + 2, Ordering::Release);
    }

    fn load_ordered(&self) -> T {
        read_barrier();
        let result = unsafe { ptr::read_volatile(self.value.get()) };
        read_barrier();
        result
    }

    fn store_ordered(&self, value: T) {
        write_barrier();
        unsafe { ptr::write_volatile(self.value.get(), value) };
        write_barrier();
    }
}

impl<T: Copy + Default> Default for Seqlocked<T> {
    fn default() -> Self {
        Seqlocked::new(T::default())
    }
}

impl<T: Copy + fmt::Debug> fmt::Debug for Seqlocked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Seqlocked").field("value", &self.load()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn load_store() {
        let value = Seqlocked::new([1u64; 8]);
        assert_eq!(value.load(), [1; 8]);
        value.store([2; 8]);
        assert_eq!(value.load(), [2; 8]);
        value.update(|v| v[0] = 3);
        assert_eq!(value.load()[0], 3);
    }

    #[test]
    fn torn_reads_are_never_observed() {
        // The writer stores arrays whose elements all hold the same value.
        // Any mixed array is a torn read.
        let value = Arc::new(Seqlocked::new([0u64; 16]));
        let stop = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let value = Arc::clone(&value);
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        let snapshot = value.load();
                        assert!(
                            snapshot.iter().all(|&v| v == snapshot[0]),
                            "torn read: {:?}",
                            snapshot
                        );
                    }
                })
            })
            .collect();

        for i in 0..100_000u64 {
            value.store([i; 16]);
        }
        stop.store(true, Ordering::Relaxed);
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
