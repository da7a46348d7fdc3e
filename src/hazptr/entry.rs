use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crate::hazptr::object::Header;
use crate::hazptr::HazptrDomain;

/// One hazard slot.
///
/// Entries are allocated by the owning domain and are never freed while
/// the domain is alive, which keeps list traversal safe without any
/// further synchronization.
pub(crate) struct Entry {
    ptr: AtomicPtr<Header>,
    active: AtomicBool,
    /// The domain this entry was allocated from.
    pub(crate) domain: *const HazptrDomain,
    /// Immutable once the entry is linked into the domain's list.
    pub(crate) next: *mut Entry,
}

// Entries hand raw pointers between threads; all mutation goes through the
// atomics above.
unsafe impl Send for Entry {}
unsafe impl Sync for Entry {}

impl Entry {
    pub(crate) fn new() -> Entry {
        Entry {
            ptr: AtomicPtr::new(std::ptr::null_mut()),
            active: AtomicBool::new(false),
            domain: std::ptr::null(),
            next: std::ptr::null_mut(),
        }
    }

    pub(crate) fn try_acquire(&self) -> bool {
        !self.active.load(Ordering::Relaxed) && !self.active.swap(true, Ordering::Relaxed)
    }

    pub(crate) fn release(&self) {
        self.active.store(false, Ordering::Relaxed);
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn try_get_ptr(&self) -> *mut Header {
        self.ptr.load(Ordering::Acquire)
    }

    pub(crate) fn expose_ptr(&self, ptr: *mut Header) {
        self.ptr.store(ptr, Ordering::Release);
    }
}
