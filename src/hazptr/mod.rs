//! Hazard pointers for lock-free read paths.
//!
//! A [`Hazptr`] is not a typed pointer by itself; it keeps a pointer
//! someone else published alive. Instantiate one and call [`keep`] to
//! protect the pointer currently stored in an `AtomicPtr`: until the
//! guard is dropped (or cleared), the pointee will not be destroyed by
//! concurrent or subsequent calls to [`HazptrDomain::retire`].
//!
//! ```
//! use std::sync::atomic::{AtomicPtr, Ordering};
//! use evio::hazptr::{Hazptr, HazptrDomain, HazptrObject};
//!
//! let slot = AtomicPtr::new(HazptrObject::new_raw(42u32));
//!
//! let mut hp = Hazptr::new();
//! let value = hp.keep(&slot).unwrap();
//! assert_eq!(**value, 42);
//!
//! // Publish a new version and retire the old one. Readers holding the
//! // old pointer keep reading it safely.
//! let old = slot.swap(HazptrObject::new_raw(43u32), Ordering::AcqRel);
//! unsafe { HazptrDomain::global().retire(old) };
//! # drop(hp);
//! # let last = slot.swap(std::ptr::null_mut(), Ordering::AcqRel);
//! # unsafe { HazptrDomain::global().retire(last) };
//! ```
//!
//! [`keep`]: Hazptr::keep

mod cache;
mod domain;
mod entry;
mod object;

pub use domain::HazptrDomain;
pub use object::HazptrObject;

use std::fmt;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use crate::barrier::asymmetric_light;
use crate::hazptr::entry::Entry;
use crate::hazptr::object::Header;

/// RAII guard around one hazard slot.
///
/// Acquiring a guard for the global domain goes through a thread-local
/// entry cache, so the common path is lock-free and allocation-free.
pub struct Hazptr<'d> {
    domain: &'d HazptrDomain,
    entry: *mut Entry,
}

impl Hazptr<'static> {
    /// A guard on the global domain.
    pub fn new() -> Hazptr<'static> {
        Hazptr {
            domain: HazptrDomain::global(),
            entry: cache::get_entry_of_global_domain(),
        }
    }
}

impl Default for Hazptr<'static> {
    fn default() -> Self {
        Hazptr::new()
    }
}

impl<'d> Hazptr<'d> {
    /// A guard on `domain`.
    pub fn in_domain(domain: &'d HazptrDomain) -> Hazptr<'d> {
        Hazptr {
            domain,
            entry: domain.get_entry(),
        }
    }

    /// Keeps whatever `src` points at alive. A pointer kept previously by
    /// this guard is implicitly released.
    ///
    /// Returns `None` if `src` holds a null pointer.
    pub fn keep<'h, T>(&'h mut self, src: &AtomicPtr<HazptrObject<T>>) -> Option<&'h HazptrObject<T>> {
        let mut p = src.load(Ordering::Relaxed);
        loop {
            if p.is_null() {
                self.clear();
                return None;
            }
            if self.try_keep(&mut p, src) {
                // `src` did not change before the slot was published, and
                // pointers visible in slots are never reclaimed.
                return Some(unsafe { &*p });
            }
        }
    }

    /// One protection attempt: publish `*p`, then re-check `src`. On
    /// failure `*p` is updated with the fresh value and the slot is
    /// cleared.
    fn try_keep<T>(&mut self, p: &mut *mut HazptrObject<T>, src: &AtomicPtr<HazptrObject<T>>) -> bool {
        let expected = *p;
        self.entry().expose_ptr(expected as *mut Header);
        // Pairs with the heavy barrier in the domain's sweep.
        asymmetric_light();
        *p = src.load(Ordering::Acquire);
        if expected != *p {
            self.entry().expose_ptr(std::ptr::null_mut());
            return false;
        }
        true
    }

    /// Releases the kept pointer (if any) without releasing the slot.
    pub fn clear(&mut self) {
        self.entry().expose_ptr(std::ptr::null_mut());
    }

    fn entry(&self) -> &Entry {
        unsafe { &*self.entry }
    }
}

impl Drop for Hazptr<'_> {
    fn drop(&mut self) {
        self.clear();
        debug_assert!(
            std::ptr::eq(self.entry().domain, self.domain),
            "entry returned to a foreign domain"
        );
        if std::ptr::eq(self.domain, Arc::as_ptr(HazptrDomain::global())) {
            cache::put_entry_of_global_domain(self.entry);
        } else {
            self.domain.put_entry(self.entry);
        }
    }
}

impl fmt::Debug for Hazptr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hazptr").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

    static DROPS: AtomicUsize = AtomicUsize::new(0);

    struct CountsDrops(u32);

    impl Drop for CountsDrops {
        fn drop(&mut self) {
            DROPS.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn keep_protects_against_retire() {
        let domain = HazptrDomain::new();
        let slot = AtomicPtr::new(HazptrObject::new_raw(CountsDrops(7)));

        let mut hp = Hazptr::in_domain(&domain);
        let kept = hp.keep(&slot).unwrap();
        assert_eq!(kept.0, 7);

        let old = slot.swap(HazptrObject::new_raw(CountsDrops(8)), Ordering::AcqRel);
        unsafe { domain.retire(old) };

        // Still protected; the reclaim above must not have destroyed it.
        assert_eq!(kept.0, 7);
        let before = DROPS.load(Ordering::Relaxed);

        drop(hp);
        let last = slot.swap(std::ptr::null_mut(), Ordering::AcqRel);
        unsafe { domain.retire(last) };
        drop(domain);

        // Both objects are gone once the domain is.
        assert_eq!(DROPS.load(Ordering::Relaxed), before + 2);
    }

    #[test]
    fn keep_null_returns_none() {
        let slot: AtomicPtr<HazptrObject<u32>> = AtomicPtr::new(std::ptr::null_mut());
        let mut hp = Hazptr::new();
        assert!(hp.keep(&slot).is_none());
    }

    #[test]
    #[should_panic(expected = "retired twice")]
    fn double_retire_is_detected() {
        let domain = HazptrDomain::new();
        let ptr = HazptrObject::new_raw(1u32);
        unsafe {
            // Keep a guard alive so the first retire cannot destroy the
            // object before the second retire runs.
            let slot = AtomicPtr::new(ptr);
            let mut hp = Hazptr::in_domain(&domain);
            let _kept = hp.keep(&slot);
            domain.retire(ptr);
            domain.retire(ptr);
        }
    }
}
