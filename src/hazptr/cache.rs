//! Thread-local entry cache for the global domain.
//!
//! Allocating an entry from the domain walks a shared list; common
//! acquire / release pairs stay thread-local by parking a few released
//! entries per thread. Entries of non-global domains always go back to
//! their own domain.

use std::cell::RefCell;

use crate::hazptr::entry::Entry;
use crate::hazptr::HazptrDomain;

const CACHE_CAPACITY: usize = 8;

thread_local! {
    static ENTRY_CACHE: RefCell<Vec<*mut Entry>> =
        RefCell::new(Vec::with_capacity(CACHE_CAPACITY));
}

pub(crate) fn get_entry_of_global_domain() -> *mut Entry {
    ENTRY_CACHE.with(|cache| {
        if let Some(entry) = cache.borrow_mut().pop() {
            return entry;
        }
        HazptrDomain::global().get_entry()
    })
}

pub(crate) fn put_entry_of_global_domain(entry: *mut Entry) {
    ENTRY_CACHE.with(|cache| {
        let mut cache = cache.borrow_mut();
        if cache.len() < CACHE_CAPACITY {
            cache.push(entry);
        } else {
            HazptrDomain::global().put_entry(entry);
        }
    })
}
