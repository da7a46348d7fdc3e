use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use crate::barrier::asymmetric_heavy;
use crate::hazptr::entry::Entry;
use crate::hazptr::object::{Header, HazptrObject};
use crate::timer::{TimeKeeper, TimerId};

/// How often retired objects are swept independently of `retire` traffic.
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Owns hazard slots and the stack of retired objects.
///
/// A domain guarantees that an object passed to [`retire`] is destroyed
/// only once no hazard slot protects it. Once `retire` is called no new
/// reference to the object may be taken; existing readers keep reading
/// through their protected slots.
///
/// [`retire`]: HazptrDomain::retire
pub struct HazptrDomain {
    hazptrs: AtomicPtr<Entry>,
    retired: AtomicPtr<Header>,
    sweep_timer: Mutex<Option<TimerId>>,
}

unsafe impl Send for HazptrDomain {}
unsafe impl Sync for HazptrDomain {}

impl HazptrDomain {
    /// Creates a new domain with a periodic background sweep.
    pub fn new() -> Arc<HazptrDomain> {
        let domain = Arc::new(HazptrDomain {
            hazptrs: AtomicPtr::new(std::ptr::null_mut()),
            retired: AtomicPtr::new(std::ptr::null_mut()),
            sweep_timer: Mutex::new(None),
        });

        // Sweeping can be slow (it fences every core), so it runs on the
        // time keeper's background pool.
        let weak: Weak<HazptrDomain> = Arc::downgrade(&domain);
        let timer = TimeKeeper::instance().add_timer(
            Instant::now() + SWEEP_INTERVAL,
            Some(SWEEP_INTERVAL),
            true,
            move || {
                if let Some(domain) = weak.upgrade() {
                    domain.reclaim_best_effort();
                }
            },
        );
        *domain.sweep_timer.lock().unwrap() = timer;
        domain
    }

    /// The process-wide default domain.
    pub fn global() -> &'static Arc<HazptrDomain> {
        static GLOBAL: OnceLock<Arc<HazptrDomain>> = OnceLock::new();
        GLOBAL.get_or_init(HazptrDomain::new)
    }

    /// Retires `object`. It will be destroyed once no hazard slot protects
    /// it.
    ///
    /// # Safety
    ///
    /// `object` must have been produced by [`HazptrObject::new_raw`], must
    /// not have been retired before (retiring twice aborts), and no new
    /// reference to it may be taken after this call.
    pub unsafe fn retire<T: Send + 'static>(&self, object: *mut HazptrObject<T>) {
        let header = object as *mut Header;
        // `next` self-links while the object is live. Anything else means
        // a double retire, which is a programming bug.
        assert!(
            (*header).next.load(Ordering::Relaxed) == header,
            "object {:p} retired twice",
            header
        );
        self.push_retired(header);

        // `retire` itself is expected to be rare (hazard pointers are for
        // read-mostly data), so sweeping inline on every call is fine.
        self.reclaim_best_effort();
    }

    pub(crate) fn get_entry(&self) -> *mut Entry {
        let mut p = self.hazptrs.load(Ordering::Acquire);
        while !p.is_null() {
            let entry = unsafe { &*p };
            if entry.try_acquire() {
                // Kept in the list for later examination during
                // reclamation.
                return p;
            }
            p = entry.next;
        }
        self.get_entry_slow()
    }

    pub(crate) fn put_entry(&self, entry: *mut Entry) {
        unsafe { &*entry }.release();
        // Kept for reuse.
    }

    fn get_entry_slow(&self) -> *mut Entry {
        let mut entry = Box::new(Entry::new());
        assert!(entry.try_acquire());
        entry.domain = self as *const HazptrDomain;

        let ptr = Box::into_raw(entry);
        let mut head = self.hazptrs.load(Ordering::Relaxed);
        loop {
            unsafe { (*ptr).next = head };
            match self.hazptrs.compare_exchange_weak(
                head,
                ptr,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return ptr,
                Err(current) => head = current,
            }
        }
    }

    fn push_retired(&self, object: *mut Header) {
        let mut head = self.retired.load(Ordering::Relaxed);
        loop {
            unsafe { (*object).next.store(head, Ordering::Relaxed) };
            match self.retired.compare_exchange_weak(
                head,
                object,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    pub(crate) fn reclaim_best_effort(&self) {
        let mut current = self.retired.swap(std::ptr::null_mut(), Ordering::Acquire);
        if current.is_null() {
            return; // Someone else grabbed the list.
        }
        let kept = self.kept_pointers();
        while !current.is_null() {
            let next = unsafe { (*current).next.load(Ordering::Relaxed) };
            if kept.contains(&current) {
                // Still referenced by someone, try it next round.
                self.push_retired(current);
            } else {
                unsafe { ((*current).destroy)(current) };
            }
            current = next;
        }
    }

    /// Set of pointers currently protected by some hazard slot.
    ///
    /// New entries may be linked in while we scan. That is safe: by the
    /// time `retire` was called, no *new* reference to the retired object
    /// could be made, so a late entry cannot protect anything on the list
    /// we grabbed.
    fn kept_pointers(&self) -> HashSet<*mut Header> {
        let mut objects = HashSet::new();
        // Pairs with the light barrier in `Hazptr::try_keep`.
        asymmetric_heavy();
        let mut current = self.hazptrs.load(Ordering::Acquire);
        while !current.is_null() {
            let entry = unsafe { &*current };
            if entry.is_active() {
                // A null protected pointer does no harm here.
                objects.insert(entry.try_get_ptr());
            }
            current = entry.next;
        }
        objects
    }

    fn any_entry_active(&self) -> bool {
        let mut current = self.hazptrs.load(Ordering::Acquire);
        while !current.is_null() {
            let entry = unsafe { &*current };
            if entry.is_active() {
                return true;
            }
            current = entry.next;
        }
        false
    }
}

impl Drop for HazptrDomain {
    fn drop(&mut self) {
        if let Some(timer) = self.sweep_timer.lock().unwrap().take() {
            TimeKeeper::instance().kill_timer(&timer);
        }

        // Wait for every guard borrowed from us to be returned.
        while self.any_entry_active() {
            std::thread::yield_now();
        }

        // No reader is left; destroy whatever is still retired.
        let mut current = self.retired.swap(std::ptr::null_mut(), Ordering::Acquire);
        while !current.is_null() {
            let next = unsafe { (*current).next.load(Ordering::Relaxed) };
            unsafe { ((*current).destroy)(current) };
            current = next;
        }

        let mut entry = self.hazptrs.swap(std::ptr::null_mut(), Ordering::Acquire);
        while !entry.is_null() {
            let next = unsafe { (*entry).next };
            drop(unsafe { Box::from_raw(entry) });
            entry = next;
        }
    }
}

impl fmt::Debug for HazptrDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HazptrDomain").finish_non_exhaustive()
    }
}
