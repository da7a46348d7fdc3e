use std::ops::Deref;
use std::sync::atomic::{AtomicPtr, Ordering};

/// Intrusive part of every hazard-pointer-protected allocation.
///
/// `next` points at the header itself while the object is live; it is
/// repurposed as the retired-stack link once the object is retired. The
/// self-link doubles as the double-retire check.
#[repr(C)]
pub(crate) struct Header {
    pub(crate) next: AtomicPtr<Header>,
    pub(crate) destroy: unsafe fn(*mut Header),
}

/// A heap allocation that can be protected by [`Hazptr`] and reclaimed
/// through a [`HazptrDomain`].
///
/// Store the raw pointer produced by [`HazptrObject::new_raw`] in an
/// `AtomicPtr`, swap it when publishing a new version, and pass the old
/// pointer to [`HazptrDomain::retire`]. Readers access the payload through
/// `Deref` on the reference returned by [`Hazptr::keep`].
///
/// [`Hazptr`]: crate::hazptr::Hazptr
/// [`Hazptr::keep`]: crate::hazptr::Hazptr::keep
/// [`HazptrDomain`]: crate::hazptr::HazptrDomain
/// [`HazptrDomain::retire`]: crate::hazptr::HazptrDomain::retire
#[repr(C)]
pub struct HazptrObject<T> {
    header: Header,
    value: T,
}

impl<T: Send + 'static> HazptrObject<T> {
    /// Heap-allocates `value`. The returned pointer is owned by the caller
    /// until it is handed to [`HazptrDomain::retire`].
    ///
    /// [`HazptrDomain::retire`]: crate::hazptr::HazptrDomain::retire
    pub fn new_raw(value: T) -> *mut HazptrObject<T> {
        let ptr = Box::into_raw(Box::new(HazptrObject {
            header: Header {
                next: AtomicPtr::new(std::ptr::null_mut()),
                destroy: destroy::<T>,
            },
            value,
        }));
        // Self-link marks the object as live (not on any retired list).
        unsafe {
            (*ptr)
                .header
                .next
                .store(ptr as *mut Header, Ordering::Relaxed);
        }
        ptr
    }
}

impl<T> Deref for HazptrObject<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for HazptrObject<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HazptrObject")
            .field("value", &self.value)
            .finish()
    }
}

unsafe fn destroy<T>(header: *mut Header) {
    drop(Box::from_raw(header as *mut HazptrObject<T>));
}
