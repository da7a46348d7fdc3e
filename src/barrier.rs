//! Memory barriers, including an asymmetric light / heavy pair.
//!
//! The asymmetric pair lets a hot read path pay only a compiler barrier
//! while the cold write path forces a full fence on every core currently
//! running a thread of this process. [`asymmetric_heavy`] prefers
//! `membarrier(2)` and falls back to toggling protection on a pre-faulted,
//! mlocked page, which causes the kernel to interrupt every core running
//! this address space.

use std::io;
use std::sync::atomic::{compiler_fence, fence, AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock};

/// Prevents the compiler from reordering surrounding memory accesses.
/// Emits no code.
#[inline(always)]
pub fn compiler_barrier() {
    compiler_fence(Ordering::SeqCst);
}

/// Orders preceding loads before subsequent loads. Compiler-only on
/// x86-64; a hardware fence on weakly ordered ISAs.
#[inline(always)]
pub fn read_barrier() {
    fence(Ordering::Acquire);
}

/// Orders preceding stores before subsequent stores. Compiler-only on
/// x86-64; a hardware fence on weakly ordered ISAs.
#[inline(always)]
pub fn write_barrier() {
    fence(Ordering::Release);
}

/// Full memory fence.
#[inline(always)]
pub fn memory_barrier() {
    fence(Ordering::SeqCst);
}

/// The fast side of the asymmetric pair. Compiler barrier only.
#[inline(always)]
pub fn asymmetric_light() {
    compiler_barrier();
}

/// The slow side of the asymmetric pair.
///
/// After this returns, every `asymmetric_light` call that completed on any
/// core before this call is ordered with respect to subsequent operations
/// on the calling core.
pub fn asymmetric_heavy() {
    match membarrier_strategy() {
        MEMBARRIER_AVAILABLE => {
            // Registration happened in `membarrier_strategy`.
            let rc = membarrier(libc::MEMBARRIER_CMD_PRIVATE_EXPEDITED);
            debug_assert!(rc.is_ok(), "membarrier failed after registration");
            if rc.is_ok() {
                return;
            }
            homemade_membarrier();
        }
        _ => homemade_membarrier(),
    }
}

const MEMBARRIER_UNDECIDED: u8 = 0;
const MEMBARRIER_AVAILABLE: u8 = 1;
const MEMBARRIER_UNAVAILABLE: u8 = 2;

static MEMBARRIER_STATE: AtomicU8 = AtomicU8::new(MEMBARRIER_UNDECIDED);

fn membarrier(cmd: libc::c_int) -> io::Result<()> {
    let res = unsafe { libc::syscall(libc::SYS_membarrier, cmd, 0, 0) };
    if res == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn membarrier_strategy() -> u8 {
    match MEMBARRIER_STATE.load(Ordering::Relaxed) {
        MEMBARRIER_UNDECIDED => {
            let available = membarrier(libc::MEMBARRIER_CMD_REGISTER_PRIVATE_EXPEDITED).is_ok();
            let state = if available {
                MEMBARRIER_AVAILABLE
            } else {
                MEMBARRIER_UNAVAILABLE
            };
            MEMBARRIER_STATE.store(state, Ordering::Relaxed);
            state
        }
        state => state,
    }
}

struct DummyPage(*mut libc::c_void);

// The page is only ever touched while `fallback_lock` is held.
unsafe impl Send for DummyPage {}
unsafe impl Sync for DummyPage {}

fn dummy_page() -> &'static DummyPage {
    static PAGE: OnceLock<DummyPage> = OnceLock::new();
    PAGE.get_or_init(|| {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                1,
                libc::PROT_READ,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert!(
            ptr != libc::MAP_FAILED,
            "cannot create dummy page for asymmetric memory barrier: {}",
            io::Error::last_os_error()
        );
        unsafe {
            // Locking may fail under RLIMIT_MEMLOCK; the barrier still
            // works, it just risks a page fault on the slow path.
            let _ = libc::mlock(ptr, 1);
        }
        DummyPage(ptr)
    })
}

// Mutating page tables causes the kernel to run a barrier on every core
// executing this process. Upgrading protection alone is not enough (it can
// be delayed until a fault), hence the write between the two mprotect
// calls.
fn homemade_membarrier() {
    static LOCK: Mutex<()> = Mutex::new(());

    let page = dummy_page();

    // Previous memory accesses may not be reordered after the syscalls
    // below.
    memory_barrier();

    let _guard = LOCK.lock().unwrap();
    unsafe {
        assert_eq!(
            libc::mprotect(page.0, 1, libc::PROT_READ | libc::PROT_WRITE),
            0
        );
        std::ptr::write_volatile(page.0 as *mut u8, 0);
        assert_eq!(libc::mprotect(page.0, 1, libc::PROT_READ), 0);
    }

    // Subsequent memory accesses may not be reordered before the syscalls
    // above.
    memory_barrier();
}
