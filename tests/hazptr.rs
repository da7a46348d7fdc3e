use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use evio::hazptr::{Hazptr, HazptrDomain, HazptrObject};

mod util;

use util::init;

/// Both halves always carry the same generation; observing a mismatch
/// means a reader saw an object mutated or reclaimed under its feet.
struct Snapshot {
    generation: u64,
    shadow: u64,
}

#[test]
fn double_buffer_readers_never_see_reclaimed_data() {
    init();
    const READERS: usize = 8;
    const DURATION: Duration = Duration::from_secs(2);

    let domain = HazptrDomain::new();
    let slot = Arc::new(AtomicPtr::new(HazptrObject::new_raw(Snapshot {
        generation: 0,
        shadow: 0,
    })));
    let stop = Arc::new(AtomicBool::new(false));
    let max_seen = Arc::new(AtomicU64::new(0));

    let readers: Vec<_> = (0..READERS)
        .map(|_| {
            let domain = Arc::clone(&domain);
            let slot = Arc::clone(&slot);
            let stop = Arc::clone(&stop);
            let max_seen = Arc::clone(&max_seen);
            thread::spawn(move || {
                let mut hp = Hazptr::in_domain(&domain);
                while !stop.load(Ordering::Relaxed) {
                    let snapshot = hp.keep(&slot).expect("slot emptied while running");
                    // The protected object must be internally consistent
                    // for as long as it is kept.
                    let generation = snapshot.generation;
                    assert_eq!(
                        generation, snapshot.shadow,
                        "torn or reclaimed snapshot observed"
                    );
                    assert_eq!(generation, snapshot.generation, "snapshot changed in place");
                    max_seen.fetch_max(generation, Ordering::Relaxed);
                    hp.clear();
                }
            })
        })
        .collect();

    let mut generation = 0;
    let deadline = std::time::Instant::now() + DURATION;
    while std::time::Instant::now() < deadline {
        generation += 1;
        let fresh = HazptrObject::new_raw(Snapshot {
            generation,
            shadow: generation,
        });
        let old = slot.swap(fresh, Ordering::AcqRel);
        unsafe { domain.retire(old) };
        // Each retire sweeps (and fences every core); publishing a few
        // thousand generations over the run is plenty.
        thread::sleep(Duration::from_micros(200));
    }

    stop.store(true, Ordering::Relaxed);
    for reader in readers {
        reader.join().unwrap();
    }

    assert!(
        max_seen.load(Ordering::Relaxed) > 0,
        "readers never observed a published snapshot"
    );

    // Retire the final object and let the domain reclaim everything.
    let last = slot.swap(std::ptr::null_mut(), Ordering::AcqRel);
    unsafe { domain.retire(last) };
    drop(domain);
}

#[test]
fn global_domain_uses_thread_local_cache() {
    init();
    // Acquire / release repeatedly on one thread; the entries come from
    // the thread-local cache after the first pair.
    let slot = AtomicPtr::new(HazptrObject::new_raw(1u64));
    for _ in 0..1000 {
        let mut hp = Hazptr::new();
        assert_eq!(**hp.keep(&slot).unwrap(), 1);
    }
    let last = slot.swap(std::ptr::null_mut(), Ordering::AcqRel);
    unsafe { HazptrDomain::global().retire(last) };
}
