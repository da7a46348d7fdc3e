// Not all helpers are used by all tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Once;
use std::time::{Duration, Instant};

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

pub fn assert_send<T: Send>() {}
pub fn assert_sync<T: Sync>() {}

pub fn any_local_address() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// Polls `cond` until it holds or `timeout` elapses.
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}
