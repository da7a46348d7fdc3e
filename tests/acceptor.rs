use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use evio::net::{socket, Acceptor, AcceptorOptions};
use evio::EventLoopGroup;

mod util;

use util::{any_local_address, init, wait_for};

#[test]
fn accepts_every_connection() {
    init();
    let group = EventLoopGroup::new(1).unwrap();
    let listener = socket::create_listener(any_local_address(), 128).unwrap();
    let addr = socket::local_addr(&listener).unwrap();

    let accepted = Arc::new(AtomicUsize::new(0));
    let peers = Arc::new(Mutex::new(Vec::new()));
    let acceptor = {
        let accepted = Arc::clone(&accepted);
        let peers = Arc::clone(&peers);
        Acceptor::new(
            listener,
            AcceptorOptions {
                connection_handler: Box::new(move |fd, peer| {
                    // Dropping `fd` closes the connection, which is all
                    // this test needs.
                    drop(fd);
                    peers.lock().unwrap().push(peer);
                    accepted.fetch_add(1, Ordering::Relaxed);
                }),
            },
        )
    };
    group.attach(acceptor.clone(), true).unwrap();

    let clients: Vec<_> = (0..16)
        .map(|_| TcpStream::connect(addr).expect("unable to connect"))
        .collect();

    assert!(
        wait_for(Duration::from_secs(10), || accepted
            .load(Ordering::Relaxed)
            == 16),
        "accepted {} of 16 connections",
        accepted.load(Ordering::Relaxed)
    );
    for peer in peers.lock().unwrap().iter() {
        assert!(peer.ip().is_loopback());
    }

    drop(clients);
    acceptor.stop();
    acceptor.join();
    group.stop();
    group.join();
}

#[test]
fn attach_disabled_then_enable() {
    init();
    let group = EventLoopGroup::new(1).unwrap();
    let listener = socket::create_listener(any_local_address(), 16).unwrap();
    let addr = socket::local_addr(&listener).unwrap();

    let accepted = Arc::new(AtomicUsize::new(0));
    let acceptor = {
        let accepted = Arc::clone(&accepted);
        Acceptor::new(
            listener,
            AcceptorOptions {
                connection_handler: Box::new(move |fd, _peer| {
                    drop(fd);
                    accepted.fetch_add(1, Ordering::Relaxed);
                }),
            },
        )
    };
    group.attach(acceptor.clone(), false).unwrap();

    let _client = TcpStream::connect(addr).unwrap();
    // Events must not fire while the descriptor is disabled.
    assert!(!wait_for(Duration::from_millis(300), || accepted
        .load(Ordering::Relaxed)
        > 0));

    let ev = Arc::clone(group.event_loop_for(acceptor.descriptor().fd()));
    let enable_target = acceptor.clone();
    ev.add_task(move || {
        let desc = enable_target.descriptor();
        desc.event_loop().unwrap().enable_descriptor(desc);
    });

    assert!(wait_for(Duration::from_secs(5), || accepted
        .load(Ordering::Relaxed)
        == 1));

    acceptor.stop();
    acceptor.join();
    group.stop();
    group.join();
}

#[test]
fn cleanup_runs_exactly_once() {
    init();
    let group = EventLoopGroup::new(1).unwrap();
    let listener = socket::create_listener(any_local_address(), 16).unwrap();

    let acceptor = Acceptor::new(
        listener,
        AcceptorOptions {
            connection_handler: Box::new(|_fd, _peer| {}),
        },
    );
    group.attach(acceptor.clone(), true).unwrap();

    acceptor.stop();
    // Killing twice must not confuse the state machine; the first reason
    // wins.
    acceptor.stop();
    acceptor.join();
    // `join` after cleanup returns immediately.
    acceptor.join();

    group.stop();
    group.join();
}
