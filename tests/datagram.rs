use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use bytes::Bytes;
use evio::net::{
    socket, DatagramConsumptionStatus, DatagramTransceiver, DatagramTransceiverHandler,
    DatagramTransceiverOptions,
};
use evio::EventLoopGroup;

mod util;

use util::{any_local_address, init};

struct Recorder {
    arrivals: mpsc::Sender<(Bytes, SocketAddr)>,
    written: mpsc::Sender<u64>,
    suppress_after_first: bool,
    seen_one: AtomicBool,
}

impl Recorder {
    fn new(
        arrivals: mpsc::Sender<(Bytes, SocketAddr)>,
        written: mpsc::Sender<u64>,
        suppress_after_first: bool,
    ) -> Recorder {
        Recorder {
            arrivals,
            written,
            suppress_after_first,
            seen_one: AtomicBool::new(false),
        }
    }
}

impl DatagramTransceiverHandler for Recorder {
    fn on_attach(&self, _conn: &Arc<DatagramTransceiver>) {}

    fn on_datagram_arrival(&self, buffer: Bytes, peer: SocketAddr) -> DatagramConsumptionStatus {
        let _ = self.arrivals.send((buffer, peer));
        if self.suppress_after_first && !self.seen_one.swap(true, Ordering::SeqCst) {
            return DatagramConsumptionStatus::SuppressRead;
        }
        DatagramConsumptionStatus::Consumed
    }

    fn on_datagram_written(&self, ctx: u64) {
        let _ = self.written.send(ctx);
    }
}

struct Peer {
    conn: Arc<DatagramTransceiver>,
    addr: SocketAddr,
    arrivals: mpsc::Receiver<(Bytes, SocketAddr)>,
    written: mpsc::Receiver<u64>,
}

fn start_peer(group: &EventLoopGroup, suppress_after_first: bool) -> Peer {
    let fd = socket::create_datagram_socket(any_local_address()).expect("unable to bind");
    let addr = socket::local_addr(&fd).unwrap();
    let (arrival_tx, arrival_rx) = mpsc::channel();
    let (written_tx, written_rx) = mpsc::channel();
    let conn = DatagramTransceiver::new(
        fd,
        DatagramTransceiverOptions {
            handler: Box::new(Recorder::new(arrival_tx, written_tx, suppress_after_first)),
            maximum_packet_size: 1500,
        },
    );
    group
        .attach(conn.clone(), true)
        .expect("unable to attach transceiver");
    Peer {
        conn,
        addr,
        arrivals: arrival_rx,
        written: written_rx,
    }
}

#[test]
fn round_trip_preserves_boundaries() {
    init();
    let group = EventLoopGroup::new(1).unwrap();
    let alice = start_peer(&group, false);
    let bob = start_peer(&group, false);

    assert!(alice
        .conn
        .write(bob.addr, Bytes::from_static(b"ping"), 7));
    let (datagram, from) = bob.arrivals.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(datagram, Bytes::from_static(b"ping"));
    assert_eq!(from, alice.addr);
    assert_eq!(
        alice.written.recv_timeout(Duration::from_secs(5)).unwrap(),
        7
    );

    assert!(bob.conn.write(alice.addr, Bytes::from_static(b"pong"), 8));
    let (datagram, from) = alice.arrivals.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(datagram, Bytes::from_static(b"pong"));
    assert_eq!(from, bob.addr);

    // An empty datagram is data, not end-of-stream.
    assert!(alice.conn.write(bob.addr, Bytes::new(), 9));
    let (datagram, _) = bob.arrivals.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(datagram.is_empty());

    for peer in [alice, bob] {
        peer.conn.stop();
        peer.conn.join();
    }
    group.stop();
    group.join();
}

#[test]
fn suppress_and_restart_read() {
    init();
    let group = EventLoopGroup::new(1).unwrap();
    let sender = start_peer(&group, false);
    let receiver = start_peer(&group, true);

    sender.conn.write(receiver.addr, Bytes::from_static(b"one"), 1);
    let (first, _) = receiver
        .arrivals
        .recv_timeout(Duration::from_secs(5))
        .unwrap();
    assert_eq!(first, Bytes::from_static(b"one"));

    // Reads are suppressed now; the second datagram must not arrive.
    sender.conn.write(receiver.addr, Bytes::from_static(b"two"), 2);
    assert!(receiver
        .arrivals
        .recv_timeout(Duration::from_millis(300))
        .is_err());

    receiver.conn.restart_read();
    let (second, _) = receiver
        .arrivals
        .recv_timeout(Duration::from_secs(5))
        .unwrap();
    assert_eq!(second, Bytes::from_static(b"two"));

    for peer in [sender, receiver] {
        peer.conn.stop();
        peer.conn.join();
    }
    group.stop();
    group.join();
}
