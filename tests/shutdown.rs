//! Full process-shutdown ordering: descriptors first, loops second, the
//! time keeper last.

use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use evio::net::{
    socket, Acceptor, AcceptorOptions, DataConsumptionStatus, StreamConnection,
    StreamConnectionHandler, StreamConnectionOptions,
};
use evio::{ChainBuffer, EventLoopGroup, TimeKeeper};

mod util;

use util::{any_local_address, init, wait_for};

struct CountingHandler {
    closed: Arc<AtomicUsize>,
    errored: Arc<AtomicUsize>,
}

impl StreamConnectionHandler for CountingHandler {
    fn on_attach(&self, _conn: &Arc<StreamConnection>) {}

    fn on_data_arrival(&self, buffer: &mut ChainBuffer) -> DataConsumptionStatus {
        buffer.cut(buffer.len());
        DataConsumptionStatus::Ready
    }

    fn on_close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_error(&self) {
        self.errored.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn orderly_teardown() {
    init();
    let group = Arc::new(EventLoopGroup::new(2).unwrap());
    let listener = socket::create_listener(any_local_address(), 16).unwrap();
    let addr = socket::local_addr(&listener).unwrap();

    let closed = Arc::new(AtomicUsize::new(0));
    let errored = Arc::new(AtomicUsize::new(0));
    let conns: Arc<Mutex<Vec<Arc<StreamConnection>>>> = Arc::new(Mutex::new(Vec::new()));
    let accepted = Arc::new(AtomicUsize::new(0));

    let acceptor = {
        let group = Arc::clone(&group);
        let conns = Arc::clone(&conns);
        let accepted = Arc::clone(&accepted);
        let closed = Arc::clone(&closed);
        let errored = Arc::clone(&errored);
        Acceptor::new(
            listener,
            AcceptorOptions {
                connection_handler: Box::new(move |fd, _peer| {
                    let conn = StreamConnection::new(
                        fd,
                        StreamConnectionOptions {
                            handler: Box::new(CountingHandler {
                                closed: Arc::clone(&closed),
                                errored: Arc::clone(&errored),
                            }),
                            read_buffer_size: 16 * 1024,
                            stream_io: None,
                            read_rate_limiter: None,
                            write_rate_limiter: None,
                        },
                    );
                    group.attach(conn.clone(), true).unwrap();
                    conn.start_handshaking();
                    conns.lock().unwrap().push(conn);
                    accepted.fetch_add(1, Ordering::SeqCst);
                }),
            },
        )
    };
    group.attach(acceptor.clone(), true).unwrap();

    let mut clients: Vec<_> = (0..4)
        .map(|_| TcpStream::connect(addr).expect("unable to connect"))
        .collect();
    for client in &mut clients {
        client.write_all(b"farewell").unwrap();
    }
    assert!(wait_for(Duration::from_secs(10), || {
        accepted.load(Ordering::SeqCst) == 4
    }));

    // Stop descriptors first; each delivers exactly one cleanup.
    for conn in conns.lock().unwrap().iter() {
        conn.stop();
    }
    for conn in conns.lock().unwrap().iter() {
        conn.join();
    }
    assert_eq!(closed.load(Ordering::SeqCst), 4);
    assert_eq!(errored.load(Ordering::SeqCst), 0);

    acceptor.stop();
    acceptor.join();

    // Loops second.
    group.stop();
    group.join();

    // The time keeper goes last: everything that could arm timers is
    // gone by now.
    let deadline = Instant::now();
    TimeKeeper::instance().stop();
    TimeKeeper::instance().join();
    assert!(deadline.elapsed() < Duration::from_secs(10));
}
