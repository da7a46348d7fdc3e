//! Concrete descriptors and their supporting pieces: stream connections,
//! datagram transceivers, acceptors, rate limiting and socket helpers.

mod acceptor;
mod datagram;
mod rate_limiter;
mod stream;
mod stream_io;
pub(crate) mod writing_list;

/// Socket primitives: creation, non-blocking connect, common options.
pub mod socket {
    pub use crate::sys::unix::socket::{
        accept, create_datagram_socket, create_listener, create_stream_socket, local_addr,
        set_receive_buffer_size, set_send_buffer_size, set_tcp_no_delay, socket_error,
        start_connect,
    };
}

pub use acceptor::{Acceptor, AcceptorOptions};
pub use datagram::{
    DatagramConsumptionStatus, DatagramTransceiver, DatagramTransceiverHandler,
    DatagramTransceiverOptions,
};
pub use rate_limiter::{
    default_rx_rate_limiter, default_tx_rate_limiter, set_default_rx_bandwidth,
    set_default_tx_bandwidth, LayeredRateLimiter, RateLimiter, ThreadSafeRateLimiter,
    TokenBucketRateLimiter, UnlimitedRateLimiter, DEFAULT_TICK,
};
pub use stream::{
    DataConsumptionStatus, StreamConnection, StreamConnectionHandler, StreamConnectionOptions,
};
pub use stream_io::{HandshakeStatus, ReadStatus, StreamIo, SystemStreamIo, WriteStatus};
