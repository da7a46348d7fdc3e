//! Socket primitives consumed by the concrete descriptors.
//!
//! All handles are `OwnedFd` and are closed on drop. Sockets are created
//! non-blocking and close-on-exec.

use std::io;
use std::mem::{size_of, MaybeUninit};
use std::net::SocketAddr;
use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd, RawFd};

use socket2::{Domain, Protocol, SockAddr, SockRef, Socket, Type};

/// Creates a listening stream socket bound to `addr`.
///
/// `backlog` is capped by `net.core.somaxconn`. If connections are not
/// accepted quickly enough they may be dropped by the kernel.
pub fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<OwnedFd> {
    let socket = Socket::new(
        Domain::for_address(addr),
        Type::STREAM.nonblocking().cloexec(),
        Some(Protocol::TCP),
    )?;
    // Mirrors what libstd does for listeners.
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    Ok(into_owned(socket))
}

/// Creates a non-blocking stream socket suitable for `start_connect`.
pub fn create_stream_socket(addr: SocketAddr) -> io::Result<OwnedFd> {
    let socket = Socket::new(
        Domain::for_address(addr),
        Type::STREAM.nonblocking().cloexec(),
        Some(Protocol::TCP),
    )?;
    Ok(into_owned(socket))
}

/// Creates a non-blocking datagram socket bound to `addr`.
pub fn create_datagram_socket(addr: SocketAddr) -> io::Result<OwnedFd> {
    let socket = Socket::new(
        Domain::for_address(addr),
        Type::DGRAM.nonblocking().cloexec(),
        Some(Protocol::UDP),
    )?;
    socket.bind(&addr.into())?;
    Ok(into_owned(socket))
}

/// Starts a non-blocking connect. Returns `Ok(())` both when the connect
/// completed immediately and when it is in progress; completion (or
/// failure) is reported through writability / `socket_error`.
pub fn start_connect(fd: &OwnedFd, addr: SocketAddr) -> io::Result<()> {
    let socket = SockRef::from(fd);
    match socket.connect(&addr.into()) {
        Ok(()) => Ok(()),
        Err(ref err) if err.raw_os_error() == Some(libc::EINPROGRESS) => Ok(()),
        Err(err) => Err(err),
    }
}

pub fn set_tcp_no_delay(fd: &OwnedFd, enabled: bool) -> io::Result<()> {
    SockRef::from(fd).set_nodelay(enabled)
}

/// Internally the kernel doubles `size`.
pub fn set_send_buffer_size(fd: &OwnedFd, size: usize) -> io::Result<()> {
    SockRef::from(fd).set_send_buffer_size(size)
}

pub fn set_receive_buffer_size(fd: &OwnedFd, size: usize) -> io::Result<()> {
    SockRef::from(fd).set_recv_buffer_size(size)
}

/// Returns and clears the pending socket error, if any.
pub fn socket_error(fd: RawFd) -> io::Error {
    let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
    match SockRef::from(&borrowed).take_error() {
        Ok(Some(err)) => err,
        Ok(None) => io::Error::new(io::ErrorKind::Other, "unknown socket error"),
        Err(err) => err,
    }
}

pub fn local_addr(fd: &OwnedFd) -> io::Result<SocketAddr> {
    SockRef::from(fd)
        .local_addr()?
        .as_socket()
        .ok_or_else(|| io::ErrorKind::InvalidInput.into())
}

/// Accepts one connection, `CLOEXEC` and `NONBLOCK` already applied.
pub fn accept(fd: RawFd) -> io::Result<(OwnedFd, SocketAddr)> {
    let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
    let mut length = size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    let stream = syscall_eintr!(accept4(
        fd,
        storage.as_mut_ptr() as *mut _,
        &mut length,
        libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
    ))
    .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) })?;

    let addr = unsafe { to_socket_addr(storage.as_ptr())? };
    Ok((stream, addr))
}

/// `storage` must be initialised to a `sockaddr_in` or `sockaddr_in6`.
pub(crate) unsafe fn to_socket_addr(
    storage: *const libc::sockaddr_storage,
) -> io::Result<SocketAddr> {
    let len = match (*storage).ss_family as libc::c_int {
        libc::AF_INET => size_of::<libc::sockaddr_in>(),
        libc::AF_INET6 => size_of::<libc::sockaddr_in6>(),
        _ => return Err(io::ErrorKind::InvalidInput.into()),
    };
    let ((), addr) = SockAddr::try_init(|addr_storage, addr_len| {
        // SAFETY: `try_init` hands us a zeroed `sockaddr_storage`, which
        // is at least `len` bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(storage as *const u8, addr_storage as *mut u8, len);
            *addr_len = len as libc::socklen_t;
        }
        Ok(())
    })?;
    addr.as_socket()
        .ok_or_else(|| io::ErrorKind::InvalidInput.into())
}

fn into_owned(socket: Socket) -> OwnedFd {
    // SAFETY: `into_raw_fd` transfers ownership of a valid fd.
    unsafe { OwnedFd::from_raw_fd(socket.into_raw_fd()) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn listener_round_trip() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = create_listener(addr, 128).expect("unable to create listener");
        let bound = local_addr(&listener).unwrap();
        assert_ne!(bound.port(), 0);

        let client = create_stream_socket(bound).unwrap();
        start_connect(&client, bound).expect("unable to start connect");
        set_tcp_no_delay(&client, true).unwrap();
    }

    #[test]
    fn accept_would_block_when_idle() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = create_listener(addr, 16).unwrap();
        let err = accept(listener.as_raw_fd()).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    }

    #[test]
    fn buffer_sizes() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let socket = create_datagram_socket(addr).unwrap();
        set_send_buffer_size(&socket, 64 * 1024).unwrap();
        set_receive_buffer_size(&socket, 64 * 1024).unwrap();
    }
}
