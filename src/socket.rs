//! RAII TCP socket wrapper.

use std::io;
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, SockAddr, Socket as RawSocket, Type};
use tracing::error;

/// A non-blocking, close-on-exec TCP socket. The descriptor is owned for the
/// lifetime of the wrapper and closed on drop.
pub struct Socket {
    inner: RawSocket,
}

impl Socket {
    /// Create an unbound stream socket for `addr`'s address family.
    pub fn new_nonblocking(addr: SocketAddr) -> io::Result<Socket> {
        let socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        Ok(Socket { inner: socket })
    }

    pub(crate) fn from_accepted(inner: RawSocket) -> Socket {
        Socket { inner }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }

    pub fn bind(&self, addr: SocketAddr) -> io::Result<()> {
        let addr = SockAddr::from(addr);
        self.inner.bind(&addr)
    }

    pub fn listen(&self) -> io::Result<()> {
        self.inner.listen(libc::SOMAXCONN)
    }

    /// Accept one pending connection. The accepted socket is switched to
    /// non-blocking before it is returned.
    pub fn accept(&self) -> io::Result<(Socket, SocketAddr)> {
        let (socket, addr) = self.inner.accept()?;
        socket.set_nonblocking(true)?;
        let peer = addr
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "non-inet peer address"))?;
        Ok((Socket::from_accepted(socket), peer))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let addr = self.inner.local_addr()?;
        addr.as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "non-inet local address"))
    }

    pub fn write(&self, data: &[u8]) -> io::Result<usize> {
        self.inner.send(data)
    }

    /// Half-close: shut down the write side only, letting the peer drain
    /// whatever is still in flight.
    pub fn shutdown_write(&self) {
        if let Err(err) = self.inner.shutdown(Shutdown::Write) {
            error!("shutdown write failed: {}", err);
        }
    }

    /// SO_REUSEADDR lets a restarted server bind while old connections sit
    /// in TIME_WAIT.
    pub fn set_reuse_addr(&self, on: bool) {
        if let Err(err) = self.inner.set_reuse_address(on) {
            error!("SO_REUSEADDR failed: {}", err);
        }
    }

    /// SO_REUSEPORT lets several listening sockets share one port with
    /// kernel-side load balancing.
    pub fn set_reuse_port(&self, on: bool) {
        self.setsockopt(libc::SOL_SOCKET, libc::SO_REUSEPORT, on, "SO_REUSEPORT");
    }

    /// Disable or enable Nagle's algorithm.
    pub fn set_tcp_nodelay(&self, on: bool) {
        self.setsockopt(libc::IPPROTO_TCP, libc::TCP_NODELAY, on, "TCP_NODELAY");
    }

    pub fn set_keepalive(&self, on: bool) {
        self.setsockopt(libc::SOL_SOCKET, libc::SO_KEEPALIVE, on, "SO_KEEPALIVE");
    }

    fn setsockopt(&self, level: libc::c_int, opt: libc::c_int, on: bool, name: &str) {
        let optval: libc::c_int = if on { 1 } else { 0 };
        let rc = unsafe {
            libc::setsockopt(
                self.fd(),
                level,
                opt,
                &optval as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            error!("setsockopt {} failed: {}", name, io::Error::last_os_error());
        }
    }
}
