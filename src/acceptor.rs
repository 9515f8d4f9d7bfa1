//! Listening-socket handling with file-descriptor-exhaustion recovery.

use std::fs::File;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::channel::Channel;
use crate::event_loop::LoopHandle;
use crate::logging::fatal;
use crate::metrics;
use crate::socket::Socket;

pub type NewConnectionCallback = Box<dyn Fn(Socket, SocketAddr) + Send + Sync>;

/// Accepts inbound connections on behalf of a server.
///
/// Owns the listening socket, its channel on the owning loop, and a reserve
/// descriptor (open on `/dev/null`) used to shed load gracefully when the
/// process runs out of file descriptors.
pub struct Acceptor {
    handle: Arc<LoopHandle>,
    socket: Socket,
    channel: Arc<Channel>,
    new_connection: Mutex<Option<NewConnectionCallback>>,
    idle_fd: Mutex<Option<File>>,
    listening: AtomicBool,
}

impl Acceptor {
    /// Create the listening socket, bind it, and open the reserve fd.
    /// Listening does not start until `listen` runs on the owning loop.
    pub fn new(
        handle: Arc<LoopHandle>,
        listen_addr: SocketAddr,
        reuse_port: bool,
    ) -> io::Result<Arc<Acceptor>> {
        let socket = Socket::new_nonblocking(listen_addr)?;
        socket.set_reuse_addr(true);
        socket.set_reuse_port(reuse_port);
        socket.bind(listen_addr)?;
        let idle_fd = File::open("/dev/null")?;

        let channel = Channel::new(handle.clone(), socket.fd());
        let acceptor = Arc::new(Acceptor {
            handle,
            socket,
            channel,
            new_connection: Mutex::new(None),
            idle_fd: Mutex::new(Some(idle_fd)),
            listening: AtomicBool::new(false),
        });

        let weak: Weak<Acceptor> = Arc::downgrade(&acceptor);
        acceptor.channel.set_read_callback(move || {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read();
            }
        });

        Ok(acceptor)
    }

    pub fn set_new_connection_callback(
        &self,
        cb: impl Fn(Socket, SocketAddr) + Send + Sync + 'static,
    ) {
        *self.new_connection.lock() = Some(Box::new(cb));
    }

    pub fn listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Start listening and watch the socket for readability.
    pub fn listen(&self) {
        self.handle.assert_in_loop_thread();
        if let Err(err) = self.socket.listen() {
            fatal!("listen failed: {}", err);
        }
        self.listening.store(true, Ordering::Release);
        self.channel.enable_reading();
        info!(addr = ?self.socket.local_addr().ok(), "listening");
    }

    /// One accept per readability event; level-triggered polling re-arms
    /// the channel while the backlog is non-empty.
    fn handle_read(&self) {
        self.handle.assert_in_loop_thread();
        match self.socket.accept() {
            Ok((socket, peer_addr)) => {
                metrics::CONNECTIONS_ACCEPTED.increment();
                let cb = self.new_connection.lock();
                match cb.as_ref() {
                    Some(cb) => cb(socket, peer_addr),
                    None => drop(socket),
                }
            }
            Err(err) => {
                if err.kind() == io::ErrorKind::WouldBlock {
                    return;
                }
                error!("accept failed: {}", err);
                metrics::ACCEPT_ERRORS.increment();
                if err.raw_os_error() == Some(libc::EMFILE) {
                    self.shed_connection();
                }
            }
        }
    }

    /// Out of descriptors. Close the reserve fd to free one slot, accept
    /// the pending connection and close it immediately so the client sees a
    /// clean close rather than a refused connection, then retake the
    /// reserve fd.
    fn shed_connection(&self) {
        let mut idle = self.idle_fd.lock();
        idle.take();
        match self.socket.accept() {
            Ok((socket, _)) => drop(socket),
            Err(err) => warn!("shed accept failed: {}", err),
        }
        match File::open("/dev/null") {
            Ok(file) => *idle = Some(file),
            Err(err) => error!("failed to reopen reserve fd: {}", err),
        }
        metrics::FD_EXHAUSTION_SHEDS.increment();
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.channel.disable_all();
        self.channel.remove();
    }
}
