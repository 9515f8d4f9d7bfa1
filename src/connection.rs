//! Per-connection state machine, buffers, and send path.
//!
//! Connections are shared-ownership objects: the server registry holds one
//! reference and every in-flight callback holds another, so a connection can
//! never be destroyed mid-callback. The channel is lifetime-tied back to the
//! connection with a weak reference that is checked before each dispatch.
//!
//! All buffer and channel mutation happens on the owning loop's thread; the
//! mutexes here are uncontended and exist to make the shared ownership safe.

use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, trace, warn};

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::LoopHandle;
use crate::metrics;
use crate::socket::Socket;

pub type TcpConnectionPtr = Arc<TcpConnection>;

pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionPtr, &mut Buffer, usize) + Send + Sync>;
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionPtr, usize) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

/// Output-buffer size whose first crossing triggers the high-water-mark
/// callback.
pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    /// Created on accept, before `connect_established` ran on the IO loop.
    Connecting = 0,
    Connected = 1,
    /// A local `shutdown()` is in flight; the half-close may be deferred
    /// until the output buffer drains.
    Disconnecting = 2,
    Disconnected = 3,
}

fn state_from(raw: u8) -> ConnState {
    match raw {
        0 => ConnState::Connecting,
        1 => ConnState::Connected,
        2 => ConnState::Disconnecting,
        _ => ConnState::Disconnected,
    }
}

#[derive(Default)]
struct ConnCallbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_water_mark: Option<HighWaterMarkCallback>,
    close: Option<CloseCallback>,
}

pub struct TcpConnection {
    handle: Arc<LoopHandle>,
    name: String,
    state: AtomicU8,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    input: Mutex<Buffer>,
    output: Mutex<Buffer>,
    high_water_mark: AtomicUsize,
    callbacks: Mutex<ConnCallbacks>,
    /// Type-erased per-connection slot for protocol state (e.g. an HTTP
    /// parser), so the connection type stays independent of the protocol
    /// layered on top.
    context: Mutex<Option<Box<dyn Any + Send>>>,
    weak_self: Weak<TcpConnection>,
}

impl TcpConnection {
    /// Build a connection around an accepted socket. Callbacks are installed
    /// by the owning server afterwards; nothing is armed until
    /// `connect_established` runs on the owning loop.
    pub fn new(
        handle: Arc<LoopHandle>,
        name: String,
        socket: Socket,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> TcpConnectionPtr {
        socket.set_keepalive(true);
        let channel = Channel::new(handle.clone(), socket.fd());

        let conn = Arc::new_cyclic(|weak_self: &Weak<TcpConnection>| TcpConnection {
            handle,
            name,
            state: AtomicU8::new(ConnState::Connecting as u8),
            socket,
            channel,
            local_addr,
            peer_addr,
            input: Mutex::new(Buffer::new()),
            output: Mutex::new(Buffer::new()),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            callbacks: Mutex::new(ConnCallbacks::default()),
            context: Mutex::new(None),
            weak_self: weak_self.clone(),
        });
        debug!(name = %conn.name, fd = conn.channel.fd(), "connection created");

        let weak = Arc::downgrade(&conn);
        conn.channel.set_read_callback({
            let weak = weak.clone();
            move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_read();
                }
            }
        });
        conn.channel.set_write_callback({
            let weak = weak.clone();
            move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_write();
                }
            }
        });
        conn.channel.set_close_callback({
            let weak = weak.clone();
            move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_close();
                }
            }
        });
        conn.channel.set_error_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_error();
            }
        });

        conn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner_loop(&self) -> &Arc<LoopHandle> {
        &self.handle
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    pub fn disconnected(&self) -> bool {
        self.state() == ConnState::Disconnected
    }

    fn state(&self) -> ConnState {
        state_from(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Any `&self` implies at least one live strong reference, so the
    /// upgrade cannot fail.
    fn strong_self(&self) -> TcpConnectionPtr {
        self.weak_self.upgrade().expect("connection is alive")
    }

    pub fn set_connection_callback(&self, cb: impl Fn(&TcpConnectionPtr) + Send + Sync + 'static) {
        self.callbacks.lock().connection = Some(Arc::new(cb));
    }

    pub fn set_message_callback(
        &self,
        cb: impl Fn(&TcpConnectionPtr, &mut Buffer, usize) + Send + Sync + 'static,
    ) {
        self.callbacks.lock().message = Some(Arc::new(cb));
    }

    pub fn set_write_complete_callback(
        &self,
        cb: impl Fn(&TcpConnectionPtr) + Send + Sync + 'static,
    ) {
        self.callbacks.lock().write_complete = Some(Arc::new(cb));
    }

    pub fn set_high_water_mark_callback(
        &self,
        cb: impl Fn(&TcpConnectionPtr, usize) + Send + Sync + 'static,
        mark: usize,
    ) {
        self.callbacks.lock().high_water_mark = Some(Arc::new(cb));
        self.high_water_mark.store(mark, Ordering::Relaxed);
    }

    pub fn set_close_callback(&self, cb: impl Fn(&TcpConnectionPtr) + Send + Sync + 'static) {
        self.callbacks.lock().close = Some(Arc::new(cb));
    }

    pub(crate) fn set_connection_callback_arc(&self, cb: ConnectionCallback) {
        self.callbacks.lock().connection = Some(cb);
    }

    pub(crate) fn set_message_callback_arc(&self, cb: MessageCallback) {
        self.callbacks.lock().message = Some(cb);
    }

    pub(crate) fn set_write_complete_callback_arc(&self, cb: WriteCompleteCallback) {
        self.callbacks.lock().write_complete = Some(cb);
    }

    pub(crate) fn set_high_water_mark_callback_arc(&self, cb: HighWaterMarkCallback, mark: usize) {
        self.callbacks.lock().high_water_mark = Some(cb);
        self.high_water_mark.store(mark, Ordering::Relaxed);
    }

    pub fn set_context<T: Any + Send>(&self, value: T) {
        *self.context.lock() = Some(Box::new(value));
    }

    /// Lock the type-erased context slot; callers downcast to their own
    /// context type.
    pub fn context(&self) -> MutexGuard<'_, Option<Box<dyn Any + Send>>> {
        self.context.lock()
    }

    pub fn set_tcp_nodelay(&self, on: bool) {
        self.socket.set_tcp_nodelay(on);
    }

    /// Send bytes to the peer. Callable from any thread: off-loop callers
    /// copy the data and post it to the owning loop. Dropped unless the
    /// connection is Connected.
    pub fn send(&self, data: &[u8]) {
        if self.state() != ConnState::Connected {
            return;
        }
        if self.handle.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let conn = self.strong_self();
            let owned = data.to_vec();
            self.handle.run_in_loop(move || conn.send_in_loop(&owned));
        }
    }

    /// Send the readable contents of `buf`, draining it.
    pub fn send_buffer(&self, buf: &mut Buffer) {
        if self.state() != ConnState::Connected {
            return;
        }
        if self.handle.is_in_loop_thread() {
            self.send_in_loop(buf.peek());
            buf.retrieve_all();
        } else {
            let owned = buf.peek().to_vec();
            buf.retrieve_all();
            let conn = self.strong_self();
            self.handle.run_in_loop(move || conn.send_in_loop(&owned));
        }
    }

    fn send_in_loop(&self, data: &[u8]) {
        self.handle.assert_in_loop_thread();
        if self.state() == ConnState::Disconnected {
            warn!(name = %self.name, "disconnected, giving up the write");
            return;
        }

        let mut output = self.output.lock();
        let mut nwrote = 0usize;
        let mut remaining = data.len();
        let mut fault = false;

        // Nothing queued ahead of us: try the kernel directly.
        if !self.channel.is_writing() && output.readable_bytes() == 0 {
            match self.socket.write(data) {
                Ok(n) => {
                    metrics::BYTES_SENT.add(n as u64);
                    nwrote = n;
                    remaining = data.len() - n;
                    if remaining == 0 {
                        let cb = self.callbacks.lock().write_complete.clone();
                        if let Some(cb) = cb {
                            let conn = self.strong_self();
                            self.handle.queue_in_loop(move || cb(&conn));
                        }
                    }
                }
                Err(err) => {
                    if err.kind() != io::ErrorKind::WouldBlock {
                        error!(name = %self.name, "write failed: {}", err);
                        if matches!(
                            err.raw_os_error(),
                            Some(libc::EPIPE) | Some(libc::ECONNRESET)
                        ) {
                            fault = true;
                        }
                    }
                }
            }
        }

        if !fault && remaining > 0 {
            let old_len = output.readable_bytes();
            let mark = self.high_water_mark.load(Ordering::Relaxed);
            if old_len + remaining >= mark && old_len < mark {
                let cb = self.callbacks.lock().high_water_mark.clone();
                if let Some(cb) = cb {
                    let conn = self.strong_self();
                    let queued = old_len + remaining;
                    self.handle.queue_in_loop(move || cb(&conn, queued));
                }
            }
            output.append(&data[nwrote..]);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    /// Half-close the write side once queued output has drained.
    pub fn shutdown(&self) {
        if self.state() == ConnState::Connected {
            self.set_state(ConnState::Disconnecting);
            let conn = self.strong_self();
            self.handle.run_in_loop(move || conn.shutdown_in_loop());
        }
    }

    fn shutdown_in_loop(&self) {
        self.handle.assert_in_loop_thread();
        // Still flushing: handle_write performs the half-close on drain.
        if !self.channel.is_writing() {
            self.socket.shutdown_write();
        }
    }

    /// Runs on the owning loop once the server has registered the
    /// connection: ties the channel's lifetime to this connection, starts
    /// reading, and fires the connection callback.
    pub fn connect_established(&self) {
        self.handle.assert_in_loop_thread();
        debug_assert_eq!(self.state(), ConnState::Connecting);
        self.set_state(ConnState::Connected);
        metrics::CONNECTIONS_ACTIVE.increment();

        let strong = self.strong_self();
        let owner: Arc<dyn Any + Send + Sync> = strong.clone();
        self.channel.tie(&owner);
        self.channel.enable_reading();

        let cb = self.callbacks.lock().connection.clone();
        if let Some(cb) = cb {
            cb(&strong);
        }
    }

    /// Final teardown on the owning loop: disables all events, fires the
    /// connection callback one last time, and unregisters the channel. The
    /// call is queued behind callbacks already scheduled on the loop.
    pub fn connect_destroyed(&self) {
        self.handle.assert_in_loop_thread();
        let state = self.state();
        if state == ConnState::Connected || state == ConnState::Disconnecting {
            self.set_state(ConnState::Disconnected);
            metrics::CONNECTIONS_ACTIVE.decrement();
            self.channel.disable_all();

            let cb = self.callbacks.lock().connection.clone();
            if let Some(cb) = cb {
                cb(&self.strong_self());
            }
        }
        self.channel.remove();
    }

    fn handle_read(&self) {
        self.handle.assert_in_loop_thread();
        let mut input = self.input.lock();
        match input.read_from_fd(self.channel.fd()) {
            Ok(0) => {
                // Peer closed its write side.
                drop(input);
                self.handle_close();
            }
            Ok(n) => {
                metrics::BYTES_RECEIVED.add(n as u64);
                let cb = self.callbacks.lock().message.clone();
                if let Some(cb) = cb {
                    let conn = self.strong_self();
                    cb(&conn, &mut input, n);
                }
            }
            Err(err) => {
                drop(input);
                error!(name = %self.name, "read failed: {}", err);
                self.handle_error();
            }
        }
    }

    fn handle_write(&self) {
        self.handle.assert_in_loop_thread();
        if !self.channel.is_writing() {
            trace!(name = %self.name, "connection is down, no more writing");
            return;
        }

        let mut output = self.output.lock();
        match self.socket.write(output.peek()) {
            Ok(n) => {
                metrics::BYTES_SENT.add(n as u64);
                output.retrieve(n);
                if output.readable_bytes() == 0 {
                    self.channel.disable_writing();
                    let cb = self.callbacks.lock().write_complete.clone();
                    if let Some(cb) = cb {
                        let conn = self.strong_self();
                        self.handle.queue_in_loop(move || cb(&conn));
                    }
                    drop(output);
                    if self.state() == ConnState::Disconnecting {
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(err) => {
                if err.kind() != io::ErrorKind::WouldBlock {
                    error!(name = %self.name, "write failed: {}", err);
                }
            }
        }
    }

    fn handle_close(&self) {
        self.handle.assert_in_loop_thread();
        trace!(name = %self.name, state = ?self.state(), "connection closing");
        debug_assert!(matches!(
            self.state(),
            ConnState::Connected | ConnState::Disconnecting
        ));
        self.channel.disable_all();

        let cb = self.callbacks.lock().close.clone();
        if let Some(cb) = cb {
            cb(&self.strong_self());
        }
    }

    /// Log the pending socket error; recovery happens through the close
    /// path, never as a surfaced error.
    fn handle_error(&self) {
        let mut err: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                self.channel.fd(),
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut libc::c_int as *mut libc::c_void,
                &mut len,
            )
        };
        let err = if rc < 0 {
            io::Error::last_os_error()
        } else {
            io::Error::from_raw_os_error(err)
        };
        error!(name = %self.name, "SO_ERROR = {}", err);
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        debug!(name = %self.name, state = ?self.state(), "connection dropped");
    }
}
