//! TCP server: acceptor + worker pool + connection registry.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, info};

use crate::acceptor::Acceptor;
use crate::buffer::Buffer;
use crate::connection::{TcpConnection, TcpConnectionPtr};
use crate::connection::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, WriteCompleteCallback,
};
use crate::error::Result;
use crate::event_loop::LoopHandle;
use crate::socket::Socket;
use crate::thread_pool::{EventLoopThreadPool, ThreadInitCallback};

#[derive(Default)]
struct ServerCallbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_water_mark: Option<(HighWaterMarkCallback, usize)>,
    thread_init: Option<ThreadInitCallback>,
}

struct ServerInner {
    handle: Arc<LoopHandle>,
    name: String,
    ip_port: String,
    local_addr: SocketAddr,
    acceptor: Arc<Acceptor>,
    pool: Mutex<EventLoopThreadPool>,
    callbacks: Mutex<ServerCallbacks>,
    started: AtomicBool,
    tcp_nodelay: AtomicBool,
    next_conn_id: AtomicU64,
    /// Mutated only on the main loop's thread.
    connections: Mutex<HashMap<String, TcpConnectionPtr>>,
}

/// A multi-loop TCP server.
///
/// The acceptor runs on the main loop; each accepted connection is bound
/// round-robin to one worker loop for its whole lifetime. The registry of
/// live connections is keyed by the stable connection name
/// `<server-name>-<ip:port>#<id>`.
pub struct TcpServer {
    inner: Arc<ServerInner>,
}

impl TcpServer {
    pub fn new(
        handle: &Arc<LoopHandle>,
        listen_addr: SocketAddr,
        name: impl Into<String>,
        reuse_port: bool,
    ) -> Result<TcpServer> {
        let name = name.into();
        let acceptor = Acceptor::new(handle.clone(), listen_addr, reuse_port)?;
        let local_addr = acceptor.local_addr()?;

        let inner = Arc::new(ServerInner {
            handle: handle.clone(),
            ip_port: local_addr.to_string(),
            local_addr,
            acceptor,
            pool: Mutex::new(EventLoopThreadPool::new(handle.clone(), name.clone())),
            name,
            callbacks: Mutex::new(ServerCallbacks::default()),
            started: AtomicBool::new(false),
            tcp_nodelay: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(1),
            connections: Mutex::new(HashMap::new()),
        });

        let weak = Arc::downgrade(&inner);
        inner
            .acceptor
            .set_new_connection_callback(move |socket, peer_addr| {
                if let Some(inner) = weak.upgrade() {
                    ServerInner::new_connection(&inner, socket, peer_addr);
                }
            });

        Ok(TcpServer { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn ip_port(&self) -> &str {
        &self.inner.ip_port
    }

    /// The bound listen address (with the real port when binding port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn owner_loop(&self) -> &Arc<LoopHandle> {
        &self.inner.handle
    }

    /// Number of worker loops. Must be called before `start`.
    pub fn set_thread_num(&self, num_threads: usize) {
        self.inner.pool.lock().set_thread_num(num_threads);
    }

    pub fn set_thread_init_callback(
        &self,
        cb: impl Fn(&Arc<LoopHandle>) + Send + Sync + 'static,
    ) {
        self.inner.callbacks.lock().thread_init = Some(Arc::new(cb));
    }

    pub fn set_connection_callback(&self, cb: impl Fn(&TcpConnectionPtr) + Send + Sync + 'static) {
        self.inner.callbacks.lock().connection = Some(Arc::new(cb));
    }

    pub fn set_message_callback(
        &self,
        cb: impl Fn(&TcpConnectionPtr, &mut Buffer, usize) + Send + Sync + 'static,
    ) {
        self.inner.callbacks.lock().message = Some(Arc::new(cb));
    }

    pub fn set_write_complete_callback(
        &self,
        cb: impl Fn(&TcpConnectionPtr) + Send + Sync + 'static,
    ) {
        self.inner.callbacks.lock().write_complete = Some(Arc::new(cb));
    }

    /// Install a backpressure callback fired the first time a connection's
    /// output buffer crosses `mark` bytes.
    pub fn set_high_water_mark_callback(
        &self,
        cb: impl Fn(&TcpConnectionPtr, usize) + Send + Sync + 'static,
        mark: usize,
    ) {
        self.inner.callbacks.lock().high_water_mark = Some((Arc::new(cb), mark));
    }

    /// Enable TCP_NODELAY on every accepted connection.
    pub fn set_tcp_nodelay(&self, on: bool) {
        self.inner.tcp_nodelay.store(on, Ordering::Relaxed);
    }

    /// Idempotent: spawns the worker pool and starts listening on the main
    /// loop.
    pub fn start(&self) {
        if !self.inner.started.swap(true, Ordering::AcqRel) {
            let init = self.inner.callbacks.lock().thread_init.clone();
            self.inner.pool.lock().start(init);

            let inner = self.inner.clone();
            self.inner.handle.run_in_loop(move || inner.acceptor.listen());
        }
    }

    /// Number of live connections in the registry.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().len()
    }
}

impl ServerInner {
    fn new_connection(inner: &Arc<ServerInner>, socket: Socket, peer_addr: SocketAddr) {
        inner.handle.assert_in_loop_thread();

        let io_handle = inner.pool.lock().next_loop();
        let id = inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}-{}#{}", inner.name, inner.ip_port, id);
        info!(server = %inner.name, conn = %conn_name, peer = %peer_addr, "new connection");

        if inner.tcp_nodelay.load(Ordering::Relaxed) {
            socket.set_tcp_nodelay(true);
        }

        let local_addr = socket.local_addr().unwrap_or_else(|err| {
            error!("getsockname failed: {}", err);
            SocketAddr::from(([0, 0, 0, 0], 0))
        });

        let conn = TcpConnection::new(
            io_handle.clone(),
            conn_name.clone(),
            socket,
            local_addr,
            peer_addr,
        );
        inner.connections.lock().insert(conn_name, conn.clone());

        {
            let callbacks = inner.callbacks.lock();
            if let Some(cb) = &callbacks.connection {
                conn.set_connection_callback_arc(cb.clone());
            }
            if let Some(cb) = &callbacks.message {
                conn.set_message_callback_arc(cb.clone());
            }
            if let Some(cb) = &callbacks.write_complete {
                conn.set_write_complete_callback_arc(cb.clone());
            }
            if let Some((cb, mark)) = &callbacks.high_water_mark {
                conn.set_high_water_mark_callback_arc(cb.clone(), *mark);
            }
        }

        let weak = Arc::downgrade(inner);
        conn.set_close_callback(move |conn| {
            if let Some(inner) = weak.upgrade() {
                ServerInner::remove_connection(&inner, conn.clone());
            }
        });

        let established = conn.clone();
        io_handle.run_in_loop(move || established.connect_established());
    }

    /// Routes removal back to the main loop regardless of which worker the
    /// close came from.
    fn remove_connection(inner: &Arc<ServerInner>, conn: TcpConnectionPtr) {
        let server = inner.clone();
        inner
            .handle
            .run_in_loop(move || server.remove_connection_in_loop(&conn));
    }

    fn remove_connection_in_loop(&self, conn: &TcpConnectionPtr) {
        self.handle.assert_in_loop_thread();
        info!(server = %self.name, conn = %conn.name(), "remove connection");

        let removed = self.connections.lock().remove(conn.name());
        debug_assert!(removed.is_some());

        // Queued, not run inline, so read/write callbacks already scheduled
        // on the worker loop complete first.
        let io_handle = conn.owner_loop().clone();
        let conn = conn.clone();
        io_handle.queue_in_loop(move || conn.connect_destroyed());
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        let connections: Vec<TcpConnectionPtr> =
            self.connections.lock().drain().map(|(_, conn)| conn).collect();
        for conn in connections {
            let destroyed = conn.clone();
            conn.owner_loop().run_in_loop(move || destroyed.connect_destroyed());
        }
    }
}
