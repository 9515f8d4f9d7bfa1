//! kiln — a multi-threaded, reactor-pattern TCP runtime with minimal
//! HTTP/1.x framing.
//!
//! One event loop per thread; each accepted connection is bound to one
//! worker loop for its whole lifetime, so per-connection callbacks are
//! serialized without locking. The main loop owns the acceptor and the
//! connection registry; cross-thread work is handed off through each loop's
//! pending-task queue and an eventfd wakeup.
//!
//! ```no_run
//! use kiln::event_loop::EventLoop;
//! use kiln::http::{HttpServer, StatusCode};
//!
//! let mut event_loop = EventLoop::new();
//! let server = HttpServer::new(
//!     event_loop.handle(),
//!     "127.0.0.1:8080".parse().unwrap(),
//!     "demo",
//!     false,
//! )
//! .unwrap();
//! server.set_http_callback(|_request, response| {
//!     response.set_status_code(StatusCode::Ok);
//!     response.set_status_message("OK");
//!     response.set_body("hello\n");
//! });
//! server.set_thread_num(4);
//! server.start();
//! event_loop.run();
//! ```

pub mod acceptor;
pub mod buffer;
pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod event_loop;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod poller;
pub mod server;
pub mod signal;
pub mod socket;
pub mod thread_pool;
pub mod timer;

pub use buffer::Buffer;
pub use channel::Channel;
pub use config::Config;
pub use connection::{ConnState, TcpConnection, TcpConnectionPtr};
pub use error::{Error, Result};
pub use event_loop::{EventLoop, LoopHandle};
pub use http::{HttpRequest, HttpResponse, HttpServer};
pub use server::TcpServer;
pub use socket::Socket;
pub use thread_pool::{EventLoopThread, EventLoopThreadPool};
pub use timer::{TimerId, TimerManager};
