//! HTTP server glue: per-connection parser context, request dispatch,
//! response framing.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, info};

use crate::buffer::Buffer;
use crate::connection::TcpConnectionPtr;
use crate::error::Result;
use crate::event_loop::LoopHandle;
use crate::metrics;
use crate::server::TcpServer;

use super::parser::HttpParser;
use super::request::{HttpRequest, Version};
use super::response::{HttpResponse, StatusCode};

pub type HttpCallback = Arc<dyn Fn(&HttpRequest, &mut HttpResponse) + Send + Sync>;

/// Parser state stored in each connection's context slot.
struct HttpContext {
    parser: HttpParser,
}

/// An HTTP/1.x server over [`TcpServer`].
///
/// Each connection carries its own parser in the connection context slot.
/// Malformed requests are answered with a 400 and a half-close; complete
/// requests are handed to the user callback.
pub struct HttpServer {
    server: TcpServer,
    http_callback: Arc<Mutex<Option<HttpCallback>>>,
}

impl HttpServer {
    pub fn new(
        handle: &Arc<LoopHandle>,
        listen_addr: SocketAddr,
        name: impl Into<String>,
        reuse_port: bool,
    ) -> Result<HttpServer> {
        let server = TcpServer::new(handle, listen_addr, name, reuse_port)?;
        let http_callback: Arc<Mutex<Option<HttpCallback>>> = Arc::new(Mutex::new(None));

        server.set_connection_callback(|conn| {
            if conn.connected() {
                conn.set_context(HttpContext {
                    parser: HttpParser::new(),
                });
            }
        });

        let callback = http_callback.clone();
        server.set_message_callback(move |conn, buf, _n| {
            on_message(&callback, conn, buf);
        });

        Ok(HttpServer {
            server,
            http_callback,
        })
    }

    /// The underlying TCP server.
    pub fn tcp_server(&self) -> &TcpServer {
        &self.server
    }

    pub fn set_thread_num(&self, num_threads: usize) {
        self.server.set_thread_num(num_threads);
    }

    pub fn set_tcp_nodelay(&self, on: bool) {
        self.server.set_tcp_nodelay(on);
    }

    pub fn set_http_callback(
        &self,
        cb: impl Fn(&HttpRequest, &mut HttpResponse) + Send + Sync + 'static,
    ) {
        *self.http_callback.lock() = Some(Arc::new(cb));
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn start(&self) {
        info!(server = %self.server.name(), addr = %self.server.ip_port(), "http server starting");
        self.server.start();
    }
}

fn on_message(
    http_callback: &Arc<Mutex<Option<HttpCallback>>>,
    conn: &TcpConnectionPtr,
    buf: &mut Buffer,
) {
    let mut context = conn.context();
    let ctx = match context.as_mut().and_then(|c| c.downcast_mut::<HttpContext>()) {
        Some(ctx) => ctx,
        None => {
            error!(conn = %conn.name(), "missing http context");
            return;
        }
    };

    // A single read can carry several pipelined requests; answer them all.
    loop {
        if !ctx.parser.parse(buf) {
            metrics::HTTP_PROTOCOL_ERRORS.increment();
            error!(conn = %conn.name(), "bad request");

            let mut response = HttpResponse::new();
            response.set_status_code(StatusCode::BadRequest);
            response.set_status_message("Bad Request");
            response.set_close_connection(true);

            let mut out = Buffer::new();
            response.append_to(&mut out);
            conn.send_buffer(&mut out);
            conn.shutdown();
            return;
        }

        if !ctx.parser.got_all() {
            return;
        }

        metrics::HTTP_REQUESTS.increment();
        let response = {
            let request = ctx.parser.request();
            let mut response = HttpResponse::new();
            response.set_close_connection(wants_close(request));

            let cb = http_callback.lock().clone();
            match cb {
                Some(cb) => cb(request, &mut response),
                None => {
                    response.set_status_code(StatusCode::NotFound);
                    response.set_status_message("Not Found");
                    response.set_close_connection(true);
                }
            }
            response
        };
        ctx.parser.reset();

        let mut out = Buffer::new();
        response.append_to(&mut out);
        conn.send_buffer(&mut out);

        if response.close_connection() {
            conn.shutdown();
            return;
        }
    }
}

/// Default the response's close flag from the request before the user
/// callback runs: `Connection: close`, or HTTP/1.0 without an explicit
/// keep-alive.
fn wants_close(request: &HttpRequest) -> bool {
    let connection = request.header("Connection");
    connection.map(|v| v.eq_ignore_ascii_case("close")).unwrap_or(false)
        || (request.version() == Version::Http10
            && !connection
                .map(|v| v.eq_ignore_ascii_case("keep-alive"))
                .unwrap_or(false))
}
