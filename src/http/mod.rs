//! Minimal HTTP/1.x framing over the TCP runtime.
//!
//! Covers request parsing and response serialization only: no chunked
//! transfer encoding, no keep-alive timeouts, no TLS.

pub mod parser;
pub mod request;
pub mod response;
pub mod server;

pub use parser::HttpParser;
pub use request::{HttpRequest, Method, Version};
pub use response::{HttpResponse, StatusCode};
pub use server::{HttpCallback, HttpServer};
