//! HTTP server integration over real sockets.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::Duration;

use kiln::event_loop::EventLoop;
use kiln::http::{HttpRequest, HttpResponse, HttpServer, StatusCode};

/// Run an HTTP server on an ephemeral port, drive it with `client`, then
/// shut the loop down.
fn run_http<H, C>(handler: H, client: C)
where
    H: Fn(&HttpRequest, &mut HttpResponse) + Send + Sync + 'static,
    C: FnOnce(SocketAddr) + Send + 'static,
{
    let mut event_loop = EventLoop::new();
    let handle = event_loop.handle().clone();

    let server =
        HttpServer::new(&handle, "127.0.0.1:0".parse().unwrap(), "test-http", false).unwrap();
    server.set_http_callback(handler);
    server.set_thread_num(1);
    let addr = server.local_addr();
    server.start();

    let client_thread = thread::spawn(move || {
        client(addr);
        handle.quit();
    });

    event_loop.run();
    client_thread.join().unwrap();
}

/// Read one keep-alive response: headers, then exactly Content-Length body
/// bytes.
fn read_response(stream: &mut TcpStream) -> (String, String) {
    let mut raw = Vec::new();
    let mut byte = [0u8; 1];
    while !raw.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).unwrap();
        raw.push(byte[0]);
    }
    let head = String::from_utf8(raw).unwrap();

    let content_length: usize = head
        .lines()
        .find_map(|line| line.strip_prefix("Content-Length: "))
        .map(|v| v.trim().parse().unwrap())
        .unwrap_or(0);

    let mut body = vec![0u8; content_length];
    stream.read_exact(&mut body).unwrap();
    (head, String::from_utf8(body).unwrap())
}

#[test]
fn get_round_trip() {
    run_http(
        |request, response| {
            response.set_status_code(StatusCode::Ok);
            response.set_status_message("OK");
            response.set_close_connection(true);
            response.set_body(format!(
                "{} {}",
                request.method().unwrap().as_str(),
                request.path()
            ));
        },
        |addr| {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream
                .write_all(b"GET /hello HTTP/1.1\r\nHost: example\r\n\r\n")
                .unwrap();

            let mut wire = String::new();
            stream.read_to_string(&mut wire).unwrap();
            assert!(wire.starts_with("HTTP/1.1 200 OK\r\n"), "got: {}", wire);
            assert!(wire.contains("Connection: close\r\n"));
            assert!(wire.ends_with("GET /hello"));
        },
    );
}

#[test]
fn post_body_is_delivered_and_http10_closes() {
    run_http(
        |request, response| {
            response.set_status_code(StatusCode::Ok);
            response.set_status_message("OK");
            response.set_body(request.body().to_string());
        },
        |addr| {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream
                .write_all(b"POST /x HTTP/1.0\r\nContent-Length: 5\r\n\r\nhello")
                .unwrap();

            // HTTP/1.0 without keep-alive: the server half-closes after the
            // response, so read_to_end terminates.
            let mut wire = String::new();
            stream.read_to_string(&mut wire).unwrap();
            assert!(wire.starts_with("HTTP/1.1 200 OK\r\n"), "got: {}", wire);
            assert!(wire.contains("Connection: close\r\n"));
            assert!(wire.ends_with("hello"));
        },
    );
}

#[test]
fn bad_version_gets_400_and_close() {
    run_http(
        |_request, response| {
            response.set_status_code(StatusCode::Ok);
            response.set_status_message("OK");
        },
        |addr| {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.write_all(b"GET / HTTP/2.0\r\n\r\n").unwrap();

            let mut wire = String::new();
            stream.read_to_string(&mut wire).unwrap();
            assert!(wire.starts_with("HTTP/1.1 400 "), "got: {}", wire);
            assert!(wire.contains("Connection: close\r\n"));
        },
    );
}

#[test]
fn partial_header_completes_on_second_write() {
    run_http(
        |request, response| {
            response.set_status_code(StatusCode::Ok);
            response.set_status_message("OK");
            response.set_close_connection(true);
            response.set_body(request.header("Host").unwrap_or("").to_string());
        },
        |addr| {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.write_all(b"GET / HTTP/1.1\r\nHost: a").unwrap();
            thread::sleep(Duration::from_millis(50));
            stream.write_all(b".b\r\n\r\n").unwrap();

            let mut wire = String::new();
            stream.read_to_string(&mut wire).unwrap();
            assert!(wire.starts_with("HTTP/1.1 200 OK\r\n"), "got: {}", wire);
            assert!(wire.ends_with("a.b"));
        },
    );
}

#[test]
fn keep_alive_serves_sequential_requests() {
    run_http(
        |request, response| {
            response.set_status_code(StatusCode::Ok);
            response.set_status_message("OK");
            response.set_body(request.path().to_string());
        },
        |addr| {
            let mut stream = TcpStream::connect(addr).unwrap();

            stream.write_all(b"GET /first HTTP/1.1\r\n\r\n").unwrap();
            let (head, body) = read_response(&mut stream);
            assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
            assert!(head.contains("Connection: Keep-Alive\r\n"));
            assert_eq!(body, "/first");

            stream.write_all(b"GET /second HTTP/1.1\r\n\r\n").unwrap();
            let (_, body) = read_response(&mut stream);
            assert_eq!(body, "/second");
        },
    );
}

#[test]
fn pipelined_requests_each_get_a_response() {
    run_http(
        |request, response| {
            response.set_status_code(StatusCode::Ok);
            response.set_status_message("OK");
            response.set_body(request.path().to_string());
        },
        |addr| {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream
                .write_all(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n")
                .unwrap();

            let (_, body) = read_response(&mut stream);
            assert_eq!(body, "/a");
            let (_, body) = read_response(&mut stream);
            assert_eq!(body, "/b");
        },
    );
}
