//! TCP server integration: echo round trip, registry bookkeeping,
//! round-robin worker assignment, write-complete notification.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use kiln::event_loop::EventLoop;
use kiln::server::TcpServer;

#[test]
fn echo_round_trip_and_registry_drains() {
    let mut event_loop = EventLoop::new();
    let handle = event_loop.handle().clone();

    let server = TcpServer::new(&handle, "127.0.0.1:0".parse().unwrap(), "echo", false).unwrap();
    server.set_message_callback(|conn, buf, _n| {
        let data = buf.retrieve_all_as_string();
        conn.send(data.as_bytes());
    });
    server.set_thread_num(1);
    let addr = server.local_addr();
    server.start();

    let client = {
        let handle = handle.clone();
        thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.write_all(b"ping").unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"ping");
            drop(stream);

            // Give the server time to observe the close and unregister.
            thread::sleep(Duration::from_millis(200));
            handle.quit();
        })
    };

    event_loop.run();
    client.join().unwrap();
    assert_eq!(server.connection_count(), 0);
}

#[test]
fn connection_callbacks_run_on_worker_threads() {
    let mut event_loop = EventLoop::new();
    let handle = event_loop.handle().clone();
    let main_tid = thread::current().id();

    let server = TcpServer::new(&handle, "127.0.0.1:0".parse().unwrap(), "affine", false).unwrap();
    server.set_thread_num(1);
    let off_main = Arc::new(AtomicBool::new(false));
    {
        let off_main = off_main.clone();
        server.set_connection_callback(move |conn| {
            if conn.connected() {
                off_main.store(thread::current().id() != main_tid, Ordering::SeqCst);
            }
        });
    }
    let addr = server.local_addr();
    server.start();

    let client = {
        let handle = handle.clone();
        thread::spawn(move || {
            let stream = TcpStream::connect(addr).unwrap();
            thread::sleep(Duration::from_millis(100));
            drop(stream);
            thread::sleep(Duration::from_millis(100));
            handle.quit();
        })
    };

    event_loop.run();
    client.join().unwrap();
    assert!(off_main.load(Ordering::SeqCst));
}

#[test]
fn connections_round_robin_across_workers() {
    let mut event_loop = EventLoop::new();
    let handle = event_loop.handle().clone();

    let server = TcpServer::new(&handle, "127.0.0.1:0".parse().unwrap(), "rr", false).unwrap();
    server.set_thread_num(3);

    let assignments: Arc<Mutex<Vec<(u64, thread::ThreadId)>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let assignments = assignments.clone();
        server.set_connection_callback(move |conn| {
            if conn.connected() {
                let id: u64 = conn
                    .name()
                    .rsplit('#')
                    .next()
                    .unwrap()
                    .parse()
                    .unwrap();
                assignments.lock().push((id, thread::current().id()));
            }
        });
    }

    let addr = server.local_addr();
    server.start();

    let client = {
        let handle = handle.clone();
        thread::spawn(move || {
            let mut streams = Vec::new();
            for _ in 0..7 {
                streams.push(TcpStream::connect(addr).unwrap());
                // Sequential accepts so assignment order matches connect
                // order.
                thread::sleep(Duration::from_millis(30));
            }
            drop(streams);
            thread::sleep(Duration::from_millis(200));
            handle.quit();
        })
    };

    event_loop.run();
    client.join().unwrap();

    let mut assignments = assignments.lock().clone();
    assignments.sort_by_key(|(id, _)| *id);
    assert_eq!(assignments.len(), 7);

    let tids: Vec<_> = assignments.iter().map(|(_, tid)| *tid).collect();
    // Connection i (1-indexed) lands on worker (i-1) mod 3.
    assert_eq!(tids[0], tids[3]);
    assert_eq!(tids[3], tids[6]);
    assert_eq!(tids[1], tids[4]);
    assert_eq!(tids[2], tids[5]);
    assert_ne!(tids[0], tids[1]);
    assert_ne!(tids[1], tids[2]);
    assert_ne!(tids[0], tids[2]);
}

#[test]
fn write_complete_fires_after_large_send_drains() {
    let mut event_loop = EventLoop::new();
    let handle = event_loop.handle().clone();

    let server = TcpServer::new(&handle, "127.0.0.1:0".parse().unwrap(), "burst", false).unwrap();
    server.set_thread_num(1);

    let payload_len = 1 << 20;
    server.set_connection_callback(move |conn| {
        if conn.connected() {
            // Large enough to overflow the socket buffer and exercise the
            // queued-write path.
            conn.send(&vec![b'x'; payload_len]);
        }
    });

    let drained = Arc::new(AtomicBool::new(false));
    {
        let drained = drained.clone();
        server.set_write_complete_callback(move |conn| {
            drained.store(true, Ordering::SeqCst);
            conn.shutdown();
        });
    }

    let addr = server.local_addr();
    server.start();

    let client = {
        let handle = handle.clone();
        thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            let mut received = Vec::new();
            stream.read_to_end(&mut received).unwrap();
            assert_eq!(received.len(), payload_len);
            assert!(received.iter().all(|&b| b == b'x'));
            drop(stream);
            thread::sleep(Duration::from_millis(100));
            handle.quit();
        })
    };

    event_loop.run();
    client.join().unwrap();
    assert!(drained.load(Ordering::SeqCst));
}
