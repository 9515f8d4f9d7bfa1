//! Event loop scheduling behavior: cross-thread hand-off, timers, quit.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use kiln::event_loop::EventLoop;

#[test]
fn run_in_loop_executes_inline_on_owner_thread() {
    let event_loop = EventLoop::new();
    let ran = Arc::new(AtomicUsize::new(0));

    let counter = ran.clone();
    event_loop.handle().run_in_loop(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    // Executed synchronously, before the loop even runs.
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn cross_thread_tasks_run_on_loop_thread_in_fifo_order() {
    let mut event_loop = EventLoop::new();
    let handle = event_loop.handle().clone();
    let loop_tid = thread::current().id();
    let order = Arc::new(Mutex::new(Vec::new()));

    let poster = {
        let handle = handle.clone();
        let order = order.clone();
        thread::spawn(move || {
            for i in 0..5 {
                let order = order.clone();
                handle.queue_in_loop(move || {
                    assert_eq!(thread::current().id(), loop_tid);
                    order.lock().push(i);
                });
            }
            // Let the loop drain the queue before asking it to exit.
            thread::sleep(Duration::from_millis(100));
            handle.quit();
        })
    };

    event_loop.run();
    poster.join().unwrap();
    assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn quit_from_another_thread_unblocks_the_poll() {
    let mut event_loop = EventLoop::new();
    let handle = event_loop.handle().clone();
    let start = Instant::now();

    let quitter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        handle.quit();
    });

    event_loop.run();
    quitter.join().unwrap();
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[test]
fn timers_fire_in_deadline_order() {
    let mut event_loop = EventLoop::new();
    let handle = event_loop.handle().clone();
    let order = Arc::new(Mutex::new(Vec::new()));

    for (label, delay_ms) in [(2u32, 60u64), (0, 20), (1, 40)] {
        let order = order.clone();
        handle.run_after(Duration::from_millis(delay_ms), move || {
            order.lock().push(label);
        });
    }

    let quit = handle.clone();
    handle.run_after(Duration::from_millis(120), move || quit.quit());

    event_loop.run();
    assert_eq!(*order.lock(), vec![0, 1, 2]);
}

#[test]
fn periodic_timer_repeats_until_cancelled() {
    let mut event_loop = EventLoop::new();
    let handle = event_loop.handle().clone();
    let count = Arc::new(AtomicUsize::new(0));

    let counter = count.clone();
    let id = handle.run_every(Duration::from_millis(20), move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let quit = handle.clone();
    handle.run_after(Duration::from_millis(150), move || {
        quit.cancel(id);
        quit.quit();
    });

    event_loop.run();
    let fired = count.load(Ordering::SeqCst);
    assert!(fired >= 3, "periodic timer fired only {} times", fired);
}
