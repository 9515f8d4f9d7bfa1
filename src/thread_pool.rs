//! Worker threads, each owning one event loop.

use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::event_loop::{EventLoop, LoopHandle};

pub type ThreadInitCallback = Arc<dyn Fn(&Arc<LoopHandle>) + Send + Sync>;

/// One thread running one event loop. The loop lives on the thread's own
/// stack; only its handle escapes. Dropping the wrapper quits the loop and
/// joins the thread.
pub struct EventLoopThread {
    handle: Arc<LoopHandle>,
    thread: Option<JoinHandle<()>>,
}

impl EventLoopThread {
    /// Spawn the thread and block until its loop has been constructed and
    /// its handle published.
    pub fn start(name: String, init: Option<ThreadInitCallback>) -> EventLoopThread {
        type Ready = (Mutex<Option<Arc<LoopHandle>>>, Condvar);
        let ready: Arc<Ready> = Arc::new((Mutex::new(None), Condvar::new()));
        let published = ready.clone();

        let thread = std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                let mut event_loop = EventLoop::new();
                let handle = event_loop.handle().clone();
                if let Some(init) = &init {
                    init(&handle);
                }
                {
                    let (lock, cvar) = &*published;
                    *lock.lock() = Some(handle);
                    cvar.notify_one();
                }
                event_loop.run();
            })
            .expect("failed to spawn event loop thread");

        let (lock, cvar) = &*ready;
        let mut guard = lock.lock();
        while guard.is_none() {
            cvar.wait(&mut guard);
        }
        let handle = guard.take().expect("loop handle published");

        EventLoopThread {
            handle,
            thread: Some(thread),
        }
    }

    pub fn handle(&self) -> &Arc<LoopHandle> {
        &self.handle
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        self.handle.quit();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Owns the worker loops of a server and hands them out round-robin.
pub struct EventLoopThreadPool {
    base: Arc<LoopHandle>,
    name: String,
    started: bool,
    num_threads: usize,
    next: usize,
    threads: Vec<EventLoopThread>,
}

impl EventLoopThreadPool {
    pub fn new(base: Arc<LoopHandle>, name: impl Into<String>) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base,
            name: name.into(),
            started: false,
            num_threads: 0,
            next: 0,
            threads: Vec::new(),
        }
    }

    /// Must be called before `start`.
    pub fn set_thread_num(&mut self, num_threads: usize) {
        assert!(!self.started);
        self.num_threads = num_threads;
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the worker threads, running `init` on each loop before it
    /// starts. With zero workers everything runs on the base loop and `init`
    /// runs there once.
    pub fn start(&mut self, init: Option<ThreadInitCallback>) {
        self.base.assert_in_loop_thread();
        self.started = true;

        for i in 0..self.num_threads {
            let name = format!("{}-io-{}", self.name, i);
            self.threads.push(EventLoopThread::start(name, init.clone()));
        }
        if self.num_threads == 0 {
            if let Some(init) = &init {
                init(&self.base);
            }
        }
        debug!(workers = self.num_threads, "event loop pool started");
    }

    /// Round-robin pick for a new connection; the base loop when the pool
    /// has no workers.
    pub fn next_loop(&mut self) -> Arc<LoopHandle> {
        self.base.assert_in_loop_thread();
        if self.threads.is_empty() {
            return self.base.clone();
        }
        let handle = self.threads[self.next].handle().clone();
        self.next = (self.next + 1) % self.threads.len();
        handle
    }

    /// Every loop in the pool, or just the base loop when there are none.
    pub fn all_loops(&self) -> Vec<Arc<LoopHandle>> {
        if self.threads.is_empty() {
            vec![self.base.clone()]
        } else {
            self.threads.iter().map(|t| t.handle().clone()).collect()
        }
    }
}
