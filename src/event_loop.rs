//! Per-thread reactor: poll, dispatch channels, run timers, drain tasks.
//!
//! Each loop is owned by exactly one thread. Parallelism comes from running
//! several loops, one per worker thread, with every connection permanently
//! bound to one of them; within a loop execution is single-threaded and
//! cooperative, so per-connection state needs no locking in the hot path.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::channel::Channel;
use crate::logging::fatal;
use crate::poller::{Poller, INIT_EVENT_LIST_SIZE};
use crate::timer::{TimerId, TimerManager};

/// Poll timeout per tick. Pending tasks and timers are serviced at least
/// this often even when no fd becomes ready.
const POLL_TIMEOUT_MS: i32 = 10;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Shareable handle to an event loop.
///
/// The loop itself stays on its thread's stack; the handle is what every
/// other component holds to post work, arm timers, reach the poller, and
/// request shutdown. The thread identifier is fixed at loop construction.
pub struct LoopHandle {
    thread_id: ThreadId,
    poller: Arc<Poller>,
    timers: TimerManager,
    wakeup_fd: OwnedFd,
    pending: Mutex<Vec<Task>>,
    calling_pending: AtomicBool,
    quit: AtomicBool,
}

impl LoopHandle {
    #[inline]
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            fatal!(
                "loop owned by {:?} touched from {:?}",
                self.thread_id,
                thread::current().id()
            );
        }
    }

    pub(crate) fn poller(&self) -> &Arc<Poller> {
        &self.poller
    }

    /// Run `task` on the loop thread: immediately when already on it,
    /// otherwise queued for the end of the current tick.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Queue `task` for the loop thread. The loop is woken when the caller
    /// is off-thread, or when the loop is currently draining tasks (a task
    /// queued from inside a task would otherwise wait a full poll timeout).
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.pending.lock().push(Box::new(task));
        if !self.is_in_loop_thread() || self.calling_pending.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    /// Wake the loop by bumping the eventfd counter. eventfd transfers are
    /// 8 bytes on both ends.
    pub fn wakeup(&self) {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.wakeup_fd.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                8,
            )
        };
        if n != 8 {
            error!("wakeup wrote {} bytes instead of 8", n);
        }
        crate::metrics::LOOP_WAKEUPS.increment();
    }

    /// Ask the loop to exit after the current tick. Cross-thread callers
    /// also wake the loop so it does not sit out the poll timeout first.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Run `callback` once at `when`.
    pub fn run_at(&self, when: Instant, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.timers.add(callback, when, Duration::ZERO)
    }

    /// Run `callback` once after `delay`.
    pub fn run_after(&self, delay: Duration, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.timers.add(callback, Instant::now() + delay, Duration::ZERO)
    }

    /// Run `callback` every `interval`, starting one interval from now.
    pub fn run_every(&self, interval: Duration, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.timers.add(callback, Instant::now() + interval, interval)
    }

    pub fn cancel(&self, id: TimerId) {
        self.timers.cancel(id);
    }

    /// Swap the queue out under the mutex before executing, so tasks queued
    /// by a running task land in the next drain rather than extending this
    /// one.
    fn drain_pending(&self) {
        self.calling_pending.store(true, Ordering::Release);
        let tasks: Vec<Task> = std::mem::take(&mut *self.pending.lock());
        for task in tasks {
            task();
        }
        self.calling_pending.store(false, Ordering::Release);
    }
}

/// A single-threaded reactor. Construct it on the thread that will run it;
/// hand out clones of `handle()` to everything else.
pub struct EventLoop {
    handle: Arc<LoopHandle>,
    wakeup_channel: Arc<Channel>,
    events: Vec<libc::epoll_event>,
    active: Vec<Arc<Channel>>,
    looping: bool,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    /// Create an event loop bound to the current thread.
    pub fn new() -> EventLoop {
        static SIGPIPE: Once = Once::new();
        SIGPIPE.call_once(crate::signal::ignore_sigpipe);

        let poller = Poller::new();
        let wakeup_fd = create_eventfd();
        let raw_wakeup = wakeup_fd.as_raw_fd();

        let handle = Arc::new(LoopHandle {
            thread_id: thread::current().id(),
            poller,
            timers: TimerManager::new(),
            wakeup_fd,
            pending: Mutex::new(Vec::new()),
            calling_pending: AtomicBool::new(false),
            quit: AtomicBool::new(false),
        });

        let wakeup_channel = Channel::new(handle.clone(), raw_wakeup);
        wakeup_channel.set_read_callback(move || handle_wakeup(raw_wakeup));
        wakeup_channel.enable_reading();

        debug!(thread = ?thread::current().id(), "event loop created");

        EventLoop {
            handle,
            wakeup_channel,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; INIT_EVENT_LIST_SIZE],
            active: Vec::new(),
            looping: false,
        }
    }

    pub fn handle(&self) -> &Arc<LoopHandle> {
        &self.handle
    }

    /// Run until `quit()`. Each tick: poll, dispatch ready channels, run due
    /// timers, then drain tasks posted from other threads.
    pub fn run(&mut self) {
        assert!(!self.looping);
        self.handle.assert_in_loop_thread();
        self.looping = true;
        info!("event loop start");

        while !self.handle.quit.load(Ordering::Acquire) {
            self.active.clear();
            self.handle
                .poller
                .poll(POLL_TIMEOUT_MS, &mut self.events, &mut self.active);
            for channel in &self.active {
                channel.handle_event();
            }
            self.handle.timers.process();
            self.handle.drain_pending();
        }

        info!("event loop stop");
        self.looping = false;
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.wakeup_channel.disable_all();
        self.wakeup_channel.remove();
        debug!(thread = ?thread::current().id(), "event loop destroyed");
    }
}

fn create_eventfd() -> OwnedFd {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        fatal!("eventfd failed: {}", io::Error::last_os_error());
    }
    unsafe { OwnedFd::from_raw_fd(fd) }
}

/// Drain the wakeup counter so the fd stops reporting readable.
fn handle_wakeup(fd: RawFd) {
    let mut counter: u64 = 0;
    let n = unsafe { libc::read(fd, &mut counter as *mut u64 as *mut libc::c_void, 8) };
    if n != 8 {
        error!("wakeup read {} bytes instead of 8", n);
    }
}
