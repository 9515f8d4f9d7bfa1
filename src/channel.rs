//! Channel: one file descriptor's readiness subscription and callbacks.
//!
//! A channel never owns its fd. It records the interest mask registered
//! with the poller, the events observed on the last tick, and the callbacks
//! to dispatch. A channel is only ever mutated by its owning loop's thread.

use std::any::Any;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::event_loop::LoopHandle;

pub(crate) const READ_EVENT: u32 = (libc::EPOLLIN | libc::EPOLLPRI) as u32;
pub(crate) const WRITE_EVENT: u32 = libc::EPOLLOUT as u32;
const NONE_EVENT: u32 = 0;

const STATUS_NEW: u8 = 0;
const STATUS_ADDED: u8 = 1;
const STATUS_DELETED: u8 = 2;

/// Registration status of a channel with respect to its poller: not yet
/// known to it, in the kernel interest set, or known but currently removed
/// from the kernel interest set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollStatus {
    New,
    Added,
    Deleted,
}

type EventCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    read: Option<EventCallback>,
    write: Option<EventCallback>,
    close: Option<EventCallback>,
    error: Option<EventCallback>,
}

pub struct Channel {
    handle: Arc<LoopHandle>,
    fd: RawFd,
    events: AtomicU32,
    revents: AtomicU32,
    status: AtomicU8,
    callbacks: Mutex<Callbacks>,
    /// Lifetime tie consulted before dispatch so the owner cannot be
    /// destroyed mid-event.
    tie: Mutex<Option<Weak<dyn Any + Send + Sync>>>,
    weak_self: Weak<Channel>,
}

impl Channel {
    pub fn new(handle: Arc<LoopHandle>, fd: RawFd) -> Arc<Channel> {
        Arc::new_cyclic(|weak_self| Channel {
            handle,
            fd,
            events: AtomicU32::new(NONE_EVENT),
            revents: AtomicU32::new(0),
            status: AtomicU8::new(STATUS_NEW),
            callbacks: Mutex::new(Callbacks::default()),
            tie: Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn owner_loop(&self) -> &Arc<LoopHandle> {
        &self.handle
    }

    pub fn set_read_callback(&self, cb: impl Fn() + Send + Sync + 'static) {
        self.callbacks.lock().read = Some(Arc::new(cb));
    }

    pub fn set_write_callback(&self, cb: impl Fn() + Send + Sync + 'static) {
        self.callbacks.lock().write = Some(Arc::new(cb));
    }

    pub fn set_close_callback(&self, cb: impl Fn() + Send + Sync + 'static) {
        self.callbacks.lock().close = Some(Arc::new(cb));
    }

    pub fn set_error_callback(&self, cb: impl Fn() + Send + Sync + 'static) {
        self.callbacks.lock().error = Some(Arc::new(cb));
    }

    /// Tie event dispatch to the lifetime of `owner`. Once the owner is
    /// dropped, pending events for this channel are skipped instead of
    /// running callbacks against a destroyed object.
    pub fn tie(&self, owner: &Arc<dyn Any + Send + Sync>) {
        *self.tie.lock() = Some(Arc::downgrade(owner));
    }

    #[inline]
    pub fn is_reading(&self) -> bool {
        self.events() & READ_EVENT != 0
    }

    #[inline]
    pub fn is_writing(&self) -> bool {
        self.events() & WRITE_EVENT != 0
    }

    #[inline]
    pub fn is_none_event(&self) -> bool {
        self.events() == NONE_EVENT
    }

    pub fn enable_reading(&self) {
        self.events.fetch_or(READ_EVENT, Ordering::Relaxed);
        self.update();
    }

    pub fn disable_reading(&self) {
        self.events.fetch_and(!READ_EVENT, Ordering::Relaxed);
        self.update();
    }

    pub fn enable_writing(&self) {
        self.events.fetch_or(WRITE_EVENT, Ordering::Relaxed);
        self.update();
    }

    pub fn disable_writing(&self) {
        self.events.fetch_and(!WRITE_EVENT, Ordering::Relaxed);
        self.update();
    }

    pub fn disable_all(&self) {
        self.events.store(NONE_EVENT, Ordering::Relaxed);
        self.update();
    }

    /// Unregister from the poller. The channel must be disabled first.
    pub fn remove(&self) {
        self.handle.poller().remove_channel(self);
    }

    fn update(&self) {
        self.handle.poller().update_channel(self);
    }

    #[inline]
    pub(crate) fn events(&self) -> u32 {
        self.events.load(Ordering::Relaxed)
    }

    pub(crate) fn set_revents(&self, revents: u32) {
        self.revents.store(revents, Ordering::Relaxed);
    }

    pub(crate) fn status(&self) -> PollStatus {
        match self.status.load(Ordering::Relaxed) {
            STATUS_ADDED => PollStatus::Added,
            STATUS_DELETED => PollStatus::Deleted,
            _ => PollStatus::New,
        }
    }

    pub(crate) fn set_status(&self, status: PollStatus) {
        let raw = match status {
            PollStatus::New => STATUS_NEW,
            PollStatus::Added => STATUS_ADDED,
            PollStatus::Deleted => STATUS_DELETED,
        };
        self.status.store(raw, Ordering::Relaxed);
    }

    pub(crate) fn weak_self(&self) -> Weak<Channel> {
        self.weak_self.clone()
    }

    /// Dispatch the events recorded by the poller for this tick.
    pub(crate) fn handle_event(&self) {
        // Hold a strong reference to the tied owner for the duration of the
        // dispatch; skip the whole event if the owner is already gone.
        let _guard: Option<Arc<dyn Any + Send + Sync>> = {
            let tie = self.tie.lock();
            match tie.as_ref() {
                Some(weak) => match weak.upgrade() {
                    Some(strong) => Some(strong),
                    None => return,
                },
                None => None,
            }
        };

        let revents = self.revents.load(Ordering::Relaxed);
        trace!(fd = self.fd, revents, "channel event");

        let (read_cb, write_cb, close_cb, error_cb) = {
            let callbacks = self.callbacks.lock();
            (
                callbacks.read.clone(),
                callbacks.write.clone(),
                callbacks.close.clone(),
                callbacks.error.clone(),
            )
        };

        // Peer hung up and nothing is left to read.
        if revents & libc::EPOLLHUP as u32 != 0 && revents & libc::EPOLLIN as u32 == 0 {
            warn!(fd = self.fd, "hangup");
            if let Some(cb) = &close_cb {
                cb();
            }
        }
        if revents & libc::EPOLLERR as u32 != 0 {
            if let Some(cb) = &error_cb {
                cb();
            }
        }
        if revents & (libc::EPOLLIN | libc::EPOLLPRI | libc::EPOLLRDHUP) as u32 != 0 {
            if let Some(cb) = &read_cb {
                cb();
            }
        }
        if revents & libc::EPOLLOUT as u32 != 0 {
            if let Some(cb) = &write_cb {
                cb();
            }
        }
    }
}
