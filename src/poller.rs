//! Level-triggered epoll wrapper mapping file descriptors to channels.
//!
//! The kernel interest set and the fd map are only ever mutated from the
//! owning loop's thread; the map lock exists so the shared handle can reach
//! the poller, and it is never held across a callback.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{error, trace};

use crate::channel::{Channel, PollStatus};
use crate::logging::fatal;

/// Initial capacity of the scratch event list handed to `epoll_wait`.
pub(crate) const INIT_EVENT_LIST_SIZE: usize = 16;

pub struct Poller {
    epfd: OwnedFd,
    channels: Mutex<HashMap<RawFd, Weak<Channel>>>,
}

impl Poller {
    pub(crate) fn new() -> Arc<Poller> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            fatal!("epoll_create1 failed: {}", io::Error::last_os_error());
        }
        Arc::new(Poller {
            epfd: unsafe { OwnedFd::from_raw_fd(fd) },
            channels: Mutex::new(HashMap::new()),
        })
    }

    /// Wait for readiness, translate each ready descriptor to its channel
    /// with revents written, and push it onto `active`. Returns the number
    /// of ready events; interruption by a signal is benign and reports zero.
    pub(crate) fn poll(
        &self,
        timeout_ms: i32,
        events: &mut Vec<libc::epoll_event>,
        active: &mut Vec<Arc<Channel>>,
    ) -> usize {
        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                events.as_mut_ptr(),
                events.len() as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                error!("epoll_wait failed: {}", err);
            }
            return 0;
        }
        let n = n as usize;

        if n > 0 {
            trace!(ready = n, "poll returned");
            let channels = self.channels.lock();
            for event in events.iter().take(n) {
                let fd = event.u64 as RawFd;
                if let Some(channel) = channels.get(&fd).and_then(Weak::upgrade) {
                    channel.set_revents(event.events);
                    active.push(channel);
                }
            }
        }

        // A full event list means more fds may be ready than we had slots
        // for; double it for the next tick.
        if n == events.len() {
            events.resize(n * 2, libc::epoll_event { events: 0, u64: 0 });
        }

        n
    }

    /// Apply a channel's interest mask to the kernel, tracking the
    /// new/added/deleted registration status.
    pub(crate) fn update_channel(&self, channel: &Channel) {
        let status = channel.status();
        trace!(fd = channel.fd(), events = channel.events(), ?status, "update channel");

        match status {
            PollStatus::New | PollStatus::Deleted => {
                if status == PollStatus::New {
                    self.channels
                        .lock()
                        .insert(channel.fd(), channel.weak_self());
                }
                channel.set_status(PollStatus::Added);
                self.update(libc::EPOLL_CTL_ADD, channel);
            }
            PollStatus::Added => {
                if channel.is_none_event() {
                    self.update(libc::EPOLL_CTL_DEL, channel);
                    channel.set_status(PollStatus::Deleted);
                } else {
                    self.update(libc::EPOLL_CTL_MOD, channel);
                }
            }
        }
    }

    /// Stop tracking a channel entirely and reset it to the new status.
    pub(crate) fn remove_channel(&self, channel: &Channel) {
        trace!(fd = channel.fd(), "remove channel");
        self.channels.lock().remove(&channel.fd());
        if channel.status() == PollStatus::Added {
            self.update(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_status(PollStatus::New);
    }

    fn update(&self, op: libc::c_int, channel: &Channel) {
        let mut event = libc::epoll_event {
            events: channel.events(),
            u64: channel.fd() as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, channel.fd(), &mut event) } < 0 {
            let err = io::Error::last_os_error();
            if op == libc::EPOLL_CTL_DEL {
                // The fd may already be closed.
                error!(fd = channel.fd(), "epoll_ctl del failed: {}", err);
            } else {
                fatal!("epoll_ctl add/mod failed for fd {}: {}", channel.fd(), err);
            }
        }
    }
}
