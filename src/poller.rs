//! Thin wrapper around the kernel readiness notifier (Linux epoll)
//!
//! Descriptors are registered for level-triggered readable and hangup
//! interest. Level-triggered is the contract: if a copy session leaves data
//! in a socket buffer, the next wait reliably reports the descriptor again.
//! Non-Linux builds get a stub whose constructor errors.

use std::os::unix::io::RawFd;

/// The associated descriptor is ready for reading.
pub const READABLE: u32 = 0x1;
/// The peer closed its end or shut down its writing half.
pub const PEER_HANGUP: u32 = 0x2;
/// Hangup or error condition on the descriptor.
pub const HANGUP: u32 = 0x4;

/// One readiness notification for a registered descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub fd: RawFd,
    pub mask: u32,
}

impl Event {
    pub fn is_readable(&self) -> bool {
        self.mask & READABLE != 0
    }

    pub fn is_hangup(&self) -> bool {
        self.mask & (PEER_HANGUP | HANGUP) != 0
    }
}

#[cfg(target_os = "linux")]
pub use linux::Poller;

#[cfg(not(target_os = "linux"))]
pub use stub::Poller;

#[cfg(target_os = "linux")]
mod linux {
    use super::{Event, HANGUP, PEER_HANGUP, READABLE};
    use std::io;
    use std::os::unix::io::RawFd;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Upper bound on events returned by a single wait
    const MAX_EVENTS: usize = 100;

    /// Internal epoll_wait granularity; lets wait() observe close() promptly
    /// while callers still see a blocking call.
    const WAIT_TICK_MS: i32 = 250;

    /// Level-triggered epoll instance
    #[derive(Debug)]
    pub struct Poller {
        epfd: RawFd,
        closed: AtomicBool,
    }

    impl Poller {
        pub fn new() -> io::Result<Poller> {
            let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
            if epfd < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Poller {
                epfd,
                closed: AtomicBool::new(false),
            })
        }

        /// Register `fd` for readable and hangup notifications.
        pub fn add(&self, fd: RawFd) -> io::Result<()> {
            let mut event = libc::epoll_event {
                events: (libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLHUP) as u32,
                u64: fd as u64,
            };
            let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut event) };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        /// Remove `fd` from the interest list.
        pub fn delete(&self, fd: RawFd) -> io::Result<()> {
            let rc = unsafe {
                libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
            };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        /// Block until at least one registered descriptor reports an event,
        /// returning up to `MAX_EVENTS` notifications. Transient syscall
        /// failures are retried here. Errors once the poller is closed.
        pub fn wait(&self) -> io::Result<Vec<Event>> {
            let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
            loop {
                if self.is_closed() {
                    return Err(closed_error());
                }
                let n = unsafe {
                    libc::epoll_wait(
                        self.epfd,
                        events.as_mut_ptr(),
                        MAX_EVENTS as i32,
                        WAIT_TICK_MS,
                    )
                };
                if n < 0 {
                    let err = io::Error::last_os_error();
                    if is_transient(&err) {
                        continue;
                    }
                    return Err(err);
                }
                if n == 0 {
                    // timeout tick, re-check the closed flag
                    continue;
                }
                return Ok(events[..n as usize].iter().map(translate).collect());
            }
        }

        /// Release the kernel object. Idempotent; concurrent waiters exit
        /// with an error.
        pub fn close(&self) {
            if self
                .closed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                unsafe {
                    libc::close(self.epfd);
                }
            }
        }

        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::Acquire)
        }
    }

    impl Drop for Poller {
        fn drop(&mut self) {
            self.close();
        }
    }

    fn closed_error() -> io::Error {
        io::Error::new(io::ErrorKind::Other, "poller is closed")
    }

    fn is_transient(err: &io::Error) -> bool {
        matches!(
            err.raw_os_error(),
            Some(libc::EINTR)
                | Some(libc::EAGAIN)
                | Some(libc::EWOULDBLOCK)
                | Some(libc::EMFILE)
                | Some(libc::ENFILE)
                | Some(libc::ETIMEDOUT)
        )
    }

    fn translate(raw: &libc::epoll_event) -> Event {
        let bits = raw.events as i32;
        let mut mask = 0;
        if bits & libc::EPOLLIN != 0 {
            mask |= READABLE;
        }
        if bits & libc::EPOLLRDHUP != 0 {
            mask |= PEER_HANGUP;
        }
        if bits & (libc::EPOLLHUP | libc::EPOLLERR) != 0 {
            mask |= HANGUP;
        }
        Event {
            fd: raw.u64 as RawFd,
            mask,
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod stub {
    use super::Event;
    use std::io;
    use std::os::unix::io::RawFd;

    /// Stub for non-Linux targets; construction always fails.
    #[derive(Debug)]
    pub struct Poller;

    impl Poller {
        pub fn new() -> io::Result<Poller> {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "readiness notifier requires Linux epoll",
            ))
        }

        pub fn add(&self, _fd: RawFd) -> io::Result<()> {
            Ok(())
        }

        pub fn delete(&self, _fd: RawFd) -> io::Result<()> {
            Ok(())
        }

        pub fn wait(&self) -> io::Result<Vec<Event>> {
            Ok(Vec::new())
        }

        pub fn close(&self) {}

        pub fn is_closed(&self) -> bool {
            true
        }
    }
}
