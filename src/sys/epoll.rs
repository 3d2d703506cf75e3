use std::cmp;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use libc::{c_int, EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLPRI, EPOLLRDHUP};

use crate::poller::{EpollOpt, Ready};

static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

/// Raw epoll instance. Registrations are keyed directly by `RawFd` rather
/// than an opaque token: every fd in the pipeline identifies exactly one
/// connection at a time, so nothing a separate token would disambiguate.
pub struct Epoll {
    id: usize,
    epfd: RawFd,
}

impl Epoll {
    pub fn new() -> io::Result<Epoll> {
        let epfd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed) + 1;

        Ok(Epoll { id, epfd })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout_ms = timeout
            .map(|to| cmp::min(to.as_millis(), libc::c_int::max_value() as u128) as c_int)
            .unwrap_or(-1);

        let n = syscall!(epoll_wait(
            self.epfd,
            events.inner.as_mut_ptr(),
            events.inner.capacity() as i32,
            timeout_ms
        ))?;

        unsafe { events.inner.set_len(n as usize) };

        Ok(n as usize)
    }

    pub fn add(&self, fd: RawFd, interest: Ready, opts: EpollOpt) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: ioevent_to_epoll(interest, opts),
            u64: fd as u64,
        };

        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut event))?;
        Ok(())
    }

    pub fn modify(&self, fd: RawFd, interest: Ready, opts: EpollOpt) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: ioevent_to_epoll(interest, opts),
            u64: fd as u64,
        };

        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut event))?;
        Ok(())
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        let mut event = libc::epoll_event { events: 0, u64: 0 };
        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut event))?;
        Ok(())
    }
}

fn ioevent_to_epoll(interest: Ready, opts: EpollOpt) -> u32 {
    let mut kind = 0;

    if interest.is_readable() {
        kind |= EPOLLIN;
    }

    if interest.is_writable() {
        kind |= EPOLLOUT;
    }

    if interest.is_hup() {
        kind |= EPOLLRDHUP;
    }

    if opts.is_edge() {
        kind |= EPOLLET;
    }

    if opts.is_oneshot() {
        kind |= EPOLLONESHOT;
    }

    if opts.is_level() {
        kind &= !EPOLLET;
    }

    kind as u32
}

impl AsRawFd for Epoll {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.epfd);
        }
    }
}

pub struct Events {
    inner: Vec<libc::epoll_event>,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Events {
        Events {
            inner: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Decoded `(fd, readiness)` pair for event `idx`.
    pub fn get(&self, idx: usize) -> Option<(RawFd, Ready)> {
        self.inner.get(idx).map(|raw| {
            let epoll = raw.events as c_int;
            let mut ready = Ready::empty();

            if (epoll & EPOLLIN) != 0 || (epoll & EPOLLPRI) != 0 {
                ready = ready | Ready::readable();
            }

            if (epoll & EPOLLOUT) != 0 {
                ready = ready | Ready::writable();
            }

            if (epoll & EPOLLERR) != 0 {
                ready = ready | Ready::error();
            }

            if (epoll & EPOLLRDHUP) != 0 || (epoll & EPOLLHUP) != 0 {
                ready = ready | Ready::hup();
            }

            (raw.u64 as RawFd, ready)
        })
    }
}
