//! Readiness-based polling: a single epoll instance plus the embedded time
//! wheel that ages out idle connections. This is the component spec.md
//! calls the Poller — every `PollInStage`/`PollOutStage` worker blocks in
//! [`Poller::wait`] and gets back both newly-ready fds and the connection
//! ids whose idle timer expired during the wait.

use std::fmt;
use std::io;
use std::ops;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use crate::sys::epoll::{Epoll, Events};
use crate::sys::eventfd::EventFd;
use crate::timer::TimeWheel;

/// Readiness bits a registration cares about or an event reports.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Ready(usize);

const READABLE: usize = 0b0001;
const WRITABLE: usize = 0b0010;
const ERROR: usize = 0b0100;
const HUP: usize = 0b1000;

impl Ready {
    pub fn empty() -> Ready {
        Ready(0)
    }

    pub fn readable() -> Ready {
        Ready(READABLE)
    }

    pub fn writable() -> Ready {
        Ready(WRITABLE)
    }

    pub fn error() -> Ready {
        Ready(ERROR)
    }

    pub fn hup() -> Ready {
        Ready(HUP)
    }

    pub fn is_readable(self) -> bool {
        self.contains(Ready::readable())
    }

    pub fn is_writable(self) -> bool {
        self.contains(Ready::writable())
    }

    pub fn is_error(self) -> bool {
        self.contains(Ready::error())
    }

    pub fn is_hup(self) -> bool {
        self.contains(Ready::hup())
    }

    pub fn is_empty(self) -> bool {
        self == Ready::empty()
    }

    pub fn contains(self, other: Ready) -> bool {
        (self & other) == other
    }
}

impl ops::BitOr for Ready {
    type Output = Ready;
    fn bitor(self, other: Ready) -> Ready {
        Ready(self.0 | other.0)
    }
}

impl ops::BitAnd for Ready {
    type Output = Ready;
    fn bitand(self, other: Ready) -> Ready {
        Ready(self.0 & other.0)
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let flags = [
            (Ready::readable(), "readable"),
            (Ready::writable(), "writable"),
            (Ready::error(), "error"),
            (Ready::hup(), "hup"),
        ];

        let mut first = true;
        for (flag, name) in flags {
            if self.contains(flag) {
                if !first {
                    write!(f, " | ")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }

        Ok(())
    }
}

/// Edge/level/oneshot registration behavior, mirroring the raw epoll flags.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct EpollOpt(usize);

const EDGE: usize = 0b001;
const LEVEL: usize = 0b010;
const ONESHOT: usize = 0b100;

impl EpollOpt {
    pub fn level() -> EpollOpt {
        EpollOpt(LEVEL)
    }

    pub fn edge() -> EpollOpt {
        EpollOpt(EDGE)
    }

    pub fn oneshot() -> EpollOpt {
        EpollOpt(ONESHOT)
    }

    pub fn is_edge(self) -> bool {
        self.0 & EDGE != 0
    }

    pub fn is_level(self) -> bool {
        self.0 & LEVEL != 0
    }

    pub fn is_oneshot(self) -> bool {
        self.0 & ONESHOT != 0
    }
}

impl ops::BitOr for EpollOpt {
    type Output = EpollOpt;
    fn bitor(self, other: EpollOpt) -> EpollOpt {
        EpollOpt(self.0 | other.0)
    }
}

/// Anything that can be added to, modified in, or removed from a [`Poller`]'s
/// epoll instance. Implemented by raw fds and by `EventFd`/`Waker`.
pub trait Source {
    fn add(&self, epoll: &Epoll, interest: Ready, opts: EpollOpt) -> io::Result<()>;
    fn modify(&self, epoll: &Epoll, interest: Ready, opts: EpollOpt) -> io::Result<()>;
    fn delete(&self, epoll: &Epoll) -> io::Result<()>;
}

impl Source for RawFd {
    fn add(&self, epoll: &Epoll, interest: Ready, opts: EpollOpt) -> io::Result<()> {
        epoll.add(*self, interest, opts)
    }

    fn modify(&self, epoll: &Epoll, interest: Ready, opts: EpollOpt) -> io::Result<()> {
        epoll.modify(*self, interest, opts)
    }

    fn delete(&self, epoll: &Epoll) -> io::Result<()> {
        epoll.delete(*self)
    }
}

/// Lets one thread interrupt another thread's `Poller::wait`. Backed by an
/// eventfd registered edge-triggered and read down to zero on every wakeup.
pub struct Waker {
    fd: EventFd,
}

impl Waker {
    pub fn new(epoll: &Epoll) -> io::Result<Waker> {
        let fd = EventFd::new()?;
        fd.add(epoll, Ready::readable(), EpollOpt::edge())?;
        Ok(Waker { fd })
    }

    pub fn wake(&self) -> io::Result<()> {
        match self.fd.write(1) {
            Ok(()) => Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// What came back from a [`Poller::wait`] call.
pub struct PollResult {
    /// `(fd, readiness)` pairs for connections with I/O to do.
    pub ready: Vec<(RawFd, Ready)>,
    /// Connection ids whose idle timer fired during this wait.
    pub expired: Vec<u64>,
    /// True if the wakeup was (at least in part) an explicit `Waker::wake`.
    pub woken: bool,
}

/// One epoll instance plus the idle-eviction time wheel for the connections
/// registered on it. Each `PollInStage`/`PollOutStage` worker owns one.
pub struct Poller {
    epoll: Epoll,
    events: std::sync::Mutex<Events>,
    waker: Waker,
    timer: std::sync::Mutex<TimeWheel>,
    running: std::sync::atomic::AtomicBool,
}

impl Poller {
    pub fn new(events_capacity: usize, idle_timeout: Duration) -> io::Result<Poller> {
        let epoll = Epoll::new()?;
        let waker = Waker::new(&epoll)?;

        Ok(Poller {
            epoll,
            events: std::sync::Mutex::new(Events::with_capacity(events_capacity)),
            waker,
            timer: std::sync::Mutex::new(TimeWheel::new(idle_timeout)),
            running: std::sync::atomic::AtomicBool::new(true),
        })
    }

    /// Interrupts a `wait` blocked on this poller and tells its worker loop
    /// to stop: the worker sees `is_shutdown()` true on the wakeup this
    /// causes and exits instead of calling `wait` again.
    pub fn shutdown(&self) -> io::Result<()> {
        self.running.store(false, std::sync::atomic::Ordering::Relaxed);
        self.waker.wake()
    }

    pub fn is_shutdown(&self) -> bool {
        !self.running.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn register<S: Source + ?Sized>(&self, source: &S, interest: Ready, opts: EpollOpt) -> io::Result<()> {
        source.add(&self.epoll, interest, opts)
    }

    pub fn reregister<S: Source + ?Sized>(&self, source: &S, interest: Ready, opts: EpollOpt) -> io::Result<()> {
        source.modify(&self.epoll, interest, opts)
    }

    pub fn deregister<S: Source + ?Sized>(&self, source: &S) -> io::Result<()> {
        source.delete(&self.epoll)
    }

    /// Refresh (or start) the idle timer for `id`, to fire `idle_timeout`
    /// from now.
    pub fn touch(&self, id: u64) {
        self.timer.lock().unwrap().schedule(id);
    }

    pub fn forget(&self, id: u64) {
        self.timer.lock().unwrap().cancel(id);
    }

    pub fn waker(&self) -> &Waker {
        &self.waker
    }

    pub fn wait(&self, timeout: Option<Duration>) -> io::Result<PollResult> {
        let wheel_timeout = self.timer.lock().unwrap().next_deadline(timeout);

        let mut events = self.events.lock().unwrap();
        let n = self.epoll.wait(&mut events, wheel_timeout)?;

        let mut ready = Vec::with_capacity(n);
        let mut woken = false;
        let waker_fd = self.waker.as_raw_fd();

        for i in 0..events.len() {
            if let Some((fd, readiness)) = events.get(i) {
                if fd == waker_fd {
                    let _ = self.waker.fd.read();
                    woken = true;
                } else {
                    ready.push((fd, readiness));
                }
            }
        }

        let expired = self.timer.lock().unwrap().expire_due();

        Ok(PollResult { ready, expired, woken })
    }
}

impl AsRawFd for Poller {
    fn as_raw_fd(&self) -> RawFd {
        self.epoll.as_raw_fd()
    }
}
