//! A client connection: its socket, input/output streams, and the
//! single exclusive lock that exactly one stage worker holds between
//! `pick_task` and releasing it back to a scheduler.

use std::any::Any;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::stream::{InputStream, OutputStream};

const FLAG_CORK_ENABLED: u8 = 0x01;
const FLAG_ACTIVE: u8 = 0x02;
const FLAG_CLOSE_AFTER_FINISH: u8 = 0x04;
const FLAG_URGENT: u8 = 0x08;

/// Mutable per-connection state, reachable only while holding the
/// connection's lock. Input/output buffering, the socket itself, and the
/// continuation slot all live here because the staged pipeline's core
/// invariant — at most one worker touches a connection's buffers at a time
/// — is exactly what a `Mutex` already enforces; there's no separate
/// "locked" flag to get out of sync with reality.
pub struct ConnectionInner {
    pub socket: TcpStream,
    pub in_stream: InputStream,
    pub out_stream: OutputStream,
    pub continuation: Option<Box<dyn Any + Send>>,
}

pub struct Connection {
    pub id: u64,
    fd: RawFd,
    address: SocketAddr,
    last_active: AtomicI64,
    flags: AtomicU8,
    inner: Mutex<ConnectionInner>,
}

impl Connection {
    pub fn new(id: u64, socket: TcpStream, address: SocketAddr) -> io::Result<Connection> {
        socket.set_nonblocking(true)?;
        let fd = socket.as_raw_fd();

        Ok(Connection {
            id,
            fd,
            address,
            last_active: AtomicI64::new(now_secs()),
            flags: AtomicU8::new(FLAG_ACTIVE),
            inner: Mutex::new(ConnectionInner {
                socket,
                in_stream: InputStream::new(fd),
                out_stream: OutputStream::new(fd),
                continuation: None,
            }),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn is_cork_enabled(&self) -> bool {
        self.flag_set(FLAG_CORK_ENABLED)
    }

    pub fn is_active(&self) -> bool {
        self.flag_set(FLAG_ACTIVE)
    }

    pub fn is_close_after_finish(&self) -> bool {
        self.flag_set(FLAG_CLOSE_AFTER_FINISH)
    }

    pub fn is_urgent(&self) -> bool {
        self.flag_set(FLAG_URGENT)
    }

    pub fn set_cork_enabled(&self, val: bool) {
        self.set_flag(FLAG_CORK_ENABLED, val);
    }

    pub fn set_active(&self, val: bool) {
        self.set_flag(FLAG_ACTIVE, val);
    }

    pub fn set_close_after_finish(&self, val: bool) {
        self.set_flag(FLAG_CLOSE_AFTER_FINISH, val);
    }

    pub fn set_urgent(&self, val: bool) {
        self.set_flag(FLAG_URGENT, val);
    }

    fn flag_set(&self, bit: u8) -> bool {
        self.flags.load(Ordering::Relaxed) & bit != 0
    }

    fn set_flag(&self, bit: u8, val: bool) {
        if val {
            self.flags.fetch_or(bit, Ordering::Relaxed);
        } else {
            self.flags.fetch_and(!bit, Ordering::Relaxed);
        }
    }

    pub fn last_active_time(&self) -> i64 {
        self.last_active.load(Ordering::Relaxed)
    }

    /// Refresh the last-active timestamp. Returns `true` if it actually
    /// advanced (matches the original's "don't move the clock backwards"
    /// contract, which keeps a stale epoll wakeup from resetting a
    /// connection's eviction deadline).
    pub fn update_last_active(&self) -> bool {
        let now = now_secs();
        let prev = self.last_active.fetch_max(now, Ordering::Relaxed);
        now > prev
    }

    /// Attempt to acquire the connection's exclusive lock without
    /// blocking. Schedulers use this (never a blocking `lock`) when
    /// scanning for the next runnable connection, so a connection another
    /// stage is mid-processing is skipped rather than stalling the scan.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, ConnectionInner>> {
        self.inner.try_lock().ok()
    }

    /// Blocking lock, used only by a worker that already knows it owns the
    /// connection (e.g. re-entering after a continuation resume).
    pub fn lock(&self) -> MutexGuard<'_, ConnectionInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_io_timeout(&self, timeout: std::time::Duration) -> io::Result<()> {
        let guard = self.lock();
        guard.socket.set_read_timeout(Some(timeout))?;
        guard.socket.set_write_timeout(Some(timeout))
    }

    /// Enables TCP_CORK so small writes accumulate into full frames instead
    /// of going out one syscall at a time.
    pub fn set_cork(&self) -> io::Result<()> {
        set_cork_opt(self.fd, true)?;
        self.set_cork_enabled(true);
        Ok(())
    }

    /// Clears TCP_CORK, flushing whatever the kernel was holding back.
    pub fn clear_cork(&self) -> io::Result<()> {
        set_cork_opt(self.fd, false)?;
        self.set_cork_enabled(false);
        Ok(())
    }

    pub fn active_close(&self) {
        self.set_active(false);
        let guard = self.lock();
        let _ = guard.socket.shutdown(std::net::Shutdown::Both);
    }
}

fn set_cork_opt(fd: RawFd, enable: bool) -> io::Result<()> {
    let val: libc::c_int = if enable { 1 } else { 0 };
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_CORK,
            &val as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };

    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Creates and destroys `Connection` objects for newly accepted sockets.
/// Overridden by servers that need extra per-connection state, the way the
/// original's `HttpConnection` subclassed `Connection`.
pub trait ConnectionFactory: Send + Sync {
    fn create_connection(&self, id: u64, socket: TcpStream, address: SocketAddr) -> io::Result<Connection> {
        Connection::new(id, socket, address)
    }
}

/// The factory used when a server has no per-connection state to attach.
pub struct DefaultConnectionFactory;

impl ConnectionFactory for DefaultConnectionFactory {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};

    fn pair() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, peer) = listener.accept().unwrap();
        (Connection::new(1, server, peer).unwrap(), client)
    }

    #[test]
    fn flags_round_trip() {
        let (conn, _client) = pair();
        assert!(conn.is_active());
        conn.set_urgent(true);
        assert!(conn.is_urgent());
        conn.set_urgent(false);
        assert!(!conn.is_urgent());
    }

    #[test]
    fn try_lock_fails_while_already_locked() {
        let (conn, _client) = pair();
        let _guard = conn.try_lock().unwrap();
        assert!(conn.try_lock().is_none());
    }

    #[test]
    fn update_last_active_only_moves_forward() {
        let (conn, _client) = pair();
        let first = conn.last_active_time();
        assert!(!conn.update_last_active() || conn.last_active_time() >= first);
    }
}
