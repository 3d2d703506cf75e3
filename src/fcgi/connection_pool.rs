//! A bounded pool of connections to one upstream FastCGI application,
//! grounded in `connection_pool.h`'s `ConnectionPool`/`UnixConnectionPool`:
//! a free list guarded by a mutex and condvar, capped at `max_connections`
//! total (active + idle) rather than growing without bound under load.

use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

pub struct ConnectionPool {
    address: String,
    max_connections: usize,
    created: AtomicUsize,
    idle: Mutex<Vec<UnixStream>>,
    cond: Condvar,
}

impl ConnectionPool {
    pub fn new(address: impl Into<String>, max_connections: usize) -> ConnectionPool {
        ConnectionPool {
            address: address.into(),
            max_connections,
            created: AtomicUsize::new(0),
            idle: Mutex::new(Vec::new()),
            cond: Condvar::new(),
        }
    }

    /// Hands back an idle connection if one exists, connects a fresh one
    /// if the pool has room, or blocks (up to `timeout`) for one to be
    /// reclaimed otherwise.
    pub fn alloc(&self, timeout: Duration) -> std::io::Result<UnixStream> {
        let mut idle = self.idle.lock().unwrap();

        loop {
            if let Some(stream) = idle.pop() {
                return Ok(stream);
            }

            if self.created.load(Ordering::Relaxed) < self.max_connections {
                self.created.fetch_add(1, Ordering::Relaxed);
                return UnixStream::connect(&self.address);
            }

            let (guard, result) = self.cond.wait_timeout(idle, timeout).unwrap();
            idle = guard;
            if result.timed_out() {
                return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "fastcgi connection pool exhausted"));
            }
        }
    }

    /// Returns a healthy connection to the idle list for reuse.
    pub fn reclaim(&self, stream: UnixStream) {
        self.idle.lock().unwrap().push(stream);
        self.cond.notify_one();
    }

    /// Drops a connection that turned out to be broken, freeing up a slot
    /// for a fresh one without handing a dead socket to the next caller.
    pub fn reclaim_broken(&self) {
        self.created.fetch_sub(1, Ordering::Relaxed);
        self.cond.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;

    #[test]
    fn alloc_reuses_a_reclaimed_connection_without_reconnecting() {
        let dir = std::env::temp_dir().join(format!("tube-fcgi-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("sock");
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).unwrap();

        let pool = ConnectionPool::new(path.to_str().unwrap(), 2);
        let first = pool.alloc(Duration::from_millis(100)).unwrap();
        let _ = listener.accept().unwrap();
        pool.reclaim(first);

        assert_eq!(pool.created.load(Ordering::Relaxed), 1);
        let _second = pool.alloc(Duration::from_millis(100)).unwrap();
        assert_eq!(pool.created.load(Ordering::Relaxed), 1);
    }
}
