//! Hands connections from one stage to the next. A connection can be
//! enqueued in at most one scheduler at a time; picking it either requires
//! acquiring its lock first (the default — a worker must own a connection
//! before touching its buffers) or trusts that the caller already holds it
//! (`suppress_connection_lock`, used when a stage hands a connection
//! straight to the next one without ever releasing the lock in between,
//! e.g. `HandlerStage` → `BlockOutStage`).

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use slab::Slab;

use crate::connection::Connection;

struct Node {
    conn: Arc<Connection>,
    prev: Option<usize>,
    next: Option<usize>,
}

struct ListState {
    nodes: Slab<Node>,
    by_fd: HashMap<RawFd, usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl ListState {
    fn new() -> ListState {
        ListState {
            nodes: Slab::new(),
            by_fd: HashMap::new(),
            head: None,
            tail: None,
        }
    }

    fn len(&self) -> usize {
        self.nodes.len()
    }

    fn push_back(&mut self, conn: Arc<Connection>) {
        let fd = conn.fd();

        // Re-enqueuing an fd already present collapses into one entry
        // moved to the tail, instead of letting duplicate epoll
        // notifications for the same connection pile up unboundedly in
        // the queue.
        if let Some(&key) = self.by_fd.get(&fd) {
            self.unlink(key);
            self.link_tail(key);
            return;
        }

        let key = self.nodes.insert(Node { conn, prev: None, next: None });
        self.by_fd.insert(fd, key);
        self.link_tail(key);
    }

    fn link_tail(&mut self, key: usize) {
        self.nodes[key].prev = self.tail;
        self.nodes[key].next = None;

        if let Some(tail) = self.tail {
            self.nodes[tail].next = Some(key);
        } else {
            self.head = Some(key);
        }

        self.tail = Some(key);
    }

    fn unlink(&mut self, key: usize) {
        let (prev, next) = (self.nodes[key].prev, self.nodes[key].next);

        match prev {
            Some(p) => self.nodes[p].next = next,
            None => self.head = next,
        }

        match next {
            Some(n) => self.nodes[n].prev = prev,
            None => self.tail = prev,
        }
    }

    fn remove(&mut self, key: usize) -> Arc<Connection> {
        self.unlink(key);
        let node = self.nodes.remove(key);
        self.by_fd.remove(&node.conn.fd());
        node.conn
    }

    fn remove_by_fd(&mut self, fd: RawFd) -> Option<Arc<Connection>> {
        let key = self.by_fd.get(&fd).copied()?;
        Some(self.remove(key))
    }
}

pub struct QueueScheduler {
    state: Mutex<ListState>,
    cond: Condvar,
    suppress_connection_lock: bool,
}

/// Outcome of `pick_task`: a schedulable connection, or a signal that there
/// was nothing to schedule and the calling worker thread should consider
/// exiting. When locking wasn't suppressed, the connection's lock is known
/// to be free at the instant it's returned — the caller's immediate
/// `conn.lock()` is a formality, not a real wait, because nothing else in
/// the pipeline acquires a connection's lock outside of a `pick_task` that
/// already removed it from every scheduler queue first.
pub enum Picked {
    Connection(Arc<Connection>),
    Nothing,
}

impl QueueScheduler {
    pub fn new(suppress_connection_lock: bool) -> Arc<QueueScheduler> {
        Arc::new(QueueScheduler {
            state: Mutex::new(ListState::new()),
            cond: Condvar::new(),
            suppress_connection_lock,
        })
    }

    pub fn add_task(&self, conn: Arc<Connection>) {
        let mut state = self.state.lock().unwrap();
        state.push_back(conn);
        drop(state);
        self.cond.notify_one();
    }

    pub fn remove_task(&self, fd: RawFd) {
        let mut state = self.state.lock().unwrap();
        state.remove_by_fd(fd);
    }

    pub fn reschedule(&self) {
        self.cond.notify_all();
    }

    pub fn size_nolock(&self) -> usize {
        self.state.lock().unwrap().len()
    }

    /// Blocks (up to `wait_timeout`) until either a connection becomes
    /// schedulable or the scheduler has genuinely been empty the whole
    /// time, in which case it returns `Picked::Nothing`.
    pub fn pick_task(&self, wait_timeout: Duration) -> Picked {
        if self.suppress_connection_lock {
            return self.pick_task_nolock();
        }

        self.pick_task_lock(wait_timeout)
    }

    fn pick_task_nolock(&self) -> Picked {
        let mut state = self.state.lock().unwrap();

        match state.head {
            Some(key) => Picked::Connection(state.remove(key)),
            None => Picked::Nothing,
        }
    }

    fn pick_task_lock(&self, wait_timeout: Duration) -> Picked {
        let mut state = self.state.lock().unwrap();

        loop {
            let mut cursor = state.head;

            while let Some(key) = cursor {
                let conn = state.nodes[key].conn.clone();

                if conn.try_lock().is_some() {
                    state.remove(key);
                    return Picked::Connection(conn);
                }

                cursor = state.nodes[key].next;
            }

            if state.is_empty_hint() {
                return Picked::Nothing;
            }

            let (guard, timeout_result) = self.cond.wait_timeout(state, wait_timeout).unwrap();
            state = guard;

            if timeout_result.timed_out() && state.head.is_none() {
                return Picked::Nothing;
            }
        }
    }
}

impl ListState {
    fn is_empty_hint(&self) -> bool {
        self.head.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};

    fn make_connection(id: u64) -> Arc<Connection> {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, peer) = listener.accept().unwrap();
        Arc::new(Connection::new(id, server, peer).unwrap())
    }

    #[test]
    fn picks_in_fifo_order() {
        let sched = QueueScheduler::new(false);
        let a = make_connection(1);
        let b = make_connection(2);
        sched.add_task(a.clone());
        sched.add_task(b.clone());

        match sched.pick_task(Duration::from_millis(10)) {
            Picked::Connection(c) => assert_eq!(c.id, a.id),
            Picked::Nothing => panic!("expected a connection"),
        }
        match sched.pick_task(Duration::from_millis(10)) {
            Picked::Connection(c) => assert_eq!(c.id, b.id),
            Picked::Nothing => panic!("expected a connection"),
        }
    }

    #[test]
    fn re_adding_an_enqueued_fd_collapses_to_one_entry_at_the_tail() {
        let sched = QueueScheduler::new(false);
        let a = make_connection(1);
        let b = make_connection(2);

        sched.add_task(a.clone());
        sched.add_task(b.clone());
        sched.add_task(a.clone());

        assert_eq!(sched.size_nolock(), 2);
        match sched.pick_task(Duration::from_millis(10)) {
            Picked::Connection(c) => assert_eq!(c.id, b.id),
            Picked::Nothing => panic!("expected a connection"),
        }
    }

    #[test]
    fn pick_skips_a_connection_locked_by_another_holder() {
        let sched = QueueScheduler::new(false);
        let a = make_connection(1);
        let b = make_connection(2);

        let _held = a.try_lock().unwrap();
        sched.add_task(a.clone());
        sched.add_task(b.clone());

        match sched.pick_task(Duration::from_millis(50)) {
            Picked::Connection(c) => assert_eq!(c.id, b.id),
            Picked::Nothing => panic!("expected a connection"),
        }
    }

    #[test]
    fn pick_on_empty_scheduler_returns_nothing_without_blocking_forever() {
        let sched = QueueScheduler::new(false);
        match sched.pick_task(Duration::from_millis(10)) {
            Picked::Nothing => {}
            Picked::Connection(_) => panic!("expected nothing"),
        }
    }
}
