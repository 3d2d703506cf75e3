//! Watches idle sockets for readability and idle-timeout expiry. Unlike
//! the other stages this one never goes through a [`QueueScheduler`] — a
//! connection handed to `sched_add` is registered directly on a `Poller`
//! and only leaves that registration once it's readable, errored, or
//! timed out, matching `PollInStage::sched_add` overriding the base
//! `Stage` entirely instead of using a scheduler.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::connection::Connection;
use crate::poller::{EpollOpt, Poller, Ready};
use crate::scheduler::QueueScheduler;
use crate::stages::recycle::RecycleStage;

const MAX_EVENTS: usize = 256;
const WAIT_TIMEOUT: Duration = Duration::from_millis(500);

struct Worker {
    poller: Arc<Poller>,
    registry: Mutex<HashMap<RawFd, Arc<Connection>>>,
}

/// Round-robins newly accepted (or re-armed) connections across a small
/// pool of poller threads so one epoll instance doesn't have to carry
/// every live connection alone.
pub struct PollInStage {
    workers: Vec<Arc<Worker>>,
    next: AtomicUsize,
    parser: Arc<QueueScheduler>,
    recycle: Arc<RecycleStage>,
}

impl PollInStage {
    pub fn new(
        thread_count: usize,
        idle_timeout: Duration,
        parser: Arc<QueueScheduler>,
        recycle: Arc<RecycleStage>,
    ) -> std::io::Result<Arc<PollInStage>> {
        let mut workers = Vec::with_capacity(thread_count.max(1));
        for _ in 0..thread_count.max(1) {
            workers.push(Arc::new(Worker {
                poller: Arc::new(Poller::new(MAX_EVENTS, idle_timeout)?),
                registry: Mutex::new(HashMap::new()),
            }));
        }

        let stage = Arc::new(PollInStage {
            workers,
            next: AtomicUsize::new(0),
            parser,
            recycle,
        });

        for worker in stage.workers.clone() {
            let stage = stage.clone();
            std::thread::Builder::new()
                .name("tube-poll_in".to_string())
                .spawn(move || stage.run(worker))
                .expect("spawning a poll_in worker thread");
        }

        Ok(stage)
    }

    /// Registers `conn` for read/hup/error readiness on the next worker in
    /// the rotation and arms its idle timer.
    pub fn sched_add(&self, conn: Arc<Connection>) -> std::io::Result<()> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        let worker = &self.workers[idx];

        worker.poller.touch(conn.id);
        worker.poller.register(
            &conn.fd(),
            Ready::readable() | Ready::hup() | Ready::error(),
            EpollOpt::level(),
        )?;
        worker.registry.lock().unwrap().insert(conn.fd(), conn);
        Ok(())
    }

    /// Deregisters every connection this stage is watching and wakes its
    /// worker threads so they exit instead of blocking in `wait` forever.
    pub fn shutdown(&self) {
        for worker in &self.workers {
            let _ = worker.poller.shutdown();
        }
    }

    fn run(&self, worker: Arc<Worker>) {
        loop {
            let result = match worker.poller.wait(Some(WAIT_TIMEOUT)) {
                Ok(r) => r,
                Err(e) => {
                    log::error!("poll_in wait failed: {}", e);
                    continue;
                }
            };

            if result.woken && worker.poller.is_shutdown() {
                return;
            }

            for (fd, ready) in result.ready {
                self.handle_event(&worker, fd, ready);
            }

            for id in result.expired {
                self.expire(&worker, id);
            }
        }
    }

    fn handle_event(&self, worker: &Worker, fd: RawFd, ready: Ready) {
        let conn = match worker.registry.lock().unwrap().remove(&fd) {
            Some(c) => c,
            None => return,
        };

        let _ = worker.poller.deregister(&fd);
        worker.poller.forget(conn.id);

        if ready.is_hup() || ready.is_error() {
            self.cleanup(&conn);
            return;
        }

        let locked_elsewhere = {
            let guard = conn.try_lock();
            guard.is_none()
        };
        if locked_elsewhere {
            // Someone else is already handling this connection; put
            // the registration back so it isn't silently dropped.
            let _ = worker.poller.register(&fd, Ready::readable() | Ready::hup() | Ready::error(), EpollOpt::level());
            worker.poller.touch(conn.id);
            worker.registry.lock().unwrap().insert(fd, conn);
            return;
        }

        conn.update_last_active();

        let mut had_error = false;
        loop {
            let mut guard = conn.lock();
            match guard.in_stream.read_into_buffer() {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => {
                    had_error = true;
                    break;
                }
            }
        }

        if had_error {
            self.cleanup(&conn);
        } else {
            self.parser.add_task(conn);
        }
    }

    fn expire(&self, worker: &Worker, id: u64) {
        let fd = match worker
            .registry
            .lock()
            .unwrap()
            .iter()
            .find(|(_, c)| c.id == id)
            .map(|(fd, _)| *fd)
        {
            Some(fd) => fd,
            None => return,
        };

        if let Some(conn) = worker.registry.lock().unwrap().remove(&fd) {
            if conn.try_lock().is_some() {
                let _ = worker.poller.deregister(&fd);
                self.cleanup(&conn);
            } else {
                worker.registry.lock().unwrap().insert(fd, conn);
            }
        }
    }

    fn cleanup(&self, conn: &Arc<Connection>) {
        conn.active_close();
        self.recycle.add_task(conn.clone());
    }
}
