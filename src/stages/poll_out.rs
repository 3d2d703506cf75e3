//! The non-blocking write-back path: registers a connection for
//! writability and drains its `OutputStream` a little at a time as the
//! socket accepts bytes, instead of blocking a worker thread on a slow
//! client the way [`crate::stages::block_out::BlockOutStage`] does.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::connection::Connection;
use crate::continuation;
use crate::poller::{EpollOpt, Poller, Ready};
use crate::scheduler::QueueScheduler;
use crate::stages::poll_in::PollInStage;

const MAX_EVENTS: usize = 256;
const WAIT_TIMEOUT: Duration = Duration::from_millis(500);

pub struct PollOutStage {
    poller: Arc<Poller>,
    registry: Mutex<HashMap<RawFd, Arc<Connection>>>,
    handler_sched: Arc<QueueScheduler>,
    poll_in: Arc<PollInStage>,
}

impl PollOutStage {
    pub fn new(idle_timeout: Duration, handler_sched: Arc<QueueScheduler>, poll_in: Arc<PollInStage>) -> std::io::Result<Arc<PollOutStage>> {
        let stage = Arc::new(PollOutStage {
            poller: Arc::new(Poller::new(MAX_EVENTS, idle_timeout)?),
            registry: Mutex::new(HashMap::new()),
            handler_sched,
            poll_in,
        });

        let worker = stage.clone();
        std::thread::Builder::new()
            .name("tube-poll_out".to_string())
            .spawn(move || worker.run())
            .expect("spawning the poll_out worker thread");

        Ok(stage)
    }

    /// Called with the connection already locked by the caller (normally
    /// the parser/handler stage, right after it decided the reply won't
    /// fit in one non-blocking write). The caller must drop its guard
    /// before this returns, since the poller thread will try to lock the
    /// connection as soon as it becomes writable.
    pub fn sched_add(&self, conn: Arc<Connection>) -> std::io::Result<()> {
        conn.set_cork().ok();
        conn.update_last_active();
        self.poller.touch(conn.id);
        self.poller.register(
            &conn.fd(),
            Ready::writable() | Ready::hup() | Ready::error(),
            EpollOpt::level(),
        )?;
        self.registry.lock().unwrap().insert(conn.fd(), conn);
        Ok(())
    }

    /// Wakes the worker thread so it exits instead of blocking in `wait`
    /// forever.
    pub fn shutdown(&self) {
        let _ = self.poller.shutdown();
    }

    fn run(&self) {
        loop {
            let result = match self.poller.wait(Some(WAIT_TIMEOUT)) {
                Ok(r) => r,
                Err(e) => {
                    log::error!("poll_out wait failed: {}", e);
                    continue;
                }
            };

            if result.woken && self.poller.is_shutdown() {
                return;
            }

            for (fd, ready) in result.ready {
                self.handle_event(fd, ready);
            }

            for id in result.expired {
                self.expire(id);
            }
        }
    }

    fn handle_event(&self, fd: RawFd, ready: Ready) {
        let conn = match self.registry.lock().unwrap().remove(&fd) {
            Some(c) => c,
            None => return,
        };
        let _ = self.poller.deregister(&fd);
        self.poller.forget(conn.id);

        let mut guard = conn.lock();

        if ready.is_hup() || ready.is_error() {
            let _ = conn.clear_cork();
            drop(guard);
            conn.active_close();
            return;
        }

        conn.update_last_active();

        let mut had_error = false;
        loop {
            match guard.out_stream.write_into_output() {
                Ok(0) => break,
                Ok(_) if guard.out_stream.is_done() => break,
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => {
                    had_error = true;
                    break;
                }
            }
        }

        if !guard.out_stream.is_done() && !had_error {
            // Still more to write; stay registered for writability.
            drop(guard);
            let _ = self.poller.register(&fd, Ready::writable() | Ready::hup() | Ready::error(), EpollOpt::level());
            self.poller.touch(conn.id);
            self.registry.lock().unwrap().insert(fd, conn);
            return;
        }

        let _ = conn.clear_cork();

        if continuation::has_continuation(&guard) {
            drop(guard);
            self.handler_sched.add_task(conn);
            return;
        }

        let close = conn.is_close_after_finish() || had_error || !conn.is_active();
        drop(guard);

        if close {
            conn.active_close();
        } else if let Err(e) = self.poll_in.sched_add(conn.clone()) {
            log::warn!("re-arming connection {} for reads failed: {}", conn.id, e);
        }
    }

    fn expire(&self, id: u64) {
        let fd = match self
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

        if let Some(conn) = self.registry.lock().unwrap().remove(&fd) {
            let _ = self.poller.deregister(&fd);
            let _ = conn.clear_cork();
            conn.active_close();
        }
    }
}
