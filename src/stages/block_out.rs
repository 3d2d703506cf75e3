//! The blocking write-back path: a worker sets the socket back to
//! blocking mode and writes the reply inline instead of going through
//! the poller, trading a worker thread for lower latency on replies that
//! usually fit in one write. Used for small/urgent replies;
//! [`crate::stages::poll_out::PollOutStage`] is the non-blocking
//! alternative for large ones.
//!
//! Its scheduler is created with `suppress_connection_lock = true`
//! because the handler stage hands connections here without ever letting
//! go of its own lock on them first — see the module doc on
//! `crate::scheduler`.

use std::sync::Arc;

use crate::connection::Connection;
use crate::connection::ConnectionInner;
use crate::stage::{Handler, Outcome};
use crate::stages::poll_in::PollInStage;

pub struct BlockOutStage {
    poll_in: Arc<PollInStage>,
}

impl BlockOutStage {
    pub fn new(poll_in: Arc<PollInStage>) -> Arc<BlockOutStage> {
        Arc::new(BlockOutStage { poll_in })
    }
}

impl Handler for BlockOutStage {
    fn process(&self, conn: &Arc<Connection>, inner: &mut ConnectionInner) -> Outcome {
        set_blocking(conn, true);

        let result = inner.out_stream.write_into_output();
        let has_error = result.is_err();
        let wrote_something = matches!(result, Ok(n) if n > 0);

        if !inner.out_stream.is_done() && !has_error && wrote_something {
            // A partial write; give other connections on this scheduler a
            // turn before coming back to finish this one.
            return Outcome::Requeue;
        }

        let _ = conn.clear_cork();

        if conn.is_close_after_finish() || has_error {
            conn.active_close();
        } else {
            set_blocking(conn, false);
            if let Err(e) = self.poll_in.sched_add(conn.clone()) {
                log::warn!("re-arming connection {} for reads failed: {}", conn.id, e);
            }
        }

        Outcome::Release
    }
}

fn set_blocking(conn: &Connection, blocking: bool) {
    // SAFETY: `fd` is the connection's own socket, valid for as long as
    // the connection is; this only flips O_NONBLOCK and never takes
    // ownership of the descriptor.
    use std::os::unix::io::RawFd;
    let fd: RawFd = conn.fd();
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags >= 0 {
            let new_flags = if blocking { flags & !libc::O_NONBLOCK } else { flags | libc::O_NONBLOCK };
            libc::fcntl(fd, libc::F_SETFL, new_flags);
        }
    }
}
