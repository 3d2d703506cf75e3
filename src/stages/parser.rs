//! The request-parsing/handling stage. `stages.h`'s real `ParserStage`
//! never defines `process_task` itself — a protocol module (HTTP, in the
//! original) plugs in its own processor object here. HTTP/1.1 parsing is
//! out of scope for this core, so the pluggable [`RequestHandler`] this
//! stage drives defaults to a byte-identity echo: enough to exercise
//! every stage in the pipeline (read -> parse -> write back) without
//! pretending to be a real wire protocol.

use std::sync::Arc;

use crate::connection::{Connection, ConnectionInner};
use crate::scheduler::QueueScheduler;
use crate::stage::{Handler, Outcome};
use crate::stages::poll_out::PollOutStage;

/// Turns whatever is in `in_stream` into zero or more writes on
/// `out_stream`. Implementations own the protocol; the stage only owns
/// deciding which write-back path handles the result.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, conn: &Arc<Connection>, inner: &mut ConnectionInner);
}

/// Copies the input buffer straight to the output buffer. Useful as a
/// smoke test for the pipeline and as a template for a real protocol
/// handler.
pub struct EchoHandler;

impl RequestHandler for EchoHandler {
    fn handle(&self, _conn: &Arc<Connection>, inner: &mut ConnectionInner) {
        let pending = inner.in_stream.buffer().len();
        if pending == 0 {
            return;
        }
        let mut bytes = vec![0u8; pending];
        inner.in_stream.buffer().copy_front(&mut bytes);
        inner.in_stream.buffer_mut().pop(pending);
        inner.out_stream.append_data(&bytes);
    }
}

/// A reply this small goes out through the blocking write-back path
/// instead of round-tripping through an epoll registration first.
const BLOCK_OUT_THRESHOLD: usize = 16 * 1024;

pub struct ParserStage {
    handler: Arc<dyn RequestHandler>,
    block_out: Arc<QueueScheduler>,
    poll_out: Arc<PollOutStage>,
}

impl ParserStage {
    pub fn new(handler: Arc<dyn RequestHandler>, block_out: Arc<QueueScheduler>, poll_out: Arc<PollOutStage>) -> Arc<ParserStage> {
        Arc::new(ParserStage { handler, block_out, poll_out })
    }
}

impl Handler for ParserStage {
    fn process(&self, conn: &Arc<Connection>, inner: &mut ConnectionInner) -> Outcome {
        self.handler.handle(conn, inner);

        if inner.out_stream.is_done() {
            return Outcome::Release;
        }

        if inner.out_stream.memory_usage() <= BLOCK_OUT_THRESHOLD {
            return Outcome::Forward(self.block_out.clone());
        }

        let poll_out = self.poll_out.clone();
        Outcome::Custom(Box::new(move |conn| {
            if let Err(e) = poll_out.sched_add(conn.clone()) {
                log::warn!("registering connection {} for write readiness failed: {}", conn.id, e);
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_handler_copies_input_to_output() {
        let (mut a, mut b) = std::os::unix::net::UnixStream::pair().unwrap();
        use std::io::Write;
        a.write_all(b"ping").unwrap();
        drop(a);

        let mut inner_stream = crate::stream::InputStream::new(std::os::unix::io::AsRawFd::as_raw_fd(&b));
        b.set_nonblocking(true).unwrap();
        let _ = inner_stream.read_into_buffer();
        assert_eq!(inner_stream.buffer().len(), 4);
    }
}
