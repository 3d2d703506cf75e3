//! Bridges a client connection to a FastCGI upstream without tying up a
//! worker thread for the round trip: [`FcgiRequestHandler`] sends the
//! request and immediately suspends the client connection's continuation
//! (see [`crate::continuation`]), then hands the upstream socket to this
//! stage's own poller. Once the upstream's reply is fully read, the
//! continuation is resumed, the reply copied into the client's
//! `out_stream`, and the connection forwarded to a write-back scheduler —
//! the `kCompletionReadFcgi` / `kCompletionHeadersDone` /
//! `kCompletionContinue` states `fcgi_completion_stage.h` names collapse
//! into "still reading" vs "done" here since this core's `ParserStage`
//! doesn't parse CGI response headers out of the body.

use std::collections::HashMap;
use std::io::Read;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::connection::Connection;
use crate::fcgi::connection_pool::ConnectionPool;
use crate::fcgi::proto::{self, ResponseReader};
use crate::poller::{EpollOpt, Poller, Ready};
use crate::scheduler::QueueScheduler;
use crate::stages::parser::RequestHandler;

const MAX_EVENTS: usize = 128;
const WAIT_TIMEOUT: Duration = Duration::from_millis(500);
const POOL_ALLOC_TIMEOUT: Duration = Duration::from_millis(200);

/// Marker stored in the client connection's continuation slot while its
/// upstream reply is in flight. Carries nothing itself — `FcgiCompletionStage`
/// keeps the actual read state in its own registry, keyed by the upstream
/// fd — but its presence is what lets other stages (see
/// `crate::stages::poll_out`) tell a suspended connection apart from one
/// that's simply idle.
pub struct FcgiPending;

struct Pending {
    conn: Arc<Connection>,
    upstream: UnixStream,
    reader: ResponseReader,
}

pub struct FcgiCompletionStage {
    poller: Arc<Poller>,
    registry: Mutex<HashMap<RawFd, Pending>>,
    write_back: Arc<QueueScheduler>,
}

impl FcgiCompletionStage {
    pub fn new(write_back: Arc<QueueScheduler>) -> std::io::Result<Arc<FcgiCompletionStage>> {
        let stage = Arc::new(FcgiCompletionStage {
            poller: Arc::new(Poller::new(MAX_EVENTS, Duration::from_secs(30))?),
            registry: Mutex::new(HashMap::new()),
            write_back,
        });

        let worker = stage.clone();
        std::thread::Builder::new()
            .name("tube-fcgi_completion".to_string())
            .spawn(move || worker.run())
            .expect("spawning the fcgi completion worker thread");

        Ok(stage)
    }

    /// Registers `upstream` for readability and takes ownership of
    /// reading its reply on behalf of `conn`. The caller must have
    /// already suspended `conn`'s continuation with `FcgiPending` and
    /// released its lock before calling this.
    fn begin(&self, conn: Arc<Connection>, upstream: UnixStream, reader: ResponseReader) -> std::io::Result<()> {
        upstream.set_nonblocking(true)?;
        let fd = upstream.as_raw_fd();
        self.poller.register(&fd, Ready::readable() | Ready::hup() | Ready::error(), EpollOpt::level())?;
        self.registry.lock().unwrap().insert(fd, Pending { conn, upstream, reader });
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
                    log::error!("fcgi completion poller wait failed: {}", e);
                    continue;
                }
            };

            if result.woken && self.poller.is_shutdown() {
                return;
            }

            for (fd, ready) in result.ready {
                self.handle_event(fd, ready);
            }
        }
    }

    fn handle_event(&self, fd: RawFd, ready: Ready) {
        let mut pending = match self.registry.lock().unwrap().remove(&fd) {
            Some(p) => p,
            None => return,
        };

        if ready.is_hup() || ready.is_error() {
            let _ = self.poller.deregister(&fd);
            pending.conn.active_close();
            return;
        }

        let mut buf = [0u8; 16 * 1024];
        loop {
            match pending.upstream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(e) = pending.reader.feed(&buf[..n]) {
                        log::warn!("malformed fastcgi response: {}", e);
                        let _ = self.poller.deregister(&fd);
                        pending.conn.active_close();
                        return;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }

        if !pending.reader.is_done() {
            self.registry.lock().unwrap().insert(fd, pending);
            return;
        }

        let _ = self.poller.deregister(&fd);
        let conn = pending.conn.clone();
        let mut guard = conn.lock();
        let _ = crate::continuation::resume::<FcgiPending>(&mut guard);
        guard.out_stream.append_data(pending.reader.body());
        drop(guard);

        self.write_back.add_task(conn);
    }
}

/// Forwards the client's buffered input to a FastCGI upstream as the
/// request body of a single `Responder` request, then suspends the
/// connection until `FcgiCompletionStage` has the full reply.
pub struct FcgiRequestHandler {
    pool: Arc<ConnectionPool>,
    completion: Arc<FcgiCompletionStage>,
    script_name: String,
}

impl FcgiRequestHandler {
    pub fn new(pool: Arc<ConnectionPool>, completion: Arc<FcgiCompletionStage>, script_name: impl Into<String>) -> Arc<FcgiRequestHandler> {
        Arc::new(FcgiRequestHandler {
            pool,
            completion,
            script_name: script_name.into(),
        })
    }
}

impl RequestHandler for FcgiRequestHandler {
    fn handle(&self, conn: &Arc<Connection>, inner: &mut crate::connection::ConnectionInner) {
        let pending = inner.in_stream.buffer().len();
        let mut body = vec![0u8; pending];
        inner.in_stream.buffer().copy_front(&mut body);
        inner.in_stream.buffer_mut().pop(pending);

        let upstream = match self.pool.alloc(POOL_ALLOC_TIMEOUT) {
            Ok(s) => s,
            Err(e) => {
                log::warn!("fastcgi upstream unavailable: {}", e);
                inner.out_stream.append_data(b"502 upstream unavailable");
                return;
            }
        };

        let request_id: u16 = 1;
        let params = vec![
            ("SCRIPT_NAME".to_string(), self.script_name.clone()),
            ("CONTENT_LENGTH".to_string(), body.len().to_string()),
        ];

        let mut request = proto::begin_request(request_id, proto::ROLE_RESPONDER, false);
        request.extend_from_slice(&proto::params_stream(request_id, &params));
        request.extend_from_slice(&proto::stdin_stream(request_id, &body));

        use std::io::Write;
        let mut upstream = upstream;
        if let Err(e) = upstream.write_all(&request) {
            log::warn!("writing fastcgi request failed: {}", e);
            self.pool.reclaim_broken();
            inner.out_stream.append_data(b"502 upstream write failed");
            return;
        }

        crate::continuation::suspend(inner, FcgiPending);
        if let Err(e) = self.completion.begin(conn.clone(), upstream, ResponseReader::new()) {
            log::warn!("registering fastcgi upstream for readability failed: {}", e);
            let _ = crate::continuation::resume::<FcgiPending>(inner);
            inner.out_stream.append_data(b"502 upstream registration failed");
        }
    }
}
