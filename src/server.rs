//! The accept loop: binds the listening socket, hands every accepted
//! connection to the pipeline's `poll_in` stage, and assigns each one a
//! monotonically increasing id.

use std::net::TcpListener;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::Result;
use crate::pipeline::Pipeline;

pub struct Server {
    pipeline: Arc<Pipeline>,
    next_id: AtomicU64,
}

impl Server {
    pub fn new(pipeline: Arc<Pipeline>) -> Server {
        Server {
            pipeline,
            next_id: AtomicU64::new(1),
        }
    }

    /// Binds `addr` and runs the accept loop forever on the calling
    /// thread. Every other stage's workers were already spawned by
    /// `Pipeline::build`, so by the time this returns (on an accept error
    /// loop exit aside) the whole pipeline is live.
    pub fn run(&self, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr)?;
        log::info!("listening on {}", addr);

        loop {
            let (socket, address) = match listener.accept() {
                Ok(pair) => pair,
                Err(e) => {
                    log::warn!("accept failed: {}", e);
                    continue;
                }
            };

            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let conn = match self.pipeline.connection_factory.create_connection(id, socket, address) {
                Ok(conn) => Arc::new(conn),
                Err(e) => {
                    log::warn!("failed to initialize connection from {}: {}", address, e);
                    continue;
                }
            };

            log::debug!("accepted connection {} from {}", id, address);
            if let Err(e) = self.pipeline.admit(conn) {
                log::warn!("failed to register connection {} with poll_in: {}", id, e);
            }
        }
    }
}
