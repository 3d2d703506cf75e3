//! Batches connections that `PollInStage`/`PollOutStage` have already shut
//! down and takes them off the pipeline's books. The original's
//! `RecycleStage` existed to call `delete` on a raw `Connection*` once
//! every stage was done with it; `Arc<Connection>`'s refcount already
//! does that job here, so this stage's remaining purpose is bookkeeping —
//! confirming no stage still holds the connection and emitting a
//! disposal log line, in batches of `recycle_batch_size` the way the
//! original rate-limited dispose work per wakeup.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::connection::Connection;
use crate::util::block_queue::BlockQueue;

pub struct RecycleStage {
    queue: BlockQueue<Arc<Connection>>,
    batch_size: usize,
    disposed: AtomicU64,
}

impl RecycleStage {
    pub fn new(batch_size: usize) -> Arc<RecycleStage> {
        let stage = Arc::new(RecycleStage {
            queue: BlockQueue::new(),
            batch_size: batch_size.max(1),
            disposed: AtomicU64::new(0),
        });

        let worker = stage.clone();
        std::thread::Builder::new()
            .name("tube-recycle".to_string())
            .spawn(move || worker.run())
            .expect("spawning the recycle worker thread");

        stage
    }

    pub fn add_task(&self, conn: Arc<Connection>) {
        self.queue.push(conn);
    }

    pub fn disposed_count(&self) -> u64 {
        self.disposed.load(Ordering::Relaxed)
    }

    fn run(&self) {
        loop {
            let mut batch = Vec::with_capacity(self.batch_size);
            batch.push(self.queue.pop());
            while batch.len() < self.batch_size {
                match self.queue.try_pop() {
                    Some(conn) => batch.push(conn),
                    None => break,
                }
            }

            for conn in batch {
                self.dispose(conn);
            }
        }
    }

    /// A connection is only truly recyclable once nothing else in the
    /// pipeline still references it; strong_count above 1 (this stage's
    /// own handle) means some other stage raced us and re-added it, so we
    /// simply drop our reference and let that stage carry on.
    fn dispose(&self, conn: Arc<Connection>) {
        if Arc::strong_count(&conn) == 1 {
            log::debug!("connection {} disposed", conn.id);
            self.disposed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};
    use std::time::Duration;

    fn make_connection(id: u64) -> Arc<Connection> {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).unwrap();
        let (server, peer) = listener.accept().unwrap();
        Arc::new(Connection::new(id, server, peer).unwrap())
    }

    #[test]
    fn a_connection_with_no_other_holders_gets_disposed() {
        let stage = RecycleStage::new(4);
        let conn = make_connection(1);
        stage.add_task(conn);

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(stage.disposed_count(), 1);
    }
}
