//! Wires the stages together and hands out the pieces a [`crate::server::Server`]
//! needs. The original's `Pipeline` was a process-wide singleton
//! (`Pipeline::instance()`) that every stage reached for by name; here it's
//! an ordinary `Arc<Pipeline>` built once at startup and threaded through
//! explicitly, so nothing in the crate depends on global mutable state.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Config;
use crate::connection::{Connection, ConnectionFactory, DefaultConnectionFactory};
use crate::scheduler::QueueScheduler;
use crate::stage::Stage;
use crate::stages::block_out::BlockOutStage;
use crate::stages::parser::{EchoHandler, ParserStage, RequestHandler};
use crate::stages::poll_in::PollInStage;
use crate::stages::poll_out::PollOutStage;
use crate::stages::recycle::RecycleStage;

/// The default pipeline: `PollInStage -> ParserStage -> (BlockOutStage |
/// PollOutStage) -> PollInStage/RecycleStage`, matching §2/§9 of the
/// design this crate implements.
pub struct Pipeline {
    pub config: Config,
    pub connection_factory: Arc<dyn ConnectionFactory>,
    pub poll_in: Arc<PollInStage>,
    pub parser: Arc<Stage>,
    pub block_out: Arc<Stage>,
    pub poll_out: Arc<PollOutStage>,
    pub recycle: Arc<RecycleStage>,
    names: HashMap<String, Arc<QueueScheduler>>,
}

impl Pipeline {
    pub fn build(config: Config, handler: Arc<dyn RequestHandler>) -> std::io::Result<Arc<Pipeline>> {
        Pipeline::build_with_factory(config, handler, Arc::new(DefaultConnectionFactory))
    }

    pub fn build_with_factory(
        config: Config,
        handler: Arc<dyn RequestHandler>,
        connection_factory: Arc<dyn ConnectionFactory>,
    ) -> std::io::Result<Arc<Pipeline>> {
        let idle_timeout = config.idle_timeout();
        let recycle = RecycleStage::new(config.recycle_threshold);

        let poll_in_threads = config.thread_pool_size("poll_in");
        let parser_threads = config.thread_pool_size("parser");
        let block_out_threads = config.thread_pool_size("block_out");

        // poll_in needs to hand finished reads to the parser stage's
        // scheduler, so build that scheduler-backed stage first.
        let parser_scheduler = QueueScheduler::new(false);
        let poll_in = PollInStage::new(poll_in_threads, idle_timeout, parser_scheduler.clone(), recycle.clone())?;

        let poll_out = PollOutStage::new(idle_timeout, parser_scheduler.clone(), poll_in.clone())?;
        let block_out = Stage::new("block_out", true, BlockOutStage::new(poll_in.clone()));
        for _ in 0..block_out_threads.max(1) {
            block_out.start_thread();
        }

        let parser_handler = ParserStage::new(handler, block_out.scheduler().clone(), poll_out.clone());
        // Reuses the same scheduler handed to `poll_in` above, so reads
        // that finish on poll_in land directly in this stage's queue.
        let parser = Stage::with_scheduler("parser", parser_scheduler, parser_handler);
        for _ in 0..parser_threads.max(1) {
            parser.start_thread();
        }

        let mut names = HashMap::new();
        names.insert("parser".to_string(), parser.scheduler().clone());
        names.insert("block_out".to_string(), block_out.scheduler().clone());

        let schedulers: Vec<Arc<QueueScheduler>> = names.values().cloned().collect();
        let hook: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
            for sched in &schedulers {
                sched.reschedule();
            }
        });
        parser.set_reschedule_hook(hook.clone());
        block_out.set_reschedule_hook(hook);

        Ok(Arc::new(Pipeline {
            config,
            connection_factory,
            poll_in,
            parser,
            block_out,
            poll_out,
            recycle,
            names,
        }))
    }

    /// Looks up a named stage's scheduler, the way the original's
    /// `Pipeline::find_stage` did by name.
    pub fn scheduler(&self, name: &str) -> crate::error::Result<Arc<QueueScheduler>> {
        self.names.get(name).cloned().ok_or_else(|| crate::error::Error::UnknownStage(name.to_string()))
    }

    /// Wakes every scheduler-backed stage's waiting workers so a connection
    /// another worker just unlocked gets picked up immediately instead of
    /// waiting out the next scan timeout. `parser`/`block_out`'s own worker
    /// loops already call this after every `Outcome::Release`/`Forward`/
    /// `Requeue`; exposed here as well for callers outside a stage's loop
    /// (e.g. a continuation resume) that release a connection's lock.
    pub fn reschedule_all(&self) {
        for sched in self.names.values() {
            sched.reschedule();
        }
    }

    /// Registers a freshly accepted connection with the read side of the
    /// pipeline.
    pub fn admit(&self, conn: Arc<Connection>) -> std::io::Result<()> {
        self.poll_in.sched_add(conn)
    }

    /// Wakes the poller-backed stages' worker threads so they exit their
    /// `wait` loops. Does not wait for them to finish, and doesn't touch
    /// `parser`/`block_out`'s scheduler-backed threads, which exit on their
    /// own once a process shuts down.
    pub fn shutdown(&self) {
        self.poll_in.shutdown();
        self.poll_out.shutdown();
    }
}

/// A pipeline with the identity-echo `ParserStage`, handy for tests and as
/// the `tubed` binary's default.
pub fn default_pipeline(config: Config) -> std::io::Result<Arc<Pipeline>> {
    Pipeline::build(config, Arc::new(EchoHandler))
}
