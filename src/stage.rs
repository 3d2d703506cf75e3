//! A stage is a named worker pool pulling connections off its own
//! [`QueueScheduler`] and running a [`Handler`] against each one.
//!
//! One divergence from the original core worth calling out: `Mutex`'s
//! guard type in the standard library is `!Send`, so a connection's lock
//! can never literally cross a thread boundary the way the original's
//! `BlockOutStage` hand-off kept it held across a direct call into the
//! next stage from a different worker thread. Here, forwarding a
//! connection to another stage always releases the lock first and lets
//! that stage's own `pick_task` re-acquire it — see `Outcome::Forward`.
//! `Requeue`/`Release` behave exactly as in the original.

use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

use crate::connection::{Connection, ConnectionInner};
use crate::controller::{AutoScalable, Controller};
use crate::scheduler::{Picked, QueueScheduler};

/// What a stage should do with a connection once its handler returns.
pub enum Outcome {
    /// Release the lock and hand the connection to another stage's
    /// scheduler.
    Forward(Arc<QueueScheduler>),
    /// Release the lock and re-enqueue on this same stage (there's
    /// immediately more to do, e.g. a short read that didn't drain the
    /// socket).
    Requeue,
    /// Release the lock and do nothing further; some other event (a
    /// `PollInStage` readability notification, a continuation resume)
    /// will re-add the connection later.
    Release,
    /// Release the lock, then hand the connection to an arbitrary
    /// next step that isn't a bare `QueueScheduler` — `PollOutStage`,
    /// for instance, registers the fd on an epoll instance rather than
    /// pushing onto a FIFO.
    Custom(Box<dyn FnOnce(Arc<Connection>) + Send>),
}

pub trait Handler: Send + Sync {
    fn process(&self, conn: &Arc<Connection>, inner: &mut ConnectionInner) -> Outcome;
}

const PICK_WAIT: Duration = Duration::from_millis(200);

pub struct Stage {
    pub name: String,
    scheduler: Arc<QueueScheduler>,
    handler: Arc<dyn Handler>,
    controller: Arc<Controller>,
    thread_count: std::sync::atomic::AtomicUsize,
    reschedule_hook: std::sync::Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
}

impl Stage {
    /// Builds a stage with its own fresh scheduler.
    pub fn new(name: impl Into<String>, suppress_connection_lock: bool, handler: Arc<dyn Handler>) -> Arc<Stage> {
        Stage::with_scheduler(name, QueueScheduler::new(suppress_connection_lock), handler)
    }

    /// Builds a stage that shares `scheduler` with whatever already holds
    /// a handle to it — used when another stage needs to hand connections
    /// straight into this one by name.
    pub fn with_scheduler(name: impl Into<String>, scheduler: Arc<QueueScheduler>, handler: Arc<dyn Handler>) -> Arc<Stage> {
        Arc::new_cyclic(|weak: &std::sync::Weak<Stage>| {
            let autoscale: Arc<dyn AutoScalable> = Arc::new(WeakStage(weak.clone()));
            Stage {
                name: name.into(),
                scheduler,
                handler,
                controller: Controller::spawn(autoscale),
                thread_count: std::sync::atomic::AtomicUsize::new(0),
                reschedule_hook: std::sync::Mutex::new(None),
            }
        })
    }

    pub fn scheduler(&self) -> &Arc<QueueScheduler> {
        &self.scheduler
    }

    /// Installs the pipeline-wide `reschedule_all` callback this stage's
    /// worker loop runs after releasing a connection's lock, so a worker
    /// blocked in another stage's `pick_task` because it found this
    /// connection locked gets woken up immediately instead of waiting out
    /// `PICK_WAIT`. Set once by `Pipeline::build` after every stage exists.
    pub fn set_reschedule_hook(&self, hook: Arc<dyn Fn() + Send + Sync>) {
        *self.reschedule_hook.lock().unwrap() = Some(hook);
    }

    fn reschedule_all(&self) {
        if let Some(hook) = self.reschedule_hook.lock().unwrap().as_ref() {
            hook();
        }
    }

    pub fn sched_add(&self, conn: Arc<Connection>) {
        self.scheduler.add_task(conn);
    }

    /// Spawns one worker thread running `main_loop`, returning its id so
    /// the controller can track it as auto-created.
    pub fn start_thread(self: &Arc<Self>) -> ThreadId {
        let stage = self.clone();
        let handle = std::thread::Builder::new()
            .name(format!("tube-{}", self.name))
            .spawn(move || stage.main_loop())
            .expect("spawning a stage worker thread");

        self.thread_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        handle.thread().id()
    }

    fn main_loop(self: Arc<Self>) {
        let id = std::thread::current().id();

        loop {
            match self.scheduler.pick_task(PICK_WAIT) {
                Picked::Nothing => {
                    // Auto-created threads shrink the pool back down once
                    // there's nothing left to do; the handful of threads
                    // started at initialization keep polling forever so a
                    // stage never drops to zero workers.
                    if self.controller.is_auto_created(id) {
                        self.controller.exit_auto_thread(id);
                        self.thread_count.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
                        break;
                    }
                }
                Picked::Connection(conn) => {
                    self.controller.increase_load(1);
                    let outcome = {
                        let mut guard = conn.lock();
                        self.handler.process(&conn, &mut guard)
                    };
                    self.controller.decrease_load(1);

                    match outcome {
                        Outcome::Forward(next) => {
                            next.add_task(conn);
                            self.reschedule_all();
                        }
                        Outcome::Requeue => {
                            self.scheduler.add_task(conn);
                            self.reschedule_all();
                        }
                        Outcome::Release => {
                            self.reschedule_all();
                        }
                        Outcome::Custom(f) => f(conn),
                    }
                }
            }
        }
    }
}

struct WeakStage(std::sync::Weak<Stage>);

impl AutoScalable for WeakStage {
    fn start_thread(&self) -> ThreadId {
        match self.0.upgrade() {
            Some(stage) => stage.start_thread(),
            None => std::thread::current().id(),
        }
    }
}
