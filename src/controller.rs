//! Adaptive thread-pool sizing for a `Stage`. A background thread samples
//! each stage's load roughly every 300ms and, when the trend says adding a
//! worker would help, spawns one more — this is a near-literal port of
//! `core/controller.cc`'s `check_auto_create`, constants included.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::Duration;

const MAX_THREAD_IDLE_MS: u64 = 500;
const CHECK_AUTO_CREATE_MS: u64 = 300;
const MAX_FEEDBACK: usize = 16;
const MIN_FEEDBACK: usize = 8;
const MIN_LOAD: i64 = 15;
const MAX_THREAD: usize = 128;

/// What a `Controller` scales: something that can spin up one more worker
/// thread and report which of its current threads were auto-created.
pub trait AutoScalable: Send + Sync {
    fn start_thread(&self) -> ThreadId;
}

struct State {
    load_history: VecDeque<i64>,
    current_load: i64,
    current_speed: i64,
    best_speed: i64,
    best_threads_size: usize,
    reserve: usize,
    auto_threads: HashSet<ThreadId>,
}

pub struct Controller {
    state: Mutex<State>,
}

impl Controller {
    /// Spawns the background auto-create thread and returns the handle
    /// stages use to report load.
    pub fn spawn(stage: Arc<dyn AutoScalable>) -> Arc<Controller> {
        let controller = Arc::new(Controller {
            state: Mutex::new(State {
                load_history: VecDeque::new(),
                current_load: 0,
                current_speed: 0,
                best_speed: 0,
                best_threads_size: 0,
                reserve: 0,
                auto_threads: HashSet::new(),
            }),
        });

        let bg = controller.clone();
        std::thread::spawn(move || loop {
            std::thread::sleep(Duration::from_millis(CHECK_AUTO_CREATE_MS));
            if bg.check_auto_create() {
                log::info!("server load is high, starting an auto-created worker thread");
                let id = stage.start_thread();
                bg.state.lock().unwrap().auto_threads.insert(id);
            }
        });

        controller
    }

    pub fn is_auto_created(&self, id: ThreadId) -> bool {
        self.state.lock().unwrap().auto_threads.contains(&id)
    }

    pub fn exit_auto_thread(&self, id: ThreadId) {
        self.state.lock().unwrap().auto_threads.remove(&id);
    }

    pub fn increase_load(&self, amount: i64) {
        self.state.lock().unwrap().current_load += amount;
    }

    pub fn decrease_load(&self, amount: i64) {
        let mut state = self.state.lock().unwrap();
        state.current_load -= amount;
        state.current_speed += amount;
    }

    pub fn max_thread_idle(&self) -> Duration {
        Duration::from_millis(MAX_THREAD_IDLE_MS)
    }

    /// Returns true exactly when one more worker thread should be started.
    /// Every guard below short-circuits in the same order as the source:
    /// a cooldown after the last scale-up, a hard cap, not enough samples
    /// yet, a pool already bigger than the best size ever observed, any
    /// recent sample under `MIN_LOAD`, and finally the trend test itself
    /// (older half of the history must not out-load the younger half).
    fn check_auto_create(&self) -> bool {
        let mut state = self.state.lock().unwrap();

        if state.load_history.len() == MAX_FEEDBACK {
            state.load_history.pop_front();
        }
        let current_load = state.current_load;
        state.load_history.push_back(current_load);

        let at_size = state.auto_threads.len();
        let lh_size = state.load_history.len();

        if state.best_speed < state.current_speed {
            state.best_speed = state.current_speed;
            state.best_threads_size = at_size;
        }
        state.current_speed = 0;

        if state.reserve > 0 {
            state.reserve -= 1;
            return false;
        }

        if at_size > MAX_THREAD {
            return false;
        }

        if lh_size < MIN_FEEDBACK {
            return false;
        }

        if state.best_threads_size < at_size {
            return false;
        }

        let mut sum_last = 0i64;
        let mut sum_now = 0i64;

        for (i, &load) in state.load_history.iter().enumerate() {
            if i < lh_size / 2 {
                sum_last += load;
            } else if i >= (lh_size + 1) / 2 {
                if load < MIN_LOAD {
                    return false;
                }
                sum_now += load;
            }
        }

        if sum_last > sum_now {
            return false;
        }

        state.reserve = MAX_FEEDBACK;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_history(loads: &[i64]) -> Controller {
        let controller = Controller {
            state: Mutex::new(State {
                load_history: VecDeque::new(),
                current_load: 0,
                current_speed: 0,
                best_speed: 0,
                best_threads_size: 0,
                reserve: 0,
                auto_threads: HashSet::new(),
            }),
        };

        for &load in loads {
            controller.state.lock().unwrap().current_load = load;
            controller.check_auto_create();
        }

        controller
    }

    #[test]
    fn stays_flat_below_min_feedback_samples() {
        let controller = with_history(&[50, 50, 50]);
        assert_eq!(controller.state.lock().unwrap().load_history.len(), 3);
    }

    #[test]
    fn ramping_load_eventually_scales_up() {
        // Eight samples with the younger half clearly busier than the
        // older half should trip the trend test once feedback and the
        // best-size guard both clear.
        let controller = with_history(&[20, 20, 20, 20, 20, 20, 20]);
        let scaled = {
            let mut state = controller.state.lock().unwrap();
            state.current_load = 200;
            drop(state);
            controller.check_auto_create()
        };
        assert!(scaled);
    }

    #[test]
    fn a_dip_below_min_load_in_the_recent_half_blocks_scale_up() {
        let controller = with_history(&[50, 50, 50, 50, 50, 50, 50]);
        let scaled = {
            let mut state = controller.state.lock().unwrap();
            state.current_load = 1;
            drop(state);
            controller.check_auto_create()
        };
        assert!(!scaled);
    }
}
