//! A FIFO queue a thread can block on until something is pushed. Used by
//! [`crate::stages::recycle::RecycleStage`] for the batch of evicted
//! connections and by the FastCGI connection pool for its free list.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

struct Inner<T> {
    queue: Mutex<VecDeque<T>>,
    condvar: Condvar,
}

pub struct BlockQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for BlockQueue<T> {
    fn clone(&self) -> BlockQueue<T> {
        BlockQueue { inner: self.inner.clone() }
    }
}

impl<T: Send> BlockQueue<T> {
    pub fn new() -> BlockQueue<T> {
        BlockQueue {
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::new()),
                condvar: Condvar::new(),
            }),
        }
    }

    pub fn push(&self, value: T) {
        let mut queue = self.inner.queue.lock().unwrap();
        queue.push_back(value);
        self.inner.condvar.notify_one();
    }

    pub fn pop(&self) -> T {
        let mut queue = self.inner.queue.lock().unwrap();
        loop {
            if let Some(elem) = queue.pop_front() {
                return elem;
            }
            queue = self.inner.condvar.wait(queue).unwrap();
        }
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let mut queue = self.inner.queue.lock().unwrap();
        loop {
            if let Some(elem) = queue.pop_front() {
                return Some(elem);
            }
            let (guard, result) = self.inner.condvar.wait_timeout(queue, timeout).unwrap();
            queue = guard;
            if result.timed_out() {
                return queue.pop_front();
            }
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        self.inner.queue.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Send> Default for BlockQueue<T> {
    fn default() -> BlockQueue<T> {
        BlockQueue::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_then_pop_returns_fifo_order() {
        let q: BlockQueue<i32> = BlockQueue::new();
        q.push(1);
        q.push(2);
        assert_eq!(q.pop(), 1);
        assert_eq!(q.pop(), 2);
    }

    #[test]
    fn pop_timeout_returns_none_when_empty() {
        let q: BlockQueue<i32> = BlockQueue::new();
        assert!(q.pop_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn a_blocked_pop_wakes_up_once_something_is_pushed() {
        let q: BlockQueue<i32> = BlockQueue::new();
        let producer = q.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.push(42);
        });
        assert_eq!(q.pop(), 42);
        handle.join().unwrap();
    }
}
