//! A blocking last-in-first-out queue feeding the worker threads.
//!
//! The newest request is serviced first: a key the caller asked for a moment ago is worth more than one queued long
//! ago, which has likely scrolled out of view.  Under sustained load this can starve old entries indefinitely.
use parking_lot::{Condvar, Mutex};

struct QueueState<T> {
    stack: Vec<T>,
    closed: bool,
}

pub struct LifoQueue<T> {
    state: Mutex<QueueState<T>>,
    ready: Condvar,
}

impl<T> LifoQueue<T> {
    pub fn new() -> LifoQueue<T> {
        LifoQueue {
            state: Mutex::new(QueueState {
                stack: vec![],
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Push a task, or hand it back if the queue is closed.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(item);
        }
        state.stack.push(item);
        drop(state);
        self.ready.notify_one();
        Ok(())
    }

    /// Wait for the newest task; `None` once the queue is closed.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(item) = state.stack.pop() {
                return Some(item);
            }
            self.ready.wait(&mut state);
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting work, wake every waiter, and return what was still queued, newest first.
    pub fn close(&self) -> Vec<T> {
        let mut state = self.state.lock();
        state.closed = true;
        let mut rest = std::mem::take(&mut state.stack);
        drop(state);
        self.ready.notify_all();
        rest.reverse();
        rest
    }
}

impl<T> Default for LifoQueue<T> {
    fn default() -> LifoQueue<T> {
        LifoQueue::new()
    }
}
