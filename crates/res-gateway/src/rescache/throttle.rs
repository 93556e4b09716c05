//! Limit on parallel bus requests.
//!
//! Jobs added past the limit wait in a queue. A job holds a [`Permit`] for as
//! long as its request is outstanding; dropping the permit starts the next
//! queued job on the dropping thread.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

type Job = Box<dyn FnOnce(Permit) + Send>;

struct ThrottleState {
    running: usize,
    queue: VecDeque<Job>,
}

/// Runs at most `limit` jobs at the same time
pub struct Throttle {
    limit: usize,
    state: Mutex<ThrottleState>,
}

/// Slot of a running job. Released on drop.
pub struct Permit {
    throttle: Option<Arc<Throttle>>,
}

impl Throttle {
    /// Create a throttle, or `None` if `limit` is zero
    pub fn new(limit: usize) -> Option<Arc<Self>> {
        (limit > 0).then(|| {
            Arc::new(Self {
                limit,
                state: Mutex::new(ThrottleState {
                    running: 0,
                    queue: VecDeque::new(),
                }),
            })
        })
    }

    /// Run `job` now, or queue it if the limit is reached
    pub fn add(self: &Arc<Self>, job: impl FnOnce(Permit) + Send + 'static) {
        {
            let mut state = self.state.lock();
            if state.running >= self.limit {
                state.queue.push_back(Box::new(job));
                return;
            }
            state.running += 1;
        }
        job(Permit {
            throttle: Some(self.clone()),
        });
    }

    /// Run `job` through `throttle` if there is one, or directly
    pub fn run(throttle: Option<&Arc<Self>>, job: impl FnOnce(Permit) + Send + 'static) {
        match throttle {
            Some(throttle) => throttle.add(job),
            None => job(Permit { throttle: None }),
        }
    }

    /// Jobs currently holding a permit
    pub fn running(&self) -> usize {
        self.state.lock().running
    }

    /// Jobs waiting for a permit
    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    fn done(self: &Arc<Self>) {
        let next = {
            let mut state = self.state.lock();
            match state.queue.pop_front() {
                Some(job) => job,
                None => {
                    state.running = state.running.saturating_sub(1);
                    return;
                }
            }
        };
        next(Permit {
            throttle: Some(self.clone()),
        });
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some(throttle) = self.throttle.take() {
            throttle.done();
        }
    }
}

impl std::fmt::Debug for Throttle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Throttle")
            .field("limit", &self.limit)
            .field("running", &state.running)
            .field("queued", &state.queue.len())
            .finish()
    }
}
