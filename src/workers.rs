//! The bounded process queue and its worker pool.
//!
//! One pipeline producer feeds compressed states into a bounded
//! channel; `W` worker threads drain it. Shutdown is cooperative:
//! dropping the sender lets every worker finish the remaining queue
//! and exit. The first handler error is captured and surfaced when the
//! pool is drained; later states are consumed without processing so
//! the producer never blocks on a dead pool.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, Sender};

use crate::compressed::CompressedState;

pub type StateHandler = dyn Fn(CompressedState) -> Result<()> + Send + Sync;

pub struct WorkerPool {
    handler: Arc<StateHandler>,
    sender: Option<Sender<CompressedState>>,
    handles: Vec<JoinHandle<()>>,
    error: Arc<Mutex<Option<anyhow::Error>>>,
}

impl WorkerPool {
    /// Spawns `workers` threads over a queue of `queue_len` states.
    /// With zero workers the pool degrades to inline processing on the
    /// producer thread.
    pub fn start(workers: usize, queue_len: usize, handler: Arc<StateHandler>) -> Self {
        let error: Arc<Mutex<Option<anyhow::Error>>> = Arc::new(Mutex::new(None));
        if workers == 0 {
            return Self {
                handler,
                sender: None,
                handles: Vec::new(),
                error,
            };
        }
        let (sender, receiver) = bounded::<CompressedState>(queue_len);
        let handles = (0..workers)
            .map(|_| {
                let receiver = receiver.clone();
                let handler = Arc::clone(&handler);
                let error = Arc::clone(&error);
                std::thread::spawn(move || {
                    let mut failed = false;
                    for state in receiver.iter() {
                        if failed {
                            continue;
                        }
                        if let Err(e) = handler(state) {
                            if let Ok(mut slot) = error.lock() {
                                if slot.is_none() {
                                    *slot = Some(e);
                                }
                            }
                            failed = true;
                        }
                    }
                })
            })
            .collect();
        Self {
            handler,
            sender: Some(sender),
            handles,
            error,
        }
    }

    /// Hands one state to the pool, blocking while the queue is full.
    pub fn process(&self, state: CompressedState) -> Result<()> {
        match &self.sender {
            Some(sender) => sender
                .send(state)
                .map_err(|_| anyhow!("worker pool is shut down")),
            None => (self.handler)(state),
        }
    }

    /// Stops accepting work, waits for the queue to empty and all
    /// workers to exit, then reports the first handler error, if any.
    pub fn drain(mut self) -> Result<()> {
        self.sender.take();
        for handle in self.handles.drain(..) {
            handle
                .join()
                .map_err(|_| anyhow!("worker thread panicked"))?;
        }
        self.error
            .lock()
            .map_err(|_| anyhow!("worker error lock poisoned"))?
            .take()
            .map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn all_queued_states_are_processed() {
        let count = Arc::new(AtomicU64::new(0));
        let sum = Arc::new(AtomicU64::new(0));
        let (c2, s2) = (Arc::clone(&count), Arc::clone(&sum));
        let pool = WorkerPool::start(
            4,
            16,
            Arc::new(move |cs: CompressedState| {
                c2.fetch_add(1, Ordering::Relaxed);
                s2.fetch_add(cs.data() as u64, Ordering::Relaxed);
                Ok(())
            }),
        );
        for n in 1..=100u64 {
            pool.process(CompressedState::from_data(n as u128)).unwrap();
        }
        pool.drain().unwrap();
        assert_eq!(count.load(Ordering::Relaxed), 100);
        assert_eq!(sum.load(Ordering::Relaxed), 5050);
    }

    #[test]
    fn zero_workers_runs_inline() {
        let count = Arc::new(AtomicU64::new(0));
        let c2 = Arc::clone(&count);
        let pool = WorkerPool::start(
            0,
            16,
            Arc::new(move |_| {
                c2.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }),
        );
        pool.process(CompressedState::from_data(1)).unwrap();
        assert_eq!(count.load(Ordering::Relaxed), 1);
        pool.drain().unwrap();
    }

    #[test]
    fn first_error_is_reported_on_drain() {
        let pool = WorkerPool::start(
            2,
            4,
            Arc::new(|cs: CompressedState| {
                if cs.data() == 13 {
                    Err(anyhow!("unlucky"))
                } else {
                    Ok(())
                }
            }),
        );
        for n in 0..64u64 {
            pool.process(CompressedState::from_data(n as u128)).unwrap();
        }
        let err = pool.drain().unwrap_err();
        assert!(err.to_string().contains("unlucky"));
    }
}
