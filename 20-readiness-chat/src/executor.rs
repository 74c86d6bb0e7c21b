//! Worker execution capability for event handling.
//!
//! The event loop only needs to hand off a unit of work; it never waits for a
//! result. Anything that can run a boxed closure "somewhere" qualifies.

use std::sync::Arc;

use anyhow::{Context, Result};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

pub trait Executor: Send + Sync {
    /// Runs `job`, possibly on another thread. Fire-and-forget.
    fn execute(&self, job: Job);
}

impl Executor for rayon::ThreadPool {
    fn execute(&self, job: Job) {
        self.spawn(job);
    }
}

/// Builds a bounded rayon pool whose threads are named `chat-worker-N`.
pub fn worker_pool(threads: usize) -> Result<Arc<dyn Executor>> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|index| format!("chat-worker-{index}"))
        .build()
        .context("failed to build worker pool")?;
    Ok(Arc::new(pool))
}
