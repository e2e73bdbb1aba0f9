//! Bounded-concurrency recognition limiter: a counting
//! semaphore with `limit = max(1, max_concurrent_recognitions)` that
//! wraps every recognition call, serving queued waiters in FIFO order
//! (the guarantee `tokio::sync::Semaphore` already provides).

use std::sync::Arc;

use tokio::sync::{Semaphore, SemaphorePermit};

#[derive(Clone)]
pub struct AsyncLimiter {
    semaphore: Arc<Semaphore>,
}

impl AsyncLimiter {
    pub fn new(max_concurrent: u32) -> Self {
        let limit = (max_concurrent as usize).max(1);
        Self { semaphore: Arc::new(Semaphore::new(limit)) }
    }

    pub async fn acquire(&self) -> SemaphorePermit<'_> {
        self.semaphore
            .acquire()
            .await
            .expect("limiter semaphore is never closed")
    }
}
