//! One-shot delayed trigger that coalesces bursts into a single run.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Reset-on-schedule one-shot timer.
///
/// Scheduling while a run is pending replaces the pending run, so a burst of
/// triggers within the delay window collapses to one execution.
pub struct Delayer {
    delay: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl Delayer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: Mutex::new(None),
        }
    }

    /// Schedule `task` to run after the delay, replacing any pending run.
    pub fn schedule<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let delay = self.delay;
        let mut pending = self.pending.lock().unwrap();
        if let Some(previous) = pending.take() {
            previous.abort();
        }
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        }));
    }

    /// Drop any pending run.
    pub fn cancel(&self) {
        if let Some(pending) = self.pending.lock().unwrap().take() {
            pending.abort();
        }
    }
}

impl Drop for Delayer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_burst_collapses_to_one_run() {
        let delayer = Delayer::new(Duration::from_millis(20));
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let count = Arc::clone(&count);
            delayer.schedule(async move {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_separate_bursts_each_run() {
        let delayer = Delayer::new(Duration::from_millis(10));
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let count = Arc::clone(&count);
            delayer.schedule(async move {
                count.fetch_add(1, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancel_prevents_run() {
        let delayer = Delayer::new(Duration::from_millis(10));
        let count = Arc::new(AtomicUsize::new(0));

        {
            let count = Arc::clone(&count);
            delayer.schedule(async move {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        delayer.cancel();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
