//! Single-slot delayed task
//!
//! Scheduling replaces whatever was pending in the slot, so a burst of
//! calls coalesces into one run after the last delay. Shared by the
//! snapshot debounce, the batch trigger and the error backoff.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct DelayedTask {
    name: &'static str,
    slot: Mutex<Option<Pending>>,
}

struct Pending {
    handle: JoinHandle<()>,
    delay: Duration,
}

impl DelayedTask {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slot: Mutex::new(None),
        }
    }

    /// Run `work` after `delay`, cancelling any run still waiting in the slot.
    ///
    /// Only the wait is cancellable. Once the delay elapses the work runs
    /// on its own task, so rescheduling from inside `work` is safe.
    pub fn schedule<F, Fut>(&self, delay: Duration, work: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = self.name;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            debug!("Delayed task '{}' firing after {:?}", name, delay);
            tokio::spawn(work());
        });

        let previous = match self.slot.lock() {
            Ok(mut slot) => slot.replace(Pending { handle, delay }),
            Err(poisoned) => {
                warn!("Delayed task '{}' slot was poisoned, recovering", name);
                poisoned.into_inner().replace(Pending { handle, delay })
            }
        };

        if let Some(previous) = previous {
            previous.handle.abort();
        }
    }

    /// Drop the pending run, if any. Returns true if one was waiting.
    pub fn cancel(&self) -> bool {
        let previous = match self.slot.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        match previous {
            Some(pending) if !pending.handle.is_finished() => {
                pending.handle.abort();
                true
            }
            _ => false,
        }
    }

    /// Whether a run is still waiting out its delay
    pub fn is_pending(&self) -> bool {
        match self.slot.lock() {
            Ok(slot) => slot.as_ref().is_some_and(|p| !p.handle.is_finished()),
            Err(_) => false,
        }
    }

    /// Delay of the most recently scheduled run
    pub fn last_delay(&self) -> Option<Duration> {
        match self.slot.lock() {
            Ok(slot) => slot.as_ref().map(|p| p.delay),
            Err(_) => None,
        }
    }
}

impl Drop for DelayedTask {
    fn drop(&mut self) {
        if let Ok(slot) = self.slot.get_mut() {
            if let Some(pending) = slot.take() {
                pending.handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_into_one_run() {
        let task = DelayedTask::new("test");
        let runs = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let runs = runs.clone();
            task.schedule(Duration::from_secs(2), move || async move {
                runs.fetch_add(1, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_run() {
        let task = DelayedTask::new("test");
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = runs.clone();
        task.schedule(Duration::from_secs(1), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(task.is_pending());
        assert!(task.cancel());
        assert!(!task.is_pending());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_from_inside_work() {
        let task = Arc::new(DelayedTask::new("test"));
        let runs = Arc::new(AtomicUsize::new(0));

        let inner_task = task.clone();
        let counter = runs.clone();
        task.schedule(Duration::from_secs(1), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            let counter = counter.clone();
            inner_task.schedule(Duration::from_secs(1), move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(task.last_delay(), Some(Duration::from_secs(1)));
    }
}
