//! Stoppable background thread used by node bodies.
//!
//! A node's production or consumption loop runs on a `Worker` thread with a
//! shared `running` flag. The loop must re-check the flag at least once per
//! poll interval; `stop` clears it and joins.

use crate::pipeline::error::PipelineResult;
use crate::runtime::mailbox::panic_message;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Cloneable view of a worker's running flag.
#[derive(Debug, Clone)]
pub struct RunFlag(Arc<AtomicBool>);

impl RunFlag {
    #[inline]
    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Sleep until `deadline` in steps of at most `poll`. Returns false if
    /// the worker was stopped meanwhile.
    pub fn sleep_until(&self, deadline: Instant, poll: Duration) -> bool {
        loop {
            if !self.is_running() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(poll));
        }
    }
}

/// A background thread that is joined on `stop` or drop.
pub struct Worker {
    name: String,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawn `body` on a named thread. `body` should return once the flag
    /// reads false.
    pub fn spawn(
        name: impl Into<String>,
        body: impl FnOnce(RunFlag) + Send + 'static,
    ) -> PipelineResult<Self> {
        let name = name.into();
        let running = Arc::new(AtomicBool::new(true));
        let flag = RunFlag(Arc::clone(&running));
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || body(flag))?;
        tracing::debug!("Worker '{}' started", name);
        Ok(Self {
            name,
            running,
            handle: Some(handle),
        })
    }

    /// Whether the thread is still inside its body.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Clear the flag and join. Idempotent.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if let Err(panic) = handle.join() {
                tracing::error!(
                    "Worker '{}' panicked: {}",
                    self.name,
                    panic_message(&*panic)
                );
            }
            tracing::debug!("Worker '{}' stopped", self.name);
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn test_stop_joins_loop() {
        let ticks = Arc::new(AtomicU64::new(0));
        let t = Arc::clone(&ticks);
        let mut worker = Worker::spawn("ticker", move |flag| {
            while flag.is_running() {
                t.fetch_add(1, Ordering::Relaxed);
                thread::sleep(Duration::from_millis(1));
            }
        })
        .unwrap();
        thread::sleep(Duration::from_millis(10));
        assert!(worker.is_running());

        worker.stop();
        let after = ticks.load(Ordering::Relaxed);
        assert!(after > 0);
        assert!(!worker.is_running());
        thread::sleep(Duration::from_millis(5));
        assert_eq!(ticks.load(Ordering::Relaxed), after);
        worker.stop();
    }

    #[test]
    fn test_sleep_until_observes_stop() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let mut worker = Worker::spawn("sleeper", move |flag| {
            let far = Instant::now() + Duration::from_secs(60);
            let _ = tx.send(flag.sleep_until(far, Duration::from_millis(2)));
        })
        .unwrap();
        let started = Instant::now();
        worker.stop();
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)), Ok(false));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_panicking_worker_is_contained() {
        let mut worker = Worker::spawn("doomed", |_| panic!("device lost")).unwrap();
        worker.stop();
        assert!(!worker.is_running());
    }
}
