//! Mailbox actor: one thread of control per entity.
//!
//! A `Mailbox<S>` owns a state value `S` on a dedicated named thread. Callers
//! submit closures over `&mut S`; they run strictly FIFO and one at a time, so
//! the state never needs a lock of its own.
//!
//! - `post` enqueues and returns immediately.
//! - `call` enqueues and returns a `Pending` completion handle, so a caller can
//!   fan several calls out and join later.
//! - `post_and_wait` / `ask` enqueue and block until the result is available.
//! - `shutdown` closes intake, lets queued tasks run, then joins the thread.
//!
//! A panicking task is reported to its own caller only. Waiting on a mailbox
//! from its own thread is rejected with `PipelineError::Reentrant`.

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::runtime::lock;
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

type Task<S> = Box<dyn FnOnce(&mut S) + Send>;

struct Shared<S> {
    name: String,
    /// `None` once intake is closed.
    sender: Mutex<Option<Sender<Task<S>>>>,
    /// Disconnects when the mailbox thread exits.
    finished: Receiver<()>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

/// Handle to a mailbox actor. Cloning shares the same mailbox.
pub struct Mailbox<S> {
    shared: Arc<Shared<S>>,
}

impl<S> Clone for Mailbox<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: 'static> std::fmt::Debug for Mailbox<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("name", &self.shared.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Non-owning mailbox handle, held by state that must reach its own mailbox.
pub struct WeakMailbox<S> {
    shared: Weak<Shared<S>>,
}

impl<S> Clone for WeakMailbox<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Weak::clone(&self.shared),
        }
    }
}

impl<S> Default for WeakMailbox<S> {
    /// A handle that never upgrades.
    fn default() -> Self {
        Self { shared: Weak::new() }
    }
}

impl<S> WeakMailbox<S> {
    pub fn upgrade(&self) -> Option<Mailbox<S>> {
        self.shared.upgrade().map(|shared| Mailbox { shared })
    }
}

impl<S: Send + 'static> Mailbox<S> {
    /// Spawn a mailbox thread owning `state`.
    pub fn spawn(name: impl Into<String>, state: S) -> PipelineResult<Self> {
        Self::spawn_with_shutdown(name, state, |_| {})
    }

    /// Spawn a mailbox thread owning `state`. `cleanup` runs on the mailbox
    /// thread after the last queued task; a panic in it is logged.
    pub fn spawn_with_shutdown(
        name: impl Into<String>,
        state: S,
        cleanup: impl FnOnce(&mut S) + Send + 'static,
    ) -> PipelineResult<Self> {
        let name = name.into();
        let (tx, rx) = unbounded::<Task<S>>();
        let (finished_tx, finished_rx) = bounded::<()>(0);

        let thread_name = name.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_loop(thread_name, state, rx, cleanup, finished_tx))?;

        tracing::debug!("Mailbox '{}' started", name);
        Ok(Self {
            shared: Arc::new(Shared {
                name,
                sender: Mutex::new(Some(tx)),
                finished: finished_rx,
                thread_id: handle.thread().id(),
                thread: Mutex::new(Some(handle)),
            }),
        })
    }
}

fn run_loop<S>(
    name: String,
    mut state: S,
    rx: Receiver<Task<S>>,
    cleanup: impl FnOnce(&mut S),
    _finished: Sender<()>,
) {
    while let Ok(task) = rx.recv() {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| task(&mut state))) {
            tracing::error!(
                "Task on mailbox '{}' panicked: {}",
                name,
                panic_message(&*panic)
            );
        }
    }
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| cleanup(&mut state))) {
        tracing::error!(
            "Shutdown cleanup of mailbox '{}' panicked: {}",
            name,
            panic_message(&*panic)
        );
    }
    drop(state);
    tracing::debug!("Mailbox '{}' stopped", name);
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl<S: 'static> Mailbox<S> {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.shared.sender).is_none()
    }

    /// Whether the calling thread is this mailbox's thread.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.shared.thread_id
    }

    pub fn downgrade(&self) -> WeakMailbox<S> {
        WeakMailbox {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// A one-shot result channel whose `Pending` end knows this mailbox.
    pub(crate) fn pending_channel<R>(&self) -> (Sender<PipelineResult<R>>, Pending<R>) {
        let (tx, rx) = bounded(1);
        let pending = Pending {
            rx,
            mailbox: self.shared.name.clone(),
            thread_id: self.shared.thread_id,
        };
        (tx, pending)
    }

    fn enqueue(&self, task: Task<S>) -> PipelineResult<()> {
        let sender = lock(&self.shared.sender);
        match sender.as_ref() {
            Some(tx) => tx
                .send(task)
                .map_err(|_| PipelineError::MailboxClosed(self.shared.name.clone())),
            None => Err(PipelineError::MailboxClosed(self.shared.name.clone())),
        }
    }

    /// Enqueue a task and return immediately.
    pub fn post(&self, task: impl FnOnce(&mut S) + Send + 'static) -> PipelineResult<()> {
        self.enqueue(Box::new(task))
    }

    /// Enqueue a task and return a handle to its result.
    pub fn call<R: Send + 'static>(
        &self,
        task: impl FnOnce(&mut S) -> R + Send + 'static,
    ) -> Pending<R> {
        let (tx, pending) = self.pending_channel();
        let reply = tx.clone();
        let mailbox = self.shared.name.clone();
        let wrapped: Task<S> = Box::new(move |state| {
            let result = catch_unwind(AssertUnwindSafe(|| task(state))).map_err(|panic| {
                PipelineError::TaskPanicked {
                    mailbox,
                    message: panic_message(&*panic),
                }
            });
            let _ = reply.send(result);
        });
        if let Err(e) = self.enqueue(wrapped) {
            let _ = tx.send(Err(e));
        }
        pending
    }

    /// Enqueue a task and block until it has run.
    pub fn post_and_wait<R: Send + 'static>(
        &self,
        task: impl FnOnce(&mut S) -> R + Send + 'static,
    ) -> PipelineResult<R> {
        if self.is_current() {
            return Err(PipelineError::Reentrant(self.shared.name.clone()));
        }
        self.call(task).wait()
    }

    /// `post_and_wait` for tasks that return a `PipelineResult` themselves.
    pub fn ask<R: Send + 'static>(
        &self,
        task: impl FnOnce(&mut S) -> PipelineResult<R> + Send + 'static,
    ) -> PipelineResult<R> {
        self.post_and_wait(task)?
    }

    /// Close intake, run every queued task, then stop the thread.
    ///
    /// Idempotent. From the mailbox's own thread this only closes intake; the
    /// thread exits after the current task and the remaining queue.
    pub fn shutdown(&self) {
        let sender = lock(&self.shared.sender).take();
        if sender.is_some() {
            tracing::debug!("Mailbox '{}' shutting down", self.shared.name);
        }
        drop(sender);

        if self.is_current() {
            return;
        }
        // Disconnects once the thread has drained and exited.
        let _ = self.shared.finished.recv();
        if let Some(handle) = lock(&self.shared.thread).take() {
            if handle.join().is_err() {
                tracing::error!("Mailbox '{}' thread panicked", self.shared.name);
            }
        }
    }
}

/// Completion handle for a task submitted with `Mailbox::call`.
#[must_use = "a pending result does nothing unless waited on"]
pub struct Pending<R> {
    rx: Receiver<PipelineResult<R>>,
    mailbox: String,
    thread_id: ThreadId,
}

impl<R> Pending<R> {
    /// Block until the task has run.
    pub fn wait(self) -> PipelineResult<R> {
        match self.rx.try_recv() {
            Ok(result) => return result,
            Err(TryRecvError::Disconnected) => return Err(self.abandoned()),
            Err(TryRecvError::Empty) => {}
        }
        if thread::current().id() == self.thread_id {
            return Err(PipelineError::Reentrant(self.mailbox));
        }
        match self.rx.recv() {
            Ok(result) => result,
            Err(_) => Err(self.abandoned()),
        }
    }

    /// Wait at most `timeout`. On timeout the task is not cancelled; it still
    /// runs to completion on its mailbox.
    pub fn wait_timeout(self, timeout: Duration) -> PipelineResult<R> {
        if thread::current().id() == self.thread_id {
            return match self.rx.try_recv() {
                Ok(result) => result,
                Err(_) => Err(PipelineError::Reentrant(self.mailbox)),
            };
        }
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(PipelineError::Timeout(format!(
                "task on mailbox '{}' did not finish within {:?}",
                self.mailbox, timeout
            ))),
            Err(RecvTimeoutError::Disconnected) => Err(self.abandoned()),
        }
    }

    /// Result if the task has already run.
    pub fn try_wait(&self) -> Option<PipelineResult<R>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(self.abandoned())),
        }
    }

    fn abandoned(&self) -> PipelineError {
        PipelineError::Abandoned(format!("task on mailbox '{}' was dropped", self.mailbox))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_tasks_run_in_fifo_order() {
        let mailbox = Mailbox::spawn("fifo", Vec::<u32>::new()).unwrap();
        for i in 0..100 {
            mailbox.post(move |log| log.push(i)).unwrap();
        }
        let log = mailbox.post_and_wait(|log| log.clone()).unwrap();
        assert_eq!(log, (0..100).collect::<Vec<_>>());
        mailbox.shutdown();
    }

    #[test]
    fn test_concurrent_callers_never_interleave() {
        let mailbox = Mailbox::spawn("serial", (0u32, 0u32)).unwrap();
        thread::scope(|scope| {
            for _ in 0..8 {
                let mb = mailbox.clone();
                scope.spawn(move || {
                    for _ in 0..50 {
                        mb.post(|(inside, max)| {
                            *inside += 1;
                            *max = (*max).max(*inside);
                            thread::yield_now();
                            *inside -= 1;
                        })
                        .unwrap();
                    }
                });
            }
        });
        let (_, max) = mailbox.post_and_wait(|s| *s).unwrap();
        assert_eq!(max, 1);
        mailbox.shutdown();
    }

    #[test]
    fn test_panic_reported_to_caller_only() {
        let mailbox = Mailbox::spawn("panicky", 5u32).unwrap();
        let err = mailbox
            .post_and_wait(|_| -> u32 { panic!("boom") })
            .unwrap_err();
        assert!(matches!(err, PipelineError::TaskPanicked { ref message, .. } if message == "boom"));

        // Still alive
        assert_eq!(mailbox.post_and_wait(|v| *v).unwrap(), 5);
        mailbox.shutdown();
    }

    #[test]
    fn test_shutdown_drains_queue() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mailbox = Mailbox::spawn("drain", ()).unwrap();
        for _ in 0..20 {
            let c = Arc::clone(&counter);
            mailbox
                .post(move |_| {
                    thread::sleep(Duration::from_millis(1));
                    c.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        mailbox.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn test_shutdown_is_idempotent_and_closes_intake() {
        let mailbox = Mailbox::spawn("idem", ()).unwrap();
        mailbox.shutdown();
        mailbox.shutdown();
        assert!(mailbox.is_closed());
        assert!(mailbox.post(|_| {}).unwrap_err().is_closed());
        assert!(mailbox.post_and_wait(|_| 1).unwrap_err().is_closed());
    }

    #[test]
    fn test_cleanup_panic_still_completes_shutdown() {
        let mailbox = Mailbox::spawn_with_shutdown("cleanup", (), |_| panic!("cleanup failed")).unwrap();
        mailbox.shutdown();
        assert!(mailbox.is_closed());
    }

    #[test]
    fn test_cleanup_runs_after_queue() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let o = Arc::clone(&order);
        let mailbox = Mailbox::spawn_with_shutdown("ordered", (), move |_| {
            o.lock().unwrap().push("cleanup");
        })
        .unwrap();
        let o = Arc::clone(&order);
        mailbox.post(move |_| o.lock().unwrap().push("task")).unwrap();
        mailbox.shutdown();
        assert_eq!(*order.lock().unwrap(), vec!["task", "cleanup"]);
    }

    #[test]
    fn test_reentrant_wait_is_rejected() {
        let mailbox = Mailbox::spawn("reentrant", 0u32).unwrap();
        let inner = mailbox.clone();
        let result = mailbox
            .post_and_wait(move |_| inner.post_and_wait(|v| *v))
            .unwrap();
        assert!(matches!(result, Err(PipelineError::Reentrant(_))));
        mailbox.shutdown();
    }

    #[test]
    fn test_shutdown_from_own_thread_closes_intake() {
        let mailbox = Mailbox::spawn("self-stop", 0u32).unwrap();
        let inner = mailbox.clone();
        mailbox.post_and_wait(move |_| inner.shutdown()).unwrap();
        assert!(mailbox.is_closed());
        mailbox.shutdown();
    }

    #[test]
    fn test_call_fan_out_and_join() {
        let a = Mailbox::spawn("a", 1u32).unwrap();
        let b = Mailbox::spawn("b", 2u32).unwrap();
        let pa = a.call(|v| *v * 10);
        let pb = b.call(|v| *v * 10);
        assert_eq!(pa.wait().unwrap() + pb.wait().unwrap(), 30);
        a.shutdown();
        b.shutdown();
    }

    #[test]
    fn test_wait_timeout_leaves_task_running() {
        let done = Arc::new(AtomicUsize::new(0));
        let mailbox = Mailbox::spawn("slow", ()).unwrap();
        let d = Arc::clone(&done);
        let pending = mailbox.call(move |_| {
            thread::sleep(Duration::from_millis(100));
            d.store(1, Ordering::SeqCst);
        });
        let err = pending.wait_timeout(Duration::from_millis(5)).unwrap_err();
        assert!(matches!(err, PipelineError::Timeout(_)));

        mailbox.shutdown();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ask_flattens_results() {
        let mailbox = Mailbox::spawn("ask", 3u32).unwrap();
        assert_eq!(mailbox.ask(|v| Ok(*v)).unwrap(), 3);
        let err = mailbox
            .ask(|_| -> PipelineResult<u32> { Err(PipelineError::InvalidLink("x".into())) })
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidLink(_)));
        mailbox.shutdown();
    }

    #[test]
    fn test_weak_handle() {
        let mailbox = Mailbox::spawn("weak", ()).unwrap();
        let weak = mailbox.downgrade();
        assert!(weak.upgrade().is_some());
        mailbox.shutdown();
        drop(mailbox);
        assert!(weak.upgrade().is_none());
    }
}
