//! Device serializer: one mailbox per hardware context.
//!
//! Every call into a device (GPU context, camera, codec) runs on the device's
//! own mailbox thread. Nodes never learn that thread's identity; they either
//! make a scoped call with `with`, or start a callback-driven operation with
//! `with_callback` and wait on the returned `Pending` until the callback fires
//! the one-shot `Completer`.

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::runtime::mailbox::{Mailbox, Pending};
use crossbeam_channel::Sender;

/// Handle to a device owned by a dedicated mailbox.
pub struct DeviceContext<D> {
    mailbox: Mailbox<D>,
}

impl<D> Clone for DeviceContext<D> {
    fn clone(&self) -> Self {
        Self {
            mailbox: self.mailbox.clone(),
        }
    }
}

impl<D: 'static> std::fmt::Debug for DeviceContext<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DeviceContext").field(&self.mailbox).finish()
    }
}

impl<D: Send + 'static> DeviceContext<D> {
    pub fn spawn(name: impl Into<String>, device: D) -> PipelineResult<Self> {
        Ok(Self {
            mailbox: Mailbox::spawn(name, device)?,
        })
    }

    /// Run `f` with exclusive access to the device and return its result.
    pub fn with<R: Send + 'static>(
        &self,
        f: impl FnOnce(&mut D) -> R + Send + 'static,
    ) -> PipelineResult<R> {
        self.mailbox.post_and_wait(f)
    }

    /// Start a callback-driven operation.
    ///
    /// `f` runs on the device thread and must eventually complete the given
    /// `Completer`, possibly from another thread. A completer dropped without
    /// completing resolves the operation as abandoned.
    pub fn with_callback<R: Send + 'static>(
        &self,
        f: impl FnOnce(&mut D, Completer<R>) + Send + 'static,
    ) -> Pending<R> {
        let (tx, pending) = self.mailbox.pending_channel();
        let fail = tx.clone();
        let posted = self.mailbox.post(move |device| {
            f(device, Completer { tx: Some(tx) });
        });
        if let Err(e) = posted {
            let _ = fail.send(Err(e));
        }
        pending
    }

    pub fn name(&self) -> &str {
        self.mailbox.name()
    }

    pub fn shutdown(&self) {
        self.mailbox.shutdown();
    }
}

/// One-shot completion signal for a pending device operation.
pub struct Completer<R> {
    tx: Option<Sender<PipelineResult<R>>>,
}

impl<R> Completer<R> {
    pub fn complete(mut self, value: R) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Ok(value));
        }
    }

    pub fn fail(mut self, error: PipelineError) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(error));
        }
    }
}
