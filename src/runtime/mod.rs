//! Concurrency primitives the graph runtime is built from.
//!
//! # Architecture
//!
//! - **mailbox**: Single-threaded actor executing closures over owned state.
//! - **message**: The `Message` envelope carried by connections.
//! - **connection**: Producer → consumers relay with buffer recycling.
//! - **arena**: Fixed-slot buffer arena with generation-tagged handles.
//! - **device**: Per-device mailbox for hardware-context calls.

pub mod arena;
pub mod connection;
pub mod device;
pub mod mailbox;
pub mod message;

pub use arena::{BufferArena, BufferHandle};
pub use connection::{
    ConnectionStats, Connection, ConsumerId, ConsumerMode, Frame, Inlet, QueuePolicy,
};
pub use device::{Completer, DeviceContext};
pub use mailbox::{Mailbox, Pending, WeakMailbox};
pub use message::Message;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
