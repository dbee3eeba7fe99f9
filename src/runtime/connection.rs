//! Typed producer → consumers connection with buffer recycling.
//!
//! A `Connection<P>` is bound to one output port. It owns:
//!
//! - a **pool** of reusable payload buffers the producer draws from
//!   (`acquire`), seeded with `prime` before production starts;
//! - a **consumer set** that is idle, single or multi. Going from one to two
//!   consumers (and back) is invisible to the producer.
//!
//! `queue` wraps the message in one shared envelope and hands every registered
//! consumer a `Frame` pointing at it. Each frame is released exactly once,
//! explicitly or on drop; the payload goes back to the pool when the last
//! frame is released.
//!
//! Sends never block. Backpressure comes from the finite pool: a producer that
//! outruns its consumers runs out of buffers to acquire.

use crate::runtime::lock;
use crate::runtime::message::Message;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How much a consumer queue may hold before frames are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePolicy {
    /// Never drop; the pool bounds memory.
    #[default]
    Unbounded,
    /// Drop (and recycle) new frames for a consumer already holding `n`.
    Leaky(usize),
}

/// Identifies one consumer registration on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(u64);

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Current fan-out shape of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerMode {
    Idle,
    Single,
    Multi,
}

// ── Frames ──

#[derive(Default)]
struct Counters {
    queued: AtomicU64,
    recycled: AtomicU64,
    idle_drops: AtomicU64,
    leaky_drops: AtomicU64,
}

/// Point-in-time copy of a connection's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    /// Messages fanned out to at least one consumer.
    pub queued: u64,
    /// Payloads returned to the pool after their last release.
    pub recycled: u64,
    /// Payloads produced while no consumer was registered.
    pub idle_drops: u64,
    /// Frames dropped by a leaky consumer queue.
    pub leaky_drops: u64,
}

struct Envelope<P> {
    message: Message<P>,
    outstanding: AtomicUsize,
    pool: Sender<P>,
    counters: Arc<Counters>,
}

/// One consumer's view of a queued message.
///
/// Consumers may read the payload but not mutate it, since other consumers
/// can hold the same message. Dropping a frame releases it.
pub struct Frame<P> {
    envelope: Option<Arc<Envelope<P>>>,
}

impl<P> Frame<P> {
    fn new(envelope: Arc<Envelope<P>>) -> Self {
        Self {
            envelope: Some(envelope),
        }
    }

    fn message(&self) -> Option<&Message<P>> {
        self.envelope.as_ref().map(|e| &e.message)
    }

    pub fn payload(&self) -> Option<&P> {
        self.message().and_then(|m| m.payload.as_ref())
    }

    pub fn timestamp(&self) -> Duration {
        self.message().map(|m| m.timestamp).unwrap_or_default()
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.message().map(|m| m.end_of_stream).unwrap_or(false)
    }

    /// Consumers that have not yet released this message.
    pub fn outstanding(&self) -> usize {
        self.envelope
            .as_ref()
            .map(|e| e.outstanding.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Release this consumer's claim on the message.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        let Some(envelope) = self.envelope.take() else {
            return;
        };
        envelope.outstanding.fetch_sub(1, Ordering::AcqRel);
        // Exactly one releaser observes the last strong reference.
        if let Some(envelope) = Arc::into_inner(envelope) {
            if let Some(payload) = envelope.message.payload {
                envelope.counters.recycled.fetch_add(1, Ordering::Relaxed);
                let _ = envelope.pool.send(payload);
            }
        }
    }
}

impl<P> Drop for Frame<P> {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl<P> fmt::Debug for Frame<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("timestamp", &self.timestamp())
            .field("end_of_stream", &self.is_end_of_stream())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

// ── Consumers ──

struct Outlet<P> {
    id: ConsumerId,
    tx: Sender<Frame<P>>,
    detached: Arc<AtomicBool>,
}

impl<P> Drop for Outlet<P> {
    fn drop(&mut self) {
        self.detached.store(true, Ordering::Release);
    }
}

impl<P> Outlet<P> {
    fn deliver(&self, frame: Frame<P>, policy: QueuePolicy, counters: &Counters) {
        if let QueuePolicy::Leaky(limit) = policy {
            if self.tx.len() >= limit && !frame.is_end_of_stream() {
                counters.leaky_drops.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        // Inlet gone without unregistering: the returned frame drops and releases.
        let _ = self.tx.try_send(frame);
    }
}

/// Receiving end handed to a consumer. Clones share the same queue.
pub struct Inlet<P> {
    id: ConsumerId,
    rx: Receiver<Frame<P>>,
    detached: Arc<AtomicBool>,
}

impl<P> Clone for Inlet<P> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            rx: self.rx.clone(),
            detached: Arc::clone(&self.detached),
        }
    }
}

impl<P> fmt::Debug for Inlet<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inlet")
            .field("id", &self.id)
            .field("queued", &self.rx.len())
            .finish()
    }
}

impl<P> Inlet<P> {
    pub fn id(&self) -> ConsumerId {
        self.id
    }

    /// Next frame, waiting at most `timeout`. `None` on timeout or once the
    /// connection has unregistered this consumer and the queue is empty.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Frame<P>> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Some(frame),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_recv(&self) -> Option<Frame<P>> {
        match self.rx.try_recv() {
            Ok(frame) => Some(frame),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Whether the producer side has unregistered this consumer.
    pub fn is_disconnected(&self) -> bool {
        self.detached.load(Ordering::Acquire) && self.rx.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

enum Fanout<P> {
    Idle,
    Single(Outlet<P>),
    Multi(Vec<Outlet<P>>),
}

impl<P> Default for Fanout<P> {
    fn default() -> Self {
        Fanout::Idle
    }
}

impl<P> Fanout<P> {
    fn outlets(&self) -> &[Outlet<P>] {
        match self {
            Fanout::Idle => &[],
            Fanout::Single(outlet) => std::slice::from_ref(outlet),
            Fanout::Multi(outlets) => outlets,
        }
    }

    fn push(&mut self, outlet: Outlet<P>) {
        *self = match std::mem::take(self) {
            Fanout::Idle => Fanout::Single(outlet),
            Fanout::Single(first) => Fanout::Multi(vec![first, outlet]),
            Fanout::Multi(mut outlets) => {
                outlets.push(outlet);
                Fanout::Multi(outlets)
            }
        };
    }

    fn remove(&mut self, id: ConsumerId) -> Option<Outlet<P>> {
        let (next, removed) = match std::mem::take(self) {
            Fanout::Idle => (Fanout::Idle, None),
            Fanout::Single(outlet) if outlet.id == id => (Fanout::Idle, Some(outlet)),
            Fanout::Single(outlet) => (Fanout::Single(outlet), None),
            Fanout::Multi(mut outlets) => {
                let removed = outlets
                    .iter()
                    .position(|o| o.id == id)
                    .map(|i| outlets.remove(i));
                let next = if outlets.len() == 1 {
                    outlets
                        .pop()
                        .map(Fanout::Single)
                        .unwrap_or(Fanout::Idle)
                } else {
                    Fanout::Multi(outlets)
                };
                (next, removed)
            }
        };
        *self = next;
        removed
    }

    fn mode(&self) -> ConsumerMode {
        match self {
            Fanout::Idle => ConsumerMode::Idle,
            Fanout::Single(_) => ConsumerMode::Single,
            Fanout::Multi(_) => ConsumerMode::Multi,
        }
    }
}

struct ConsumerSet<P> {
    fanout: Fanout<P>,
    next_id: u64,
    /// Timestamp of the end-of-stream once the producer closed.
    closed: Option<Duration>,
    warned_idle: bool,
}

// ── Connection ──

struct Inner<P> {
    name: String,
    consumers: Mutex<ConsumerSet<P>>,
    pool_tx: Sender<P>,
    pool_rx: Receiver<P>,
    policy: QueuePolicy,
    counters: Arc<Counters>,
}

/// Runtime channel bound to one output port. Cloning shares the connection.
pub struct Connection<P> {
    inner: Arc<Inner<P>>,
}

impl<P> Clone for Connection<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P> fmt::Debug for Connection<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.inner.name)
            .field("consumers", &self.consumer_count())
            .field("pool", &self.pool_len())
            .finish()
    }
}

impl<P> Connection<P> {
    pub fn new(name: impl Into<String>, policy: QueuePolicy) -> Self {
        let (pool_tx, pool_rx) = unbounded();
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                consumers: Mutex::new(ConsumerSet {
                    fanout: Fanout::Idle,
                    next_id: 0,
                    closed: None,
                    warned_idle: false,
                }),
                pool_tx,
                pool_rx,
                policy,
                counters: Arc::new(Counters::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    // ── Pool ──

    /// Seed the producer-side pool. Returns how many buffers were added.
    pub fn prime(&self, buffers: impl IntoIterator<Item = P>) -> usize {
        let mut count = 0;
        for buffer in buffers {
            if self.inner.pool_tx.send(buffer).is_ok() {
                count += 1;
            }
        }
        count
    }

    /// Take a free buffer without waiting. Buffers come back in FIFO order.
    pub fn acquire(&self) -> Option<P> {
        self.inner.pool_rx.try_recv().ok()
    }

    /// Take a free buffer, waiting at most `timeout` for one to be recycled.
    pub fn acquire_timeout(&self, timeout: Duration) -> Option<P> {
        self.inner.pool_rx.recv_timeout(timeout).ok()
    }

    /// Free buffers currently in the pool.
    pub fn pool_len(&self) -> usize {
        self.inner.pool_rx.len()
    }

    // ── Producer ──

    /// Fan `message` out to every registered consumer.
    ///
    /// Returns the number of consumers that received it. With no consumer,
    /// the payload goes straight back to the pool.
    pub fn queue(&self, message: Message<P>) -> usize {
        let mut set = lock(&self.inner.consumers);
        let n = set.fanout.outlets().len();

        if n == 0 || set.closed.is_some() {
            if n == 0 {
                self.inner.counters.idle_drops.fetch_add(1, Ordering::Relaxed);
                if !set.warned_idle {
                    set.warned_idle = true;
                    tracing::warn!("Connection {} produced data with no consumer", self.inner.name);
                }
            }
            if let Some(payload) = message.payload {
                let _ = self.inner.pool_tx.send(payload);
            }
            return 0;
        }
        set.warned_idle = false;

        let envelope = Arc::new(Envelope {
            message,
            outstanding: AtomicUsize::new(n),
            pool: self.inner.pool_tx.clone(),
            counters: Arc::clone(&self.inner.counters),
        });
        let mut frames: Vec<Frame<P>> = (1..n).map(|_| Frame::new(Arc::clone(&envelope))).collect();
        frames.push(Frame::new(envelope));

        for (outlet, frame) in set.fanout.outlets().iter().zip(frames) {
            outlet.deliver(frame, self.inner.policy, &self.inner.counters);
        }
        self.inner.counters.queued.fetch_add(1, Ordering::Relaxed);
        n
    }

    /// Send end-of-stream to every consumer, now and on later registration.
    /// Idempotent.
    pub fn close(&self, timestamp: Duration) {
        let mut set = lock(&self.inner.consumers);
        if set.closed.is_some() {
            return;
        }
        set.closed = Some(timestamp);
        for outlet in set.fanout.outlets() {
            outlet.deliver(self.eos_frame(timestamp), QueuePolicy::Unbounded, &self.inner.counters);
        }
        tracing::debug!("Connection {} closed", self.inner.name);
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner.consumers).closed.is_some()
    }

    fn eos_frame(&self, timestamp: Duration) -> Frame<P> {
        Frame::new(Arc::new(Envelope {
            message: Message::end_of_stream(timestamp),
            outstanding: AtomicUsize::new(1),
            pool: self.inner.pool_tx.clone(),
            counters: Arc::clone(&self.inner.counters),
        }))
    }

    // ── Consumers ──

    /// Register a consumer and return its receiving end.
    pub fn add_consumer(&self) -> Inlet<P> {
        let mut set = lock(&self.inner.consumers);
        let id = ConsumerId(set.next_id);
        set.next_id += 1;

        let (tx, rx) = unbounded();
        let detached = Arc::new(AtomicBool::new(false));
        let outlet = Outlet {
            id,
            tx,
            detached: Arc::clone(&detached),
        };
        if let Some(timestamp) = set.closed {
            outlet.deliver(self.eos_frame(timestamp), QueuePolicy::Unbounded, &self.inner.counters);
        }
        set.fanout.push(outlet);
        tracing::trace!(
            "Connection {} added consumer {} ({:?})",
            self.inner.name,
            id,
            set.fanout.mode()
        );
        Inlet { id, rx, detached }
    }

    /// Unregister a consumer. No frame is sent to it once this returns.
    pub fn remove_consumer(&self, id: ConsumerId) -> bool {
        let mut set = lock(&self.inner.consumers);
        let removed = set.fanout.remove(id).is_some();
        if removed {
            tracing::trace!(
                "Connection {} removed consumer {} ({:?})",
                self.inner.name,
                id,
                set.fanout.mode()
            );
        }
        removed
    }

    /// Send end-of-stream to one consumer and unregister it in one step.
    pub fn finish_consumer(&self, id: ConsumerId, timestamp: Duration) -> bool {
        let mut set = lock(&self.inner.consumers);
        match set.fanout.remove(id) {
            Some(outlet) => {
                outlet.deliver(self.eos_frame(timestamp), QueuePolicy::Unbounded, &self.inner.counters);
                true
            }
            None => false,
        }
    }

    pub fn consumer_count(&self) -> usize {
        lock(&self.inner.consumers).fanout.outlets().len()
    }

    pub fn mode(&self) -> ConsumerMode {
        lock(&self.inner.consumers).fanout.mode()
    }

    pub fn stats(&self) -> ConnectionStats {
        let c = &self.inner.counters;
        ConnectionStats {
            queued: c.queued.load(Ordering::Relaxed),
            recycled: c.recycled.load(Ordering::Relaxed),
            idle_drops: c.idle_drops.load(Ordering::Relaxed),
            leaky_drops: c.leaky_drops.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};

    fn ts(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    #[test]
    fn test_prime_then_acquire_is_fifo_and_non_blocking() {
        let conn = Connection::new("1.out", QueuePolicy::Unbounded);
        assert_eq!(conn.prime(["b1", "b2"]), 2);
        assert_eq!(conn.acquire(), Some("b1"));
        assert_eq!(conn.acquire(), Some("b2"));
        assert_eq!(conn.acquire(), None);
    }

    #[test]
    fn test_single_to_multi_and_back() {
        let conn: Connection<u32> = Connection::new("1.out", QueuePolicy::Unbounded);
        assert_eq!(conn.mode(), ConsumerMode::Idle);

        let a = conn.add_consumer();
        assert_eq!(conn.mode(), ConsumerMode::Single);
        let b = conn.add_consumer();
        assert_eq!(conn.mode(), ConsumerMode::Multi);

        assert_eq!(conn.queue(Message::data(1, ts(0))), 2);
        assert!(conn.remove_consumer(b.id()));
        assert_eq!(conn.mode(), ConsumerMode::Single);
        assert_eq!(conn.queue(Message::data(2, ts(1))), 1);

        let got: Vec<u32> = std::iter::from_fn(|| a.try_recv())
            .map(|f| *f.payload().unwrap())
            .collect();
        assert_eq!(got, vec![1, 2]);

        // b saw the first message only
        assert_eq!(b.try_recv().and_then(|f| f.payload().copied()), Some(1));
        assert!(b.try_recv().is_none());
        assert!(b.is_disconnected());
    }

    #[test]
    fn test_payload_recycled_after_last_release() {
        let conn = Connection::new("1.out", QueuePolicy::Unbounded);
        let a = conn.add_consumer();
        let b = conn.add_consumer();
        conn.queue(Message::data(42u32, ts(0)));

        let fa = a.try_recv().unwrap();
        let fb = b.try_recv().unwrap();
        assert_eq!(fa.outstanding(), 2);

        fa.release();
        assert_eq!(fb.outstanding(), 1);
        assert_eq!(conn.pool_len(), 0);

        drop(fb);
        assert_eq!(conn.acquire(), Some(42));
        assert_eq!(conn.stats().recycled, 1);
    }

    #[test]
    fn test_no_consumer_returns_payload_to_pool() {
        let conn = Connection::new("1.out", QueuePolicy::Unbounded);
        assert_eq!(conn.queue(Message::data(9u32, ts(0))), 0);
        assert_eq!(conn.queue(Message::data(10u32, ts(1))), 0);
        assert_eq!(conn.pool_len(), 2);
        assert_eq!(conn.stats().idle_drops, 2);
    }

    #[test]
    fn test_close_reaches_current_and_late_consumers() {
        let conn: Connection<u32> = Connection::new("1.out", QueuePolicy::Unbounded);
        let early = conn.add_consumer();
        conn.close(ts(100));
        conn.close(ts(200));
        let late = conn.add_consumer();

        let eos = early.try_recv().unwrap();
        assert!(eos.is_end_of_stream());
        assert_eq!(eos.timestamp(), ts(100));
        assert!(early.try_recv().is_none());
        assert!(late.try_recv().unwrap().is_end_of_stream());

        // Data after close is recycled, not delivered
        assert_eq!(conn.queue(Message::data(5, ts(300))), 0);
        assert_eq!(conn.acquire(), Some(5));
    }

    #[test]
    fn test_finish_consumer_sends_eos_then_unregisters() {
        let conn = Connection::new("4.out", QueuePolicy::Unbounded);
        let inlet = conn.add_consumer();
        conn.queue(Message::data(1u32, ts(0)));
        assert!(conn.finish_consumer(inlet.id(), ts(10)));
        assert!(!conn.finish_consumer(inlet.id(), ts(10)));

        assert_eq!(inlet.try_recv().and_then(|f| f.payload().copied()), Some(1));
        assert!(inlet.try_recv().unwrap().is_end_of_stream());
        assert!(inlet.is_disconnected());
        assert_eq!(conn.mode(), ConsumerMode::Idle);
    }

    #[test]
    fn test_leaky_policy_drops_and_recycles() {
        let conn = Connection::new("1.out", QueuePolicy::Leaky(2));
        let inlet = conn.add_consumer();
        for i in 0..5u32 {
            conn.queue(Message::data(i, ts(i as u64)));
        }
        assert_eq!(inlet.len(), 2);
        assert_eq!(conn.stats().leaky_drops, 3);
        assert_eq!(conn.pool_len(), 3);
    }

    #[test]
    fn test_dropped_inlet_recycles_queued_frames() {
        let conn = Connection::new("1.out", QueuePolicy::Unbounded);
        let inlet = conn.add_consumer();
        conn.queue(Message::data(1u32, ts(0)));
        conn.queue(Message::data(2u32, ts(1)));
        conn.remove_consumer(inlet.id());
        drop(inlet);
        assert_eq!(conn.pool_len(), 2);
    }

    // Property-based tests using proptest
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Op {
        Add,
        Remove(usize),
        Queue,
        Consume(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Add),
            (0usize..8).prop_map(Op::Remove),
            Just(Op::Queue),
            (0usize..8).prop_map(Op::Consume),
        ]
    }

    proptest! {
        #[test]
        fn test_fanout_delivers_only_while_registered(
            ops in prop::collection::vec(op(), 1..80),
            pool_size in 1usize..5,
        ) {
            let conn = Connection::new("p.out", QueuePolicy::Unbounded);
            conn.prime(0..pool_size as u64);

            let mut live: Vec<Inlet<u64>> = Vec::new();
            let mut removed: Vec<Inlet<u64>> = Vec::new();
            // Timestamps each consumer must see, in order
            let mut expected: BTreeMap<ConsumerId, Vec<Duration>> = BTreeMap::new();
            let mut seen: BTreeMap<ConsumerId, Vec<Duration>> = BTreeMap::new();
            let mut clock = 0u64;

            for op in ops {
                match op {
                    Op::Add => {
                        let inlet = conn.add_consumer();
                        expected.insert(inlet.id(), Vec::new());
                        live.push(inlet);
                    }
                    Op::Remove(i) if !live.is_empty() => {
                        let inlet = live.remove(i % live.len());
                        prop_assert!(conn.remove_consumer(inlet.id()));
                        removed.push(inlet);
                    }
                    Op::Queue => {
                        let Some(buffer) = conn.acquire() else { continue };
                        clock += 1;
                        let delivered = conn.queue(Message::data(buffer, Duration::from_millis(clock)));
                        prop_assert_eq!(delivered, live.len());
                        for inlet in &live {
                            expected.entry(inlet.id()).or_default().push(Duration::from_millis(clock));
                        }
                    }
                    Op::Consume(i) if !live.is_empty() => {
                        let inlet = &live[i % live.len()];
                        if let Some(frame) = inlet.try_recv() {
                            seen.entry(inlet.id()).or_default().push(frame.timestamp());
                            frame.release();
                        }
                    }
                    _ => {}
                }
                let expected_mode = match live.len() {
                    0 => ConsumerMode::Idle,
                    1 => ConsumerMode::Single,
                    _ => ConsumerMode::Multi,
                };
                prop_assert_eq!(conn.mode(), expected_mode);
            }

            for inlet in live.iter().chain(removed.iter()) {
                while let Some(frame) = inlet.try_recv() {
                    seen.entry(inlet.id()).or_default().push(frame.timestamp());
                }
            }
            for (id, timestamps) in &expected {
                let got = seen.get(id).cloned().unwrap_or_default();
                prop_assert_eq!(&got, timestamps, "consumer {} saw the wrong frames", id);
            }

            // Every buffer came back exactly once
            let pool: BTreeSet<u64> = std::iter::from_fn(|| conn.acquire()).collect();
            prop_assert_eq!(pool.len(), pool_size);
            prop_assert!(conn.acquire().is_none());
        }
    }
}
