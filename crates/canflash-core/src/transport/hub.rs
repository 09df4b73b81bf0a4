//! Message dispatch for a single CAN link.
//!
//! Every decoded message goes through [`MessageHub::dispatch`], in arrival
//! order. If a [`ResponseWaiter`] is registered for the message identifier
//! it receives the message; otherwise it is broadcast to all passive
//! [`Subscription`]s.
//!
//! The hub also owns the session lease: at most one update session may
//! drive a given link at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{trace, warn};

use crate::protocol::CanMessage;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    #[error("Timed out")]
    Timeout,
    #[error("Cancelled")]
    Cancelled,
    #[error("Link closed")]
    Disconnected,
}

/// Shared cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct Waiter {
    token: u64,
    ids: Vec<u16>,
    tx: Sender<CanMessage>,
}

#[derive(Default)]
struct HubInner {
    next_token: u64,
    waiter: Option<Waiter>,
    subscribers: Vec<(u64, Sender<CanMessage>)>,
}

impl HubInner {
    fn token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }
}

/// Single dispatch queue per transport.
#[derive(Default)]
pub struct MessageHub {
    inner: Mutex<HubInner>,
    session_active: AtomicBool,
}

impl MessageHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deliver a received message.
    pub fn dispatch(&self, msg: CanMessage) {
        let mut inner = self.lock();

        if let Some(waiter) = &inner.waiter
            && waiter.ids.contains(&msg.id())
        {
            if waiter.tx.send(msg).is_ok() {
                trace!(id = %format!("0x{:03X}", msg.id()), "Delivered to waiter");
                return;
            }
            inner.waiter = None;
        }

        inner.subscribers.retain(|(_, tx)| tx.send(msg).is_ok());
        trace!(
            id = %format!("0x{:03X}", msg.id()),
            subscribers = inner.subscribers.len(),
            "Broadcast"
        );
    }

    /// Register a passive subscriber. Unsubscribes on drop.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let (tx, rx) = mpsc::channel();
        let mut inner = self.lock();
        let token = inner.token();
        inner.subscribers.push((token, tx));
        Subscription {
            token,
            rx,
            hub: Arc::downgrade(self),
        }
    }

    /// Register the waiter for a response. Must happen before the request
    /// is sent so a fast reply is not lost.
    pub fn expect(self: &Arc<Self>, ids: &[u16]) -> ResponseWaiter {
        let (tx, rx) = mpsc::channel();
        let mut inner = self.lock();
        if inner.waiter.is_some() {
            warn!("Replacing an outstanding response waiter");
        }
        let token = inner.token();
        inner.waiter = Some(Waiter {
            token,
            ids: ids.to_vec(),
            tx,
        });
        ResponseWaiter {
            token,
            rx,
            hub: Arc::downgrade(self),
        }
    }

    /// Drop every waiter and subscriber; their receivers report disconnect.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.waiter = None;
        inner.subscribers.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub fn has_waiter(&self) -> bool {
        self.lock().waiter.is_some()
    }

    /// Claim the link for one update session. Fails fast if already taken.
    pub fn try_acquire_session(self: &Arc<Self>) -> Option<SessionLease> {
        self.session_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| SessionLease { hub: self.clone() })
    }

    pub fn session_active(&self) -> bool {
        self.session_active.load(Ordering::SeqCst)
    }

    fn unsubscribe(&self, token: u64) {
        self.lock().subscribers.retain(|(t, _)| *t != token);
    }

    fn release_waiter(&self, token: u64) {
        let mut inner = self.lock();
        if inner.waiter.as_ref().is_some_and(|w| w.token == token) {
            inner.waiter = None;
        }
    }
}

/// Exclusive claim on a link, released on drop.
pub struct SessionLease {
    hub: Arc<MessageHub>,
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.hub.session_active.store(false, Ordering::SeqCst);
    }
}

/// Passive message stream.
pub struct Subscription {
    token: u64,
    rx: Receiver<CanMessage>,
    hub: Weak<MessageHub>,
}

impl Subscription {
    pub fn try_recv(&self) -> Option<CanMessage> {
        match self.rx.try_recv() {
            Ok(msg) => Some(msg),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<CanMessage, WaitError> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => WaitError::Timeout,
            RecvTimeoutError::Disconnected => WaitError::Disconnected,
        })
    }

    /// Drain everything already delivered.
    pub fn drain(&self) -> Vec<CanMessage> {
        self.rx.try_iter().collect()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.unsubscribe(self.token);
        }
    }
}

/// Receives the responses a request is waiting on.
pub struct ResponseWaiter {
    token: u64,
    rx: Receiver<CanMessage>,
    hub: Weak<MessageHub>,
}

impl ResponseWaiter {
    /// Block until a message arrives, the deadline passes or `cancel` fires.
    /// Cancellation is checked every `poll`.
    pub fn wait_until(
        &self,
        deadline: Instant,
        cancel: &CancelToken,
        poll: Duration,
    ) -> Result<CanMessage, WaitError> {
        loop {
            if cancel.is_cancelled() {
                return Err(WaitError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(WaitError::Timeout);
            }
            let slice = poll.min(deadline - now);
            match self.rx.recv_timeout(slice) {
                Ok(msg) => return Ok(msg),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(WaitError::Disconnected),
            }
        }
    }
}

impl Drop for ResponseWaiter {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.release_waiter(self.token);
        }
    }
}
