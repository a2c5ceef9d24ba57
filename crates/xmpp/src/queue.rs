//! Outbound stanza queue with reply correlation.
//!
//! A single worker task owns the [`PacketSink`] and transmits queued stanzas
//! in FIFO order. Callers either fire and forget, or register a one-shot
//! waiter keyed by stanza id and block (with a timeout) until the dispatcher
//! hands the matching reply to [`PacketQueue::on_incoming`].

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Notify, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::XmppError;
use crate::stanza::{Stanza, StanzaKind};

/// Destination for outbound stanzas.
pub trait PacketSink: Send + 'static {
    /// Write one stanza to the wire.
    fn transmit(&mut self, stanza: &Stanza) -> impl Future<Output = Result<(), XmppError>> + Send;
}

/// Lifecycle of the queue worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// No worker; enqueue fails
    Stopped,
    /// Worker transmits queued stanzas
    Running,
    /// Worker idles; stanzas accumulate
    Paused,
    /// Shutdown in progress
    Stopping,
}

/// Whether `enqueue` waits for a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMode {
    /// Return as soon as the stanza is queued
    None,
    /// Block until the reply with the same id arrives, or the timeout passes
    Wait(Duration),
}

/// An inbound stanza after correlation.
#[derive(Debug, Clone)]
pub struct Incoming {
    /// The stanza as decoded from the wire
    pub stanza: Stanza,
    /// Whether it answered a pending request
    pub correlated: bool,
}

struct Outgoing {
    stanza: Stanza,
    awaiting_reply: bool,
}

struct PendingReply {
    token: u64,
    kind: StanzaKind,
    reply: oneshot::Sender<Result<Stanza, XmppError>>,
}

struct Shared {
    state: watch::Sender<RunState>,
    outgoing: Mutex<VecDeque<Outgoing>>,
    wakeup: Notify,
    pending: DashMap<String, PendingReply>,
    next_token: AtomicU64,
}

impl Shared {
    fn push(&self, outgoing: Outgoing) -> Result<(), XmppError> {
        let mut fifo = self.outgoing.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(*self.state.borrow(), RunState::Stopped | RunState::Stopping) {
            return Err(XmppError::QueueClosed);
        }
        fifo.push_back(outgoing);
        drop(fifo);
        self.wakeup.notify_one();
        Ok(())
    }

    fn pop(&self) -> Option<Outgoing> {
        self.outgoing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn drain(&self) -> Vec<Outgoing> {
        self.outgoing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    async fn transmit<S: PacketSink>(&self, sink: &mut S, outgoing: Outgoing) {
        let Err(e) = sink.transmit(&outgoing.stanza).await else {
            return;
        };
        warn!(
            error = %e,
            kind = %outgoing.stanza.kind(),
            id = ?outgoing.stanza.id(),
            "Failed to transmit stanza"
        );
        if !outgoing.awaiting_reply {
            return;
        }
        if let Some((_, pending)) = outgoing
            .stanza
            .id()
            .and_then(|id| self.pending.remove(id))
        {
            let _ = pending.reply.send(Err(e));
        }
    }
}

/// Removes its pending entry when the waiting call finishes or is dropped.
struct PendingGuard<'a> {
    pending: &'a DashMap<String, PendingReply>,
    id: String,
    token: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending
            .remove_if(&self.id, |_, entry| entry.token == self.token);
    }
}

/// FIFO outbound queue plus pending-reply table.
pub struct PacketQueue<S: PacketSink> {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<S>>>,
}

impl<S: PacketSink> Default for PacketQueue<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: PacketSink> PacketQueue<S> {
    /// A stopped queue.
    pub fn new() -> Self {
        let (state, _) = watch::channel(RunState::Stopped);
        Self {
            shared: Arc::new(Shared {
                state,
                outgoing: Mutex::new(VecDeque::new()),
                wakeup: Notify::new(),
                pending: DashMap::new(),
                next_token: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Current run state.
    pub fn state(&self) -> RunState {
        *self.shared.state.borrow()
    }

    /// Observe run state changes.
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.shared.state.subscribe()
    }

    /// Number of stanzas waiting for the worker.
    pub fn queued(&self) -> usize {
        self.shared
            .outgoing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Number of requests waiting for a reply.
    pub fn pending(&self) -> usize {
        self.shared.pending.len()
    }

    /// Start the worker over `sink`, optionally paused.
    pub fn start(&self, sink: S, paused: bool) -> Result<(), XmppError> {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            return Err(XmppError::internal("packet queue already started"));
        }

        self.clear();
        let initial = if paused {
            RunState::Paused
        } else {
            RunState::Running
        };
        self.shared.state.send_replace(initial);
        *worker = Some(tokio::spawn(run_worker(Arc::clone(&self.shared), sink)));

        debug!(state = ?initial, "Packet queue started");
        Ok(())
    }

    /// Queue a stanza.
    ///
    /// With [`ReplyMode::Wait`] the pending entry is registered before the
    /// stanza is queued, so a fast reply cannot be missed; the call returns
    /// the reply or [`XmppError::Timeout`].
    pub async fn enqueue(
        &self,
        stanza: Stanza,
        mode: ReplyMode,
    ) -> Result<Option<Stanza>, XmppError> {
        if self.state() == RunState::Stopped {
            return Err(XmppError::QueueClosed);
        }

        let timeout = match mode {
            ReplyMode::None => {
                self.shared.push(Outgoing {
                    stanza,
                    awaiting_reply: false,
                })?;
                return Ok(None);
            }
            ReplyMode::Wait(timeout) => timeout,
        };

        let id = stanza.id().ok_or(XmppError::MissingStanzaId)?.to_string();
        let token = self.shared.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = oneshot::channel();

        match self.shared.pending.entry(id.clone()) {
            Entry::Occupied(_) => return Err(XmppError::DuplicateStanzaId(id)),
            Entry::Vacant(slot) => {
                slot.insert(PendingReply {
                    token,
                    kind: stanza.kind(),
                    reply: tx,
                });
            }
        }
        let _guard = PendingGuard {
            pending: &self.shared.pending,
            id: id.clone(),
            token,
        };

        self.shared.push(Outgoing {
            stanza,
            awaiting_reply: true,
        })?;

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(reply)) => reply.map(Some),
            Ok(Err(_)) => Err(XmppError::QueueClosed),
            Err(_) => {
                let removed = self
                    .shared
                    .pending
                    .remove_if(&id, |_, entry| entry.token == token)
                    .is_some();
                if !removed {
                    // The reply was claimed while the timer fired.
                    if let Ok(reply) = rx.try_recv() {
                        return reply.map(Some);
                    }
                }
                debug!(id = %id, "Timed out waiting for reply");
                Err(XmppError::Timeout { id })
            }
        }
    }

    /// Queue a stanza without waiting.
    pub async fn send(&self, stanza: Stanza) -> Result<(), XmppError> {
        self.enqueue(stanza, ReplyMode::None).await.map(|_| ())
    }

    /// Queue a stanza and wait up to `timeout` for its reply.
    pub async fn request(&self, stanza: Stanza, timeout: Duration) -> Result<Stanza, XmppError> {
        self.enqueue(stanza, ReplyMode::Wait(timeout))
            .await?
            .ok_or_else(|| XmppError::internal("reply wait returned no stanza"))
    }

    /// Stop transmitting without losing queued stanzas.
    pub fn pause(&self) {
        self.shared.state.send_if_modified(|state| {
            if *state == RunState::Running {
                *state = RunState::Paused;
                true
            } else {
                false
            }
        });
    }

    /// Resume transmitting after [`PacketQueue::pause`].
    pub fn resume(&self) {
        self.shared.state.send_if_modified(|state| {
            if *state == RunState::Paused {
                *state = RunState::Running;
                true
            } else {
                false
            }
        });
    }

    /// Correlate an inbound stanza with a pending request.
    ///
    /// The stanza is always handed back so it can also be fanned out to
    /// listeners.
    pub fn on_incoming(&self, stanza: Stanza) -> Incoming {
        let Some(id) = stanza.id() else {
            return Incoming {
                stanza,
                correlated: false,
            };
        };

        match self.shared.pending.remove(id) {
            Some((id, pending)) => {
                let reply = stanza.clone().upcast(pending.kind);
                if pending.reply.send(Ok(reply)).is_err() {
                    debug!(id = %id, "Reply arrived after its waiter gave up");
                }
                Incoming {
                    stanza,
                    correlated: true,
                }
            }
            None => Incoming {
                stanza,
                correlated: false,
            },
        }
    }

    /// Shut the worker down.
    ///
    /// Stanzas still queued are transmitted, waiters are released with
    /// [`XmppError::QueueClosed`], and the sink is handed back so the caller
    /// can close the stream.
    pub async fn stop(&self) -> Option<S> {
        let previous = self.shared.state.send_replace(RunState::Stopping);
        if matches!(previous, RunState::Stopped | RunState::Stopping) {
            if previous == RunState::Stopped {
                self.shared.state.send_replace(RunState::Stopped);
            }
            return None;
        }

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let mut sink = match handle {
            Some(handle) => match handle.await {
                Ok(sink) => Some(sink),
                Err(e) => {
                    error!(error = %e, "Packet queue worker failed");
                    None
                }
            },
            None => None,
        };

        let remaining = self.shared.drain();
        if !remaining.is_empty() {
            debug!(count = remaining.len(), "Flushing queued stanzas");
        }
        for outgoing in remaining {
            match sink.as_mut() {
                Some(sink) => self.shared.transmit(sink, outgoing).await,
                None => warn!(id = ?outgoing.stanza.id(), "Dropping stanza; no sink"),
            }
        }

        self.release_waiters();
        self.shared.state.send_replace(RunState::Stopped);
        debug!("Packet queue stopped");
        sink
    }

    /// Drop queued stanzas and pending waiters without changing the run state.
    pub fn clear(&self) {
        self.shared.drain();
        self.release_waiters();
    }

    fn release_waiters(&self) {
        let ids: Vec<String> = self
            .shared
            .pending
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for id in ids {
            if let Some((_, pending)) = self.shared.pending.remove(&id) {
                let _ = pending.reply.send(Err(XmppError::QueueClosed));
            }
        }
    }
}

async fn run_worker<S: PacketSink>(shared: Arc<Shared>, mut sink: S) -> S {
    let mut state = shared.state.subscribe();
    loop {
        let current = *state.borrow_and_update();
        match current {
            RunState::Running => {
                if let Some(outgoing) = shared.pop() {
                    shared.transmit(&mut sink, outgoing).await;
                    continue;
                }
                tokio::select! {
                    _ = shared.wakeup.notified() => {}
                    changed = state.changed() => {
                        if changed.is_err() {
                            return sink;
                        }
                    }
                }
            }
            RunState::Paused => {
                if state.changed().await.is_err() {
                    return sink;
                }
            }
            RunState::Stopping | RunState::Stopped => return sink,
        }
    }
}
