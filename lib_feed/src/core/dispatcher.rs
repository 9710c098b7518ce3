//! # Replaying Event Dispatcher
//!
//! Fan-out of events from one producer (a tracker, a live-notify session) to any
//! number of subscribers.
//!
//! ## Core Design Principles:
//!
//! 1.  **Zero-Copy Fan-out**: each event is wrapped in an `Arc` once; every
//!     subscriber receives a pointer to the same allocation.
//! 2.  **Never block the producer**: every subscriber owns an unbounded MPSC
//!     channel, so a slow consumer grows its own queue instead of stalling the
//!     network loop that publishes.
//! 3.  **Replay for late joiners**: the last `replay_capacity` events are kept and
//!     pushed into a new subscriber's channel before it is registered, under the
//!     same lock as `broadcast`, so it sees history and live events in order with
//!     no gap and no duplicate.
//! 4.  **Self-cleaning**: subscribers whose receiver was dropped are removed on
//!     the next broadcast.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// Receiving half handed to subscribers.
pub type Subscription<T> = mpsc::UnboundedReceiver<Arc<T>>;

struct ClientHandle<T> {
    id: u64,
    sender: mpsc::UnboundedSender<Arc<T>>,
}

struct DispatchState<T> {
    clients: Vec<ClientHandle<T>>,
    history: VecDeque<Arc<T>>,
    next_id: u64,
    closed: bool,
}

pub struct Dispatcher<T> {
    /// Used only in log lines.
    name: String,
    replay_capacity: usize,
    state: Mutex<DispatchState<T>>,
}

impl<T> Dispatcher<T> {
    pub fn new(name: impl Into<String>, replay_capacity: usize) -> Self {
        Self {
            name: name.into(),
            replay_capacity,
            state: Mutex::new(DispatchState {
                clients: Vec::new(),
                history: VecDeque::with_capacity(replay_capacity),
                next_id: 0,
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DispatchState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a subscriber. The replay history is delivered first.
    ///
    /// After `close`, the returned receiver yields the history and then ends.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();

        for event in state.history.iter() {
            let _ = tx.send(Arc::clone(event));
        }

        if !state.closed {
            let id = state.next_id;
            state.next_id += 1;
            state.clients.push(ClientHandle { id, sender: tx });
            log::debug!("[{}] subscriber {} registered", self.name, id);
        }
        rx
    }

    /// Publishes one event to every live subscriber.
    ///
    /// Returns the number of subscribers that received it.
    pub fn broadcast(&self, event: T) -> usize {
        let event = Arc::new(event);
        let mut state = self.lock();
        if state.closed {
            return 0;
        }

        if self.replay_capacity > 0 {
            if state.history.len() == self.replay_capacity {
                state.history.pop_front();
            }
            state.history.push_back(Arc::clone(&event));
        }

        let name = &self.name;
        state.clients.retain(|client| match client.sender.send(Arc::clone(&event)) {
            Ok(()) => true,
            Err(_) => {
                log::debug!("[{}] subscriber {} disconnected, removing", name, client.id);
                false
            }
        });
        state.clients.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().clients.len()
    }

    /// Most recent events, oldest first.
    pub fn history(&self) -> Vec<Arc<T>> {
        self.lock().history.iter().cloned().collect()
    }

    /// Drops every sender so subscribers observe end-of-stream. Idempotent.
    pub fn close(&self) {
        let mut state = self.lock();
        if !state.closed {
            state.closed = true;
            state.clients.clear();
            log::debug!("[{}] dispatcher closed", self.name);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
