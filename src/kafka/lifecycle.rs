// Connection lifecycle state machine
//
// Every role that owns a broker connection (each consumer registration, the
// producer, the search scanner) drives one ConnectionLifecycle. The roles are
// fully independent: one role's disconnect never touches another's state.
//
//   Disconnected --Connect--> Connecting --Ready--> Ready
//        ^                        |                   |
//        +---------Lost-----------+-------Lost--------+
//        |                                            |
//        +--Closed-- Closing <--------Close-----------+
//
// Transitions that are not in the table are ignored (a second Ready signal on
// an already-ready connection, a Lost signal while already disconnected).
// Reconnection is a scheduled sleep in the owning supervisor task, not a
// nested callback.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// State of one owned connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    Closing,
}

/// Signal fed into the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Start (re)connecting
    Connect,
    /// Underlying connection reported ready
    Ready,
    /// Underlying connection closed or errored
    Lost,
    /// Owner asked to close
    Close,
    /// Close completed
    Closed,
}

impl ConnectionState {
    /// Transition table; `None` means the event is ignored in this state
    pub fn on(self, event: LifecycleEvent) -> Option<ConnectionState> {
        use ConnectionState::*;
        match (self, event) {
            (Disconnected, LifecycleEvent::Connect) => Some(Connecting),
            (Connecting, LifecycleEvent::Ready) => Some(Ready),
            (Connecting | Ready, LifecycleEvent::Lost) => Some(Disconnected),
            (Connecting | Ready, LifecycleEvent::Close) => Some(Closing),
            (Closing, LifecycleEvent::Closed | LifecycleEvent::Lost) => Some(Disconnected),
            _ => None,
        }
    }

    pub fn is_ready(self) -> bool {
        self == ConnectionState::Ready
    }
}

/// Lifecycle of one role's connection
pub struct ConnectionLifecycle {
    role: String,
    state: watch::Sender<ConnectionState>,
    /// Incremented on every Connect, identifies the current connection instance
    generation: AtomicU64,
    reconnect_delay: Duration,
}

impl ConnectionLifecycle {
    pub fn new(role: impl Into<String>, reconnect_delay: Duration) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            role: role.into(),
            state,
            generation: AtomicU64::new(0),
            reconnect_delay,
        }
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn reconnect_delay(&self) -> Duration {
        self.reconnect_delay
    }

    /// Observe state changes
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Apply an event, returning whether the state changed
    pub fn apply(&self, event: LifecycleEvent) -> bool {
        let mut from = ConnectionState::Disconnected;
        let mut to = None;
        let changed = self.state.send_if_modified(|state| {
            from = *state;
            to = state.on(event);
            match to {
                Some(next) => {
                    *state = next;
                    true
                }
                None => false,
            }
        });

        if changed {
            if event == LifecycleEvent::Connect {
                self.generation.fetch_add(1, Ordering::AcqRel);
            }
            debug!(
                role = %self.role,
                generation = self.generation(),
                "connection {:?} -> {:?} on {:?}",
                from,
                to.unwrap_or(from),
                event
            );
        } else {
            trace!(role = %self.role, "ignoring {:?} while {:?}", event, from);
        }
        changed
    }

    /// Wait the fixed reconnect delay
    ///
    /// Returns `false` if the token was cancelled first.
    pub async fn backoff(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.reconnect_delay) => true,
        }
    }

    /// Wait until the connection is ready
    ///
    /// Returns `false` if the token was cancelled first.
    pub async fn wait_ready(&self, cancel: &CancellationToken) -> bool {
        let mut rx = self.subscribe();
        loop {
            if rx.borrow_and_update().is_ready() {
                return true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }
}
