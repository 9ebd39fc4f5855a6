//! Connectivity monitor collaborator.
//!
//! The platform layer owns actual link detection; the engine only needs the
//! current state and a stream of transitions. [`SwitchedConnectivity`] is a
//! ready-made implementation for embedders that receive link callbacks, and
//! for tests.

use std::sync::Mutex;
use tokio::sync::broadcast;

/// Link state as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    Online,
    Offline,
}

/// Source of online/offline state and transition notifications.
pub trait Connectivity: Send + Sync {
    /// The current link state.
    fn current(&self) -> Link;

    /// Subscribe to link transitions.
    fn changes(&self) -> broadcast::Receiver<Link>;
}

/// A connectivity monitor driven by explicit [`set`](SwitchedConnectivity::set)
/// calls.
#[derive(Debug)]
pub struct SwitchedConnectivity {
    state: Mutex<Link>,
    tx: broadcast::Sender<Link>,
}

impl SwitchedConnectivity {
    /// Create a monitor with an initial state.
    pub fn new(initial: Link) -> Self {
        let (tx, _) = broadcast::channel(16);
        Self {
            state: Mutex::new(initial),
            tx,
        }
    }

    /// Report a link state. Transitions are published; repeats are not.
    pub fn set(&self, link: Link) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if *state != link {
            *state = link;
            tracing::debug!(?link, "connectivity changed");
            let _ = self.tx.send(link);
        }
    }
}

impl Connectivity for SwitchedConnectivity {
    fn current(&self) -> Link {
        *self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn changes(&self) -> broadcast::Receiver<Link> {
        self.tx.subscribe()
    }
}
