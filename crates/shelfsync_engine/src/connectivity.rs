//! Connectivity monitoring.

use crate::observable::Observable;
use tokio::sync::watch;

/// Reports whether the remote store is reachable.
///
/// Implemented by the platform layer. The engine only reads it.
pub trait ConnectivityMonitor: Send + Sync {
    /// Point-in-time check.
    fn is_online(&self) -> bool;

    /// Stream of online/offline values.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// A connectivity monitor driven by explicit calls.
///
/// Useful in tests and for platforms that push connectivity events.
#[derive(Debug)]
pub struct ManualConnectivity {
    state: Observable<bool>,
}

impl ManualConnectivity {
    /// Creates a monitor in the given state.
    pub fn new(online: bool) -> Self {
        Self {
            state: Observable::new(online),
        }
    }

    /// Sets the online state. Returns true on a transition.
    pub fn set_online(&self, online: bool) -> bool {
        self.state.set(online)
    }
}

impl Default for ManualConnectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ConnectivityMonitor for ManualConnectivity {
    fn is_online(&self) -> bool {
        self.state.get()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}
