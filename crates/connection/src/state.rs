//! Connection state machine
//!
//! ```text
//! Uninitialized --claim--> Claimed --connect--> Connected
//!                                      ^            |
//!                                      |    disconnect / detach
//!                                      |            v
//!                                      +------ Disconnected
//! any --shutdown--> ShutDown (terminal)
//! ```

use crate::identity::DeviceIdentity;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Lifecycle state of a connection client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Uninitialized,
    Claimed,
    Connected,
    Disconnected,
    ShutDown,
}

/// Lifecycle event driving a state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Claim,
    Connect,
    Disconnect,
    Detach,
    Shutdown,
}

impl ConnectionState {
    /// State after `transition`, or `None` if it does not apply here
    pub fn next(self, transition: Transition) -> Option<ConnectionState> {
        use ConnectionState::*;

        match (self, transition) {
            (ShutDown, _) => None,
            (_, Transition::Shutdown) => Some(ShutDown),
            (Uninitialized, Transition::Claim) => Some(Claimed),
            (Claimed | Disconnected, Transition::Connect) => Some(Connected),
            (Connected, Transition::Disconnect | Transition::Detach) => Some(Disconnected),
            _ => None,
        }
    }

    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }

    pub fn is_terminal(self) -> bool {
        self == ConnectionState::ShutDown
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Uninitialized => "uninitialized",
            ConnectionState::Claimed => "claimed",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::ShutDown => "shut down",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct LinkStatus {
    identity: DeviceIdentity,
    connected: AtomicBool,
    detach_pending: AtomicBool,
}

/// Cheap shared view of a client handed to listeners
///
/// The connected flag is updated by lifecycle calls and by the detach
/// callback without taking the session lock.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    inner: Arc<LinkStatus>,
}

impl ClientHandle {
    pub fn new(identity: DeviceIdentity) -> Self {
        Self {
            inner: Arc::new(LinkStatus {
                identity,
                connected: AtomicBool::new(false),
                detach_pending: AtomicBool::new(false),
            }),
        }
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.inner.identity
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Set the connected flag, returning the previous value
    pub(crate) fn set_connected(&self, connected: bool) -> bool {
        self.inner.connected.swap(connected, Ordering::SeqCst)
    }

    /// Record a device detach
    ///
    /// Returns true if the link was connected, in which case the caller
    /// owns the single `connection_lost` notification.
    pub(crate) fn mark_detached(&self) -> bool {
        self.inner.detach_pending.store(true, Ordering::SeqCst);
        self.inner.connected.swap(false, Ordering::SeqCst)
    }

    /// Consume a pending detach
    pub(crate) fn take_detach(&self) -> bool {
        self.inner.detach_pending.swap(false, Ordering::SeqCst)
    }

    /// Whether two handles refer to the same client
    pub fn same_client(&self, other: &ClientHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
