//! Shared device state: identity, the current session and its lifecycle.
//! Every concurrent task holds a clone of the same [`Device`] handle.

use crate::config::DeviceIdentity;
use crate::error::Result;
use crate::session::{self, ConnectionState, Session};
use crate::transport::{HubConnector, Provisioner};
use log::{error, info, warn};
use parking_lot::RwLock;
use std::sync::Arc;

/// Internal state of the device that needs to be shared and mutable.
struct DeviceState {
    identity: DeviceIdentity,
    session: Option<Arc<Session>>,
    // True while a (re)connect is in flight.
    connecting: bool,
}

/// Handle to the device and its current hub session.
///
/// Cheap to clone. Reads and swaps of the session never suspend, so a task
/// never observes a half-installed session.
#[derive(Clone)]
pub struct Device {
    state: Arc<RwLock<DeviceState>>,
    provisioner: Arc<dyn Provisioner>,
    connector: Arc<dyn HubConnector>,
}

impl Device {
    pub fn new(
        identity: DeviceIdentity,
        provisioner: Arc<dyn Provisioner>,
        connector: Arc<dyn HubConnector>,
    ) -> Self {
        Self {
            state: Arc::new(RwLock::new(DeviceState {
                identity,
                session: None,
                connecting: false,
            })),
            provisioner,
            connector,
        }
    }

    // -------------------------------------------------------------------------
    // Internal State Helpers
    // -------------------------------------------------------------------------

    fn with_state<R>(&self, f: impl FnOnce(&DeviceState) -> R) -> R {
        f(&self.state.read())
    }

    fn with_state_mut<R>(&self, f: impl FnOnce(&mut DeviceState) -> R) -> R {
        f(&mut self.state.write())
    }

    // -------------------------------------------------------------------------
    // Public API
    // -------------------------------------------------------------------------

    pub fn identity(&self) -> DeviceIdentity {
        self.with_state(|s| s.identity.clone())
    }

    pub fn scope_id(&self) -> String {
        self.with_state(|s| s.identity.scope_id.clone())
    }

    /// Points the device at a new scope. Takes effect on the next connect.
    pub fn set_scope_id<S: Into<String>>(&self, scope_id: S) {
        let scope_id = scope_id.into();
        self.with_state_mut(|s| s.identity.scope_id = scope_id);
    }

    /// The session every task should operate on, if one is installed.
    pub fn session(&self) -> Option<Arc<Session>> {
        self.with_state(|s| s.session.clone())
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.with_state(|s| {
            if s.connecting {
                ConnectionState::Connecting
            } else {
                s.session
                    .as_ref()
                    .map(|session| session.state())
                    .unwrap_or(ConnectionState::Disconnected)
            }
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Provisions and connects with the current identity.
    ///
    /// Any installed session is taken out and disconnected first (best effort).
    /// The new session is installed only once it is connected; on failure the
    /// device is left without a session.
    pub async fn connect(&self) -> Result<Arc<Session>> {
        let (identity, previous) = self.with_state_mut(|s| {
            s.connecting = true;
            (s.identity.clone(), s.session.take())
        });

        if let Some(previous) = previous {
            if let Err(e) = previous.disconnect().await {
                warn!(
                    "Disconnecting {} from {} failed, continuing: {}",
                    previous.device_id(),
                    previous.assigned_hub(),
                    e
                );
            }
        }

        let result = session::connect(&identity, &*self.provisioner, &*self.connector)
            .await
            .map(Arc::new);

        self.with_state_mut(|s| {
            s.connecting = false;
            if let Ok(session) = &result {
                s.session = Some(session.clone());
            }
        });

        match &result {
            Ok(session) => info!(
                "Device {} connected to {}",
                session.device_id(),
                session.assigned_hub()
            ),
            Err(e) => error!(
                "Connecting {} in scope {} failed: {}",
                identity.registration_id, identity.scope_id, e
            ),
        }
        result
    }

    /// Moves the device to `scope_id`: updates the identity, tears the current
    /// session down and provisions again. No retry on failure.
    pub async fn migrate(&self, scope_id: &str) -> Result<Arc<Session>> {
        info!("Migrating device from scope {} to {}", self.scope_id(), scope_id);
        self.set_scope_id(scope_id);
        self.connect().await
    }

    /// Shuts down the current session, if any.
    pub async fn shutdown(&self) -> Result<()> {
        match self.with_state_mut(|s| s.session.take()) {
            Some(session) => session.shutdown().await,
            None => {
                info!("No session to shut down");
                Ok(())
            }
        }
    }
}
