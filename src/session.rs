//! Provisioning + connect, and the connected hub session it produces.

use crate::command::{CommandRequest, CommandResponse};
use crate::config::DeviceIdentity;
use crate::error::{DeviceError, Result};
use crate::transport::{HubClient, HubConnector, Message, Provisioner, RegistrationStatus};
use log::{debug, info};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// Connection state of a session (and, by extension, of the device).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ShuttingDown,
}

/// A connected transport session to an assigned hub.
///
/// Sessions are never reused across migrations: a new one is created for
/// every successful [`connect`].
pub struct Session {
    assigned_hub: String,
    device_id: String,
    client: Arc<dyn HubClient>,
    state: RwLock<ConnectionState>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("assigned_hub", &self.assigned_hub)
            .field("device_id", &self.device_id)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    pub fn assigned_hub(&self) -> &str {
        &self.assigned_hub
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Current state. A session whose transport dropped reads as Disconnected.
    pub fn state(&self) -> ConnectionState {
        match *self.state.read() {
            ConnectionState::Connected if !self.client.is_connected() => {
                ConnectionState::Disconnected
            }
            s => s,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub async fn send_message(&self, message: Message) -> Result<()> {
        self.client.send_message(message).await
    }

    pub async fn receive_method_request(&self) -> Result<CommandRequest> {
        self.client.receive_method_request().await
    }

    pub async fn send_method_response(&self, response: CommandResponse) -> Result<()> {
        self.client.send_method_response(response).await
    }

    /// Gracefully closes the connection. The session is Disconnected afterwards
    /// whether or not the close succeeded.
    pub async fn disconnect(&self) -> Result<()> {
        debug!("Disconnecting session {} on {}", self.device_id, self.assigned_hub);
        let result = self.client.disconnect().await;
        *self.state.write() = ConnectionState::Disconnected;
        result
    }

    /// Closes the connection and releases the client's resources.
    pub async fn shutdown(&self) -> Result<()> {
        *self.state.write() = ConnectionState::ShuttingDown;
        info!("Shutting down session {} on {}", self.device_id, self.assigned_hub);
        let result = self.client.shutdown().await;
        *self.state.write() = ConnectionState::Disconnected;
        result
    }
}

/// Provisions `identity` and opens a session on the hub it was assigned to.
///
/// Returns only once the session is connected. Fails with
/// [`DeviceError::Provisioning`] when the device is not assigned and with
/// [`DeviceError::Transport`] when the session handshake fails.
pub async fn connect(
    identity: &DeviceIdentity,
    provisioner: &dyn Provisioner,
    connector: &dyn HubConnector,
) -> Result<Session> {
    let registration = provisioner.register(identity).await?;

    if registration.status != RegistrationStatus::Assigned {
        return Err(DeviceError::Provisioning(format!(
            "could not provision {} in scope {}: status {:?}",
            identity.registration_id, identity.scope_id, registration.status
        )));
    }

    let (assigned_hub, device_id) = match (registration.assigned_hub, registration.device_id) {
        (Some(hub), Some(id)) if !hub.is_empty() && !id.is_empty() => (hub, id),
        _ => {
            return Err(DeviceError::Provisioning(
                "assignment did not name a hub and device id".to_string(),
            ));
        }
    };

    info!("Device was assigned to id scope {}", identity.scope_id);
    info!("Assigned hub {} as device {}", assigned_hub, device_id);

    let client = connector
        .create(&assigned_hub, &device_id, &identity.symmetric_key)
        .await?;
    client.connect().await.map_err(|e| match e {
        DeviceError::Transport(_) => e,
        other => DeviceError::Transport(other.to_string()),
    })?;

    Ok(Session {
        assigned_hub,
        device_id,
        client,
        state: RwLock::new(ConnectionState::Connected),
    })
}
