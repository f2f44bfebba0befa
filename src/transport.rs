//! Collaborator seams: the provisioning service and the hub session.
//!
//! The device logic only talks to these traits. [`crate::provisioning`] and
//! [`crate::hub`] provide the network-backed implementations.

use crate::command::{CommandRequest, CommandResponse};
use crate::config::DeviceIdentity;
use crate::error::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_ENCODING_UTF8: &str = "utf-8";

/// Outcome reported by the provisioning service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationStatus {
    Unassigned,
    Assigning,
    Assigned,
    Failed,
    Disabled,
    #[serde(other)]
    Unknown,
}

/// Result of a registration round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationResult {
    pub status: RegistrationStatus,
    pub assigned_hub: Option<String>,
    pub device_id: Option<String>,
}

impl RegistrationResult {
    pub fn assigned<H: Into<String>, D: Into<String>>(hub: H, device_id: D) -> Self {
        Self {
            status: RegistrationStatus::Assigned,
            assigned_hub: Some(hub.into()),
            device_id: Some(device_id.into()),
        }
    }

    pub fn with_status(status: RegistrationStatus) -> Self {
        Self {
            status,
            assigned_hub: None,
            device_id: None,
        }
    }
}

/// Device-to-cloud message with its content metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub body: Vec<u8>,
    pub content_type: String,
    pub content_encoding: String,
}

impl Message {
    pub fn json(body: Vec<u8>) -> Self {
        Self {
            body,
            content_type: CONTENT_TYPE_JSON.to_string(),
            content_encoding: CONTENT_ENCODING_UTF8.to_string(),
        }
    }
}

/// Registers a device identity and reports which hub it was assigned to.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn register(&self, identity: &DeviceIdentity) -> Result<RegistrationResult>;
}

/// Creates (unconnected) hub clients for an assigned hub.
#[async_trait]
pub trait HubConnector: Send + Sync {
    async fn create(
        &self,
        hostname: &str,
        device_id: &str,
        symmetric_key: &str,
    ) -> Result<Arc<dyn HubClient>>;
}

/// A session with a messaging hub.
#[async_trait]
pub trait HubClient: Send + Sync {
    async fn connect(&self) -> Result<()>;

    /// Closes the network connection; the client may connect again.
    async fn disconnect(&self) -> Result<()>;

    /// Releases every resource held by the client.
    async fn shutdown(&self) -> Result<()>;

    async fn send_message(&self, message: Message) -> Result<()>;

    /// Suspends until the next command arrives.
    ///
    /// Must be cancel safe: dropping the future loses no request.
    async fn receive_method_request(&self) -> Result<CommandRequest>;

    async fn send_method_response(&self, response: CommandResponse) -> Result<()>;

    fn is_connected(&self) -> bool;
}
