//! The `migration*DeviceMove` command: re-provision the device into a new ID scope.

use crate::command::{CommandHandler, CommandKey};
use crate::device::Device;
use crate::error::{DeviceError, Result};
use async_trait::async_trait;
use log::info;
use serde_json::{Value, json};

pub const MIGRATION_COMPONENT: &str = "migration";
pub const DEVICE_MOVE_METHOD: &str = "DeviceMove";
pub const ID_SCOPE_FIELD: &str = "idScope";

pub const MIGRATION_ACK: &str = "Migration received. Disconnecting...";

/// Target of a device move, taken from the command payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationEvent {
    pub new_scope_id: String,
}

impl MigrationEvent {
    pub fn from_payload(payload: &Value) -> Result<Self> {
        match payload.get(ID_SCOPE_FIELD).and_then(Value::as_str) {
            Some(scope) if !scope.trim().is_empty() => Ok(Self {
                new_scope_id: scope.trim().to_string(),
            }),
            _ => Err(DeviceError::InvalidPayload(format!(
                "'{}' must be a non-empty string",
                ID_SCOPE_FIELD
            ))),
        }
    }
}

/// Handles `migration*DeviceMove`.
///
/// The acknowledgement is fixed and sent without looking at the payload; the
/// new scope is only read once the caller has been answered.
#[derive(Debug, Default, Clone, Copy)]
pub struct MigrationHandler;

#[async_trait]
impl CommandHandler for MigrationHandler {
    fn key(&self) -> Option<CommandKey> {
        Some(CommandKey::new(MIGRATION_COMPONENT, DEVICE_MOVE_METHOD))
    }

    fn build_response(&self, _payload: &Value) -> Value {
        json!({ "result": true, "data": MIGRATION_ACK })
    }

    async fn on_command(&self, device: &Device, payload: Value) -> Result<()> {
        let event = MigrationEvent::from_payload(&payload)?;
        info!("Received \"DeviceMove\" to scope {}", event.new_scope_id);
        device.migrate(&event.new_scope_id).await?;
        info!("Migrated");
        Ok(())
    }
}
