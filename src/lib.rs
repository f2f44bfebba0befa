//! # dpsmove
//!
//! A device client that provisions itself through a Device Provisioning
//! Service, streams temperature telemetry to the hub it is assigned to and
//! moves to a different ID scope when the `migration*DeviceMove` command
//! arrives.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dpsmove::{Coordinator, Device, DeviceIdentity, DpsProvisioner, MigrationHandler, MqttHubConnector, Settings};
//! use std::sync::Arc;
//!
//! # async fn run() -> dpsmove::Result<()> {
//! let settings = Settings::default();
//! let identity = DeviceIdentity::new("0ne000ABCDE", "sensor-01", "BASE64_KEY");
//! let device = Device::new(
//!     identity,
//!     Arc::new(DpsProvisioner::new(settings.provisioning_host.clone())),
//!     Arc::new(MqttHubConnector),
//! );
//! Coordinator::new(device, Arc::new(MigrationHandler), settings.telemetry_interval)
//!     .run(dpsmove::console::quit_signal())
//!     .await
//! # }
//! ```
//!
pub mod command;
pub mod config;
pub mod console;
pub mod crypto;
pub mod device;
pub mod error;
pub mod hub;
pub mod lifecycle;
pub mod listener;
pub mod migration;
pub mod provisioning;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use command::{CommandHandler, CommandKey, CommandRequest, CommandResponse};
pub use config::{DeviceIdentity, Settings};
pub use device::Device;
pub use error::{DeviceError, Result};
pub use hub::MqttHubConnector;
pub use lifecycle::{Coordinator, LifecycleState};
pub use migration::MigrationHandler;
pub use provisioning::DpsProvisioner;
pub use session::{ConnectionState, Session};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version() -> &'static str {
    VERSION
}
