use dpsmove::{
    Coordinator, Device, DeviceIdentity, DpsProvisioner, MigrationHandler, MqttHubConnector,
    Settings, config, console,
};
use log::{debug, error, info, warn};
use std::process::ExitCode;
use std::sync::Arc;

fn load_config() -> dpsmove::Result<(DeviceIdentity, Settings)> {
    Ok((DeviceIdentity::from_env()?, Settings::from_env()?))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // Read before the logger exists so RUST_LOG can come from the file.
    let env_file = config::load_env_file();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    match env_file {
        Ok(Some(path)) => debug!("Loaded {}", path.display()),
        Ok(None) => {}
        Err(e) => warn!("Ignoring {}", e),
    }

    let (identity, settings) = match load_config() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    info!(
        "dpsmove {} starting as {} in scope {}",
        dpsmove::version(),
        identity.registration_id,
        identity.scope_id
    );

    let device = Device::new(
        identity,
        Arc::new(DpsProvisioner::new(settings.provisioning_host.clone())),
        Arc::new(MqttHubConnector),
    );
    let coordinator = Coordinator::new(
        device,
        Arc::new(MigrationHandler),
        settings.telemetry_interval,
    );

    match coordinator.run(console::quit_signal()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Device stopped with error: {}", e);
            ExitCode::FAILURE
        }
    }
}
