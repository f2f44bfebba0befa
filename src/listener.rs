//! Command listener: waits for commands, acknowledges them and dispatches
//! them to a [`CommandHandler`].

use crate::command::{
    CommandHandler, CommandKey, CommandRequest, CommandResponse, STATUS_NOT_FOUND, STATUS_OK,
    UNKNOWN_METHOD,
};
use crate::device::Device;
use crate::error::{DeviceError, Result};
use crate::session::Session;
use log::{debug, error, info, warn};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Runs until cancelled or until the handler reports a fatal error.
///
/// Each accepted command is answered before its handler runs, so the caller
/// always gets a response before the handler can replace the session.
pub async fn run_command_listener(
    device: Device,
    handler: Arc<dyn CommandHandler>,
    cancel: CancellationToken,
) -> Result<()> {
    let key = handler.key();
    match &key {
        Some(k) => info!("Listening for '{}' commands", k),
        None => info!("Listening for all commands"),
    }

    loop {
        // Re-read every time: a handler may have replaced the session.
        let session = device.session().ok_or(DeviceError::NotConnected)?;

        let request = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Command listener cancelled");
                return Ok(());
            }
            request = session.receive_method_request() => request?,
        };

        dispatch(&device, &session, handler.as_ref(), key.as_ref(), request).await?;
    }
}

async fn dispatch(
    device: &Device,
    session: &Session,
    handler: &dyn CommandHandler,
    key: Option<&CommandKey>,
    request: CommandRequest,
) -> Result<()> {
    if let Some(key) = key
        && !key.matches(&request)
    {
        warn!("Received unknown command '{}'", request.name);
        let response = CommandResponse::from_request(
            &request,
            STATUS_NOT_FOUND,
            Value::String(UNKNOWN_METHOD.to_string()),
        );
        if let Err(e) = session.send_method_response(response).await {
            report_ack_failure(&request, e);
        }
        return Ok(());
    }

    info!("Command request '{}' received", request.name);
    match &request.payload {
        None | Some(Value::Null) => info!("Payload was empty."),
        Some(p) => debug!("Payload: {}", p),
    }

    let values = request.values();
    let response_payload = handler.build_response(&values);
    let response = CommandResponse::from_request(&request, STATUS_OK, response_payload);

    match session.send_method_response(response).await {
        Ok(()) => debug!("Response to '{}' sent", request.name),
        Err(e) => report_ack_failure(&request, e),
    }

    match handler.on_command(device, values).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_fatal() => {
            error!("Command '{}' failed: {}", request.name, e);
            Err(e)
        }
        Err(e) => {
            warn!("Command '{}' was not applied: {}", request.name, e);
            Ok(())
        }
    }
}

fn report_ack_failure(request: &CommandRequest, cause: DeviceError) {
    let err = DeviceError::SendAck {
        command: request.name.clone(),
        reason: cause.to_string(),
    };
    error!("{}", err);
}
