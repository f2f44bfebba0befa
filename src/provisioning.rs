//! Device Provisioning Service (DPS) registration over its REST interface.

use crate::config::DeviceIdentity;
use crate::crypto::{DEFAULT_TOKEN_TTL, SasSigner};
use crate::error::{DeviceError, Result};
use crate::transport::{Provisioner, RegistrationResult, RegistrationStatus};
use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::header::{AUTHORIZATION, RETRY_AFTER};
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::json;
use tokio::time::{Duration, sleep};

const API_VERSION: &str = "2019-03-31";
const SAS_KEY_NAME: &str = "registration";

const POLL_INTERVAL: Duration = Duration::from_secs(3);
const MAX_POLLS: u32 = 20;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationStatus {
    operation_id: Option<String>,
    status: RegistrationStatus,
    registration_state: Option<RegistrationState>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationState {
    assigned_hub: Option<String>,
    device_id: Option<String>,
    error_message: Option<String>,
}

impl OperationStatus {
    fn into_result(self) -> RegistrationResult {
        let state = self.registration_state;
        if let Some(msg) = state.as_ref().and_then(|s| s.error_message.as_deref()) {
            warn!("Provisioning service reported: {}", msg);
        }
        RegistrationResult {
            status: self.status,
            assigned_hub: state.as_ref().and_then(|s| s.assigned_hub.clone()),
            device_id: state.and_then(|s| s.device_id),
        }
    }
}

/// Registers devices with a provisioning endpoint using symmetric key auth.
pub struct DpsProvisioner {
    host: String,
    client: Client,
    poll_interval: Duration,
}

impl DpsProvisioner {
    pub fn new<H: Into<String>>(host: H) -> Self {
        Self {
            host: host.into(),
            client: Client::new(),
            poll_interval: POLL_INTERVAL,
        }
    }

    fn registration_url(&self, identity: &DeviceIdentity) -> String {
        format!(
            "https://{}/{}/registrations/{}",
            self.host,
            identity.scope_id,
            urlencoding::encode(&identity.registration_id)
        )
    }

    fn auth_token(&self, identity: &DeviceIdentity) -> Result<String> {
        let resource = format!(
            "{}/registrations/{}",
            identity.scope_id, identity.registration_id
        );
        SasSigner::new(&identity.symmetric_key)?.token_from_now(
            &resource,
            Some(SAS_KEY_NAME),
            DEFAULT_TOKEN_TTL,
        )
    }

    async fn read_status(response: Response) -> Result<(OperationStatus, Option<Duration>)> {
        let code = response.status();
        if !code.is_success() {
            warn!("Provisioning service returned {}", code);
            let body = response.text().await.unwrap_or_default();
            return Err(DeviceError::Provisioning(format!("({}) {}", code, body)));
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);

        let status = response
            .json::<OperationStatus>()
            .await
            .map_err(|e| DeviceError::Provisioning(format!("malformed response: {}", e)))?;
        Ok((status, retry_after))
    }
}

#[async_trait]
impl Provisioner for DpsProvisioner {
    async fn register(&self, identity: &DeviceIdentity) -> Result<RegistrationResult> {
        let base = self.registration_url(identity);
        let token = self.auth_token(identity)?;

        debug!(
            "Registering {} with {} (scope {})",
            identity.registration_id, self.host, identity.scope_id
        );
        let response = self
            .client
            .put(format!("{}/register?api-version={}", base, API_VERSION))
            .header(AUTHORIZATION, &token)
            .timeout(REQUEST_TIMEOUT)
            .json(&json!({ "registrationId": identity.registration_id }))
            .send()
            .await
            .map_err(|e| DeviceError::Provisioning(e.to_string()))?;

        let (mut operation, mut retry_after) = Self::read_status(response).await?;

        let mut polls = 0;
        while operation.status == RegistrationStatus::Assigning {
            if polls >= MAX_POLLS {
                return Err(DeviceError::Provisioning(format!(
                    "registration still assigning after {} polls",
                    MAX_POLLS
                )));
            }
            polls += 1;

            let operation_id = operation.operation_id.clone().ok_or_else(|| {
                DeviceError::Provisioning("assigning response without operationId".to_string())
            })?;

            sleep(retry_after.unwrap_or(self.poll_interval)).await;
            debug!("Polling registration operation {} ({})", operation_id, polls);

            let response = self
                .client
                .get(format!(
                    "{}/operations/{}?api-version={}",
                    base, operation_id, API_VERSION
                ))
                .header(AUTHORIZATION, &token)
                .timeout(REQUEST_TIMEOUT)
                .send()
                .await
                .map_err(|e| DeviceError::Provisioning(e.to_string()))?;

            (operation, retry_after) = Self::read_status(response).await?;
        }

        info!(
            "Registration of {} finished with status {:?}",
            identity.registration_id, operation.status
        );
        Ok(operation.into_result())
    }
}
