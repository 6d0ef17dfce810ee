use std::{io::Read, time::Duration};

use anyhow::Context;
use log::{debug, warn};
use reqwest::{
    blocking::{Client, Response},
    header::{CONTENT_LENGTH, RANGE},
    StatusCode,
};
use serde::Deserialize;
use url::Url;

use hawser_api::{
    config::Config,
    constants::MIN_SENDING_ATTEMPTS,
    deployment::{ArtifactInfo, DeploymentStatus, UpdateInfo},
    error::{DeploymentAborted, UpdateError},
};

use crate::{controlmap::UpdateControlMap, deplog::LogEntry};

pub mod auth;
pub mod inventory;

pub use inventory::InventoryAttribute;

const DEPLOYMENTS_NEXT: &str = "api/devices/v1/deployments/device/deployments/next";
const DEPLOYMENTS_BASE: &str = "api/devices/v1/deployments/device/deployments";
const INVENTORY_ATTRIBUTES: &str = "api/devices/v1/inventory/device/attributes";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not authorized by the server")]
    Unauthorized,

    #[error("deployment was aborted on the server")]
    Aborted,

    #[error("server answered with unexpected status {status}")]
    Status { status: StatusCode },

    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed server response: {0}")]
    Schema(#[from] serde_json::Error),
}

impl ApiError {
    /// Whether retrying the same request later can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Unauthorized | ApiError::Aborted | ApiError::Schema(_) => false,
            ApiError::Transport(_) => true,
            ApiError::Status { status } => {
                status.is_server_error()
                    || *status == StatusCode::REQUEST_TIMEOUT
                    || *status == StatusCode::TOO_MANY_REQUESTS
            }
        }
    }
}

impl From<ApiError> for UpdateError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Aborted => {
                UpdateError::fatal(anyhow::Error::from(DeploymentAborted).context("reporting status"))
            }
            e if e.is_transient() => UpdateError::transient(e),
            e => UpdateError::fatal(e),
        }
    }
}

/// What the server answered to an update check.
#[derive(Debug)]
pub struct CheckUpdateResponse {
    pub update: UpdateInfo,
    pub control_map: Option<UpdateControlMap>,
}

/// A fetched artifact stream with its declared size, possibly resumed.
pub struct FetchResult {
    pub reader: Box<dyn Read + Send>,
    /// Total size of the artifact in bytes.
    pub size: u64,
    /// Offset the stream starts at; 0 unless the server honored a range.
    pub resume_from: u64,
}

/// Blocking client for the deployment server endpoints the update flow
/// talks to. Authentication tokens are minted by the auth manager and
/// installed here by the Authorize state.
pub struct ApiClient {
    base: Url,
    http: Client,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(config: &Config) -> Result<Self, anyhow::Error> {
        Ok(Self {
            base: config.server_url.clone(),
            http: Client::builder()
                .timeout(config.http_timeout())
                .build()
                .context("Failed to construct HTTP client")?,
            token: None,
        })
    }

    pub fn set_token(&mut self, token: Option<String>) {
        self.token = token;
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        self.base.join(path).map_err(|_| ApiError::Status {
            status: StatusCode::BAD_REQUEST,
        })
    }

    fn authorized(
        &self,
        req: reqwest::blocking::RequestBuilder,
    ) -> reqwest::blocking::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    /// Asks the server whether a deployment is pending for this device.
    /// `Ok(None)` means the device is up to date.
    pub fn check_update(
        &self,
        device_type: &str,
        artifact_name: &str,
    ) -> Result<Option<CheckUpdateResponse>, ApiError> {
        let mut url = self.endpoint(DEPLOYMENTS_NEXT)?;
        url.query_pairs_mut()
            .append_pair("device_type", device_type)
            .append_pair("artifact_name", artifact_name);

        debug!("Checking for deployments ({url})");
        let response = self.authorized(self.http.get(url)).send()?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(None),
            StatusCode::UNAUTHORIZED => Err(ApiError::Unauthorized),
            status if status.is_success() => {
                #[derive(Deserialize)]
                struct NextDeployment {
                    id: String,
                    artifact: ArtifactInfo,
                    uri: String,
                    #[serde(default)]
                    update_control_map: Option<UpdateControlMap>,
                }

                let next: NextDeployment = serde_json::from_str(&response.text()?)?;
                Ok(Some(CheckUpdateResponse {
                    update: UpdateInfo {
                        id: next.id,
                        artifact: next.artifact,
                        uri: next.uri,
                        supports_rollback: Default::default(),
                        needs_reboot: Default::default(),
                        reboot_requested: Vec::new(),
                        state_data_store_count: 0,
                        has_db_schema_update: false,
                    },
                    control_map: next.update_control_map,
                }))
            }
            status => Err(ApiError::Status { status }),
        }
    }

    /// Fetches the artifact bytes, resuming from `offset` when the server
    /// supports ranges.
    pub fn fetch_update(&self, uri: &str, offset: u64) -> Result<FetchResult, ApiError> {
        let url = Url::parse(uri).map_err(|_| ApiError::Status {
            status: StatusCode::BAD_REQUEST,
        })?;

        let mut request = self.http.get(url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }

        let response = request.send()?;
        match response.status() {
            StatusCode::UNAUTHORIZED => Err(ApiError::Unauthorized),
            StatusCode::PARTIAL_CONTENT => {
                let remaining = content_length(&response)?;
                Ok(FetchResult {
                    size: offset + remaining,
                    resume_from: offset,
                    reader: Box::new(response),
                })
            }
            status if status.is_success() => {
                if offset > 0 {
                    debug!("Server ignored the range request, restarting download");
                }
                let size = content_length(&response)?;
                Ok(FetchResult {
                    size,
                    resume_from: 0,
                    reader: Box::new(response),
                })
            }
            status => Err(ApiError::Status { status }),
        }
    }

    /// Pushes a deployment status. 409 means the server aborted the
    /// deployment; 401 demands re-authorization.
    pub fn report_status(
        &self,
        deployment_id: &str,
        status: DeploymentStatus,
    ) -> Result<(), ApiError> {
        let url = self.endpoint(&format!("{DEPLOYMENTS_BASE}/{deployment_id}/status"))?;

        debug!("Reporting status '{status}' for deployment '{deployment_id}'");
        let response = self
            .authorized(self.http.put(url))
            .json(&serde_json::json!({ "status": status }))
            .send()?;

        match response.status() {
            StatusCode::UNAUTHORIZED => Err(ApiError::Unauthorized),
            StatusCode::CONFLICT => Err(ApiError::Aborted),
            status if status.is_success() => Ok(()),
            status => Err(ApiError::Status { status }),
        }
    }

    /// Uploads the deployment log, most relevant after a failure.
    pub fn upload_log(
        &self,
        deployment_id: &str,
        messages: &[LogEntry],
    ) -> Result<(), ApiError> {
        let url = self.endpoint(&format!("{DEPLOYMENTS_BASE}/{deployment_id}/log"))?;

        debug!(
            "Uploading {} deployment log messages for '{deployment_id}'",
            messages.len()
        );
        let response = self
            .authorized(self.http.put(url))
            .json(&serde_json::json!({ "messages": messages }))
            .send()?;

        match response.status() {
            StatusCode::UNAUTHORIZED => Err(ApiError::Unauthorized),
            status if status.is_success() => Ok(()),
            status => Err(ApiError::Status { status }),
        }
    }

    /// Replaces the device's inventory attributes.
    pub fn submit_inventory(&self, attributes: &[InventoryAttribute]) -> Result<(), ApiError> {
        let url = self.endpoint(INVENTORY_ATTRIBUTES)?;

        let response = self
            .authorized(self.http.put(url))
            .json(attributes)
            .send()?;

        match response.status() {
            StatusCode::UNAUTHORIZED => Err(ApiError::Unauthorized),
            status if status.is_success() => Ok(()),
            status => {
                warn!("Inventory submission rejected with status {status}");
                Err(ApiError::Status { status })
            }
        }
    }
}

fn content_length(response: &Response) -> Result<u64, ApiError> {
    response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .ok_or(ApiError::Status {
            status: StatusCode::LENGTH_REQUIRED,
        })
}

/// How many times a status or log upload may be attempted: at least
/// `min_retries`, and enough to keep trying through one full poll interval.
pub fn max_sending_attempts(poll: Duration, retry: Duration, min_retries: u32) -> u32 {
    let retry = retry.as_secs().max(1);
    min_retries.max(((poll.as_secs() + retry - 1) / retry) as u32)
}

/// Backoff before download retry `attempt`: a minute, doubling every three
/// attempts, never longer than the configured retry interval cap.
pub fn retry_backoff(attempt: u32, cap: Duration) -> Duration {
    let factor = 1u64 << (attempt / 3).min(10);
    Duration::from_secs(60)
        .checked_mul(factor as u32)
        .unwrap_or(cap)
        .min(cap)
}

/// Default attempt budget for the retry wait states.
pub fn sending_attempts(config: &Config) -> u32 {
    max_sending_attempts(
        config.update_poll_interval(),
        config.retry_poll_interval(),
        MIN_SENDING_ATTEMPTS,
    )
}
