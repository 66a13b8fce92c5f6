//! HTTP transport to the central server.
//!
//! Everything the sync layer sends or receives goes through the
//! [`SyncTransport`] trait so the workers can be tested against a scripted
//! server. The real implementation is a thin reqwest client that attaches
//! the facility credential to every request.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{payload::SessionUpload, SyncError};
use crate::definition::DefinitionBundle;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const FACILITY_TOKEN_HEADER: &str = "X-Facility-Token";

/// Version advertisement from the definition endpoint. The checksum, not
/// the version number, decides whether a download is needed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub survey_id: String,
    pub version: u32,
    pub checksum: String,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// Server acknowledgement of a session upload. `duplicate` means the
/// session id was already ingested; the client treats it exactly like a
/// fresh success.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    #[serde(default)]
    pub duplicate: bool,
}

#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn check_version(&self) -> Result<VersionInfo, SyncError>;

    async fn download_definition(&self) -> Result<DefinitionBundle, SyncError>;

    async fn upload_session(&self, payload: &SessionUpload) -> Result<UploadResponse, SyncError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    facility_token: String,
}

impl HttpTransport {
    pub fn new(server_url: &str, facility_token: &str) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: server_url.trim_end_matches('/').to_string(),
            facility_token: facility_token.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// 4xx means the server refused the request and a retry cannot help;
    /// everything else non-2xx is transient.
    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, SyncError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            Err(SyncError::Rejected {
                status: status.as_u16(),
                message,
            })
        } else {
            Err(SyncError::Network(format!(
                "server returned {status}: {message}"
            )))
        }
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn check_version(&self) -> Result<VersionInfo, SyncError> {
        debug!("Checking survey definition version");
        let response = self
            .client
            .get(self.url("/api/v1/definitions/version"))
            .header(FACILITY_TOKEN_HEADER, &self.facility_token)
            .send()
            .await?;
        Ok(Self::check_status(response).await?.json().await?)
    }

    async fn download_definition(&self) -> Result<DefinitionBundle, SyncError> {
        debug!("Downloading survey definition bundle");
        let response = self
            .client
            .get(self.url("/api/v1/definitions/current"))
            .header(FACILITY_TOKEN_HEADER, &self.facility_token)
            .send()
            .await?;
        Ok(Self::check_status(response).await?.json().await?)
    }

    async fn upload_session(&self, payload: &SessionUpload) -> Result<UploadResponse, SyncError> {
        debug!(session_id = %payload.session_id, "Uploading session");
        let response = self
            .client
            .post(self.url("/api/v1/sessions"))
            .header(FACILITY_TOKEN_HEADER, &self.facility_token)
            .json(payload)
            .send()
            .await?;
        Ok(Self::check_status(response).await?.json().await?)
    }
}
