use super::Channel;
use crate::config::{secret, CloudUploadConfig};
use crate::error::{SkipReason, UploadError};
use crate::metrics::MetricsSummary;
use crate::model::{Artifact, ChannelKind, Delivery, Recipient};
use anyhow::{bail, Result};
use reqwest::blocking::{Client, Response};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, LOCATION};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub trait UploadTransport: Send + Sync {
    /// Uploads `file` as `name` into `folder`; returns the remote file id.
    fn upload(&self, file: &Path, name: &str, folder: &str) -> Result<String, UploadError>;
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "TokenResponse::default_expires_in")]
    expires_in: u64,
}

impl TokenResponse {
    fn default_expires_in() -> u64 {
        3600
    }
}

#[derive(Debug, Deserialize)]
struct UploadedFile {
    id: String,
}

/// OAuth client credentials plus the long-lived refresh token.
#[derive(Debug, Clone)]
pub struct DriveCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
}

impl DriveCredentials {
    pub fn from_env(config: &CloudUploadConfig) -> Result<Self> {
        Ok(Self {
            client_id: secret(&config.client_id_env)?,
            client_secret: secret(&config.client_secret_env)?,
            refresh_token: secret(&config.refresh_token_env)?,
        })
    }
}

/// Google Drive: refresh-token grant, then a two-step resumable upload.
pub struct DriveUploader {
    client: Client,
    client_id: String,
    client_secret: String,
    refresh_token: String,
    token_url: String,
    upload_url: String,
    mime_type: String,
    token: Mutex<Option<CachedToken>>,
}

fn rejected(status: StatusCode) -> bool {
    matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)
}

/// The token endpoint answers 400 `invalid_grant` for a revoked refresh token.
/// Other failures (5xx, 429) are the service's problem, not the credentials'.
fn token_rejected(status: StatusCode) -> bool {
    status == StatusCode::BAD_REQUEST || rejected(status)
}

fn body_text(response: Response) -> String {
    response
        .text()
        .unwrap_or_default()
        .chars()
        .take(300)
        .collect()
}

impl DriveUploader {
    pub fn from_config(config: &CloudUploadConfig) -> Result<Self> {
        Self::with_credentials(config, DriveCredentials::from_env(config)?)
    }

    pub fn with_credentials(config: &CloudUploadConfig, credentials: DriveCredentials) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            client_id: credentials.client_id,
            client_secret: credentials.client_secret,
            refresh_token: credentials.refresh_token,
            token_url: config.token_url.clone(),
            upload_url: config.upload_url.clone(),
            mime_type: config.mime_type.clone(),
            token: Mutex::new(None),
        })
    }

    fn access_token(&self) -> Result<String, UploadError> {
        let mut cached = self
            .token
            .lock()
            .map_err(|_| UploadError::Transport("token cache poisoned".to_string()))?;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() + Duration::from_secs(60) {
                return Ok(token.value.clone());
            }
        }

        debug!(url = %self.token_url, "refreshing access token");
        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", self.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .map_err(|err| UploadError::Transport(format!("token request failed: {err}")))?;
        let status = response.status();
        if token_rejected(status) {
            return Err(UploadError::Auth(format!(
                "token refresh rejected ({status}): {}",
                body_text(response)
            )));
        }
        if !status.is_success() {
            return Err(UploadError::Transport(format!(
                "token endpoint failed ({status}): {}",
                body_text(response)
            )));
        }
        let token: TokenResponse = response
            .json()
            .map_err(|err| UploadError::Auth(format!("unreadable token response: {err}")))?;
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        });
        Ok(token.access_token)
    }

    fn forget_token(&self) {
        if let Ok(mut cached) = self.token.lock() {
            *cached = None;
        }
    }

    fn start_session(&self, token: &str, name: &str, folder: &str, size: usize) -> Result<String, UploadError> {
        let response = self
            .client
            .post(format!("{}?uploadType=resumable&fields=id", self.upload_url))
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .header("X-Upload-Content-Type", &self.mime_type)
            .header("X-Upload-Content-Length", size.to_string())
            .json(&json!({"name": name, "parents": [folder]}))
            .send()
            .map_err(|err| UploadError::Transport(format!("session request failed: {err}")))?;
        let status = response.status();
        if rejected(status) {
            self.forget_token();
            return Err(UploadError::Auth(format!(
                "upload session rejected ({status}): {}",
                body_text(response)
            )));
        }
        if !status.is_success() {
            return Err(UploadError::Transport(format!(
                "upload session failed ({status}): {}",
                body_text(response)
            )));
        }
        response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| UploadError::Transport("upload session has no Location header".to_string()))
    }
}

impl UploadTransport for DriveUploader {
    fn upload(&self, file: &Path, name: &str, folder: &str) -> Result<String, UploadError> {
        let bytes = fs::read(file).map_err(|err| {
            UploadError::Transport(format!("failed to read {}: {err}", file.display()))
        })?;
        let token = self.access_token()?;
        let session = self.start_session(&token, name, folder, bytes.len())?;

        let response = self
            .client
            .put(&session)
            .header(CONTENT_TYPE, &self.mime_type)
            .body(bytes)
            .send()
            .map_err(|err| UploadError::Transport(format!("upload failed: {err}")))?;
        let status = response.status();
        if rejected(status) {
            self.forget_token();
            return Err(UploadError::Auth(format!(
                "upload rejected ({status}): {}",
                body_text(response)
            )));
        }
        if !status.is_success() {
            return Err(UploadError::Transport(format!(
                "upload failed ({status}): {}",
                body_text(response)
            )));
        }
        let uploaded: UploadedFile = response
            .json()
            .map_err(|err| UploadError::Transport(format!("unreadable upload response: {err}")))?;
        Ok(uploaded.id)
    }
}

pub struct CloudUploadChannel {
    name: String,
    recipients: Vec<Recipient>,
    transport: Arc<dyn UploadTransport>,
}

impl CloudUploadChannel {
    pub fn new(
        name: impl Into<String>,
        recipients: Vec<Recipient>,
        transport: Arc<dyn UploadTransport>,
    ) -> Self {
        Self {
            name: name.into(),
            recipients,
            transport,
        }
    }
}

impl Channel for CloudUploadChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::CloudUpload
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn recipients(&self) -> &[Recipient] {
        &self.recipients
    }

    fn deliver(
        &self,
        artifact: &Artifact,
        recipient: &Recipient,
        _summary: &MetricsSummary,
    ) -> Result<Delivery> {
        let Recipient::Destination { id: folder } = recipient else {
            bail!("cloud upload needs a folder id, got {recipient}");
        };
        if !artifact.is_present() {
            return Ok(Delivery::skipped(SkipReason::ArtifactMissing));
        }

        match self
            .transport
            .upload(&artifact.path, &artifact.file_name(), folder)
        {
            Ok(file_id) => {
                info!(folder = %folder, file_id = %file_id, "artifact uploaded");
                Ok(Delivery::success(format!("file id {file_id}")))
            }
            Err(err) => {
                warn!(folder = %folder, error = %err, "upload failed");
                Ok(Delivery::failed(err.into()))
            }
        }
    }
}
