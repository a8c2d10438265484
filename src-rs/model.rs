use crate::error::{FailureReason, SkipReason};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// The generated report file. Observed once after generation and never mutated.
#[derive(Debug, Clone, Serialize)]
pub struct Artifact {
    pub path: PathBuf,
    pub created_at: Option<DateTime<Utc>>,
    pub size_bytes: Option<u64>,
}

impl Artifact {
    pub fn observe(path: &Path) -> Self {
        match fs::metadata(path) {
            Ok(meta) if meta.is_file() => Self {
                path: path.to_path_buf(),
                created_at: meta.modified().ok().map(DateTime::<Utc>::from),
                size_bytes: Some(meta.len()),
            },
            _ => Self {
                path: path.to_path_buf(),
                created_at: None,
                size_bytes: None,
            },
        }
    }

    /// Checked live on every call; channels must not trust the observation time.
    pub fn is_present(&self) -> bool {
        self.path.is_file()
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("report")
            .to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    FileCopy,
    Email,
    CloudUpload,
    Messaging,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ChannelKind::FileCopy => "file_copy",
            ChannelKind::Email => "email",
            ChannelKind::CloudUpload => "cloud_upload",
            ChannelKind::Messaging => "messaging",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Recipient {
    /// Email and messaging targets.
    Contact {
        display_name: String,
        address: String,
    },
    /// Directory for file copies, folder id for cloud uploads.
    Destination { id: String },
}

impl Recipient {
    pub fn contact(display_name: impl Into<String>, address: impl Into<String>) -> Self {
        Recipient::Contact {
            display_name: display_name.into(),
            address: address.into(),
        }
    }

    pub fn destination(id: impl Into<String>) -> Self {
        Recipient::Destination { id: id.into() }
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recipient::Contact {
                display_name,
                address,
            } => write!(f, "{display_name} <{address}>"),
            Recipient::Destination { id } => f.write_str(id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    /// Delivered through the fallback key action; the target was never seen.
    SuccessWithFallback,
    Skipped(SkipReason),
    Failed(FailureReason),
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => f.write_str("success"),
            Outcome::SuccessWithFallback => f.write_str("success (fallback)"),
            Outcome::Skipped(reason) => write!(f, "skipped: {reason}"),
            Outcome::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// What a channel reports for one recipient, before the orchestrator stamps it.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub outcome: Outcome,
    pub detail: Option<String>,
}

impl Delivery {
    pub fn success(detail: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Success,
            detail: Some(detail.into()),
        }
    }

    pub fn fallback(detail: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::SuccessWithFallback,
            detail: Some(detail.into()),
        }
    }

    pub fn skipped(reason: SkipReason) -> Self {
        Self {
            outcome: Outcome::Skipped(reason),
            detail: None,
        }
    }

    pub fn failed(reason: FailureReason) -> Self {
        Self {
            outcome: Outcome::Failed(reason),
            detail: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryResult {
    pub channel: ChannelKind,
    pub channel_name: String,
    pub recipient: Recipient,
    pub outcome: Outcome,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl DeliveryResult {
    pub fn record(
        channel: ChannelKind,
        channel_name: &str,
        recipient: &Recipient,
        delivery: Delivery,
    ) -> Self {
        Self {
            channel,
            channel_name: channel_name.to_string(),
            recipient: recipient.clone(),
            outcome: delivery.outcome,
            detail: delivery.detail,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupSummary {
    pub removed: usize,
    pub locked: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub artifact: Artifact,
    pub metrics_available: bool,
    pub cleanup: CleanupSummary,
    pub results: Vec<DeliveryResult>,
}

impl RunReport {
    pub fn failed_count(&self) -> usize {
        self.results
            .iter()
            .filter(|result| result.outcome.is_failure())
            .count()
    }

    pub fn has_failures(&self) -> bool {
        self.failed_count() > 0
    }

    pub fn count(&self, outcome: &Outcome) -> usize {
        self.results
            .iter()
            .filter(|result| &result.outcome == outcome)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn artifact_observation_reads_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("20261019_report.xlsx");
        fs::write(&path, b"12345").unwrap();
        let artifact = Artifact::observe(&path);
        assert_eq!(artifact.size_bytes, Some(5));
        assert!(artifact.created_at.is_some());
        assert!(artifact.is_present());
        assert_eq!(artifact.file_name(), "20261019_report.xlsx");
    }

    #[test]
    fn missing_artifact_has_no_metadata() {
        let dir = tempdir().unwrap();
        let artifact = Artifact::observe(&dir.path().join("absent.xlsx"));
        assert_eq!(artifact.size_bytes, None);
        assert!(!artifact.is_present());
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let failed = Outcome::Failed(FailureReason::PermissionDenied("locked".to_string()));
        assert_eq!(
            serde_json::to_value(&failed).unwrap(),
            json!({"status": "failed", "reason": {"kind": "permission_denied", "message": "locked"}})
        );
        assert_eq!(
            serde_json::to_value(Outcome::SuccessWithFallback).unwrap(),
            json!({"status": "success_with_fallback"})
        );
        assert_eq!(
            serde_json::to_value(Outcome::Skipped(SkipReason::Timeout)).unwrap(),
            json!({"status": "skipped", "reason": "timeout"})
        );
    }
}
