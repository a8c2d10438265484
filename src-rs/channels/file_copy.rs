use super::Channel;
use crate::error::{FailureReason, SkipReason};
use crate::metrics::MetricsSummary;
use crate::model::{Artifact, ChannelKind, Delivery, Recipient};
use crate::util::is_locked;
use anyhow::{bail, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Copies the artifact into each destination directory.
pub struct FileCopyChannel {
    name: String,
    recipients: Vec<Recipient>,
}

impl FileCopyChannel {
    pub fn new(name: impl Into<String>, recipients: Vec<Recipient>) -> Self {
        Self {
            name: name.into(),
            recipients,
        }
    }
}

fn io_failure(err: &io::Error, path: &Path) -> Delivery {
    if is_locked(err) {
        warn!(path = %path.display(), error = %err, "destination locked");
        Delivery::failed(FailureReason::PermissionDenied(format!(
            "{} is locked or not writable: {err}",
            path.display()
        )))
    } else {
        Delivery::failed(FailureReason::Transport(format!(
            "failed to write {}: {err}",
            path.display()
        )))
    }
}

impl Channel for FileCopyChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::FileCopy
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
        let Recipient::Destination { id } = recipient else {
            bail!("file copy needs a destination directory, got {recipient}");
        };
        if !artifact.is_present() {
            return Ok(Delivery::skipped(SkipReason::ArtifactMissing));
        }

        let dir = PathBuf::from(id);
        if let Err(err) = fs::create_dir_all(&dir) {
            return Ok(io_failure(&err, &dir));
        }
        let target = dir.join(artifact.file_name());
        match fs::copy(&artifact.path, &target) {
            Ok(bytes) => Ok(Delivery::success(format!(
                "copied {bytes} bytes to {}",
                target.display()
            ))),
            Err(err) if err.kind() == io::ErrorKind::NotFound && !artifact.is_present() => {
                Ok(Delivery::skipped(SkipReason::ArtifactMissing))
            }
            Err(err) => Ok(io_failure(&err, &target)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Outcome;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn summary() -> MetricsSummary {
        MetricsSummary {
            report_date: "19/10/2026".to_string(),
            modalities: BTreeMap::new(),
            available: false,
        }
    }

    #[test]
    fn copies_into_missing_destination() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("20261019_report.xlsx");
        fs::write(&source, b"sheet").unwrap();
        let dest = dir.path().join("public").join("reports");
        let recipient = Recipient::destination(dest.display().to_string());
        let channel = FileCopyChannel::new("share", vec![recipient.clone()]);

        let delivery = channel
            .deliver(&Artifact::observe(&source), &recipient, &summary())
            .unwrap();

        assert_eq!(delivery.outcome, Outcome::Success);
        assert_eq!(fs::read(dest.join("20261019_report.xlsx")).unwrap(), b"sheet");
    }

    #[test]
    fn absent_artifact_is_skipped() {
        let dir = tempdir().unwrap();
        let recipient = Recipient::destination(dir.path().join("out").display().to_string());
        let channel = FileCopyChannel::new("share", vec![recipient.clone()]);

        let delivery = channel
            .deliver(
                &Artifact::observe(&dir.path().join("missing.xlsx")),
                &recipient,
                &summary(),
            )
            .unwrap();

        assert_eq!(delivery.outcome, Outcome::Skipped(SkipReason::ArtifactMissing));
        assert!(!dir.path().join("out").exists());
    }

    #[test]
    fn destination_blocked_by_a_file_is_a_transport_failure() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("report.xlsx");
        fs::write(&source, b"sheet").unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, b"").unwrap();
        let recipient = Recipient::destination(blocker.display().to_string());
        let channel = FileCopyChannel::new("share", vec![recipient.clone()]);

        let delivery = channel
            .deliver(&Artifact::observe(&source), &recipient, &summary())
            .unwrap();

        assert!(matches!(
            delivery.outcome,
            Outcome::Failed(FailureReason::Transport(_))
        ));
    }

    #[test]
    fn lock_errors_map_to_permission_denied() {
        let err = io::Error::from(io::ErrorKind::PermissionDenied);
        let delivery = io_failure(&err, Path::new("/mnt/public/report.xlsx"));
        assert!(matches!(
            delivery.outcome,
            Outcome::Failed(FailureReason::PermissionDenied(_))
        ));
    }

    #[test]
    fn contact_recipient_is_rejected() {
        let dir = tempdir().unwrap();
        let channel = FileCopyChannel::new("share", Vec::new());
        let result = channel.deliver(
            &Artifact::observe(&dir.path().join("r.xlsx")),
            &Recipient::contact("Ana", "ana@example.org"),
            &summary(),
        );
        assert!(result.is_err());
    }
}
