//! Delivery channels.
//!
//! Each channel owns its recipients and maps every expected failure of its
//! external system into an [`Outcome`](crate::model::Outcome). An `Err`
//! returned from [`Channel::deliver`] is treated by the orchestrator as an
//! unexpected failure of that one delivery.

mod cloud;
mod email;
mod file_copy;
mod messaging;

pub use cloud::{CloudUploadChannel, DriveUploader};
pub use email::{EmailChannel, SmtpMailer};
pub use file_copy::FileCopyChannel;
pub use messaging::{deep_link, MessagingChannel, MessagingSpec};

#[cfg(test)]
pub use cloud::UploadTransport;
#[cfg(test)]
pub use email::{MailTransport, OutgoingMail};

use crate::clock::Clock;
use crate::config::{secret, ChannelConfig, DispatchConfig};
use crate::controller::CommandController;
use crate::metrics::MetricsSummary;
use crate::model::{Artifact, ChannelKind, Delivery, Recipient};
use crate::visual_loop::{load_template, VisualActionLoop};
use anyhow::{anyhow, Context, Result};
use lettre::message::Mailbox;
use std::path::Path;
use std::sync::Arc;

pub trait Channel: Send + Sync {
    fn kind(&self) -> ChannelKind;

    /// Configured name, or the kind when none was given.
    fn name(&self) -> &str;

    fn recipients(&self) -> &[Recipient];

    /// Channels that drive the shared display must never run concurrently.
    fn requires_foreground(&self) -> bool {
        false
    }

    fn deliver(
        &self,
        artifact: &Artifact,
        recipient: &Recipient,
        summary: &MetricsSummary,
    ) -> Result<Delivery>;
}

/// Builds every configured channel in order. Secrets and template images are
/// resolved here, so a validated config only fails for IO reasons.
pub fn build_channels(
    config: &DispatchConfig,
    out_dir: &Path,
    clock: Arc<dyn Clock>,
) -> Result<Vec<Box<dyn Channel>>> {
    let mut channels: Vec<Box<dyn Channel>> = Vec::with_capacity(config.channels.len());
    for entry in &config.channels {
        let name = entry.display_name();
        let recipients = entry.recipients();
        let channel: Box<dyn Channel> = match entry {
            ChannelConfig::FileCopy(_) => Box::new(FileCopyChannel::new(name, recipients)),
            ChannelConfig::Email(email) => {
                let password = secret(&email.smtp.password_env)?;
                let mailer = SmtpMailer::new(&email.smtp, password)
                    .with_context(|| format!("channel {name}: failed to set up SMTP"))?;
                let from: Mailbox = email
                    .from
                    .parse()
                    .map_err(|err| anyhow!("channel {name}: invalid from address: {err}"))?;
                Box::new(EmailChannel::new(
                    name,
                    recipients,
                    from,
                    email.template.clone(),
                    email.signature_image.clone(),
                    Arc::new(mailer),
                ))
            }
            ChannelConfig::CloudUpload(cloud) => {
                let uploader = DriveUploader::from_config(cloud)
                    .with_context(|| format!("channel {name}: failed to set up upload client"))?;
                Box::new(CloudUploadChannel::new(name, recipients, Arc::new(uploader)))
            }
            ChannelConfig::Messaging(messaging) => {
                let controller = CommandController::new(&messaging.controller, out_dir.join("captures"))?;
                let settings = messaging
                    .loop_settings()
                    .map_err(|err| anyhow!("channel {name}: {err}"))?;
                let search_deadline = messaging
                    .search_deadline()
                    .map_err(|err| anyhow!("channel {name}: {err}"))?;
                let visual = VisualActionLoop::new(Arc::new(controller), clock.clone(), settings);
                let spec = MessagingSpec {
                    name,
                    recipients,
                    deep_link: messaging.deep_link.clone(),
                    message: config.message.clone(),
                    expected_modalities: config.metrics.expected_modalities.clone(),
                    template: load_template(&messaging.template_image)?,
                    template_path: messaging.template_image.clone(),
                    confidence: messaging.confidence,
                    search_deadline,
                };
                Box::new(MessagingChannel::new(spec, visual))
            }
        };
        channels.push(channel);
    }
    Ok(channels)
}
