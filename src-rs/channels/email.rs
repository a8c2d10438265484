use super::Channel;
use crate::config::{SmtpConfig, SmtpSecurity};
use crate::error::{FailureReason, MailError, SkipReason};
use crate::metrics::MetricsSummary;
use crate::model::{Artifact, ChannelKind, Delivery, Recipient};
use crate::render::{EmailTemplate, SIGNATURE_CID};
use crate::util::content_type_for;
use anyhow::{anyhow, bail, Result};
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, Message, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, SmtpTransport, Transport};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct MailPart {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// A fully rendered message, independent of the transport.
#[derive(Debug, Clone)]
pub struct OutgoingMail {
    pub from: Mailbox,
    pub to: Mailbox,
    pub subject: String,
    pub html: String,
    pub attachment: MailPart,
    pub inline_image: Option<MailPart>,
}

impl OutgoingMail {
    /// `mixed[ related[ html, inline image ], attachment ]`.
    pub fn to_message(&self) -> Result<Message, MailError> {
        let content_type = |raw: &str| {
            ContentType::parse(raw).map_err(|err| MailError(format!("invalid content type {raw}: {err}")))
        };

        let html = SinglePart::html(self.html.clone());
        let body = match &self.inline_image {
            Some(image) => MultiPart::related().singlepart(html).singlepart(
                Attachment::new_inline(SIGNATURE_CID.to_string())
                    .body(image.bytes.clone(), content_type(&image.content_type)?),
            ),
            None => MultiPart::related().singlepart(html),
        };
        let attachment = Attachment::new(self.attachment.file_name.clone()).body(
            self.attachment.bytes.clone(),
            content_type(&self.attachment.content_type)?,
        );

        Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(self.subject.clone())
            .multipart(MultiPart::mixed().multipart(body).singlepart(attachment))
            .map_err(|err| MailError(format!("failed to build message: {err}")))
    }
}

pub trait MailTransport: Send + Sync {
    /// Submits one message; returns the server's response text.
    fn send(&self, mail: &OutgoingMail) -> Result<String, MailError>;
}

pub struct SmtpMailer {
    transport: SmtpTransport,
}

impl SmtpMailer {
    pub fn new(config: &SmtpConfig, password: String) -> Result<Self> {
        let builder = match config.security {
            SmtpSecurity::Tls => SmtpTransport::relay(&config.host)?,
            SmtpSecurity::Starttls => SmtpTransport::starttls_relay(&config.host)?,
        };
        let port = config.port.unwrap_or(match config.security {
            SmtpSecurity::Tls => 465,
            SmtpSecurity::Starttls => 587,
        });
        let transport = builder
            .port(port)
            .credentials(Credentials::new(config.username.clone(), password))
            .timeout(Some(Duration::from_secs(config.timeout_secs)))
            .build();
        Ok(Self { transport })
    }
}

impl MailTransport for SmtpMailer {
    fn send(&self, mail: &OutgoingMail) -> Result<String, MailError> {
        let message = mail.to_message()?;
        let response = self
            .transport
            .send(&message)
            .map_err(|err| MailError(err.to_string()))?;
        Ok(response.message().collect::<Vec<_>>().join(" "))
    }
}

pub struct EmailChannel {
    name: String,
    recipients: Vec<Recipient>,
    from: Mailbox,
    template: EmailTemplate,
    signature_image: Option<PathBuf>,
    transport: Arc<dyn MailTransport>,
}

impl EmailChannel {
    pub fn new(
        name: impl Into<String>,
        recipients: Vec<Recipient>,
        from: Mailbox,
        template: EmailTemplate,
        signature_image: Option<PathBuf>,
        transport: Arc<dyn MailTransport>,
    ) -> Self {
        Self {
            name: name.into(),
            recipients,
            from,
            template,
            signature_image,
            transport,
        }
    }

    fn signature_part(&self) -> Option<MailPart> {
        let path = self.signature_image.as_ref()?;
        match fs::read(path) {
            Ok(bytes) => Some(MailPart {
                file_name: path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| SIGNATURE_CID.to_string()),
                content_type: content_type_for(path).to_string(),
                bytes,
            }),
            Err(err) => {
                debug!(path = %path.display(), error = %err, "signature image not attached");
                None
            }
        }
    }
}

impl Channel for EmailChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Email
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
        summary: &MetricsSummary,
    ) -> Result<Delivery> {
        let Recipient::Contact {
            display_name,
            address,
        } = recipient
        else {
            bail!("email needs a contact recipient, got {recipient}");
        };
        if !artifact.is_present() {
            return Ok(Delivery::skipped(SkipReason::ArtifactMissing));
        }

        let email: Address = address
            .parse()
            .map_err(|err| anyhow!("invalid recipient address {address}: {err}"))?;
        let bytes = match fs::read(&artifact.path) {
            Ok(bytes) => bytes,
            Err(_) if !artifact.is_present() => {
                return Ok(Delivery::skipped(SkipReason::ArtifactMissing))
            }
            Err(err) => {
                return Ok(Delivery::failed(FailureReason::Transport(format!(
                    "failed to read artifact: {err}"
                ))))
            }
        };

        let inline_image = self.signature_part();
        let mail = OutgoingMail {
            from: self.from.clone(),
            to: Mailbox::new(Some(display_name.clone()), email),
            subject: self.template.subject(&summary.report_date),
            html: self
                .template
                .html(&summary.report_date, inline_image.is_some()),
            attachment: MailPart {
                file_name: artifact.file_name(),
                content_type: content_type_for(&artifact.path).to_string(),
                bytes,
            },
            inline_image,
        };

        match self.transport.send(&mail) {
            Ok(response) => Ok(Delivery::success(format!("sent to {address}: {response}"))),
            Err(err) => {
                warn!(recipient = %address, error = %err, "mail submission failed");
                Ok(Delivery::failed(FailureReason::Transport(err.to_string())))
            }
        }
    }
}
