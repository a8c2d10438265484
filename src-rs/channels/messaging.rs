use super::Channel;
use crate::error::FailureReason;
use crate::metrics::{ExpectedModality, MetricsSummary};
use crate::model::{Artifact, ChannelKind, Delivery, Recipient};
use crate::render::{fill, MessageTemplate};
use crate::visual_loop::{LoopOutcome, ScreenTarget, VisualActionLoop};
use anyhow::{bail, Result};
use chrono::{Local, Timelike};
use image::DynamicImage;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Everything a messaging channel needs besides the loop itself.
pub struct MessagingSpec {
    pub name: String,
    pub recipients: Vec<Recipient>,
    pub deep_link: String,
    pub message: MessageTemplate,
    pub expected_modalities: Vec<ExpectedModality>,
    pub template: Arc<DynamicImage>,
    pub template_path: PathBuf,
    pub confidence: f64,
    pub search_deadline: Duration,
}

/// Sends a per-recipient chat message by opening a deep link and clicking
/// the send control. The artifact itself is not transferred.
pub struct MessagingChannel {
    spec: MessagingSpec,
    visual: VisualActionLoop,
    hour_of_day: fn() -> u32,
}

fn local_hour() -> u32 {
    Local::now().hour()
}

/// `{phone}` gets the address without `+`, spaces or separators and
/// `{text}` the percent-encoded message.
pub fn deep_link(template: &str, address: &str, text: &str) -> String {
    let phone: String = address
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '+' | '-' | '(' | ')' | '.'))
        .collect();
    let encoded = urlencoding::encode(text);
    fill(template, &[("phone", &phone), ("text", &encoded)])
}

impl MessagingChannel {
    pub fn new(spec: MessagingSpec, visual: VisualActionLoop) -> Self {
        Self {
            spec,
            visual,
            hour_of_day: local_hour,
        }
    }

    pub fn render(&self, summary: &MetricsSummary, display_name: &str) -> String {
        self.spec.message.render(
            summary,
            &self.spec.expected_modalities,
            display_name,
            (self.hour_of_day)(),
        )
    }

    fn target(&self) -> ScreenTarget {
        ScreenTarget {
            template: self.spec.template.clone(),
            template_path: self.spec.template_path.clone(),
            confidence: self.spec.confidence,
            search_deadline: self.spec.search_deadline,
        }
    }
}

impl Channel for MessagingChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Messaging
    }

    fn name(&self) -> &str {
        &self.spec.name
    }

    fn recipients(&self) -> &[Recipient] {
        &self.spec.recipients
    }

    fn requires_foreground(&self) -> bool {
        true
    }

    fn deliver(
        &self,
        _artifact: &Artifact,
        recipient: &Recipient,
        summary: &MetricsSummary,
    ) -> Result<Delivery> {
        let Recipient::Contact {
            display_name,
            address,
        } = recipient
        else {
            bail!("messaging needs a contact recipient, got {recipient}");
        };

        let text = self.render(summary, display_name);
        let link = deep_link(&self.spec.deep_link, address, &text);
        info!(recipient = %display_name, chars = text.chars().count(), "sending message");

        let run = self.visual.run(&link, &self.target());
        debug!(recipient = %display_name, trace = ?run.trace, attempts = run.attempts, "visual loop finished");
        let delivery = match run.outcome {
            LoopOutcome::Clicked {
                region,
                score,
                elapsed_ms,
            } => {
                let (x, y) = region.center();
                Delivery::success(format!(
                    "clicked ({x}, {y}) score {score:.3} after {elapsed_ms}ms"
                ))
            }
            LoopOutcome::Fallback {
                elapsed_ms,
                attempts,
            } => {
                warn!(recipient = %display_name, attempts, "target not found, sent with fallback key");
                Delivery::fallback(format!(
                    "pressed {} after {elapsed_ms}ms and {attempts} attempts",
                    self.visual.settings().fallback_key
                ))
            }
            LoopOutcome::Failed { reason } => {
                Delivery::failed(FailureReason::Interaction(reason))
            }
        };
        Ok(delivery)
    }
}
