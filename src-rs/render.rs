use crate::metrics::{ExpectedModality, MetricsSummary};
use serde::{Deserialize, Serialize};

/// Content id the email body references for the inline signature image.
pub const SIGNATURE_CID: &str = "signature_img";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Greetings {
    pub morning: String,
    pub afternoon: String,
    pub evening: String,
}

impl Default for Greetings {
    fn default() -> Self {
        Self {
            morning: "GOOD MORNING".to_string(),
            afternoon: "GOOD AFTERNOON".to_string(),
            evening: "GOOD EVENING".to_string(),
        }
    }
}

impl Greetings {
    /// 5-11 morning, 12-17 afternoon, otherwise evening.
    pub fn for_hour(&self, hour: u32) -> &str {
        match hour {
            5..=11 => &self.morning,
            12..=17 => &self.afternoon,
            _ => &self.evening,
        }
    }
}

/// Chat message body. Placeholders: `{greeting}`, `{name}`, `{date}`,
/// `{modalities}`, `{link}`, `{signature}`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MessageTemplate {
    pub body: String,
    /// Per modality: `{modality}`, `{statuses}`, `{regions}`, `{municipalities}`.
    pub modality_block: String,
    /// Per status: `{status}`, `{count}`.
    pub status_line: String,
    pub empty_statuses: String,
    pub separator: String,
    pub link: String,
    pub signature: String,
    pub uppercase_name: bool,
    pub greetings: Greetings,
    /// Modality keys to include; empty means all.
    pub modalities: Vec<String>,
}

impl Default for MessageTemplate {
    fn default() -> Self {
        Self {
            body: "{greeting}, {name}!\n\n\
                   Here is the Daily Report - {date}.\n\n\
                   *MONITORING SUMMARY BY MODALITY:*\n\
                   --------------------------------------\n\
                   {modalities}\
                   --------------------------------------\n\
                   Full report:\n{link}\n\n\
                   Regards,\n{signature}"
                .to_string(),
            modality_block: "*Modality: {modality}*\n{statuses}\
                             {regions} regions and {municipalities} municipalities approved.\n"
                .to_string(),
            status_line: "-> {status}: {count} proposals\n".to_string(),
            empty_statuses: "-> No data available.\n".to_string(),
            separator: "--------------------------------------\n".to_string(),
            link: String::new(),
            signature: "Report Bot".to_string(),
            uppercase_name: true,
            greetings: Greetings::default(),
            modalities: Vec::new(),
        }
    }
}

impl MessageTemplate {
    pub fn render(
        &self,
        summary: &MetricsSummary,
        expected: &[ExpectedModality],
        recipient_name: &str,
        hour: u32,
    ) -> String {
        let blocks: Vec<String> = summary
            .ordered(expected)
            .into_iter()
            .filter(|(key, _)| {
                self.modalities.is_empty() || self.modalities.iter().any(|k| k.as_str() == *key)
            })
            .map(|(_, m)| {
                let statuses = if m.status_counts.is_empty() {
                    self.empty_statuses.clone()
                } else {
                    m.status_counts
                        .iter()
                        .map(|(status, count)| {
                            fill(
                                &self.status_line,
                                &[("status", status.as_str()), ("count", &count.to_string())],
                            )
                        })
                        .collect()
                };
                fill(
                    &self.modality_block,
                    &[
                        ("modality", m.name.as_str()),
                        ("statuses", &statuses),
                        ("regions", &m.approved_region_count.to_string()),
                        ("municipalities", &m.approved_municipality_count.to_string()),
                    ],
                )
            })
            .collect();

        let name = if self.uppercase_name {
            recipient_name.to_uppercase()
        } else {
            recipient_name.to_string()
        };
        fill(
            &self.body,
            &[
                ("greeting", self.greetings.for_hour(hour)),
                ("name", &name),
                ("date", &summary.report_date),
                ("modalities", &blocks.join(&self.separator)),
                ("link", &self.link),
                ("signature", &self.signature),
            ],
        )
    }
}

/// Email subject and HTML body. Placeholders: `{date}`, `{signature}`,
/// `{signature_image}` (an inline `<img>` when the image is attached).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EmailTemplate {
    pub subject: String,
    pub html_body: String,
    pub signature: String,
}

impl Default for EmailTemplate {
    fn default() -> Self {
        Self {
            subject: "Daily Report - {date}".to_string(),
            html_body: "<html>\n  <body>\n    <p>Hello,</p>\n    \
                        <p>Attached is the automatically generated daily report for {date}.</p>\n    \
                        <p>Regards,<br>{signature}</p>\n    {signature_image}\n  </body>\n</html>\n"
                .to_string(),
            signature: "Report Bot".to_string(),
        }
    }
}

impl EmailTemplate {
    pub fn subject(&self, date: &str) -> String {
        fill(&self.subject, &[("date", date)])
    }

    pub fn html(&self, date: &str, with_signature_image: bool) -> String {
        let image = if with_signature_image {
            format!("<img src=\"cid:{SIGNATURE_CID}\">")
        } else {
            String::new()
        };
        fill(
            &self.html_body,
            &[
                ("date", date),
                ("signature", &self.signature),
                ("signature_image", &image),
            ],
        )
    }
}

/// Single-pass `{key}` substitution. Unknown keys are left as written and
/// substituted values are never rescanned.
pub fn fill(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        let Some(end) = tail.find('}') else {
            out.push_str(tail);
            return out;
        };
        let key = &tail[1..end];
        match values.iter().find(|(name, _)| *name == key) {
            Some((_, value)) => {
                out.push_str(value);
                rest = &tail[end + 1..];
            }
            None => {
                out.push('{');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsLoader;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    fn expected() -> Vec<ExpectedModality> {
        vec![ExpectedModality {
            key: "financial_credit".to_string(),
            name: "Financial Credit".to_string(),
        }]
    }

    #[test]
    fn greeting_follows_hour_of_day() {
        let greetings = Greetings::default();
        assert_eq!(greetings.for_hour(4), "GOOD EVENING");
        assert_eq!(greetings.for_hour(5), "GOOD MORNING");
        assert_eq!(greetings.for_hour(12), "GOOD AFTERNOON");
        assert_eq!(greetings.for_hour(18), "GOOD EVENING");
    }

    #[test]
    fn fill_leaves_unknown_placeholders() {
        assert_eq!(
            fill("{a} {b} {a", &[("a", "{b}")]),
            "{b} {b} {a"
        );
    }

    #[test]
    fn renders_unavailable_metrics() {
        let dir = tempdir().unwrap();
        let loader = MetricsLoader::new(
            dir.path().join("absent.json"),
            "%d/%m/%Y".to_string(),
            expected(),
        );
        let summary = loader.load(NaiveDate::from_ymd_opt(2026, 10, 19).unwrap());
        let template = MessageTemplate {
            link: "https://share.example.org/r".to_string(),
            ..MessageTemplate::default()
        };
        let text = template.render(&summary, &expected(), "Ana", 9);
        assert!(text.starts_with("GOOD MORNING, ANA!"));
        assert!(text.contains("Daily Report - 19/10/2026"));
        assert!(text.contains("*Modality: Financial Credit*\n-> No data available.\n"));
        assert!(text.contains("N/A regions and N/A municipalities approved."));
        assert!(text.contains("https://share.example.org/r"));
        assert!(!text.contains('{'));
    }

    #[test]
    fn modality_filter_limits_blocks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        std::fs::write(
            &path,
            r#"{"data": "19/10/2026",
                "financial_credit": {"nome": "Credit", "status_propostas": {"Approved": 4}},
                "other": {"nome": "Other"}}"#,
        )
        .unwrap();
        let summary = MetricsLoader::new(path, "%d/%m/%Y".to_string(), expected())
            .load(NaiveDate::from_ymd_opt(2026, 10, 19).unwrap());
        let template = MessageTemplate {
            modalities: vec!["financial_credit".to_string()],
            ..MessageTemplate::default()
        };
        let text = template.render(&summary, &expected(), "Ana", 20);
        assert!(text.contains("-> Approved: 4 proposals"));
        assert!(!text.contains("Other"));
    }

    #[test]
    fn email_body_embeds_signature_only_when_attached() {
        let template = EmailTemplate::default();
        assert_eq!(template.subject("19/10/2026"), "Daily Report - 19/10/2026");
        assert!(template
            .html("19/10/2026", true)
            .contains("<img src=\"cid:signature_img\">"));
        assert!(!template.html("19/10/2026", false).contains("<img"));
    }
}
