use crate::config::DispatchConfig;
use crate::util::format_date;
use chrono::NaiveDate;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, warn};

/// A modality the report always mentions, even when the side-file lacks it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ExpectedModality {
    pub key: String,
    pub name: String,
}

/// A count from the side-file. Anything that is not a non-negative integer
/// (`"N/A"`, null, garbage) is `Unavailable`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Count {
    Known(u64),
    #[default]
    Unavailable,
}

impl Count {
    fn from_value(value: &Value) -> Self {
        match value {
            Value::Number(n) => n
                .as_u64()
                .or_else(|| {
                    n.as_f64()
                        .filter(|f| *f >= 0.0 && f.fract() == 0.0 && *f <= u64::MAX as f64)
                        .map(|f| f as u64)
                })
                .map_or(Count::Unavailable, Count::Known),
            Value::String(s) => s
                .trim()
                .parse::<u64>()
                .map_or(Count::Unavailable, Count::Known),
            _ => Count::Unavailable,
        }
    }
}

impl fmt::Display for Count {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Count::Known(n) => write!(f, "{n}"),
            Count::Unavailable => f.write_str("N/A"),
        }
    }
}

impl Serialize for Count {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Count::Known(n) => serializer.serialize_u64(*n),
            Count::Unavailable => serializer.serialize_str("N/A"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModalityMetrics {
    pub name: String,
    pub status_counts: BTreeMap<String, Count>,
    pub approved_region_count: Count,
    pub approved_municipality_count: Count,
}

/// First present key among the English name and its notebook alias.
fn field<'a>(object: &'a Map<String, Value>, key: &str, alias: &str) -> Option<&'a Value> {
    object.get(key).or_else(|| object.get(alias))
}

impl ModalityMetrics {
    pub fn unavailable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status_counts: BTreeMap::new(),
            approved_region_count: Count::Unavailable,
            approved_municipality_count: Count::Unavailable,
        }
    }

    /// Field by field, so one odd value only blanks that field. An empty name
    /// is left for the caller to fill in.
    fn from_value(object: &Map<String, Value>) -> Self {
        let name = field(object, "name", "nome")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let status_counts = match field(object, "status_counts", "status_propostas") {
            Some(Value::Object(statuses)) => statuses
                .iter()
                .map(|(status, count)| (status.clone(), Count::from_value(count)))
                .collect(),
            _ => BTreeMap::new(),
        };
        let count = |key: &str, alias: &str| {
            field(object, key, alias).map_or(Count::Unavailable, Count::from_value)
        };
        Self {
            name,
            status_counts,
            approved_region_count: count("approved_region_count", "ufs_aprovadas_count"),
            approved_municipality_count: count(
                "approved_municipality_count",
                "municipios_aprovados_count",
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub report_date: String,
    pub modalities: BTreeMap<String, ModalityMetrics>,
    /// False when the side-file was missing or unreadable.
    pub available: bool,
}

impl MetricsSummary {
    /// Modalities in presentation order: configured ones first, then the rest by key.
    pub fn ordered<'a>(
        &'a self,
        expected: &[ExpectedModality],
    ) -> Vec<(&'a str, &'a ModalityMetrics)> {
        let mut out: Vec<(&str, &ModalityMetrics)> = expected
            .iter()
            .filter_map(|m| self.modalities.get_key_value(&m.key))
            .map(|(key, metrics)| (key.as_str(), metrics))
            .collect();
        out.extend(
            self.modalities
                .iter()
                .filter(|(key, _)| !expected.iter().any(|m| &m.key == *key))
                .map(|(key, metrics)| (key.as_str(), metrics)),
        );
        out
    }
}

#[derive(Debug, Clone)]
pub struct MetricsLoader {
    path: PathBuf,
    date_format: String,
    expected: Vec<ExpectedModality>,
}

impl MetricsLoader {
    pub fn new(path: PathBuf, date_format: String, expected: Vec<ExpectedModality>) -> Self {
        Self {
            path,
            date_format,
            expected,
        }
    }

    pub fn from_config(config: &DispatchConfig) -> Self {
        Self::new(
            config.metrics_path(),
            config.metrics.date_format.clone(),
            config.metrics.expected_modalities.clone(),
        )
    }

    /// Never fails: a missing or malformed side-file yields the default summary.
    pub fn load(&self, today: NaiveDate) -> MetricsSummary {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "metrics side-file unavailable, using defaults");
                return self.defaults(today);
            }
        };
        match self.parse(&raw, today) {
            Some(summary) => {
                debug!(path = %self.path.display(), modalities = summary.modalities.len(), "metrics loaded");
                summary
            }
            None => {
                warn!(path = %self.path.display(), "metrics side-file is malformed, using defaults");
                self.defaults(today)
            }
        }
    }

    pub fn defaults(&self, today: NaiveDate) -> MetricsSummary {
        MetricsSummary {
            report_date: format_date(today, &self.date_format),
            modalities: self
                .expected
                .iter()
                .map(|m| (m.key.clone(), ModalityMetrics::unavailable(m.name.clone())))
                .collect(),
            available: false,
        }
    }

    fn parse(&self, raw: &str, today: NaiveDate) -> Option<MetricsSummary> {
        let root: Value = serde_json::from_str(raw).ok()?;
        let object = root.as_object()?;

        let report_date = object
            .get("report_date")
            .or_else(|| object.get("data"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format_date(today, &self.date_format));

        // Either a nested `modalities` object or modality objects at the top level.
        let entries = match object.get("modalities") {
            Some(Value::Object(nested)) => nested,
            Some(_) => return None,
            None => object,
        };

        let mut modalities = BTreeMap::new();
        for (key, value) in entries {
            let Value::Object(fields) = value else {
                continue;
            };
            let mut metrics = ModalityMetrics::from_value(fields);
            if metrics.name.is_empty() {
                metrics.name = self
                    .expected
                    .iter()
                    .find(|m| &m.key == key)
                    .map_or_else(|| key.clone(), |m| m.name.clone());
            }
            modalities.insert(key.clone(), metrics);
        }
        for expected in &self.expected {
            modalities
                .entry(expected.key.clone())
                .or_insert_with(|| ModalityMetrics::unavailable(expected.name.clone()));
        }

        Some(MetricsSummary {
            report_date,
            modalities,
            available: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    fn expected() -> Vec<ExpectedModality> {
        vec![
            ExpectedModality {
                key: "financial_credit".to_string(),
                name: "Financial Credit".to_string(),
            },
            ExpectedModality {
                key: "modality_1".to_string(),
                name: "Modality 1".to_string(),
            },
        ]
    }

    fn loader(path: PathBuf) -> MetricsLoader {
        MetricsLoader::new(path, "%d/%m/%Y".to_string(), expected())
    }

    #[test]
    fn missing_file_yields_unavailable_defaults() {
        let dir = tempdir().unwrap();
        let summary = loader(dir.path().join("metrics.json")).load(today());
        assert!(!summary.available);
        assert_eq!(summary.report_date, "19/10/2026");
        assert_eq!(summary.modalities.len(), 2);
        let credit = &summary.modalities["financial_credit"];
        assert_eq!(credit.name, "Financial Credit");
        assert!(credit.status_counts.is_empty());
        assert_eq!(credit.approved_region_count.to_string(), "N/A");
    }

    #[test]
    fn malformed_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        fs::write(&path, "{not json").unwrap();
        let summary = loader(path).load(today());
        assert!(!summary.available);
        assert_eq!(summary.modalities.len(), 2);
    }

    #[test]
    fn reads_legacy_notebook_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        fs::write(
            &path,
            r#"{
                "data": "18/10/2026",
                "financial_credit": {
                    "nome": "Crédito Financeiro",
                    "status_propostas": {"Approved": 12, "Pending": "3"},
                    "ufs_aprovadas_count": 7,
                    "municipios_aprovados_count": "N/A"
                }
            }"#,
        )
        .unwrap();
        let summary = loader(path).load(today());
        assert!(summary.available);
        assert_eq!(summary.report_date, "18/10/2026");
        let credit = &summary.modalities["financial_credit"];
        assert_eq!(credit.name, "Crédito Financeiro");
        assert_eq!(credit.status_counts["Approved"], Count::Known(12));
        assert_eq!(credit.status_counts["Pending"], Count::Known(3));
        assert_eq!(credit.approved_region_count, Count::Known(7));
        assert_eq!(credit.approved_municipality_count, Count::Unavailable);
        // Expected but absent modalities are still present as unavailable.
        assert_eq!(summary.modalities["modality_1"].name, "Modality 1");
    }

    #[test]
    fn reads_nested_english_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        fs::write(
            &path,
            r#"{"report_date": "19/10/2026", "modalities": {"extra": {"status_counts": {"Open": 1.0}, "approved_region_count": -2}}}"#,
        )
        .unwrap();
        let summary = loader(path).load(today());
        let extra = &summary.modalities["extra"];
        assert_eq!(extra.name, "extra");
        assert_eq!(extra.status_counts["Open"], Count::Known(1));
        assert_eq!(extra.approved_region_count, Count::Unavailable);

        let order: Vec<&str> = summary
            .ordered(&expected())
            .iter()
            .map(|(_, m)| m.name.as_str())
            .collect();
        assert_eq!(order, vec!["Financial Credit", "Modality 1", "extra"]);
    }

    #[test]
    fn odd_modality_fields_do_not_discard_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        fs::write(
            &path,
            r#"{
                "data": "18/10/2026",
                "financial_credit": {
                    "nome": "Financial Credit",
                    "status_propostas": {"approved": 12, "pending": 7},
                    "ufs_aprovadas_count": 3,
                    "municipios_aprovados_count": 40
                },
                "modality_1": {"nome": 5, "status_propostas": null, "ufs_aprovadas_count": [1]}
            }"#,
        )
        .unwrap();
        let summary = loader(path).load(today());
        assert!(summary.available);
        assert_eq!(summary.report_date, "18/10/2026");

        let credit = &summary.modalities["financial_credit"];
        assert_eq!(credit.status_counts["approved"], Count::Known(12));
        assert_eq!(credit.status_counts["pending"], Count::Known(7));
        assert_eq!(credit.approved_region_count, Count::Known(3));
        assert_eq!(credit.approved_municipality_count, Count::Known(40));

        let odd = &summary.modalities["modality_1"];
        assert_eq!(odd.name, "Modality 1");
        assert!(odd.status_counts.is_empty());
        assert_eq!(odd.approved_region_count, Count::Unavailable);
    }
}
