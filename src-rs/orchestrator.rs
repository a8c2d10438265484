use crate::channels::Channel;
use crate::clock::Clock;
use crate::error::{FailureReason, RunError, SkipReason};
use crate::generation::GenerationStep;
use crate::metrics::{MetricsLoader, MetricsSummary};
use crate::model::{Artifact, CleanupSummary, Delivery, DeliveryResult, Outcome, Recipient, RunReport};
use crate::util::{abs_path, is_locked, panic_message, timestamp_compact, write_json_pretty};
use anyhow::Result;
use chrono::{NaiveDate, Utc};
use rayon::prelude::*;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Deletes every file directly inside `dirs` except the artifact.
/// Files held by other processes are counted and left alone.
pub fn cleanup_stale_inputs(dirs: &[PathBuf], keep: &Path) -> CleanupSummary {
    let keep = abs_path(keep);
    let mut summary = CleanupSummary::default();
    for dir in dirs {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %dir.display(), error = %err, "cleanup directory unreadable");
                summary.errors += 1;
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() || abs_path(&path) == keep {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!(path = %path.display(), "removed stale input");
                    summary.removed += 1;
                }
                Err(err) if is_locked(&err) => {
                    warn!(path = %path.display(), "file in use, left in place");
                    summary.locked += 1;
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to remove stale input");
                    summary.errors += 1;
                }
            }
        }
    }
    info!(
        removed = summary.removed,
        locked = summary.locked,
        errors = summary.errors,
        "cleanup finished"
    );
    summary
}

/// One delivery with every escaping error or panic folded into `Failed(Unexpected)`.
fn deliver_one(
    channel: &dyn Channel,
    artifact: &Artifact,
    recipient: &Recipient,
    summary: &MetricsSummary,
) -> DeliveryResult {
    let attempt = panic::catch_unwind(AssertUnwindSafe(|| {
        channel.deliver(artifact, recipient, summary)
    }));
    let delivery = match attempt {
        Ok(Ok(delivery)) => delivery,
        Ok(Err(err)) => Delivery::failed(FailureReason::Unexpected(format!("{err:#}"))),
        Err(payload) => Delivery::failed(FailureReason::Unexpected(format!(
            "panic: {}",
            panic_message(payload.as_ref())
        ))),
    };
    let result = DeliveryResult::record(channel.kind(), channel.name(), recipient, delivery);
    log_result(&result);
    result
}

fn log_result(result: &DeliveryResult) {
    let detail = result.detail.as_deref().unwrap_or("");
    match &result.outcome {
        Outcome::Failed(reason) => error!(
            channel = %result.channel,
            name = %result.channel_name,
            recipient = %result.recipient,
            reason = %reason,
            "delivery failed"
        ),
        Outcome::Skipped(reason) => warn!(
            channel = %result.channel,
            name = %result.channel_name,
            recipient = %result.recipient,
            reason = %reason,
            "delivery skipped"
        ),
        outcome => info!(
            channel = %result.channel,
            name = %result.channel_name,
            recipient = %result.recipient,
            outcome = %outcome,
            detail,
            "delivery finished"
        ),
    }
}

pub struct Orchestrator {
    artifact_path: PathBuf,
    generation: Box<dyn GenerationStep>,
    metrics: MetricsLoader,
    channels: Vec<Box<dyn Channel>>,
    clock: Arc<dyn Clock>,
    cleanup_dirs: Vec<PathBuf>,
    max_parallel: usize,
    run_budget: Option<Duration>,
    skip_generation: bool,
}

impl Orchestrator {
    pub fn new(
        artifact_path: PathBuf,
        generation: Box<dyn GenerationStep>,
        metrics: MetricsLoader,
        channels: Vec<Box<dyn Channel>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            artifact_path,
            generation,
            metrics,
            channels,
            clock,
            cleanup_dirs: Vec::new(),
            max_parallel: 1,
            run_budget: None,
            skip_generation: false,
        }
    }

    pub fn cleanup_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.cleanup_dirs = dirs;
        self
    }

    pub fn max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    pub fn run_budget(mut self, budget: Option<Duration>) -> Self {
        self.run_budget = budget;
        self
    }

    pub fn skip_generation(mut self, skip: bool) -> Self {
        self.skip_generation = skip;
        self
    }

    /// Cleanup, generation, metrics, then every (channel, recipient) pair in
    /// configuration order. Only generation can abort the run.
    pub fn run_on(&self, today: NaiveDate) -> Result<RunReport, RunError> {
        let run_id = timestamp_compact();
        let started_at = Utc::now();
        let run_started = self.clock.now();
        info!(run_id = %run_id, channels = self.channels.len(), "run started");

        let cleanup = cleanup_stale_inputs(&self.cleanup_dirs, &self.artifact_path);

        if self.skip_generation {
            warn!("generation step skipped, using existing artifact");
        } else {
            self.generation.run(&self.artifact_path)?;
        }
        let artifact = Artifact::observe(&self.artifact_path);
        let summary = self.metrics.load(today);

        let mut results = Vec::new();
        for channel in &self.channels {
            let channel = channel.as_ref();
            info!(
                channel = %channel.kind(),
                name = %channel.name(),
                recipients = channel.recipients().len(),
                "delivering"
            );
            if channel.requires_foreground() || self.max_parallel == 1 {
                for recipient in channel.recipients() {
                    results.push(self.deliver_within_budget(channel, &artifact, recipient, &summary, run_started));
                }
            } else {
                results.extend(self.deliver_parallel(channel, &artifact, &summary, run_started));
            }
        }

        let report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            artifact,
            metrics_available: summary.available,
            cleanup,
            results,
        };
        info!(
            total = report.results.len(),
            success = report.count(&Outcome::Success),
            fallback = report.count(&Outcome::SuccessWithFallback),
            failed = report.failed_count(),
            "run finished"
        );
        Ok(report)
    }

    fn budget_exceeded(&self, run_started: Instant) -> bool {
        self.run_budget
            .is_some_and(|budget| self.clock.now().saturating_duration_since(run_started) >= budget)
    }

    fn deliver_within_budget(
        &self,
        channel: &dyn Channel,
        artifact: &Artifact,
        recipient: &Recipient,
        summary: &MetricsSummary,
        run_started: Instant,
    ) -> DeliveryResult {
        if self.budget_exceeded(run_started) {
            let result = DeliveryResult::record(
                channel.kind(),
                channel.name(),
                recipient,
                Delivery::skipped(SkipReason::Timeout),
            );
            log_result(&result);
            return result;
        }
        deliver_one(channel, artifact, recipient, summary)
    }

    /// Up to `max_parallel` recipients at a time on a dedicated pool; results
    /// keep recipient order. The budget is checked as each recipient starts.
    fn deliver_parallel(
        &self,
        channel: &dyn Channel,
        artifact: &Artifact,
        summary: &MetricsSummary,
        run_started: Instant,
    ) -> Vec<DeliveryResult> {
        let recipients = channel.recipients();
        let pool = match rayon::ThreadPoolBuilder::new()
            .num_threads(self.max_parallel.min(recipients.len()).max(1))
            .thread_name(|idx| format!("delivery-{idx}"))
            .build()
        {
            Ok(pool) => pool,
            Err(err) => {
                warn!(error = %err, "delivery pool unavailable, delivering sequentially");
                return recipients
                    .iter()
                    .map(|recipient| self.deliver_within_budget(channel, artifact, recipient, summary, run_started))
                    .collect();
            }
        };
        pool.install(|| {
            recipients
                .par_iter()
                .map(|recipient| self.deliver_within_budget(channel, artifact, recipient, summary, run_started))
                .collect()
        })
    }
}

pub fn report_path(out_dir: &Path, run_id: &str) -> PathBuf {
    out_dir.join("reports").join(format!("run-{run_id}.json"))
}

pub fn write_report(report: &RunReport, path: &Path) -> Result<()> {
    write_json_pretty(path, report)?;
    info!(path = %abs_path(path).display(), "run report written");
    Ok(())
}
