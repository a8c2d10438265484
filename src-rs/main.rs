mod channels;
mod clock;
mod config;
mod controller;
mod error;
mod generation;
mod matcher;
mod metrics;
mod model;
mod orchestrator;
mod process;
mod render;
mod telemetry;
#[cfg(test)]
mod testing;
mod util;
mod visual_loop;

use anyhow::{bail, Context, Result};
use chrono::{Local, Timelike};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::channels::{build_channels, deep_link};
use crate::clock::{Clock, SystemClock};
use crate::config::{ChannelConfig, DispatchConfig, CONFIG_HELP};
use crate::error::RunError;
use crate::generation::CommandGeneration;
use crate::matcher::{TemplateMatcher, DEFAULT_CONFIDENCE};
use crate::metrics::MetricsLoader;
use crate::model::{Outcome, Recipient};
use crate::orchestrator::{report_path, write_report, Orchestrator};
use crate::util::{abs_path, out_root, timestamp_compact, write_json_pretty};

#[derive(Parser, Debug)]
#[command(
    name = "report-dispatch",
    version,
    about = "Generate the daily report and distribute it to file shares, email, cloud storage and chat contacts",
    after_help = CONFIG_HELP
)]
struct Cli {
    /// Dispatch config JSON
    #[arg(
        long,
        global = true,
        env = "REPORT_DISPATCH_CONFIG",
        default_value = "report-dispatch.json"
    )]
    config: PathBuf,
    /// Emit log events as JSON lines on stderr
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    log_json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print supported commands in JSON
    Commands,
    /// Clean up, generate the report and deliver it on every configured channel
    Run(RunArgs),
    /// Load and validate the config, then print the resolved delivery plan
    Validate,
    /// Match a template image against a screenshot and print the result
    Locate(LocateArgs),
    /// Print the chat message each messaging recipient would receive
    Render(RenderArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Use the existing artifact instead of running the generation command
    #[arg(long, action = ArgAction::SetTrue)]
    skip_generation: bool,
    /// Exit non-zero when any delivery failed
    #[arg(long, action = ArgAction::SetTrue)]
    strict: bool,
    /// Run report path (default: <out_dir>/reports/run-<timestamp>.json)
    #[arg(long)]
    report_out: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct LocateArgs {
    /// Screenshot to search
    capture: PathBuf,
    /// Template image to find
    template: PathBuf,
    #[arg(long, default_value_t = DEFAULT_CONFIDENCE)]
    confidence: f64,
    /// Scan every position at full resolution
    #[arg(long, action = ArgAction::SetTrue)]
    exhaustive: bool,
    /// Also write the result JSON here
    #[arg(long)]
    out: Option<PathBuf>,
    /// Fail with non-zero status when nothing meets the confidence
    #[arg(long, action = ArgAction::SetTrue)]
    strict: bool,
}

#[derive(Args, Debug)]
struct RenderArgs {
    /// Only this messaging channel
    #[arg(long)]
    channel: Option<String>,
    /// Hour of day used for the greeting (default: now)
    #[arg(long, value_parser = clap::value_parser!(u32).range(0..24))]
    hour: Option<u32>,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    // Secrets and REPORT_DISPATCH_* may come from a .env file.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    match cli.command {
        Commands::Commands => print_commands(),
        Commands::Run(args) => command_run(&cli.config, cli.log_json, args),
        Commands::Validate => command_validate(&cli.config, cli.log_json),
        Commands::Locate(args) => command_locate(cli.log_json, args),
        Commands::Render(args) => command_render(&cli.config, cli.log_json, args),
    }
}

fn print_commands() -> Result<()> {
    let rows = vec![
        json!({
            "name": "run",
            "description": "Clean up stale inputs, run the generation step and deliver on every channel."
        }),
        json!({
            "name": "validate",
            "description": "Validate the config and print the delivery plan."
        }),
        json!({
            "name": "locate",
            "description": "Match a template against a screenshot and print the best region."
        }),
        json!({
            "name": "render",
            "description": "Print each messaging recipient's message and deep link."
        }),
    ];
    println!("{}", serde_json::to_string_pretty(&Value::Array(rows))?);
    Ok(())
}

fn load_config(path: &Path, log_json: bool) -> Result<DispatchConfig> {
    let config = DispatchConfig::load(path)?;
    telemetry::init(log_json || config.logging.json)?;
    Ok(config)
}

fn command_run(config_path: &Path, log_json: bool, args: RunArgs) -> Result<()> {
    let config = load_config(config_path, log_json)?;
    config.validate()?;

    let out_dir = out_root();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let today = Local::now().date_naive();

    let generation = CommandGeneration::from_config(
        &config.generation,
        out_dir
            .join("logs")
            .join(format!("generation-{}.log", timestamp_compact())),
    );
    let channels = build_channels(&config, &out_dir, clock.clone())
        .map_err(|err| RunError::Configuration(format!("{err:#}")))?;

    let orchestrator = Orchestrator::new(
        config.artifact_path(today),
        Box::new(generation),
        MetricsLoader::from_config(&config),
        channels,
        clock,
    )
    .cleanup_dirs(config.cleanup_dirs.clone())
    .max_parallel(config.run.max_parallel)
    .run_budget(config.run_budget())
    .skip_generation(args.skip_generation);

    let report = orchestrator.run_on(today)?;
    let path = args
        .report_out
        .unwrap_or_else(|| report_path(&out_dir, &report.run_id));
    write_report(&report, &path)?;

    let failed = report.failed_count();
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "run_id": report.run_id,
            "report": abs_path(&path).display().to_string(),
            "artifact": abs_path(&report.artifact.path).display().to_string(),
            "deliveries": report.results.len(),
            "success": report.count(&Outcome::Success),
            "success_with_fallback": report.count(&Outcome::SuccessWithFallback),
            "skipped": report.results.iter().filter(|r| matches!(r.outcome, Outcome::Skipped(_))).count(),
            "failed": failed,
        }))?
    );

    if args.strict && report.has_failures() {
        bail!("{failed} of {} deliveries failed", report.results.len());
    }
    Ok(())
}

fn command_validate(config_path: &Path, log_json: bool) -> Result<()> {
    let config = load_config(config_path, log_json)?;
    config.validate()?;

    let today = Local::now().date_naive();
    let channels: Vec<Value> = config
        .channels
        .iter()
        .map(|channel| {
            json!({
                "kind": channel.kind(),
                "name": channel.display_name(),
                "foreground": matches!(channel, ChannelConfig::Messaging(_)),
                "recipients": channel.recipients(),
            })
        })
        .collect();
    let plan = json!({
        "config": abs_path(config_path).display().to_string(),
        "artifact": config.artifact_path(today).display().to_string(),
        "metrics": config.metrics_path().display().to_string(),
        "cleanup_dirs": config.cleanup_dirs,
        "generation": config.generation.command,
        "max_parallel": config.run.max_parallel,
        "run_budget_secs": config.run.run_budget_secs,
        "out_dir": abs_path(&out_root()).display().to_string(),
        "channels": channels,
    });
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

fn command_locate(log_json: bool, args: LocateArgs) -> Result<()> {
    telemetry::init(log_json)?;
    let capture = image::open(&args.capture)
        .with_context(|| format!("failed to open capture: {}", args.capture.display()))?;
    let template = image::open(&args.template)
        .with_context(|| format!("failed to open template: {}", args.template.display()))?;

    let matcher = if args.exhaustive {
        TemplateMatcher::exhaustive()
    } else {
        TemplateMatcher::new()
    };
    let found = matcher.locate(&capture, &template, args.confidence);
    // Below threshold: report the best candidate anyway.
    let best = found.or_else(|| matcher.best_match(&capture, &template));

    let payload = json!({
        "capture": abs_path(&args.capture).display().to_string(),
        "template": abs_path(&args.template).display().to_string(),
        "confidence": args.confidence,
        "found": found.is_some(),
        "best": best,
        "center": found.map(|m| {
            let (x, y) = m.region.center();
            json!({"x": x, "y": y})
        }),
    });
    if let Some(out) = &args.out {
        write_json_pretty(out, &payload)?;
    }
    println!("{}", serde_json::to_string_pretty(&payload)?);

    if args.strict && found.is_none() {
        bail!(
            "template not found at confidence {} (best score {})",
            args.confidence,
            best.map_or_else(|| "n/a".to_string(), |m| format!("{:.4}", m.score))
        );
    }
    Ok(())
}

fn command_render(config_path: &Path, log_json: bool, args: RenderArgs) -> Result<()> {
    let config = load_config(config_path, log_json)?;
    let today = Local::now().date_naive();
    let summary = MetricsLoader::from_config(&config).load(today);
    let hour = args.hour.unwrap_or_else(|| Local::now().hour());

    let mut rows = Vec::new();
    for channel in &config.channels {
        let ChannelConfig::Messaging(messaging) = channel else {
            continue;
        };
        let name = channel.display_name();
        if args.channel.as_deref().is_some_and(|wanted| wanted != name) {
            continue;
        }
        for recipient in channel.recipients() {
            let Recipient::Contact {
                display_name,
                address,
            } = &recipient
            else {
                continue;
            };
            let text = config.message.render(
                &summary,
                &config.metrics.expected_modalities,
                display_name,
                hour,
            );
            rows.push(json!({
                "channel": &name,
                "recipient": &recipient,
                "link": deep_link(&messaging.deep_link, address, &text),
                "text": text,
            }));
        }
    }
    if rows.is_empty() {
        bail!("no messaging recipients configured");
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "metrics_available": summary.available,
            "report_date": summary.report_date,
            "messages": rows,
        }))?
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_run_flags() {
        let cli = Cli::try_parse_from([
            "report-dispatch",
            "--config",
            "cfg.json",
            "run",
            "--skip-generation",
            "--strict",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("cfg.json"));
        match cli.command {
            Commands::Run(args) => {
                assert!(args.skip_generation);
                assert!(args.strict);
                assert!(args.report_out.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn render_rejects_out_of_range_hour() {
        assert!(Cli::try_parse_from(["report-dispatch", "render", "--hour", "24"]).is_err());
    }
}
