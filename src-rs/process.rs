use anyhow::{anyhow, Result};
use serde::Serialize;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

#[derive(Debug, Clone, Serialize)]
pub struct CommandDiagnostic {
    pub ok: bool,
    pub attempts: u32,
    pub error_code: Option<String>,
    pub message: Option<String>,
}

/// Runs `program` until it exits zero or `attempts` are exhausted.
/// Each attempt is killed after `timeout`. Returns trimmed stdout on success.
pub fn run_with_retry(
    program: &str,
    args: &[String],
    timeout: Duration,
    attempts: u32,
    delay_ms: u64,
) -> (Option<String>, CommandDiagnostic) {
    let max_attempts = attempts.max(1);
    let mut last_code = Some(format!("{program}_no_output"));
    let mut last_message = Some(format!("{program} did not run"));

    for attempt in 1..=max_attempts {
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        match cmd.spawn() {
            Ok(mut child) => match child.wait_timeout(timeout) {
                Ok(Some(_)) => match child.wait_with_output() {
                    Ok(output) => {
                        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
                        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                        if output.status.success() {
                            return (
                                Some(stdout),
                                CommandDiagnostic {
                                    ok: true,
                                    attempts: attempt,
                                    error_code: None,
                                    message: None,
                                },
                            );
                        }
                        let code = output.status.code().unwrap_or(1);
                        last_code = Some(format!("{program}_exit_{code}"));
                        last_message = Some(if stderr.is_empty() {
                            format!("{program} failed with status {code}")
                        } else {
                            stderr
                        });
                    }
                    Err(err) => {
                        last_code = Some(format!("{program}_wait_output_failed"));
                        last_message = Some(err.to_string());
                    }
                },
                Ok(None) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    last_code = Some(format!("{program}_timeout"));
                    last_message = Some(format!(
                        "{program} timed out after {}ms (attempt {attempt}/{max_attempts})",
                        timeout.as_millis()
                    ));
                }
                Err(err) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    last_code = Some(format!("{program}_wait_timeout_failed"));
                    last_message = Some(err.to_string());
                }
            },
            Err(err) => {
                last_code = Some(format!("{program}_spawn_failed"));
                last_message = Some(err.to_string());
            }
        }

        if attempt < max_attempts {
            let backoff = delay_ms.saturating_mul(u64::from(attempt));
            thread::sleep(Duration::from_millis(backoff.max(10)));
        }
    }

    (
        None,
        CommandDiagnostic {
            ok: false,
            attempts: max_attempts,
            error_code: last_code,
            message: last_message,
        },
    )
}

/// [`run_with_retry`] with the diagnostic folded into an error.
pub fn run_checked(program: &str, args: &[String], timeout: Duration, attempts: u32) -> Result<String> {
    let (stdout, diag) = run_with_retry(program, args, timeout, attempts, 40);
    stdout.ok_or_else(|| {
        anyhow!(
            "{}: {}",
            diag.error_code.unwrap_or_else(|| "command_failed".to_string()),
            diag.message.unwrap_or_default()
        )
    })
}

/// Starts a process without waiting for it. A background thread reaps it on
/// exit so short-lived launchers do not linger as zombies.
pub fn spawn_detached(argv: &[String]) -> Result<u32> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("empty command line"))?;
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|err| anyhow!("failed to launch {program}: {err}"))?;
    let pid = child.id();
    let name = program.clone();
    thread::Builder::new()
        .name(format!("reap-{pid}"))
        .spawn(move || match child.wait() {
            Ok(status) => debug!(program = %name, pid, %status, "detached process exited"),
            Err(err) => warn!(program = %name, pid, error = %err, "failed to reap detached process"),
        })
        .map_err(|err| anyhow!("failed to start reaper for {program}: {err}"))?;
    Ok(pid)
}

pub fn command_exists(name: &str) -> bool {
    Command::new("sh")
        .arg("-c")
        .arg(format!("command -v {name} >/dev/null 2>&1"))
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
