use crate::config::GenerationConfig;
use crate::error::RunError;
use crate::util::ensure_parent_dir;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tracing::info;
use wait_timeout::ChildExt;

/// Produces the day's artifact (and its metrics side-file) or fails the run.
pub trait GenerationStep: Send + Sync {
    fn run(&self, artifact_path: &Path) -> Result<(), RunError>;
}

/// Runs the configured command line under a timeout with its output
/// appended to a log file.
#[derive(Debug, Clone)]
pub struct CommandGeneration {
    command: Vec<String>,
    working_dir: Option<PathBuf>,
    timeout: Duration,
    log_path: PathBuf,
}

impl CommandGeneration {
    pub fn new(
        command: Vec<String>,
        working_dir: Option<PathBuf>,
        timeout: Duration,
        log_path: PathBuf,
    ) -> Self {
        Self {
            command,
            working_dir,
            timeout,
            log_path,
        }
    }

    pub fn from_config(config: &GenerationConfig, log_path: PathBuf) -> Self {
        Self::new(
            config.command.clone(),
            config.working_dir.clone(),
            Duration::from_secs(config.timeout_secs),
            log_path,
        )
    }

    #[cfg(test)]
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    fn open_log(&self) -> Result<File, RunError> {
        ensure_parent_dir(&self.log_path).map_err(|err| RunError::Generation(format!("{err:#}")))?;
        let mut log = File::create(&self.log_path).map_err(|err| {
            RunError::Generation(format!(
                "failed to create log {}: {err}",
                self.log_path.display()
            ))
        })?;
        let _ = writeln!(log, "command: {}", self.command.join(" "));
        if let Some(dir) = &self.working_dir {
            let _ = writeln!(log, "working_dir: {}", dir.display());
        }
        let _ = writeln!(log);
        Ok(log)
    }
}

impl GenerationStep for CommandGeneration {
    fn run(&self, artifact_path: &Path) -> Result<(), RunError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| RunError::Generation("generation command is empty".to_string()))?;

        let log = self.open_log()?;
        let stderr = log
            .try_clone()
            .map_err(|err| RunError::Generation(format!("failed to share log handle: {err}")))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr));
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        info!(command = %program, timeout_secs = self.timeout.as_secs(), log = %self.log_path.display(), "running generation step");
        let started = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|err| RunError::Generation(format!("failed to start {program}: {err}")))?;

        let status = match child.wait_timeout(self.timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(RunError::Generation(format!(
                    "{program} timed out after {}s (log: {})",
                    self.timeout.as_secs(),
                    self.log_path.display()
                )));
            }
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(RunError::Generation(format!("failed waiting for {program}: {err}")));
            }
        };

        if !status.success() {
            return Err(RunError::Generation(format!(
                "{program} exited with status {} (log: {})",
                status.code().unwrap_or(1),
                self.log_path.display()
            )));
        }
        if !artifact_path.is_file() {
            return Err(RunError::Generation(format!(
                "{program} succeeded but did not produce {}",
                artifact_path.display()
            )));
        }

        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            artifact = %artifact_path.display(),
            "generation step finished"
        );
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn sh(script: &str, dir: &Path, timeout: Duration) -> CommandGeneration {
        CommandGeneration::new(
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            Some(dir.to_path_buf()),
            timeout,
            dir.join("logs").join("generation.log"),
        )
    }

    #[test]
    fn succeeds_when_command_writes_artifact() {
        let dir = tempdir().unwrap();
        let step = sh(
            "echo building; printf data > report.xlsx",
            dir.path(),
            Duration::from_secs(10),
        );
        step.run(&dir.path().join("report.xlsx")).unwrap();
        let log = fs::read_to_string(step.log_path()).unwrap();
        assert!(log.contains("building"));
    }

    #[test]
    fn nonzero_exit_is_a_generation_failure() {
        let dir = tempdir().unwrap();
        let err = sh("echo broken >&2; exit 2", dir.path(), Duration::from_secs(10))
            .run(&dir.path().join("report.xlsx"))
            .unwrap_err();
        assert!(matches!(err, RunError::Generation(_)));
        assert!(err.to_string().contains("exited with status 2"));
    }

    #[test]
    fn missing_artifact_is_a_generation_failure() {
        let dir = tempdir().unwrap();
        let err = sh("true", dir.path(), Duration::from_secs(10))
            .run(&dir.path().join("report.xlsx"))
            .unwrap_err();
        assert!(err.to_string().contains("did not produce"));
    }

    #[test]
    fn slow_commands_are_killed() {
        let dir = tempdir().unwrap();
        let err = sh("sleep 5", dir.path(), Duration::from_millis(200))
            .run(&dir.path().join("report.xlsx"))
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
