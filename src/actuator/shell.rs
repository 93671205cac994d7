use super::{ActionOutcome, ShellOptions, ShellRunner};
use crate::config::ShellConfig;
use async_trait::async_trait;
use std::io::ErrorKind as IoErrorKind;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::time::timeout;

/// Runs commands through the platform shell.
pub struct TokioShellRunner {
    default_timeout: Duration,
    blocked_commands: Vec<String>,
}

impl TokioShellRunner {
    pub fn new(config: &ShellConfig) -> Self {
        Self {
            default_timeout: Duration::from_millis(config.timeout_ms),
            blocked_commands: config
                .blocked_commands
                .iter()
                .map(|c| normalize_command(c))
                .collect(),
        }
    }

    pub fn blocked_pattern(&self, command: &str) -> Option<&str> {
        let normalized = normalize_command(command);
        self.blocked_commands
            .iter()
            .find(|pattern| normalized.contains(pattern.as_str()))
            .map(|pattern| pattern.as_str())
    }
}

fn normalize_command(command: &str) -> String {
    command.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn classify_process_spawn_error(kind: IoErrorKind) -> &'static str {
    match kind {
        IoErrorKind::NotFound => "shell_not_found",
        IoErrorKind::PermissionDenied => "shell_permission_denied",
        _ => "shell_spawn_failed",
    }
}

fn shell_command(command: &str) -> Command {
    #[cfg(target_os = "windows")]
    {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    }

    #[cfg(not(target_os = "windows"))]
    {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    }
}

#[async_trait]
impl ShellRunner for TokioShellRunner {
    async fn execute(&self, command: &str, options: &ShellOptions) -> ActionOutcome {
        let started = Instant::now();

        if let Some(pattern) = self.blocked_pattern(command) {
            log::warn!("refusing blocked shell command: {}", command);
            return ActionOutcome::failed(format!(
                "command blocked by shell policy (matches '{}')",
                pattern
            ));
        }

        let mut cmd = shell_command(command);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &options.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &options.env {
            cmd.env(key, value);
        }

        log::debug!("$ {}", command);
        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                return ActionOutcome::failed(format!(
                    "failed to spawn shell ({}): {}",
                    classify_process_spawn_error(err.kind()),
                    err
                ))
                .timed_from(started)
            }
        };

        let limit = options.timeout.unwrap_or(self.default_timeout);
        let output = match timeout(limit, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                return ActionOutcome::failed(format!("failed to wait for shell: {}", err))
                    .timed_from(started)
            }
            // Dropping the future drops the child, which kills it.
            Err(_) => {
                return ActionOutcome::failed(format!(
                    "command timed out after {}ms",
                    limit.as_millis()
                ))
                .timed_from(started)
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();

        if output.status.success() {
            ActionOutcome::ok(stdout).timed_from(started)
        } else {
            let mut error = format!("command exited with code {:?}", output.status.code());
            if !stderr.is_empty() {
                error.push_str(": ");
                error.push_str(&stderr);
            }
            let mut outcome = ActionOutcome::failed(error);
            if !stdout.is_empty() {
                outcome = outcome.with_output(stdout);
            }
            outcome.timed_from(started)
        }
    }
}
