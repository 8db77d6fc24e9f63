//! Process backend that actually runs the app.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ExecutionError;

use super::environment::Invocation;

/// Maximum number of stderr bytes kept in error messages.
const STDERR_TAIL_BYTES: usize = 4096;

/// Captured result of a finished app run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    /// Exit code of the process.
    pub exit_code: i32,
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
    /// Wall-clock duration.
    pub duration: Duration,
}

impl ExecOutput {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs an [`Invocation`] to completion.
///
/// Implementations must return an error for any non-successful exit.
/// Dropping the returned future must stop the underlying process.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    async fn execute(&self, invocation: &Invocation) -> Result<ExecOutput, ExecutionError>;
}

/// Spawns the invocation as a local child process.
#[derive(Debug, Clone, Default)]
pub struct ProcessBackend {
    timeout: Option<Duration>,
}

impl ProcessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kills the app if it runs longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

async fn kill_container(program: String, name: String) {
    let result = tokio::process::Command::new(&program)
        .args(["kill", name.as_str()])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await;
    match result {
        Ok(_) => debug!("Stopped container {}", name),
        Err(e) => warn!("Failed to kill container {}: {}", name, e),
    }
}

/// Stops the run's container unless disarmed.
///
/// Killing the `docker run` client does not stop the container, so a run
/// dropped mid-flight still needs an explicit `docker kill`.
struct ContainerGuard {
    target: Option<(String, String)>,
}

impl ContainerGuard {
    fn new(invocation: &Invocation) -> Self {
        Self {
            target: invocation
                .container_name
                .clone()
                .map(|name| (invocation.program.clone(), name)),
        }
    }

    fn disarm(&mut self) {
        self.target = None;
    }

    async fn stop(&mut self) {
        if let Some((program, name)) = self.target.take() {
            kill_container(program, name).await;
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let Some((program, name)) = self.target.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("Run cancelled, stopping container {}", name);
                handle.spawn(kill_container(program, name));
            }
            Err(_) => warn!("No runtime left to stop container {}", name),
        }
    }
}

#[async_trait]
impl ExecutionBackend for ProcessBackend {
    async fn execute(&self, invocation: &Invocation) -> Result<ExecOutput, ExecutionError> {
        debug!("Running: {}", invocation.command_line());
        let start = Instant::now();

        let child = tokio::process::Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecutionError::Launch {
                program: invocation.program.clone(),
                source,
            })?;

        let mut guard = ContainerGuard::new(invocation);
        let output = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(result) => result?,
                Err(_) => {
                    guard.stop().await;
                    return Err(ExecutionError::Timeout {
                        seconds: limit.as_secs(),
                    });
                }
            },
            None => child.wait_with_output().await?,
        };
        guard.disarm();

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let duration = start.elapsed();

        match output.status.code() {
            Some(0) => Ok(ExecOutput {
                exit_code: 0,
                stdout,
                stderr,
                duration,
            }),
            Some(code) => Err(ExecutionError::NonZeroExit {
                code,
                stderr: tail(&stderr),
            }),
            None => Err(ExecutionError::Terminated {
                stderr: tail(&stderr),
            }),
        }
    }
}

fn tail(text: &str) -> String {
    let trimmed = text.trim_end();
    if trimmed.len() <= STDERR_TAIL_BYTES {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - STDERR_TAIL_BYTES;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &trimmed[start..])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Invocation {
        Invocation {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            app_args: Vec::new(),
            container_name: None,
        }
    }

    #[tokio::test]
    async fn test_successful_run() {
        let output = ProcessBackend::new()
            .execute(&sh("echo hello"))
            .await
            .unwrap();
        assert!(output.is_success());
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_non_zero_exit() {
        let err = ProcessBackend::new()
            .execute(&sh("echo broken >&2; exit 3"))
            .await
            .unwrap_err();
        match err {
            ExecutionError::NonZeroExit { code, stderr } => {
                assert_eq!(code, 3);
                assert_eq!(stderr, "broken");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_launch_failure() {
        let invocation = Invocation {
            program: "/nonexistent/bids-app".to_string(),
            args: Vec::new(),
            app_args: Vec::new(),
            container_name: None,
        };
        let err = ProcessBackend::new().execute(&invocation).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Launch { .. }));
    }

    #[tokio::test]
    async fn test_timeout() {
        let err = ProcessBackend::new()
            .with_timeout(Duration::from_millis(100))
            .execute(&sh("sleep 5"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Timeout { .. }));
    }

    /// Script standing in for the docker client: `kill <name>` is recorded,
    /// `run` blocks and anything else exits at once.
    fn fake_docker(dir: &std::path::Path) -> (String, std::path::PathBuf) {
        use std::os::unix::fs::PermissionsExt;

        let log = dir.join("kills.log");
        let script = dir.join("docker");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\ncase \"$1\" in kill) echo \"$2\" >> '{}' ;; run) sleep 30 ;; esac\n",
                log.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        (script.to_string_lossy().to_string(), log)
    }

    fn container_run(program: String) -> Invocation {
        Invocation {
            program,
            args: vec!["run".to_string(), "--name".to_string(), "bids-app-test".to_string()],
            app_args: Vec::new(),
            container_name: Some("bids-app-test".to_string()),
        }
    }

    async fn wait_for(path: &std::path::Path) -> String {
        for _ in 0..50 {
            if let Ok(content) = std::fs::read_to_string(path) {
                if !content.is_empty() {
                    return content;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        String::new()
    }

    #[tokio::test]
    async fn test_cancelled_run_stops_container() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (program, log) = fake_docker(tmp.path());
        let invocation = container_run(program);
        let backend = ProcessBackend::new();

        let run = backend.execute(&invocation);
        assert!(tokio::time::timeout(Duration::from_millis(200), run)
            .await
            .is_err());

        assert_eq!(wait_for(&log).await.trim(), "bids-app-test");
    }

    #[tokio::test]
    async fn test_timeout_stops_container() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (program, log) = fake_docker(tmp.path());
        let err = ProcessBackend::new()
            .with_timeout(Duration::from_millis(100))
            .execute(&container_run(program))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Timeout { .. }));
        assert_eq!(std::fs::read_to_string(&log).unwrap().trim(), "bids-app-test");
    }

    #[tokio::test]
    async fn test_finished_run_leaves_container_alone() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (program, log) = fake_docker(tmp.path());
        let mut invocation = container_run(program);
        invocation.args = vec!["version".to_string()];
        ProcessBackend::new().execute(&invocation).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!log.exists());
    }

    #[test]
    fn test_tail() {
        assert_eq!(tail("short\n"), "short");
        let long = "x".repeat(STDERR_TAIL_BYTES + 10);
        assert_eq!(tail(&long).len(), STDERR_TAIL_BYTES + 3);
    }
}
