use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;

/// Exit code and combined stdout/stderr of one container CLI invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub output: String,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Abstraction over the container runtime CLI for testability.
/// Real implementation: `DockerCli`. Test double: `FakeRuntime`.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Run the runtime CLI with `args`. Spawn failures are reported as a
    /// non-zero exit code, never as an error.
    async fn run(&self, args: &[String]) -> CommandOutput;

    /// Name of the runtime CLI, for log lines.
    fn program(&self) -> &str;
}

/// Shells out to the `docker` (or compatible) command line.
pub struct DockerCli {
    program: String,
}

impl DockerCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn run(&self, args: &[String]) -> CommandOutput {
        let started = Instant::now();
        let result = Command::new(&self.program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await;

        match result {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                CommandOutput {
                    exit_code: output.status.code().unwrap_or(-1),
                    output: format!("{}{}", stdout, stderr).trim().to_string(),
                    duration: started.elapsed(),
                }
            }
            Err(e) => CommandOutput {
                exit_code: 1,
                output: format!("failed to run {}: {}", self.program, e),
                duration: started.elapsed(),
            },
        }
    }

    fn program(&self) -> &str {
        &self.program
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_binary_reports_failure_instead_of_error() {
        let runtime = DockerCli::new("definitely-not-a-container-runtime-xyz");
        let out = runtime.run(&["version".to_string()]).await;
        assert!(!out.success());
        assert!(out.output.contains("definitely-not-a-container-runtime-xyz"));
    }

    #[tokio::test]
    async fn test_combines_stdout_and_stderr() {
        let runtime = DockerCli::new("sh");
        let args = vec!["-c".to_string(), "echo out; echo err >&2; exit 3".to_string()];
        let out = runtime.run(&args).await;
        assert_eq!(out.exit_code, 3);
        assert!(out.output.contains("out"));
        assert!(out.output.contains("err"));
    }
}
