use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Working directory inside every runner container; the sandbox directory
/// is bound here.
const CONTAINER_WORKDIR: &str = "/data";
/// Non-root user the runner executes as; matches the sandbox chown target.
const CONTAINER_USER: &str = "1000:1000";

const MEMORY_LIMIT_BYTES: i64 = 256 * 1024 * 1024;
const NANO_CPUS: i64 = 500_000_000; // half a logical CPU

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Grace period after the waiter fires for the reader to flush in-flight
/// output frames.
const OUTPUT_DRAIN: Duration = Duration::from_millis(100);
/// Deadline for container removal, independent of the caller's lifetime.
const REMOVE_TIMEOUT: Duration = Duration::from_secs(5);

/// The result of one code execution.
///
/// `success` holds exactly when the container exited with code 0, did not
/// time out, and no container-lifecycle error occurred.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub timed_out: bool,
}

impl ExecutionOutcome {
    /// Outcome for a container-lifecycle failure (create/attach/start);
    /// the diagnostic lands in stderr so clients see it in one place.
    fn lifecycle_failure(stderr: String) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr,
            exit_code: 0,
            timed_out: false,
        }
    }
}

/// Why a daemon call was interrupted before it completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupted {
    DeadlineExceeded,
    Cancelled,
}

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interrupted::DeadlineExceeded => write!(f, "execution deadline exceeded"),
            Interrupted::Cancelled => write!(f, "execution cancelled by the caller"),
        }
    }
}

/// Race a daemon call against the execution deadline and the caller's
/// cancellation. Create, attach, start and the wait all suspend here, so a
/// hung daemon can never stall an execution past its bound.
async fn bounded<F>(
    deadline: Instant,
    cancel: &CancellationToken,
    operation: F,
) -> Result<F::Output, Interrupted>
where
    F: std::future::Future,
{
    tokio::select! {
        result = operation => Ok(result),
        _ = tokio::time::sleep_until(deadline) => Err(Interrupted::DeadlineExceeded),
        _ = cancel.cancelled() => Err(Interrupted::Cancelled),
    }
}

/// Runs code in one-shot Docker containers.
///
/// Containers are never reused: each execution creates a container bound to
/// the conversation's sandbox directory, feeds the code over stdin, collects
/// demultiplexed output, and force-removes the container afterwards.
pub struct Executor {
    docker: Docker,
    timeout: Duration,
}

impl Executor {
    pub fn new(docker: Docker) -> Self {
        Self::with_timeout(docker, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(docker: Docker, timeout: Duration) -> Self {
        Self { docker, timeout }
    }

    /// Execute `code` in a fresh container of `image`, with the sandbox
    /// host path bound at `/data`.
    ///
    /// This never fails outright: every error path is folded into the
    /// returned outcome, and the container (once created) is always removed.
    /// Cancelling `cancel` interrupts the execution at its next suspension
    /// point; a cancellation or deadline during the running phase reports
    /// `timed_out`.
    pub async fn execute(
        &self,
        image: &str,
        host_path: &str,
        code: &str,
        network_enabled: bool,
        environment: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> ExecutionOutcome {
        // One deadline covers every daemon call of this execution.
        let deadline = Instant::now() + self.timeout;
        let config = container_config(image, host_path, network_enabled, environment);

        let created = bounded(
            deadline,
            cancel,
            self.docker
                .create_container(None::<CreateContainerOptions<String>>, config),
        )
        .await;
        let container_id = match created {
            Ok(Ok(response)) => response.id,
            Ok(Err(e)) => {
                return ExecutionOutcome::lifecycle_failure(format!(
                    "Failed to create container: {}",
                    e
                ));
            }
            Err(interrupted) => {
                return ExecutionOutcome::lifecycle_failure(format!(
                    "Failed to create container: {}",
                    interrupted
                ));
            }
        };
        debug!("created container {}", container_id);

        let outcome = self.run(&container_id, code, deadline, cancel).await;

        // Cleanup runs on its own deadline so a cancelled caller still
        // reclaims the container.
        self.remove(&container_id).await;

        outcome
    }

    async fn run(
        &self,
        container_id: &str,
        code: &str,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> ExecutionOutcome {
        let attached = bounded(
            deadline,
            cancel,
            self.docker.attach_container(
                container_id,
                Some(AttachContainerOptions::<String> {
                    stream: Some(true),
                    stdin: Some(true),
                    stdout: Some(true),
                    stderr: Some(true),
                    ..Default::default()
                }),
            ),
        )
        .await;
        let attach = match attached {
            Ok(Ok(attach)) => attach,
            Ok(Err(e)) => {
                return ExecutionOutcome::lifecycle_failure(format!(
                    "Failed to attach to container: {}",
                    e
                ));
            }
            Err(interrupted) => {
                return ExecutionOutcome::lifecycle_failure(format!(
                    "Failed to attach to container: {}",
                    interrupted
                ));
            }
        };

        let started = bounded(
            deadline,
            cancel,
            self.docker
                .start_container(container_id, None::<StartContainerOptions<String>>),
        )
        .await;
        match started {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return ExecutionOutcome::lifecycle_failure(format!(
                    "Failed to start container: {}",
                    e
                ));
            }
            Err(interrupted) => {
                return ExecutionOutcome::lifecycle_failure(format!(
                    "Failed to start container: {}",
                    interrupted
                ));
            }
        }

        let AttachContainerResults { mut output, mut input } = attach;

        // Writer: push the code to stdin, then half-close so the runner sees
        // EOF. A fast-exiting runner may close its end first; the resulting
        // broken pipe is benign.
        let code_bytes = code.as_bytes().to_vec();
        let writer = tokio::spawn(async move {
            if let Err(e) = input.write_all(&code_bytes).await {
                debug!("stdin write ended early: {}", e);
            }
            let _ = input.shutdown().await;
        });

        // Reader: demultiplex the attach stream into stdout/stderr buffers.
        let stdout_buf = Arc::new(Mutex::new(Vec::new()));
        let stderr_buf = Arc::new(Mutex::new(Vec::new()));
        let reader = {
            let stdout_buf = Arc::clone(&stdout_buf);
            let stderr_buf = Arc::clone(&stderr_buf);
            tokio::spawn(async move {
                while let Some(frame) = output.next().await {
                    match frame {
                        Ok(LogOutput::StdOut { message })
                        | Ok(LogOutput::Console { message }) => {
                            lock_buf(&stdout_buf).extend_from_slice(&message);
                        }
                        Ok(LogOutput::StdErr { message }) => {
                            lock_buf(&stderr_buf).extend_from_slice(&message);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            debug!("attach stream ended: {}", e);
                            break;
                        }
                    }
                }
            })
        };

        let mut wait_stream = Box::pin(
            self.docker
                .wait_container(container_id, None::<WaitContainerOptions<String>>),
        );

        let mut exit_code: i64 = 0;
        let mut timed_out = false;
        let mut wait_error: Option<String> = None;

        tokio::select! {
            status = wait_stream.next() => match status {
                Some(Ok(response)) => exit_code = response.status_code,
                // bollard surfaces a non-zero exit as a wait "error"; that is
                // a normal outcome here, not an internal failure.
                Some(Err(DockerError::DockerContainerWaitError { code, .. })) => {
                    exit_code = code;
                }
                Some(Err(e)) => wait_error = Some(e.to_string()),
                None => {
                    wait_error =
                        Some("wait stream closed before the container exited".to_string());
                }
            },
            _ = tokio::time::sleep_until(deadline) => {
                timed_out = true;
                exit_code = -1;
            }
            _ = cancel.cancelled() => {
                timed_out = true;
                exit_code = -1;
            }
        }

        tokio::time::sleep(OUTPUT_DRAIN).await;
        reader.abort();
        writer.abort();

        let stdout = String::from_utf8_lossy(&lock_buf(&stdout_buf)).into_owned();
        let mut stderr = String::from_utf8_lossy(&lock_buf(&stderr_buf)).into_owned();

        if let Some(error) = wait_error {
            return ExecutionOutcome {
                success: false,
                stdout,
                stderr: format!("Container wait error: {}\n{}", error, stderr),
                exit_code: 0,
                timed_out: false,
            };
        }

        if timed_out {
            stderr = prefix_timeout_notice(&stderr, self.timeout);
        }

        ExecutionOutcome {
            success: exit_code == 0 && !timed_out,
            stdout,
            stderr,
            exit_code,
            timed_out,
        }
    }

    async fn remove(&self, container_id: &str) {
        let remove = self.docker.remove_container(
            container_id,
            Some(RemoveContainerOptions {
                force: true,
                ..Default::default()
            }),
        );

        match tokio::time::timeout(REMOVE_TIMEOUT, remove).await {
            Ok(Ok(())) => debug!("removed container {}", container_id),
            Ok(Err(e)) => warn!("failed to remove container {}: {}", container_id, e),
            Err(_) => warn!(
                "timed out removing container {} after {:?}",
                container_id, REMOVE_TIMEOUT
            ),
        }
    }
}

fn container_config(
    image: &str,
    host_path: &str,
    network_enabled: bool,
    environment: &HashMap<String, String>,
) -> Config<String> {
    Config {
        image: Some(image.to_string()),
        working_dir: Some(CONTAINER_WORKDIR.to_string()),
        user: Some(CONTAINER_USER.to_string()),
        env: Some(format_env(environment)),
        open_stdin: Some(true),
        stdin_once: Some(true),
        attach_stdin: Some(true),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        network_disabled: Some(!network_enabled),
        host_config: Some(HostConfig {
            binds: Some(vec![format!("{}:{}", host_path, CONTAINER_WORKDIR)]),
            memory: Some(MEMORY_LIMIT_BYTES),
            nano_cpus: Some(NANO_CPUS),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn format_env(environment: &HashMap<String, String>) -> Vec<String> {
    environment
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect()
}

fn prefix_timeout_notice(stderr: &str, timeout: Duration) -> String {
    let notice = format!("Execution timed out after {}s", timeout.as_secs());
    if stderr.is_empty() {
        notice
    } else {
        format!("{}\n{}", notice, stderr)
    }
}

fn lock_buf(buf: &Mutex<Vec<u8>>) -> std::sync::MutexGuard<'_, Vec<u8>> {
    buf.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_format_env() {
        let mut env = HashMap::new();
        env.insert("FILE_BASE_URL".to_string(), "http://x/files/abc".to_string());
        let formatted = format_env(&env);
        assert_eq!(formatted, vec!["FILE_BASE_URL=http://x/files/abc"]);
    }

    #[test]
    fn test_timeout_notice_preserves_captured_stderr() {
        let timeout = Duration::from_secs(30);
        assert_eq!(
            prefix_timeout_notice("", timeout),
            "Execution timed out after 30s"
        );
        assert_eq!(
            prefix_timeout_notice("Traceback: boom", timeout),
            "Execution timed out after 30s\nTraceback: boom"
        );
    }

    #[test]
    fn test_lifecycle_failure_outcome() {
        let outcome = ExecutionOutcome::lifecycle_failure("Failed to create container: x".into());
        assert!(!outcome.success);
        assert!(!outcome.timed_out);
        assert!(outcome.stdout.is_empty());
        assert!(outcome.stderr.contains("Failed to create container"));
    }

    #[tokio::test]
    async fn test_bounded_passes_through_operation_result() {
        let cancel = CancellationToken::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        let result = bounded(deadline, &cancel, async { 7 }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_bounded_deadline_interrupts_pending_operation() {
        let cancel = CancellationToken::new();
        let deadline = Instant::now();
        let result = bounded(deadline, &cancel, std::future::pending::<()>()).await;
        assert_eq!(result.unwrap_err(), Interrupted::DeadlineExceeded);
    }

    #[tokio::test]
    async fn test_bounded_cancellation_interrupts_pending_operation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let deadline = Instant::now() + Duration::from_secs(5);
        let result = bounded(deadline, &cancel, std::future::pending::<()>()).await;
        assert_eq!(result.unwrap_err(), Interrupted::Cancelled);
    }

    #[test]
    fn test_interrupted_messages() {
        assert_eq!(
            Interrupted::DeadlineExceeded.to_string(),
            "execution deadline exceeded"
        );
        assert_eq!(
            Interrupted::Cancelled.to_string(),
            "execution cancelled by the caller"
        );
    }

    #[test]
    fn test_container_config_shape() {
        let mut env = HashMap::new();
        env.insert("A".to_string(), "b".to_string());
        let config = container_config("runbox/python:latest", "/host/abc", false, &env);

        assert_eq!(config.image.as_deref(), Some("runbox/python:latest"));
        assert_eq!(config.working_dir.as_deref(), Some("/data"));
        assert_eq!(config.user.as_deref(), Some("1000:1000"));
        assert_eq!(config.network_disabled, Some(true));
        assert_eq!(config.open_stdin, Some(true));
        assert_eq!(config.stdin_once, Some(true));

        let host_config = config.host_config.unwrap();
        assert_eq!(
            host_config.binds,
            Some(vec!["/host/abc:/data".to_string()])
        );
        assert_eq!(host_config.memory, Some(256 * 1024 * 1024));
        assert_eq!(host_config.nano_cpus, Some(500_000_000));
    }

    #[test]
    fn test_container_config_network_enabled() {
        let config = container_config("img", "/host/abc", true, &HashMap::new());
        assert_eq!(config.network_disabled, Some(false));
    }
}
