// Execution backends
// Every backend exposes the same contract: acquire once per job
// instance, execute commands by feeding the script to an interpreter
// on stdin, release on every exit path.

pub mod container;
pub mod local;
pub mod remote;

use async_trait::async_trait;

use std::borrow::Cow;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::StepError;

pub use container::ContainerBackend;
pub use local::LocalBackend;
pub use remote::RemoteBackend;

/// Env var holding the path of the per-step output capture file on the
/// target host. `key=value` lines appended to it become step outputs.
pub const OUTPUT_CHANNEL_ENV: &str = "BLUEJAY_OUTPUT";

/// Shell selector used when neither the step nor the job names one.
pub const DEFAULT_SHELL: &str = "bash";

/// Captured stdout/stderr beyond this many bytes is dropped.
const MAX_CAPTURE_BYTES: usize = 1 << 20;

static CAPTURE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Interpreter command line for a shell selector. Unknown selectors are
/// used verbatim, so any executable on the target can act as the shell.
pub fn interpreter_for(shell: &str) -> &str {
    match shell {
        "bash" => "bash -euo pipefail",
        "sh" => "sh -eu",
        "python" => "python3 -qsIEB",
        other => other,
    }
}

/// Where a job instance runs, parsed from its interpolated `runs_on`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Local,
    Container { reference: String },
    Remote { host: String },
}

impl Target {
    pub fn parse(runs_on: Option<&str>) -> Result<Self, StepError> {
        match runs_on {
            None | Some("") => Ok(Target::Local),
            Some(value) => {
                if let Some(reference) = value.strip_prefix("docker://") {
                    if reference.is_empty() {
                        return Err(StepError::Backend(
                            "docker:// target without an image or container".to_string(),
                        ));
                    }
                    Ok(Target::Container {
                        reference: reference.to_string(),
                    })
                } else if let Some(host) = value.strip_prefix("ssh://") {
                    if host.is_empty() {
                        return Err(StepError::Backend(
                            "ssh:// target without a host".to_string(),
                        ));
                    }
                    Ok(Target::Remote {
                        host: host.to_string(),
                    })
                } else {
                    Err(StepError::Backend(format!(
                        "unsupported execution target '{}'",
                        value
                    )))
                }
            }
        }
    }

    pub fn backend(&self) -> Box<dyn Backend> {
        match self {
            Target::Local => Box::new(LocalBackend::new()),
            Target::Container { reference } => Box::new(ContainerBackend::new(reference.clone())),
            Target::Remote { host } => Box::new(RemoteBackend::new(host.clone())),
        }
    }
}

/// One command execution on a backend.
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    /// Script text fed to the interpreter on stdin
    pub script: String,
    /// Shell selector, resolved through `interpreter_for`
    pub shell: String,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<String>,
}

impl ExecRequest {
    pub fn new(script: impl Into<String>, shell: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            shell: shell.into(),
            env: Vec::new(),
            working_dir: None,
        }
    }
}

/// Outcome of one executed command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A place commands run: the orchestrator host, a docker container or
/// an ssh remote.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Prepare the target before any step of a job instance runs.
    async fn acquire(&mut self) -> Result<(), StepError> {
        Ok(())
    }

    async fn execute(&self, request: &ExecRequest) -> Result<ProcessOutput, StepError>;

    /// Tear down whatever `acquire` set up. Must be idempotent.
    async fn release(&mut self) -> Result<(), StepError> {
        Ok(())
    }

    fn describe(&self) -> String;
}

/// Run a step command with the output capture channel wired up: create
/// the capture file on the target, execute with `BLUEJAY_OUTPUT` set,
/// read back `key=value` lines and remove the file.
pub async fn exec_with_capture(
    backend: &dyn Backend,
    request: &ExecRequest,
) -> Result<(ProcessOutput, Vec<(String, String)>), StepError> {
    let capture_path = capture_file_path();

    backend
        .execute(&ExecRequest::new(
            format!("touch {}", shell_quote(&capture_path)),
            "sh",
        ))
        .await?;

    let mut request = request.clone();
    request
        .env
        .push((OUTPUT_CHANNEL_ENV.to_string(), capture_path.clone()));
    let output = backend.execute(&request).await;

    let read = ExecRequest::new(format!("cat {}", shell_quote(&capture_path)), "sh");
    let captured = match backend.execute(&read).await {
        Ok(result) if result.success() => parse_output_lines(&result.stdout),
        _ => Vec::new(),
    };

    let cleanup = ExecRequest::new(format!("rm -f {}", shell_quote(&capture_path)), "sh");
    let _ = backend.execute(&cleanup).await;

    Ok((output?, captured))
}

fn capture_file_path() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let seq = CAPTURE_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("/tmp/bluejay-{}-{:x}-{}.out", std::process::id(), nanos, seq)
}

fn parse_output_lines(text: &str) -> Vec<(String, String)> {
    text.lines()
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

/// Single-quote a string for a POSIX shell.
pub(crate) fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', "'\\''"))
}

/// Interpreter command line split into program and arguments.
pub(crate) fn split_interpreter(shell: &str) -> Result<(String, Vec<String>), StepError> {
    let mut parts = interpreter_for(shell).split_whitespace().map(str::to_string);
    let program = parts
        .next()
        .ok_or_else(|| StepError::Backend("empty shell selector".to_string()))?;
    Ok((program, parts.collect()))
}

/// Spawn the command, feed `stdin_data` on stdin and collect output.
pub(crate) async fn run_piped(
    mut command: tokio::process::Command,
    stdin_data: &str,
) -> Result<ProcessOutput, StepError> {
    use std::process::Stdio;
    use tokio::io::AsyncWriteExt;

    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .map_err(|e| StepError::Backend(format!("failed to spawn process: {}", e)))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(stdin_data.as_bytes())
            .await
            .map_err(|e| StepError::Backend(format!("failed to write script: {}", e)))?;
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| StepError::Backend(e.to_string()))?;

    Ok(ProcessOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: truncate_capture(String::from_utf8_lossy(&output.stdout)),
        stderr: truncate_capture(String::from_utf8_lossy(&output.stderr)),
    })
}

fn truncate_capture(text: Cow<'_, str>) -> String {
    let mut text = text.into_owned();
    if text.len() > MAX_CAPTURE_BYTES {
        let mut end = MAX_CAPTURE_BYTES;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpreter_table() {
        assert_eq!(interpreter_for("bash"), "bash -euo pipefail");
        assert_eq!(interpreter_for("sh"), "sh -eu");
        assert_eq!(interpreter_for("python"), "python3 -qsIEB");
        assert_eq!(interpreter_for("/usr/bin/env node"), "/usr/bin/env node");
    }

    #[test]
    fn test_target_parse() {
        assert_eq!(Target::parse(None).unwrap(), Target::Local);
        assert_eq!(Target::parse(Some("")).unwrap(), Target::Local);
        assert_eq!(
            Target::parse(Some("docker://alpine:3.20")).unwrap(),
            Target::Container {
                reference: "alpine:3.20".to_string()
            }
        );
        assert_eq!(
            Target::parse(Some("ssh://deploy@build-01")).unwrap(),
            Target::Remote {
                host: "deploy@build-01".to_string()
            }
        );
        assert!(Target::parse(Some("qemu://vm")).is_err());
        assert!(Target::parse(Some("docker://")).is_err());
    }

    #[test]
    fn test_parse_output_lines() {
        let text = "version=1.2.3\nnot a pair\npath=/tmp/x=y\n=empty\n";
        let pairs = parse_output_lines(text);
        assert_eq!(
            pairs,
            vec![
                ("version".to_string(), "1.2.3".to_string()),
                ("path".to_string(), "/tmp/x=y".to_string()),
            ]
        );
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn test_truncate_capture() {
        let long = "x".repeat(MAX_CAPTURE_BYTES + 100);
        assert_eq!(truncate_capture(Cow::Owned(long)).len(), MAX_CAPTURE_BYTES);
        assert_eq!(truncate_capture(Cow::Borrowed("short")), "short");
    }

    #[tokio::test]
    async fn test_run_piped_feeds_stdin() {
        let command = tokio::process::Command::new("sh");
        let output = run_piped(command, "echo hello from stdin").await.unwrap();
        assert_eq!(output.exit_code, 0);
        assert_eq!(output.stdout.trim(), "hello from stdin");
    }

    #[tokio::test]
    async fn test_run_piped_reports_exit_code() {
        let command = tokio::process::Command::new("sh");
        let output = run_piped(command, "exit 7").await.unwrap();
        assert_eq!(output.exit_code, 7);
    }
}
