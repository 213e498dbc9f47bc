// Remote backend: commands run over ssh.
//
// One authenticated connection per job instance, held open with a
// control socket so every step reuses it. The host part of `ssh://`
// keeps its optional `user@` prefix.

use async_trait::async_trait;

use tokio::process::Command;

use crate::error::StepError;

use super::{run_piped, shell_quote, split_interpreter, Backend, ExecRequest, ProcessOutput};

pub struct RemoteBackend {
    host: String,
    control_path: String,
    connected: bool,
}

impl RemoteBackend {
    pub fn new(host: String) -> Self {
        let sanitized: String = host
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let control_path = format!("/tmp/bluejay-ssh-{}-{}.sock", std::process::id(), sanitized);
        Self {
            host,
            control_path,
            connected: false,
        }
    }

    fn base_command(&self) -> Command {
        let mut command = Command::new("ssh");
        command
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg("-o")
            .arg("ControlMaster=auto")
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path))
            .arg("-o")
            .arg("ControlPersist=60");
        command
    }
}

#[async_trait]
impl Backend for RemoteBackend {
    async fn acquire(&mut self) -> Result<(), StepError> {
        let mut command = self.base_command();
        command.arg(&self.host).arg("true");
        let output = run_piped(command, "").await?;
        if !output.success() {
            return Err(StepError::Backend(format!(
                "cannot connect to '{}': {}",
                self.host,
                output.stderr.trim()
            )));
        }
        self.connected = true;
        Ok(())
    }

    async fn execute(&self, request: &ExecRequest) -> Result<ProcessOutput, StepError> {
        let (program, args) = split_interpreter(&request.shell)?;

        // Assemble the command line the remote login shell will run:
        // cd into the working directory, set per-command env, then the
        // interpreter reading the script from stdin.
        let mut remote = String::new();
        if let Some(dir) = &request.working_dir {
            let dir = shell_quote(dir);
            remote.push_str(&format!("mkdir -p {} && cd {} && ", dir, dir));
        }
        for (key, value) in &request.env {
            remote.push_str(&format!("{}={} ", key, shell_quote(value)));
        }
        remote.push_str(&program);
        for arg in &args {
            remote.push(' ');
            remote.push_str(arg);
        }

        let mut command = self.base_command();
        command.arg(&self.host).arg("--").arg(remote);
        run_piped(command, &request.script).await
    }

    async fn release(&mut self) -> Result<(), StepError> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;
        let mut command = Command::new("ssh");
        command
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path))
            .arg("-O")
            .arg("exit")
            .arg(&self.host);
        let _ = run_piped(command, "").await;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("ssh://{}", self.host)
    }
}
