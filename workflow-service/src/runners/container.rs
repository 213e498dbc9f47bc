// Container backend: commands run inside a docker container.
//
// `docker://ref` first tries to attach to a running container whose
// name or id matches `ref`; otherwise `ref` is treated as an image and
// a throwaway container is started. Only containers this backend
// started are stopped and removed on release.

use async_trait::async_trait;

use tokio::process::Command;

use crate::error::StepError;

use super::{run_piped, split_interpreter, Backend, ExecRequest, ProcessOutput};

pub struct ContainerBackend {
    reference: String,
    container_id: Option<String>,
    started: bool,
}

impl ContainerBackend {
    pub fn new(reference: String) -> Self {
        Self {
            reference,
            container_id: None,
            started: false,
        }
    }

    async fn docker(&self, args: &[&str]) -> Result<ProcessOutput, StepError> {
        let mut command = Command::new("docker");
        command.args(args);
        run_piped(command, "").await
    }

    async fn find_running(&self, filter: &str) -> Result<Option<String>, StepError> {
        let output = self
            .docker(&["ps", "--filter", filter, "--quiet", "--no-trunc"])
            .await?;
        if !output.success() {
            return Err(StepError::Backend(format!(
                "docker ps failed: {}",
                output.stderr.trim()
            )));
        }
        Ok(output
            .stdout
            .lines()
            .next()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string))
    }
}

#[async_trait]
impl Backend for ContainerBackend {
    async fn acquire(&mut self) -> Result<(), StepError> {
        let by_name = self.find_running(&format!("name={}", self.reference)).await?;
        if let Some(id) = by_name {
            self.container_id = Some(id);
            return Ok(());
        }
        let by_id = self.find_running(&format!("id={}", self.reference)).await?;
        if let Some(id) = by_id {
            self.container_id = Some(id);
            return Ok(());
        }

        // Not a running container: treat the reference as an image.
        let output = self
            .docker(&["run", "--detach", &self.reference, "sleep", "infinity"])
            .await?;
        if !output.success() {
            return Err(StepError::Backend(format!(
                "cannot start container from '{}': {}",
                self.reference,
                output.stderr.trim()
            )));
        }
        self.container_id = Some(output.stdout.trim().to_string());
        self.started = true;
        Ok(())
    }

    async fn execute(&self, request: &ExecRequest) -> Result<ProcessOutput, StepError> {
        let id = self
            .container_id
            .as_deref()
            .ok_or_else(|| StepError::Backend("container not acquired".to_string()))?;

        if let Some(dir) = &request.working_dir {
            let mkdir = self.docker(&["exec", id, "mkdir", "-p", dir]).await?;
            if !mkdir.success() {
                return Err(StepError::Backend(format!(
                    "cannot create working directory '{}': {}",
                    dir,
                    mkdir.stderr.trim()
                )));
            }
        }

        let (program, args) = split_interpreter(&request.shell)?;
        let mut command = Command::new("docker");
        command.arg("exec").arg("--interactive");
        for (key, value) in &request.env {
            command.arg("--env").arg(format!("{}={}", key, value));
        }
        if let Some(dir) = &request.working_dir {
            command.arg("--workdir").arg(dir);
        }
        command.arg(id).arg(program).args(&args);

        run_piped(command, &request.script).await
    }

    async fn release(&mut self) -> Result<(), StepError> {
        if !self.started {
            self.container_id = None;
            return Ok(());
        }
        self.started = false;
        if let Some(id) = self.container_id.take() {
            let _ = self.docker(&["stop", &id]).await;
            let _ = self.docker(&["rm", &id]).await;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("docker://{}", self.reference)
    }
}
