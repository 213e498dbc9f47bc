// Local backend: child processes on the orchestrator host.

use async_trait::async_trait;

use tokio::process::Command;

use crate::error::StepError;

use super::{run_piped, split_interpreter, Backend, ExecRequest, ProcessOutput};

#[derive(Debug, Default)]
pub struct LocalBackend;

impl LocalBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn execute(&self, request: &ExecRequest) -> Result<ProcessOutput, StepError> {
        let (program, args) = split_interpreter(&request.shell)?;
        let program = which::which(&program)
            .map_err(|_| StepError::Backend(format!("interpreter '{}' not found", program)))?;

        let mut command = Command::new(program);
        command.args(&args);
        for (key, value) in &request.env {
            command.env(key, value);
        }
        if let Some(dir) = &request.working_dir {
            std::fs::create_dir_all(dir).map_err(|e| {
                StepError::Backend(format!("cannot create working directory '{}': {}", dir, e))
            })?;
            command.current_dir(dir);
        }

        run_piped(command, &request.script).await
    }

    fn describe(&self) -> String {
        "local".to_string()
    }
}
