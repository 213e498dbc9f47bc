use color_eyre::eyre::eyre;
use color_eyre::Result;

use std::collections::HashMap;
use std::env;

use workflow_service::{
    parse_workflow_file, progress_channel, ExecutorConfig, Reporter, WorkflowExecutor,
};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 || args[1] != "run" {
        usage(&args[0]);
        std::process::exit(2);
    }

    let path = args[2].clone();
    let mut inputs: HashMap<String, String> = HashMap::new();
    let mut max_workers = 1usize;

    let mut i = 3;
    while i < args.len() {
        match args[i].as_str() {
            "--input" => {
                let binding = args
                    .get(i + 1)
                    .ok_or_else(|| eyre!("--input needs a key=value argument"))?;
                let (key, value) = binding
                    .split_once('=')
                    .ok_or_else(|| eyre!("invalid input binding '{}'", binding))?;
                inputs.insert(key.to_string(), value.to_string());
                i += 2;
            }
            "--workers" => {
                let count = args
                    .get(i + 1)
                    .ok_or_else(|| eyre!("--workers needs a number"))?;
                max_workers = count.parse()?;
                i += 2;
            }
            other => {
                usage(&args[0]);
                return Err(eyre!("unknown argument '{}'", other));
            }
        }
    }

    let workflow = parse_workflow_file(&path)?;

    let (tx, rx) = progress_channel();
    let executor = WorkflowExecutor::new()
        .with_config(ExecutorConfig { max_workers })
        .with_progress(tx);

    let run = tokio::spawn(async move { executor.execute(&workflow, inputs).await });

    Reporter::render(rx).await;

    let result = run.await??;
    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}

fn usage(program: &str) {
    eprintln!(
        "Usage: {} run <workflow.yaml> [--input key=value]... [--workers N]",
        program
    );
}
