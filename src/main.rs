use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Semaphore;
use tracing::{error, info};

use code_runner::jobs::{ExecuteJob, ExecuteResult};
use code_runner::materializer::sweep_stale_artifacts;
use code_runner::redis_manager::RedisManager;
use code_runner::{CodeRunner, LanguageRegistry, RunnerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("code_runner=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let config = RunnerConfig::from_env().context("Failed to load configuration")?;

    let registry = match &config.languages_config {
        Some(path) => {
            let registry = LanguageRegistry::from_file(path)
                .with_context(|| format!("Failed to load languages from {:?}", path))?;
            info!("Loaded language configurations from {:?}", path);
            registry
        }
        None => LanguageRegistry::builtin().context("Failed to load built-in languages")?,
    };
    info!("Supported languages: {}", registry.supported_languages().join(", "));

    std::fs::create_dir_all(&config.scratch_dir)
        .with_context(|| format!("Failed to create scratch directory {:?}", config.scratch_dir))?;
    sweep_stale_artifacts(&config.scratch_dir, config.stale_artifact_age);

    info!(
        "Starting Code Runner worker (scratch={:?}, concurrency={}, timeout={:?}, memory={}MB)",
        config.scratch_dir,
        config.max_concurrent_executions,
        config.execution_timeout,
        config.max_memory_mb
    );

    let permits = Arc::new(Semaphore::new(config.max_concurrent_executions));
    let runner = Arc::new(CodeRunner::new(Arc::new(registry), config));

    let mut queue = RedisManager::from_env().await?;
    let results = queue.reconnected().await?;

    info!("Waiting for jobs...");

    loop {
        let permit = Arc::clone(&permits)
            .acquire_owned()
            .await
            .context("Execution semaphore closed")?;
        let job = queue.pop_job().await?;

        info!(
            "Received execute job: job_id={}, language={}",
            job.job_id, job.language
        );

        let runner = Arc::clone(&runner);
        let mut results = results.clone();
        tokio::spawn(async move {
            let result = process_job(&runner, &job).await;
            if let Err(e) = results.store_execute_result(&result).await {
                error!("Failed to store result for job {}: {:#}", job.job_id, e);
            }
            drop(permit);
        });
    }
}

async fn process_job(runner: &CodeRunner, job: &ExecuteJob) -> ExecuteResult {
    let outcome = runner.run(job.to_request()).await;
    info!(
        "Execute job completed: job_id={}, status={}",
        job.job_id,
        outcome.status()
    );
    ExecuteResult::new(job, outcome)
}
