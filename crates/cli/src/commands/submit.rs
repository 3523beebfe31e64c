// Single calculation command

use std::time::Duration;

use crate::output::{print_field, OutputFormat};
use anyhow::{Context, Result};
use reagent_pool::{CalculationKind, PoolConfig, Task};
use serde_json::Value;

use super::start_pool;

pub async fn run(
    config: PoolConfig,
    output: OutputFormat,
    kind: CalculationKind,
    payload: &str,
    timeout: u64,
) -> Result<()> {
    let payload: Value = serde_json::from_str(payload).context("Payload is not valid JSON")?;
    let task = Task::new(kind, payload).with_timeout(Duration::from_secs(timeout));
    let task_id = task.id.clone();

    let pool = start_pool(config).await?;
    let outcome = pool.execute(task).await;
    pool.shutdown().await;

    let result = outcome.with_context(|| format!("Task {task_id} failed"))?;

    if output.is_text() {
        print_field("Task", &result.task_id.to_string());
        print_field("Kind", kind.as_str());
        print_field("Worker", result.worker_id.as_deref().unwrap_or("-"));
        print_field(
            "Execution time",
            &format!("{} ms", result.execution_time.as_millis()),
        );
        println!();
        println!("{}", serde_json::to_string_pretty(&result.data)?);
    } else {
        output.print_value(&result)?;
    }
    Ok(())
}
