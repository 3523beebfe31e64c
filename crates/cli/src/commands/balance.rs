// Equation balancing command

use crate::output::{OutputFormat, Table};
use anyhow::Result;
use futures::future::join_all;
use reagent_pool::{CalculationKind, PoolConfig, Task};
use serde::Serialize;
use serde_json::{json, Value};

use super::start_pool;

#[derive(Debug, Serialize)]
struct BalanceLine {
    equation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    balanced: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub async fn run(
    config: PoolConfig,
    output: OutputFormat,
    equations: Vec<String>,
) -> Result<()> {
    let pool = start_pool(config).await?;

    let mut handles = Vec::with_capacity(equations.len());
    for equation in &equations {
        let task = Task::new(CalculationKind::BalanceEquation, json!({ "equation": equation }));
        handles.push(pool.submit_task(task).await?);
    }

    let lines: Vec<BalanceLine> = join_all(handles)
        .await
        .into_iter()
        .zip(equations)
        .map(|(outcome, equation)| match outcome {
            Ok(result) => BalanceLine {
                equation,
                balanced: Some(result.data),
                error: None,
            },
            Err(e) => BalanceLine {
                equation,
                balanced: None,
                error: Some(e.to_string()),
            },
        })
        .collect();

    pool.shutdown().await;

    if output.is_text() {
        let table = Table::new(&[("EQUATION", 32), ("BALANCED", 48)]);
        for line in &lines {
            let balanced = match (&line.balanced, &line.error) {
                (Some(value), _) => value["equation"].as_str().unwrap_or("-").to_string(),
                (None, Some(error)) => format!("error: {error}"),
                (None, None) => "-".to_string(),
            };
            table.row(&[line.equation.as_str(), balanced.as_str()]);
        }
    } else {
        output.print_value(&lines)?;
    }

    if lines.iter().any(|line| line.error.is_some()) {
        anyhow::bail!("Some equations could not be balanced");
    }
    Ok(())
}
