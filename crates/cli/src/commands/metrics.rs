// Demo batch with a metrics report

use crate::output::{format_bytes, print_field, OutputFormat, Table};
use anyhow::Result;
use futures::future::join_all;
use reagent_pool::{CalculationKind, PoolConfig, PoolMetrics, Task, WorkerInfo};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::info;

const DEMO_EQUATIONS: [&str; 4] = [
    "H2 + O2 = H2O",
    "Na + Cl2 = NaCl",
    "CH4 + O2 = CO2 + H2O",
    "Fe + O2 = Fe2O3",
];

const DEMO_FORMULAS: [&str; 4] = ["C6H12O6", "CuSO4·5H2O", "Ca(OH)2", "K4[Fe(CN)6]"];

#[derive(Serialize)]
struct Report {
    metrics: PoolMetrics,
    workers: Vec<WorkerInfo>,
}

/// Cycle through a fixed mix of calculation kinds
fn demo_task(i: usize) -> Task {
    let (kind, payload): (CalculationKind, Value) = match i % 4 {
        0 => (
            CalculationKind::BalanceEquation,
            json!({ "equation": DEMO_EQUATIONS[i / 4 % DEMO_EQUATIONS.len()] }),
        ),
        1 => (
            CalculationKind::CompoundAnalysis,
            json!({ "formula": DEMO_FORMULAS[i / 4 % DEMO_FORMULAS.len()] }),
        ),
        2 => (
            CalculationKind::MatrixSolve,
            json!({ "matrix": [[4.0, 1.0], [1.0, 3.0]], "vector": [1.0, 2.0], "method": "lu" }),
        ),
        _ => (
            CalculationKind::BatchAnalysis,
            json!({ "formulas": DEMO_FORMULAS }),
        ),
    };
    Task::new(kind, payload)
}

pub async fn run(config: PoolConfig, output: OutputFormat, tasks: usize) -> Result<()> {
    let pool = super::start_pool(config).await?;

    let mut handles = Vec::with_capacity(tasks);
    for i in 0..tasks {
        handles.push(pool.submit_task(demo_task(i)).await?);
    }
    let failures = join_all(handles)
        .await
        .into_iter()
        .filter(Result::is_err)
        .count();
    info!(tasks, failures, "demo batch finished");

    let report = Report {
        metrics: pool.metrics().await?,
        workers: pool.worker_info().await?,
    };
    pool.shutdown().await;

    if !output.is_text() {
        return output.print_value(&report);
    }

    let m = &report.metrics;
    print_field("Workers", &m.total_workers.to_string());
    print_field(
        "Tasks",
        &format!(
            "{} total, {} completed, {} failed",
            m.total_tasks, m.completed_tasks, m.failed_tasks
        ),
    );
    print_field(
        "Avg execution",
        &format!("{:.2} ms", m.avg_execution_time.as_secs_f64() * 1000.0),
    );
    print_field("Throughput", &format!("{:.1} tasks/s", m.throughput));
    print_field("Error rate", &format!("{:.1}%", m.error_rate * 100.0));
    print_field("Memory", &format_bytes(m.memory_usage));
    print_field("Peak memory", &format_bytes(m.peak_memory));
    println!();

    let table = Table::new(&[("WORKER", 12), ("STATUS", 10), ("TASKS", 6), ("AVG MS", 8)]);
    for worker in &report.workers {
        let status = worker.status.to_string();
        let tasks = worker.tasks_completed.to_string();
        let avg = format!("{:.2}", worker.avg_execution_time().as_secs_f64() * 1000.0);
        table.row(&[worker.id.as_str(), status.as_str(), tasks.as_str(), avg.as_str()]);
    }
    Ok(())
}
