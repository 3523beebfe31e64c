//! Batch compound analysis with progress reporting

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::compound::{self, CompoundAnalysis};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchInput {
    pub formulas: Vec<String>,
}

/// Outcome for one formula; failures are reported in place
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchItem {
    Ok {
        formula: String,
        analysis: CompoundAnalysis,
    },
    Error {
        formula: String,
        error: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub items: Vec<BatchItem>,
    pub succeeded: usize,
    pub failed: usize,
}

/// Analyse every formula, calling `progress(done, total, formula)` after each
pub fn analyze<F>(input: &BatchInput, mut progress: F) -> BatchResult
where
    F: FnMut(u64, u64, &str),
{
    let total = input.formulas.len() as u64;
    let mut items = Vec::with_capacity(input.formulas.len());
    let mut failed = 0;

    for (i, formula) in input.formulas.iter().enumerate() {
        let item = match compound::analyze(formula) {
            Ok(analysis) => BatchItem::Ok {
                formula: formula.clone(),
                analysis,
            },
            Err(e) => {
                debug!(formula = %formula, error = %e, "batch item failed");
                failed += 1;
                BatchItem::Error {
                    formula: formula.clone(),
                    error: e.to_string(),
                }
            }
        };
        items.push(item);
        progress(i as u64 + 1, total, formula);
    }

    BatchResult {
        succeeded: items.len() - failed,
        failed,
        items,
    }
}
