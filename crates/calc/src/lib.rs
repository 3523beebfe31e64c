//! # Reference calculation handlers
//!
//! Implementations of the six calculation kinds for the Reagent worker pool.
//! Each handler takes a JSON payload and returns a JSON result:
//!
//! | Kind                | Payload                                                      |
//! |---------------------|--------------------------------------------------------------|
//! | `balance-equation`  | `{"equation": "H2 + O2 = H2O"}`                              |
//! | `thermodynamics`    | `{"reactants": [..], "products": [..], "temperature": 298.15}` |
//! | `matrix-solve`      | `{"matrix": [[..]], "vector": [..], "method": "lu"}`         |
//! | `batch-analysis`    | `{"formulas": ["H2O", "NaCl"]}`                              |
//! | `stoichiometry`     | `{"equation": "..", "masses": {"H2": 4.0}}`                  |
//! | `compound-analysis` | `{"formula": "C6H12O6"}`                                     |
//!
//! ```
//! use reagent_pool::{CalculationKind, TaskContext};
//! use serde_json::json;
//!
//! let handlers = reagent_calc::builtin_handlers();
//! let out = handlers
//!     .dispatch(
//!         CalculationKind::BalanceEquation,
//!         &json!({"equation": "Na + Cl2 = NaCl"}),
//!         &TaskContext::new("doc"),
//!     )
//!     .unwrap();
//! assert_eq!(out["coefficients"], json!([2, 1, 2]));
//! ```

pub mod balance;
pub mod batch;
pub mod compound;
pub mod error;
pub mod formula;
pub mod linalg;
pub mod stoich;
pub mod thermo;

pub use error::CalcError;

use reagent_pool::{CalculationKind, HandlerError, HandlerTable, TaskContext};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use linalg::SolveMethod;

/// Handler table with every reference calculation registered
pub fn builtin_handlers() -> HandlerTable {
    HandlerTable::new()
        .with(CalculationKind::BalanceEquation, balance_equation)
        .with(CalculationKind::Thermodynamics, thermodynamics)
        .with(CalculationKind::MatrixSolve, matrix_solve)
        .with(CalculationKind::BatchAnalysis, batch_analysis)
        .with(CalculationKind::Stoichiometry, stoichiometry)
        .with(CalculationKind::CompoundAnalysis, compound_analysis)
}

fn parse<T: DeserializeOwned>(payload: &Value) -> Result<T, CalcError> {
    Ok(T::deserialize(payload)?)
}

fn respond<T: Serialize>(output: &T) -> Result<Value, HandlerError> {
    serde_json::to_value(output).map_err(|e| HandlerError::failed(format!("unserializable result: {e}")))
}

#[derive(Deserialize)]
struct EquationInput {
    equation: String,
}

#[derive(Deserialize)]
struct FormulaInput {
    formula: String,
}

#[derive(Deserialize)]
struct MatrixInput {
    matrix: Vec<Vec<f64>>,
    vector: Vec<f64>,
    #[serde(default)]
    method: SolveMethod,
}

#[derive(Serialize)]
struct MatrixOutput {
    solution: Vec<f64>,
    residual_norm: f64,
    method: SolveMethod,
}

fn balance_equation(payload: &Value, _ctx: &TaskContext) -> Result<Value, HandlerError> {
    let input: EquationInput = parse(payload)?;
    respond(&balance::balance(&input.equation)?)
}

fn thermodynamics(payload: &Value, _ctx: &TaskContext) -> Result<Value, HandlerError> {
    let input: thermo::ThermoInput = parse(payload)?;
    respond(&thermo::analyze(&input)?)
}

fn matrix_solve(payload: &Value, _ctx: &TaskContext) -> Result<Value, HandlerError> {
    let input: MatrixInput = parse(payload)?;
    let solution = linalg::solve(&input.matrix, &input.vector, input.method)?;
    let residual_norm = linalg::residual_norm(&input.matrix, &solution, &input.vector);
    respond(&MatrixOutput {
        solution,
        residual_norm,
        method: input.method,
    })
}

fn batch_analysis(payload: &Value, ctx: &TaskContext) -> Result<Value, HandlerError> {
    let input: batch::BatchInput = parse(payload)?;
    let result = batch::analyze(&input, |done, total, formula| {
        ctx.report_progress_with(done, total, formula)
    });
    respond(&result)
}

fn stoichiometry(payload: &Value, _ctx: &TaskContext) -> Result<Value, HandlerError> {
    let input: stoich::StoichInput = parse(payload)?;
    respond(&stoich::analyze(&input)?)
}

fn compound_analysis(payload: &Value, _ctx: &TaskContext) -> Result<Value, HandlerError> {
    let input: FormulaInput = parse(payload)?;
    respond(&compound::analyze(&input.formula)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn run(kind: CalculationKind, payload: Value) -> Result<Value, HandlerError> {
        builtin_handlers().dispatch(kind, &payload, &TaskContext::new("test"))
    }

    #[test]
    fn test_every_kind_is_registered() {
        let handlers = builtin_handlers();
        for kind in CalculationKind::ALL {
            assert!(handlers.supports(kind), "{kind} missing");
        }
    }

    #[test]
    fn test_matrix_solve_reports_residual() {
        let out = run(
            CalculationKind::MatrixSolve,
            json!({"matrix": [[4.0, 1.0], [1.0, 3.0]], "vector": [1.0, 2.0], "method": "lu"}),
        )
        .unwrap();
        assert_eq!(out["method"], "lu");
        assert!(out["residual_norm"].as_f64().unwrap() < 1e-12);
        let x: Vec<f64> = serde_json::from_value(out["solution"].clone()).unwrap();
        assert!((x[0] - 1.0 / 11.0).abs() < 1e-12);
        assert!((x[1] - 7.0 / 11.0).abs() < 1e-12);
    }

    #[test]
    fn test_error_classification() {
        let err = run(CalculationKind::CompoundAnalysis, json!({"formula": "Qq"})).unwrap_err();
        assert!(matches!(err, HandlerError::InvalidInput(_)));

        let err = run(CalculationKind::BalanceEquation, json!({"wrong": 1})).unwrap_err();
        assert!(matches!(err, HandlerError::InvalidInput(_)));

        let err = run(
            CalculationKind::MatrixSolve,
            json!({"matrix": [[1.0, 2.0], [2.0, 4.0]], "vector": [1.0, 2.0]}),
        )
        .unwrap_err();
        assert!(matches!(err, HandlerError::Failed(_)));
    }

    #[test]
    fn test_batch_reports_progress() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = TaskContext::with_progress_channel("batch", tx);
        let out = builtin_handlers()
            .dispatch(
                CalculationKind::BatchAnalysis,
                &json!({"formulas": ["H2O", "CO2"]}),
                &ctx,
            )
            .unwrap();

        assert_eq!(out["succeeded"], 2);
        let first = rx.try_recv().unwrap();
        assert_eq!((first.completed, first.total), (1, 2));
        assert_eq!(first.message.as_deref(), Some("H2O"));
        assert_eq!(rx.try_recv().unwrap().completed, 2);
    }

    #[test]
    fn test_stoichiometry_payload() {
        let out = run(
            CalculationKind::Stoichiometry,
            json!({"equation": "CH4 + O2 = CO2 + H2O", "masses": {"CH4": 16.0, "O2": 16.0}}),
        )
        .unwrap();
        assert_eq!(out["limiting_reagent"], "O2");
        assert_eq!(out["coefficients"]["O2"], 2);
    }
}
