//! Reaction thermodynamics

use serde::{Deserialize, Serialize};

use crate::error::CalcError;
use crate::formula::Formula;

/// Gas constant, J/(mol·K)
pub const GAS_CONSTANT: f64 = 8.314_462_618;

/// Standard temperature, K
pub const STANDARD_TEMPERATURE: f64 = 298.15;

/// Standard enthalpy of formation (kJ/mol) and standard entropy (J/(mol·K))
const STANDARD_DATA: &[(&str, f64, f64)] = &[
    ("H2O", -285.83, 69.91),
    ("H2", 0.0, 130.68),
    ("O2", 0.0, 205.15),
    ("N2", 0.0, 191.61),
    ("Cl2", 0.0, 223.08),
    ("C", 0.0, 5.74),
    ("Na", 0.0, 51.21),
    ("Fe", 0.0, 27.28),
    ("CO", -110.53, 197.67),
    ("CO2", -393.51, 213.79),
    ("CH4", -74.81, 186.26),
    ("NH3", -46.11, 192.45),
    ("HCl", -92.31, 186.91),
    ("NaCl", -411.15, 72.13),
    ("Fe2O3", -824.2, 87.4),
    ("C6H12O6", -1273.3, 212.1),
];

/// Standard values for a formula from the built-in table
pub fn standard_data(formula: &str) -> Option<(f64, f64)> {
    let formula = Formula::parse(formula).ok()?;
    STANDARD_DATA
        .iter()
        .find(|(f, _, _)| *f == formula.text())
        .map(|(_, h, s)| (*h, *s))
}

fn default_coefficient() -> f64 {
    1.0
}

fn default_temperature() -> f64 {
    STANDARD_TEMPERATURE
}

/// A species taking part in the reaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Species {
    pub formula: String,
    #[serde(default = "default_coefficient")]
    pub coefficient: f64,
    /// Enthalpy of formation, kJ/mol
    pub delta_h: Option<f64>,
    /// Standard entropy, J/(mol·K)
    pub entropy: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThermoInput {
    pub reactants: Vec<Species>,
    pub products: Vec<Species>,
    /// Kelvin
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThermoResult {
    /// kJ/mol
    pub delta_h: f64,
    /// J/(mol·K)
    pub delta_s: f64,
    /// kJ/mol
    pub delta_g: f64,
    pub ln_k: f64,
    /// `null` when it overflows
    pub equilibrium_constant: Option<f64>,
    pub spontaneous: bool,
    pub temperature: f64,
}

pub fn analyze(input: &ThermoInput) -> Result<ThermoResult, CalcError> {
    let t = input.temperature;
    if !(t.is_finite() && t > 0.0) {
        return Err(CalcError::Input(format!("temperature must be positive, got {t}")));
    }
    if input.reactants.is_empty() || input.products.is_empty() {
        return Err(CalcError::Input("reactants and products must not be empty".into()));
    }

    let (h_react, s_react) = totals(&input.reactants)?;
    let (h_prod, s_prod) = totals(&input.products)?;
    let delta_h = h_prod - h_react;
    let delta_s = s_prod - s_react;
    let delta_g = delta_h - t * delta_s / 1000.0;

    let ln_k = -delta_g * 1000.0 / (GAS_CONSTANT * t);
    let k = ln_k.exp();

    Ok(ThermoResult {
        delta_h,
        delta_s,
        delta_g,
        ln_k,
        equilibrium_constant: k.is_finite().then_some(k),
        spontaneous: delta_g < 0.0,
        temperature: t,
    })
}

fn totals(species: &[Species]) -> Result<(f64, f64), CalcError> {
    let mut enthalpy = 0.0;
    let mut entropy = 0.0;

    for s in species {
        if s.coefficient <= 0.0 {
            return Err(CalcError::Input(format!(
                "coefficient of {} must be positive",
                s.formula
            )));
        }
        let table = standard_data(&s.formula);
        let h = s
            .delta_h
            .or(table.map(|(h, _)| h))
            .ok_or_else(|| CalcError::MissingData(s.formula.clone()))?;
        let e = s
            .entropy
            .or(table.map(|(_, e)| e))
            .ok_or_else(|| CalcError::MissingData(s.formula.clone()))?;
        enthalpy += s.coefficient * h;
        entropy += s.coefficient * e;
    }

    Ok((enthalpy, entropy))
}
