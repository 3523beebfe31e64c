//! Reaction stoichiometry

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::balance::{coefficients, Equation};
use crate::error::CalcError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoichInput {
    pub equation: String,
    /// Available reactant masses in grams, by formula
    #[serde(default)]
    pub masses: BTreeMap<String, f64>,
    /// Measured product masses in grams, by formula
    #[serde(default)]
    pub actual_yields: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoichResult {
    pub coefficients: BTreeMap<String, u64>,
    /// Moles of each species per mole of the first reactant
    pub mole_ratios: BTreeMap<String, f64>,
    pub molar_masses: BTreeMap<String, f64>,
    /// Moles available for each reactant with a given mass
    pub moles: BTreeMap<String, f64>,
    pub limiting_reagent: Option<String>,
    /// Grams of each product at full conversion of the limiting reagent
    pub theoretical_yields: BTreeMap<String, f64>,
    pub percent_yields: BTreeMap<String, f64>,
}

pub fn analyze(input: &StoichInput) -> Result<StoichResult, CalcError> {
    let equation = Equation::parse(&input.equation)?;
    let coefs = coefficients(&equation)?;
    let reactant_count = equation.reactants.len();

    let names: Vec<String> = equation.species().map(|f| f.text().to_string()).collect();
    let coef_of = |name: &str| {
        names
            .iter()
            .position(|n| n == name)
            .map(|i| coefs[i] as f64)
    };

    let first = coefs[0] as f64;
    let mut result = StoichResult {
        coefficients: names.iter().cloned().zip(coefs.iter().copied()).collect(),
        mole_ratios: names
            .iter()
            .zip(&coefs)
            .map(|(name, &c)| (name.clone(), c as f64 / first))
            .collect(),
        molar_masses: equation
            .species()
            .map(|f| (f.text().to_string(), f.molar_mass()))
            .collect(),
        moles: BTreeMap::new(),
        limiting_reagent: None,
        theoretical_yields: BTreeMap::new(),
        percent_yields: BTreeMap::new(),
    };

    // Reaction extent each supplied reactant allows; the smallest limits
    let mut limiting: Option<(String, f64)> = None;
    for (name, &mass) in &input.masses {
        let Some(index) = names[..reactant_count].iter().position(|n| n == name) else {
            return Err(CalcError::Input(format!("{name} is not a reactant")));
        };
        if !(mass.is_finite() && mass >= 0.0) {
            return Err(CalcError::Input(format!("mass of {name} must be non-negative")));
        }
        let moles = mass / result.molar_masses[name];
        let extent = moles / coefs[index] as f64;
        result.moles.insert(name.clone(), moles);
        if limiting.as_ref().map_or(true, |(_, best)| extent < *best) {
            limiting = Some((name.clone(), extent));
        }
    }

    if let Some((reagent, extent)) = limiting {
        for product in &names[reactant_count..] {
            let coef = coef_of(product).unwrap_or(0.0);
            let grams = extent * coef * result.molar_masses[product];
            result.theoretical_yields.insert(product.clone(), grams);
        }
        result.limiting_reagent = Some(reagent);
    }

    for (name, &actual) in &input.actual_yields {
        let theoretical = result
            .theoretical_yields
            .get(name)
            .copied()
            .ok_or_else(|| CalcError::Input(format!("no theoretical yield for {name}")))?;
        if theoretical > 0.0 {
            result
                .percent_yields
                .insert(name.clone(), actual / theoretical * 100.0);
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(equation: &str, masses: &[(&str, f64)]) -> StoichInput {
        StoichInput {
            equation: equation.to_string(),
            masses: masses.iter().map(|(f, m)| (f.to_string(), *m)).collect(),
            actual_yields: BTreeMap::new(),
        }
    }

    #[test]
    fn test_limiting_reagent_and_yield() {
        // 4 g H2 is ~1.98 mol (extent 0.99), 32 g O2 is ~1 mol (extent 1.0)
        let mut request = input("H2 + O2 = H2O", &[("H2", 4.0), ("O2", 32.0)]);
        request.actual_yields.insert("H2O".into(), 30.0);
        let result = analyze(&request).unwrap();

        assert_eq!(result.coefficients["H2"], 2);
        assert_eq!(result.mole_ratios["O2"], 0.5);
        assert_eq!(result.limiting_reagent.as_deref(), Some("H2"));

        let water = result.theoretical_yields["H2O"];
        let expected = 4.0 / 2.016 * 18.015;
        assert!((water - expected).abs() < 1e-6);
        assert!((result.percent_yields["H2O"] - 30.0 / expected * 100.0).abs() < 1e-6);
    }

    #[test]
    fn test_ratios_without_masses() {
        let result = analyze(&input("CH4 + O2 = CO2 + H2O", &[])).unwrap();
        assert_eq!(result.mole_ratios["H2O"], 2.0);
        assert!(result.limiting_reagent.is_none());
        assert!(result.theoretical_yields.is_empty());
    }

    #[test]
    fn test_unknown_reactant_is_rejected() {
        let err = analyze(&input("H2 + O2 = H2O", &[("H2O", 1.0)])).unwrap_err();
        assert!(matches!(err, CalcError::Input(_)));
    }
}
