//! Single compound analysis

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::CalcError;
use crate::formula::{atomic_mass, hill_notation, Formula};
use crate::linalg::gcd;

/// Share of one element in a compound
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementShare {
    pub element: String,
    pub count: u32,
    /// g/mol contributed by the element
    pub mass: f64,
    pub mass_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompoundAnalysis {
    pub formula: String,
    pub hill_formula: String,
    pub empirical_formula: String,
    /// g/mol
    pub molar_mass: f64,
    pub atom_count: u32,
    pub composition: Vec<ElementShare>,
}

pub fn analyze(formula: &str) -> Result<CompoundAnalysis, CalcError> {
    let parsed = Formula::parse(formula)?;
    let molar_mass = parsed.molar_mass();

    let composition = parsed
        .elements()
        .iter()
        .map(|(element, &count)| {
            let mass = atomic_mass(element).unwrap_or(0.0) * f64::from(count);
            ElementShare {
                element: element.clone(),
                count,
                mass,
                mass_percent: mass / molar_mass * 100.0,
            }
        })
        .collect();

    Ok(CompoundAnalysis {
        formula: parsed.text().to_string(),
        hill_formula: hill_notation(parsed.elements()),
        empirical_formula: hill_notation(&empirical(parsed.elements())),
        molar_mass,
        atom_count: parsed.elements().values().sum(),
        composition,
    })
}

/// Element counts divided by their greatest common divisor
fn empirical(elements: &BTreeMap<String, u32>) -> BTreeMap<String, u32> {
    let divisor = elements
        .values()
        .fold(0, |acc, &n| gcd(acc, i128::from(n)))
        .max(1);
    elements
        .iter()
        .map(|(element, &n)| (element.clone(), (i128::from(n) / divisor) as u32))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glucose() {
        let analysis = analyze("C6H12O6").unwrap();
        assert_eq!(analysis.empirical_formula, "CH2O");
        assert_eq!(analysis.atom_count, 24);
        assert!((analysis.molar_mass - 180.156).abs() < 1e-3);

        let carbon = analysis
            .composition
            .iter()
            .find(|share| share.element == "C")
            .unwrap();
        assert_eq!(carbon.count, 6);
        assert!((carbon.mass_percent - 40.002).abs() < 0.01);

        let total: f64 = analysis.composition.iter().map(|s| s.mass_percent).sum();
        assert!((total - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_empirical_of_irreducible_formula() {
        let analysis = analyze("H2O").unwrap();
        assert_eq!(analysis.empirical_formula, "H2O");
        assert_eq!(analysis.hill_formula, "H2O");
    }

    #[test]
    fn test_invalid_formula() {
        assert!(analyze("Zz").is_err());
    }
}
