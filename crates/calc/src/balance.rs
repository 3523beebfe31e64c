//! Chemical equation balancing

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::CalcError;
use crate::formula::Formula;
use crate::linalg::integer_null_vector;

const ARROWS: &[&str] = &["<=>", "->", "→", "="];

/// One side of an equation, formulas in written order
#[derive(Debug, Clone)]
pub struct Equation {
    pub reactants: Vec<Formula>,
    pub products: Vec<Formula>,
}

impl Equation {
    /// Parse `A + B = C + D`; `->`, `→` and `<=>` are accepted as arrows.
    /// Leading coefficients on terms are ignored.
    pub fn parse(input: &str) -> Result<Self, CalcError> {
        let (left, right) = ARROWS
            .iter()
            .find_map(|arrow| input.split_once(arrow))
            .ok_or_else(|| CalcError::Equation(format!("no arrow in '{input}'")))?;

        let reactants = parse_side(left)?;
        let products = parse_side(right)?;
        if reactants.is_empty() || products.is_empty() {
            return Err(CalcError::Equation(format!(
                "'{input}' needs at least one reactant and one product"
            )));
        }
        Ok(Self {
            reactants,
            products,
        })
    }

    /// Every formula, reactants first
    pub fn species(&self) -> impl Iterator<Item = &Formula> {
        self.reactants.iter().chain(&self.products)
    }
}

fn parse_side(side: &str) -> Result<Vec<Formula>, CalcError> {
    side.split('+')
        .map(|term| term.trim().trim_start_matches(|c: char| c.is_ascii_digit() || c.is_whitespace()))
        .filter(|term| !term.is_empty())
        .map(Formula::parse)
        .collect()
}

/// A balanced equation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balanced {
    /// Equation with coefficients, `1` omitted
    pub equation: String,
    /// Smallest positive integer coefficients, reactants first
    pub coefficients: Vec<u64>,
    pub reactants: Vec<String>,
    pub products: Vec<String>,
}

/// Balance an equation to the smallest positive integer coefficients
///
/// # Example
///
/// ```
/// let balanced = reagent_calc::balance::balance("CH4 + O2 = CO2 + H2O").unwrap();
/// assert_eq!(balanced.coefficients, vec![1, 2, 1, 2]);
/// assert_eq!(balanced.equation, "CH4 + 2O2 = CO2 + 2H2O");
/// ```
pub fn balance(input: &str) -> Result<Balanced, CalcError> {
    let equation = Equation::parse(input)?;
    let coefficients = coefficients(&equation)?;

    let reactant_count = equation.reactants.len();
    let term = |(formula, coef): (&Formula, &u64)| match coef {
        1 => formula.to_string(),
        n => format!("{n}{formula}"),
    };
    let left: Vec<String> = equation
        .reactants
        .iter()
        .zip(&coefficients[..reactant_count])
        .map(term)
        .collect();
    let right: Vec<String> = equation
        .products
        .iter()
        .zip(&coefficients[reactant_count..])
        .map(term)
        .collect();

    Ok(Balanced {
        equation: format!("{} = {}", left.join(" + "), right.join(" + ")),
        coefficients,
        reactants: equation.reactants.iter().map(ToString::to_string).collect(),
        products: equation.products.iter().map(ToString::to_string).collect(),
    })
}

/// Coefficients for a parsed equation, reactants first
pub fn coefficients(equation: &Equation) -> Result<Vec<u64>, CalcError> {
    let elements: BTreeSet<&String> = equation
        .species()
        .flat_map(|f| f.elements().keys())
        .collect();

    let reactant_elements: BTreeSet<&String> = equation
        .reactants
        .iter()
        .flat_map(|f| f.elements().keys())
        .collect();
    let product_elements: BTreeSet<&String> = equation
        .products
        .iter()
        .flat_map(|f| f.elements().keys())
        .collect();
    if let Some(missing) = reactant_elements.symmetric_difference(&product_elements).next() {
        return Err(CalcError::Unbalanceable(format!(
            "{missing} appears on only one side"
        )));
    }

    // One row per element; products enter with a negative sign
    let matrix: Vec<Vec<i64>> = elements
        .iter()
        .map(|element| {
            let reactants = equation.reactants.iter().map(|f| i64::from(f.count(element)));
            let products = equation.products.iter().map(|f| -i64::from(f.count(element)));
            reactants.chain(products).collect()
        })
        .collect();

    let vector = integer_null_vector(&matrix)?;
    if vector.iter().any(|&c| c <= 0) {
        return Err(CalcError::Unbalanceable(
            "no solution with all coefficients positive".into(),
        ));
    }

    vector
        .into_iter()
        .map(|c| u64::try_from(c).map_err(|_| CalcError::Unbalanceable("coefficient overflow".into())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_equations() {
        assert_eq!(balance("H2 + O2 = H2O").unwrap().coefficients, vec![2, 1, 2]);
        assert_eq!(balance("Na + Cl2 = NaCl").unwrap().coefficients, vec![2, 1, 2]);
        assert_eq!(
            balance("CH4 + O2 = CO2 + H2O").unwrap().coefficients,
            vec![1, 2, 1, 2]
        );
    }

    #[test]
    fn test_formatting_and_arrows() {
        let balanced = balance("H2 + O2 -> H2O").unwrap();
        assert_eq!(balanced.equation, "2H2 + O2 = 2H2O");
        assert_eq!(balanced.reactants, vec!["H2", "O2"]);
        assert_eq!(balanced.products, vec!["H2O"]);

        let balanced = balance("Fe + O2 → Fe2O3").unwrap();
        assert_eq!(balanced.coefficients, vec![4, 3, 2]);
    }

    #[test]
    fn test_given_coefficients_and_spacing_are_ignored() {
        assert_eq!(balance("4H2 + O2 = H2O").unwrap().coefficients, vec![2, 1, 2]);
        assert_eq!(balance("H2+O2=H2O").unwrap().coefficients, vec![2, 1, 2]);
    }

    #[test]
    fn test_larger_equations() {
        assert_eq!(
            balance("C6H12O6 + O2 = CO2 + H2O").unwrap().coefficients,
            vec![1, 6, 6, 6]
        );
        assert_eq!(
            balance("KMnO4 + HCl = KCl + MnCl2 + H2O + Cl2").unwrap().coefficients,
            vec![2, 16, 2, 2, 8, 5]
        );
        assert_eq!(
            balance("Ca(OH)2 + H3PO4 = Ca3(PO4)2 + H2O").unwrap().coefficients,
            vec![3, 2, 1, 6]
        );
    }

    #[test]
    fn test_unbalanceable_equations() {
        assert!(matches!(balance("H2 = O2"), Err(CalcError::Unbalanceable(_))));
        assert!(matches!(balance("H2 + O2"), Err(CalcError::Equation(_))));
        assert!(matches!(balance(" = H2O"), Err(CalcError::Equation(_))));
        assert!(balance("H2 + Qq = H2O").is_err());
    }
}
