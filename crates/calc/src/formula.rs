//! Chemical formula parsing and atomic masses
//!
//! Supported syntax:
//!
//! ```text
//!   H2O            element symbols with optional counts
//!   Ca(OH)2        parenthesized or bracketed groups with a multiplier
//!   CuSO4·5H2O     hydrates joined by `·`, `*` or `.`, with a leading count
//!   NaCl(aq)       a trailing state annotation is ignored
//! ```

use std::collections::BTreeMap;
use std::fmt;

use crate::error::CalcError;

/// Standard atomic weights, g/mol
const ATOMIC_MASSES: &[(&str, f64)] = &[
    ("H", 1.008),
    ("He", 4.0026),
    ("Li", 6.94),
    ("Be", 9.0122),
    ("B", 10.81),
    ("C", 12.011),
    ("N", 14.007),
    ("O", 15.999),
    ("F", 18.998),
    ("Ne", 20.180),
    ("Na", 22.990),
    ("Mg", 24.305),
    ("Al", 26.982),
    ("Si", 28.085),
    ("P", 30.974),
    ("S", 32.06),
    ("Cl", 35.45),
    ("Ar", 39.948),
    ("K", 39.098),
    ("Ca", 40.078),
    ("Sc", 44.956),
    ("Ti", 47.867),
    ("V", 50.942),
    ("Cr", 51.996),
    ("Mn", 54.938),
    ("Fe", 55.845),
    ("Co", 58.933),
    ("Ni", 58.693),
    ("Cu", 63.546),
    ("Zn", 65.38),
    ("Ga", 69.723),
    ("Ge", 72.630),
    ("As", 74.922),
    ("Se", 78.971),
    ("Br", 79.904),
    ("Kr", 83.798),
    ("Rb", 85.468),
    ("Sr", 87.62),
    ("Ag", 107.87),
    ("Cd", 112.41),
    ("Sn", 118.71),
    ("Sb", 121.76),
    ("I", 126.90),
    ("Xe", 131.29),
    ("Cs", 132.91),
    ("Ba", 137.33),
    ("Pt", 195.08),
    ("Au", 196.97),
    ("Hg", 200.59),
    ("Pb", 207.2),
    ("U", 238.03),
];

const STATES: &[&str] = &["(s)", "(l)", "(g)", "(aq)"];

/// Atomic mass of an element symbol
pub fn atomic_mass(symbol: &str) -> Option<f64> {
    ATOMIC_MASSES
        .iter()
        .find(|(s, _)| *s == symbol)
        .map(|(_, mass)| *mass)
}

/// A parsed formula: element counts in symbol order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Formula {
    text: String,
    elements: BTreeMap<String, u32>,
}

impl Formula {
    pub fn parse(input: &str) -> Result<Self, CalcError> {
        let text = input.trim();
        let body = STATES
            .iter()
            .find_map(|state| text.strip_suffix(state))
            .unwrap_or(text)
            .trim();
        if body.is_empty() {
            return Err(CalcError::formula(input, "empty formula"));
        }

        let mut elements = BTreeMap::new();
        for part in body.split(['·', '*', '.']) {
            let chars: Vec<char> = part.trim().chars().collect();
            let mut parser = Parser {
                input,
                chars: &chars,
                pos: 0,
            };
            let multiplier = parser.count()?.unwrap_or(1);
            let counts = parser.sequence()?;
            if parser.pos != chars.len() {
                return Err(CalcError::formula(
                    input,
                    format!("unexpected '{}'", chars[parser.pos]),
                ));
            }
            if counts.is_empty() {
                return Err(CalcError::formula(input, "no elements"));
            }
            merge(input, &mut elements, counts, multiplier)?;
        }

        Ok(Self {
            text: body.to_string(),
            elements,
        })
    }

    /// Formula text as written, without a state annotation
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn elements(&self) -> &BTreeMap<String, u32> {
        &self.elements
    }

    pub fn count(&self, element: &str) -> u32 {
        self.elements.get(element).copied().unwrap_or(0)
    }

    /// Molar mass in g/mol
    pub fn molar_mass(&self) -> f64 {
        self.elements
            .iter()
            .map(|(symbol, count)| atomic_mass(symbol).unwrap_or(0.0) * f64::from(*count))
            .sum()
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Render element counts in Hill order (C, H, then alphabetical)
pub fn hill_notation(elements: &BTreeMap<String, u32>) -> String {
    let mut symbols: Vec<&String> = elements.keys().collect();
    if elements.contains_key("C") {
        // Stable sort keeps the remaining symbols alphabetical
        symbols.sort_by_key(|s| match s.as_str() {
            "C" => 0,
            "H" => 1,
            _ => 2,
        });
    }

    symbols
        .into_iter()
        .map(|s| match elements[s] {
            1 => s.clone(),
            n => format!("{s}{n}"),
        })
        .collect()
}

fn merge(
    input: &str,
    into: &mut BTreeMap<String, u32>,
    counts: BTreeMap<String, u32>,
    multiplier: u32,
) -> Result<(), CalcError> {
    for (symbol, count) in counts {
        let scaled = count
            .checked_mul(multiplier)
            .ok_or_else(|| CalcError::formula(input, "count out of range"))?;
        add_count(input, into, symbol, scaled)?;
    }
    Ok(())
}

fn add_count(
    input: &str,
    into: &mut BTreeMap<String, u32>,
    symbol: String,
    n: u32,
) -> Result<(), CalcError> {
    let total = into.entry(symbol).or_insert(0);
    *total = total
        .checked_add(n)
        .ok_or_else(|| CalcError::formula(input, "count out of range"))?;
    Ok(())
}

struct Parser<'a> {
    input: &'a str,
    chars: &'a [char],
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn count(&mut self) -> Result<Option<u32>, CalcError> {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        if start == self.pos {
            return Ok(None);
        }

        let digits: String = self.chars[start..self.pos].iter().collect();
        match digits.parse::<u32>() {
            Ok(0) => Err(CalcError::formula(self.input, "zero count")),
            Ok(n) => Ok(Some(n)),
            Err(_) => Err(CalcError::formula(self.input, "count out of range")),
        }
    }

    fn sequence(&mut self) -> Result<BTreeMap<String, u32>, CalcError> {
        let mut counts = BTreeMap::new();

        while let Some(c) = self.peek() {
            match c {
                '(' | '[' => {
                    let close = if c == '(' { ')' } else { ']' };
                    self.pos += 1;
                    let inner = self.sequence()?;
                    if self.peek() != Some(close) {
                        return Err(CalcError::formula(self.input, format!("missing '{close}'")));
                    }
                    self.pos += 1;
                    let n = self.count()?.unwrap_or(1);
                    merge(self.input, &mut counts, inner, n)?;
                }
                ')' | ']' => break,
                c if c.is_ascii_uppercase() => {
                    let mut symbol = c.to_string();
                    self.pos += 1;
                    while let Some(lower) = self.peek().filter(char::is_ascii_lowercase) {
                        symbol.push(lower);
                        self.pos += 1;
                    }
                    if atomic_mass(&symbol).is_none() {
                        return Err(CalcError::UnknownElement(symbol));
                    }
                    let n = self.count()?.unwrap_or(1);
                    add_count(self.input, &mut counts, symbol, n)?;
                }
                other => {
                    return Err(CalcError::formula(self.input, format!("unexpected '{other}'")));
                }
            }
        }

        Ok(counts)
    }
}
