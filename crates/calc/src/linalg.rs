//! Linear algebra
//!
//! Exact rational elimination for equation balancing, and floating point
//! solvers for `matrix-solve`.

use std::fmt;
use std::ops::Neg;

use serde::{Deserialize, Serialize};

use crate::error::CalcError;

const EPSILON: f64 = 1e-12;

pub(crate) fn gcd(a: i128, b: i128) -> i128 {
    let (mut a, mut b) = (a.abs(), b.abs());
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

pub(crate) fn lcm(a: i128, b: i128) -> Option<i128> {
    if a == 0 || b == 0 {
        return Some(0);
    }
    (a / gcd(a, b)).checked_mul(b)?.checked_abs()
}

/// Exact fraction with a positive denominator, always in lowest terms
///
/// Arithmetic is checked: an operation whose result does not fit in
/// `i128` yields `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rational {
    num: i128,
    den: i128,
}

impl Rational {
    pub const ZERO: Rational = Rational { num: 0, den: 1 };
    pub const ONE: Rational = Rational { num: 1, den: 1 };

    /// `None` for a zero denominator or when either part is `i128::MIN`
    pub fn new(num: i128, den: i128) -> Option<Self> {
        if den == 0 || num == i128::MIN || den == i128::MIN {
            return None;
        }
        let sign = if den < 0 { -1 } else { 1 };
        let g = gcd(num, den).max(1);
        Some(Self {
            num: sign * num / g,
            den: sign * den / g,
        })
    }

    pub fn integer(n: i128) -> Self {
        Self { num: n, den: 1 }
    }

    pub fn numer(self) -> i128 {
        self.num
    }

    pub fn denom(self) -> i128 {
        self.den
    }

    pub fn is_zero(self) -> bool {
        self.num == 0
    }

    pub fn checked_sub(self, rhs: Rational) -> Option<Rational> {
        let num = self
            .num
            .checked_mul(rhs.den)?
            .checked_sub(rhs.num.checked_mul(self.den)?)?;
        Rational::new(num, self.den.checked_mul(rhs.den)?)
    }

    pub fn checked_mul(self, rhs: Rational) -> Option<Rational> {
        Rational::new(self.num.checked_mul(rhs.num)?, self.den.checked_mul(rhs.den)?)
    }

    /// Also `None` when dividing by zero
    pub fn checked_div(self, rhs: Rational) -> Option<Rational> {
        Rational::new(self.num.checked_mul(rhs.den)?, self.den.checked_mul(rhs.num)?)
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.den == 1 {
            write!(f, "{}", self.num)
        } else {
            write!(f, "{}/{}", self.num, self.den)
        }
    }
}

impl Neg for Rational {
    type Output = Rational;

    // `num` is never `i128::MIN`, so this cannot overflow
    fn neg(self) -> Rational {
        Rational {
            num: -self.num,
            den: self.den,
        }
    }
}

fn overflow() -> CalcError {
    CalcError::Unbalanceable("coefficients exceed the supported range".to_string())
}

/// Reduce a matrix to reduced row echelon form in place
///
/// Returns the pivot column of each non-zero row.
pub fn rref(matrix: &mut [Vec<Rational>]) -> Result<Vec<usize>, CalcError> {
    let rows = matrix.len();
    let cols = matrix.first().map_or(0, Vec::len);
    let mut pivots = Vec::new();
    let mut row = 0;

    for col in 0..cols {
        if row == rows {
            break;
        }
        let Some(pivot) = (row..rows).find(|&r| !matrix[r][col].is_zero()) else {
            continue;
        };
        matrix.swap(row, pivot);

        let lead = matrix[row][col];
        for value in matrix[row].iter_mut() {
            *value = value.checked_div(lead).ok_or_else(overflow)?;
        }

        for r in 0..rows {
            if r == row || matrix[r][col].is_zero() {
                continue;
            }
            let factor = matrix[r][col];
            for c in 0..cols {
                let delta = factor.checked_mul(matrix[row][c]).ok_or_else(overflow)?;
                matrix[r][c] = matrix[r][c].checked_sub(delta).ok_or_else(overflow)?;
            }
        }

        pivots.push(col);
        row += 1;
    }

    Ok(pivots)
}

/// Basis vector of a one-dimensional null space, scaled to coprime integers
///
/// Fails when the null space is trivial or has more than one dimension.
pub fn integer_null_vector(matrix: &[Vec<i64>]) -> Result<Vec<i128>, CalcError> {
    let cols = matrix.first().map_or(0, Vec::len);
    let mut m: Vec<Vec<Rational>> = matrix
        .iter()
        .map(|row| row.iter().map(|&v| Rational::integer(i128::from(v))).collect())
        .collect();

    let pivots = rref(&mut m)?;
    let free: Vec<usize> = (0..cols).filter(|c| !pivots.contains(c)).collect();
    let [free] = free[..] else {
        return Err(CalcError::Unbalanceable(if free.is_empty() {
            "only the trivial solution exists".to_string()
        } else {
            format!("{} independent solutions exist", free.len())
        }));
    };

    let mut solution = vec![Rational::ZERO; cols];
    solution[free] = Rational::ONE;
    for (row, &pivot) in pivots.iter().enumerate() {
        solution[pivot] = -m[row][free];
    }

    let scale = solution
        .iter()
        .try_fold(1, |acc, r| lcm(acc, r.denom()))
        .ok_or_else(overflow)?;
    let mut ints: Vec<i128> = solution
        .iter()
        .map(|r| r.numer().checked_mul(scale / r.denom()))
        .collect::<Option<_>>()
        .ok_or_else(overflow)?;
    let divisor = ints.iter().fold(0, |acc, &v| gcd(acc, v)).max(1);
    for v in ints.iter_mut() {
        *v /= divisor;
    }
    if ints.iter().all(|&v| v <= 0) {
        for v in ints.iter_mut() {
            *v = v.checked_neg().ok_or_else(overflow)?;
        }
    }

    Ok(ints)
}

/// Solver used by `matrix-solve`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SolveMethod {
    #[default]
    Gaussian,
    Lu,
    Qr,
}

/// Solve `A x = b`
///
/// Gaussian and LU need a square non-singular `A`. QR accepts an
/// over-determined system and returns the least-squares solution.
pub fn solve(a: &[Vec<f64>], b: &[f64], method: SolveMethod) -> Result<Vec<f64>, CalcError> {
    let rows = a.len();
    let cols = a.first().map_or(0, Vec::len);
    if rows == 0 || cols == 0 {
        return Err(CalcError::Input("matrix is empty".into()));
    }
    if a.iter().any(|row| row.len() != cols) {
        return Err(CalcError::Input("matrix rows differ in length".into()));
    }
    if b.len() != rows {
        return Err(CalcError::Input(format!(
            "vector has {} entries, matrix has {rows} rows",
            b.len()
        )));
    }

    match method {
        SolveMethod::Gaussian | SolveMethod::Lu if rows != cols => Err(CalcError::Input(format!(
            "{method:?} needs a square matrix, got {rows}x{cols}"
        ))),
        SolveMethod::Qr if rows < cols => Err(CalcError::Input(format!(
            "QR needs at least as many rows as columns, got {rows}x{cols}"
        ))),
        SolveMethod::Gaussian => gaussian(a, b),
        SolveMethod::Lu => lu(a, b),
        SolveMethod::Qr => qr(a, b),
    }
}

/// Euclidean norm of `A x - b`
pub fn residual_norm(a: &[Vec<f64>], x: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(row, bi)| {
            let ax: f64 = row.iter().zip(x).map(|(aij, xj)| aij * xj).sum();
            (ax - bi).powi(2)
        })
        .sum::<f64>()
        .sqrt()
}

fn gaussian(a: &[Vec<f64>], b: &[f64]) -> Result<Vec<f64>, CalcError> {
    let n = a.len();
    let mut m: Vec<Vec<f64>> = a
        .iter()
        .zip(b)
        .map(|(row, bi)| {
            let mut row = row.clone();
            row.push(*bi);
            row
        })
        .collect();

    for k in 0..n {
        let pivot = partial_pivot(&m, k);
        if m[pivot][k].abs() < EPSILON {
            return Err(CalcError::Singular(format!("zero pivot in column {k}")));
        }
        m.swap(k, pivot);

        for i in k + 1..n {
            let factor = m[i][k] / m[k][k];
            for j in k..=n {
                m[i][j] -= factor * m[k][j];
            }
        }
    }

    let mut x = vec![0.0; n];
    for i in (0..n).rev() {
        let sum: f64 = (i + 1..n).map(|j| m[i][j] * x[j]).sum();
        x[i] = (m[i][n] - sum) / m[i][i];
    }
    Ok(x)
}

/// Doolittle factorization with partial pivoting, `P A = L U`
fn lu(a: &[Vec<f64>], b: &[f64]) -> Result<Vec<f64>, CalcError> {
    let n = a.len();
    let mut u: Vec<Vec<f64>> = a.to_vec();
    let mut l = vec![vec![0.0; n]; n];
    let mut perm: Vec<usize> = (0..n).collect();

    for k in 0..n {
        let pivot = partial_pivot(&u, k);
        if u[pivot][k].abs() < EPSILON {
            return Err(CalcError::Singular(format!("zero pivot in column {k}")));
        }
        u.swap(k, pivot);
        l.swap(k, pivot);
        perm.swap(k, pivot);

        for i in k + 1..n {
            let factor = u[i][k] / u[k][k];
            l[i][k] = factor;
            for j in k..n {
                u[i][j] -= factor * u[k][j];
            }
        }
    }
    for (i, row) in l.iter_mut().enumerate() {
        row[i] = 1.0;
    }

    // L y = P b
    let mut y = vec![0.0; n];
    for i in 0..n {
        let sum: f64 = (0..i).map(|j| l[i][j] * y[j]).sum();
        y[i] = b[perm[i]] - sum;
    }
    // U x = y
    let mut x = vec![0.0; n];
    for i in (0..n).rev() {
        let sum: f64 = (i + 1..n).map(|j| u[i][j] * x[j]).sum();
        x[i] = (y[i] - sum) / u[i][i];
    }
    Ok(x)
}

/// Householder QR, least squares for `rows > cols`
fn qr(a: &[Vec<f64>], b: &[f64]) -> Result<Vec<f64>, CalcError> {
    let (m, n) = (a.len(), a[0].len());
    let mut r: Vec<Vec<f64>> = a.to_vec();
    let mut qtb: Vec<f64> = b.to_vec();

    for k in 0..n {
        let norm = (k..m).map(|i| r[i][k].powi(2)).sum::<f64>().sqrt();
        if norm < EPSILON {
            return Err(CalcError::Singular(format!("column {k} is rank deficient")));
        }
        let alpha = if r[k][k] > 0.0 { -norm } else { norm };

        let mut v: Vec<f64> = (k..m).map(|i| r[i][k]).collect();
        v[0] -= alpha;
        let v_norm_sq: f64 = v.iter().map(|x| x * x).sum();
        if v_norm_sq < EPSILON {
            continue;
        }

        // Apply H = I - 2 v v^T / (v^T v) to the trailing columns and to b
        for j in k..n {
            let dot: f64 = (k..m).map(|i| v[i - k] * r[i][j]).sum();
            let f = 2.0 * dot / v_norm_sq;
            for i in k..m {
                r[i][j] -= f * v[i - k];
            }
        }
        let dot: f64 = (k..m).map(|i| v[i - k] * qtb[i]).sum();
        let f = 2.0 * dot / v_norm_sq;
        for i in k..m {
            qtb[i] -= f * v[i - k];
        }
    }

    let mut x = vec![0.0; n];
    for i in (0..n).rev() {
        if r[i][i].abs() < EPSILON {
            return Err(CalcError::Singular(format!("column {i} is rank deficient")));
        }
        let sum: f64 = (i + 1..n).map(|j| r[i][j] * x[j]).sum();
        x[i] = (qtb[i] - sum) / r[i][i];
    }
    Ok(x)
}

fn partial_pivot(m: &[Vec<f64>], k: usize) -> usize {
    (k..m.len())
        .max_by(|&i, &j| m[i][k].abs().total_cmp(&m[j][k].abs()))
        .unwrap_or(k)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(actual: &[f64], expected: &[f64]) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 1e-9, "{actual:?} != {expected:?}");
        }
    }

    #[test]
    fn test_rational_arithmetic() {
        let half = Rational::new(1, 2).unwrap();
        let third = Rational::new(-2, -6).unwrap();
        assert_eq!(third, Rational::new(1, 3).unwrap());
        assert_eq!(half.checked_sub(third), Rational::new(1, 6));
        assert_eq!(half.checked_mul(third), Rational::new(1, 6));
        assert_eq!(half.checked_div(third), Rational::new(3, 2));
        assert_eq!(-half, Rational::new(-1, 2).unwrap());
        assert_eq!(Rational::new(2, -4).unwrap().to_string(), "-1/2");
        assert_eq!(half.checked_div(Rational::ZERO), None);
        assert_eq!(Rational::new(1, 0), None);
    }

    #[test]
    fn test_rational_overflow_is_reported() {
        let huge = Rational::integer(i128::MAX / 2 + 1);
        assert_eq!(huge.checked_mul(Rational::integer(2)), None);
        assert_eq!(huge.checked_sub(-huge), None);

        let tiny = Rational::new(1, i128::MAX).unwrap();
        assert_eq!(tiny.checked_sub(Rational::new(1, i128::MAX - 1).unwrap()), None);
        assert_eq!(Rational::new(i128::MIN, 1), None);
    }

    #[test]
    fn test_rref_overflow_becomes_error() {
        let big = Rational::integer(i128::MAX);
        let mut m = vec![
            vec![Rational::ONE, big],
            vec![big, Rational::ONE],
        ];
        assert!(matches!(rref(&mut m), Err(CalcError::Unbalanceable(_))));
    }

    #[test]
    fn test_null_vector_for_water() {
        // H: 2a = 2c, O: 2b = c
        let m = vec![vec![2, 0, -2], vec![0, 2, -1]];
        assert_eq!(integer_null_vector(&m).unwrap(), vec![2, 1, 2]);
    }

    #[test]
    fn test_null_vector_dimension_errors() {
        let full_rank = vec![vec![1, 0], vec![0, 1]];
        assert!(matches!(
            integer_null_vector(&full_rank),
            Err(CalcError::Unbalanceable(_))
        ));

        let two_free = vec![vec![1, -1, 0, 0]];
        assert!(integer_null_vector(&two_free).is_err());
    }

    #[test]
    fn test_square_solvers_agree() {
        let a = vec![
            vec![2.0, 1.0, -1.0],
            vec![-3.0, -1.0, 2.0],
            vec![-2.0, 1.0, 2.0],
        ];
        let b = vec![8.0, -11.0, -3.0];

        for method in [SolveMethod::Gaussian, SolveMethod::Lu, SolveMethod::Qr] {
            let x = solve(&a, &b, method).unwrap();
            assert_close(&x, &[2.0, 3.0, -1.0]);
            assert!(residual_norm(&a, &x, &b) < 1e-9);
        }
    }

    #[test]
    fn test_pivoting_handles_zero_leading_entry() {
        let a = vec![vec![0.0, 1.0], vec![1.0, 0.0]];
        let b = vec![3.0, 4.0];
        assert_close(&solve(&a, &b, SolveMethod::Gaussian).unwrap(), &[4.0, 3.0]);
        assert_close(&solve(&a, &b, SolveMethod::Lu).unwrap(), &[4.0, 3.0]);
    }

    #[test]
    fn test_qr_least_squares() {
        // Fit y = c0 + c1 t through (0, 1), (1, 3), (2, 5), (3, 7)
        let a = vec![
            vec![1.0, 0.0],
            vec![1.0, 1.0],
            vec![1.0, 2.0],
            vec![1.0, 3.0],
        ];
        let b = vec![1.0, 3.0, 5.0, 7.0];
        assert_close(&solve(&a, &b, SolveMethod::Qr).unwrap(), &[1.0, 2.0]);
    }

    #[test]
    fn test_singular_and_malformed_inputs() {
        let singular = vec![vec![1.0, 2.0], vec![2.0, 4.0]];
        assert!(matches!(
            solve(&singular, &[1.0, 2.0], SolveMethod::Gaussian),
            Err(CalcError::Singular(_))
        ));
        assert!(matches!(
            solve(&singular, &[1.0, 2.0], SolveMethod::Lu),
            Err(CalcError::Singular(_))
        ));

        let ragged = vec![vec![1.0, 2.0], vec![1.0]];
        assert!(matches!(
            solve(&ragged, &[1.0, 2.0], SolveMethod::Gaussian),
            Err(CalcError::Input(_))
        ));
        assert!(solve(&singular, &[1.0], SolveMethod::Gaussian).is_err());
        assert!(solve(&[vec![1.0, 2.0]], &[1.0], SolveMethod::Lu).is_err());
    }
}
