//! Symbolic equilibrium solving: state equation = 0 over the state variables.
//!
//! Systems affine in the state are solved exactly by symbolic Gauss-Jordan
//! elimination; coefficients may contain constants, inputs and time.
//! Non-linear systems are worked through branch by branch: an equation that is
//! affine in one state variable is solved for it and substituted into the rest,
//! products are split into the cases where one factor vanishes, and a
//! polynomial in a single variable with numeric coefficients branches over its
//! real roots. A branch where none of these applies is reported as
//! unsupported.
//!
//! `simplify` does not produce a canonical form, so every zero test goes
//! through `vanishes`, which samples the expression at fixed points.

use crate::diff::differentiate;
use crate::error::{SystemError, SystemResult};
use crate::expr::{BinaryOp, DynamicSymbol, Expr, ExprVector, SymbolVector};
use crate::simplify::simplify;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// One equilibrium: state variable name to closed-form value.
///
/// Variables left free by an under-determined system are absent and may
/// appear inside the other values.
pub type Solution = BTreeMap<String, Expr>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct EquilibriumSettings {
    /// Highest polynomial degree the root finder accepts.
    pub max_polynomial_degree: u32,
    /// Coefficients below this magnitude count as zero.
    pub coefficient_tolerance: f64,
    /// Roots whose imaginary part is below this (relative) bound count as real.
    pub imaginary_tolerance: f64,
    /// Newton iterations used to polish roots from the companion matrix.
    pub polish_steps: usize,
}

impl Default for EquilibriumSettings {
    fn default() -> Self {
        Self {
            max_polynomial_degree: 16,
            coefficient_tolerance: 1e-12,
            imaginary_tolerance: 1e-8,
            polish_steps: 3,
        }
    }
}

/// Solves `state_equation = 0` for `state`.
///
/// Inconsistent systems return an empty list.
pub fn solve_equilibrium(
    state: &SymbolVector,
    state_equation: &ExprVector,
    settings: &EquilibriumSettings,
) -> SystemResult<Vec<Solution>> {
    if state.is_empty() {
        return Ok(Vec::new());
    }

    let equations: Vec<Expr> = state_equation.iter().map(simplify).collect();

    if let Some((coefficients, rhs)) = affine_form(&equations, state) {
        debug!(dim_state = state.len(), "solving affine equilibrium system");
        return Ok(solve_affine(coefficients, rhs, state));
    }

    debug!(dim_state = state.len(), "solving non-linear equilibrium system");
    let mut solutions = Vec::new();
    let branch = Branch {
        equations,
        solved: Solution::new(),
    };
    solve_branch(branch, state, settings, &mut solutions)?;
    Ok(solutions)
}

/// Samples per zero test.
const ZERO_TEST_SAMPLES: u64 = 6;

/// Relative size below which a sampled value counts as zero.
const ZERO_TEST_TOLERANCE: f64 = 1e-9;

/// True when `expr` is zero for every value of its symbols.
///
/// Bare numbers are compared exactly. Anything else is evaluated at fixed
/// pseudo-random points of both signs; samples that leave the real domain are
/// skipped, and at least two must survive. Rounding left by cancellation is
/// judged against the largest term that was added or subtracted.
fn vanishes(expr: &Expr) -> bool {
    if let Some(value) = expr.as_number() {
        return value == 0.0;
    }
    let mut finite_samples = 0;
    for sample in 0..ZERO_TEST_SAMPLES {
        let mut scale = 0.0_f64;
        let value = evaluate_sample(expr, sample, &mut scale);
        if !value.is_finite() || !scale.is_finite() {
            continue;
        }
        if value.abs() > ZERO_TEST_TOLERANCE * scale {
            return false;
        }
        finite_samples += 1;
    }
    finite_samples >= 2
}

/// Evaluates `expr` at one sample, recording in `scale` the largest operand
/// of any sum or difference.
fn evaluate_sample(expr: &Expr, sample: u64, scale: &mut f64) -> f64 {
    match expr {
        Expr::Number(value) => *value,
        Expr::Time => sample_point(0, "", sample),
        Expr::Dynamic(name) => sample_point(1, name, sample),
        Expr::Constant(name) => sample_point(2, name, sample),
        Expr::Neg(inner) => -evaluate_sample(inner, sample, scale),
        Expr::Call(function, arg) => function.apply(evaluate_sample(arg, sample, scale)),
        Expr::Binary(lhs, op, rhs) => {
            let a = evaluate_sample(lhs, sample, scale);
            let b = evaluate_sample(rhs, sample, scale);
            match op {
                BinaryOp::Add => {
                    *scale = scale.max(a.abs()).max(b.abs());
                    a + b
                }
                BinaryOp::Sub => {
                    *scale = scale.max(a.abs()).max(b.abs());
                    a - b
                }
                BinaryOp::Mul => a * b,
                BinaryOp::Div => a / b,
                BinaryOp::Pow => a.powf(b),
            }
        }
    }
}

/// Value in `±[0.5, 1.5)` for one symbol at one sample: FNV-1a over the
/// symbol and sample, then the murmur3 finalizer.
fn sample_point(kind: u8, name: &str, sample: u64) -> f64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    let bytes = std::iter::once(kind)
        .chain(name.bytes())
        .chain(sample.to_le_bytes());
    for byte in bytes {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xff51_afd7_ed55_8ccd);
    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    hash ^= hash >> 33;
    let unit = (hash >> 11) as f64 / (1_u64 << 53) as f64;
    let magnitude = 0.5 + unit;
    if hash & 1 == 0 {
        magnitude
    } else {
        -magnitude
    }
}

/// Simplified `expr`, or an exact zero when it vanishes identically.
fn reduce(expr: &Expr) -> Expr {
    if vanishes(expr) {
        Expr::number(0.0)
    } else {
        simplify(expr)
    }
}

fn depends_on_state(expr: &Expr, state: &SymbolVector) -> bool {
    state.names().any(|name| expr.contains_dynamic(name))
}

/// Splits the equations into `A x = b` when every partial derivative is free of
/// state variables.
fn affine_form(equations: &[Expr], state: &SymbolVector) -> Option<(Vec<Vec<Expr>>, Vec<Expr>)> {
    let at_origin = zero_state(state);
    let mut coefficients = Vec::with_capacity(equations.len());
    let mut rhs = Vec::with_capacity(equations.len());
    for equation in equations {
        let mut row = Vec::with_capacity(state.len());
        for var in state.iter() {
            let coefficient = differentiate(equation, var);
            if depends_on_state(&coefficient, state) {
                return None;
            }
            row.push(reduce(&coefficient));
        }
        coefficients.push(row);
        rhs.push(reduce(&-equation.substitute_dynamic(&at_origin)));
    }
    Some((coefficients, rhs))
}

fn zero_state(state: &SymbolVector) -> BTreeMap<String, Expr> {
    state
        .names()
        .map(|name| (name.to_string(), Expr::number(0.0)))
        .collect()
}

fn solve_affine(mut a: Vec<Vec<Expr>>, mut b: Vec<Expr>, state: &SymbolVector) -> Vec<Solution> {
    let n_rows = a.len();
    let n_cols = state.len();
    let mut pivots: Vec<(usize, usize)> = Vec::new();
    let mut row = 0;

    // Every entry stays reduced, so `is_zero` is exact from here on.
    for col in 0..n_cols {
        if row == n_rows {
            break;
        }
        let Some(pivot_row) = choose_pivot(&a, row, col) else {
            continue;
        };
        a.swap(row, pivot_row);
        b.swap(row, pivot_row);

        let pivot = a[row][col].clone();
        for entry in a[row].iter_mut() {
            *entry = reduce(&(entry.clone() / pivot.clone()));
        }
        b[row] = reduce(&(b[row].clone() / pivot));

        for other in 0..n_rows {
            if other == row || a[other][col].is_zero() {
                continue;
            }
            let factor = a[other][col].clone();
            for k in 0..n_cols {
                let scaled = factor.clone() * a[row][k].clone();
                a[other][k] = reduce(&(a[other][k].clone() - scaled));
            }
            b[other] = reduce(&(b[other].clone() - factor * b[row].clone()));
        }

        pivots.push((row, col));
        row += 1;
    }

    // Rows without a pivot read 0 = b; anything but a zero is inconsistent.
    if b[row..].iter().any(|value| !value.is_zero()) {
        debug!("equilibrium system is inconsistent");
        return Vec::new();
    }

    let pivot_cols: Vec<usize> = pivots.iter().map(|&(_, col)| col).collect();
    let mut solution = Solution::new();
    for &(r, c) in &pivots {
        let mut value = b[r].clone();
        for (k, var) in state.iter().enumerate() {
            if pivot_cols.contains(&k) || a[r][k].is_zero() {
                continue;
            }
            value = value - a[r][k].clone() * var.to_expr();
        }
        solution.insert(state.as_slice()[c].name().to_string(), simplify(&value));
    }
    vec![solution]
}

/// Prefers numeric pivots; symbolic ones are assumed non-zero.
fn choose_pivot(a: &[Vec<Expr>], start: usize, col: usize) -> Option<usize> {
    let mut symbolic = None;
    for (r, row) in a.iter().enumerate().skip(start) {
        let entry = &row[col];
        if entry.is_zero() {
            continue;
        }
        if entry.as_number().is_some() {
            return Some(r);
        }
        symbolic.get_or_insert(r);
    }
    symbolic
}

/// Equations still to satisfy, and the variables fixed so far.
///
/// Values in `solved` only mention variables that are still unknown.
#[derive(Debug, Clone)]
struct Branch {
    equations: Vec<Expr>,
    solved: Solution,
}

impl Branch {
    /// Fixes `var` to `value` everywhere, dropping equation `consumed`.
    fn assign(&self, var: &DynamicSymbol, value: Expr, consumed: usize) -> Branch {
        let mut binding = BTreeMap::new();
        binding.insert(var.name().to_string(), value.clone());
        let equations = self
            .equations
            .iter()
            .enumerate()
            .filter(|&(index, _)| index != consumed)
            .map(|(_, equation)| equation.substitute_dynamic(&binding))
            .collect();
        let mut solved: Solution = self
            .solved
            .iter()
            .map(|(name, known)| (name.clone(), simplify(&known.substitute_dynamic(&binding))))
            .collect();
        solved.insert(var.name().to_string(), value);
        Branch { equations, solved }
    }

    fn replace(&self, index: usize, equation: Option<Expr>) -> Branch {
        let mut equations = self.equations.clone();
        match equation {
            Some(equation) => equations[index] = equation,
            None => {
                equations.remove(index);
            }
        }
        Branch {
            equations,
            solved: self.solved.clone(),
        }
    }
}

fn solve_branch(
    branch: Branch,
    state: &SymbolVector,
    settings: &EquilibriumSettings,
    out: &mut Vec<Solution>,
) -> SystemResult<()> {
    let mut equations = Vec::with_capacity(branch.equations.len());
    for equation in &branch.equations {
        let equation = reduce(equation);
        if equation.is_zero() {
            continue;
        }
        if !depends_on_state(&equation, state) {
            debug!(%equation, "equilibrium branch is inconsistent");
            return Ok(());
        }
        equations.push(equation);
    }
    let branch = Branch {
        equations,
        solved: branch.solved,
    };

    if branch.equations.is_empty() {
        push_distinct(out, branch.solved);
        return Ok(());
    }

    if let Some((index, var, value)) = affine_pivot(&branch.equations, state) {
        return solve_branch(branch.assign(var, value, index), state, settings, out);
    }

    for (index, equation) in branch.equations.iter().enumerate() {
        let mut factors = Vec::new();
        zero_factors(equation, state, &mut factors);
        if matches!(factors.as_slice(), [only] if only == equation) {
            continue;
        }
        for factor in factors {
            solve_branch(branch.replace(index, Some(factor)), state, settings, out)?;
        }
        return Ok(());
    }

    let mut reason = None;
    for (index, equation) in branch.equations.iter().enumerate() {
        let vars: Vec<&DynamicSymbol> = state
            .iter()
            .filter(|var| equation.contains_dynamic(var.name()))
            .collect();
        let [var] = vars.as_slice() else {
            continue;
        };
        let coefficients = match polynomial_coefficients(equation, var, settings) {
            Ok(coefficients) => coefficients,
            Err(why) => {
                reason.get_or_insert(why);
                continue;
            }
        };
        let Some(roots) = real_roots(&coefficients, settings) else {
            return solve_branch(branch.replace(index, None), state, settings, out);
        };
        for root in roots {
            solve_branch(branch.assign(var, Expr::number(root), index), state, settings, out)?;
        }
        return Ok(());
    }

    Err(unsupported(reason.unwrap_or_else(|| {
        format!(
            "non-linear equation {} couples several state variables",
            branch.equations[0]
        )
    })))
}

/// An equation affine in one variable whose coefficient is free of the state,
/// solved for that variable. Numeric coefficients win over symbolic ones.
fn affine_pivot<'a>(
    equations: &[Expr],
    state: &'a SymbolVector,
) -> Option<(usize, &'a DynamicSymbol, Expr)> {
    let mut symbolic = None;
    for (index, equation) in equations.iter().enumerate() {
        for var in state.iter() {
            if !equation.contains_dynamic(var.name()) {
                continue;
            }
            let coefficient = reduce(&differentiate(equation, var));
            if coefficient.is_zero() || depends_on_state(&coefficient, state) {
                continue;
            }
            let numeric = coefficient.as_number().is_some();
            let candidate = (index, var, coefficient);
            if numeric {
                return Some(solve_for(equation, candidate));
            }
            symbolic.get_or_insert(candidate);
        }
    }
    symbolic.map(|candidate| solve_for(&equations[candidate.0], candidate))
}

fn solve_for<'a>(
    equation: &Expr,
    (index, var, coefficient): (usize, &'a DynamicSymbol, Expr),
) -> (usize, &'a DynamicSymbol, Expr) {
    let mut at_zero = BTreeMap::new();
    at_zero.insert(var.name().to_string(), Expr::number(0.0));
    let rest = equation.substitute_dynamic(&at_zero);
    (index, var, reduce(&(-rest / coefficient)))
}

/// Factors of a product that carry state; the product vanishes when one of them does.
fn zero_factors(expr: &Expr, state: &SymbolVector, out: &mut Vec<Expr>) {
    match expr {
        Expr::Neg(inner) => zero_factors(inner, state, out),
        Expr::Binary(lhs, BinaryOp::Mul, rhs) => {
            zero_factors(lhs, state, out);
            zero_factors(rhs, state, out);
        }
        Expr::Binary(base, BinaryOp::Pow, exponent)
            if exponent.as_number().is_some_and(|value| value > 0.0) =>
        {
            zero_factors(base, state, out)
        }
        factor if depends_on_state(factor, state) => out.push(factor.clone()),
        _ => {}
    }
}

fn push_distinct(out: &mut Vec<Solution>, solution: Solution) {
    let same_value = |a: &Expr, b: &Expr| match (a.as_number(), b.as_number()) {
        (Some(x), Some(y)) => roots_match(x, y),
        _ => a == b,
    };
    let duplicate = out.iter().any(|known| {
        known.len() == solution.len()
            && known
                .iter()
                .zip(&solution)
                .all(|((name_a, a), (name_b, b))| name_a == name_b && same_value(a, b))
    });
    if !duplicate {
        out.push(solution);
    }
}

fn unsupported(reason: String) -> SystemError {
    warn!(%reason, "equilibrium solver rejected system");
    SystemError::UnsupportedEquilibrium { reason }
}

/// Degree of `expr` as a polynomial in `var`, or `None` if it is not one.
fn polynomial_degree(expr: &Expr, var: &str, max_degree: u32) -> Option<u32> {
    if !expr.contains_dynamic(var) {
        return Some(0);
    }
    let degree = match expr {
        Expr::Dynamic(_) => 1,
        Expr::Neg(inner) => polynomial_degree(inner, var, max_degree)?,
        Expr::Binary(lhs, op, rhs) => {
            match op {
                BinaryOp::Add | BinaryOp::Sub => polynomial_degree(lhs, var, max_degree)?
                    .max(polynomial_degree(rhs, var, max_degree)?),
                BinaryOp::Mul => polynomial_degree(lhs, var, max_degree)?
                    + polynomial_degree(rhs, var, max_degree)?,
                BinaryOp::Div if !rhs.contains_dynamic(var) => {
                    polynomial_degree(lhs, var, max_degree)?
                }
                BinaryOp::Pow => {
                    let exponent = rhs.as_number()?;
                    if exponent < 0.0 || exponent.fract() != 0.0 || exponent > max_degree as f64 {
                        return None;
                    }
                    polynomial_degree(lhs, var, max_degree)? * exponent as u32
                }
                BinaryOp::Div => return None,
            }
        }
        _ => return None,
    };
    (degree <= max_degree).then_some(degree)
}

/// Numeric coefficients `c_0..c_n` of the polynomial, lowest order first.
fn polynomial_coefficients(
    equation: &Expr,
    var: &DynamicSymbol,
    settings: &EquilibriumSettings,
) -> Result<Vec<f64>, String> {
    let degree = polynomial_degree(equation, var.name(), settings.max_polynomial_degree)
        .ok_or_else(|| {
            format!(
                "{equation} is not a polynomial of degree at most {} in {var}",
                settings.max_polynomial_degree
            )
        })?;

    let mut at_origin = BTreeMap::new();
    at_origin.insert(var.name().to_string(), Expr::number(0.0));

    // c_k = f^(k)(0) / k!
    let mut coefficients = Vec::with_capacity(degree as usize + 1);
    let mut current = equation.clone();
    let mut factorial = 1.0;
    for k in 0..=degree {
        if k > 0 {
            current = differentiate(&current, var);
            factorial *= f64::from(k);
        }
        let value = simplify(&current.substitute_dynamic(&at_origin));
        let Some(value) = value.as_number() else {
            return Err(format!("coefficient {value} of {equation} is not numeric"));
        };
        coefficients.push(value / factorial);
    }
    Ok(coefficients)
}

/// Real roots in ascending order; `None` when the polynomial is identically zero.
fn real_roots(coefficients: &[f64], settings: &EquilibriumSettings) -> Option<Vec<f64>> {
    let tol = settings.coefficient_tolerance;
    let scale = coefficients.iter().fold(0.0_f64, |acc, c| acc.max(c.abs()));
    if scale <= tol {
        return None;
    }
    let degree = coefficients
        .iter()
        .rposition(|c| c.abs() > tol * scale.max(1.0))
        .unwrap_or(0);
    let coefficients = &coefficients[..=degree];

    let mut roots = match degree {
        0 => Vec::new(),
        1 => vec![-coefficients[0] / coefficients[1]],
        2 => quadratic_roots(coefficients[2], coefficients[1], coefficients[0], tol),
        _ => companion_roots(coefficients, settings),
    };
    for root in roots.iter_mut() {
        *root = polish_root(coefficients, *root, settings.polish_steps);
        if root.abs() <= tol {
            *root = 0.0;
        }
    }
    roots.sort_by(|a, b| a.total_cmp(b));
    roots.dedup_by(|a, b| roots_match(*a, *b));
    Some(roots)
}

fn quadratic_roots(a: f64, b: f64, c: f64, tol: f64) -> Vec<f64> {
    let discriminant = b * b - 4.0 * a * c;
    let scale = (b * b).max((4.0 * a * c).abs()).max(1.0);
    if discriminant < -tol * scale {
        return Vec::new();
    }
    if discriminant.abs() <= tol * scale {
        return vec![-b / (2.0 * a)];
    }
    // Avoids cancellation between -b and the square root.
    let q = -0.5 * (b + b.signum() * discriminant.sqrt());
    if q == 0.0 {
        return vec![0.0];
    }
    vec![q / a, c / q]
}

fn companion_roots(coefficients: &[f64], settings: &EquilibriumSettings) -> Vec<f64> {
    let degree = coefficients.len() - 1;
    let leading = coefficients[degree];
    let mut companion = DMatrix::<f64>::zeros(degree, degree);
    for j in 0..degree {
        companion[(0, j)] = -coefficients[degree - 1 - j] / leading;
    }
    for i in 1..degree {
        companion[(i, i - 1)] = 1.0;
    }
    companion
        .complex_eigenvalues()
        .iter()
        .filter(|lambda| lambda.im.abs() <= settings.imaginary_tolerance * lambda.re.abs().max(1.0))
        .map(|lambda| lambda.re)
        .collect()
}

fn polish_root(coefficients: &[f64], mut root: f64, steps: usize) -> f64 {
    for _ in 0..steps {
        let (value, slope) = coefficients
            .iter()
            .rev()
            .fold((0.0, 0.0), |(p, dp), &c| (p * root + c, dp * root + p));
        if slope == 0.0 || !value.is_finite() {
            break;
        }
        let step = value / slope;
        if !step.is_finite() {
            break;
        }
        root -= step;
    }
    root
}

fn roots_match(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-9 * (1.0 + a.abs().max(b.abs()))
}
