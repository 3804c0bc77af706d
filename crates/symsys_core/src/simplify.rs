//! Bottom-up algebraic simplification.
//!
//! Not a canonicalizer: it folds numbers and removes the identity and
//! annihilator patterns that differentiation and substitution leave behind.

use crate::expr::{BinaryOp, Expr, Function};

pub fn simplify(expr: &Expr) -> Expr {
    match expr {
        Expr::Binary(lhs, op, rhs) => simplify_binary(simplify(lhs), *op, simplify(rhs)),
        Expr::Neg(inner) => simplify_neg(simplify(inner)),
        Expr::Call(function, arg) => simplify_call(*function, simplify(arg)),
        Expr::Number(value) => Expr::number(*value),
        leaf => leaf.clone(),
    }
}

fn simplify_neg(inner: Expr) -> Expr {
    match inner {
        Expr::Number(value) => Expr::number(-value),
        Expr::Neg(inner) => *inner,
        Expr::Binary(lhs, BinaryOp::Mul, rhs) if lhs.as_number().is_some() => {
            let coefficient = -lhs.as_number().unwrap_or_default();
            simplify_binary(Expr::number(coefficient), BinaryOp::Mul, *rhs)
        }
        other => Expr::Neg(Box::new(other)),
    }
}

fn simplify_call(function: Function, arg: Expr) -> Expr {
    if let Some(value) = arg.as_number() {
        let folded = function.apply(value);
        if folded.is_finite() {
            return Expr::number(folded);
        }
    }
    Expr::call(function, arg)
}

fn simplify_binary(lhs: Expr, op: BinaryOp, rhs: Expr) -> Expr {
    if let (Some(a), Some(b)) = (lhs.as_number(), rhs.as_number()) {
        if let Some(folded) = fold_numbers(a, op, b) {
            return Expr::number(folded);
        }
    }

    match op {
        BinaryOp::Add => simplify_add(lhs, rhs),
        BinaryOp::Sub => simplify_sub(lhs, rhs),
        BinaryOp::Mul => simplify_mul(lhs, rhs),
        BinaryOp::Div => simplify_div(lhs, rhs),
        BinaryOp::Pow => simplify_pow(lhs, rhs),
    }
}

fn fold_numbers(a: f64, op: BinaryOp, b: f64) -> Option<f64> {
    let value = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
        BinaryOp::Pow => a.powf(b),
    };
    value.is_finite().then_some(value)
}

fn simplify_add(lhs: Expr, rhs: Expr) -> Expr {
    if lhs.is_zero() {
        return rhs;
    }
    if rhs.is_zero() {
        return lhs;
    }
    match rhs {
        Expr::Neg(inner) => simplify_sub(lhs, *inner),
        Expr::Number(value) if value < 0.0 => simplify_sub(lhs, Expr::number(-value)),
        rhs => match lhs {
            Expr::Neg(inner) => simplify_sub(rhs, *inner),
            lhs if lhs == rhs => simplify_mul(Expr::number(2.0), lhs),
            lhs => Expr::binary(lhs, BinaryOp::Add, rhs),
        },
    }
}

fn simplify_sub(lhs: Expr, rhs: Expr) -> Expr {
    if rhs.is_zero() {
        return lhs;
    }
    if lhs.is_zero() {
        return simplify_neg(rhs);
    }
    if lhs == rhs {
        return Expr::number(0.0);
    }
    match rhs {
        Expr::Neg(inner) => simplify_add(lhs, *inner),
        Expr::Number(value) if value < 0.0 => simplify_add(lhs, Expr::number(-value)),
        rhs => Expr::binary(lhs, BinaryOp::Sub, rhs),
    }
}

fn simplify_mul(lhs: Expr, rhs: Expr) -> Expr {
    if lhs.is_zero() || rhs.is_zero() {
        return Expr::number(0.0);
    }
    if lhs.is_one() {
        return rhs;
    }
    if rhs.is_one() {
        return lhs;
    }
    // Keep numeric coefficients on the left.
    if rhs.as_number().is_some() && lhs.as_number().is_none() {
        return simplify_mul(rhs, lhs);
    }
    match (lhs, rhs) {
        (Expr::Neg(a), b) => simplify_neg(simplify_mul(*a, b)),
        (a, Expr::Neg(b)) => simplify_neg(simplify_mul(a, *b)),
        (Expr::Number(a), Expr::Binary(inner_lhs, BinaryOp::Mul, inner_rhs))
            if inner_lhs.as_number().is_some() =>
        {
            let b = inner_lhs.as_number().unwrap_or(1.0);
            simplify_mul(Expr::number(a * b), *inner_rhs)
        }
        (Expr::Number(a), b) if a == -1.0 => simplify_neg(b),
        (a, b) if a == b => Expr::binary(a, BinaryOp::Pow, Expr::number(2.0)),
        (a, b) => Expr::binary(a, BinaryOp::Mul, b),
    }
}

fn simplify_div(lhs: Expr, rhs: Expr) -> Expr {
    if rhs.is_one() {
        return lhs;
    }
    if rhs.as_number() == Some(-1.0) {
        return simplify_neg(lhs);
    }
    if lhs.is_zero() && !rhs.is_zero() {
        return Expr::number(0.0);
    }
    if lhs == rhs && !rhs.is_zero() {
        return Expr::number(1.0);
    }
    match (lhs, rhs) {
        (Expr::Neg(a), Expr::Neg(b)) => simplify_div(*a, *b),
        (Expr::Neg(a), b) => simplify_neg(simplify_div(*a, b)),
        (a, Expr::Neg(b)) => simplify_neg(simplify_div(a, *b)),
        (a, b) => Expr::binary(a, BinaryOp::Div, b),
    }
}

fn simplify_pow(base: Expr, exponent: Expr) -> Expr {
    if exponent.is_zero() {
        return Expr::number(1.0);
    }
    if exponent.is_one() {
        return base;
    }
    if base.is_one() {
        return Expr::number(1.0);
    }
    if base.is_zero() && exponent.as_number().is_some_and(|value| value > 0.0) {
        return Expr::number(0.0);
    }
    Expr::binary(base, BinaryOp::Pow, exponent)
}
