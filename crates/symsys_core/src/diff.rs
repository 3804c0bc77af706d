//! Symbolic differentiation and Jacobians.

use crate::expr::{
    BinaryOp, DynamicSymbol, Expr, ExprVector, Function, SymbolVector, SymbolicMatrix,
};
use crate::simplify::simplify;

/// Partial derivative of `expr` with respect to the dynamic symbol `var`, simplified.
pub fn differentiate(expr: &Expr, var: &DynamicSymbol) -> Expr {
    simplify(&derivative(expr, var.name()))
}

/// Jacobian with one row per equation and one column per variable.
pub fn jacobian(equations: &ExprVector, vars: &SymbolVector) -> SymbolicMatrix {
    let vars = vars.as_slice();
    SymbolicMatrix::from_fn(equations.len(), vars.len(), |i, j| {
        differentiate(&equations[i], &vars[j])
    })
}

fn derivative(expr: &Expr, var: &str) -> Expr {
    if !expr.contains_dynamic(var) {
        return Expr::number(0.0);
    }

    match expr {
        Expr::Dynamic(name) if name == var => Expr::number(1.0),
        Expr::Number(_) | Expr::Time | Expr::Dynamic(_) | Expr::Constant(_) => Expr::number(0.0),
        Expr::Neg(inner) => -derivative(inner, var),
        Expr::Binary(lhs, op, rhs) => {
            let a = lhs.as_ref().clone();
            let b = rhs.as_ref().clone();
            let da = derivative(lhs, var);
            let db = derivative(rhs, var);
            match op {
                BinaryOp::Add => da + db,
                BinaryOp::Sub => da - db,
                // (ab)' = a'b + ab'
                BinaryOp::Mul => da * b.clone() + a * db,
                // (a/b)' = (a'b - ab') / b^2
                BinaryOp::Div => (da * b.clone() - a * db) / b.pow(2.0),
                BinaryOp::Pow => derivative_pow(a, b, da, db, var),
            }
        }
        Expr::Call(function, arg) => {
            let inner = arg.as_ref().clone();
            let outer = match function {
                Function::Sin => inner.cos(),
                Function::Cos => -inner.sin(),
                Function::Tan => 1.0 + inner.tan().pow(2.0),
                Function::Exp => inner.exp(),
                Function::Ln => 1.0 / inner,
                Function::Sqrt => 1.0 / (2.0 * inner.sqrt()),
                Function::Sinh => Expr::call(Function::Cosh, inner),
                Function::Cosh => Expr::call(Function::Sinh, inner),
                Function::Tanh => 1.0 - Expr::call(Function::Tanh, inner).pow(2.0),
            };
            outer * derivative(arg, var)
        }
    }
}

fn derivative_pow(base: Expr, exponent: Expr, d_base: Expr, d_exponent: Expr, var: &str) -> Expr {
    if !exponent.contains_dynamic(var) {
        // (a^n)' = n a^(n-1) a'
        let lowered = exponent.clone() - 1.0;
        return exponent * base.pow(lowered) * d_base;
    }
    if !base.contains_dynamic(var) {
        // (c^b)' = c^b ln(c) b'
        return base.clone().pow(exponent) * base.ln() * d_exponent;
    }
    // (a^b)' = a^b (b' ln(a) + b a' / a)
    base.clone().pow(exponent.clone())
        * (d_exponent * base.clone().ln() + exponent * d_base / base)
}
