//! Symbolic expression model.
//!
//! Expressions are trees over numbers, the time symbol `t`, time-dependent
//! ("dynamic") symbols such as `x(t)`, and plain constant symbols. State and
//! input vectors are made of dynamic symbols; constants are substituted with
//! numbers before code generation.

use crate::error::{SystemError, SystemResult};
use num_traits::Float;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Sub};

/// Name of the process-wide time symbol.
pub const TIME_SYMBOL: &str = "t";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl BinaryOp {
    pub fn symbol(self) -> char {
        match self {
            BinaryOp::Add => '+',
            BinaryOp::Sub => '-',
            BinaryOp::Mul => '*',
            BinaryOp::Div => '/',
            BinaryOp::Pow => '^',
        }
    }

    fn precedence(self) -> u8 {
        match self {
            BinaryOp::Add | BinaryOp::Sub => 1,
            BinaryOp::Mul | BinaryOp::Div => 2,
            BinaryOp::Pow => 4,
        }
    }
}

/// Elementary functions understood by the parser, differentiator and VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Function {
    Sin,
    Cos,
    Tan,
    Exp,
    Ln,
    Sqrt,
    Sinh,
    Cosh,
    Tanh,
}

impl Function {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sin" => Some(Function::Sin),
            "cos" => Some(Function::Cos),
            "tan" => Some(Function::Tan),
            "exp" => Some(Function::Exp),
            "ln" | "log" => Some(Function::Ln),
            "sqrt" => Some(Function::Sqrt),
            "sinh" => Some(Function::Sinh),
            "cosh" => Some(Function::Cosh),
            "tanh" => Some(Function::Tanh),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Function::Sin => "sin",
            Function::Cos => "cos",
            Function::Tan => "tan",
            Function::Exp => "exp",
            Function::Ln => "ln",
            Function::Sqrt => "sqrt",
            Function::Sinh => "sinh",
            Function::Cosh => "cosh",
            Function::Tanh => "tanh",
        }
    }

    pub fn apply<T: Float>(self, x: T) -> T {
        match self {
            Function::Sin => x.sin(),
            Function::Cos => x.cos(),
            Function::Tan => x.tan(),
            Function::Exp => x.exp(),
            Function::Ln => x.ln(),
            Function::Sqrt => x.sqrt(),
            Function::Sinh => x.sinh(),
            Function::Cosh => x.cosh(),
            Function::Tanh => x.tanh(),
        }
    }
}

/// A symbolic scalar expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Number(f64),
    /// The independent time variable `t`.
    Time,
    /// A time-dependent symbol, written `x(t)`.
    Dynamic(String),
    /// A constant symbol whose value comes from the constants map.
    Constant(String),
    Binary(Box<Expr>, BinaryOp, Box<Expr>),
    Neg(Box<Expr>),
    Call(Function, Box<Expr>),
}

impl Expr {
    pub fn number(value: f64) -> Self {
        // Folded results should never print as "-0".
        Expr::Number(if value == 0.0 { 0.0 } else { value })
    }

    pub fn time() -> Self {
        Expr::Time
    }

    pub fn dynamic(name: impl Into<String>) -> Self {
        Expr::Dynamic(name.into())
    }

    pub fn constant(name: impl Into<String>) -> Self {
        Expr::Constant(name.into())
    }

    pub fn binary(lhs: Expr, op: BinaryOp, rhs: Expr) -> Self {
        Expr::Binary(Box::new(lhs), op, Box::new(rhs))
    }

    pub fn call(function: Function, arg: Expr) -> Self {
        Expr::Call(function, Box::new(arg))
    }

    pub fn pow(self, exponent: impl Into<Expr>) -> Self {
        Expr::binary(self, BinaryOp::Pow, exponent.into())
    }

    pub fn sin(self) -> Self {
        Expr::call(Function::Sin, self)
    }

    pub fn cos(self) -> Self {
        Expr::call(Function::Cos, self)
    }

    pub fn tan(self) -> Self {
        Expr::call(Function::Tan, self)
    }

    pub fn exp(self) -> Self {
        Expr::call(Function::Exp, self)
    }

    pub fn ln(self) -> Self {
        Expr::call(Function::Ln, self)
    }

    pub fn sqrt(self) -> Self {
        Expr::call(Function::Sqrt, self)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Expr::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn is_zero(&self) -> bool {
        matches!(self, Expr::Number(value) if *value == 0.0)
    }

    pub fn is_one(&self) -> bool {
        matches!(self, Expr::Number(value) if *value == 1.0)
    }

    /// Names of every dynamic symbol the expression depends on.
    pub fn free_dynamic_symbols(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.visit(&mut |node| {
            if let Expr::Dynamic(name) = node {
                out.insert(name.clone());
            }
        });
        out
    }

    /// Names of every constant symbol the expression depends on.
    pub fn free_constant_symbols(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.visit(&mut |node| {
            if let Expr::Constant(name) = node {
                out.insert(name.clone());
            }
        });
        out
    }

    pub fn depends_on_time(&self) -> bool {
        let mut found = false;
        self.visit(&mut |node| found |= matches!(node, Expr::Time));
        found
    }

    pub fn contains_dynamic(&self, name: &str) -> bool {
        let mut found = false;
        self.visit(&mut |node| {
            if let Expr::Dynamic(candidate) = node {
                found |= candidate == name;
            }
        });
        found
    }

    fn visit(&self, f: &mut impl FnMut(&Expr)) {
        f(self);
        match self {
            Expr::Binary(lhs, _, rhs) => {
                lhs.visit(f);
                rhs.visit(f);
            }
            Expr::Neg(inner) | Expr::Call(_, inner) => inner.visit(f),
            Expr::Number(_) | Expr::Time | Expr::Dynamic(_) | Expr::Constant(_) => {}
        }
    }

    /// Rebuilds the tree, replacing every node for which `replace` returns a value.
    pub fn replace(&self, replace: &impl Fn(&Expr) -> Option<Expr>) -> Expr {
        if let Some(replacement) = replace(self) {
            return replacement;
        }
        match self {
            Expr::Binary(lhs, op, rhs) => {
                Expr::binary(lhs.replace(replace), *op, rhs.replace(replace))
            }
            Expr::Neg(inner) => Expr::Neg(Box::new(inner.replace(replace))),
            Expr::Call(function, arg) => Expr::call(*function, arg.replace(replace)),
            leaf => leaf.clone(),
        }
    }

    /// Replaces constant symbols that have a value in `constants`.
    pub fn substitute_constants(&self, constants: &BTreeMap<String, f64>) -> Expr {
        self.replace(&|node| match node {
            Expr::Constant(name) => constants.get(name).map(|value| Expr::number(*value)),
            _ => None,
        })
    }

    /// Replaces dynamic symbols that appear in `values`.
    pub fn substitute_dynamic(&self, values: &BTreeMap<String, Expr>) -> Expr {
        self.replace(&|node| match node {
            Expr::Dynamic(name) => values.get(name).cloned(),
            _ => None,
        })
    }

    fn precedence(&self) -> u8 {
        match self {
            Expr::Number(value) if *value < 0.0 => 3,
            Expr::Binary(_, op, _) => op.precedence(),
            Expr::Neg(_) => 3,
            _ => 5,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Number(value) => write!(f, "{value}"),
            Expr::Time => write!(f, "{TIME_SYMBOL}"),
            Expr::Dynamic(name) => write!(f, "{name}({TIME_SYMBOL})"),
            Expr::Constant(name) => write!(f, "{name}"),
            Expr::Binary(lhs, op, rhs) => {
                let prec = op.precedence();
                let (lhs_parens, rhs_parens) = if *op == BinaryOp::Pow {
                    (lhs.precedence() <= prec, rhs.precedence() < prec)
                } else {
                    (lhs.precedence() < prec, rhs.precedence() <= prec)
                };
                write_operand(f, lhs, lhs_parens)?;
                if *op == BinaryOp::Pow {
                    write!(f, "^")?;
                } else {
                    write!(f, " {} ", op.symbol())?;
                }
                write_operand(f, rhs, rhs_parens)
            }
            Expr::Neg(inner) => {
                write!(f, "-")?;
                write_operand(f, inner, inner.precedence() <= 3)
            }
            Expr::Call(function, arg) => write!(f, "{}({arg})", function.name()),
        }
    }
}

fn write_operand(f: &mut fmt::Formatter<'_>, expr: &Expr, parens: bool) -> fmt::Result {
    if parens {
        write!(f, "({expr})")
    } else {
        write!(f, "{expr}")
    }
}

impl From<f64> for Expr {
    fn from(value: f64) -> Self {
        Expr::number(value)
    }
}

impl From<i32> for Expr {
    fn from(value: i32) -> Self {
        Expr::number(f64::from(value))
    }
}

macro_rules! impl_expr_binary_op {
    ($trait:ident, $method:ident, $op:expr) => {
        impl<R: Into<Expr>> $trait<R> for Expr {
            type Output = Expr;
            fn $method(self, rhs: R) -> Expr {
                Expr::binary(self, $op, rhs.into())
            }
        }

        impl $trait<Expr> for f64 {
            type Output = Expr;
            fn $method(self, rhs: Expr) -> Expr {
                Expr::binary(Expr::number(self), $op, rhs)
            }
        }
    };
}

impl_expr_binary_op!(Add, add, BinaryOp::Add);
impl_expr_binary_op!(Sub, sub, BinaryOp::Sub);
impl_expr_binary_op!(Mul, mul, BinaryOp::Mul);
impl_expr_binary_op!(Div, div, BinaryOp::Div);

impl Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        Expr::Neg(Box::new(self))
    }
}

/// A time-dependent symbol used as a state or input component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DynamicSymbol(String);

impl DynamicSymbol {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    pub fn to_expr(&self) -> Expr {
        Expr::Dynamic(self.0.clone())
    }
}

impl fmt::Display for DynamicSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({TIME_SYMBOL})", self.0)
    }
}

impl From<DynamicSymbol> for Expr {
    fn from(symbol: DynamicSymbol) -> Self {
        Expr::Dynamic(symbol.0)
    }
}

impl From<&DynamicSymbol> for Expr {
    fn from(symbol: &DynamicSymbol) -> Self {
        symbol.to_expr()
    }
}

/// Creates dynamic symbols from a whitespace or comma separated list of names.
pub fn dynamic_symbols(names: &str) -> Vec<DynamicSymbol> {
    names
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|name| !name.is_empty())
        .map(DynamicSymbol::new)
        .collect()
}

/// Ordered vector of dynamic symbols (state or input).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SymbolVector(Vec<DynamicSymbol>);

impl SymbolVector {
    pub fn new(symbols: Vec<DynamicSymbol>) -> Self {
        Self(symbols)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DynamicSymbol> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[DynamicSymbol] {
        &self.0
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(DynamicSymbol::name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names().any(|candidate| candidate == name)
    }

    pub fn to_exprs(&self) -> ExprVector {
        self.0.iter().map(DynamicSymbol::to_expr).collect()
    }
}

impl From<DynamicSymbol> for SymbolVector {
    fn from(symbol: DynamicSymbol) -> Self {
        Self(vec![symbol])
    }
}

impl From<Vec<DynamicSymbol>> for SymbolVector {
    fn from(symbols: Vec<DynamicSymbol>) -> Self {
        Self(symbols)
    }
}

impl FromIterator<DynamicSymbol> for SymbolVector {
    fn from_iter<I: IntoIterator<Item = DynamicSymbol>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Ordered vector of expressions (state or output equation).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExprVector(Vec<Expr>);

impl ExprVector {
    pub fn new(entries: Vec<Expr>) -> Self {
        Self(entries)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Expr> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[Expr] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<Expr> {
        self.0
    }

    pub fn free_dynamic_symbols(&self) -> BTreeSet<String> {
        self.0.iter().flat_map(Expr::free_dynamic_symbols).collect()
    }

    pub fn free_constant_symbols(&self) -> BTreeSet<String> {
        self.0.iter().flat_map(Expr::free_constant_symbols).collect()
    }
}

impl std::ops::Index<usize> for ExprVector {
    type Output = Expr;
    fn index(&self, index: usize) -> &Expr {
        &self.0[index]
    }
}

impl From<Expr> for ExprVector {
    fn from(expr: Expr) -> Self {
        Self(vec![expr])
    }
}

impl From<Vec<Expr>> for ExprVector {
    fn from(entries: Vec<Expr>) -> Self {
        Self(entries)
    }
}

impl From<&SymbolVector> for ExprVector {
    fn from(symbols: &SymbolVector) -> Self {
        symbols.to_exprs()
    }
}

impl FromIterator<Expr> for ExprVector {
    fn from_iter<I: IntoIterator<Item = Expr>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Row-major matrix of expressions. Vectors are stored as single columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SymbolicMatrix {
    rows: usize,
    cols: usize,
    entries: Vec<Expr>,
}

impl SymbolicMatrix {
    /// Fails with `DimensionMismatch` unless there are exactly `rows * cols` entries.
    pub fn from_row_major(rows: usize, cols: usize, entries: Vec<Expr>) -> SystemResult<Self> {
        if entries.len() != rows * cols {
            return Err(SystemError::DimensionMismatch {
                what: "symbolic matrix entries",
                expected: rows * cols,
                found: entries.len(),
            });
        }
        Ok(Self {
            rows,
            cols,
            entries,
        })
    }

    /// Builds the matrix entry by entry, row by row.
    pub fn from_fn(rows: usize, cols: usize, mut f: impl FnMut(usize, usize) -> Expr) -> Self {
        let mut entries = Vec::with_capacity(rows * cols);
        for i in 0..rows {
            for j in 0..cols {
                entries.push(f(i, j));
            }
        }
        Self {
            rows,
            cols,
            entries,
        }
    }

    pub fn column(vector: &ExprVector) -> Self {
        Self::from_fn(vector.len(), 1, |i, _| vector[i].clone())
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn nrows(&self) -> usize {
        self.rows
    }

    pub fn ncols(&self) -> usize {
        self.cols
    }

    pub fn entries(&self) -> &[Expr] {
        &self.entries
    }

    pub fn get(&self, row: usize, col: usize) -> Option<&Expr> {
        if row < self.rows && col < self.cols {
            self.entries.get(row * self.cols + col)
        } else {
            None
        }
    }

    pub fn map(&self, f: impl Fn(&Expr) -> Expr) -> Self {
        Self {
            rows: self.rows,
            cols: self.cols,
            entries: self.entries.iter().map(f).collect(),
        }
    }
}
