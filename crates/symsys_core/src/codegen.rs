//! Code generation: symbolic arrays to numeric callables.
//!
//! A [`CodeGenerator`] turns an ordered argument list and a symbolic matrix
//! into a [`CompiledFunction`]. The default [`BytecodeGenerator`] compiles
//! every entry for the stack VM in `equation_engine`.

use crate::equation_engine::{Bytecode, Compiler, VM};
use crate::error::{SystemError, SystemResult};
use crate::expr::{Expr, SymbolicMatrix};
use crate::simplify::simplify;
use anyhow::{bail, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Options forwarded to the code generator on every call.
///
/// Callers override individual fields over the defaults with struct update
/// syntax: `CodegenOptions { simplify: false, ..Default::default() }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodegenOptions {
    /// Simplify each entry before compiling it.
    pub simplify: bool,
    /// Initial capacity of the evaluation stack.
    pub stack_capacity: usize,
}

impl Default for CodegenOptions {
    fn default() -> Self {
        Self {
            simplify: true,
            stack_capacity: 64,
        }
    }
}

/// Something that can evaluate a compiled array.
/// `out` receives the entries in row-major order.
pub trait Kernel: Send + Sync {
    fn evaluate(&self, args: &[f64], out: &mut [f64]);
}

/// Produces numeric callables from symbolic arrays.
pub trait CodeGenerator: Send + Sync {
    /// `args` fixes the positional argument order of the returned function.
    fn generate(
        &self,
        args: &[Expr],
        expr: &SymbolicMatrix,
        options: &CodegenOptions,
    ) -> Result<CompiledFunction>;
}

/// A numeric callable with a fixed argument count and output shape.
///
/// Clones share the same kernel.
#[derive(Clone)]
pub struct CompiledFunction {
    rows: usize,
    cols: usize,
    arity: usize,
    kernel: Arc<dyn Kernel>,
}

impl CompiledFunction {
    pub fn new(rows: usize, cols: usize, arity: usize, kernel: Arc<dyn Kernel>) -> Self {
        Self {
            rows,
            cols,
            arity,
            kernel,
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    /// True when both handles refer to the same generated kernel.
    pub fn ptr_eq(&self, other: &CompiledFunction) -> bool {
        Arc::ptr_eq(&self.kernel, &other.kernel)
    }

    pub fn call_into(&self, args: &[f64], out: &mut [f64]) -> SystemResult<()> {
        if args.len() != self.arity {
            return Err(SystemError::DimensionMismatch {
                what: "function arguments",
                expected: self.arity,
                found: args.len(),
            });
        }
        if out.len() != self.rows * self.cols {
            return Err(SystemError::DimensionMismatch {
                what: "function output buffer",
                expected: self.rows * self.cols,
                found: out.len(),
            });
        }
        self.kernel.evaluate(args, out);
        Ok(())
    }

    pub fn call(&self, args: &[f64]) -> SystemResult<DMatrix<f64>> {
        let mut out = vec![0.0; self.rows * self.cols];
        self.call_into(args, &mut out)?;
        Ok(DMatrix::from_row_slice(self.rows, self.cols, &out))
    }

    /// Evaluates and flattens the result row by row.
    pub fn call_vector(&self, args: &[f64]) -> SystemResult<DVector<f64>> {
        let mut out = vec![0.0; self.rows * self.cols];
        self.call_into(args, &mut out)?;
        Ok(DVector::from_vec(out))
    }
}

impl fmt::Debug for CompiledFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledFunction")
            .field("rows", &self.rows)
            .field("cols", &self.cols)
            .field("arity", &self.arity)
            .finish_non_exhaustive()
    }
}

/// Default code generator backed by the bytecode VM.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytecodeGenerator;

struct BytecodeKernel {
    programs: Vec<Bytecode>,
    stack_capacity: usize,
}

impl Kernel for BytecodeKernel {
    fn evaluate(&self, args: &[f64], out: &mut [f64]) {
        let mut stack = Vec::with_capacity(self.stack_capacity);
        for (slot, program) in out.iter_mut().zip(&self.programs) {
            *slot = VM::execute(program, args, &mut stack);
        }
    }
}

impl CodeGenerator for BytecodeGenerator {
    fn generate(
        &self,
        args: &[Expr],
        expr: &SymbolicMatrix,
        options: &CodegenOptions,
    ) -> Result<CompiledFunction> {
        let (rows, cols) = expr.shape();
        if expr.entries().len() != rows * cols {
            bail!(
                "{rows}x{cols} matrix holds {} entries instead of {}",
                expr.entries().len(),
                rows * cols
            );
        }
        let compiler = Compiler::new(args)?;
        let programs = expr
            .entries()
            .iter()
            .map(|entry| {
                if options.simplify {
                    compiler.compile(&simplify(entry))
                } else {
                    compiler.compile(entry)
                }
            })
            .collect::<Result<Vec<_>>>()?;
        let kernel = BytecodeKernel {
            programs,
            stack_capacity: options.stack_capacity,
        };
        Ok(CompiledFunction::new(rows, cols, args.len(), Arc::new(kernel)))
    }
}

pub fn default_code_generator() -> Arc<dyn CodeGenerator> {
    Arc::new(BytecodeGenerator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equation_engine::parse;

    fn matrix(rows: usize, cols: usize, entries: &[&str]) -> SymbolicMatrix {
        SymbolicMatrix::from_row_major(
            rows,
            cols,
            entries
                .iter()
                .map(|text| parse(text).expect("should parse"))
                .collect(),
        )
        .expect("entries should fill the shape")
    }

    #[test]
    fn generated_function_follows_argument_order() {
        let args = [Expr::time(), Expr::dynamic("x"), Expr::dynamic("u")];
        let expr = matrix(2, 1, &["-x(t) + u(t)", "t * x(t)"]);
        let function = BytecodeGenerator
            .generate(&args, &expr, &CodegenOptions::default())
            .expect("should generate");

        assert_eq!(function.shape(), (2, 1));
        assert_eq!(function.arity(), 3);
        let value = function.call_vector(&[2.0, 1.0, 0.5]).expect("should evaluate");
        assert_eq!(value.as_slice(), &[-0.5, 2.0]);
    }

    #[test]
    fn matrices_come_back_row_major() {
        let args = [Expr::time(), Expr::dynamic("x")];
        let expr = matrix(2, 2, &["1", "2", "x(t)", "t"]);
        let function = BytecodeGenerator
            .generate(&args, &expr, &CodegenOptions::default())
            .expect("should generate");
        let value = function.call(&[4.0, 3.0]).expect("should evaluate");
        assert_eq!(value[(0, 1)], 2.0);
        assert_eq!(value[(1, 0)], 3.0);
        assert_eq!(value[(1, 1)], 4.0);
    }

    #[test]
    fn wrong_argument_count_is_a_dimension_mismatch() {
        let args = [Expr::time(), Expr::dynamic("x")];
        let function = BytecodeGenerator
            .generate(&args, &matrix(1, 1, &["x(t)"]), &CodegenOptions::default())
            .expect("should generate");
        let err = function.call(&[1.0]).expect_err("arity must be checked");
        assert!(matches!(
            err,
            SystemError::DimensionMismatch {
                expected: 2,
                found: 1,
                ..
            }
        ));
    }

    #[test]
    fn unknown_symbols_fail_generation() {
        let args = [Expr::time()];
        let result = BytecodeGenerator.generate(
            &args,
            &matrix(1, 1, &["k * t"]),
            &CodegenOptions::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn clones_share_the_kernel() {
        let args = [Expr::time()];
        let function = BytecodeGenerator
            .generate(&args, &matrix(1, 1, &["t"]), &CodegenOptions::default())
            .expect("should generate");
        let other = BytecodeGenerator
            .generate(&args, &matrix(1, 1, &["t"]), &CodegenOptions::default())
            .expect("should generate");
        assert!(function.ptr_eq(&function.clone()));
        assert!(!function.ptr_eq(&other));
    }
}
