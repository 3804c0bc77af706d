/// The `symsys_core` crate compiles symbolic descriptions of dynamical systems
/// into validated numeric models for an external integrator.
///
/// Key components:
/// - **Expressions**: `Expr` trees over time, dynamic symbols `x(t)` and constants.
/// - **Equation Engine**: parser, bytecode compiler and stack VM behind the default
///   code generator.
/// - **System**: `SymbolicSystem`, which validates every assignment and regenerates
///   the state equation, output and Jacobian callables it depends on.
/// - **Equilibrium**: symbolic solutions of `state_equation = 0`.
pub mod codegen;
pub mod diff;
pub mod equation_engine;
pub mod equilibrium;
pub mod error;
pub mod expr;
pub mod simplify;
pub mod system;
pub mod traits;

pub use codegen::{BytecodeGenerator, CodeGenerator, CodegenOptions, CompiledFunction, Kernel};
pub use equation_engine::{parse, ParseError};
pub use equilibrium::{EquilibriumSettings, Solution};
pub use error::{SystemError, SystemResult};
pub use expr::{
    dynamic_symbols, DynamicSymbol, Expr, ExprVector, SymbolVector, SymbolicMatrix, TIME_SYMBOL,
};
pub use system::{
    ConstantsMap, CopyPolicy, SymbolicSystem, SystemBuilder, SystemDefinition, SystemVariant,
};
pub use traits::DynamicalSystem;
