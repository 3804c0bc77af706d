use thiserror::Error;

pub type SystemResult<T> = Result<T, SystemError>;

#[derive(Error, Debug)]
pub enum SystemError {
    #[error("Dimension mismatch for {what}: expected {expected}, got {found}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("Symbol {symbol} in the {what} is not declared as a state or input")]
    UndeclaredSymbol { what: &'static str, symbol: String },

    #[error("Constant {name} in the {what} has no value in the constants map")]
    UnboundConstant { what: &'static str, name: String },

    #[error("Output equation depends on {symbol}, which is not part of the {scope} vector")]
    OutputScopeViolation {
        symbol: String,
        scope: &'static str,
    },

    #[error("Memoryless systems cannot have state (got {found} state symbols)")]
    InvalidStateAssignment { found: usize },

    #[error("Symbol {symbol} appears more than once in the {what}")]
    DuplicateSymbol { what: &'static str, symbol: String },

    #[error("Code generation failed for the {artifact}")]
    CodeGeneration {
        artifact: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("Equilibrium solver does not support this system: {reason}")]
    UnsupportedEquilibrium { reason: String },
}
