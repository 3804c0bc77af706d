//! JavaScript bindings for `symsys_core`: build a symbolic system from
//! strings, evaluate its compiled functions and query equilibria.

mod equilibrium;
mod system;

pub use system::WasmSymbolicSystem;
