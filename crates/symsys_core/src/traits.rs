use crate::error::SystemResult;
use num_traits::{Float, FromPrimitive};
use std::fmt::Debug;

/// A trait for types that can be used as scalars by the bytecode VM.
/// Must support basic arithmetic, debug printing, and conversion from f64.
pub trait Scalar: Float + FromPrimitive + Debug + 'static {}

impl<T: Float + FromPrimitive + Debug + 'static> Scalar for T {}

/// The view of a compiled system that an external integrator works against.
pub trait DynamicalSystem {
    /// Number of state variables.
    fn dim_state(&self) -> usize;

    /// Number of input variables.
    fn dim_input(&self) -> usize;

    /// Number of output components.
    fn dim_output(&self) -> usize;

    /// Sample period. `0` means continuous time.
    fn dt(&self) -> f64;

    fn initial_condition(&self) -> &[f64];

    /// Evaluates the state equation.
    /// t: current time
    /// state: current state (`dim_state` entries)
    /// input: current input (`dim_input` entries)
    /// out: buffer to write dx/dt (or x_{n+1} for discrete systems)
    fn evaluate_state_equation(
        &self,
        t: f64,
        state: &[f64],
        input: &[f64],
        out: &mut [f64],
    ) -> SystemResult<()>;

    /// Evaluates the output equation. `args` is the state for systems with
    /// state and the input for stateless ones.
    fn evaluate_output(&self, t: f64, args: &[f64], out: &mut [f64]) -> SystemResult<()>;

    /// Hook called by an integrator before a run.
    fn prepare_to_integrate(&mut self) {}
}
