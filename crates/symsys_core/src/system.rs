//! The symbolic system container.
//!
//! [`SymbolicSystem`] owns a [`SystemDefinition`] together with everything
//! derived from it: the symbolic Jacobians and the compiled callables. Every
//! setter validates a candidate definition, regenerates the artifacts that
//! depend on the changed field and only then commits, so a failed assignment
//! leaves the system untouched.

use crate::codegen::{default_code_generator, CodeGenerator, CodegenOptions, CompiledFunction};
use crate::diff::jacobian;
use crate::equilibrium::{solve_equilibrium, EquilibriumSettings, Solution};
use crate::error::{SystemError, SystemResult};
use crate::expr::{Expr, ExprVector, SymbolVector, SymbolicMatrix};
use crate::traits::DynamicalSystem;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

pub type ConstantsMap = BTreeMap<String, f64>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemVariant {
    #[default]
    Stateful,
    /// No state; the output is a function of time and input only.
    Memoryless,
}

/// How [`SymbolicSystem::copy_with`] obtains the copy's callables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CopyPolicy {
    /// Share the source's state equation and output callables.
    #[default]
    ReuseCallables,
    /// Generate every callable afresh.
    Regenerate,
}

/// The symbolic description of a system, without any derived artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemDefinition {
    pub variant: SystemVariant,
    pub state: SymbolVector,
    pub input: SymbolVector,
    pub state_equation: ExprVector,
    /// `None` means the output is the state vector itself.
    pub output_equation: Option<ExprVector>,
    pub constants: ConstantsMap,
    pub initial_condition: Vec<f64>,
    pub dt: f64,
}

impl Default for SystemDefinition {
    fn default() -> Self {
        Self {
            variant: SystemVariant::Stateful,
            state: SymbolVector::default(),
            input: SymbolVector::default(),
            state_equation: ExprVector::default(),
            output_equation: None,
            constants: ConstantsMap::new(),
            initial_condition: Vec::new(),
            dt: 0.0,
        }
    }
}

impl SystemDefinition {
    pub fn dim_state(&self) -> usize {
        self.state.len()
    }

    pub fn dim_input(&self) -> usize {
        self.input.len()
    }

    pub fn dim_output(&self) -> usize {
        match &self.output_equation {
            Some(output) => output.len(),
            None => self.state.len(),
        }
    }

    /// The output equation with the identity default filled in.
    pub fn resolved_output_equation(&self) -> ExprVector {
        match &self.output_equation {
            Some(output) => output.clone(),
            None => self.state.to_exprs(),
        }
    }

    /// The symbols the output equation may depend on: the state, or the input
    /// when there is no state.
    pub fn output_scope(&self) -> (&SymbolVector, &'static str) {
        if self.state.is_empty() {
            (&self.input, "input")
        } else {
            (&self.state, "state")
        }
    }

    /// Checks every structural invariant of the definition.
    pub fn validate(&self) -> SystemResult<()> {
        if self.variant == SystemVariant::Memoryless && !self.state.is_empty() {
            return Err(SystemError::InvalidStateAssignment {
                found: self.state.len(),
            });
        }

        check_distinct(&self.state, &self.input)?;

        if self.state_equation.len() != self.state.len() {
            return Err(SystemError::DimensionMismatch {
                what: "state equation",
                expected: self.state.len(),
                found: self.state_equation.len(),
            });
        }
        for symbol in self.state_equation.free_dynamic_symbols() {
            if !self.state.contains(&symbol) && !self.input.contains(&symbol) {
                return Err(SystemError::UndeclaredSymbol {
                    what: "state equation",
                    symbol,
                });
            }
        }
        self.check_constants("state equation", &self.state_equation)?;

        if let Some(output) = &self.output_equation {
            let (scope, scope_name) = self.output_scope();
            for symbol in output.free_dynamic_symbols() {
                if !scope.contains(&symbol) {
                    return Err(SystemError::OutputScopeViolation {
                        symbol,
                        scope: scope_name,
                    });
                }
            }
            self.check_constants("output equation", output)?;
        }

        if self.initial_condition.len() != self.state.len() {
            return Err(SystemError::DimensionMismatch {
                what: "initial condition",
                expected: self.state.len(),
                found: self.initial_condition.len(),
            });
        }
        Ok(())
    }

    fn check_constants(&self, what: &'static str, equations: &ExprVector) -> SystemResult<()> {
        match equations
            .free_constant_symbols()
            .into_iter()
            .find(|name| !self.constants.contains_key(name))
        {
            Some(name) => Err(SystemError::UnboundConstant { what, name }),
            None => Ok(()),
        }
    }

    fn dynamics_arguments(&self) -> Vec<Expr> {
        std::iter::once(Expr::time())
            .chain(self.state.iter().map(|symbol| symbol.to_expr()))
            .chain(self.input.iter().map(|symbol| symbol.to_expr()))
            .collect()
    }

    fn output_arguments(&self) -> Vec<Expr> {
        let (scope, _) = self.output_scope();
        std::iter::once(Expr::time())
            .chain(scope.iter().map(|symbol| symbol.to_expr()))
            .collect()
    }
}

fn check_distinct(state: &SymbolVector, input: &SymbolVector) -> SystemResult<()> {
    let mut seen = BTreeSet::new();
    for (what, symbols) in [("state vector", state), ("input vector", input)] {
        for name in symbols.names() {
            if !seen.insert(name) {
                let what = if state.contains(name) && input.contains(name) {
                    "state and input vectors"
                } else {
                    what
                };
                return Err(SystemError::DuplicateSymbol {
                    what,
                    symbol: name.to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Which derived artifacts a mutation invalidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Regeneration {
    Nothing,
    Dynamics,
    Output,
    All,
}

impl Regeneration {
    fn dynamics(self) -> bool {
        matches!(self, Regeneration::Dynamics | Regeneration::All)
    }

    fn output(self) -> bool {
        matches!(self, Regeneration::Output | Regeneration::All)
    }
}

/// Artifacts derived from the state equation. Absent when there is no state.
#[derive(Debug, Clone, Default)]
struct DynamicsArtifacts {
    state_jacobian: Option<SymbolicMatrix>,
    input_jacobian: Option<SymbolicMatrix>,
    state_equation_function: Option<CompiledFunction>,
    state_jacobian_function: Option<CompiledFunction>,
    input_jacobian_function: Option<CompiledFunction>,
}

/// Substitutes constants and hands one array to the code generator.
struct ArtifactCompiler<'a> {
    code_generator: &'a dyn CodeGenerator,
    options: &'a CodegenOptions,
    constants: &'a ConstantsMap,
}

impl ArtifactCompiler<'_> {
    fn compile(
        &self,
        artifact: &'static str,
        args: &[Expr],
        expr: &SymbolicMatrix,
    ) -> SystemResult<CompiledFunction> {
        let substituted = expr.map(|entry| entry.substitute_constants(self.constants));
        let function = self
            .code_generator
            .generate(args, &substituted, self.options)
            .map_err(|source| SystemError::CodeGeneration { artifact, source })?;
        trace!(
            artifact,
            rows = expr.nrows(),
            cols = expr.ncols(),
            arity = args.len(),
            "generated callable"
        );
        Ok(function)
    }

    fn dynamics(&self, definition: &SystemDefinition) -> SystemResult<DynamicsArtifacts> {
        if definition.state.is_empty() {
            return Ok(DynamicsArtifacts::default());
        }
        let args = definition.dynamics_arguments();
        let state_jacobian = jacobian(&definition.state_equation, &definition.state);
        let input_jacobian = jacobian(&definition.state_equation, &definition.input);

        let state_equation_function = self.compile(
            "state equation",
            &args,
            &SymbolicMatrix::column(&definition.state_equation),
        )?;
        let state_jacobian_function = self.compile("state Jacobian", &args, &state_jacobian)?;
        let input_jacobian_function = self.compile("input Jacobian", &args, &input_jacobian)?;

        Ok(DynamicsArtifacts {
            state_jacobian: Some(state_jacobian),
            input_jacobian: Some(input_jacobian),
            state_equation_function: Some(state_equation_function),
            state_jacobian_function: Some(state_jacobian_function),
            input_jacobian_function: Some(input_jacobian_function),
        })
    }

    fn output(&self, definition: &SystemDefinition) -> SystemResult<Option<CompiledFunction>> {
        let output = definition.resolved_output_equation();
        if output.is_empty() {
            return Ok(None);
        }
        self.compile(
            "output equation",
            &definition.output_arguments(),
            &SymbolicMatrix::column(&output),
        )
        .map(Some)
    }
}

/// A validated symbolic system and its compiled numeric model.
#[derive(Clone)]
pub struct SymbolicSystem {
    definition: SystemDefinition,
    dynamics: DynamicsArtifacts,
    output_function: Option<CompiledFunction>,
    code_generator: Arc<dyn CodeGenerator>,
    codegen_options: CodegenOptions,
    n_events: usize,
}

impl fmt::Debug for SymbolicSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymbolicSystem")
            .field("definition", &self.definition)
            .field("dynamics", &self.dynamics)
            .field("output_function", &self.output_function)
            .field("codegen_options", &self.codegen_options)
            .finish_non_exhaustive()
    }
}

impl Default for SymbolicSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolicSystem {
    /// An empty stateful system. Use [`SystemBuilder`] to construct one with
    /// equations.
    pub fn new() -> Self {
        Self::empty(SystemVariant::Stateful)
    }

    /// An empty memoryless system.
    pub fn memoryless() -> Self {
        Self::empty(SystemVariant::Memoryless)
    }

    // With no symbols there is nothing to compile.
    fn empty(variant: SystemVariant) -> Self {
        Self {
            definition: SystemDefinition {
                variant,
                ..SystemDefinition::default()
            },
            dynamics: DynamicsArtifacts::default(),
            output_function: None,
            code_generator: default_code_generator(),
            codegen_options: CodegenOptions::default(),
            n_events: 0,
        }
    }

    /// Validates `definition` and compiles all of its artifacts.
    pub fn from_definition(
        definition: SystemDefinition,
        code_generator: Arc<dyn CodeGenerator>,
        codegen_options: CodegenOptions,
    ) -> SystemResult<Self> {
        definition.validate()?;
        let compiler = ArtifactCompiler {
            code_generator: code_generator.as_ref(),
            options: &codegen_options,
            constants: &definition.constants,
        };
        let dynamics = compiler.dynamics(&definition)?;
        let output_function = compiler.output(&definition)?;
        debug!(
            dim_state = definition.dim_state(),
            dim_input = definition.dim_input(),
            dim_output = definition.dim_output(),
            "compiled symbolic system"
        );
        Ok(Self {
            definition,
            dynamics,
            output_function,
            code_generator,
            codegen_options,
            n_events: 0,
        })
    }

    pub fn builder() -> SystemBuilder {
        SystemBuilder::new()
    }

    // Validate, regenerate, then commit. Nothing is written on failure.
    fn commit(&mut self, mut candidate: SystemDefinition, scope: Regeneration) -> SystemResult<()> {
        if candidate.dim_state() != self.definition.dim_state() {
            candidate.initial_condition = vec![0.0; candidate.dim_state()];
        }
        candidate.validate()?;

        let compiler = ArtifactCompiler {
            code_generator: self.code_generator.as_ref(),
            options: &self.codegen_options,
            constants: &candidate.constants,
        };
        let dynamics = if scope.dynamics() {
            Some(compiler.dynamics(&candidate)?)
        } else {
            None
        };
        let output_function = if scope.output() {
            Some(compiler.output(&candidate)?)
        } else {
            None
        };

        if let Some(dynamics) = dynamics {
            self.dynamics = dynamics;
        }
        if let Some(output_function) = output_function {
            self.output_function = output_function;
        }
        self.definition = candidate;
        if scope != Regeneration::Nothing {
            debug!(
                ?scope,
                dim_state = self.dim_state(),
                dim_input = self.dim_input(),
                dim_output = self.dim_output(),
                "regenerated system artifacts"
            );
        }
        Ok(())
    }

    fn candidate(&self) -> SystemDefinition {
        self.definition.clone()
    }

    /// Replaces the state vector. `None` clears it.
    ///
    /// The state equation must already have one entry per new state; use
    /// [`SymbolicSystem::set_dynamics`] to change both together.
    pub fn set_state(&mut self, state: Option<SymbolVector>) -> SystemResult<()> {
        let mut candidate = self.candidate();
        candidate.state = state.unwrap_or_default();
        self.commit(candidate, Regeneration::All)
    }

    pub fn set_input(&mut self, input: Option<SymbolVector>) -> SystemResult<()> {
        let mut candidate = self.candidate();
        candidate.input = input.unwrap_or_default();
        self.commit(candidate, Regeneration::All)
    }

    pub fn set_state_equation(&mut self, state_equation: Option<ExprVector>) -> SystemResult<()> {
        let mut candidate = self.candidate();
        candidate.state_equation = state_equation.unwrap_or_default();
        self.commit(candidate, Regeneration::Dynamics)
    }

    /// Replaces the output equation. `None` restores the identity output.
    pub fn set_output_equation(&mut self, output_equation: Option<ExprVector>) -> SystemResult<()> {
        let mut candidate = self.candidate();
        candidate.output_equation = output_equation;
        self.commit(candidate, Regeneration::Output)
    }

    /// Replaces state vector and state equation in one step.
    pub fn set_dynamics(
        &mut self,
        state: Option<SymbolVector>,
        state_equation: Option<ExprVector>,
    ) -> SystemResult<()> {
        let mut candidate = self.candidate();
        candidate.state = state.unwrap_or_default();
        candidate.state_equation = state_equation.unwrap_or_default();
        self.commit(candidate, Regeneration::All)
    }

    pub fn set_constants(&mut self, constants: ConstantsMap) -> SystemResult<()> {
        let mut candidate = self.candidate();
        candidate.constants = constants;
        self.commit(candidate, Regeneration::All)
    }

    pub fn set_constant(&mut self, name: impl Into<String>, value: f64) -> SystemResult<()> {
        let mut candidate = self.candidate();
        candidate.constants.insert(name.into(), value);
        self.commit(candidate, Regeneration::All)
    }

    /// `None` resets the initial condition to zeros.
    pub fn set_initial_condition(
        &mut self,
        initial_condition: Option<Vec<f64>>,
    ) -> SystemResult<()> {
        let mut candidate = self.candidate();
        candidate.initial_condition =
            initial_condition.unwrap_or_else(|| vec![0.0; candidate.dim_state()]);
        self.commit(candidate, Regeneration::Nothing)
    }

    pub fn set_dt(&mut self, dt: f64) {
        self.definition.dt = dt;
    }

    pub fn definition(&self) -> &SystemDefinition {
        &self.definition
    }

    pub fn variant(&self) -> SystemVariant {
        self.definition.variant
    }

    pub fn state(&self) -> &SymbolVector {
        &self.definition.state
    }

    pub fn input(&self) -> &SymbolVector {
        &self.definition.input
    }

    pub fn state_equation(&self) -> &ExprVector {
        &self.definition.state_equation
    }

    pub fn output_equation(&self) -> ExprVector {
        self.definition.resolved_output_equation()
    }

    pub fn constants(&self) -> &ConstantsMap {
        &self.definition.constants
    }

    pub fn initial_condition(&self) -> &[f64] {
        &self.definition.initial_condition
    }

    pub fn dt(&self) -> f64 {
        self.definition.dt
    }

    /// Always zero; events are not supported.
    pub fn n_events(&self) -> usize {
        self.n_events
    }

    pub fn dim_state(&self) -> usize {
        self.definition.dim_state()
    }

    pub fn dim_input(&self) -> usize {
        self.definition.dim_input()
    }

    pub fn dim_output(&self) -> usize {
        self.definition.dim_output()
    }

    pub fn state_jacobian_equation(&self) -> Option<&SymbolicMatrix> {
        self.dynamics.state_jacobian.as_ref()
    }

    pub fn input_jacobian_equation(&self) -> Option<&SymbolicMatrix> {
        self.dynamics.input_jacobian.as_ref()
    }

    /// `(t, *state, *input) -> dim_state x 1`
    pub fn state_equation_function(&self) -> Option<&CompiledFunction> {
        self.dynamics.state_equation_function.as_ref()
    }

    /// `(t, *state, *input) -> dim_state x dim_state`
    pub fn state_jacobian_equation_function(&self) -> Option<&CompiledFunction> {
        self.dynamics.state_jacobian_function.as_ref()
    }

    /// `(t, *state, *input) -> dim_state x dim_input`
    pub fn input_jacobian_equation_function(&self) -> Option<&CompiledFunction> {
        self.dynamics.input_jacobian_function.as_ref()
    }

    /// `(t, *state) -> dim_output x 1`, or `(t, *input)` without state.
    pub fn output_equation_function(&self) -> Option<&CompiledFunction> {
        self.output_function.as_ref()
    }

    pub fn code_generator(&self) -> &Arc<dyn CodeGenerator> {
        &self.code_generator
    }

    pub fn codegen_options(&self) -> &CodegenOptions {
        &self.codegen_options
    }

    fn dynamics_values(&self, t: f64, state: &[f64], input: &[f64]) -> SystemResult<Vec<f64>> {
        check_len("state", self.dim_state(), state.len())?;
        check_len("input", self.dim_input(), input.len())?;
        let mut args = Vec::with_capacity(1 + state.len() + input.len());
        args.push(t);
        args.extend_from_slice(state);
        args.extend_from_slice(input);
        Ok(args)
    }

    pub fn evaluate_state_jacobian(
        &self,
        t: f64,
        state: &[f64],
        input: &[f64],
    ) -> SystemResult<DMatrix<f64>> {
        let args = self.dynamics_values(t, state, input)?;
        match self.state_jacobian_equation_function() {
            Some(function) => function.call(&args),
            None => Ok(DMatrix::zeros(0, 0)),
        }
    }

    pub fn evaluate_input_jacobian(
        &self,
        t: f64,
        state: &[f64],
        input: &[f64],
    ) -> SystemResult<DMatrix<f64>> {
        let args = self.dynamics_values(t, state, input)?;
        match self.input_jacobian_equation_function() {
            Some(function) => function.call(&args),
            None => Ok(DMatrix::zeros(0, self.dim_input())),
        }
    }

    /// Solves `state_equation = 0` with the default solver settings.
    ///
    /// When `input` is given, the input symbols are replaced by those values
    /// first; otherwise they stay symbolic. Constants always stay symbolic.
    pub fn equilibrium_points(&self, input: Option<&[f64]>) -> SystemResult<Vec<Solution>> {
        self.equilibrium_points_with(input, &EquilibriumSettings::default())
    }

    pub fn equilibrium_points_with(
        &self,
        input: Option<&[f64]>,
        settings: &EquilibriumSettings,
    ) -> SystemResult<Vec<Solution>> {
        let state_equation = match input {
            Some(values) => {
                check_len("equilibrium input", self.dim_input(), values.len())?;
                let bindings: BTreeMap<String, Expr> = self
                    .definition
                    .input
                    .names()
                    .zip(values)
                    .map(|(name, &value)| (name.to_string(), Expr::number(value)))
                    .collect();
                self.definition
                    .state_equation
                    .iter()
                    .map(|equation| equation.substitute_dynamic(&bindings))
                    .collect()
            }
            None => self.definition.state_equation.clone(),
        };
        solve_equilibrium(&self.definition.state, &state_equation, settings)
    }

    /// Independent copy that shares the state equation and output callables.
    pub fn copy(&self) -> SystemResult<Self> {
        self.copy_with(CopyPolicy::ReuseCallables)
    }

    /// Rebuilds the system from its symbolic definition. The copy's initial
    /// condition is reset to zeros.
    pub fn copy_with(&self, policy: CopyPolicy) -> SystemResult<Self> {
        let definition = SystemDefinition {
            initial_condition: vec![0.0; self.dim_state()],
            ..self.definition.clone()
        };
        let mut copy = Self::from_definition(
            definition,
            Arc::clone(&self.code_generator),
            self.codegen_options.clone(),
        )?;
        if policy == CopyPolicy::ReuseCallables {
            copy.dynamics.state_equation_function = self.dynamics.state_equation_function.clone();
            copy.output_function = self.output_function.clone();
        }
        debug!(?policy, dim_state = copy.dim_state(), "copied symbolic system");
        Ok(copy)
    }
}

fn check_len(what: &'static str, expected: usize, found: usize) -> SystemResult<()> {
    if expected == found {
        Ok(())
    } else {
        Err(SystemError::DimensionMismatch {
            what,
            expected,
            found,
        })
    }
}

impl DynamicalSystem for SymbolicSystem {
    fn dim_state(&self) -> usize {
        self.definition.dim_state()
    }

    fn dim_input(&self) -> usize {
        self.definition.dim_input()
    }

    fn dim_output(&self) -> usize {
        self.definition.dim_output()
    }

    fn dt(&self) -> f64 {
        self.definition.dt
    }

    fn initial_condition(&self) -> &[f64] {
        &self.definition.initial_condition
    }

    fn evaluate_state_equation(
        &self,
        t: f64,
        state: &[f64],
        input: &[f64],
        out: &mut [f64],
    ) -> SystemResult<()> {
        let args = self.dynamics_values(t, state, input)?;
        match self.state_equation_function() {
            Some(function) => function.call_into(&args, out),
            None => check_len("state equation output buffer", 0, out.len()),
        }
    }

    fn evaluate_output(&self, t: f64, args: &[f64], out: &mut [f64]) -> SystemResult<()> {
        let (scope, _) = self.definition.output_scope();
        check_len("output arguments", scope.len(), args.len())?;
        match self.output_equation_function() {
            Some(function) => {
                let mut values = Vec::with_capacity(1 + args.len());
                values.push(t);
                values.extend_from_slice(args);
                function.call_into(&values, out)
            }
            None => check_len("output buffer", 0, out.len()),
        }
    }
}

/// Collects a system definition and compiles it once in [`SystemBuilder::build`].
///
/// Fields left unset take their defaults: no state or input, identity
/// output, zero initial condition, continuous time.
pub struct SystemBuilder {
    definition: SystemDefinition,
    initial_condition: Option<Vec<f64>>,
    code_generator: Option<Arc<dyn CodeGenerator>>,
    codegen_options: CodegenOptions,
}

impl Default for SystemBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemBuilder {
    pub fn new() -> Self {
        Self {
            definition: SystemDefinition::default(),
            initial_condition: None,
            code_generator: None,
            codegen_options: CodegenOptions::default(),
        }
    }

    pub fn memoryless() -> Self {
        let mut builder = Self::new();
        builder.definition.variant = SystemVariant::Memoryless;
        builder
    }

    pub fn state(mut self, state: impl Into<SymbolVector>) -> Self {
        self.definition.state = state.into();
        self
    }

    pub fn input(mut self, input: impl Into<SymbolVector>) -> Self {
        self.definition.input = input.into();
        self
    }

    pub fn state_equation(mut self, state_equation: impl Into<ExprVector>) -> Self {
        self.definition.state_equation = state_equation.into();
        self
    }

    pub fn output_equation(mut self, output_equation: impl Into<ExprVector>) -> Self {
        self.definition.output_equation = Some(output_equation.into());
        self
    }

    pub fn constants(mut self, constants: ConstantsMap) -> Self {
        self.definition.constants = constants;
        self
    }

    pub fn constant(mut self, name: impl Into<String>, value: f64) -> Self {
        self.definition.constants.insert(name.into(), value);
        self
    }

    pub fn initial_condition(mut self, initial_condition: Vec<f64>) -> Self {
        self.initial_condition = Some(initial_condition);
        self
    }

    pub fn dt(mut self, dt: f64) -> Self {
        self.definition.dt = dt;
        self
    }

    pub fn code_generator(mut self, code_generator: Arc<dyn CodeGenerator>) -> Self {
        self.code_generator = Some(code_generator);
        self
    }

    pub fn codegen_options(mut self, codegen_options: CodegenOptions) -> Self {
        self.codegen_options = codegen_options;
        self
    }

    pub fn build(self) -> SystemResult<SymbolicSystem> {
        let mut definition = self.definition;
        definition.initial_condition = self
            .initial_condition
            .unwrap_or_else(|| vec![0.0; definition.dim_state()]);
        SymbolicSystem::from_definition(
            definition,
            self.code_generator.unwrap_or_else(default_code_generator),
            self.codegen_options,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equation_engine::parse;
    use crate::expr::dynamic_symbols;
    use approx::assert_relative_eq;

    fn eqs(texts: &[&str]) -> ExprVector {
        texts
            .iter()
            .map(|text| parse(text).expect("should parse"))
            .collect()
    }

    fn symbols(names: &str) -> SymbolVector {
        dynamic_symbols(names).into()
    }

    fn first_order() -> SymbolicSystem {
        SystemBuilder::new()
            .state(symbols("x"))
            .input(symbols("u"))
            .state_equation(eqs(&["-x(t) + u(t)"]))
            .build()
            .expect("valid system")
    }

    fn van_der_pol() -> SymbolicSystem {
        SystemBuilder::new()
            .state(symbols("x y"))
            .input(symbols("u"))
            .state_equation(eqs(&["y(t)", "mu * (1 - x(t)^2) * y(t) - x(t) + u(t)"]))
            .output_equation(eqs(&["x(t)"]))
            .constant("mu", 1.5)
            .build()
            .expect("valid system")
    }

    struct FailingGenerator;

    impl CodeGenerator for FailingGenerator {
        fn generate(
            &self,
            _args: &[Expr],
            _expr: &SymbolicMatrix,
            _options: &CodegenOptions,
        ) -> anyhow::Result<CompiledFunction> {
            anyhow::bail!("backend unavailable")
        }
    }

    #[test]
    fn dimensions_follow_assignment() {
        let system = van_der_pol();
        assert_eq!(system.dim_state(), 2);
        assert_eq!(system.dim_input(), 1);
        assert_eq!(system.dim_output(), 1);
        assert_eq!(system.initial_condition(), &[0.0, 0.0]);
        assert_eq!(system.n_events(), 0);
        assert_eq!(system.dt(), 0.0);
        assert_eq!(
            system.state_jacobian_equation_function().map(CompiledFunction::shape),
            Some((2, 2))
        );
        assert_eq!(
            system.input_jacobian_equation_function().map(CompiledFunction::shape),
            Some((2, 1))
        );
    }

    #[test]
    fn first_order_scenario() {
        let system = first_order();

        let mut dx = [0.0];
        system
            .evaluate_state_equation(0.0, &[1.0], &[2.0], &mut dx)
            .expect("should evaluate");
        assert_eq!(dx, [1.0]);

        let mut y = [0.0];
        system.evaluate_output(0.0, &[3.0], &mut y).expect("should evaluate");
        assert_eq!(y, [3.0]);

        let a = system
            .evaluate_state_jacobian(0.0, &[1.0], &[2.0])
            .expect("should evaluate");
        let b = system
            .evaluate_input_jacobian(0.0, &[1.0], &[2.0])
            .expect("should evaluate");
        assert_eq!(a[(0, 0)], -1.0);
        assert_eq!(b[(0, 0)], 1.0);

        let points = system.equilibrium_points(None).expect("affine system");
        assert_eq!(points.len(), 1);
        assert_eq!(points[0]["x"].to_string(), "u(t)");

        let points = system.equilibrium_points(Some(&[2.0])).expect("affine system");
        assert_eq!(points[0]["x"], Expr::number(2.0));
    }

    #[test]
    fn decaying_state_rests_at_origin() {
        let system = SystemBuilder::new()
            .state(symbols("x"))
            .state_equation(eqs(&["-x(t)"]))
            .build()
            .expect("valid system");
        let points = system.equilibrium_points(None).expect("affine system");
        assert_eq!(points, vec![Solution::from([("x".to_string(), Expr::number(0.0))])]);
    }

    #[test]
    fn van_der_pol_equilibrium_follows_the_input() {
        let system = van_der_pol();
        let points = system.equilibrium_points(None).expect("solvable system");
        assert_eq!(points.len(), 1);
        assert_eq!(points[0]["x"].to_string(), "u(t)");
        assert_eq!(points[0]["y"], Expr::number(0.0));

        let points = system.equilibrium_points(Some(&[0.0])).expect("solvable system");
        assert_eq!(points[0]["x"], Expr::number(0.0));
        assert_eq!(points[0]["y"], Expr::number(0.0));
    }

    #[test]
    fn mismatched_state_equation_is_rejected() {
        let result = SystemBuilder::new()
            .state(symbols("x y"))
            .state_equation(eqs(&["-x(t)"]))
            .build();
        assert!(matches!(
            result,
            Err(SystemError::DimensionMismatch {
                what: "state equation",
                expected: 2,
                found: 1
            })
        ));
    }

    #[test]
    fn undeclared_symbols_are_rejected() {
        let result = SystemBuilder::new()
            .state(symbols("x"))
            .state_equation(eqs(&["-x(t) + w(t)"]))
            .build();
        match result {
            Err(SystemError::UndeclaredSymbol { symbol, .. }) => assert_eq!(symbol, "w"),
            other => panic!("expected UndeclaredSymbol, got {other:?}"),
        }
    }

    #[test]
    fn unbound_constants_are_rejected() {
        let result = SystemBuilder::new()
            .state(symbols("x"))
            .state_equation(eqs(&["-k * x(t)"]))
            .build();
        match result {
            Err(SystemError::UnboundConstant { name, .. }) => assert_eq!(name, "k"),
            other => panic!("expected UnboundConstant, got {other:?}"),
        }
    }

    #[test]
    fn repeated_symbols_are_rejected() {
        let result = SystemBuilder::new()
            .state(symbols("x"))
            .input(symbols("x"))
            .state_equation(eqs(&["-x(t)"]))
            .build();
        assert!(matches!(
            result,
            Err(SystemError::DuplicateSymbol {
                what: "state and input vectors",
                ..
            })
        ));

        let result = SystemBuilder::new().input(symbols("u u")).build();
        assert!(matches!(
            result,
            Err(SystemError::DuplicateSymbol {
                what: "input vector",
                ..
            })
        ));
    }

    #[test]
    fn output_must_stay_in_scope() {
        let result = SystemBuilder::new()
            .state(symbols("x"))
            .input(symbols("u"))
            .state_equation(eqs(&["-x(t) + u(t)"]))
            .output_equation(eqs(&["x(t) + u(t)"]))
            .build();
        match result {
            Err(SystemError::OutputScopeViolation { symbol, scope }) => {
                assert_eq!(symbol, "u");
                assert_eq!(scope, "state");
            }
            other => panic!("expected OutputScopeViolation, got {other:?}"),
        }
    }

    #[test]
    fn memoryless_systems_refuse_state() {
        let mut system = SystemBuilder::memoryless()
            .input(symbols("u"))
            .output_equation(eqs(&["g * u(t)"]))
            .constant("g", 2.0)
            .build()
            .expect("valid memoryless system");

        assert_eq!(system.variant(), SystemVariant::Memoryless);
        assert!(system.state_equation_function().is_none());
        let mut y = [0.0];
        system.evaluate_output(0.0, &[1.5], &mut y).expect("should evaluate");
        assert_eq!(y, [3.0]);

        let err = system
            .set_dynamics(Some(symbols("x")), Some(eqs(&["-x(t)"])))
            .expect_err("memoryless systems have no state");
        assert!(matches!(err, SystemError::InvalidStateAssignment { found: 1 }));
        assert_eq!(system.dim_state(), 0);

        system.set_state(None).expect("empty state is accepted");
        assert!(SymbolicSystem::memoryless().set_state(Some(symbols("x"))).is_err());
    }

    #[test]
    fn default_output_is_the_state() {
        let system = SystemBuilder::new()
            .state(symbols("x y"))
            .state_equation(eqs(&["y(t)", "-x(t)"]))
            .build()
            .expect("valid system");
        assert_eq!(system.output_equation(), system.state().to_exprs());
        let mut y = [0.0; 2];
        system
            .evaluate_output(0.0, &[0.25, -4.0], &mut y)
            .expect("should evaluate");
        assert_eq!(y, [0.25, -4.0]);
    }

    #[test]
    fn jacobians_match_finite_differences() {
        let system = van_der_pol();
        let (t, x, u, h) = (0.3, [0.3, -0.7], [0.2], 1e-6);

        let state_jacobian = system.evaluate_state_jacobian(t, &x, &u).expect("should evaluate");
        let input_jacobian = system.evaluate_input_jacobian(t, &x, &u).expect("should evaluate");

        let f = |x: &[f64], u: &[f64]| {
            let mut out = [0.0; 2];
            system
                .evaluate_state_equation(t, x, u, &mut out)
                .expect("should evaluate");
            out
        };
        for j in 0..2 {
            let (mut plus, mut minus) = (x, x);
            plus[j] += h;
            minus[j] -= h;
            let (fp, fm) = (f(&plus, &u), f(&minus, &u));
            for i in 0..2 {
                let numeric = (fp[i] - fm[i]) / (2.0 * h);
                assert_relative_eq!(state_jacobian[(i, j)], numeric, epsilon = 1e-6);
            }
        }
        let (fp, fm) = (f(&x, &[u[0] + h]), f(&x, &[u[0] - h]));
        for i in 0..2 {
            assert_relative_eq!(
                input_jacobian[(i, 0)],
                (fp[i] - fm[i]) / (2.0 * h),
                epsilon = 1e-6
            );
        }
    }

    #[test]
    fn failed_assignment_leaves_system_untouched() {
        let mut system = van_der_pol();
        let before = system.definition().clone();
        let function = system.state_equation_function().cloned();

        assert!(system.set_state_equation(Some(eqs(&["y(t)"]))).is_err());
        assert!(system.set_constants(ConstantsMap::new()).is_err());
        assert!(system.set_initial_condition(Some(vec![1.0])).is_err());
        assert!(system.set_input(None).is_err());

        assert_eq!(system.definition(), &before);
        let unchanged = system.state_equation_function().expect("still compiled");
        assert!(unchanged.ptr_eq(&function.expect("was compiled")));
    }

    #[test]
    fn initial_condition_is_checked_and_reset() {
        let mut system = van_der_pol();
        system
            .set_initial_condition(Some(vec![1.0, 2.0]))
            .expect("right length");
        assert_eq!(system.initial_condition(), &[1.0, 2.0]);

        let err = system
            .set_initial_condition(Some(vec![1.0]))
            .expect_err("wrong length");
        assert!(matches!(
            err,
            SystemError::DimensionMismatch {
                what: "initial condition",
                ..
            }
        ));

        // Same dimension: kept.
        system
            .set_state_equation(Some(eqs(&["-y(t)", "x(t)"])))
            .expect("valid equation");
        assert_eq!(system.initial_condition(), &[1.0, 2.0]);

        system
            .set_dynamics(Some(symbols("x")), Some(eqs(&["-x(t)"])))
            .expect("valid dynamics");
        assert_eq!(system.initial_condition(), &[0.0]);

        system.set_initial_condition(None).expect("defaults are valid");
        assert_eq!(system.initial_condition(), &[0.0]);
    }

    #[test]
    fn setters_regenerate_only_dependents() {
        let mut system = van_der_pol();
        let dynamics = system.state_equation_function().cloned().expect("compiled");
        let output = system.output_equation_function().cloned().expect("compiled");

        system
            .set_output_equation(Some(eqs(&["x(t) + y(t)"])))
            .expect("valid output");
        assert!(system.state_equation_function().expect("compiled").ptr_eq(&dynamics));
        assert!(!system.output_equation_function().expect("compiled").ptr_eq(&output));

        let output = system.output_equation_function().cloned().expect("compiled");
        system
            .set_state_equation(Some(eqs(&["y(t)", "-x(t) + u(t)"])))
            .expect("valid equation");
        assert!(!system.state_equation_function().expect("compiled").ptr_eq(&dynamics));
        assert!(system.output_equation_function().expect("compiled").ptr_eq(&output));

        system.set_dt(0.1);
        assert_eq!(system.dt(), 0.1);
    }

    #[test]
    fn constants_are_substituted_at_generation() {
        let mut system = SystemBuilder::new()
            .state(symbols("x"))
            .state_equation(eqs(&["-k * x(t)"]))
            .constant("k", 2.0)
            .build()
            .expect("valid system");
        let mut dx = [0.0];
        system
            .evaluate_state_equation(0.0, &[1.0], &[], &mut dx)
            .expect("should evaluate");
        assert_eq!(dx, [-2.0]);

        system.set_constant("k", 5.0).expect("rebinding is valid");
        system
            .evaluate_state_equation(0.0, &[1.0], &[], &mut dx)
            .expect("should evaluate");
        assert_eq!(dx, [-5.0]);
        assert_eq!(
            system.state_jacobian_equation().map(|jac| jac.entries()[0].to_string()),
            Some("-k".to_string())
        );
    }

    #[test]
    fn copies_share_callables_until_mutated() {
        let mut source = SystemBuilder::new()
            .state(symbols("x"))
            .state_equation(eqs(&["-k * x(t)"]))
            .constant("k", 1.0)
            .initial_condition(vec![3.0])
            .build()
            .expect("valid system");

        let mut copy = source.copy().expect("copyable");
        let shared = |a: &SymbolicSystem, b: &SymbolicSystem| {
            a.state_equation_function()
                .zip(b.state_equation_function())
                .is_some_and(|(a, b)| a.ptr_eq(b))
        };
        assert!(shared(&source, &copy));
        assert!(copy
            .output_equation_function()
            .zip(source.output_equation_function())
            .is_some_and(|(a, b)| a.ptr_eq(b)));
        assert_eq!(copy.initial_condition(), &[0.0]);

        copy.set_constant("k", 4.0).expect("valid constant");
        assert!(!shared(&source, &copy));

        let mut dx = [0.0];
        source
            .evaluate_state_equation(0.0, &[1.0], &[], &mut dx)
            .expect("should evaluate");
        assert_eq!(dx, [-1.0]);
        copy.evaluate_state_equation(0.0, &[1.0], &[], &mut dx)
            .expect("should evaluate");
        assert_eq!(dx, [-4.0]);

        source.set_constant("k", 2.0).expect("valid constant");
        assert_eq!(copy.constants()["k"], 4.0);

        let regenerated = source.copy_with(CopyPolicy::Regenerate).expect("copyable");
        assert!(!shared(&source, &regenerated));
    }

    #[test]
    fn generator_failures_surface_untranslated() {
        let result = SystemBuilder::new()
            .state(symbols("x"))
            .state_equation(eqs(&["-x(t)"]))
            .code_generator(Arc::new(FailingGenerator))
            .build();
        match result {
            Err(SystemError::CodeGeneration { artifact, source }) => {
                assert_eq!(artifact, "state equation");
                assert_eq!(source.to_string(), "backend unavailable");
            }
            other => panic!("expected CodeGeneration, got {other:?}"),
        }
    }

    #[test]
    fn empty_systems_compile_nothing() {
        let system = SymbolicSystem::new();
        assert_eq!(system.dim_state(), 0);
        assert_eq!(system.dim_output(), 0);
        assert!(system.state_equation_function().is_none());
        assert!(system.state_jacobian_equation().is_none());
        assert!(system.output_equation_function().is_none());
        assert!(system.equilibrium_points(None).expect("trivial").is_empty());

        let built = SystemBuilder::new()
            .code_generator(Arc::new(FailingGenerator))
            .build()
            .expect("nothing to generate");
        assert!(built.output_equation_function().is_none());
    }

    #[test]
    fn evaluation_checks_argument_lengths() {
        let system = first_order();
        let mut dx = [0.0];
        let err = system
            .evaluate_state_equation(0.0, &[1.0, 2.0], &[0.0], &mut dx)
            .expect_err("too many states");
        assert!(matches!(
            err,
            SystemError::DimensionMismatch {
                what: "state",
                expected: 1,
                found: 2
            }
        ));
        assert!(system.equilibrium_points(Some(&[])).is_err());
    }

    #[test]
    fn definitions_round_trip_through_from_definition() {
        let system = van_der_pol();
        let rebuilt = SymbolicSystem::from_definition(
            system.definition().clone(),
            default_code_generator(),
            CodegenOptions {
                simplify: false,
                ..Default::default()
            },
        )
        .expect("valid definition");
        let mut a = [0.0; 2];
        let mut b = [0.0; 2];
        system
            .evaluate_state_equation(1.0, &[0.5, 0.5], &[0.1], &mut a)
            .expect("should evaluate");
        rebuilt
            .evaluate_state_equation(1.0, &[0.5, 0.5], &[0.1], &mut b)
            .expect("should evaluate");
        assert_eq!(a, b);
    }
}
