//! Core WASM system wrapper: a `SymbolicSystem` built from strings.

use anyhow::{anyhow, bail, Context, Result};
use js_sys::Float64Array;
use nalgebra::DMatrix;
use symsys_core::{
    dynamic_symbols, parse, ConstantsMap, DynamicalSystem, ExprVector, SymbolVector,
    SymbolicSystem, SystemBuilder,
};
use wasm_bindgen::prelude::*;

#[wasm_bindgen]
pub struct WasmSymbolicSystem {
    pub(crate) system: SymbolicSystem,
}

pub(crate) fn to_js_error(err: anyhow::Error) -> JsValue {
    JsValue::from_str(&format!("{err:#}"))
}

fn parse_equations(what: &str, equations: &[String]) -> Result<ExprVector> {
    equations
        .iter()
        .map(|text| parse(text).with_context(|| format!("Invalid {what} \"{text}\"")))
        .collect::<Result<Vec<_>>>()
        .map(ExprVector::from)
}

fn symbol_vector(names: &[String]) -> SymbolVector {
    names.iter().flat_map(|name| dynamic_symbols(name)).collect()
}

fn constants_map(names: &[String], values: &[f64]) -> Result<ConstantsMap> {
    if names.len() != values.len() {
        bail!(
            "Constant names and values differ in length ({} vs {}).",
            names.len(),
            values.len()
        );
    }
    Ok(names.iter().cloned().zip(values.iter().copied()).collect())
}

/// Builds a system from its textual description. An empty `output_equations`
/// selects the identity output.
#[allow(clippy::too_many_arguments)]
pub(crate) fn build_symbolic_system(
    state_names: &[String],
    input_names: &[String],
    state_equations: &[String],
    output_equations: &[String],
    constant_names: &[String],
    constant_values: &[f64],
    dt: f64,
    memoryless: bool,
) -> Result<SymbolicSystem> {
    let builder = if memoryless {
        SystemBuilder::memoryless()
    } else {
        SystemBuilder::new()
    };
    let mut builder = builder
        .state(symbol_vector(state_names))
        .input(symbol_vector(input_names))
        .state_equation(parse_equations("state equation", state_equations)?)
        .constants(constants_map(constant_names, constant_values)?)
        .dt(dt);
    if !output_equations.is_empty() {
        builder = builder.output_equation(parse_equations("output equation", output_equations)?);
    }
    builder.build().map_err(|err| anyhow!(err))
}

impl WasmSymbolicSystem {
    pub(crate) fn state_derivative(
        &self,
        t: f64,
        state: &[f64],
        input: &[f64],
    ) -> Result<Vec<f64>> {
        let mut out = vec![0.0; self.system.dim_state()];
        self.system.evaluate_state_equation(t, state, input, &mut out)?;
        Ok(out)
    }

    pub(crate) fn output(&self, t: f64, args: &[f64]) -> Result<Vec<f64>> {
        let mut out = vec![0.0; self.system.dim_output()];
        self.system.evaluate_output(t, args, &mut out)?;
        Ok(out)
    }

    /// Row-major state Jacobian.
    pub(crate) fn state_jacobian_row_major(
        &self,
        t: f64,
        state: &[f64],
        input: &[f64],
    ) -> Result<Vec<f64>> {
        let jacobian: DMatrix<f64> = self.system.evaluate_state_jacobian(t, state, input)?;
        Ok(jacobian.transpose().as_slice().to_vec())
    }

    /// Row-major input Jacobian.
    pub(crate) fn input_jacobian_row_major(
        &self,
        t: f64,
        state: &[f64],
        input: &[f64],
    ) -> Result<Vec<f64>> {
        let jacobian: DMatrix<f64> = self.system.evaluate_input_jacobian(t, state, input)?;
        Ok(jacobian.transpose().as_slice().to_vec())
    }
}

#[wasm_bindgen]
impl WasmSymbolicSystem {
    #[allow(clippy::too_many_arguments)]
    #[wasm_bindgen(constructor)]
    pub fn new(
        state_names: Vec<String>,
        input_names: Vec<String>,
        state_equations: Vec<String>,
        output_equations: Vec<String>,
        constant_names: Vec<String>,
        constant_values: Vec<f64>,
        dt: f64,
        memoryless: bool,
    ) -> Result<WasmSymbolicSystem, JsValue> {
        console_error_panic_hook::set_once();

        let system = build_symbolic_system(
            &state_names,
            &input_names,
            &state_equations,
            &output_equations,
            &constant_names,
            &constant_values,
            dt,
            memoryless,
        )
        .map_err(to_js_error)?;
        Ok(WasmSymbolicSystem { system })
    }

    pub fn dim_state(&self) -> usize {
        self.system.dim_state()
    }

    pub fn dim_input(&self) -> usize {
        self.system.dim_input()
    }

    pub fn dim_output(&self) -> usize {
        self.system.dim_output()
    }

    pub fn dt(&self) -> f64 {
        self.system.dt()
    }

    pub fn set_dt(&mut self, dt: f64) {
        self.system.set_dt(dt);
    }

    pub fn get_initial_condition(&self) -> Vec<f64> {
        self.system.initial_condition().to_vec()
    }

    pub fn set_initial_condition(&mut self, initial_condition: Vec<f64>) -> Result<(), JsValue> {
        self.system
            .set_initial_condition(Some(initial_condition))
            .map_err(|err| to_js_error(err.into()))
    }

    pub fn set_constant(&mut self, name: &str, value: f64) -> Result<(), JsValue> {
        self.system
            .set_constant(name, value)
            .map_err(|err| to_js_error(err.into()))
    }

    /// The state equation, output and Jacobians as printable text.
    pub fn describe(&self) -> Result<JsValue, JsValue> {
        let description = SystemDescription::from(&self.system);
        serde_wasm_bindgen::to_value(&description)
            .map_err(|err| JsValue::from_str(&format!("Serialization error: {err}")))
    }

    pub fn evaluate_state_equation(
        &self,
        t: f64,
        state: Vec<f64>,
        input: Vec<f64>,
    ) -> Result<Float64Array, JsValue> {
        let values = self.state_derivative(t, &state, &input).map_err(to_js_error)?;
        Ok(Float64Array::from(values.as_slice()))
    }

    pub fn evaluate_output(&self, t: f64, args: Vec<f64>) -> Result<Float64Array, JsValue> {
        let values = self.output(t, &args).map_err(to_js_error)?;
        Ok(Float64Array::from(values.as_slice()))
    }

    pub fn evaluate_state_jacobian(
        &self,
        t: f64,
        state: Vec<f64>,
        input: Vec<f64>,
    ) -> Result<Float64Array, JsValue> {
        let values = self
            .state_jacobian_row_major(t, &state, &input)
            .map_err(to_js_error)?;
        Ok(Float64Array::from(values.as_slice()))
    }

    pub fn evaluate_input_jacobian(
        &self,
        t: f64,
        state: Vec<f64>,
        input: Vec<f64>,
    ) -> Result<Float64Array, JsValue> {
        let values = self
            .input_jacobian_row_major(t, &state, &input)
            .map_err(to_js_error)?;
        Ok(Float64Array::from(values.as_slice()))
    }

    /// Independent copy sharing the compiled state equation and output.
    pub fn copy(&self) -> Result<WasmSymbolicSystem, JsValue> {
        let system = self.system.copy().map_err(|err| to_js_error(err.into()))?;
        Ok(WasmSymbolicSystem { system })
    }
}

/// Printable snapshot of a system for the UI.
#[derive(serde::Serialize)]
pub(crate) struct SystemDescription {
    state: Vec<String>,
    input: Vec<String>,
    state_equation: Vec<String>,
    output_equation: Vec<String>,
    state_jacobian: Vec<String>,
    input_jacobian: Vec<String>,
}

impl From<&SymbolicSystem> for SystemDescription {
    fn from(system: &SymbolicSystem) -> Self {
        let print =
            |entries: &[symsys_core::Expr]| entries.iter().map(ToString::to_string).collect();
        Self {
            state: system.state().names().map(str::to_string).collect(),
            input: system.input().names().map(str::to_string).collect(),
            state_equation: print(system.state_equation().as_slice()),
            output_equation: print(system.output_equation().as_slice()),
            state_jacobian: system
                .state_jacobian_equation()
                .map(|jac| print(jac.entries()))
                .unwrap_or_default(),
            input_jacobian: system
                .input_jacobian_equation()
                .map(|jac| print(jac.entries()))
                .unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    fn oscillator() -> WasmSymbolicSystem {
        WasmSymbolicSystem::new(
            strings(&["x", "v"]),
            strings(&["u"]),
            strings(&["v(t)", "-w^2 * x(t) - c * v(t) + u(t)"]),
            Vec::new(),
            strings(&["w", "c"]),
            vec![2.0, 0.5],
            0.0,
            false,
        )
        .expect("system should build")
    }

    #[test]
    #[cfg(target_arch = "wasm32")]
    fn build_rejects_invalid_equation() {
        let result = WasmSymbolicSystem::new(
            strings(&["x"]),
            Vec::new(),
            strings(&["1 +"]),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            0.0,
            false,
        );
        assert!(result.is_err(), "expected parse error for invalid equation");
    }

    #[test]
    #[cfg(target_arch = "wasm32")]
    fn build_rejects_unbound_constant() {
        let result = WasmSymbolicSystem::new(
            strings(&["x"]),
            Vec::new(),
            strings(&["-k * x(t)"]),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            0.0,
            false,
        );
        assert!(result.is_err(), "expected unbound constant error");
    }

    #[test]
    fn build_reports_mismatched_constants() {
        let err = build_symbolic_system(
            &strings(&["x"]),
            &[],
            &strings(&["-k * x(t)"]),
            &[],
            &strings(&["k"]),
            &[],
            0.0,
            false,
        )
        .expect_err("constant values are missing");
        assert!(err.to_string().contains("differ in length"));
    }

    #[test]
    fn oscillator_reports_dimensions() {
        let system = oscillator();
        assert_eq!(system.dim_state(), 2);
        assert_eq!(system.dim_input(), 1);
        assert_eq!(system.dim_output(), 2);
        assert_eq!(system.get_initial_condition(), vec![0.0, 0.0]);
    }

    #[test]
    fn oscillator_evaluates_derivative_and_output() {
        let system = oscillator();
        let derivative = system
            .state_derivative(0.0, &[1.0, 2.0], &[0.5])
            .expect("should evaluate");
        assert_eq!(derivative, vec![2.0, -4.0 - 1.0 + 0.5]);

        let output = system.output(0.0, &[1.0, 2.0]).expect("should evaluate");
        assert_eq!(output, vec![1.0, 2.0]);
    }

    #[test]
    fn jacobians_come_back_row_major() {
        let system = oscillator();
        let state_jacobian = system
            .state_jacobian_row_major(0.0, &[1.0, 2.0], &[0.0])
            .expect("should evaluate");
        assert_eq!(state_jacobian, vec![0.0, 1.0, -4.0, -0.5]);

        let input_jacobian = system
            .input_jacobian_row_major(0.0, &[1.0, 2.0], &[0.0])
            .expect("should evaluate");
        assert_eq!(input_jacobian, vec![0.0, 1.0]);
    }

    #[test]
    fn memoryless_system_maps_input_to_output() {
        let system = build_symbolic_system(
            &[],
            &strings(&["u"]),
            &[],
            &strings(&["g * u(t) + sin(t)"]),
            &strings(&["g"]),
            &[3.0],
            0.1,
            true,
        )
        .expect("system should build");
        let system = WasmSymbolicSystem { system };
        assert_eq!(system.dim_state(), 0);
        assert_eq!(system.dt(), 0.1);
        assert_eq!(system.output(0.0, &[2.0]).expect("should evaluate"), vec![6.0]);
    }

    #[test]
    fn description_prints_jacobians() {
        let system = oscillator();
        let description = SystemDescription::from(&system.system);
        assert_eq!(description.state, strings(&["x", "v"]));
        assert_eq!(description.output_equation, strings(&["x(t)", "v(t)"]));
        assert_eq!(description.state_jacobian, strings(&["0", "1", "-w^2", "-c"]));
        assert_eq!(description.input_jacobian, strings(&["0", "1"]));
    }

    #[test]
    fn copy_keeps_its_own_constants() {
        let mut system = oscillator();
        let copy = system.copy().expect("copyable");
        system.set_constant("w", 1.0).expect("valid constant");

        let original = system
            .state_derivative(0.0, &[1.0, 0.0], &[0.0])
            .expect("should evaluate");
        let copied = copy
            .state_derivative(0.0, &[1.0, 0.0], &[0.0])
            .expect("should evaluate");
        assert_eq!(original, vec![0.0, -1.0]);
        assert_eq!(copied, vec![0.0, -4.0]);
    }
}
