//! Symbolic equilibrium points for the UI.

use crate::system::{to_js_error, WasmSymbolicSystem};
use anyhow::Result;
use serde::Serialize;
use serde_wasm_bindgen::to_value;
use symsys_core::Solution;
use wasm_bindgen::prelude::*;

/// One state variable of an equilibrium point.
#[derive(Debug, Serialize, PartialEq)]
pub(crate) struct EquilibriumEntry {
    variable: String,
    expression: String,
    /// Present when the expression folded to a number.
    value: Option<f64>,
}

fn entries(solution: &Solution) -> Vec<EquilibriumEntry> {
    solution
        .iter()
        .map(|(variable, expr)| EquilibriumEntry {
            variable: variable.clone(),
            expression: expr.to_string(),
            value: expr.as_number(),
        })
        .collect()
}

impl WasmSymbolicSystem {
    pub(crate) fn equilibrium_entries(
        &self,
        input: Option<&[f64]>,
    ) -> Result<Vec<Vec<EquilibriumEntry>>> {
        let points = self.system.equilibrium_points(input)?;
        Ok(points.iter().map(entries).collect())
    }
}

#[wasm_bindgen]
impl WasmSymbolicSystem {
    /// Equilibrium points as `[[{variable, expression, value}]]`. Inputs stay
    /// symbolic unless `input` is given.
    pub fn equilibrium_points(&self, input: Option<Vec<f64>>) -> Result<JsValue, JsValue> {
        let points = self
            .equilibrium_entries(input.as_deref())
            .map_err(|err| to_js_error(err.context("Equilibrium solve failed")))?;
        to_value(&points).map_err(|e| JsValue::from_str(&format!("Serialization error: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::build_symbolic_system;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    fn system(state: &[&str], input: &[&str], equations: &[&str]) -> WasmSymbolicSystem {
        let system = build_symbolic_system(
            &strings(state),
            &strings(input),
            &strings(equations),
            &[],
            &strings(&["k"]),
            &[2.0],
            0.0,
            false,
        )
        .expect("system should build");
        WasmSymbolicSystem { system }
    }

    #[test]
    fn symbolic_input_stays_in_the_expression() {
        let points = system(&["x"], &["u"], &["-k * x(t) + u(t)"])
            .equilibrium_entries(None)
            .expect("affine system");
        assert_eq!(
            points,
            vec![vec![EquilibriumEntry {
                variable: "x".to_string(),
                expression: "u(t) / k".to_string(),
                value: None,
            }]]
        );
    }

    #[test]
    fn numeric_input_gives_numeric_points() {
        let points = system(&["x"], &["u"], &["u(t) - x(t)^2"])
            .equilibrium_entries(Some(&[4.0]))
            .expect("decoupled polynomial");
        let values: Vec<Option<f64>> = points.iter().map(|point| point[0].value).collect();
        assert_eq!(values, vec![Some(-2.0), Some(2.0)]);
    }

    #[test]
    fn unsupported_forms_are_errors() {
        let result = system(&["x"], &[], &["sin(x(t)) - 0.5"]).equilibrium_entries(None);
        assert!(result.is_err());
    }

    #[cfg(target_arch = "wasm32")]
    #[wasm_bindgen_test::wasm_bindgen_test]
    fn equilibrium_points_serialize() {
        let value = system(&["x"], &[], &["-x(t)"])
            .equilibrium_points(None)
            .expect("serializable");
        assert!(value.is_object());
    }
}
