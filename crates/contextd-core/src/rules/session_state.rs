//! Priority-ordered session state.

use crate::value::ContextValue;

use super::{DerivationRule, PropertyView};

/// Derives a session state from blanking and fullscreen indicators.
///
/// The output is the highest-priority condition currently true, in strict
/// order `fullscreen` over `blanked` over `normal`. Fullscreen wins when
/// both indicators hold at once. Undefined or wrong-typed inputs count as
/// false, so the rest state is `normal` and unsetting an input falls back
/// through the chain immediately.
pub struct SessionStateRule {
    id: String,
    blanked: String,
    fullscreen: String,
    output: String,
    inputs: Vec<String>,
    outputs: Vec<String>,
}

impl SessionStateRule {
    #[must_use]
    pub fn new(id: String, blanked: String, fullscreen: String, output: String) -> Self {
        let inputs = vec![blanked.clone(), fullscreen.clone()];
        let outputs = vec![output.clone()];
        Self {
            id,
            blanked,
            fullscreen,
            output,
            inputs,
            outputs,
        }
    }
}

impl DerivationRule for SessionStateRule {
    fn instance_id(&self) -> &str {
        &self.id
    }

    fn inputs(&self) -> &[String] {
        &self.inputs
    }

    fn outputs(&self) -> &[String] {
        &self.outputs
    }

    fn recompute(&mut self, view: &dyn PropertyView) -> Vec<(String, Option<ContextValue>)> {
        let blanked = is_true(view.value(&self.blanked));
        let fullscreen = is_true(view.value(&self.fullscreen));
        let state = if fullscreen {
            "fullscreen"
        } else if blanked {
            "blanked"
        } else {
            "normal"
        };
        vec![(
            self.output.clone(),
            Some(ContextValue::Str(state.to_string())),
        )]
    }
}

fn is_true(value: Option<&ContextValue>) -> bool {
    matches!(value, Some(ContextValue::Bool(true)))
}
