//! Sticky profile name.

use crate::value::ContextValue;

use super::{DerivationRule, PropertyView};

/// Derives the active profile name, retaining the last accepted value.
///
/// A non-empty incoming string is adopted. An empty, wrong-typed, or
/// undefined input is rejected and the previous name stands, including
/// across loss of the providing process. Before the first accepted value
/// the output is undefined.
pub struct ProfileRule {
    id: String,
    input: String,
    output: String,
    last_accepted: Option<String>,
    inputs: Vec<String>,
    outputs: Vec<String>,
}

impl ProfileRule {
    #[must_use]
    pub fn new(id: String, input: String, output: String) -> Self {
        let inputs = vec![input.clone()];
        let outputs = vec![output.clone()];
        Self {
            id,
            input,
            output,
            last_accepted: None,
            inputs,
            outputs,
        }
    }
}

impl DerivationRule for ProfileRule {
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
        if let Some(ContextValue::Str(name)) = view.value(&self.input) {
            if !name.is_empty() {
                self.last_accepted = Some(name.clone());
            }
        }
        let value = self.last_accepted.clone().map(ContextValue::Str);
        vec![(self.output.clone(), value)]
    }
}
