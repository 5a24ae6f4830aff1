//! Boolean pass-through with an existence gate.

use std::collections::BTreeMap;

use crate::value::ContextValue;

use super::{DerivationRule, PropertyView};

/// Mirrors raw boolean inputs onto derived outputs.
///
/// Each configured `input → output` pair copies the input's boolean value.
/// The output is undefined exactly when the input is undefined; a
/// wrong-typed input counts as undefined too.
pub struct PassthroughRule {
    id: String,
    map: BTreeMap<String, String>,
    inputs: Vec<String>,
    outputs: Vec<String>,
}

impl PassthroughRule {
    #[must_use]
    pub fn new(id: String, map: BTreeMap<String, String>) -> Self {
        let inputs = map.keys().cloned().collect();
        let outputs = map.values().cloned().collect();
        Self {
            id,
            map,
            inputs,
            outputs,
        }
    }
}

impl DerivationRule for PassthroughRule {
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
        self.map
            .iter()
            .map(|(input, output)| {
                let value = match view.value(input) {
                    Some(ContextValue::Bool(b)) => Some(ContextValue::Bool(*b)),
                    _ => None,
                };
                (output.clone(), value)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    struct MapView(HashMap<&'static str, ContextValue>);

    impl PropertyView for MapView {
        fn value(&self, key: &str) -> Option<&ContextValue> {
            self.0.get(key)
        }
    }

    fn bluez() -> PassthroughRule {
        PassthroughRule::new(
            "bluez-1".to_string(),
            BTreeMap::from([
                (
                    "Bluetooth.Powered".to_string(),
                    "Bluetooth.Enabled".to_string(),
                ),
                (
                    "Bluetooth.Discoverable".to_string(),
                    "Bluetooth.Visible".to_string(),
                ),
            ]),
        )
    }

    #[test]
    fn copies_defined_booleans() {
        let mut rule = bluez();
        let view = MapView(HashMap::from([
            ("Bluetooth.Powered", ContextValue::Bool(true)),
            ("Bluetooth.Discoverable", ContextValue::Bool(false)),
        ]));
        let out = rule.recompute(&view);
        assert!(out.contains(&(
            "Bluetooth.Enabled".to_string(),
            Some(ContextValue::Bool(true))
        )));
        assert!(out.contains(&(
            "Bluetooth.Visible".to_string(),
            Some(ContextValue::Bool(false))
        )));
    }

    #[test]
    fn undefined_input_gates_the_output() {
        let mut rule = bluez();
        let view = MapView(HashMap::from([(
            "Bluetooth.Powered",
            ContextValue::Bool(true),
        )]));
        let out = rule.recompute(&view);
        assert!(out.contains(&(
            "Bluetooth.Enabled".to_string(),
            Some(ContextValue::Bool(true))
        )));
        assert!(out.contains(&("Bluetooth.Visible".to_string(), None)));
    }

    #[test]
    fn wrong_typed_input_counts_as_undefined() {
        let mut rule = bluez();
        let view = MapView(HashMap::from([(
            "Bluetooth.Powered",
            ContextValue::Str("on".to_string()),
        )]));
        let out = rule.recompute(&view);
        assert!(out.contains(&("Bluetooth.Enabled".to_string(), None)));
    }
}
