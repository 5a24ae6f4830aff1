//! Derivation rules and the recomputation engine.
//!
//! A rule maps a set of input properties to one or more derived outputs.
//! The rule set is closed: configuration selects instances of the kinds
//! defined here and binds their input and output keys. Each instance
//! carries a synthetic provider identity `<name>-<ordinal>` which the
//! `providers` command reports for its outputs.
//!
//! Recomputation is synchronous and cascades: when a property changes,
//! every rule reading it recomputes, and outputs that changed feed rules
//! downstream of them. A rule runs at most once per propagation round, so
//! a cyclic binding cannot loop.

mod passthrough;
mod profile;
mod session_state;

pub use passthrough::PassthroughRule;
pub use profile::ProfileRule;
pub use session_state::SessionStateRule;

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::error;

use crate::config::RuleSpec;
use crate::store::{ChangeEvent, PropertyStore, StoreError};
use crate::value::ContextValue;

/// Read access to the property table granted to rules during recomputation.
pub trait PropertyView {
    /// Current value of `key`, or `None` when undefined.
    fn value(&self, key: &str) -> Option<&ContextValue>;
}

impl PropertyView for PropertyStore {
    fn value(&self, key: &str) -> Option<&ContextValue> {
        PropertyStore::value(self, key)
    }
}

/// A single derivation rule instance.
pub trait DerivationRule: Send {
    /// Synthetic provider identity, e.g. `session-1`.
    fn instance_id(&self) -> &str;

    /// Input property names this rule reads.
    fn inputs(&self) -> &[String];

    /// Output property names this rule writes.
    fn outputs(&self) -> &[String];

    /// Recomputes every output from the current view of the inputs.
    ///
    /// Returns one `(name, value)` entry per output; `None` means the
    /// output is undefined. Implementations treat wrong-typed inputs as
    /// undefined and never fail.
    fn recompute(&mut self, view: &dyn PropertyView) -> Vec<(String, Option<ContextValue>)>;
}

/// Instantiates rules from configuration, assigning each a
/// `<name>-<ordinal>` identity in declaration order.
#[must_use]
pub fn build_rules(specs: &[RuleSpec]) -> Vec<Box<dyn DerivationRule>> {
    let mut ordinals: HashMap<&str, u32> = HashMap::new();
    let mut rules: Vec<Box<dyn DerivationRule>> = Vec::with_capacity(specs.len());
    for spec in specs {
        let ordinal = ordinals.entry(spec.name()).or_insert(0);
        *ordinal += 1;
        let id = format!("{}-{}", spec.name(), ordinal);
        rules.push(match spec {
            RuleSpec::Passthrough { map, .. } => Box::new(PassthroughRule::new(id, map.clone())),
            RuleSpec::SessionState {
                blanked,
                fullscreen,
                output,
                ..
            } => Box::new(SessionStateRule::new(
                id,
                blanked.clone(),
                fullscreen.clone(),
                output.clone(),
            )),
            RuleSpec::Profile { input, output, .. } => {
                Box::new(ProfileRule::new(id, input.clone(), output.clone()))
            },
        });
    }
    rules
}

/// Owns the configured rule instances and drives recomputation.
pub struct DerivationEngine {
    rules: Vec<Box<dyn DerivationRule>>,
    by_input: HashMap<String, Vec<usize>>,
}

impl DerivationEngine {
    #[must_use]
    pub fn new(rules: Vec<Box<dyn DerivationRule>>) -> Self {
        let mut by_input: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, rule) in rules.iter().enumerate() {
            for input in rule.inputs() {
                by_input.entry(input.clone()).or_default().push(index);
            }
        }
        Self { rules, by_input }
    }

    /// Registers every rule output in the store and computes rest values.
    ///
    /// Runs once at startup before any connection is accepted, so derived
    /// properties already hold their rest values (session state `normal`,
    /// pass-through outputs undefined) when the first subscriber arrives.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotOwner`] when an output key is already
    /// claimed, which config validation normally rules out.
    pub fn install(&mut self, store: &mut PropertyStore) -> Result<Vec<ChangeEvent>, StoreError> {
        for rule in &self.rules {
            for output in rule.outputs() {
                store.register_derived(output, rule.instance_id())?;
            }
        }
        let mut events = Vec::new();
        for index in 0..self.rules.len() {
            events.extend(self.run_rule(index, store));
        }
        Ok(events)
    }

    /// Recomputes every rule affected by a change to `changed`, cascading
    /// through derived outputs that feed further rules.
    ///
    /// The returned events preserve application order; entries with
    /// `value_changed == false` are for the notification layer to drop.
    pub fn propagate(&mut self, changed: &str, store: &mut PropertyStore) -> Vec<ChangeEvent> {
        let mut events = Vec::new();
        let mut ran: HashSet<usize> = HashSet::new();
        let mut queue: VecDeque<String> = VecDeque::from([changed.to_string()]);
        while let Some(key) = queue.pop_front() {
            let Some(indices) = self.by_input.get(&key).cloned() else {
                continue;
            };
            for index in indices {
                if !ran.insert(index) {
                    continue;
                }
                for event in self.run_rule(index, store) {
                    if event.value_changed {
                        queue.push_back(event.key.clone());
                    }
                    events.push(event);
                }
            }
        }
        events
    }

    fn run_rule(&mut self, index: usize, store: &mut PropertyStore) -> Vec<ChangeEvent> {
        let updates = self.rules[index].recompute(&*store);
        let rule_id = self.rules[index].instance_id().to_string();
        let mut events = Vec::with_capacity(updates.len());
        for (key, value) in updates {
            match store.set_derived(&key, &rule_id, value) {
                Ok(event) => events.push(event),
                // A rule emitting a wrong-typed output is a rule bug; the
                // broker keeps running on the previous value.
                Err(err) => error!(rule = %rule_id, key = %key, %err, "derived write rejected"),
            }
        }
        events
    }
}
