//! Authoritative property table.
//!
//! The store holds the current value of every raw and derived property
//! together with its declared type, its owner, and a monotonic revision
//! counter. All mutation runs inside the broker coordinator task, so the
//! store itself is single-threaded and lock-free.
//!
//! Two write paths exist: [`PropertyStore::set_raw`]/[`PropertyStore::unset`]
//! for provider-owned properties and [`PropertyStore::set_derived`] for rule
//! outputs. A property's type is locked by the first concrete value it ever
//! holds; a later write of a different type is rejected without mutating
//! state, and the lock survives ownership changes.

use std::collections::HashMap;

use crate::value::{ContextType, ContextValue};

/// Monotonic per-property revision counter. Starts at 0 (never mutated).
pub type Revision = u64;

/// Outcome of a successful store mutation.
///
/// The revision always advances; `value_changed` is false when the new value
/// equals the previous one, which lets the notification layer suppress
/// redundant pushes while the revision history stays honest.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub key: String,
    pub value: Option<ContextValue>,
    pub revision: Revision,
    pub value_changed: bool,
}

/// Store-level rejection of a mutation. State is untouched on error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The property's type was locked by an earlier definition.
    #[error("property {key} is locked to type {expected}, refusing {offered}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        offered: &'static str,
    },

    /// The property is currently owned by someone else.
    #[error("property {key} is owned by {owner}")]
    NotOwner { key: String, owner: String },

    /// The caller never declared the property it tries to mutate.
    #[error("{provider} is not a provider of {key}")]
    NotAProvider { key: String, provider: String },
}

#[derive(Debug)]
struct Slot {
    key_type: Option<ContextType>,
    owner: Option<String>,
    value: Option<ContextValue>,
    revision: Revision,
    derived: bool,
}

impl Slot {
    /// Applies a new value, bumping the revision and reporting the change.
    fn apply(&mut self, key: &str, value: Option<ContextValue>) -> ChangeEvent {
        let value_changed = self.value != value;
        self.value = value;
        self.revision += 1;
        ChangeEvent {
            key: key.to_string(),
            value: self.value.clone(),
            revision: self.revision,
            value_changed,
        }
    }

    fn check_type(&mut self, key: &str, value: &ContextValue) -> Result<(), StoreError> {
        match self.key_type {
            Some(locked) if locked != value.context_type() => Err(StoreError::TypeMismatch {
                key: key.to_string(),
                expected: locked.wire_name(),
                offered: value.context_type().wire_name(),
            }),
            Some(_) => Ok(()),
            None => {
                self.key_type = Some(value.context_type());
                Ok(())
            },
        }
    }
}

/// Current value, type, owner, and revision of every known property.
#[derive(Debug, Default)]
pub struct PropertyStore {
    slots: HashMap<String, Slot>,
}

impl PropertyStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of `key`; `None` when undefined or never declared.
    #[must_use]
    pub fn value(&self, key: &str) -> Option<&ContextValue> {
        self.slots.get(key).and_then(|slot| slot.value.as_ref())
    }

    /// Declared type of `key`, once locked by a first definition.
    #[must_use]
    pub fn key_type(&self, key: &str) -> Option<ContextType> {
        self.slots.get(key).and_then(|slot| slot.key_type)
    }

    /// Current owner of `key`: a provider id for raw properties, a rule
    /// instance id for derived ones. `None` for unowned or unknown keys.
    #[must_use]
    pub fn owner(&self, key: &str) -> Option<&str> {
        self.slots.get(key).and_then(|slot| slot.owner.as_deref())
    }

    /// Revision of `key`; 0 for keys that were never mutated.
    #[must_use]
    pub fn revision(&self, key: &str) -> Revision {
        self.slots.get(key).map_or(0, |slot| slot.revision)
    }

    /// Writes a raw property on behalf of `provider`.
    ///
    /// The first definition of a key locks its type and takes ownership.
    /// An unowned key (its provider went away) may be claimed by any
    /// provider, but the original type lock still applies.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotOwner`] when another provider or a rule owns the
    /// key; [`StoreError::TypeMismatch`] when the value's type differs from
    /// the locked one.
    pub fn set_raw(
        &mut self,
        key: &str,
        provider: &str,
        value: ContextValue,
    ) -> Result<ChangeEvent, StoreError> {
        let slot = self.slots.entry(key.to_string()).or_insert_with(|| Slot {
            key_type: None,
            owner: None,
            value: None,
            revision: 0,
            derived: false,
        });
        match &slot.owner {
            Some(owner) if slot.derived || owner != provider => {
                return Err(StoreError::NotOwner {
                    key: key.to_string(),
                    owner: owner.clone(),
                });
            },
            _ => {},
        }
        slot.check_type(key, &value)?;
        slot.owner = Some(provider.to_string());
        Ok(slot.apply(key, Some(value)))
    }

    /// Transitions a raw property to undefined. Ownership is retained: the
    /// provider still serves the key and may define it again.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotAProvider`] when `provider` does not own the key,
    /// [`StoreError::NotOwner`] when someone else does.
    pub fn unset(&mut self, key: &str, provider: &str) -> Result<ChangeEvent, StoreError> {
        let Some(slot) = self.slots.get_mut(key) else {
            return Err(StoreError::NotAProvider {
                key: key.to_string(),
                provider: provider.to_string(),
            });
        };
        match &slot.owner {
            Some(owner) if !slot.derived && owner == provider => Ok(slot.apply(key, None)),
            Some(owner) => Err(StoreError::NotOwner {
                key: key.to_string(),
                owner: owner.clone(),
            }),
            None => Err(StoreError::NotAProvider {
                key: key.to_string(),
                provider: provider.to_string(),
            }),
        }
    }

    /// Unsets every raw property `provider` owns and clears its ownership,
    /// as one atomic step on provider disconnect.
    ///
    /// Events are returned in key order; entries for keys that were already
    /// undefined carry `value_changed == false`.
    pub fn mark_provider_gone(&mut self, provider: &str) -> Vec<ChangeEvent> {
        let mut keys: Vec<String> = self
            .slots
            .iter()
            .filter(|(_, slot)| !slot.derived && slot.owner.as_deref() == Some(provider))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys.into_iter()
            .filter_map(|key| {
                let slot = self.slots.get_mut(&key)?;
                slot.owner = None;
                Some(slot.apply(&key, None))
            })
            .collect()
    }

    /// Declares `key` as the output of rule `rule`, before any value exists.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotOwner`] when the key is already claimed. Duplicate
    /// outputs are rejected by config validation; this is the backstop.
    pub fn register_derived(&mut self, key: &str, rule: &str) -> Result<(), StoreError> {
        if let Some(slot) = self.slots.get(key) {
            return Err(StoreError::NotOwner {
                key: key.to_string(),
                owner: slot.owner.clone().unwrap_or_default(),
            });
        }
        self.slots.insert(
            key.to_string(),
            Slot {
                key_type: None,
                owner: Some(rule.to_string()),
                value: None,
                revision: 0,
                derived: true,
            },
        );
        Ok(())
    }

    /// Engine-only write path for derived properties; `None` means undefined.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotAProvider`] when the output was never registered,
    /// [`StoreError::NotOwner`] when another rule owns it, and
    /// [`StoreError::TypeMismatch`] on a wrong-typed value.
    pub fn set_derived(
        &mut self,
        key: &str,
        rule: &str,
        value: Option<ContextValue>,
    ) -> Result<ChangeEvent, StoreError> {
        let Some(slot) = self.slots.get_mut(key) else {
            return Err(StoreError::NotAProvider {
                key: key.to_string(),
                provider: rule.to_string(),
            });
        };
        if !slot.derived || slot.owner.as_deref() != Some(rule) {
            return Err(StoreError::NotOwner {
                key: key.to_string(),
                owner: slot.owner.clone().unwrap_or_default(),
            });
        }
        if let Some(value) = &value {
            slot.check_type(key, value)?;
        }
        Ok(slot.apply(key, value))
    }
}
