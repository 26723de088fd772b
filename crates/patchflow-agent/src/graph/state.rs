use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::StateError;

/// A typed name for one entry of the state record.
///
/// The type parameter only steers (de)serialization at the access sites;
/// the store itself holds JSON values.
pub struct StateKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> StateKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for StateKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for StateKey<T> {}

impl<T> AsRef<str> for StateKey<T> {
    fn as_ref(&self) -> &str {
        self.name
    }
}

impl<T> fmt::Debug for StateKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateKey({})", self.name)
    }
}

impl<T> fmt::Display for StateKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// The JSON shape a key is pinned to after its first non-null write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Bool,
    Number,
    String,
    Array,
    Object,
}

impl ValueKind {
    /// `None` for null, which never pins a kind.
    pub fn of(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(Self::Bool),
            Value::Number(_) => Some(Self::Number),
            Value::String(_) => Some(Self::String),
            Value::Array(_) => Some(Self::Array),
            Value::Object(_) => Some(Self::Object),
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Bool => "bool",
            Self::Number => "number",
            Self::String => "string",
            Self::Array => "array",
            Self::Object => "object",
        };
        f.write_str(s)
    }
}

fn encode<T: Serialize>(key: &str, value: &T) -> Result<Value, StateError> {
    serde_json::to_value(value).map_err(|e| StateError::Encode {
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// Immutable view of the state as of the end of a layer.
#[derive(Debug, Clone, Default)]
pub struct StateSnapshot {
    values: Arc<BTreeMap<String, Value>>,
}

impl StateSnapshot {
    /// Read and decode a required key.
    pub fn get<T: DeserializeOwned>(&self, key: &StateKey<T>) -> Result<T, StateError> {
        let value = self
            .values
            .get(key.name())
            .ok_or_else(|| StateError::Missing(key.name().to_string()))?;
        serde_json::from_value(value.clone()).map_err(|e| StateError::Decode {
            key: key.name().to_string(),
            message: e.to_string(),
        })
    }

    /// Read an optional key; absent and null both give `None`.
    pub fn get_opt<T: DeserializeOwned>(&self, key: &StateKey<T>) -> Result<Option<T>, StateError> {
        match self.values.get(key.name()) {
            None | Some(Value::Null) => Ok(None),
            Some(_) => self.get(key).map(Some),
        }
    }

    pub fn get_raw(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The whole record as one JSON object.
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.values
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

/// A node's partial output: the keys it wants to write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateUpdate {
    values: BTreeMap<String, Value>,
}

impl StateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<T: Serialize>(mut self, key: &StateKey<T>, value: T) -> Result<Self, StateError> {
        let v = encode(key.name(), &value)?;
        self.values.insert(key.name().to_string(), v);
        Ok(self)
    }

    pub fn set_raw(mut self, name: impl Into<String>, value: Value) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// The mutable state record of one graph run.
///
/// Keys are write-once unless the writing node declared itself an updater,
/// and a key never changes its value kind once pinned.
#[derive(Debug, Clone, Default)]
pub struct StateStore {
    values: BTreeMap<String, Value>,
    kinds: BTreeMap<String, ValueKind>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a caller-provided key before the run starts.
    pub fn seed<T: Serialize>(mut self, key: &StateKey<T>, value: &T) -> Result<Self, StateError> {
        let v = encode(key.name(), value)?;
        self.seed_raw(key.name(), v);
        Ok(self)
    }

    /// Seed or replace a key. Only meant for setting up a fresh store.
    pub fn seed_raw(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        match ValueKind::of(&value) {
            Some(kind) => {
                self.kinds.insert(name.clone(), kind);
            }
            None => {
                self.kinds.remove(&name);
            }
        }
        self.values.insert(name, value);
    }

    pub fn keys(&self) -> BTreeSet<String> {
        self.values.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            values: Arc::new(self.values.clone()),
        }
    }

    /// Merge one node's update. The update is checked as a whole first, so a
    /// rejected update leaves the store untouched.
    pub fn apply(
        &mut self,
        update: StateUpdate,
        produces: &BTreeSet<String>,
        updates: &BTreeSet<String>,
    ) -> Result<(), StateError> {
        for (key, value) in &update.values {
            if !produces.contains(key) && !updates.contains(key) {
                return Err(StateError::UndeclaredWrite(key.clone()));
            }
            if self.values.contains_key(key) && !updates.contains(key) {
                return Err(StateError::AlreadySet(key.clone()));
            }
            if let (Some(expected), Some(actual)) = (self.kinds.get(key), ValueKind::of(value)) {
                if *expected != actual {
                    return Err(StateError::KindMismatch {
                        key: key.clone(),
                        expected: *expected,
                        actual,
                    });
                }
            }
        }

        for (key, value) in update.values {
            if let Some(kind) = ValueKind::of(&value) {
                self.kinds.entry(key.clone()).or_insert(kind);
            }
            self.values.insert(key, value);
        }
        Ok(())
    }
}
