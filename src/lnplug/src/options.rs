//! Typed plugin options: declaration, wire coercion, validation and the
//! live option state.

use crate::error::{Cause, RpcError};
use crate::protocol::INVALID_PARAMS;
use serde::{Serialize, Serializer};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;

/// Type of an option as the host knows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionKind {
    String,
    Int,
    /// Accepts `true`/`false` and their string forms.
    Bool,
    /// Takes no value; present means set.
    Flag,
}

impl OptionKind {
    fn describe(self) -> &'static str {
        match self {
            OptionKind::String => "a string",
            OptionKind::Int => "an integer",
            OptionKind::Bool => "a boolean",
            OptionKind::Flag => "a flag",
        }
    }
}

/// A coerced option value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    Str(String),
    Int(i64),
    Bool(bool),
    Flag(bool),
    /// Every value given to a `multi` option, in order.
    Multi(Vec<OptionValue>),
}

impl OptionValue {
    pub fn kind(&self) -> Option<OptionKind> {
        match self {
            OptionValue::Str(_) => Some(OptionKind::String),
            OptionValue::Int(_) => Some(OptionKind::Int),
            OptionValue::Bool(_) => Some(OptionKind::Bool),
            OptionValue::Flag(_) => Some(OptionKind::Flag),
            OptionValue::Multi(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            OptionValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            OptionValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            OptionValue::Bool(b) | OptionValue::Flag(b) => Some(*b),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            OptionValue::Str(s) => Value::String(s.clone()),
            OptionValue::Int(n) => Value::from(*n),
            OptionValue::Bool(b) | OptionValue::Flag(b) => Value::Bool(*b),
            OptionValue::Multi(items) => Value::Array(items.iter().map(Self::to_json).collect()),
        }
    }

    /// Key/value pair in the host's `listconfigs`/`setconfig` shape.
    pub fn config_entry(&self) -> (&'static str, Value) {
        match self {
            OptionValue::Str(_) => ("value_str", self.to_json()),
            OptionValue::Int(_) => ("value_int", self.to_json()),
            OptionValue::Bool(_) => ("value_bool", self.to_json()),
            OptionValue::Flag(_) => ("set", self.to_json()),
            OptionValue::Multi(items) => match items.first() {
                Some(OptionValue::Int(_)) => ("values_int", self.to_json()),
                _ => ("values_str", self.to_json()),
            },
        }
    }
}

impl Serialize for OptionValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

/// Raised by a validator to reject a value on purpose. Any other error (or a
/// panic) returned by a validator is reported as a validator failure.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct Rejection(pub String);

impl Rejection {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub type ValidatorFn = Arc<dyn Fn(&OptionValue) -> anyhow::Result<()> + Send + Sync>;

/// Where an option's check comes from.
#[derive(Clone)]
pub enum Validator {
    /// Attached directly to the option.
    Inline(ValidatorFn),
    /// Looked up among the validators registered on the builder when the
    /// option is applied.
    Named(String),
}

impl fmt::Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Validator::Inline(_) => f.write_str("Validator::Inline(..)"),
            Validator::Named(name) => f.debug_tuple("Validator::Named").field(name).finish(),
        }
    }
}

/// One declared option, as advertised in the manifest.
#[derive(Debug, Clone)]
pub struct OptionSpec {
    /// Name as the operator writes it, e.g. `foo-int`.
    pub name: String,
    pub kind: OptionKind,
    pub description: String,
    /// Value in effect until init or `setconfig` supplies another one.
    pub default: Option<OptionValue>,
    /// Only accepted when the host allows deprecated APIs.
    pub deprecated: bool,
    /// May be changed with `setconfig` after init.
    pub dynamic: bool,
    /// Accepts several values, stored as [`OptionValue::Multi`].
    pub multi: bool,
    /// Runs on every value before it is stored.
    pub validator: Option<Validator>,
}

impl OptionSpec {
    pub fn new(name: impl Into<String>, kind: OptionKind, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            description: description.into(),
            default: None,
            deprecated: false,
            dynamic: false,
            multi: false,
            validator: None,
        }
    }

    pub fn string(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(name, OptionKind::String, description)
    }

    pub fn int(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(name, OptionKind::Int, description)
    }

    pub fn bool(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(name, OptionKind::Bool, description)
    }

    pub fn flag(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(name, OptionKind::Flag, description)
    }

    pub fn default_value(mut self, value: OptionValue) -> Self {
        self.default = Some(value);
        self
    }

    pub fn deprecated(mut self) -> Self {
        self.deprecated = true;
        self
    }

    pub fn dynamic(mut self) -> Self {
        self.dynamic = true;
        self
    }

    pub fn multi(mut self) -> Self {
        self.multi = true;
        self
    }

    pub fn validate_with<F>(mut self, check: F) -> Self
    where
        F: Fn(&OptionValue) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.validator = Some(Validator::Inline(Arc::new(check)));
        self
    }

    pub fn validated_by(mut self, validator: impl Into<String>) -> Self {
        self.validator = Some(Validator::Named(validator.into()));
        self
    }

    /// Manifest entry for `getmanifest`.
    pub fn to_manifest(&self) -> Value {
        let mut entry = Map::new();
        entry.insert("name".into(), Value::String(self.name.clone()));
        entry.insert("type".into(), json!(self.kind));
        entry.insert("description".into(), Value::String(self.description.clone()));
        if let Some(default) = &self.default {
            entry.insert("default".into(), default.to_json());
        }
        entry.insert("deprecated".into(), Value::Bool(self.deprecated));
        entry.insert("dynamic".into(), Value::Bool(self.dynamic));
        entry.insert("multi".into(), Value::Bool(self.multi));
        Value::Object(entry)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyPhase {
    Init,
    Live,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum OptionError {
    #[error("Wrong option '{name}'")]
    Unknown { name: String },
    #[error("option '{name}' expects {expected} value, got {value}")]
    WrongType {
        name: String,
        expected: &'static str,
        value: Value,
    },
    #[error("option '{name}' requires a value")]
    MissingValue { name: String },
    #[error("'{name}' is a deprecated option and deprecated APIs are disabled")]
    Deprecated { name: String },
    #[error("option '{name}' is not dynamic and cannot be changed after init")]
    NotDynamic { name: String },
    #[error("validator of option '{name}' must be a function: '{validator}' is not registered")]
    ValidatorNotCallable { name: String, validator: String },
    #[error("check of option '{name}' rejected value {value}: {message}")]
    Rejected {
        name: String,
        value: Value,
        message: String,
    },
    #[error("check of option '{name}' failed when called with value {value}: {cause}")]
    ValidatorFailed {
        name: String,
        value: Value,
        cause: Cause,
    },
}

impl OptionError {
    pub fn to_rpc_error(&self) -> RpcError {
        let err = RpcError::new(INVALID_PARAMS, self.to_string());
        match self {
            OptionError::ValidatorFailed { cause, .. } => err.with_data(cause.to_data()),
            _ => err,
        }
    }
}

struct OptionSlot {
    spec: OptionSpec,
    /// Serializes concurrent `apply` calls on this option.
    apply_lock: Mutex<()>,
    value: RwLock<Option<OptionValue>>,
}

/// Process-wide option state, keyed by option name.
pub struct OptionRegistry {
    slots: BTreeMap<String, OptionSlot>,
    validators: HashMap<String, ValidatorFn>,
    allow_deprecated: AtomicBool,
    live_updates: bool,
    strict: bool,
}

impl OptionRegistry {
    pub fn new(
        specs: Vec<OptionSpec>,
        validators: HashMap<String, ValidatorFn>,
        live_updates: bool,
        strict: bool,
    ) -> Self {
        let slots = specs
            .into_iter()
            .map(|spec| {
                let slot = OptionSlot {
                    value: RwLock::new(spec.default.clone()),
                    apply_lock: Mutex::new(()),
                    spec,
                };
                (slot.spec.name.clone(), slot)
            })
            .collect();
        Self {
            slots,
            validators,
            allow_deprecated: AtomicBool::new(false),
            live_updates,
            strict,
        }
    }

    pub fn set_allow_deprecated(&self, allow: bool) {
        self.allow_deprecated.store(allow, Ordering::SeqCst);
    }

    pub fn allow_deprecated(&self) -> bool {
        self.allow_deprecated.load(Ordering::SeqCst)
    }

    pub fn specs(&self) -> impl Iterator<Item = &OptionSpec> {
        self.slots.values().map(|slot| &slot.spec)
    }

    pub fn spec(&self, name: &str) -> Option<&OptionSpec> {
        self.slots.get(name).map(|slot| &slot.spec)
    }

    pub fn get(&self, name: &str) -> Option<OptionValue> {
        self.slots.get(name).and_then(|slot| {
            slot.value
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        })
    }

    pub fn snapshot(&self) -> BTreeMap<String, OptionValue> {
        self.slots
            .keys()
            .filter_map(|name| self.get(name).map(|value| (name.clone(), value)))
            .collect()
    }

    /// Current values in the `listconfigs` shape.
    pub fn configs_json(&self) -> Value {
        let configs: Map<String, Value> = self
            .snapshot()
            .into_iter()
            .map(|(name, value)| {
                let (key, wire) = value.config_entry();
                let mut entry = Map::new();
                entry.insert(key.to_string(), wire);
                (name, Value::Object(entry))
            })
            .collect();
        json!({ "configs": configs })
    }

    /// Coerce, check and store one value.
    pub fn apply(
        &self,
        name: &str,
        raw: Option<&Value>,
        phase: ApplyPhase,
    ) -> Result<OptionValue, OptionError> {
        let slot = self.slots.get(name).ok_or_else(|| OptionError::Unknown {
            name: name.to_string(),
        })?;
        let _serialized = slot.apply_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let value = coerce(&slot.spec, raw)?;
        self.check_deprecated(&slot.spec, &value, phase)?;
        if phase == ApplyPhase::Live && !(self.live_updates && slot.spec.dynamic) {
            return Err(OptionError::NotDynamic {
                name: name.to_string(),
            });
        }
        self.run_validator(&slot.spec, &value)?;

        *slot.value.write().unwrap_or_else(PoisonError::into_inner) = Some(value.clone());
        tracing::debug!(option = name, value = %value, "option updated");
        Ok(value)
    }

    /// Apply the values supplied with `init`.
    ///
    /// Every value is type-checked before any validator runs, and nothing is
    /// stored unless all of them pass.
    pub fn apply_init(&self, supplied: &Map<String, Value>) -> Result<(), OptionError> {
        let mut coerced = Vec::with_capacity(supplied.len());
        for (name, raw) in supplied {
            let Some(slot) = self.slots.get(name) else {
                if self.strict {
                    return Err(OptionError::Unknown { name: name.clone() });
                }
                tracing::warn!(option = %name, "ignoring value for undeclared option");
                continue;
            };
            let value = coerce(&slot.spec, Some(raw))?;
            self.check_deprecated(&slot.spec, &value, ApplyPhase::Init)?;
            coerced.push((slot, value));
        }

        for (slot, value) in &coerced {
            self.run_validator(&slot.spec, value)?;
        }

        for (slot, value) in coerced {
            *slot.value.write().unwrap_or_else(PoisonError::into_inner) = Some(value);
        }
        Ok(())
    }

    fn check_deprecated(
        &self,
        spec: &OptionSpec,
        value: &OptionValue,
        phase: ApplyPhase,
    ) -> Result<(), OptionError> {
        if !spec.deprecated || self.allow_deprecated() {
            return Ok(());
        }
        // The host echoes defaults at init; only an explicit value counts.
        if phase == ApplyPhase::Init && spec.default.as_ref() == Some(value) {
            return Ok(());
        }
        Err(OptionError::Deprecated {
            name: spec.name.clone(),
        })
    }

    fn run_validator(&self, spec: &OptionSpec, value: &OptionValue) -> Result<(), OptionError> {
        let check = match &spec.validator {
            None => return Ok(()),
            Some(Validator::Inline(check)) => Arc::clone(check),
            Some(Validator::Named(validator)) => self
                .validators
                .get(validator)
                .cloned()
                .ok_or_else(|| OptionError::ValidatorNotCallable {
                    name: spec.name.clone(),
                    validator: validator.clone(),
                })?,
        };

        match std::panic::catch_unwind(AssertUnwindSafe(|| check(value))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => match err.downcast_ref::<Rejection>() {
                Some(rejection) => Err(OptionError::Rejected {
                    name: spec.name.clone(),
                    value: value.to_json(),
                    message: rejection.0.clone(),
                }),
                None => Err(OptionError::ValidatorFailed {
                    name: spec.name.clone(),
                    value: value.to_json(),
                    cause: Cause::from_error("validator", &err),
                }),
            },
            Err(payload) => Err(OptionError::ValidatorFailed {
                name: spec.name.clone(),
                value: value.to_json(),
                cause: Cause::from_panic(payload.as_ref()),
            }),
        }
    }
}

fn coerce(spec: &OptionSpec, raw: Option<&Value>) -> Result<OptionValue, OptionError> {
    match raw {
        None | Some(Value::Null) if spec.kind == OptionKind::Flag => Ok(OptionValue::Flag(true)),
        None | Some(Value::Null) => Err(OptionError::MissingValue {
            name: spec.name.clone(),
        }),
        Some(Value::Array(items)) if spec.multi => items
            .iter()
            .map(|item| coerce_scalar(spec, item))
            .collect::<Result<Vec<_>, _>>()
            .map(OptionValue::Multi),
        Some(raw) if spec.multi => Ok(OptionValue::Multi(vec![coerce_scalar(spec, raw)?])),
        Some(raw) => coerce_scalar(spec, raw),
    }
}

fn coerce_scalar(spec: &OptionSpec, raw: &Value) -> Result<OptionValue, OptionError> {
    let wrong_type = || OptionError::WrongType {
        name: spec.name.clone(),
        expected: spec.kind.describe(),
        value: raw.clone(),
    };
    match (spec.kind, raw) {
        (OptionKind::String, Value::String(s)) => Ok(OptionValue::Str(s.clone())),
        (OptionKind::Int, Value::Number(n)) => n.as_i64().map(OptionValue::Int).ok_or_else(wrong_type),
        (OptionKind::Int, Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(OptionValue::Int)
            .map_err(|_| wrong_type()),
        (OptionKind::Bool, Value::Bool(b)) => Ok(OptionValue::Bool(*b)),
        (OptionKind::Bool, Value::String(s)) => parse_bool(s).map(OptionValue::Bool).ok_or_else(wrong_type),
        (OptionKind::Flag, Value::Bool(b)) => Ok(OptionValue::Flag(*b)),
        (OptionKind::Flag, Value::String(s)) => parse_bool(s).map(OptionValue::Flag).ok_or_else(wrong_type),
        _ => Err(wrong_type()),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}
