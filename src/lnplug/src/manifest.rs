//! The capability set reported to the host in reply to `getmanifest`.
//!
//! Declarations are collected by the [`Builder`](crate::Builder) and checked
//! here in one pass; any violation stops the plugin before it replies.

use crate::options::{OptionKind, OptionSpec};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashSet};
use thiserror::Error;

/// Names owned by the engine or by the host daemon itself.
pub const RESERVED_METHODS: &[&str] = &[
    "getmanifest",
    "init",
    "setconfig",
    "getinfo",
    "help",
    "stop",
    "plugin",
    "listconfigs",
    "check",
];

/// Topic subscribers may use to receive every notification.
pub const WILDCARD_TOPIC: &str = "*";

/// Subscriptions that are only valid alongside a declared outbound topic.
const COMPANION_TOPICS: &[(&str, &str)] = &[("log", "log")];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MethodSpec {
    pub name: String,
    pub usage: String,
    pub description: String,
    pub deprecated: bool,
}

impl MethodSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            usage: String::new(),
            description: description.into(),
            deprecated: false,
        }
    }

    pub fn usage(mut self, usage: impl Into<String>) -> Self {
        self.usage = usage.into();
        self
    }

    pub fn deprecated(mut self) -> Self {
        self.deprecated = true;
        self
    }
}

/// A hook registration with optional ordering constraints relative to other
/// plugins' handlers for the same hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HookSpec {
    pub name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub before: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub after: Vec<String>,
    /// Decision sent to the host when the handler fails or panics.
    #[serde(skip)]
    pub fallback: Value,
}

impl HookSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            before: Vec::new(),
            after: Vec::new(),
            fallback: crate::hooks::continue_decision(),
        }
    }

    /// Replace the default `{"result": "continue"}` answer given on failure.
    pub fn on_failure(mut self, decision: Value) -> Self {
        self.fallback = decision;
        self
    }

    pub fn before(mut self, plugin: impl Into<String>) -> Self {
        self.before.push(plugin.into());
        self
    }

    pub fn after(mut self, plugin: impl Into<String>) -> Self {
        self.after.push(plugin.into());
        self
    }
}

/// Feature bits the plugin asks the host to advertise, as hex strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FeatureBits {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice: Option<String>,
}

impl FeatureBits {
    fn fields(&self) -> [(&'static str, Option<&String>); 4] {
        [
            ("init", self.init.as_ref()),
            ("node", self.node.as_ref()),
            ("channel", self.channel.as_ref()),
            ("invoice", self.invoice.as_ref()),
        ]
    }
}

/// Everything the plugin author declared, before validation.
#[derive(Debug, Clone, Default)]
pub struct Declarations {
    pub options: Vec<OptionSpec>,
    pub methods: Vec<MethodSpec>,
    pub hooks: Vec<HookSpec>,
    pub topics: Vec<String>,
    pub subscriptions: Vec<String>,
    pub featurebits: Option<FeatureBits>,
    pub dynamic: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("rpc method '{method}' is declared but no handler is bound to it")]
    MissingHandler { method: String },
    #[error("a handler is bound to '{method}' which is not a declared rpc method")]
    UndeclaredHandler { method: String },
    #[error("hook '{hook}' is declared but no handler is bound to it")]
    MissingHookHandler { hook: String },
    #[error("'{name}' is reserved and cannot be declared by a plugin")]
    ReservedMethod { name: String },
    #[error("'{name}' is declared more than once")]
    Duplicate { name: String },
    #[error("option '{option}' cannot be both multi and dynamic")]
    MultiDynamic { option: String },
    #[error("option '{option}' of type {kind:?} cannot be multi")]
    MultiKind { option: String, kind: OptionKind },
    #[error("default value of option '{option}' does not match its declared type {kind:?}")]
    DefaultKind { option: String, kind: OptionKind },
    #[error("subscribing to '{topic}' requires declaring the '{companion}' notification topic")]
    MissingCompanion { topic: String, companion: String },
    #[error("featurebits.{field} is not a hex string: {value}")]
    InvalidFeatureBits { field: &'static str, value: String },
}

/// The validated, immutable manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    options: Vec<Value>,
    methods: Vec<MethodSpec>,
    hooks: Vec<HookSpec>,
    topics: BTreeSet<String>,
    subscriptions: BTreeSet<String>,
    featurebits: Option<FeatureBits>,
    dynamic: bool,
}

impl Manifest {
    /// Check the declarations against the handlers actually bound.
    pub fn build(
        decl: &Declarations,
        bound_methods: &HashSet<String>,
        bound_hooks: &HashSet<String>,
    ) -> Result<Self, ManifestError> {
        let mut names = HashSet::new();
        let mut claim = |name: &str| {
            if RESERVED_METHODS.contains(&name) {
                return Err(ManifestError::ReservedMethod {
                    name: name.to_string(),
                });
            }
            if !names.insert(name.to_string()) {
                return Err(ManifestError::Duplicate {
                    name: name.to_string(),
                });
            }
            Ok(())
        };

        for method in &decl.methods {
            claim(&method.name)?;
            if !bound_methods.contains(&method.name) {
                return Err(ManifestError::MissingHandler {
                    method: method.name.clone(),
                });
            }
        }
        for hook in &decl.hooks {
            claim(&hook.name)?;
            if !bound_hooks.contains(&hook.name) {
                return Err(ManifestError::MissingHookHandler {
                    hook: hook.name.clone(),
                });
            }
        }
        if let Some(orphan) = bound_methods
            .iter()
            .find(|name| !decl.methods.iter().any(|m| &&m.name == name))
        {
            return Err(ManifestError::UndeclaredHandler {
                method: orphan.clone(),
            });
        }

        let mut option_names = HashSet::new();
        for option in &decl.options {
            if !option_names.insert(option.name.as_str()) {
                return Err(ManifestError::Duplicate {
                    name: option.name.clone(),
                });
            }
            check_option(option)?;
        }

        let topics: BTreeSet<String> = decl.topics.iter().cloned().collect();
        let subscriptions: BTreeSet<String> = decl.subscriptions.iter().cloned().collect();
        for (topic, companion) in COMPANION_TOPICS {
            if subscriptions.contains(*topic) && !topics.contains(*companion) {
                return Err(ManifestError::MissingCompanion {
                    topic: (*topic).to_string(),
                    companion: (*companion).to_string(),
                });
            }
        }

        if let Some(bits) = &decl.featurebits {
            for (field, value) in bits.fields() {
                if let Some(value) = value {
                    if value.is_empty() || !value.chars().all(|c| c.is_ascii_hexdigit()) {
                        return Err(ManifestError::InvalidFeatureBits {
                            field,
                            value: value.clone(),
                        });
                    }
                }
            }
        }

        Ok(Self {
            options: decl.options.iter().map(OptionSpec::to_manifest).collect(),
            methods: decl.methods.clone(),
            hooks: decl.hooks.clone(),
            topics,
            subscriptions,
            featurebits: decl.featurebits.clone(),
            dynamic: decl.dynamic,
        })
    }

    pub fn method(&self, name: &str) -> Option<&MethodSpec> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn declares_topic(&self, topic: &str) -> bool {
        self.topics.contains(topic)
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions.contains(WILDCARD_TOPIC) || self.subscriptions.contains(topic)
    }

    /// The `getmanifest` reply.
    pub fn to_json(&self) -> Value {
        let mut reply = json!({
            "options": self.options,
            "rpcmethods": self.methods,
            "subscriptions": self.subscriptions,
            "hooks": self.hooks,
            "notifications": self
                .topics
                .iter()
                .map(|topic| json!({ "method": topic }))
                .collect::<Vec<_>>(),
            "dynamic": self.dynamic,
            "nonnumericids": true,
        });
        if let (Some(bits), Value::Object(fields)) = (&self.featurebits, &mut reply) {
            fields.insert("featurebits".into(), json!(bits));
        }
        reply
    }
}

fn check_option(option: &OptionSpec) -> Result<(), ManifestError> {
    if option.multi && option.dynamic {
        return Err(ManifestError::MultiDynamic {
            option: option.name.clone(),
        });
    }
    if option.multi && matches!(option.kind, OptionKind::Bool | OptionKind::Flag) {
        return Err(ManifestError::MultiKind {
            option: option.name.clone(),
            kind: option.kind,
        });
    }
    if let Some(default) = &option.default {
        let matches_kind = match default.kind() {
            Some(kind) => kind == option.kind,
            None => option.multi,
        };
        if !matches_kind {
            return Err(ManifestError::DefaultKind {
                option: option.name.clone(),
                kind: option.kind,
            });
        }
    }
    Ok(())
}
