//! Notifier adapters and the registry that builds them from rule files.
//!
//! Every adapter type declares a typed option schema and a validation step.
//! Rules name adapters by `type`; the registry checks the required options,
//! deserializes the rest into the adapter's schema and validates it once,
//! at load time. Nothing about an adapter's options is looked up at
//! dispatch time.
pub mod log;
pub mod slack;

use crate::core::NotifierAdapter;
use crate::error::ConfigError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

pub use self::log::LogNotifier;
pub use self::slack::SlackNotifier;

/// A notifier entry in a rule file: `{type: slack, webhook_url: ..., ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifierSpec {
    /// The adapter type, e.g. `slack` or `log`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Name used in reports and logs. Defaults to the adapter type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Adapter-specific options.
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

impl NotifierSpec {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.kind)
    }
}

/// Load-time half of the adapter contract.
pub trait AdapterKind: NotifierAdapter + Sized + 'static {
    /// The `type` value that selects this adapter in rule files.
    const KIND: &'static str;
    /// Options that must be present before the schema is even parsed.
    const REQUIRED_OPTIONS: &'static [&'static str] = &[];
    /// Typed option schema.
    type Options: DeserializeOwned;

    /// Checks option values that the schema alone cannot express.
    fn validate(options: &Self::Options) -> Result<(), ConfigError>;

    /// Builds the adapter from already validated options.
    fn build(name: String, options: Self::Options) -> Result<Self, ConfigError>;
}

type BuildFn =
    dyn Fn(&str, &Map<String, Value>) -> Result<Arc<dyn NotifierAdapter>, ConfigError> + Send + Sync;

/// Maps notifier types to constructors.
#[derive(Clone, Default)]
pub struct NotifierRegistry {
    builders: BTreeMap<String, Arc<BuildFn>>,
}

impl std::fmt::Debug for NotifierRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifierRegistry")
            .field("kinds", &self.builders.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl NotifierRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the adapters shipped in this crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register::<LogNotifier>();
        registry.register::<SlackNotifier>();
        registry
    }

    /// Registers a typed adapter.
    pub fn register<A: AdapterKind>(&mut self) {
        self.register_with(A::KIND, |name, options| {
            check_required_options(A::KIND, A::REQUIRED_OPTIONS, options)?;
            let typed: A::Options = serde_json::from_value(Value::Object(options.clone()))
                .map_err(|e| ConfigError::InvalidOption {
                    kind: A::KIND.to_string(),
                    reason: e.to_string(),
                })?;
            A::validate(&typed)?;
            let adapter = A::build(name.to_string(), typed)?;
            Ok(Arc::new(adapter) as Arc<dyn NotifierAdapter>)
        });
    }

    /// Registers an adapter type with a hand-written constructor. The
    /// constructor receives the notifier's display name and raw options.
    pub fn register_with<F>(&mut self, kind: &str, build: F)
    where
        F: Fn(&str, &Map<String, Value>) -> Result<Arc<dyn NotifierAdapter>, ConfigError>
            + Send
            + Sync
            + 'static,
    {
        self.builders.insert(kind.to_string(), Arc::new(build));
    }

    /// Validates a notifier entry and builds the adapter.
    pub fn build(&self, spec: &NotifierSpec) -> Result<Arc<dyn NotifierAdapter>, ConfigError> {
        let build = self
            .builders
            .get(&spec.kind)
            .ok_or_else(|| ConfigError::UnknownNotifier {
                kind: spec.kind.clone(),
            })?;
        build(spec.display_name(), &spec.options)
    }
}

fn check_required_options(
    kind: &str,
    required: &[&str],
    options: &Map<String, Value>,
) -> Result<(), ConfigError> {
    for option in required {
        match options.get(*option) {
            None | Some(Value::Null) => {
                return Err(ConfigError::MissingOption {
                    kind: kind.to_string(),
                    option: option.to_string(),
                })
            }
            Some(_) => {}
        }
    }
    Ok(())
}
