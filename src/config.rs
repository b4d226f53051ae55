use crate::error::{PipeError, PipeResult};
use crate::pipeline::Parameters;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

/// Module configuration file picked up from the working directory
pub const MODULE_CONFIGURATION: &str = "pipeline.toml";

/// Table whose entries are substituted into the module tables
const VARIABLES_TABLE: &str = "VARIABLES";

/// Per-module parameters read from a TOML file
///
/// ```toml
/// [VARIABLES]
/// DETX = "detector.detx"
///
/// [Calibration]
/// filename = "DETX"
/// threshold = 3.5
/// ```
///
/// A string value that names a variable is replaced by the variable's value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModuleConfiguration {
    modules: BTreeMap<String, Parameters>,
}

impl ModuleConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration file
    pub fn from_file(path: impl AsRef<Path>) -> PipeResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipeError::ConfigError(format!(
                "Failed to read module configuration {:?}: {}",
                path, e
            ))
        })?;
        Self::from_toml(&content)
    }

    /// Load `pipeline.toml` from the working directory if it exists
    pub fn discover() -> PipeResult<Option<Self>> {
        let path = Path::new(MODULE_CONFIGURATION);
        if path.exists() {
            Self::from_file(path).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Parse configuration text
    pub fn from_toml(content: &str) -> PipeResult<Self> {
        let mut table: toml::Table = content.parse()?;

        let variables = match table.remove(VARIABLES_TABLE) {
            Some(toml::Value::Table(variables)) => variables,
            Some(_) => {
                return Err(PipeError::ConfigError(format!(
                    "'{}' must be a table",
                    VARIABLES_TABLE
                )))
            }
            None => toml::Table::new(),
        };

        let mut modules = BTreeMap::new();
        for (module, entries) in table {
            let toml::Value::Table(entries) = entries else {
                return Err(PipeError::ConfigError(format!(
                    "Entry '{}' must be a table of module parameters",
                    module
                )));
            };

            let mut params = Parameters::new();
            for (key, value) in entries {
                let value = match value {
                    toml::Value::String(name) => match variables.get(&name) {
                        Some(substitute) => substitute.clone(),
                        None => toml::Value::String(name),
                    },
                    other => other,
                };
                params.set(key, serde_json::to_value(value)?);
            }
            modules.insert(module, params);
        }

        Ok(Self { modules })
    }

    /// Parameters configured for a module
    pub fn get(&self, module: &str) -> Option<&Parameters> {
        self.modules.get(module)
    }

    pub fn insert(&mut self, module: impl Into<String>, params: Parameters) {
        self.modules.insert(module.into(), params);
    }

    pub fn modules(&self) -> impl Iterator<Item = &String> {
        self.modules.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Overlay the configured values of `module` onto `params`
    ///
    /// Returns the keys that replaced a value supplied at attach time.
    pub fn apply(&self, module: &str, params: &mut Parameters) -> Vec<String> {
        let mut overwritten = Vec::new();
        if let Some(configured) = self.modules.get(module) {
            for key in configured.keys() {
                if params.contains(key) {
                    overwritten.push(key.clone());
                }
                let value = configured.get(key).cloned().unwrap_or(Value::Null);
                params.set(key.clone(), value);
            }
        }
        overwritten
    }
}
