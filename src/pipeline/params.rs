use crate::error::{PipeError, PipeResult};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

/// Parameters interpreted by the pipeline itself rather than by the module
pub const RESERVED_PARAMETERS: [&str; 4] = ["every", "only_if", "blob_keys", "timeit"];

/// Construction parameters supplied when a module is attached
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Parameters {
    values: Map<String, Value>,
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a parameter
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    /// Builder-style [`Parameters::set`]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    /// Raw value of a parameter; JSON `null` counts as absent
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key).filter(|v| !v.is_null())
    }

    /// Typed value of a parameter
    pub fn get_as<T: DeserializeOwned>(&self, module: &str, key: &str) -> PipeResult<Option<T>> {
        match self.get(key) {
            Some(value) => serde_json::from_value(value.clone()).map(Some).map_err(|e| {
                PipeError::configuration(
                    module,
                    format!("parameter '{}' has an unexpected type: {}", key, e),
                )
            }),
            None => Ok(None),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.values.keys()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Parameters as a JSON object, for provenance records
    pub fn to_value(&self) -> Value {
        Value::Object(self.values.clone())
    }
}

impl From<Map<String, Value>> for Parameters {
    fn from(values: Map<String, Value>) -> Self {
        Self { values }
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Parameters {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Parameters::new();
        for (key, value) in iter {
            params.set(key, value);
        }
        params
    }
}

/// Scheduling options read from the reserved parameters
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleOptions {
    /// Run only every n-th cycle
    pub every: u64,
    /// Run only when all of these keys are present in the blob
    pub only_if: Vec<String>,
    /// Hand the module only these keys
    pub blob_keys: Option<Vec<String>>,
    /// Log detailed timing for this module at the end of the run
    pub timeit: bool,
}

impl Default for ModuleOptions {
    fn default() -> Self {
        Self {
            every: 1,
            only_if: Vec::new(),
            blob_keys: None,
            timeit: false,
        }
    }
}

impl ModuleOptions {
    /// Extract the reserved parameters of a module
    pub fn from_parameters(module: &str, params: &Parameters) -> PipeResult<Self> {
        let every = params.get_as::<u64>(module, "every")?.unwrap_or(1);
        if every == 0 {
            return Err(PipeError::configuration(
                module,
                "parameter 'every' must be at least 1",
            ));
        }

        let only_if = match params.get("only_if") {
            None => Vec::new(),
            Some(Value::String(key)) => vec![key.clone()],
            Some(_) => params
                .get_as::<Vec<String>>(module, "only_if")?
                .unwrap_or_default(),
        };

        Ok(Self {
            every,
            only_if,
            blob_keys: params.get_as::<Vec<String>>(module, "blob_keys")?,
            timeit: params.get_as::<bool>(module, "timeit")?.unwrap_or(false),
        })
    }

    /// Whether the module is due in the given zero-based cycle
    pub fn is_due(&self, cycle: u64) -> bool {
        (cycle + 1) % self.every == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_null_counts_as_absent() {
        let params = Parameters::new().with("a", Value::Null).with("b", 2);
        assert!(!params.contains("a"));
        assert!(params.contains("b"));
    }

    #[test]
    fn test_typed_access() {
        let params = Parameters::new().with("threshold", 3.5).with("name", "x");
        assert_eq!(params.get_as::<f64>("M", "threshold").unwrap(), Some(3.5));
        assert_eq!(params.get_as::<String>("M", "missing").unwrap(), None);
        assert!(params.get_as::<u32>("M", "name").unwrap_err().is_configuration());
    }

    #[test]
    fn test_default_options() {
        let options = ModuleOptions::from_parameters("M", &Parameters::new()).unwrap();
        assert_eq!(options, ModuleOptions::default());
        assert!(options.is_due(0));
    }

    #[test]
    fn test_reserved_options() {
        let params = Parameters::new()
            .with("every", 3)
            .with("only_if", "foo")
            .with("blob_keys", json!(["a", "b"]))
            .with("timeit", true);
        let options = ModuleOptions::from_parameters("M", &params).unwrap();

        assert_eq!(options.every, 3);
        assert_eq!(options.only_if, vec!["foo"]);
        assert_eq!(options.blob_keys, Some(vec!["a".to_string(), "b".to_string()]));
        assert!(options.timeit);

        let due: Vec<u64> = (0..9).filter(|c| options.is_due(*c)).collect();
        assert_eq!(due, vec![2, 5, 8]);
    }

    #[test]
    fn test_only_if_accepts_a_list() {
        let params = Parameters::new().with("only_if", json!(["foo", "bar"]));
        let options = ModuleOptions::from_parameters("M", &params).unwrap();
        assert_eq!(options.only_if, vec!["foo", "bar"]);
    }

    #[test]
    fn test_every_zero_is_rejected() {
        let params = Parameters::new().with("every", 0);
        assert!(ModuleOptions::from_parameters("M", &params).is_err());
    }
}
