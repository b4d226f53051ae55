use crate::error::{PipeError, PipeResult};
use crate::logger::{LogLevel, LOGGER};
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::any::{type_name, Any};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Process-wide write sequence; every write to any blob takes the next number
static WRITE_SEQUENCE: AtomicU64 = AtomicU64::new(1);

fn next_stamp() -> u64 {
    WRITE_SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

/// What a blob entry holds
#[derive(Clone)]
enum Content {
    Json(Value),
    /// Any Rust value; clones of the blob share it
    Object {
        value: Arc<dyn Any + Send + Sync>,
        type_name: &'static str,
    },
}

impl fmt::Debug for Content {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Content::Json(value) => write!(f, "{:?}", value),
            Content::Object { type_name, .. } => write!(f, "<{}>", type_name),
        }
    }
}

#[derive(Debug, Clone)]
struct Slot {
    content: Content,
    stamp: u64,
}

/// Payload that travels through the modules of one cycle
///
/// An ordered key-value store. Entries are either JSON values or arbitrary
/// Rust objects (see [`Blob::set_object`]). Every write stamps the entry with
/// a unique, increasing number so that provenance can tell which entries a
/// module produced or overwrote without comparing values.
///
/// # Example
/// ```
/// use blobflow::Blob;
///
/// let mut blob = Blob::new();
/// blob.set_string("status", "processing");
/// blob.set_number("energy", 12.5);
/// blob.set_object("samples", vec![0.5f32; 1024]);
///
/// assert_eq!(blob.get_string("status").unwrap(), "processing");
/// assert_eq!(blob.get_object::<Vec<f32>>("samples").unwrap().len(), 1024);
/// assert_eq!(blob.keys(), vec!["status", "energy", "samples"]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Blob {
    /// Entries in insertion order
    entries: IndexMap<String, Slot>,
}

impl Blob {
    /// Create an empty blob
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&mut self, key: String, content: Content) {
        self.entries.insert(
            key,
            Slot {
                content,
                stamp: next_stamp(),
            },
        );
    }

    fn missing(&self, key: &str) -> PipeError {
        let available = self.keys().join(", ");
        LOGGER.log(
            LogLevel::Error,
            &format!(
                "No key named '{}' found in Blob. Available keys: {}",
                key, available
            ),
            "Blob",
        );
        PipeError::MissingKey {
            key: key.to_string(),
            available,
        }
    }

    /// Set a value, replacing any previous value under the same key
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.write(key.into(), Content::Json(value.into()));
    }

    /// Alias of [`Blob::set`]
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.set(key, value);
    }

    /// Get a JSON value; `None` for missing keys and object entries
    pub fn get(&self, key: &str) -> Option<&Value> {
        match &self.entries.get(key)?.content {
            Content::Json(value) => Some(value),
            Content::Object { .. } => None,
        }
    }

    /// Get a JSON value or return an error naming the available keys
    pub fn get_required(&self, key: &str) -> PipeResult<&Value> {
        match self.entries.get(key) {
            Some(Slot {
                content: Content::Json(value),
                ..
            }) => Ok(value),
            Some(_) => Err(PipeError::WrongType {
                key: key.to_string(),
                expected: "JSON value",
            }),
            None => Err(self.missing(key)),
        }
    }

    /// Mutable access to a JSON value; counts as a write
    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        let slot = self.entries.get_mut(key)?;
        match &mut slot.content {
            Content::Json(value) => {
                slot.stamp = next_stamp();
                Some(value)
            }
            Content::Object { .. } => None,
        }
    }

    /// Set a string value
    pub fn set_string(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.set(key, Value::String(value.into()));
    }

    /// Get a string value
    pub fn get_string(&self, key: &str) -> PipeResult<String> {
        match self.get_required(key)? {
            Value::String(s) => Ok(s.clone()),
            _ => Err(PipeError::WrongType {
                key: key.to_string(),
                expected: "string",
            }),
        }
    }

    /// Set a boolean value
    pub fn set_bool(&mut self, key: impl Into<String>, value: bool) {
        self.set(key, Value::Bool(value));
    }

    /// Get a boolean value
    pub fn get_bool(&self, key: &str) -> PipeResult<bool> {
        match self.get_required(key)? {
            Value::Bool(b) => Ok(*b),
            _ => Err(PipeError::WrongType {
                key: key.to_string(),
                expected: "boolean",
            }),
        }
    }

    /// Set a number value; non-finite numbers are stored as null
    pub fn set_number(&mut self, key: impl Into<String>, value: f64) {
        let value = serde_json::Number::from_f64(value)
            .map(Value::Number)
            .unwrap_or(Value::Null);
        self.set(key, value);
    }

    /// Get a number value
    pub fn get_number(&self, key: &str) -> PipeResult<f64> {
        match self.get_required(key)? {
            Value::Number(n) => n.as_f64().ok_or(PipeError::WrongType {
                key: key.to_string(),
                expected: "number",
            }),
            _ => Err(PipeError::WrongType {
                key: key.to_string(),
                expected: "number",
            }),
        }
    }

    /// Store any serializable value as JSON
    pub fn set_json<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> PipeResult<()> {
        let value = serde_json::to_value(value)?;
        self.set(key, value);
        Ok(())
    }

    /// Read a JSON value back into a concrete type
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> PipeResult<T> {
        let value = self.get_required(key)?;
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Store a Rust value as is, without converting it to JSON
    ///
    /// Handles, buffers and other non-serializable data go here. Cloning the
    /// blob shares the object instead of copying it.
    pub fn set_object<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.set_shared(key, Arc::new(value));
    }

    /// Store an already shared Rust value
    pub fn set_shared<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: Arc<T>) {
        self.write(
            key.into(),
            Content::Object {
                value,
                type_name: type_name::<T>(),
            },
        );
    }

    /// Borrow an object stored with [`Blob::set_object`]
    pub fn get_object<T: Any + Send + Sync>(&self, key: &str) -> PipeResult<&T> {
        match self.entries.get(key) {
            Some(Slot {
                content: Content::Object { value, .. },
                ..
            }) => value.downcast_ref::<T>().ok_or_else(|| PipeError::WrongType {
                key: key.to_string(),
                expected: type_name::<T>(),
            }),
            Some(_) => Err(PipeError::WrongType {
                key: key.to_string(),
                expected: type_name::<T>(),
            }),
            None => Err(self.missing(key)),
        }
    }

    /// Shared handle to an object, for keeping it beyond the current cycle
    pub fn get_shared<T: Any + Send + Sync>(&self, key: &str) -> PipeResult<Arc<T>> {
        match self.entries.get(key) {
            Some(Slot {
                content: Content::Object { value, .. },
                ..
            }) => Arc::clone(value)
                .downcast::<T>()
                .map_err(|_| PipeError::WrongType {
                    key: key.to_string(),
                    expected: type_name::<T>(),
                }),
            Some(_) => Err(PipeError::WrongType {
                key: key.to_string(),
                expected: type_name::<T>(),
            }),
            None => Err(self.missing(key)),
        }
    }

    /// Mutable access to an object the blob does not share with a clone;
    /// counts as a write
    pub fn get_object_mut<T: Any + Send + Sync>(&mut self, key: &str) -> Option<&mut T> {
        let slot = self.entries.get_mut(key)?;
        let Content::Object { value, .. } = &mut slot.content else {
            return None;
        };
        let object = Arc::get_mut(value)?.downcast_mut::<T>()?;
        slot.stamp = next_stamp();
        Some(object)
    }

    /// Whether `key` holds an object rather than a JSON value
    pub fn is_object(&self, key: &str) -> bool {
        matches!(
            self.entries.get(key),
            Some(Slot {
                content: Content::Object { .. },
                ..
            })
        )
    }

    /// Check if a key exists in the blob
    pub fn has(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Remove an entry; returns the value when it was a JSON entry
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        match self.entries.shift_remove(key)?.content {
            Content::Json(value) => Some(value),
            Content::Object { .. } => None,
        }
    }

    /// All keys in insertion order
    pub fn keys(&self) -> Vec<&str> {
        self.entries.keys().map(|k| k.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// JSON entries in insertion order; object entries are left out
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter().filter_map(|(key, slot)| match &slot.content {
            Content::Json(value) => Some((key, value)),
            Content::Object { .. } => None,
        })
    }

    /// Copy of the selected keys; missing keys are left out
    pub fn subset<S: AsRef<str>>(&self, keys: &[S]) -> Blob {
        let mut subset = Blob::new();
        for key in keys {
            let key = key.as_ref();
            if let Some(slot) = self.entries.get(key) {
                subset.entries.insert(key.to_string(), slot.clone());
            }
        }
        subset
    }

    /// Move every entry of `other` into this blob, keeping write stamps
    pub fn merge(&mut self, other: Blob) {
        for (key, slot) in other.entries {
            self.entries.insert(key, slot);
        }
    }

    /// Write stamp of an entry
    pub(crate) fn stamp(&self, key: &str) -> Option<u64> {
        self.entries.get(key).map(|slot| slot.stamp)
    }

    /// Keys paired with their write stamps, in insertion order
    pub(crate) fn stamped_keys(&self) -> Vec<(String, u64)> {
        self.entries
            .iter()
            .map(|(key, slot)| (key.clone(), slot.stamp))
            .collect()
    }

    /// Clear all data
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl From<Map<String, Value>> for Blob {
    fn from(map: Map<String, Value>) -> Self {
        let mut blob = Blob::new();
        for (key, value) in map {
            blob.set(key, value);
        }
        blob
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Blob {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut blob = Blob::new();
        for (key, value) in iter {
            blob.set(key, value);
        }
        blob
    }
}

/// Same keys in the same order, equal JSON values and identical objects
impl PartialEq for Blob {
    fn eq(&self, other: &Self) -> bool {
        self.entries.len() == other.entries.len()
            && self
                .entries
                .iter()
                .zip(other.entries.iter())
                .all(|((ka, a), (kb, b))| {
                    ka == kb
                        && match (&a.content, &b.content) {
                            (Content::Json(x), Content::Json(y)) => x == y,
                            (Content::Object { value: x, .. }, Content::Object { value: y, .. }) => {
                                Arc::ptr_eq(x, y)
                            }
                            _ => false,
                        }
                })
    }
}

impl fmt::Display for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.entries.is_empty() {
            return write!(f, "Empty blob");
        }
        let padding = self.entries.keys().map(|k| k.len()).max().unwrap_or(0) + 3;
        write!(f, "Blob ({} entries):", self.entries.len())?;
        for (key, slot) in &self.entries {
            let label = format!(" '{}'", key);
            match &slot.content {
                Content::Json(value) => {
                    write!(f, "\n{:<width$} => {}", label, value, width = padding)?
                }
                Content::Object { type_name, .. } => {
                    write!(f, "\n{:<width$} => <{}>", label, type_name, width = padding)?
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_creation() {
        let blob = Blob::new();
        assert!(blob.is_empty());
        assert!(blob.keys().is_empty());
    }

    #[test]
    fn test_string_operations() {
        let mut blob = Blob::new();
        blob.set_string("key1", "value1");

        assert!(blob.has("key1"));
        assert_eq!(blob.get_string("key1").unwrap(), "value1");
    }

    #[test]
    fn test_bool_and_number_operations() {
        let mut blob = Blob::new();
        blob.set_bool("triggered", true);
        blob.set_number("energy", 60.5);

        assert!(blob.get_bool("triggered").unwrap());
        assert_eq!(blob.get_number("energy").unwrap(), 60.5);
    }

    #[test]
    fn test_non_finite_number_is_null() {
        let mut blob = Blob::new();
        blob.set_number("nan", f64::NAN);
        assert_eq!(blob.get("nan"), Some(&Value::Null));
    }

    #[test]
    fn test_missing_key_lists_available_keys() {
        let mut blob = Blob::new();
        blob.set("key_a", 1);
        blob.set("key_b", 2);

        match blob.get_required("key_c") {
            Err(PipeError::MissingKey { key, available }) => {
                assert_eq!(key, "key_c");
                assert_eq!(available, "key_a, key_b");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_wrong_type() {
        let mut blob = Blob::new();
        blob.set_string("key1", "value1");

        assert!(matches!(
            blob.get_bool("key1"),
            Err(PipeError::WrongType { expected: "boolean", .. })
        ));
    }

    #[test]
    fn test_typed_json_round_trip() {
        #[derive(Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Hit {
            channel: u32,
            tot: u8,
        }

        let mut blob = Blob::new();
        blob.set_json("hit", &Hit { channel: 7, tot: 26 }).unwrap();
        let hit: Hit = blob.get_as("hit").unwrap();
        assert_eq!(hit, Hit { channel: 7, tot: 26 });
    }

    #[test]
    fn test_insertion_order_is_preserved() {
        let mut blob = Blob::new();
        blob.set("zeta", 1);
        blob.set("alpha", 2);
        blob.set("mid", 3);
        assert_eq!(blob.keys(), vec!["zeta", "alpha", "mid"]);

        blob.remove("alpha");
        assert_eq!(blob.keys(), vec!["zeta", "mid"]);
    }

    #[test]
    fn test_writes_bump_stamps() {
        let mut blob = Blob::new();
        blob.set("a", 1);
        let first = blob.stamp("a").unwrap();

        blob.set("a", 2);
        let second = blob.stamp("a").unwrap();
        assert!(second > first);

        if let Some(value) = blob.get_mut("a") {
            *value = Value::from(3);
        }
        let third = blob.stamp("a").unwrap();
        assert!(third > second);

        // reads leave the stamp alone
        let _ = blob.get("a");
        assert_eq!(blob.stamp("a"), Some(third));
    }

    #[test]
    fn test_subset_and_merge_keep_stamps() {
        let mut blob: Blob = vec![("a", 1), ("b", 2), ("c", 3)].into_iter().collect();
        let stamp_a = blob.stamp("a");

        let mut subset = blob.subset(&["a", "x"]);
        assert_eq!(subset.keys(), vec!["a"]);
        assert_eq!(subset.stamp("a"), stamp_a);

        subset.set("d", 4);
        blob.merge(subset);
        assert_eq!(blob.keys(), vec!["a", "b", "c", "d"]);
        assert_eq!(blob.stamp("a"), stamp_a);
    }

    #[test]
    fn test_objects_live_next_to_json_entries() {
        struct Handle {
            port: u16,
        }

        let mut blob = Blob::new();
        blob.set("run", 42);
        blob.set_object("handle", Handle { port: 8080 });
        blob.set_object("samples", vec![1.0f64, 2.0, 3.0]);

        assert_eq!(blob.keys(), vec!["run", "handle", "samples"]);
        assert!(blob.is_object("handle"));
        assert!(!blob.is_object("run"));
        assert_eq!(blob.get_object::<Handle>("handle").unwrap().port, 8080);
        assert_eq!(blob.get_object::<Vec<f64>>("samples").unwrap().len(), 3);

        // JSON accessors do not see objects and vice versa
        assert!(blob.get("handle").is_none());
        assert!(matches!(
            blob.get_required("handle"),
            Err(PipeError::WrongType { .. })
        ));
        assert!(matches!(
            blob.get_object::<Handle>("run"),
            Err(PipeError::WrongType { .. })
        ));
        assert!(matches!(
            blob.get_object::<String>("samples"),
            Err(PipeError::WrongType { .. })
        ));
        assert!(matches!(
            blob.get_object::<Handle>("nope"),
            Err(PipeError::MissingKey { .. })
        ));
        assert_eq!(blob.iter().count(), 1);
    }

    #[test]
    fn test_objects_are_stamped_and_shared_by_clones() {
        let mut blob = Blob::new();
        blob.set_object("buffer", vec![0u8; 16]);
        let first = blob.stamp("buffer").unwrap();

        if let Some(buffer) = blob.get_object_mut::<Vec<u8>>("buffer") {
            buffer[0] = 7;
        }
        let second = blob.stamp("buffer").unwrap();
        assert!(second > first);
        assert_eq!(blob.get_object::<Vec<u8>>("buffer").unwrap()[0], 7);

        let copy = blob.clone();
        assert_eq!(copy, blob);
        let shared = copy.get_shared::<Vec<u8>>("buffer").unwrap();
        assert_eq!(shared[0], 7);

        // shared with a clone: no in-place mutation
        assert!(blob.get_object_mut::<Vec<u8>>("buffer").is_none());
        assert_eq!(blob.stamp("buffer"), Some(second));

        let subset = blob.subset(&["buffer"]);
        assert_eq!(subset.stamp("buffer"), Some(second));
        assert!(blob.remove("buffer").is_none());
        assert!(!blob.has("buffer"));
    }

    #[test]
    fn test_display() {
        assert_eq!(Blob::new().to_string(), "Empty blob");

        let mut blob = Blob::new();
        blob.set("a", 1);
        blob.set_string("bb", "x");
        let rendered = blob.to_string();
        assert!(rendered.starts_with("Blob (2 entries):"));
        assert!(rendered.contains("\n 'a'  => 1"));
        assert!(rendered.contains("\n 'bb' => \"x\""));

        blob.set_object("h", 5u32);
        assert!(blob.to_string().contains("\n 'h'  => <u32>"));
    }
}
