use crate::error::{PipeError, PipeResult};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

type ServiceObject = Arc<dyn Any + Send + Sync>;

/// Registry of objects that modules expose to each other
///
/// The registry is a cheap handle; every clone refers to the same services,
/// so a module that keeps its handle from `configure` also sees services
/// exposed by modules configured after it.
#[derive(Clone, Default)]
pub struct Services {
    inner: Arc<RwLock<HashMap<String, ServiceObject>>>,
}

impl Services {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service under a name, replacing any previous one
    pub fn register<T: Any + Send + Sync>(&self, name: impl Into<String>, service: T) -> PipeResult<()> {
        let mut services = self.inner.write()?;
        services.insert(name.into(), Arc::new(service));
        Ok(())
    }

    /// Look up a service by name and type
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> PipeResult<Arc<T>> {
        let service = {
            let services = self.inner.read()?;
            services
                .get(name)
                .cloned()
                .ok_or_else(|| PipeError::ServiceNotFound(name.to_string()))?
        };
        service
            .downcast::<T>()
            .map_err(|_| PipeError::ServiceTypeMismatch(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner
            .read()
            .map(|services| services.contains_key(name))
            .unwrap_or(false)
    }

    /// Names of the required services that nobody provides, sorted
    pub fn missing<'a>(&self, required: impl IntoIterator<Item = &'a String>) -> Vec<String> {
        let mut missing: Vec<String> = required
            .into_iter()
            .filter(|name| !self.contains(name))
            .cloned()
            .collect();
        missing.sort();
        missing.dedup();
        missing
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .read()
            .map(|services| services.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services").field("names", &self.names()).finish()
    }
}

/// Services a module declared it needs, with the reason it gave
pub type RequiredServices = BTreeMap<String, String>;
