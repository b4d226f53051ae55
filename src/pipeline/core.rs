use crate::error::{PipeError, PipeResult};
use crate::logger::NamedLogger;
use crate::provenance::{ProvenanceHandle, ProvenanceRecord};
use crate::statistics::StatisticsReport;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::collections::HashSet;

use super::blob::Blob;
use super::params::{Parameters, RESERVED_PARAMETERS};
use super::services::{RequiredServices, Services};

/// What the pipeline should do after a module processed the blob
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Hand the blob to the next module
    Continue,
    /// Abandon the rest of this cycle; the next cycle starts normally
    Skip,
    /// Stop draining; finish hooks still run
    Stop,
}

/// One stage of a pipeline
///
/// `configure` runs once before the first cycle, `prepare` once the services of
/// all modules are in place, `process` once per cycle and `finish` once after
/// the last cycle, even when another module failed.
/// Resources acquired in `configure` belong in `finish`.
///
/// # Example
/// ```
/// use blobflow::{Blob, Flow, Module, ModuleContext, PipeResult};
///
/// struct Scale {
///     factor: f64,
/// }
///
/// impl Module for Scale {
///     fn configure(&mut self, ctx: &mut ModuleContext) -> PipeResult<()> {
///         self.factor = ctx.get_or("factor", 2.0)?;
///         Ok(())
///     }
///
///     fn process(&mut self, blob: &mut Blob) -> PipeResult<Flow> {
///         let energy = blob.get_number("energy")?;
///         blob.set_number("energy", energy * self.factor);
///         Ok(Flow::Continue)
///     }
/// }
/// ```
pub trait Module: Send {
    /// Read parameters, acquire resources, expose or require services
    fn configure(&mut self, _ctx: &mut ModuleContext) -> PipeResult<()> {
        Ok(())
    }

    /// Runs after every module is configured and all services are available
    fn prepare(&mut self) -> PipeResult<()> {
        Ok(())
    }

    /// Work on the blob of the current cycle
    ///
    /// The blob may be mutated in place or replaced by assigning a new one
    /// through the reference.
    fn process(&mut self, blob: &mut Blob) -> PipeResult<Flow>;

    /// Release resources; a returned value lands in the run's finish blob
    fn finish(&mut self) -> PipeResult<Option<Value>> {
        Ok(None)
    }
}

/// Whether a module carries lifecycle hooks or is a bare function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleKind {
    Stateful,
    Function,
}

/// Adapts a closure into a [`Module`] with no-op configure and finish
pub struct FnModule<F> {
    func: F,
}

impl<F> FnModule<F>
where
    F: FnMut(&mut Blob) -> PipeResult<Flow> + Send,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> Module for FnModule<F>
where
    F: FnMut(&mut Blob) -> PipeResult<Flow> + Send,
{
    fn process(&mut self, blob: &mut Blob) -> PipeResult<Flow> {
        (self.func)(blob)
    }
}

/// Everything a module can reach while it is being configured
pub struct ModuleContext {
    name: String,
    parameters: Parameters,
    accessed: HashSet<String>,
    services: Services,
    required_services: RequiredServices,
    logger: NamedLogger,
    provenance: ProvenanceHandle,
}

impl ModuleContext {
    pub fn new(name: impl Into<String>, parameters: Parameters, services: Services) -> Self {
        let name = name.into();
        Self {
            logger: NamedLogger::new(name.clone()),
            name,
            parameters,
            accessed: HashSet::new(),
            services,
            required_services: RequiredServices::new(),
            provenance: ProvenanceHandle::detached(),
        }
    }

    /// Replace the module's logger
    pub fn with_logger(mut self, logger: NamedLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_provenance(mut self, provenance: ProvenanceHandle) -> Self {
        self.provenance = provenance;
        self
    }

    /// Name the module was attached under
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Value of a parameter, `None` when it was not supplied
    pub fn get<T: DeserializeOwned>(&mut self, key: &str) -> PipeResult<Option<T>> {
        self.accessed.insert(key.to_string());
        self.parameters.get_as(&self.name, key)
    }

    /// Value of a parameter, falling back to `default`
    pub fn get_or<T: DeserializeOwned>(&mut self, key: &str, default: T) -> PipeResult<T> {
        Ok(self.get(key)?.unwrap_or(default))
    }

    /// Value of a parameter that must be supplied
    pub fn require<T: DeserializeOwned>(&mut self, key: &str) -> PipeResult<T> {
        self.get(key)?.ok_or_else(|| {
            PipeError::configuration(
                &self.name,
                format!("{} requires the parameter '{}'", self.name, key),
            )
        })
    }

    /// All supplied parameters, without marking any as used
    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    /// A logger named after the module; clone it to keep it around
    pub fn logger(&self) -> &NamedLogger {
        &self.logger
    }

    /// Handle for recording files the module reads or writes; keep a clone
    pub fn provenance(&self) -> ProvenanceHandle {
        self.provenance.clone()
    }

    /// Shared service registry handle
    pub fn services(&self) -> Services {
        self.services.clone()
    }

    /// Expose an object to the other modules of the pipeline
    pub fn expose<T: Any + Send + Sync>(&self, name: impl Into<String>, service: T) -> PipeResult<()> {
        self.services.register(name, service)
    }

    /// Declare that this module needs a service somebody else exposes
    pub fn require_service(&mut self, name: impl Into<String>, why: impl Into<String>) {
        self.required_services.insert(name.into(), why.into());
    }

    pub(crate) fn required_services(&self) -> &RequiredServices {
        &self.required_services
    }

    /// Supplied parameters that the module never looked at, sorted
    pub fn unused_parameters(&self) -> Vec<String> {
        let mut unused: Vec<String> = self
            .parameters
            .keys()
            .filter(|key| !self.accessed.contains(key.as_str()))
            .filter(|key| !RESERVED_PARAMETERS.contains(&key.as_str()))
            .cloned()
            .collect();
        unused.sort();
        unused
    }
}

/// Why the drain loop ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StopReason {
    /// The requested number of cycles was reached
    CycleLimit,
    /// A module returned [`Flow::Stop`]
    Stopped { module: String, cycle: u64 },
    /// The cancellation token was triggered
    Interrupted,
    /// A module's process step returned an error
    Failed { module: String, cycle: u64 },
    /// Initialization failed before the first cycle
    Aborted,
}

impl StopReason {
    pub fn describe(&self) -> String {
        match self {
            StopReason::CycleLimit => "cycle limit reached".to_string(),
            StopReason::Stopped { module, cycle } => {
                format!("stopped by '{}' in cycle {}", module, cycle)
            }
            StopReason::Interrupted => "interrupted".to_string(),
            StopReason::Failed { module, cycle } => {
                format!("'{}' failed in cycle {}", module, cycle)
            }
            StopReason::Aborted => "initialization aborted".to_string(),
        }
    }
}

/// Outcome of a complete drain
#[derive(Debug, Clone)]
pub struct DrainReport {
    /// Pipeline name
    pub pipeline_name: String,

    /// Completed cycles (skipped cycles included, the stopping cycle excluded)
    pub cycles: u64,

    /// Why draining ended
    pub stop_reason: StopReason,

    /// Aggregated timing statistics
    pub statistics: StatisticsReport,

    /// Lineage of the run, `None` when provenance is disabled
    pub provenance: Option<ProvenanceRecord>,

    /// Values returned by finish hooks, keyed by module name
    pub finish_results: Blob,

    /// Error message if the run failed
    pub error: Option<String>,
}

impl DrainReport {
    pub fn success(&self) -> bool {
        self.error.is_none()
    }

    pub fn was_interrupted(&self) -> bool {
        self.stop_reason == StopReason::Interrupted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fn_module_adapts_closure() {
        let mut calls = 0;
        {
            let mut module = FnModule::new(|blob: &mut Blob| {
                calls += 1;
                blob.set("seen", true);
                Ok(Flow::Continue)
            });
            let mut blob = Blob::new();
            assert_eq!(module.process(&mut blob).unwrap(), Flow::Continue);
            assert!(blob.get_bool("seen").unwrap());
            assert_eq!(module.finish().unwrap(), None);
        }
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_context_typed_parameters() {
        let params = Parameters::new().with("max_count", 5).with("label", "hits");
        let mut ctx = ModuleContext::new("Counter", params, Services::new());

        assert_eq!(ctx.get::<u64>("max_count").unwrap(), Some(5));
        assert_eq!(ctx.get_or("threshold", 1.5).unwrap(), 1.5);
        assert_eq!(ctx.require::<String>("label").unwrap(), "hits");
    }

    #[test]
    fn test_require_missing_parameter_is_configuration_error() {
        let mut ctx = ModuleContext::new("Observer", Parameters::new(), Services::new());
        let err = ctx.require::<String>("needed_key").unwrap_err();

        assert!(err.is_configuration());
        assert!(err.to_string().contains("needed_key"));
    }

    #[test]
    fn test_unused_parameters_ignore_reserved() {
        let params = Parameters::new()
            .with("a", 1)
            .with("c", 3)
            .with("b", 2)
            .with("every", 10)
            .with("only_if", "a");
        let mut ctx = ModuleContext::new("A", params, Services::new());
        let _ = ctx.get::<i64>("a").unwrap();

        assert_eq!(ctx.unused_parameters(), vec!["b", "c"]);
    }

    #[test]
    fn test_expose_and_require_services() {
        let services = Services::new();
        let mut ctx = ModuleContext::new("Provider", Parameters::new(), services.clone());
        ctx.expose("foo", 23u8).unwrap();
        ctx.require_service("bar", "because");

        assert!(services.contains("foo"));
        assert_eq!(ctx.required_services().get("bar").map(String::as_str), Some("because"));
    }

    #[test]
    fn test_stop_reason_description() {
        let reason = StopReason::Stopped {
            module: "Pump".into(),
            cycle: 5,
        };
        assert_eq!(reason.describe(), "stopped by 'Pump' in cycle 5");
        assert_eq!(StopReason::Interrupted.describe(), "interrupted");
    }
}
