use super::blob::Blob;
use super::core::{DrainReport, Flow, FnModule, Module, ModuleContext, ModuleKind, StopReason};
use super::params::{ModuleOptions, Parameters};
use super::services::{RequiredServices, Services};
use crate::config::ModuleConfiguration;
use crate::error::{PipeError, PipeResult};
use crate::interrupt::{trap_ctrl_c, CancellationToken};
use crate::logger::{LogSink, NamedLogger};
use crate::provenance::{
    ActivityStatus, ExportPolicy, JsonFileExporter, ProvenanceExporter, ProvenanceRecorder,
};
use crate::state_machine::PipelineState;
use crate::statistics::{StatisticsCollector, STATS_LIMIT};
use crate::system::Timer;
use serde_json::{Map, Value};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;

/// Where the blob of each cycle comes from
#[derive(Debug, Clone, Default)]
pub enum BlobPolicy {
    /// Start every cycle with an empty blob
    #[default]
    Fresh,
    /// Start every cycle with a copy of this blob
    Template(Blob),
    /// Carry this blob from cycle to cycle
    Persistent(Blob),
}

/// A module waiting to be attached, with its parameters
pub struct Attachment {
    name: String,
    kind: ModuleKind,
    module: Box<dyn Module>,
    parameters: Parameters,
}

impl Attachment {
    /// Attach a stateful module, named after its type unless renamed
    pub fn module<M: Module + 'static>(module: M) -> Self {
        Self {
            name: short_type_name::<M>().to_string(),
            kind: ModuleKind::Stateful,
            module: Box::new(module),
            parameters: Parameters::new(),
        }
    }

    /// Attach a bare function
    pub fn function<F>(name: impl Into<String>, func: F) -> Self
    where
        F: FnMut(&mut Blob) -> PipeResult<Flow> + Send + 'static,
    {
        Self {
            name: name.into(),
            kind: ModuleKind::Function,
            module: Box::new(FnModule::new(func)),
            parameters: Parameters::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Add a construction parameter
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.set(key, value);
        self
    }

    pub fn with_parameters(mut self, parameters: Parameters) -> Self {
        for key in parameters.keys() {
            if let Some(value) = parameters.get(key) {
                self.parameters.set(key.clone(), value.clone());
            }
        }
        self
    }
}

/// Run a module hook, turning a panic into [`PipeError::Panicked`]
fn guarded<T>(hook: impl FnOnce() -> PipeResult<T>) -> PipeResult<T> {
    panic::catch_unwind(AssertUnwindSafe(hook))
        .unwrap_or_else(|payload| Err(PipeError::Panicked(panic_message(payload.as_ref()))))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Last path segment of a type name, without generics
fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

struct ModuleRecord {
    name: String,
    kind: ModuleKind,
    module: Box<dyn Module>,
    parameters: Parameters,
    options: ModuleOptions,
    configured: bool,
    stats_index: usize,
}

enum CycleOutcome {
    Completed,
    Skipped,
    Stopped(String),
    Failed(String, PipeError),
}

/// Runs attached modules cycle after cycle on a shared blob
///
/// # Example
/// ```
/// use blobflow::{Attachment, Blob, Flow, Pipeline};
///
/// let mut pipeline = Pipeline::builder("doubler")
///     .without_config_file()
///     .build()
///     .unwrap();
///
/// pipeline
///     .attach_fn("Source", |blob: &mut Blob| {
///         blob.set_number("value", 21.0);
///         Ok(Flow::Continue)
///     })
///     .unwrap();
/// pipeline
///     .attach(Attachment::function("Double", |blob: &mut Blob| {
///         let value = blob.get_number("value")?;
///         blob.set_number("value", value * 2.0);
///         Ok(Flow::Continue)
///     }))
///     .unwrap();
///
/// let report = pipeline.drain(Some(3)).unwrap();
/// assert_eq!(report.cycles, 3);
/// ```
pub struct Pipeline {
    name: String,
    timeit: bool,
    modules: Vec<ModuleRecord>,
    statistics: StatisticsCollector,
    provenance: ProvenanceRecorder,
    services: Services,
    required_services: RequiredServices,
    configuration: ModuleConfiguration,
    blob_policy: BlobPolicy,
    export_policy: ExportPolicy,
    exporter: Option<Box<dyn ProvenanceExporter>>,
    token: CancellationToken,
    trap_ctrl_c: bool,
    state: PipelineState,
    report: Option<DrainReport>,
    logger: NamedLogger,
}

impl Pipeline {
    /// Create a new pipeline builder
    pub fn builder(name: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder::new(name)
    }

    /// Pipeline with default settings
    pub fn new(name: impl Into<String>) -> PipeResult<Self> {
        PipelineBuilder::new(name).build()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    /// Module names in execution order
    pub fn module_names(&self) -> Vec<&str> {
        self.modules.iter().map(|m| m.name.as_str()).collect()
    }

    /// Token that interrupts the drain loop at the next cycle boundary
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Service registry shared with the modules
    pub fn services(&self) -> Services {
        self.services.clone()
    }

    /// Report of the finished run, also available after a failed drain
    pub fn report(&self) -> Option<&DrainReport> {
        self.report.as_ref()
    }

    /// The carried blob when running with [`BlobPolicy::Persistent`]
    pub fn persistent_blob(&self) -> Option<&Blob> {
        match &self.blob_policy {
            BlobPolicy::Persistent(blob) => Some(blob),
            _ => None,
        }
    }

    /// Attach a module; execution order is attachment order
    pub fn attach(&mut self, attachment: Attachment) -> PipeResult<()> {
        self.state.ensure_attachable()?;

        let Attachment {
            name,
            kind,
            module,
            mut parameters,
        } = attachment;

        self.logger.info(&format!("Attaching module '{}'", name));
        for key in self.configuration.apply(&name, &mut parameters) {
            self.logger.info(&format!(
                "Overwriting parameter '{}' in module '{}' from the pipeline configuration file.",
                key, name
            ));
        }

        let options = ModuleOptions::from_parameters(&name, &parameters)?;
        let stats_index = self
            .statistics
            .register_module(name.clone(), options.timeit || self.timeit);

        self.modules.push(ModuleRecord {
            name,
            kind,
            module,
            parameters,
            options,
            configured: false,
            stats_index,
        });
        Ok(())
    }

    pub fn attach_module<M: Module + 'static>(&mut self, module: M) -> PipeResult<()> {
        self.attach(Attachment::module(module))
    }

    pub fn attach_fn<F>(&mut self, name: impl Into<String>, func: F) -> PipeResult<()>
    where
        F: FnMut(&mut Blob) -> PipeResult<Flow> + Send + 'static,
    {
        self.attach(Attachment::function(name, func))
    }

    /// Configure all modules, run cycles and tear down
    ///
    /// `None` drains until a module stops the pipeline or the cancellation
    /// token fires. Errors are returned after every configured module has
    /// been finished; the partial report stays available via [`Pipeline::report`].
    pub fn drain(&mut self, cycles: Option<u64>) -> PipeResult<DrainReport> {
        if self.state.is_drained() {
            return Err(PipeError::AlreadyDrained);
        }
        self.statistics.start_run();

        let _ctrl_c = if self.trap_ctrl_c {
            match trap_ctrl_c(self.token.clone()) {
                Ok(guard) => Some(guard),
                Err(err) => return self.teardown(0, StopReason::Aborted, Some(err)),
            }
        } else {
            None
        };

        if let Err(err) = self.initialize() {
            self.logger
                .error(&format!("Pipeline initialisation failed: {}", err));
            return self.teardown(0, StopReason::Aborted, Some(err));
        }
        if let Err(err) = self.state.start() {
            return self.teardown(0, StopReason::Aborted, Some(err));
        }

        match cycles {
            Some(max) => self
                .logger
                .info(&format!("Draining {} cycles of '{}'", max, self.name)),
            None => self
                .logger
                .info(&format!("Draining '{}' until stopped", self.name)),
        }

        let (completed, reason, error) = self.run_cycles(cycles);
        self.teardown(completed, reason, error)
    }

    /// Hand the stored provenance record to the configured exporter
    pub fn export_provenance(&self) -> PipeResult<()> {
        let exporter = self
            .exporter
            .as_deref()
            .ok_or_else(|| PipeError::Provenance("No provenance exporter configured".into()))?;
        self.export_provenance_with(exporter)
    }

    /// Hand the stored provenance record to `exporter`
    pub fn export_provenance_with(&self, exporter: &dyn ProvenanceExporter) -> PipeResult<()> {
        let report = self.report.as_ref().ok_or_else(|| {
            PipeError::InvalidStateTransition(
                "Provenance can only be exported once the pipeline is drained".into(),
            )
        })?;
        let record = report
            .provenance
            .as_ref()
            .ok_or_else(|| PipeError::Provenance("Provenance recording is disabled".into()))?;
        exporter.export(record)
    }

    fn initialize(&mut self) -> PipeResult<()> {
        self.logger.info(&format!(
            "Initialising pipeline '{}' with {} modules",
            self.name,
            self.modules.len()
        ));

        let configuration: Map<String, Value> = self
            .modules
            .iter()
            .map(|m| (m.name.clone(), m.parameters.to_value()))
            .collect();
        self.provenance
            .begin_run(&self.name, Value::Object(configuration));

        for record in self.modules.iter_mut() {
            self.logger
                .debug(&format!("Configuring module '{}'", record.name));

            let mut ctx = ModuleContext::new(
                record.name.clone(),
                record.parameters.clone(),
                self.services.clone(),
            )
            .with_logger(self.logger.named(record.name.clone()))
            .with_provenance(self.provenance.handle());
            let module = &mut record.module;
            guarded(|| module.configure(&mut ctx)).map_err(|e| {
                if e.is_configuration() {
                    e
                } else {
                    PipeError::setup(&record.name, "configure", e)
                }
            })?;
            record.configured = true;

            let ignored = ctx.unused_parameters();
            if !ignored.is_empty() {
                ctx.logger().warn(&format!(
                    "The following parameters were ignored: {}",
                    ignored.join(", ")
                ));
            }
            for (service, why) in ctx.required_services() {
                self.required_services.insert(service.clone(), why.clone());
            }
        }

        let missing = self.services.missing(self.required_services.keys());
        if !missing.is_empty() {
            for service in &missing {
                let why = self
                    .required_services
                    .get(service)
                    .map(String::as_str)
                    .unwrap_or("");
                self.logger.error(&format!(
                    "Service '{}' is required but missing: {}",
                    service, why
                ));
            }
            return Err(PipeError::MissingServices(missing));
        }

        for record in self.modules.iter_mut() {
            let module = &mut record.module;
            guarded(|| module.prepare()).map_err(|e| PipeError::setup(&record.name, "prepare", e))?;
        }

        self.state.initialize()
    }

    fn run_cycles(&mut self, max: Option<u64>) -> (u64, StopReason, Option<PipeError>) {
        let mut carried = match &mut self.blob_policy {
            BlobPolicy::Persistent(blob) => Some(std::mem::take(blob)),
            _ => None,
        };

        let mut cycle: u64 = 0;
        let (reason, error) = loop {
            if max.is_some_and(|max| cycle >= max) {
                break (StopReason::CycleLimit, None);
            }
            if self.token.is_cancelled() {
                self.logger.warn(&format!(
                    "Pipeline interrupted after {} cycles",
                    cycle
                ));
                break (StopReason::Interrupted, None);
            }

            let mut blob = match &self.blob_policy {
                BlobPolicy::Fresh => Blob::new(),
                BlobPolicy::Template(template) => template.clone(),
                BlobPolicy::Persistent(_) => carried.take().unwrap_or_default(),
            };
            if self.logger.debug_enabled() {
                self.logger.debug(&format!("----- Cycle #{} -----", cycle));
            }

            self.provenance.observe_cycle_start(&blob);
            let timer = Timer::start();
            let outcome = self.run_cycle(cycle, &mut blob);
            let (wall, cpu) = timer.stop();

            if let BlobPolicy::Persistent(_) = self.blob_policy {
                carried = Some(blob);
            }

            match outcome {
                CycleOutcome::Completed | CycleOutcome::Skipped => {
                    self.statistics.record_cycle(cycle, wall, cpu);
                    cycle += 1;
                }
                CycleOutcome::Stopped(module) => {
                    self.logger.info(&format!(
                        "Module '{}' stopped the pipeline in cycle {}",
                        module, cycle
                    ));
                    break (StopReason::Stopped { module, cycle }, None);
                }
                CycleOutcome::Failed(module, err) => {
                    break (StopReason::Failed { module, cycle }, Some(err));
                }
            }
        };

        if let (BlobPolicy::Persistent(slot), Some(blob)) = (&mut self.blob_policy, carried) {
            *slot = blob;
        }
        (cycle, reason, error)
    }

    fn run_cycle(&mut self, cycle: u64, blob: &mut Blob) -> CycleOutcome {
        for record in self.modules.iter_mut() {
            if !record.options.is_due(cycle) {
                continue;
            }
            if !record.options.only_if.iter().all(|key| blob.has(key)) {
                continue;
            }

            let subset = record.options.blob_keys.as_ref().map(|keys| blob.subset(keys));
            let pending = self
                .provenance
                .begin(&record.name, cycle, subset.as_ref().unwrap_or(&*blob));

            let module = &mut record.module;
            let timer = Timer::start();
            let result = match subset {
                Some(mut subset) => {
                    let result = guarded(|| module.process(&mut subset));
                    blob.merge(subset);
                    result
                }
                None => guarded(|| module.process(blob)),
            };
            let (wall, cpu) = timer.stop();
            self.statistics
                .record_module(record.stats_index, cycle, wall, cpu);

            let status = match &result {
                Ok(Flow::Continue) => ActivityStatus::Completed,
                Ok(Flow::Skip) => ActivityStatus::Skipped,
                Ok(Flow::Stop) => ActivityStatus::Stopped,
                Err(_) => ActivityStatus::Failed,
            };
            self.provenance.complete(pending, blob, status);

            match result {
                Ok(Flow::Continue) => {}
                Ok(Flow::Skip) => {
                    self.logger.debug(&format!(
                        "Module '{}' skipped the rest of cycle {}",
                        record.name, cycle
                    ));
                    return CycleOutcome::Skipped;
                }
                Ok(Flow::Stop) => return CycleOutcome::Stopped(record.name.clone()),
                Err(err) => {
                    self.logger.error(&format!(
                        "Module '{}' failed in cycle {}: {}",
                        record.name, cycle, err
                    ));
                    let err = PipeError::ModuleExecution {
                        module: record.name.clone(),
                        cycle,
                        source: Box::new(err),
                    };
                    return CycleOutcome::Failed(record.name.clone(), err);
                }
            }
        }
        CycleOutcome::Completed
    }

    fn teardown(
        &mut self,
        cycles: u64,
        stop_reason: StopReason,
        error: Option<PipeError>,
    ) -> PipeResult<DrainReport> {
        let mut error = error;
        let mut finish_results = Blob::new();

        for record in self.modules.iter_mut().filter(|m| m.configured) {
            self.logger
                .debug(&format!("Finishing module '{}'", record.name));
            let module = &mut record.module;
            let timer = Timer::start();
            let result = guarded(|| module.finish());
            let (wall, cpu) = timer.stop();
            self.statistics.record_finish(record.stats_index, wall, cpu);
            record.configured = false;

            match result {
                Ok(Some(value)) if record.kind == ModuleKind::Stateful => {
                    finish_results.set(record.name.clone(), value);
                }
                Ok(_) => {}
                Err(err) => {
                    self.logger.error(&format!(
                        "Module '{}' failed to finish: {}",
                        record.name, err
                    ));
                    if error.is_none() {
                        error = Some(PipeError::FinishFailed {
                            module: record.name.clone(),
                            message: err.to_string(),
                        });
                    }
                }
            }
        }

        let statistics = self.statistics.finalize(cycles);

        let run_status = match (&stop_reason, &error) {
            (_, Some(_)) => ActivityStatus::Failed,
            (StopReason::Interrupted, None) => ActivityStatus::Stopped,
            _ => ActivityStatus::Completed,
        };
        let provenance = self.provenance.finish(run_status);

        if self.export_policy == ExportPolicy::OnDrain {
            if let (Some(exporter), Some(record)) = (self.exporter.as_deref(), provenance.as_ref()) {
                if let Err(err) = exporter.export(record) {
                    self.logger
                        .error(&format!("Provenance export failed: {}", err));
                    if error.is_none() {
                        error = Some(PipeError::Provenance(format!("Export failed: {}", err)));
                    }
                }
            }
        }

        self.logger.info(&format!(
            "Pipeline '{}' drained: {}",
            self.name,
            stop_reason.describe()
        ));
        self.logger.info(&statistics.to_string());
        let table = statistics.module_table(false);
        if !table.is_empty() {
            self.logger.info(&table);
        }

        self.state.drain(cycles, error.is_none())?;

        let report = DrainReport {
            pipeline_name: self.name.clone(),
            cycles,
            stop_reason,
            statistics,
            provenance,
            finish_results,
            error: error.as_ref().map(|e| e.to_string()),
        };
        self.report = Some(report.clone());

        match error {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }
}

/// Where module parameters from a file come from
enum ConfigSource {
    /// `pipeline.toml` in the working directory, when present
    Discover,
    File(PathBuf),
    Inline(ModuleConfiguration),
    Disabled,
}

/// Builder for constructing pipelines
pub struct PipelineBuilder {
    name: String,
    timeit: bool,
    stats_limit: usize,
    provenance: bool,
    export_policy: ExportPolicy,
    exporter: Option<Box<dyn ProvenanceExporter>>,
    blob_policy: BlobPolicy,
    token: Option<CancellationToken>,
    handle_ctrl_c: bool,
    config: ConfigSource,
    log_sink: Option<Arc<dyn LogSink>>,
}

impl PipelineBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timeit: false,
            stats_limit: STATS_LIMIT,
            provenance: true,
            export_policy: ExportPolicy::default(),
            exporter: None,
            blob_policy: BlobPolicy::default(),
            token: None,
            handle_ctrl_c: false,
            config: ConfigSource::Discover,
            log_sink: None,
        }
    }

    /// Log the timing table of every module at the end of a run
    pub fn timeit(mut self, timeit: bool) -> Self {
        self.timeit = timeit;
        self
    }

    /// Samples kept per statistics series (0 = unbounded)
    pub fn stats_limit(mut self, limit: usize) -> Self {
        self.stats_limit = limit;
        self
    }

    /// Enable or disable provenance recording
    pub fn provenance(mut self, enabled: bool) -> Self {
        self.provenance = enabled;
        self
    }

    pub fn export_policy(mut self, policy: ExportPolicy) -> Self {
        self.export_policy = policy;
        self
    }

    pub fn exporter<E: ProvenanceExporter + 'static>(mut self, exporter: E) -> Self {
        self.exporter = Some(Box::new(exporter));
        self
    }

    /// Export provenance as JSON to `path`
    pub fn provenance_file(self, path: impl Into<PathBuf>) -> Self {
        self.exporter(JsonFileExporter::new(path))
    }

    pub fn blob_policy(mut self, policy: BlobPolicy) -> Self {
        self.blob_policy = policy;
        self
    }

    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Send the log lines of the pipeline and its modules to `sink`
    pub fn log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    /// Trap Ctrl-C while draining: the first one interrupts at the next cycle
    /// boundary, the second one exits
    pub fn handle_ctrl_c(mut self, enabled: bool) -> Self {
        self.handle_ctrl_c = enabled;
        self
    }

    /// Read module parameters from a TOML file
    pub fn config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config = ConfigSource::File(path.into());
        self
    }

    pub fn module_configuration(mut self, configuration: ModuleConfiguration) -> Self {
        self.config = ConfigSource::Inline(configuration);
        self
    }

    /// Do not look for `pipeline.toml` in the working directory
    pub fn without_config_file(mut self) -> Self {
        self.config = ConfigSource::Disabled;
        self
    }

    /// Build the pipeline
    pub fn build(self) -> PipeResult<Pipeline> {
        let logger = match self.log_sink {
            Some(sink) => NamedLogger::with_sink("Pipeline", sink),
            None => NamedLogger::new("Pipeline"),
        };

        let configuration = match self.config {
            ConfigSource::Discover => ModuleConfiguration::discover()?,
            ConfigSource::File(path) => {
                logger.info(&format!(
                    "Reading module configuration from '{}'",
                    path.display()
                ));
                Some(ModuleConfiguration::from_file(&path)?)
            }
            ConfigSource::Inline(configuration) => Some(configuration),
            ConfigSource::Disabled => None,
        };
        let configuration = match configuration {
            Some(configuration) => {
                logger.warn(
                    "Keep in mind that the module configuration file has \
                     precedence over parameters passed to attach!",
                );
                configuration
            }
            None => ModuleConfiguration::new(),
        };

        Ok(Pipeline {
            name: self.name,
            timeit: self.timeit,
            modules: Vec::new(),
            statistics: StatisticsCollector::new(self.stats_limit),
            provenance: ProvenanceRecorder::new(self.provenance)
                .with_logger(logger.named("Provenance")),
            services: Services::new(),
            required_services: RequiredServices::new(),
            configuration,
            blob_policy: self.blob_policy,
            export_policy: self.export_policy,
            exporter: self.exporter,
            token: self.token.unwrap_or_default(),
            trap_ctrl_c: self.handle_ctrl_c,
            state: PipelineState::new(),
            report: None,
            logger,
        })
    }
}
