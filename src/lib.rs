//! Sequential module pipelines with lifecycle hooks, timing statistics and
//! provenance tracking.
//!
//! ```
//! use blobflow::pipeline::modules::CountingPump;
//! use blobflow::{Attachment, Blob, Flow, Pipeline};
//!
//! let mut pipeline = Pipeline::builder("example")
//!     .without_config_file()
//!     .build()
//!     .unwrap();
//! pipeline
//!     .attach(Attachment::module(CountingPump::new()).with("max_count", 3))
//!     .unwrap();
//! pipeline
//!     .attach_fn("Square", |blob: &mut Blob| {
//!         let count = blob.get_number("count")?;
//!         blob.set_number("square", count * count);
//!         Ok(Flow::Continue)
//!     })
//!     .unwrap();
//!
//! let report = pipeline.drain(None).unwrap();
//! assert_eq!(report.cycles, 3);
//! assert_eq!(report.provenance.unwrap().last_producer("square").unwrap().name, "Square");
//! ```

pub mod config;
pub mod error;
pub mod interrupt;
pub mod logger;
pub mod pipeline;
pub mod provenance;
pub mod state_machine;
pub mod statistics;
pub mod system;

pub use config::ModuleConfiguration;
pub use error::{PipeError, PipeResult};
pub use interrupt::CancellationToken;
pub use logger::LogSink;
pub use pipeline::{
    Attachment, Blob, BlobPolicy, DrainReport, Flow, Module, ModuleContext, Parameters, Pipeline,
    PipelineBuilder, StopReason,
};
pub use provenance::{
    ExportPolicy, JsonFileExporter, ProvenanceExporter, ProvenanceHandle, ProvenanceRecord,
};
pub use statistics::StatisticsReport;
