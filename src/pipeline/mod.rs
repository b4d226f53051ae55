//! Sequential module pipeline
//!
//! Modules are attached in order and drained cycle by cycle. Each cycle the
//! pipeline hands one [`Blob`] through every module; a module can let it
//! continue, skip the rest of the cycle or stop the whole run.
//!
//! # Example
//! ```
//! use blobflow::{Attachment, Blob, Flow, Module, ModuleContext, PipeResult, Pipeline};
//!
//! // Define a custom module
//! struct Upper {
//!     key: String,
//! }
//!
//! impl Module for Upper {
//!     fn configure(&mut self, ctx: &mut ModuleContext) -> PipeResult<()> {
//!         self.key = ctx.get_or("key", "text".to_string())?;
//!         Ok(())
//!     }
//!
//!     fn process(&mut self, blob: &mut Blob) -> PipeResult<Flow> {
//!         let input = blob.get_string(&self.key)?;
//!         blob.set_string("output", input.to_uppercase());
//!         Ok(Flow::Continue)
//!     }
//! }
//!
//! let mut pipeline = Pipeline::builder("shout").without_config_file().build()?;
//! pipeline.attach_fn("Source", |blob: &mut Blob| {
//!     blob.set_string("text", "hello");
//!     Ok(Flow::Continue)
//! })?;
//! pipeline.attach(Attachment::module(Upper { key: String::new() }))?;
//!
//! let report = pipeline.drain(Some(1))?;
//! assert!(report.success());
//! # Ok::<(), blobflow::PipeError>(())
//! ```

pub mod blob;
pub mod core;
pub mod executor;
pub mod modules;
pub mod params;
pub mod services;

// Re-export main types
pub use blob::Blob;
pub use self::core::{DrainReport, Flow, FnModule, Module, ModuleContext, ModuleKind, StopReason};
pub use executor::{Attachment, BlobPolicy, Pipeline, PipelineBuilder};
pub use params::{ModuleOptions, Parameters, RESERVED_PARAMETERS};
pub use services::{RequiredServices, Services};
