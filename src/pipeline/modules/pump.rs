use crate::error::PipeResult;
use crate::pipeline::{Blob, Flow, Module, ModuleContext};
use serde_json::Value;

/// Pump that counts cycles and stops the pipeline after `max_count` blobs
///
/// # Parameters
/// - `max_count` (integer, required) - number of blobs to pump
/// - `key` (string, default `"count"`) - blob key for the running count
///
/// # Blob Outputs
/// - `<key>` (integer) - 1 in the first cycle, `max_count` in the last one
///
/// # Example
/// ```
/// use blobflow::pipeline::modules::CountingPump;
/// use blobflow::{Attachment, Pipeline};
///
/// let mut pipeline = Pipeline::builder("count").without_config_file().build().unwrap();
/// pipeline
///     .attach(Attachment::module(CountingPump::new()).with("max_count", 5))
///     .unwrap();
///
/// let report = pipeline.drain(None).unwrap();
/// assert_eq!(report.cycles, 5);
/// ```
#[derive(Debug, Default)]
pub struct CountingPump {
    max_count: u64,
    key: String,
    count: u64,
}

impl CountingPump {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blobs pumped so far
    pub fn count(&self) -> u64 {
        self.count
    }
}

impl Module for CountingPump {
    fn configure(&mut self, ctx: &mut ModuleContext) -> PipeResult<()> {
        self.max_count = ctx.require("max_count")?;
        self.key = ctx.get_or("key", "count".to_string())?;
        self.count = 0;
        Ok(())
    }

    fn process(&mut self, blob: &mut Blob) -> PipeResult<Flow> {
        if self.count >= self.max_count {
            return Ok(Flow::Stop);
        }
        self.count += 1;
        blob.set(self.key.clone(), self.count);
        Ok(Flow::Continue)
    }

    fn finish(&mut self) -> PipeResult<Option<Value>> {
        Ok(Some(Value::from(self.count)))
    }
}
