use crate::error::PipeResult;
use crate::logger::NamedLogger;
use crate::pipeline::{Blob, Flow, Module, ModuleContext};
use serde_json::Value;

/// Logs the blob of every cycle
///
/// # Parameters
/// - `keys` (list of strings, optional) - only log these keys
#[derive(Debug, Default)]
pub struct BlobPrinter {
    keys: Option<Vec<String>>,
    logger: Option<NamedLogger>,
    printed: u64,
}

impl BlobPrinter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Module for BlobPrinter {
    fn configure(&mut self, ctx: &mut ModuleContext) -> PipeResult<()> {
        self.keys = ctx.get("keys")?;
        self.logger = Some(ctx.logger().clone());
        Ok(())
    }

    fn process(&mut self, blob: &mut Blob) -> PipeResult<Flow> {
        let rendered = match &self.keys {
            Some(keys) => blob.subset(keys).to_string(),
            None => blob.to_string(),
        };
        if let Some(logger) = &self.logger {
            logger.info(&rendered);
        }
        self.printed += 1;
        Ok(Flow::Continue)
    }

    fn finish(&mut self) -> PipeResult<Option<Value>> {
        Ok(Some(Value::from(self.printed)))
    }
}
