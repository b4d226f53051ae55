use super::activity::Resource;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
pub(crate) struct RecordedResources {
    pub(crate) read: Vec<Resource>,
    pub(crate) written: Vec<Resource>,
}

/// Lets a module attach external inputs and outputs to its current activity
///
/// Resources recorded while the module processes a blob belong to that
/// invocation; anything recorded during configure, prepare or finish goes to
/// the run activity. A detached handle ignores every call.
///
/// # Example
/// ```
/// use blobflow::{Blob, Flow, Module, ModuleContext, PipeResult};
/// use blobflow::provenance::ProvenanceHandle;
///
/// #[derive(Default)]
/// struct Writer {
///     provenance: ProvenanceHandle,
/// }
///
/// impl Module for Writer {
///     fn configure(&mut self, ctx: &mut ModuleContext) -> PipeResult<()> {
///         self.provenance = ctx.provenance();
///         Ok(())
///     }
///
///     fn process(&mut self, _blob: &mut Blob) -> PipeResult<Flow> {
///         self.provenance.record_output("file:///tmp/events.h5", "event dump");
///         Ok(Flow::Continue)
///     }
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct ProvenanceHandle {
    recorded: Option<Arc<Mutex<RecordedResources>>>,
}

impl ProvenanceHandle {
    /// Handle that records nothing
    pub fn detached() -> Self {
        Self::default()
    }

    pub(crate) fn attached(recorded: Arc<Mutex<RecordedResources>>) -> Self {
        Self {
            recorded: Some(recorded),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.recorded.is_some()
    }

    /// Note that the current activity read `url`
    pub fn record_input(&self, url: impl Into<String>, comment: impl Into<String>) {
        self.push(url.into(), comment.into(), false);
    }

    /// Note that the current activity wrote `url`
    pub fn record_output(&self, url: impl Into<String>, comment: impl Into<String>) {
        self.push(url.into(), comment.into(), true);
    }

    fn push(&self, url: String, comment: String, written: bool) {
        let Some(recorded) = &self.recorded else {
            return;
        };
        if let Ok(mut recorded) = recorded.lock() {
            let resource = Resource { url, comment };
            if written {
                recorded.written.push(resource);
            } else {
                recorded.read.push(resource);
            }
        }
    }
}
