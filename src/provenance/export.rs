use super::record::ProvenanceRecord;
use crate::error::PipeResult;
use crate::logger::NamedLogger;
use std::fs;
use std::path::{Path, PathBuf};

/// When the pipeline hands the finished record to its exporter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExportPolicy {
    /// Export automatically when the pipeline reaches `Drained`
    #[default]
    OnDrain,
    /// Export only through `Pipeline::export_provenance`
    Manual,
}

/// Serializes a finished provenance record somewhere
pub trait ProvenanceExporter: Send {
    fn export(&self, record: &ProvenanceRecord) -> PipeResult<()>;
}

/// Writes the record as pretty-printed JSON
pub struct JsonFileExporter {
    path: PathBuf,
    logger: NamedLogger,
}

impl JsonFileExporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let logger = NamedLogger::new("Provenance");
        if path.exists() {
            logger.warn(&format!(
                "Provenance output file ({}) exists and will be overwritten.",
                path.display()
            ));
        }
        Self { path, logger }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ProvenanceExporter for JsonFileExporter {
    fn export(&self, record: &ProvenanceRecord) -> PipeResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&self.path, record.to_json()?)?;
        self.logger.info(&format!(
            "Provenance information has been written to '{}'",
            self.path.display()
        ));
        Ok(())
    }
}
