use crate::error::SinkError;
use crate::models::ExportResult;

/// Persistence for finished exports.
///
/// Called once per export, and only when at least one session decoded.
pub trait ExportSink {
    fn persist(&mut self, result: &ExportResult) -> Result<(), SinkError>;
}

/// Keeps every persisted result in memory.
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    pub results: Vec<ExportResult>,
}

impl MemorySink {
    pub fn session_ids(&self) -> Vec<u32> {
        self.results
            .iter()
            .flat_map(ExportResult::succeeded_session_ids)
            .collect()
    }
}

impl ExportSink for MemorySink {
    fn persist(&mut self, result: &ExportResult) -> Result<(), SinkError> {
        self.results.push(result.clone());
        Ok(())
    }
}
