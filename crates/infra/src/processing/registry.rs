//! Named collection of background processors started and stopped as one unit.

use std::collections::BTreeMap;

use tracing::{error, info};

use super::background::{ManagedProcessor, ProcessorStats};
use super::engine::EngineError;

/// Named set of background processors, built once at startup and passed around
/// explicitly.
#[derive(Default)]
pub struct ProcessorRegistry {
    processors: BTreeMap<String, Box<dyn ManagedProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a processor. Names must be unique.
    pub fn register<M>(&mut self, processor: M) -> Result<(), EngineError>
    where
        M: ManagedProcessor + 'static,
    {
        let name = processor.name().to_string();
        if self.processors.contains_key(&name) {
            return Err(EngineError::DuplicateProcessor(name));
        }
        self.processors.insert(name, Box::new(processor));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.processors.keys().map(String::as_str)
    }

    /// Start every registered processor, in name order.
    ///
    /// On the first failure the processors already started are stopped again.
    pub async fn start_all(&mut self) -> Result<(), EngineError> {
        let names: Vec<String> = self.processors.keys().cloned().collect();

        for (i, name) in names.iter().enumerate() {
            let Some(processor) = self.processors.get_mut(name) else {
                continue;
            };
            if let Err(e) = processor.start() {
                error!(processor = %name, error = %e, "failed to start processor");
                for done in &names[..i] {
                    if let Some(p) = self.processors.get_mut(done) {
                        if let Err(stop_err) = p.stop().await {
                            error!(processor = %done, error = %stop_err, "failed to stop processor");
                        }
                    }
                }
                return Err(e);
            }
        }

        info!(count = names.len(), "all processors started");
        Ok(())
    }

    /// Stop every processor. All are stopped even if one fails; the first error is
    /// returned.
    pub async fn stop_all(&mut self) -> Result<(), EngineError> {
        let mut first_error = None;

        for (name, processor) in self.processors.iter_mut() {
            if let Err(e) = processor.stop().await {
                error!(processor = %name, error = %e, "failed to stop processor");
                first_error.get_or_insert(e);
            }
        }

        info!(count = self.processors.len(), "all processors stopped");
        first_error.map_or(Ok(()), Err)
    }

    pub fn stats(&self) -> Vec<ProcessorStats> {
        self.processors.values().map(|p| p.stats()).collect()
    }
}
