//! Lazily constructed, cached job handlers.

use std::collections::HashMap;
use std::sync::Arc;

use diffbox_core::config::WorkerConfig;
use diffbox_core::error::JobError;
use diffbox_core::handler::JobHandler;
use diffbox_core::types::JobType;
use diffbox_pipeline::handlers::{ChatHandler, I2vHandler, QwenHandler};

/// Builds the handler for a job type.
pub trait HandlerFactory: Send + Sync {
    fn create(&self, job_type: JobType) -> Result<Arc<dyn JobHandler>, JobError>;
}

/// Factory for the production handlers.
pub struct DefaultHandlerFactory {
    config: WorkerConfig,
}

impl DefaultHandlerFactory {
    pub fn new(config: WorkerConfig) -> Self {
        Self { config }
    }
}

impl HandlerFactory for DefaultHandlerFactory {
    fn create(&self, job_type: JobType) -> Result<Arc<dyn JobHandler>, JobError> {
        let handler: Arc<dyn JobHandler> = match job_type {
            JobType::I2v => Arc::new(I2vHandler::new(&self.config)),
            JobType::Qwen => Arc::new(QwenHandler::new(&self.config)),
            JobType::Chat => Arc::new(ChatHandler::new(&self.config)),
        };
        Ok(handler)
    }
}

/// Maps job types to handlers, creating each on first use.
///
/// A handler that fails to construct is not cached, so the next job of
/// that type tries again.
pub struct HandlerRegistry<F = DefaultHandlerFactory> {
    factory: F,
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl<F: HandlerFactory> HandlerRegistry<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            handlers: HashMap::new(),
        }
    }

    /// The handler for `job_type`, constructing it if needed.
    pub fn resolve(&mut self, job_type: JobType) -> Result<Arc<dyn JobHandler>, JobError> {
        if let Some(handler) = self.handlers.get(&job_type) {
            return Ok(Arc::clone(handler));
        }

        tracing::info!(%job_type, "Loading handler");
        let handler = self.factory.create(job_type).map_err(|e| {
            tracing::error!(%job_type, error = %e, "Handler construction failed");
            e
        })?;
        self.handlers.insert(job_type, Arc::clone(&handler));
        Ok(handler)
    }

    pub fn is_loaded(&self, job_type: JobType) -> bool {
        self.handlers.contains_key(&job_type)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use diffbox_core::handler::JobContext;
    use diffbox_core::types::Job;

    use super::*;

    struct Echo;

    #[async_trait]
    impl JobHandler for Echo {
        async fn run(&self, job: &Job, _ctx: JobContext<'_>) -> Result<serde_json::Value, JobError> {
            Ok(serde_json::Value::String(job.id.clone()))
        }
    }

    /// Fails the first `failures` constructions, then succeeds.
    struct Flaky {
        failures: usize,
        calls: AtomicUsize,
    }

    impl HandlerFactory for Flaky {
        fn create(&self, _job_type: JobType) -> Result<Arc<dyn JobHandler>, JobError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(JobError::failed("LoadFailed", "weights missing"));
            }
            Ok(Arc::new(Echo))
        }
    }

    fn flaky(failures: usize) -> HandlerRegistry<Flaky> {
        HandlerRegistry::new(Flaky {
            failures,
            calls: AtomicUsize::new(0),
        })
    }

    #[test]
    fn handler_is_built_once_and_reused() {
        let mut registry = flaky(0);
        assert!(!registry.is_loaded(JobType::Chat));

        let first = registry.resolve(JobType::Chat).unwrap();
        let second = registry.resolve(JobType::Chat).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(registry.is_loaded(JobType::Chat));
        assert_eq!(registry.factory.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_construction_is_retried() {
        let mut registry = flaky(1);

        assert_matches!(
            registry.resolve(JobType::I2v).map(|_| ()),
            Err(JobError::Failed { kind: "LoadFailed", .. })
        );
        assert!(!registry.is_loaded(JobType::I2v));

        registry.resolve(JobType::I2v).unwrap();
        assert!(registry.is_loaded(JobType::I2v));
    }

    #[test]
    fn default_factory_covers_every_type() {
        let config = WorkerConfig::from_lookup(|_| None).unwrap();
        let mut registry = HandlerRegistry::new(DefaultHandlerFactory::new(config));
        for job_type in JobType::ALL {
            registry.resolve(job_type).unwrap();
        }
    }
}
