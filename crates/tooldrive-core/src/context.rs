//! Shared runtime services handed to the orchestrator, tools and front-ends.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::Config;
use crate::confirm::ConfirmationChannel;
use crate::output::OutputLimiter;
use crate::status::StatusReporter;

/// Receives the paths of files read by tools (used to seed context caches).
#[async_trait]
pub trait FileAccessObserver: Send + Sync {
    async fn record_file_access(&self, path: &Path);
}

#[derive(Clone)]
pub struct RuntimeContext {
    pub config: Arc<Config>,
    pub status: Arc<StatusReporter>,
    pub confirmations: Arc<ConfirmationChannel>,
    pub limiter: OutputLimiter,
}

impl RuntimeContext {
    pub fn new(config: Config) -> Self {
        let limiter = OutputLimiter::new(config.max_tool_output_chars());
        Self {
            config: Arc::new(config),
            status: Arc::new(StatusReporter::new()),
            confirmations: Arc::new(ConfirmationChannel::new()),
            limiter,
        }
    }
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self::new(Config::default())
    }
}
