use crate::types::FlagConfig;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Result of evaluating one flag against a context.
#[derive(Clone, Debug, PartialEq)]
pub struct FlagEvaluation {
    pub slug: String,
    pub active: bool,
    pub value: Value,
    pub default: Value,
}

/// The flag evaluation algorithm. Implementations read flag definitions; the rest of the
/// crate treats them as opaque.
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, config: &FlagConfig, context: &Map<String, Value>) -> Vec<FlagEvaluation>;
}

/// Evaluator that never activates anything.
pub struct NoopEvaluator {}

impl NoopEvaluator {
    pub fn new() -> Self {
        tracing::warn!(
            "Using the no-op flag evaluator, every flag will evaluate as inactive. This is unsafe for production use."
        );
        NoopEvaluator {}
    }
}

impl Default for NoopEvaluator {
    fn default() -> Self {
        NoopEvaluator::new()
    }
}

impl Evaluator for NoopEvaluator {
    fn evaluate(&self, _config: &FlagConfig, _context: &Map<String, Value>) -> Vec<FlagEvaluation> {
        Vec::new()
    }
}

/// Holds the installed configuration. Installing swaps the snapshot, so a reader
/// always sees a complete configuration.
pub struct Engine {
    config: RwLock<Arc<FlagConfig>>,
    evaluator: Arc<dyn Evaluator>,
}

impl Engine {
    pub fn new(evaluator: Arc<dyn Evaluator>) -> Self {
        Engine {
            config: RwLock::new(Arc::new(FlagConfig::empty())),
            evaluator,
        }
    }

    pub fn set_config(&self, config: FlagConfig) {
        *self.config.write() = Arc::new(config);
    }

    pub fn config(&self) -> Arc<FlagConfig> {
        self.config.read().clone()
    }

    pub fn evaluate(&self, context: &Map<String, Value>) -> Vec<FlagEvaluation> {
        let config = self.config();
        self.evaluator.evaluate(&config, context)
    }
}
