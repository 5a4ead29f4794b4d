pub mod tasks;
pub mod worker;

use crate::database::ResultStore;
use crate::media::FrameSource;
use crate::ml::Classifier;
use crate::queue::Broker;
use crate::utils::Settings;

pub use tasks::{analyze_event, execute, run_once, SignificantFrameResult, TaskOutcome};
pub use worker::Worker;

/// Everything a task handler touches. Built once per worker and passed to every call.
pub struct PipelineContext {
    pub settings: Settings,
    pub store: Box<dyn ResultStore>,
    pub broker: Box<dyn Broker>,
    pub source: Box<dyn FrameSource>,
    pub classifier: Option<Box<dyn Classifier>>,
}

impl PipelineContext {
    pub fn new(
        settings: Settings,
        store: Box<dyn ResultStore>,
        broker: Box<dyn Broker>,
        source: Box<dyn FrameSource>,
    ) -> Self {
        Self {
            settings,
            store,
            broker,
            source,
            classifier: None,
        }
    }

    pub fn with_classifier(mut self, classifier: Box<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }
}
