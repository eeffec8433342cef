use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::{util, ModelState, ModelStatus, ServiceKind, Settings};

/// Static service facts plus a live view of the model lifecycle.
#[derive(Clone)]
pub struct HealthChecker {
    service: ServiceKind,
    model: Arc<dyn ModelStatus>,
    device: String,
    extras: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub service: &'static str,
    pub model_name: String,
    pub device: String,
    pub cuda_available: bool,
    pub model_state: ModelState,
    pub model_initialized: bool,
    #[serde(flatten)]
    pub extras: Map<String, Value>,
}

impl HealthChecker {
    pub fn new(settings: &Settings, model: Arc<dyn ModelStatus>) -> Self {
        Self {
            service: settings.service,
            model,
            device: util::device_label(settings.device_map),
            extras: Map::new(),
        }
    }

    pub fn with_extra(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extras.insert(key.to_string(), value.into());
        self
    }

    pub fn report(&self) -> HealthReport {
        let model_state = self.model.state();
        HealthReport {
            status: "healthy",
            service: self.service.display_name(),
            model_name: self.model.model_id().to_string(),
            device: self.device.clone(),
            cuda_available: util::cuda_available(),
            model_state,
            model_initialized: model_state == ModelState::Ready,
            extras: self.extras.clone(),
        }
    }
}
