use std::sync::Arc;

use sidecar_core::facade::ControlPlaneFacade;
use sidecar_core::health::HealthRegistry;

#[derive(Clone)]
pub struct AppState {
    pub facade: Arc<ControlPlaneFacade>,
    pub health: HealthRegistry,
}
