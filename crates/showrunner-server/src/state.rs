//! Shared application state injected into handlers

use std::sync::Arc;

use showrunner_tasks::{Broker, HealthChecker, LifecycleManager, TaskRouter, TaskStore};

use crate::config::Settings;

/// Explicit dependencies for the API handlers; constructed once at startup
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TaskStore>,
    pub broker: Arc<dyn Broker>,
    pub router: Arc<TaskRouter>,
    pub lifecycle: Arc<LifecycleManager>,
    pub health: Arc<HealthChecker>,
    pub settings: Arc<Settings>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn TaskStore>,
        broker: Arc<dyn Broker>,
        router: Arc<TaskRouter>,
        settings: Settings,
    ) -> Self {
        let lifecycle = Arc::new(LifecycleManager::new(
            store.clone(),
            broker.clone(),
            router.clone(),
        ));
        let health = Arc::new(HealthChecker::new(store.clone(), router.clone()));
        Self {
            store,
            broker,
            router,
            lifecycle,
            health,
            settings: Arc::new(settings),
        }
    }
}
