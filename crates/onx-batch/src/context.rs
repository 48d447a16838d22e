use std::sync::Arc;

use parking_lot::Mutex;

use onx_data_runtime::ResourceManager;
use onx_ecs::{ComponentRegistry, EntityManager};
use onx_tasks::{EventBus, MainThreadQueue, ThreadPool};

use crate::BatchTaskCompletedEvent;

/// Explicit context threaded through the batch registry's public API.
///
/// Owns the collaborating subsystems; there are no process-wide singletons
/// beyond the registries populated at bootstrap.
#[derive(Clone)]
pub struct EngineContext {
    pub resource_manager: Arc<ResourceManager>,
    pub entity_manager: Arc<Mutex<dyn EntityManager>>,
    pub components: Arc<ComponentRegistry>,
    pub thread_pool: Arc<ThreadPool>,
    pub main_queue: Arc<MainThreadQueue>,
    pub events: Arc<EventBus<BatchTaskCompletedEvent>>,
}
