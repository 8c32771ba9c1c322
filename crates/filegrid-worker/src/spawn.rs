//! Worker factories.

use std::sync::Arc;

use async_trait::async_trait;

use filegrid_core::WorkerId;

use crate::channel::ChannelWorker;
use crate::error::WorkerResult;
use crate::handle::WorkerHandle;
use crate::service::{FileWorker, WorkerService};

/// Creates worker execution contexts for the pool manager.
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    /// A worker sharing the scheduler's runtime.
    async fn spawn_in_process(&self, id: WorkerId) -> WorkerResult<Arc<dyn WorkerHandle>>;

    /// A worker on its own execution context.
    async fn spawn_dedicated(&self, id: WorkerId) -> WorkerResult<Arc<dyn WorkerHandle>>;
}

type ServiceFactory = Arc<dyn Fn(WorkerId) -> Box<dyn WorkerService> + Send + Sync>;

/// Runs in-process workers as tasks and dedicated workers on OS threads.
#[derive(Clone)]
pub struct ThreadSpawner {
    factory: ServiceFactory,
}

impl ThreadSpawner {
    /// Build every worker's service with `factory`.
    pub fn new(factory: impl Fn(WorkerId) -> Box<dyn WorkerService> + Send + Sync + 'static) -> Self {
        Self {
            factory: Arc::new(factory),
        }
    }
}

impl Default for ThreadSpawner {
    fn default() -> Self {
        Self::new(|_| Box::new(FileWorker::new()))
    }
}

#[async_trait]
impl WorkerSpawner for ThreadSpawner {
    async fn spawn_in_process(&self, id: WorkerId) -> WorkerResult<Arc<dyn WorkerHandle>> {
        Ok(Arc::new(ChannelWorker::spawn_in_process(id, (self.factory)(id))))
    }

    async fn spawn_dedicated(&self, id: WorkerId) -> WorkerResult<Arc<dyn WorkerHandle>> {
        let worker = ChannelWorker::spawn_dedicated(id, (self.factory)(id)).await?;
        Ok(Arc::new(worker))
    }
}
