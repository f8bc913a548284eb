use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;

use reporter_infra::delivery::{DeliveryQueue, InMemoryDeliveryQueue, QueueError};
#[cfg(feature = "redis")]
use reporter_infra::delivery::RedisStreamsDeliveryQueue;
use reporter_infra::job_store::{InMemoryJobStore, JobStore, JobStoreError, PostgresJobStore};
use reporter_infra::jobs::{
    CoordinatorError, DeliveryWorker, DeliveryWorkerConfig, JobCoordinator, JobResult, WorkerHandle,
};

use crate::config::ApiConfig;

/// Coordinator over whichever backends the configuration selected.
pub type DynCoordinator = JobCoordinator<Arc<dyn JobStore>, Arc<dyn DeliveryQueue>>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("job store: {0}")]
    Store(#[from] JobStoreError),

    #[error("delivery queue: {0}")]
    Queue(#[from] QueueError),

    #[error("REDIS_URL is set but the redis feature is not enabled")]
    RedisDisabled,

    #[error("failed to start embedded worker: {0}")]
    Worker(#[from] io::Error),
}

/// Shared state handed to every handler.
pub struct AppServices {
    coordinator: Arc<DynCoordinator>,
    worker: Mutex<Option<WorkerHandle>>,
}

impl std::fmt::Debug for AppServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppServices")
            .field("coordinator_config", self.coordinator.config())
            .finish_non_exhaustive()
    }
}

impl AppServices {
    pub fn new(coordinator: Arc<DynCoordinator>) -> Self {
        Self {
            coordinator,
            worker: Mutex::new(None),
        }
    }

    /// In-memory store and queue (dev/test).
    pub fn in_memory(config: &ApiConfig) -> Self {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let queue: Arc<dyn DeliveryQueue> = Arc::new(InMemoryDeliveryQueue::new(config.queue_config()));
        Self::new(Arc::new(JobCoordinator::new(
            store,
            queue,
            config.coordinator_config(),
        )))
    }

    pub fn coordinator(&self) -> &Arc<DynCoordinator> {
        &self.coordinator
    }

    /// Run a blocking coordinator call off the async executor.
    pub async fn call<T, F>(&self, f: F) -> Result<T, CoordinatorError>
    where
        T: Send + 'static,
        F: FnOnce(&DynCoordinator) -> Result<T, CoordinatorError> + Send + 'static,
    {
        let coordinator = self.coordinator.clone();
        tokio::task::spawn_blocking(move || f(&coordinator))
            .await
            .map_err(|e| CoordinatorError::Storage(format!("blocking task failed: {e}")))?
    }

    /// Start a worker that marks every delivered job succeeded.
    fn start_embedded_worker(&self) -> Result<(), ServiceError> {
        let handle = DeliveryWorker::new(self.coordinator.clone(), |_job| JobResult::Success)
            .spawn(DeliveryWorkerConfig::default().with_name("embedded-worker"))?;
        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        tracing::warn!("embedded pass-through worker enabled; jobs complete without processing");
        Ok(())
    }
}

/// Select backends from configuration: Postgres when `DATABASE_URL` is set,
/// Redis Streams when `REDIS_URL` is set, in-memory otherwise.
pub async fn build_services(config: &ApiConfig) -> Result<AppServices, ServiceError> {
    let store: Arc<dyn JobStore> = match config.postgres_config() {
        Some(pg) => {
            let store = PostgresJobStore::connect(&pg).await?;
            store.ensure_schema().await?;
            tracing::info!("using postgres job store");
            Arc::new(store)
        }
        None => {
            tracing::info!("using in-memory job store");
            Arc::new(InMemoryJobStore::new())
        }
    };

    let queue: Arc<dyn DeliveryQueue> = match config.redis_config() {
        #[cfg(feature = "redis")]
        Some(redis) => {
            let queue_config = config.queue_config();
            let queue = tokio::task::spawn_blocking(move || {
                RedisStreamsDeliveryQueue::connect(redis, queue_config)
            })
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))??;
            tracing::info!("using redis streams delivery queue");
            Arc::new(queue)
        }
        #[cfg(not(feature = "redis"))]
        Some(_) => return Err(ServiceError::RedisDisabled),
        None => {
            tracing::info!("using in-memory delivery queue");
            Arc::new(InMemoryDeliveryQueue::new(config.queue_config()))
        }
    };

    let services = AppServices::new(Arc::new(JobCoordinator::new(
        store,
        queue,
        config.coordinator_config(),
    )));

    if config.embedded_worker {
        services.start_embedded_worker()?;
    }

    Ok(services)
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use reporter_core::JobStatus;

    use super::*;

    #[tokio::test]
    async fn in_memory_services_round_trip_through_blocking_pool() {
        let services = AppServices::in_memory(&ApiConfig::default());

        let id = services
            .call(|c| c.submit("gs://bucket/a.csv"))
            .await
            .unwrap();
        let job = services.call(move |c| c.get_status(id)).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
    }

    #[test]
    fn embedded_worker_handle_survives_a_poisoned_slot() {
        let services = Arc::new(AppServices::in_memory(&ApiConfig::default()));
        let poisoner = services.clone();
        let crashed: std::thread::Result<()> = std::thread::spawn(move || {
            let _slot = poisoner.worker.lock().unwrap();
            panic!("crashed while holding the worker slot");
        })
        .join();
        assert!(crashed.is_err());

        services.start_embedded_worker().unwrap();

        let handle = services
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .expect("worker handle should be kept");
        handle.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn embedded_worker_completes_submitted_jobs() {
        let config = ApiConfig {
            embedded_worker: true,
            ..ApiConfig::default()
        };
        let services = build_services(&config).await.unwrap();
        let id = services
            .call(|c| c.submit("gs://bucket/a.csv"))
            .await
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let status = services.call(move |c| c.get_status(id)).await.unwrap().status;
            if status == JobStatus::Succeeded || Instant::now() > deadline {
                assert_eq!(status, JobStatus::Succeeded);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
