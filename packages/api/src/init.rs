//! Process wiring: stores, job system and HTTP services.

use std::sync::Arc;

use actors::{
    JobSystem, PayloadOffloader, QueueHandles, Scorer, SupervisorArgs, SystemError,
};
use axum::Router;
use db::{DbError, Stores};
use jobs_core::JobMetrics;
use storage::Storage;

use crate::config::AppConfig;
use crate::producer::{JobProducer, ProducerSettings};
use crate::routes;
use crate::service::JobService;

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("database initialization failed: {0}")]
    Db(#[from] DbError),

    #[error("job system failed to start: {0}")]
    System(#[from] SystemError),
}

/// Services shared by the HTTP handlers.
pub struct AppServices {
    pub producer: JobProducer,
    pub jobs: JobService,
}

impl AppServices {
    pub fn new(
        stores: &Stores,
        offloader: PayloadOffloader,
        queues: &QueueHandles,
        metrics: Arc<dyn JobMetrics>,
        settings: ProducerSettings,
    ) -> Self {
        let storage = offloader.storage().clone();
        Self {
            producer: JobProducer::new(
                stores.jobs.clone(),
                stores.idempotency.clone(),
                queues.work.clone(),
                offloader,
                metrics.clone(),
                settings,
            ),
            jobs: JobService::new(stores.jobs.clone(), storage, queues.events.clone(), metrics),
        }
    }
}

/// A running job system plus the router serving it.
pub struct Runtime {
    pub router: Router,
    pub system: JobSystem,
}

/// Connect the job store, start queues and workers, and build the router.
pub async fn start(
    config: &AppConfig,
    storage: Storage,
    scorer: Arc<dyn Scorer>,
    metrics: Arc<dyn JobMetrics>,
) -> Result<Runtime, InitError> {
    tracing::info!("Initializing evaluation job system...");

    let stores = db::init(&config.db).await?;

    let system = JobSystem::start(SupervisorArgs {
        config: config.system.clone(),
        stores: stores.clone(),
        storage: storage.clone(),
        scorer,
        metrics: metrics.clone(),
    })
    .await?;

    let services = AppServices::new(
        &stores,
        config.system.offloader(storage),
        system.queues(),
        metrics,
        config.producer.clone(),
    );

    tracing::info!(
        workers = config.system.worker_concurrency,
        "Evaluation job system initialized"
    );
    Ok(Runtime {
        router: routes::router(Arc::new(services)),
        system,
    })
}
