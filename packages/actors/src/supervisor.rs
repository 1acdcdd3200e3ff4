//! Supervisor actor owning the queues, the worker pool and the reconciler.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use db::Stores;
use jobs_core::JobMetrics;
use ractor::rpc::CallResult;
use ractor::{Actor, ActorId, ActorProcessingErr, ActorRef, SupervisionEvent};
use storage::Storage;

use crate::client::QueueClient;
use crate::messages::{QueueHandles, SupervisorMessage, WorkerMessage};
use crate::offload::PayloadOffloader;
use crate::persistence::StatePersistence;
use crate::processor::{JobProcessor, WorkerSettings};
use crate::queue_actor::{
    EVENTS_QUEUE, QueueActor, QueueActorArgs, QueueSettings, WORK_QUEUE, to_delta,
};
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::scoring::Scorer;
use crate::worker_actor::{WorkerActor, WorkerArgs};

/// Runtime configuration for the job system.
#[derive(Debug, Clone)]
pub struct SystemConfig {
    pub worker_concurrency: usize,
    /// Idle workers look for work this often.
    pub poll_interval: Duration,
    /// Housekeeping cadence: lock expiry and queue snapshots.
    pub tick_interval: Duration,
    pub reconcile_interval: Duration,
    pub orphan_grace: Duration,
    /// Running jobs with no message and no update for this long are failed.
    pub stale_running_after: Duration,
    /// Jobs examined per reconciliation step.
    pub reconcile_batch_size: usize,
    pub work_queue: QueueSettings,
    pub events_queue: QueueSettings,
    /// Directory for queue snapshots; none keeps queues in memory only.
    pub state_dir: Option<PathBuf>,
    pub message_inline_limit_bytes: usize,
    /// Expiry stamped on offloaded message payloads.
    pub message_payload_ttl: Option<Duration>,
    pub worker: WorkerSettings,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: 4,
            poll_interval: Duration::from_millis(100),
            tick_interval: Duration::from_secs(1),
            reconcile_interval: Duration::from_secs(30),
            orphan_grace: Duration::from_secs(120),
            stale_running_after: Duration::from_secs(300),
            reconcile_batch_size: 100,
            work_queue: QueueSettings::new(WORK_QUEUE),
            events_queue: QueueSettings::new(EVENTS_QUEUE),
            state_dir: None,
            message_inline_limit_bytes: 64 * 1024,
            message_payload_ttl: Some(Duration::from_secs(7 * 24 * 60 * 60)),
            worker: WorkerSettings::default(),
        }
    }
}

impl SystemConfig {
    /// Payload offloader for messages sent on the system's queues.
    pub fn offloader(&self, storage: Storage) -> PayloadOffloader {
        PayloadOffloader::new(storage, self.message_inline_limit_bytes)
            .with_ttl(self.message_payload_ttl.map(to_delta))
    }
}

/// Supervisor arguments: configuration plus the collaborators it wires up.
pub struct SupervisorArgs {
    pub config: SystemConfig,
    pub stores: Stores,
    pub storage: Storage,
    pub scorer: Arc<dyn Scorer>,
    pub metrics: Arc<dyn JobMetrics>,
}

/// State for the supervisor actor.
pub struct SupervisorState {
    config: SystemConfig,
    queues: QueueHandles,
    processor: Arc<JobProcessor>,
    reconciler: Reconciler,
    /// Live workers by actor id.
    workers: HashMap<ActorId, (String, ActorRef<WorkerMessage>)>,
    /// Worker counter for unique IDs.
    worker_counter: u64,
    last_reconcile: Instant,
    shutting_down: bool,
}

impl SupervisorState {
    /// Generate a unique worker ID.
    fn next_worker_id(&mut self) -> String {
        self.worker_counter += 1;
        format!("worker-{}", self.worker_counter)
    }
}

async fn spawn_queue(
    myself: &ActorRef<SupervisorMessage>,
    settings: QueueSettings,
    state_dir: Option<&PathBuf>,
) -> Result<QueueClient, ActorProcessingErr> {
    let name = settings.name.clone();
    let args = QueueActorArgs {
        settings,
        persistence: state_dir.map(StatePersistence::new),
    };

    let (actor, _handle) = Actor::spawn_linked(None, QueueActor, args, myself.get_cell())
        .await
        .map_err(|e| ActorProcessingErr::from(format!("Failed to spawn queue {name}: {e}")))?;

    Ok(QueueClient::new(actor, name))
}

async fn spawn_worker(
    myself: &ActorRef<SupervisorMessage>,
    state: &mut SupervisorState,
) -> Result<(), ActorProcessingErr> {
    let worker_id = state.next_worker_id();
    let args = WorkerArgs {
        worker_id: worker_id.clone(),
        queues: state.queues.clone(),
        processor: state.processor.clone(),
        poll_interval: state.config.poll_interval,
    };

    let (worker, _handle) = Actor::spawn_linked(None, WorkerActor, args, myself.get_cell())
        .await
        .map_err(|e| ActorProcessingErr::from(format!("Failed to spawn {worker_id}: {e}")))?;

    state.workers.insert(worker.get_id(), (worker_id, worker));
    Ok(())
}

/// Supervisor actor that manages the job system.
pub struct Supervisor;

impl Actor for Supervisor {
    type Msg = SupervisorMessage;
    type State = SupervisorState;
    type Arguments = SupervisorArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let config = args.config;
        tracing::info!(
            workers = config.worker_concurrency,
            state_dir = ?config.state_dir,
            "Starting job system supervisor"
        );

        let queues = QueueHandles {
            work: spawn_queue(&myself, config.work_queue.clone(), config.state_dir.as_ref()).await?,
            events: spawn_queue(&myself, config.events_queue.clone(), config.state_dir.as_ref())
                .await?,
        };

        let offloader = config.offloader(args.storage);
        let processor = Arc::new(JobProcessor::new(
            args.stores.jobs.clone(),
            offloader.clone(),
            queues.events.clone(),
            args.scorer,
            args.metrics.clone(),
            config.worker.clone(),
        ));
        let reconciler = Reconciler::new(
            args.stores.jobs,
            args.stores.idempotency,
            queues.work.clone(),
            offloader,
            args.metrics,
            config.orphan_grace,
        )
        .with_stale_after(config.stale_running_after)
        .with_batch_size(config.reconcile_batch_size);

        let mut state = SupervisorState {
            config,
            queues,
            processor,
            reconciler,
            workers: HashMap::new(),
            worker_counter: 0,
            last_reconcile: Instant::now(),
            shutting_down: false,
        };
        for _ in 0..state.config.worker_concurrency.max(1) {
            spawn_worker(&myself, &mut state).await?;
        }

        // Start periodic tick
        let myself_clone = myself.clone();
        let tick_interval = state.config.tick_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick_interval);
            loop {
                interval.tick().await;
                if myself_clone.send_message(SupervisorMessage::Tick).is_err() {
                    break;
                }
            }
        });

        Ok(state)
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisorMessage::GetQueues { reply } => {
                let _ = reply.send(state.queues.clone());
            }

            SupervisorMessage::WorkerCount { reply } => {
                let _ = reply.send(state.workers.len());
            }

            SupervisorMessage::Reconcile { reply } => {
                state.last_reconcile = Instant::now();
                let _ = reply.send(state.reconciler.run_once().await.map_err(|e| e.to_string()));
            }

            SupervisorMessage::Tick => {
                if state.shutting_down {
                    return Ok(());
                }
                state.queues.work.tick();
                state.queues.events.tick();

                if state.last_reconcile.elapsed() >= state.config.reconcile_interval {
                    state.last_reconcile = Instant::now();
                    if let Err(e) = state.reconciler.run_once().await {
                        tracing::warn!("Reconciliation sweep failed: {}", e);
                    }
                }
            }

            SupervisorMessage::Shutdown => {
                tracing::info!("Shutting down job system");
                state.shutting_down = true;

                // Workers finish their current delivery before stopping.
                for (_, (worker_id, worker)) in state.workers.drain() {
                    if let Err(e) = worker
                        .stop_and_wait(None, Some(state.config.work_queue.lock_duration))
                        .await
                    {
                        tracing::warn!("Worker {} did not stop cleanly: {}", worker_id, e);
                    }
                }
                for queue in [&state.queues.work, &state.queues.events] {
                    if let Err(e) = queue
                        .actor()
                        .stop_and_wait(None, Some(Duration::from_secs(5)))
                        .await
                    {
                        tracing::warn!("Queue {} did not stop cleanly: {}", queue.name(), e);
                    }
                }
                myself.stop(None);
            }
        }

        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let (cell, reason) = match message {
            SupervisionEvent::ActorTerminated(cell, _, reason) => (cell, reason),
            SupervisionEvent::ActorFailed(cell, err) => (cell, Some(err.to_string())),
            _ => return Ok(()),
        };

        let Some((worker_id, _)) = state.workers.remove(&cell.get_id()) else {
            if !state.shutting_down {
                tracing::error!(
                    "Queue actor {} stopped unexpectedly: {:?}",
                    cell.get_id(),
                    reason
                );
            }
            return Ok(());
        };

        if state.shutting_down {
            return Ok(());
        }
        tracing::warn!("Worker {} terminated ({:?}); restarting", worker_id, reason);
        spawn_worker(&myself, state).await
    }
}

/// Errors starting or talking to the job system.
#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    #[error("failed to spawn supervisor: {0}")]
    Spawn(#[from] ractor::SpawnErr),

    #[error("supervisor call failed: {0}")]
    Call(String),
}

/// Handle to a running job system.
pub struct JobSystem {
    supervisor: ActorRef<SupervisorMessage>,
    queues: QueueHandles,
    handle: tokio::task::JoinHandle<()>,
}

impl JobSystem {
    /// Spawn the supervisor, its queues and workers.
    pub async fn start(args: SupervisorArgs) -> Result<Self, SystemError> {
        let (supervisor, handle) = Actor::spawn(None, Supervisor, args).await?;
        let queues = call(&supervisor, |reply| SupervisorMessage::GetQueues { reply }).await?;
        Ok(Self {
            supervisor,
            queues,
            handle,
        })
    }

    pub fn queues(&self) -> &QueueHandles {
        &self.queues
    }

    pub fn supervisor(&self) -> &ActorRef<SupervisorMessage> {
        &self.supervisor
    }

    pub async fn worker_count(&self) -> Result<usize, SystemError> {
        call(&self.supervisor, |reply| SupervisorMessage::WorkerCount { reply }).await
    }

    /// Run a reconciliation sweep immediately.
    pub async fn reconcile(&self) -> Result<ReconcileReport, SystemError> {
        call(&self.supervisor, |reply| SupervisorMessage::Reconcile { reply })
            .await?
            .map_err(SystemError::Call)
    }

    /// Stop workers, persist queues and wait for the supervisor to exit.
    pub async fn shutdown(self) {
        if self.supervisor.send_message(SupervisorMessage::Shutdown).is_ok() {
            let _ = self.handle.await;
        }
    }
}

async fn call<T, F>(supervisor: &ActorRef<SupervisorMessage>, build: F) -> Result<T, SystemError>
where
    T: Send + 'static,
    F: FnOnce(ractor::RpcReplyPort<T>) -> SupervisorMessage,
{
    match ractor::rpc::call(supervisor, build, Some(Duration::from_secs(30))).await {
        Ok(CallResult::Success(value)) => Ok(value),
        Ok(CallResult::Timeout) => Err(SystemError::Call("timed out".to_string())),
        Ok(CallResult::SenderError) => Err(SystemError::Call("reply dropped".to_string())),
        Err(e) => Err(SystemError::Call(e.to_string())),
    }
}
