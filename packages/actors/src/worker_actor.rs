//! Worker actor for executing jobs.

use std::sync::Arc;
use std::time::Duration;

use ractor::{Actor, ActorProcessingErr, ActorRef};

use crate::client::QueueClient;
use crate::messages::{Delivery, QueueHandles, WorkerMessage};
use crate::processor::{Disposition, JobProcessor};

/// State for the worker actor.
pub struct WorkerActorState {
    /// Unique worker ID.
    pub worker_id: String,
    pub queues: QueueHandles,
    pub processor: Arc<JobProcessor>,
    pub poll_interval: Duration,
}

impl WorkerActorState {
    /// Create a new worker actor state.
    pub fn new(args: WorkerArgs) -> Self {
        Self {
            worker_id: args.worker_id,
            queues: args.queues,
            processor: args.processor,
            poll_interval: args.poll_interval,
        }
    }

    /// Receive from the work lane first, then the events lane.
    async fn next_delivery(&self) -> Option<(QueueClient, Delivery)> {
        for queue in [&self.queues.work, &self.queues.events] {
            match queue.receive().await {
                Ok(Some(delivery)) => return Some((queue.clone(), delivery)),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(worker_id = %self.worker_id, queue = queue.name(), "Receive failed: {}", e);
                }
            }
        }
        None
    }
}

/// Worker actor arguments.
pub struct WorkerArgs {
    pub worker_id: String,
    pub queues: QueueHandles,
    pub processor: Arc<JobProcessor>,
    pub poll_interval: Duration,
}

/// Worker actor that processes one delivery at a time.
pub struct WorkerActor;

impl Actor for WorkerActor {
    type Msg = WorkerMessage;
    type State = WorkerActorState;
    type Arguments = WorkerArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting worker: {}", args.worker_id);

        // Start the work loop
        myself.send_message(WorkerMessage::Poll)?;

        Ok(WorkerActorState::new(args))
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            WorkerMessage::Poll => {
                match state.next_delivery().await {
                    Some((queue, delivery)) => {
                        let job_id = delivery.message.job_id.clone();
                        let disposition = state
                            .processor
                            .process(&state.worker_id, &queue, delivery)
                            .await;

                        match &disposition {
                            Disposition::Retrying { delay } => tracing::info!(
                                worker_id = %state.worker_id,
                                job_id = %job_id,
                                ?delay,
                                "Delivery abandoned for retry"
                            ),
                            other => tracing::debug!(
                                worker_id = %state.worker_id,
                                job_id = %job_id,
                                disposition = ?other,
                                "Delivery settled"
                            ),
                        }

                        // More work may be waiting.
                        myself.send_message(WorkerMessage::Poll)?;
                    }
                    None => {
                        myself.send_after(state.poll_interval, || WorkerMessage::Poll);
                    }
                }
            }
        }

        Ok(())
    }
}
