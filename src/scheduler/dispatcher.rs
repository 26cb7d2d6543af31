use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::scheduler::lifecycle::LifecycleController;
use crate::scheduler::router::{Placement, TopicRouter};

/// Moves queued jobs to `Waiting` and offers them to the router.
///
/// Offering never waits for a worker: a job without an idle slot is parked in
/// its topic backlog, so one topic never holds up another.
pub struct Dispatcher {
    queue: mpsc::Receiver<u64>,
    lifecycle: Arc<LifecycleController>,
    router: Arc<TopicRouter>,
}

impl Dispatcher {
    pub fn new(
        queue: mpsc::Receiver<u64>,
        lifecycle: Arc<LifecycleController>,
        router: Arc<TopicRouter>,
    ) -> Self {
        Self {
            queue,
            lifecycle,
            router,
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!("Dispatcher started");
        loop {
            let id = tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Dispatcher shutting down");
                    break;
                }
                next = self.queue.recv() => match next {
                    Some(id) => id,
                    None => {
                        tracing::info!("Job queue closed, dispatcher exiting");
                        break;
                    }
                },
            };
            self.dispatch(id).await;
        }
    }

    async fn dispatch(&self, id: u64) {
        let job = match self.lifecycle.mark_waiting(id).await {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(job_id = id, error = %e, "Failed to mark job as waiting");
                return;
            }
        };
        let topic = job.topic();
        match self.router.offer(job).await {
            Placement::Claimed(worker_id) => {
                tracing::info!(job_id = id, topic = %topic, worker_id, "Job dispatched");
            }
            Placement::Parked => {
                tracing::info!(job_id = id, topic = %topic, "Job waiting for an idle worker");
            }
        }
    }
}
