//! Topic router.
//!
//! Every idle worker session registers a single-use hand-off slot under the
//! topic it serves. Jobs offered for a topic go to the oldest idle slot of
//! that topic, or wait in the topic backlog until a session advertises.

use std::collections::{HashMap, VecDeque};

use tokio::sync::{oneshot, Mutex};

use crate::scheduler::job::{Job, Topic};

#[derive(Debug)]
struct IdleSlot {
    worker_id: u64,
    handoff: oneshot::Sender<Job>,
}

#[derive(Debug, Default)]
struct RouterState {
    idle: HashMap<Topic, VecDeque<IdleSlot>>,
    backlog: HashMap<Topic, VecDeque<Job>>,
}

impl RouterState {
    /// Hand the job to the first idle slot still listening. Gives the job
    /// back if no slot took it.
    fn try_hand_off(&mut self, topic: &Topic, mut job: Job) -> Result<u64, Job> {
        let Some(slots) = self.idle.get_mut(topic) else {
            return Err(job);
        };
        while let Some(slot) = slots.pop_front() {
            match slot.handoff.send(job) {
                Ok(()) => return Ok(slot.worker_id),
                // Session went away between advertising and now
                Err(returned) => job = returned,
            }
        }
        Err(job)
    }
}

/// Where an offered job ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Handed to the idle slot of this worker.
    Claimed(u64),
    /// No idle slot for the topic; parked in the backlog.
    Parked,
}

#[derive(Debug, Default)]
pub struct TopicRouter {
    state: Mutex<RouterState>,
}

impl TopicRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a job to its topic. Jobs offered for the same topic are claimed
    /// in the order they were offered.
    pub async fn offer(&self, job: Job) -> Placement {
        let topic = job.topic();
        let mut state = self.state.lock().await;

        // Anything already parked is older than this job.
        let has_backlog = state.backlog.get(&topic).is_some_and(|q| !q.is_empty());
        if !has_backlog {
            match state.try_hand_off(&topic, job) {
                Ok(worker_id) => {
                    tracing::debug!(topic = %topic, worker_id, "Job claimed by idle slot");
                    return Placement::Claimed(worker_id);
                }
                Err(returned) => {
                    tracing::debug!(topic = %topic, job_id = returned.id, "No idle slot, job parked");
                    state.backlog.entry(topic).or_default().push_back(returned);
                }
            }
        } else {
            state.backlog.entry(topic).or_default().push_back(job);
        }
        Placement::Parked
    }

    /// Put a job back at the head of its topic. Used when a claimed job could
    /// not be delivered and must keep its place in line.
    pub async fn requeue(&self, job: Job) -> Placement {
        let topic = job.topic();
        let mut state = self.state.lock().await;
        match state.try_hand_off(&topic, job) {
            Ok(worker_id) => Placement::Claimed(worker_id),
            Err(returned) => {
                state.backlog.entry(topic).or_default().push_front(returned);
                Placement::Parked
            }
        }
    }

    /// Advertise one idle slot for `topic`. The returned receiver yields the
    /// next job for the topic, immediately if one is parked.
    pub async fn advertise(&self, topic: &Topic, worker_id: u64) -> oneshot::Receiver<Job> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock().await;

        if let Some(job) = state.backlog.get_mut(topic).and_then(VecDeque::pop_front) {
            tracing::debug!(topic = %topic, worker_id, job_id = job.id, "Parked job claimed");
            // rx is alive, send cannot fail
            let _ = tx.send(job);
            return rx;
        }

        let slots = state.idle.entry(topic.clone()).or_default();
        slots.retain(|slot| !slot.handoff.is_closed());
        slots.push_back(IdleSlot {
            worker_id,
            handoff: tx,
        });
        rx
    }

    /// Number of sessions currently waiting on `topic`.
    pub async fn idle_slots(&self, topic: &Topic) -> usize {
        let state = self.state.lock().await;
        state
            .idle
            .get(topic)
            .map(|slots| slots.iter().filter(|s| !s.handoff.is_closed()).count())
            .unwrap_or(0)
    }

    /// Number of jobs parked on `topic`.
    pub async fn backlog_len(&self, topic: &Topic) -> usize {
        let state = self.state.lock().await;
        state.backlog.get(topic).map(VecDeque::len).unwrap_or(0)
    }

    /// Ids of every parked job, across all topics.
    pub async fn parked_jobs(&self) -> Vec<u64> {
        let state = self.state.lock().await;
        let mut ids: Vec<u64> = state
            .backlog
            .values()
            .flat_map(|q| q.iter().map(|j| j.id))
            .collect();
        ids.sort_unstable();
        ids
    }
}
