//! Delayed jobs: retry after TEMPORARY_FAILURE, inactivity checks and the
//! deferred IKE_SA delete after a failed first CHILD_SA

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::warn;

use crate::config::ChildConfig;
use crate::kernel::Mark;
use crate::label::SecurityLabel;

/// A job to be executed after its delay elapsed
#[derive(Debug, Clone)]
pub enum Job {
    /// Queue a fresh child-create task cloned from a failed one
    RetryChildCreate {
        /// Configuration of the failed negotiation
        config: Arc<ChildConfig>,
        /// Reqid carried over from the failed task
        reqid: u32,
        /// Marks carried over from the failed task
        marks: (Mark, Mark),
        /// Interface IDs carried over from the failed task
        if_ids: (u32, u32),
        /// Label carried over from the failed task
        label: Option<SecurityLabel>,
    },
    /// Check a CHILD_SA for inactivity and delete it when idle too long
    InactivityCheck {
        /// Unique ID of the CHILD_SA
        child_id: u32,
        /// Configured inactivity timeout
        timeout: Duration,
        /// Close the whole IKE_SA when this was its last CHILD_SA
        close_ike: bool,
    },
    /// Delete the IKE_SA, delayed so a pending response can drain first
    DeleteIkeSa {
        /// Unique ID of the IKE_SA
        ike_id: u32,
    },
}

/// Schedules jobs for later execution
pub trait Scheduler: Send + Sync {
    /// Hand the job to the executor after the delay elapsed
    fn schedule(&self, job: Job, delay: Duration);
}

/// Scheduler that drops every job
pub struct NullScheduler;

impl Scheduler for NullScheduler {
    fn schedule(&self, _job: Job, _delay: Duration) {}
}

/// Tokio-backed scheduler: every job gets its own sleeping task and is
/// pushed into a channel the owning engine drains
pub struct TokioScheduler {
    tx: mpsc::UnboundedSender<Job>,
}

impl TokioScheduler {
    /// Create the scheduler plus the receiving end for the engine loop.
    /// Must be called within a tokio runtime.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Job>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, job: Job, delay: Duration) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            if tx.send(job).is_err() {
                warn!("Dropping scheduled job, the engine went away");
            }
        });
    }
}

/// Scheduler recording jobs and their delays for inspection in tests
#[derive(Default)]
pub struct RecordingScheduler {
    /// The recorded jobs with their requested delays
    pub jobs: Mutex<Vec<(Job, Duration)>>,
}

impl Scheduler for RecordingScheduler {
    fn schedule(&self, job: Job, delay: Duration) {
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.push((job, delay));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[allow(clippy::unwrap_used)]
    async fn jobs_arrive_after_their_delay() {
        let (sched, mut rx) = TokioScheduler::new();
        sched.schedule(Job::DeleteIkeSa { ike_id: 7 }, Duration::from_millis(10));
        let job = rx.recv().await.unwrap();
        assert!(matches!(job, Job::DeleteIkeSa { ike_id: 7 }));
    }
}
