//! Background task queue
//!
//! Reconciliation triggered by device-online and user-change events runs on
//! a single worker task, one job at a time, in the order it was posted.
//! Callers post a future and return; a failed job is logged and dropped.
//!
//! ## Flow
//!
//! ```text
//! on_device_online ──→ mpsc::Sender<Job> ──→ worker ──→ job.await
//!                                               │
//!                                          error!(..) on failure
//! ```

use std::future::Future;
use std::pin::Pin;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use dprofile_core::domain::ProfileError;

type BoxedTask = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

enum Job {
    Run { name: &'static str, task: BoxedTask },
    /// Completes once every job posted before it has finished
    Barrier(oneshot::Sender<()>),
}

/// Handle to the single-worker queue
#[derive(Clone)]
pub struct TaskQueue {
    jobs: mpsc::Sender<Job>,
}

impl TaskQueue {
    /// Spawns the worker on the current runtime
    ///
    /// # Arguments
    /// * `capacity` - Jobs that may wait before `post` applies backpressure
    /// * `cancel` - Stops the worker; queued jobs are dropped
    pub fn spawn(capacity: usize, cancel: CancellationToken) -> Self {
        let (jobs, receiver) = mpsc::channel(capacity.max(1));
        tokio::spawn(run_worker(receiver, cancel));
        Self { jobs }
    }

    /// Queues `task` behind everything posted so far
    pub async fn post<F>(&self, name: &'static str, task: F) -> Result<(), ProfileError>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        debug!(task = name, "Posting background task");
        self.jobs
            .send(Job::Run {
                name,
                task: Box::pin(task),
            })
            .await
            .map_err(|_| stopped())
    }

    /// Waits until every job posted before this call has finished
    pub async fn wait_idle(&self) -> Result<(), ProfileError> {
        let (tx, rx) = oneshot::channel();
        self.jobs.send(Job::Barrier(tx)).await.map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())
    }
}

fn stopped() -> ProfileError {
    ProfileError::StorageUnavailable("task queue is not running".to_string())
}

async fn run_worker(mut jobs: mpsc::Receiver<Job>, cancel: CancellationToken) {
    info!("Task queue starting");

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                info!("Task queue cancelled");
                break;
            }

            job = jobs.recv() => match job {
                Some(Job::Run { name, task }) => {
                    debug!(task = name, "Running background task");
                    if let Err(e) = task.await {
                        error!(task = name, error = %e, "Background task failed");
                    }
                }
                Some(Job::Barrier(done)) => {
                    let _ = done.send(());
                }
                None => {
                    info!("Task channel closed, queue shutting down");
                    break;
                }
            },
        }
    }

    info!("Task queue stopped");
}

// ============================================================================
// Unit tests
// ============================================================================
