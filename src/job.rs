//! Background training jobs.
//!
//! A [`TrainingService`] is created once and shared by whoever starts runs.
//! Submitting a job spawns a worker thread and returns a [`JobHandle`];
//! progress is read from the handle's status snapshot or its event channel.
//! At most one job runs at a time and a running job cannot be cancelled.
//! A job that panics is reported as failed like one that returns an error.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use serde::Serialize;

use crate::config::{DpoConfig, TrainingConfig};
use crate::data::{PreferenceDataset, SftDataset};
use crate::dpo::{DpoEpochRecord, DpoTrainer};
use crate::error::{RapportError, Result};
use crate::model::RapportModel;
use crate::progress::{ProgressCallback, StepUpdate};
use crate::trainer::{HistoryRecord, SftTrainer};

/// Log lines retained in [`JobStatus::logs`].
pub const MAX_LOG_LINES: usize = 100;

/// Lifecycle of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Submitted, no step taken yet
    Idle,
    /// At least one optimizer step taken
    Running,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
}

impl JobState {
    /// Whether the job has ended.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Point-in-time view of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatus {
    /// Lifecycle state
    pub state: JobState,
    /// Optimizer steps taken
    pub step: usize,
    /// Steps planned
    pub total_steps: usize,
    /// Loss of the latest step
    pub loss: Option<f64>,
    /// Most recent log lines, oldest first
    pub logs: VecDeque<String>,
    /// Failure message
    pub error: Option<String>,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self {
            state: JobState::Idle,
            step: 0,
            total_steps: 0,
            loss: None,
            logs: VecDeque::with_capacity(MAX_LOG_LINES),
            error: None,
        }
    }
}

impl JobStatus {
    fn push_log(&mut self, line: String) {
        if self.logs.len() == MAX_LOG_LINES {
            self.logs.pop_front();
        }
        self.logs.push_back(line);
    }
}

/// Messages sent on a job's event channel.
#[derive(Debug, Clone, PartialEq)]
pub enum TrainingEvent {
    /// An optimizer step finished
    Step(StepUpdate),
    /// The trainer emitted a log line
    Log(String),
    /// The job returned successfully
    Finished,
    /// The job returned an error
    Failed(String),
}

fn lock(status: &Mutex<JobStatus>) -> MutexGuard<'_, JobStatus> {
    status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Forwards trainer progress into the shared status and the event channel.
struct ChannelCallback {
    status: Arc<Mutex<JobStatus>>,
    events: Sender<TrainingEvent>,
}

impl ProgressCallback for ChannelCallback {
    fn on_step(&mut self, update: &StepUpdate) {
        {
            let mut status = lock(&self.status);
            status.state = JobState::Running;
            status.step = update.step;
            status.total_steps = update.total_steps;
            status.loss = Some(update.loss);
        }
        let _ = self.events.send(TrainingEvent::Step(update.clone()));
    }

    fn on_log(&mut self, line: &str) {
        lock(&self.status).push_log(line.to_string());
        let _ = self.events.send(TrainingEvent::Log(line.to_string()));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Clears the service's busy flag when the worker ends, panics included.
struct ActiveGuard(Arc<AtomicBool>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Handle to a submitted job.
pub struct JobHandle<T> {
    status: Arc<Mutex<JobStatus>>,
    events: Receiver<TrainingEvent>,
    worker: JoinHandle<Result<T>>,
}

impl<T> JobHandle<T> {
    /// Current status snapshot.
    pub fn status(&self) -> JobStatus {
        lock(&self.status).clone()
    }

    /// Event stream; it disconnects once the job ends and all events are read.
    pub fn events(&self) -> &Receiver<TrainingEvent> {
        &self.events
    }

    /// Whether the worker thread has exited.
    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Wait for the job and return its result.
    pub fn join(self) -> Result<T> {
        self.worker
            .join()
            .map_err(|_| RapportError::training("training thread panicked"))?
    }
}

/// Runs at most one training job at a time.
#[derive(Debug, Clone, Default)]
pub struct TrainingService {
    active: Arc<AtomicBool>,
}

impl TrainingService {
    /// New idle service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a job is running.
    pub fn is_training(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Run `job` on a worker thread.
    ///
    /// Fails with [`RapportError::TrainingInProgress`] while another job runs.
    pub fn submit<T, F>(&self, name: &str, job: F) -> Result<JobHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn ProgressCallback) -> Result<T> + Send + 'static,
    {
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(RapportError::TrainingInProgress);
        }
        let guard = ActiveGuard(Arc::clone(&self.active));

        let status = Arc::new(Mutex::new(JobStatus::default()));
        let (tx, rx) = mpsc::channel();
        let mut callback = ChannelCallback {
            status: Arc::clone(&status),
            events: tx.clone(),
        };
        let job_name = name.to_string();

        let worker = thread::Builder::new()
            .name(format!("rapport-{name}"))
            .spawn(move || {
                let _guard = guard;
                tracing::info!("Training job {job_name} started");
                callback.on_log(&format!("{job_name} started"));

                let result = panic::catch_unwind(AssertUnwindSafe(|| job(&mut callback)))
                    .unwrap_or_else(|payload| {
                        Err(RapportError::training(format!(
                            "training thread panicked: {}",
                            panic_message(payload.as_ref())
                        )))
                    });
                {
                    let mut status = lock(&callback.status);
                    match &result {
                        Ok(_) => {
                            status.state = JobState::Completed;
                            status.push_log(format!("{job_name} completed"));
                        }
                        Err(e) => {
                            status.state = JobState::Failed;
                            status.error = Some(e.to_string());
                            status.push_log(format!("{job_name} failed: {e}"));
                        }
                    }
                }
                let event = match &result {
                    Ok(_) => {
                        tracing::info!("Training job {job_name} completed");
                        TrainingEvent::Finished
                    }
                    Err(e) => {
                        tracing::warn!("Training job {job_name} failed: {e}");
                        TrainingEvent::Failed(e.to_string())
                    }
                };
                let _ = tx.send(event);
                result
            })?;

        Ok(JobHandle {
            status,
            events: rx,
            worker,
        })
    }

    /// Run supervised fine-tuning in the background.
    pub fn submit_sft(
        &self,
        model: RapportModel,
        mut config: TrainingConfig,
        output_dir: impl Into<PathBuf>,
        train_set: SftDataset,
        eval_set: Option<SftDataset>,
        seed: u64,
    ) -> Result<JobHandle<Vec<HistoryRecord>>> {
        config.show_progress = false;
        let output_dir = output_dir.into();
        self.submit("sft", move |callback| {
            let mut trainer = SftTrainer::new(model, config, output_dir)?.with_seed(seed);
            trainer.train(&train_set, eval_set.as_ref(), callback)
        })
    }

    /// Run DPO in the background with a frozen copy of `policy` as reference.
    pub fn submit_dpo(
        &self,
        policy: RapportModel,
        mut config: DpoConfig,
        output_dir: impl Into<PathBuf>,
        dataset: PreferenceDataset,
        seed: u64,
    ) -> Result<JobHandle<Vec<DpoEpochRecord>>> {
        config.show_progress = false;
        let output_dir = output_dir.into();
        self.submit("dpo", move |callback| {
            let mut trainer = DpoTrainer::new(policy, config, output_dir)?.with_seed(seed);
            trainer.train(&dataset, callback)
        })
    }
}
