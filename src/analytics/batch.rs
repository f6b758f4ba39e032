//! Batch re-evaluation: a priority queue of jobs drained by a fixed pool of
//! workers.
//!
//! Jobs run HIGH before NORMAL before LOW, FIFO within a priority. A job's
//! students are evaluated one at a time; a failing student is recorded on the
//! job and the rest carry on. Cancellation is checked between students, so an
//! evaluation that has started always finishes.

use async_trait::async_trait;
use chrono::Utc;
use opentelemetry::KeyValue;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, warn};

use crate::config::{BatchConfig, RecommendConfig};
use crate::error::{Error, Result};
use crate::model::{
    BatchId, BatchJob, BatchPriority, BatchStatus, StudentEvaluation, StudentFailure,
};
use crate::predict::Predictor;
use crate::recommend::recommend;
use crate::store::MasteryStore;
use crate::telemetry::metrics;
use crate::telemetry::spans::{record_state_transition, start_batch_span};

/// Evaluates one student for a batch.
#[async_trait]
pub trait StudentEvaluator: Send + Sync {
    async fn evaluate(&self, student_id: &str, horizon_days: u32) -> Result<StudentEvaluation>;
}

/// Predictor + Recommendation Engine over every component record of a
/// student. Any component that can't be evaluated fails the student.
pub struct MasteryEvaluator {
    store: MasteryStore,
    predictor: Arc<Predictor>,
    recommend: RecommendConfig,
}

impl MasteryEvaluator {
    pub fn new(store: MasteryStore, predictor: Arc<Predictor>, recommend: RecommendConfig) -> Self {
        Self {
            store,
            predictor,
            recommend,
        }
    }
}

#[async_trait]
impl StudentEvaluator for MasteryEvaluator {
    async fn evaluate(&self, student_id: &str, horizon_days: u32) -> Result<StudentEvaluation> {
        let records = self.store.list_for_student(student_id).await?;
        if records.is_empty() {
            return Err(Error::NotFound(format!(
                "no mastery records for student {student_id}"
            )));
        }

        let mut evaluation = StudentEvaluation {
            student_id: student_id.to_string(),
            predictions: Vec::with_capacity(records.len()),
            recommendations: Vec::new(),
        };
        for record in &records {
            let prediction = self.predictor.predict(record, horizon_days)?;
            evaluation
                .recommendations
                .extend(recommend(record, Some(&prediction), &self.recommend));
            evaluation.predictions.push(prediction);
        }
        Ok(evaluation)
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
struct Queued {
    priority: BatchPriority,
    seq: u64,
    batch_id: BatchId,
}

impl Ord for Queued {
    /// Max-heap: higher priority first, then lower sequence number.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct Jobs {
    by_id: HashMap<BatchId, BatchJob>,
    queue: BinaryHeap<Queued>,
    cancel_requested: HashSet<BatchId>,
    next_seq: u64,
}

/// Owns batch jobs from submission to a terminal status.
pub struct BatchScheduler {
    jobs: Arc<Mutex<Jobs>>,
    evaluator: Arc<dyn StudentEvaluator>,
    config: BatchConfig,
    wake: Arc<Notify>,
    shutdown: Arc<Notify>,
    stopping: Arc<AtomicBool>,
}

impl Clone for BatchScheduler {
    fn clone(&self) -> Self {
        Self {
            jobs: Arc::clone(&self.jobs),
            evaluator: Arc::clone(&self.evaluator),
            config: self.config.clone(),
            wake: Arc::clone(&self.wake),
            shutdown: Arc::clone(&self.shutdown),
            stopping: Arc::clone(&self.stopping),
        }
    }
}

impl BatchScheduler {
    pub fn new(evaluator: Arc<dyn StudentEvaluator>, config: BatchConfig) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(Jobs::default())),
            evaluator,
            config,
            wake: Arc::new(Notify::new()),
            shutdown: Arc::new(Notify::new()),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    fn jobs(&self) -> MutexGuard<'_, Jobs> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue a job. Blank or empty student lists are rejected.
    pub fn submit<I, S>(&self, student_ids: I, priority: BatchPriority) -> Result<BatchId>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: BTreeSet<String> = student_ids.into_iter().map(Into::into).collect();
        if ids.is_empty() {
            return Err(Error::Validation("batch has no students".to_string()));
        }
        if ids.iter().any(|id| id.trim().is_empty()) {
            return Err(Error::Validation("batch contains an empty student_id".to_string()));
        }

        let job = BatchJob::new(ids, priority);
        let batch_id = job.batch_id;
        {
            let mut jobs = self.jobs();
            let seq = jobs.next_seq;
            jobs.next_seq += 1;
            info!(%batch_id, %priority, students = job.student_ids.len(), "batch submitted");
            jobs.by_id.insert(batch_id, job);
            jobs.queue.push(Queued {
                priority,
                seq,
                batch_id,
            });
        }
        self.wake.notify_one();
        Ok(batch_id)
    }

    pub fn status(&self, batch_id: &BatchId) -> Result<BatchJob> {
        self.jobs()
            .by_id
            .get(batch_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("batch {batch_id}")))
    }

    /// Forget finished jobs older than `retention_secs`. Returns how many
    /// were dropped. Pending and running jobs are never touched.
    pub fn evict_finished(&self) -> usize {
        let retention =
            chrono::Duration::from_std(self.config.retention()).unwrap_or(chrono::Duration::MAX);
        let Some(cutoff) = Utc::now().checked_sub_signed(retention) else {
            return 0;
        };

        let mut jobs = self.jobs();
        let before = jobs.by_id.len();
        jobs.by_id.retain(|_, job| {
            !(job.status.is_terminal() && job.completed_at.is_some_and(|done| done <= cutoff))
        });
        let evicted = before - jobs.by_id.len();
        if evicted > 0 {
            debug!(evicted, remaining = jobs.by_id.len(), "finished batches evicted");
        }
        evicted
    }

    /// Request cancellation. A pending job is cancelled at once; a running
    /// job stops before its next student. Terminal jobs are left alone.
    pub fn cancel(&self, batch_id: &BatchId) -> Result<BatchStatus> {
        let mut jobs = self.jobs();
        let status = jobs
            .by_id
            .get(batch_id)
            .map(|job| job.status)
            .ok_or_else(|| Error::NotFound(format!("batch {batch_id}")))?;

        match status {
            BatchStatus::Pending => {
                if let Some(job) = jobs.by_id.get_mut(batch_id) {
                    job.status = BatchStatus::Cancelled;
                    job.completed_at = Some(Utc::now());
                }
                info!(%batch_id, "pending batch cancelled");
                Ok(BatchStatus::Cancelled)
            }
            BatchStatus::Processing => {
                jobs.cancel_requested.insert(*batch_id);
                info!(%batch_id, "cancellation requested");
                Ok(BatchStatus::Processing)
            }
            terminal => Ok(terminal),
        }
    }

    fn is_cancel_requested(&self, batch_id: &BatchId) -> bool {
        self.jobs().cancel_requested.contains(batch_id)
    }

    /// Claim the next pending job, highest priority first.
    fn claim(&self) -> Option<(BatchId, BatchPriority, Vec<String>)> {
        let mut jobs = self.jobs();
        while let Some(next) = jobs.queue.pop() {
            let Some(job) = jobs.by_id.get_mut(&next.batch_id) else {
                continue;
            };
            // Cancelled while queued.
            if job.status != BatchStatus::Pending {
                continue;
            }
            job.status = BatchStatus::Processing;
            return Some((
                job.batch_id,
                job.priority,
                job.student_ids.iter().cloned().collect(),
            ));
        }
        None
    }

    /// Run the next pending job to completion. Returns `None` when the queue
    /// is empty.
    pub async fn process_next(&self) -> Result<Option<BatchId>> {
        let Some((batch_id, priority, students)) = self.claim() else {
            return Ok(None);
        };

        let span = start_batch_span(&batch_id, &priority.to_string(), students.len());
        record_state_transition(&span, "PENDING", "PROCESSING");

        let start = Instant::now();
        let status = self
            .run_job(batch_id, priority, &students)
            .instrument(span.clone())
            .await;
        record_state_transition(&span, "PROCESSING", &status.to_string());
        metrics::operation_duration_ms().record(
            start.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", "batch")],
        );
        Ok(Some(batch_id))
    }

    async fn run_job(
        &self,
        batch_id: BatchId,
        priority: BatchPriority,
        students: &[String],
    ) -> BatchStatus {
        let priority_label = KeyValue::new("priority", priority.to_string());
        let mut cancelled = false;
        let mut failed = 0usize;

        for student_id in students {
            if self.is_cancel_requested(&batch_id) {
                cancelled = true;
                break;
            }

            let outcome = self
                .evaluator
                .evaluate(student_id, self.config.horizon_days)
                .await;

            let mut jobs = self.jobs();
            let Some(job) = jobs.by_id.get_mut(&batch_id) else {
                return BatchStatus::Failed;
            };
            match outcome {
                Ok(evaluation) => {
                    debug!(student_id, "student evaluated");
                    metrics::batch_students()
                        .add(1, &[priority_label.clone(), KeyValue::new("result", "ok")]);
                    job.results.push(evaluation);
                }
                Err(e) => {
                    warn!(student_id, code = e.code(), error = %e, "student evaluation failed");
                    metrics::batch_students()
                        .add(1, &[priority_label.clone(), KeyValue::new("result", "error")]);
                    failed += 1;
                    job.error_count += 1;
                    job.failures.push(StudentFailure {
                        student_id: student_id.clone(),
                        code: e.code().to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        let status = if cancelled {
            BatchStatus::Cancelled
        } else if !students.is_empty() && failed == students.len() {
            BatchStatus::Failed
        } else {
            BatchStatus::Completed
        };

        let mut jobs = self.jobs();
        jobs.cancel_requested.remove(&batch_id);
        if let Some(job) = jobs.by_id.get_mut(&batch_id) {
            job.status = status;
            job.completed_at = Some(Utc::now());
            info!(
                %batch_id,
                %status,
                results = job.results.len(),
                error_count = job.error_count,
                "batch finished"
            );
        }
        status
    }

    /// Drain the queue on the current task.
    pub async fn run_until_idle(&self) -> Result<usize> {
        let mut processed = 0;
        while self.process_next().await?.is_some() {
            processed += 1;
        }
        Ok(processed)
    }

    /// Signal every worker to stop after its current job.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    /// Run `config.workers` workers until [`BatchScheduler::shutdown`].
    pub async fn run(&self, poll_interval: Duration) -> Result<()> {
        let workers = self.config.workers.max(1);
        info!(workers, "batch scheduler started");

        let mut set = JoinSet::new();
        for worker in 0..workers {
            let scheduler = self.clone();
            set.spawn(async move { scheduler.worker_loop(worker, poll_interval).await });
        }
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!("batch worker panicked: {e}");
            }
        }
        info!("batch scheduler stopped");
        Ok(())
    }

    async fn worker_loop(&self, worker: usize, poll_interval: Duration) {
        while !self.stopping.load(Ordering::SeqCst) {
            match self.process_next().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => error!(worker, "batch worker error: {e}"),
            }
            tokio::select! {
                _ = self.shutdown.notified() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
        debug!(worker, "batch worker exiting");
    }
}
