//! Batch re-evaluation end to end.

mod common;

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

use common::{Harness, test_config};
use mastery_engine::analytics::{BatchScheduler, StudentEvaluator};
use mastery_engine::config::BatchConfig;
use mastery_engine::error::Result;
use mastery_engine::model::{BatchPriority, BatchStatus, StudentEvaluation};

#[tokio::test]
async fn students_without_history_fail_individually() {
    let h = Harness::new(test_config());
    let mut students = Vec::new();
    for i in 0..10 {
        let student = format!("student-{i:02}");
        if i < 8 {
            h.seed(&student, "loops", &[0.4, 0.5, 0.6]).await;
        } else {
            h.seed(&student, "loops", &[0.5]).await;
        }
        students.push(student);
    }

    let id = h.service.submit_batch(students, "normal").unwrap();
    assert_eq!(
        h.service.get_batch_status(&id.to_string()).unwrap().status,
        BatchStatus::Pending
    );

    assert_eq!(h.service.scheduler().run_until_idle().await.unwrap(), 1);

    let job = h.service.get_batch_status(&id.to_string()).unwrap();
    assert_eq!(job.status, BatchStatus::Completed);
    assert_eq!(job.error_count, 2);
    assert_eq!(job.results.len(), 8);
    assert!(job.completed_at.is_some());
    for failure in &job.failures {
        assert_eq!(failure.code, "INSUFFICIENT_HISTORY");
        assert!(failure.student_id == "student-08" || failure.student_id == "student-09");
    }
    for result in &job.results {
        assert_eq!(result.predictions.len(), 1);
        assert_eq!(result.predictions[0].horizon_days, 14);
    }
}

#[tokio::test]
async fn unknown_students_fail_the_whole_batch() {
    let h = Harness::new(test_config());
    let id = h
        .service
        .submit_batch(vec!["ghost-1".into(), "ghost-2".into()], "low")
        .unwrap();
    h.service.scheduler().run_until_idle().await.unwrap();

    let job = h.service.get_batch_status(&id.to_string()).unwrap();
    assert_eq!(job.status, BatchStatus::Failed);
    assert_eq!(job.error_count, 2);
    assert!(job.failures.iter().all(|f| f.code == "NOT_FOUND"));
}

/// Blocks on the first student until released.
struct Gated {
    started: Notify,
    release: Notify,
    gated: AtomicBool,
}

#[async_trait]
impl StudentEvaluator for Gated {
    async fn evaluate(&self, student_id: &str, _horizon: u32) -> Result<StudentEvaluation> {
        if !self.gated.swap(true, Ordering::SeqCst) {
            self.started.notify_one();
            self.release.notified().await;
        }
        Ok(StudentEvaluation {
            student_id: student_id.to_string(),
            predictions: Vec::new(),
            recommendations: Vec::new(),
        })
    }
}

fn gated_scheduler() -> (BatchScheduler, Arc<Gated>) {
    let gate = Arc::new(Gated {
        started: Notify::new(),
        release: Notify::new(),
        gated: AtomicBool::new(false),
    });
    let scheduler = BatchScheduler::new(
        gate.clone(),
        BatchConfig {
            workers: 2,
            horizon_days: 7,
            ..BatchConfig::default()
        },
    );
    (scheduler, gate)
}

#[tokio::test]
async fn cancelling_a_running_batch_stops_between_students() {
    let (scheduler, gate) = gated_scheduler();
    let id = scheduler
        .submit(["a", "b", "c"], BatchPriority::Normal)
        .unwrap();

    let worker = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.process_next().await }
    });

    gate.started.notified().await;
    assert_eq!(scheduler.status(&id).unwrap().status, BatchStatus::Processing);
    assert_eq!(scheduler.cancel(&id).unwrap(), BatchStatus::Processing);
    gate.release.notify_one();

    assert_eq!(worker.await.unwrap().unwrap(), Some(id));
    let job = scheduler.status(&id).unwrap();
    assert_eq!(job.status, BatchStatus::Cancelled);
    assert_eq!(job.results.len(), 1);
    assert_eq!(job.results[0].student_id, "a");

    // Terminal jobs ignore further cancels.
    assert_eq!(scheduler.cancel(&id).unwrap(), BatchStatus::Cancelled);
}

#[tokio::test]
async fn worker_pool_drains_submissions_and_shuts_down() {
    let (scheduler, gate) = gated_scheduler();
    gate.gated.store(true, Ordering::SeqCst);

    let pool = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.run(Duration::from_millis(10)).await }
    });

    let ids: Vec<_> = (0..5)
        .map(|i| {
            scheduler
                .submit([format!("s{i}"), format!("t{i}")], BatchPriority::High)
                .unwrap()
        })
        .collect();

    let finished = async {
        loop {
            let done = ids
                .iter()
                .all(|id| scheduler.status(id).unwrap().status == BatchStatus::Completed);
            if done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), finished)
        .await
        .expect("batches did not finish");

    scheduler.shutdown();
    tokio::time::timeout(Duration::from_secs(5), pool)
        .await
        .expect("workers did not stop")
        .unwrap()
        .unwrap();
}
