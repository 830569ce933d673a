use super::durable::DurableQueue;
use super::memory::MemoryQueue;
use super::*;
use crate::core::errors::OrchestratorError;
use crate::core::job::JobPriority;
use chrono::Duration;

fn backends(max_pending: usize) -> Vec<Arc<dyn QueueBackend>> {
    let storage = Storage::open_in_memory().unwrap();
    vec![
        Arc::new(MemoryQueue::new(max_pending)),
        Arc::new(DurableQueue::new(storage, max_pending)),
    ]
}

fn job(id: &str, priority: JobPriority) -> Job {
    Job::with_id(id, "wf", "Workflow", "{\"nodes\":[]}", priority)
}

fn any_robot(_: &Job) -> Option<String> {
    Some("robot-1".to_string())
}

fn nobody(_: &Job) -> Option<String> {
    None
}

async fn drain(queue: &dyn QueueBackend) -> Vec<String> {
    let mut order = Vec::new();
    while let Some(job) = queue.dequeue_next(Utc::now(), &any_robot).await.unwrap() {
        order.push(job.job_id);
    }
    order
}

#[tokio::test]
async fn priority_then_submission_order() {
    for queue in backends(100) {
        for (id, priority) in [
            ("a", JobPriority::Low),
            ("b", JobPriority::High),
            ("c", JobPriority::Normal),
            ("d", JobPriority::High),
        ] {
            assert!(queue.enqueue(job(id, priority)).await.unwrap().accepted);
        }
        assert_eq!(queue.pending_count().await.unwrap(), 4);
        assert_eq!(drain(queue.as_ref()).await, ["b", "d", "c", "a"], "{}", queue.name());
        assert_eq!(queue.pending_count().await.unwrap(), 0);
    }
}

#[tokio::test]
async fn duplicates_and_overflow_are_rejected() {
    for queue in backends(2) {
        assert!(queue.enqueue(job("a", JobPriority::Normal)).await.unwrap().accepted);
        let dup = queue.enqueue(job("a", JobPriority::High)).await.unwrap();
        assert!(!dup.accepted);
        assert!(dup.reason.unwrap().contains("already exists"));

        assert!(queue.enqueue(job("b", JobPriority::Normal)).await.unwrap().accepted);
        let full = queue.enqueue(job("c", JobPriority::Urgent)).await.unwrap();
        assert_eq!(full, EnqueueOutcome::rejected("queue is full"));

        let mut done = job("d", JobPriority::Normal);
        done.status = JobStatus::Completed;
        let _ = queue.dequeue_next(Utc::now(), &any_robot).await.unwrap();
        assert!(!queue.enqueue(done).await.unwrap().accepted);
    }
}

#[tokio::test]
async fn claimed_jobs_are_invisible_until_requeued() {
    for queue in backends(10) {
        queue.enqueue(job("a", JobPriority::Normal)).await.unwrap();

        assert!(queue.dequeue_next(Utc::now(), &nobody).await.unwrap().is_none());
        assert_eq!(queue.get("a").await.unwrap().unwrap().status, JobStatus::Queued);

        let claimed = queue.dequeue_next(Utc::now(), &any_robot).await.unwrap().unwrap();
        assert_eq!(claimed.status, JobStatus::Claimed);
        assert_eq!(claimed.assigned_robot_id.as_deref(), Some("robot-1"));
        assert!(queue.dequeue_next(Utc::now(), &any_robot).await.unwrap().is_none());

        let later = Utc::now() + Duration::seconds(60);
        let released = queue.requeue("a", Some(later)).await.unwrap();
        assert_eq!(released.status, JobStatus::Queued);
        assert_eq!(released.retry_count, 0);
        assert!(released.assigned_robot_id.is_none());

        // Backoff hides it until not_before.
        assert!(queue.dequeue_next(Utc::now(), &any_robot).await.unwrap().is_none());
        let again = queue
            .dequeue_next(later + Duration::seconds(1), &any_robot)
            .await
            .unwrap();
        assert_eq!(again.unwrap().job_id, "a");

        // Only claims can be requeued.
        queue
            .update("a", &mut |j: &mut Job| j.start(Utc::now()))
            .await
            .unwrap();
        assert!(matches!(
            queue.requeue("a", None).await,
            Err(OrchestratorError::InvalidTransition { .. })
        ));
    }
}

#[tokio::test]
async fn failed_mutation_leaves_job_untouched() {
    for queue in backends(10) {
        queue.enqueue(job("a", JobPriority::Normal)).await.unwrap();
        let err = queue
            .update("a", &mut |j: &mut Job| {
                j.progress = 50;
                j.start(Utc::now())
            })
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), "InvalidTransitionError");
        let stored = queue.get("a").await.unwrap().unwrap();
        assert_eq!(stored.progress, 0);
        assert_eq!(stored.status, JobStatus::Queued);

        assert!(matches!(
            queue.update("ghost", &mut |_: &mut Job| Ok(())).await,
            Err(OrchestratorError::NotFound(_))
        ));
    }
}

#[tokio::test]
async fn priority_change_reorders_pending_jobs() {
    for queue in backends(10) {
        queue.enqueue(job("a", JobPriority::Normal)).await.unwrap();
        queue.enqueue(job("b", JobPriority::Normal)).await.unwrap();
        queue
            .update("b", &mut |j: &mut Job| {
                j.priority = JobPriority::Urgent;
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(drain(queue.as_ref()).await, ["b", "a"], "{}", queue.name());
    }
}

#[tokio::test]
async fn ack_settles_terminal_jobs_and_prune_keeps_newest() {
    for queue in backends(10) {
        for id in ["a", "b", "c"] {
            queue.enqueue(job(id, JobPriority::Normal)).await.unwrap();
        }
        assert!(queue.ack("a").await.is_err());

        for id in ["a", "b", "c"] {
            queue
                .update(id, &mut |j: &mut Job| j.cancel("not needed", Utc::now()))
                .await
                .unwrap();
            queue.ack(id).await.unwrap();
        }
        // Acking twice is harmless.
        queue.ack("c").await.unwrap();

        let settled = queue.get("b").await.unwrap().unwrap();
        assert!(settled.workflow_payload.is_empty());
        assert_eq!(settled.status, JobStatus::Cancelled);

        assert_eq!(queue.prune_history(1).await.unwrap(), 2);
        assert!(queue.get("a").await.unwrap().is_none());
        assert!(queue.get("b").await.unwrap().is_none());
        assert!(queue.get("c").await.unwrap().is_some());
        assert_eq!(queue.prune_history(1).await.unwrap(), 0);
    }
}

#[tokio::test]
async fn list_is_newest_first_and_filterable() {
    for queue in backends(10) {
        let mut old = job("old", JobPriority::Normal);
        old.created_at = Utc::now() - Duration::minutes(5);
        queue.enqueue(old).await.unwrap();
        queue.enqueue(job("new", JobPriority::Normal)).await.unwrap();
        queue.dequeue_next(Utc::now(), &any_robot).await.unwrap();

        let all = queue.list(&JobListFilter::default()).await.unwrap();
        let ids: Vec<_> = all.iter().map(|j| j.job_id.as_str()).collect();
        assert_eq!(ids, ["new", "old"], "{}", queue.name());

        let claimed = queue
            .list(&JobListFilter {
                status: Some(JobStatus::Claimed),
                limit: None,
            })
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);

        let limited = queue
            .list(&JobListFilter {
                status: None,
                limit: Some(1),
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_dequeues_never_share_a_job() {
    for queue in backends(500) {
        for i in 0..150 {
            let priority = if i % 3 == 0 { JobPriority::High } else { JobPriority::Normal };
            queue.enqueue(job(&format!("j{:03}", i), priority)).await.unwrap();
        }
        let workers: Vec<_> = (0..2)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { drain(queue.as_ref()).await })
            })
            .collect();

        let mut claimed = Vec::new();
        for worker in workers {
            claimed.extend(worker.await.unwrap());
        }
        let unique: std::collections::HashSet<_> = claimed.iter().cloned().collect();
        assert_eq!(claimed.len(), 150, "{}", queue.name());
        assert_eq!(unique.len(), 150, "{}", queue.name());
        assert_eq!(queue.pending_count().await.unwrap(), 0);
    }
}

#[tokio::test]
async fn placer_can_pick_a_job_beyond_the_first_page() {
    for queue in backends(500) {
        queue.enqueue(job("urgent", JobPriority::Urgent)).await.unwrap();
        for i in 0..100 {
            queue
                .enqueue(job(&format!("n{:03}", i), JobPriority::Normal))
                .await
                .unwrap();
        }
        let only_last = |j: &Job| (j.job_id == "n099").then(|| "robot-1".to_string());
        let picked = queue.dequeue_next(Utc::now(), &only_last).await.unwrap().unwrap();
        assert_eq!(picked.job_id, "n099", "{}", queue.name());
        assert!(queue.dequeue_next(Utc::now(), &only_last).await.unwrap().is_none());
        assert_eq!(queue.pending_count().await.unwrap(), 100);
    }
}

#[tokio::test]
async fn durable_queue_recovers_orphaned_claims() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");

    {
        let queue = DurableQueue::new(Storage::open(&path).await.unwrap(), 10);
        queue.enqueue(job("a", JobPriority::High)).await.unwrap();
        queue.enqueue(job("b", JobPriority::Normal)).await.unwrap();
        queue.dequeue_next(Utc::now(), &any_robot).await.unwrap();
        queue.dequeue_next(Utc::now(), &any_robot).await.unwrap();
        queue
            .update("b", &mut |j: &mut Job| j.start(Utc::now()))
            .await
            .unwrap();
    }

    let queue = DurableQueue::new(Storage::open(&path).await.unwrap(), 10);
    assert_eq!(queue.recover().await.unwrap(), 1);
    let a = queue.get("a").await.unwrap().unwrap();
    assert_eq!(a.status, JobStatus::Queued);
    assert!(a.assigned_robot_id.is_none());
    assert_eq!(queue.get("b").await.unwrap().unwrap().status, JobStatus::Running);
    assert_eq!(queue.pending_count().await.unwrap(), 1);
}

#[tokio::test]
async fn build_backend_follows_configuration() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = QueueConfig {
        sqlite_path: dir.path().join("q.db"),
        ..QueueConfig::default()
    };
    assert_eq!(build_backend(&config, None).await.unwrap().name(), "memory");
    config.backend = QueueBackendKind::Sqlite;
    assert_eq!(build_backend(&config, None).await.unwrap().name(), "sqlite");
}
