//! End-to-end queue scenarios on the memory engine.
//!
//! Producer → QueueManager → engine → Worker slots → handler → ack → stats
//!
//! Verifies:
//! - Every job is completed or dead-lettered exactly per its retry budget
//! - No job runs on two slots at once
//! - Crashes and pauses never lose or double-count jobs

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use proptest::prelude::*;
    use serde_json::json;
    use tokio::sync::Notify;

    use lingoq_core::{JobId, Topic, WorkerId};
    use lingoq_events::LifecycleKind;

    use crate::jobs::{
        EnqueueOptions, HandlerError, JobContext, JobStatus, ManagerSettings, MemoryBackend, QueueManager,
        QueueStats, RetryPolicy, Worker, WorkerOptions, handler_fn,
    };

    fn settings() -> ManagerSettings {
        ManagerSettings {
            retry: RetryPolicy::fixed(3, Duration::ZERO),
            poll_interval: Duration::from_millis(2),
            ..ManagerSettings::default()
        }
    }

    fn options(name: &str) -> WorkerOptions {
        WorkerOptions {
            worker_id: WorkerId::new(name),
            reclaim_interval: Duration::from_millis(20),
            shutdown_timeout: Duration::from_secs(5),
        }
    }

    fn topic(name: &str) -> Topic {
        Topic::new(name).unwrap()
    }

    async fn drained(qm: &QueueManager, topics: &[Topic]) -> Vec<QueueStats> {
        for _ in 0..1_000 {
            let mut all = Vec::new();
            for t in topics {
                all.push(qm.stats(t).await.unwrap());
            }
            if all.iter().all(|s| s.pending == 0 && s.processing == 0) {
                return all;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("queue did not drain");
    }

    async fn wait_for_status(qm: &QueueManager, id: JobId, status: JobStatus) {
        for _ in 0..1_000 {
            if qm.get(id).await.unwrap().map(|j| j.status) == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {id} never reached {status}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn thirty_jobs_across_three_topics_all_complete() {
        let qm = QueueManager::new(MemoryBackend::arc(), settings());
        let topics = [topic("document-translation"), topic("text-translation"), topic("improvement")];

        for i in 0..30 {
            qm.enqueue(&topics[i % 3], json!({"i": i}), EnqueueOptions::default())
                .await
                .unwrap();
        }

        let mut worker = Worker::start(qm.clone(), options("scenario-a"));
        for (t, concurrency) in topics.iter().zip([3, 5, 2]) {
            worker
                .subscribe(
                    t.clone(),
                    handler_fn(|payload, _ctx| async move {
                        tokio::time::sleep(Duration::from_millis(3)).await;
                        Ok(json!({"i": payload["i"]}))
                    }),
                    concurrency,
                )
                .unwrap();
        }

        let stats = drained(&qm, &topics).await;
        let completed: u64 = stats.iter().map(|s| s.completed).sum();
        let failed: u64 = stats.iter().map(|s| s.failed).sum();
        assert_eq!((completed, failed), (30, 0));
        assert!(stats.iter().all(|s| s.completed == 10));

        let report = worker.shutdown().await.unwrap();
        assert_eq!(report.drained, 10);
        assert_eq!(report.aborted, 0);
    }

    #[tokio::test]
    async fn job_succeeding_on_third_attempt_completes_with_three_attempts() {
        let qm = QueueManager::new(MemoryBackend::arc(), settings());
        let t = topic("text-translation");
        let events = qm.events();
        let id = qm
            .enqueue(&t, json!({}), EnqueueOptions::default().with_max_attempts(3))
            .await
            .unwrap();

        let mut worker = Worker::start(qm.clone(), options("scenario-b"));
        worker
            .subscribe(
                t.clone(),
                handler_fn(|_payload, ctx: JobContext| async move {
                    if ctx.attempt < 3 {
                        return Err(HandlerError::msg(format!("flaky attempt {}", ctx.attempt)));
                    }
                    Ok(json!({"attempt": ctx.attempt}))
                }),
                1,
            )
            .unwrap();

        wait_for_status(&qm, id, JobStatus::Completed).await;
        worker.shutdown().await.unwrap();

        let job = qm.get(id).await.unwrap().unwrap();
        assert_eq!(job.attempts, 3);
        assert_eq!(job.result, Some(json!({"attempt": 3})));

        let kinds: Vec<_> = events.drain().into_iter().map(|e| (e.attempt, e.kind)).collect();
        let retries = kinds
            .iter()
            .filter(|(_, k)| matches!(k, LifecycleKind::Failed { will_retry: true, .. }))
            .count();
        assert_eq!(retries, 2);
        assert!(kinds.iter().any(|(a, k)| *a == 3 && matches!(k, LifecycleKind::Completed { .. })));
    }

    #[tokio::test]
    async fn job_failing_every_attempt_ends_dead() {
        let qm = QueueManager::new(MemoryBackend::arc(), settings());
        let t = topic("improvement");
        let before = qm.stats(&t).await.unwrap();
        let events = qm.events();

        let id = qm
            .enqueue(&t, json!({}), EnqueueOptions::default().with_max_attempts(3))
            .await
            .unwrap();

        let mut worker = Worker::start(qm.clone(), options("scenario-c"));
        worker
            .subscribe(
                t.clone(),
                handler_fn(|_payload, _ctx| async move { Err(HandlerError::msg("engine unavailable")) }),
                2,
            )
            .unwrap();

        wait_for_status(&qm, id, JobStatus::Dead).await;
        worker.shutdown().await.unwrap();

        let after = qm.stats(&t).await.unwrap();
        assert_eq!(after.failed, before.failed + 1);
        assert_eq!(after.pending, before.pending);

        let job = qm.get(id).await.unwrap().unwrap();
        assert_eq!((job.attempts, job.max_attempts), (3, 3));
        assert_eq!(job.error.as_deref(), Some("engine unavailable"));

        let dead = qm.list_dead(&t, 10).await.unwrap();
        assert_eq!(dead.iter().map(|j| j.id).collect::<Vec<_>>(), vec![id]);
        assert!(
            events
                .drain()
                .iter()
                .any(|e| e.job_id == id && matches!(e.kind, LifecycleKind::Dead { .. }))
        );

        // Operator replay.
        qm.retry_dead(id).await.unwrap();
        let job = qm.get(id).await.unwrap().unwrap();
        assert_eq!((job.status, job.attempts), (JobStatus::Pending, 0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_workers_never_run_a_job_twice() {
        let qm = QueueManager::new(MemoryBackend::arc(), settings());
        let t = topic("text-translation");
        for i in 0..60 {
            qm.enqueue(&t, json!({"i": i}), EnqueueOptions::default()).await.unwrap();
        }

        let running: Arc<Mutex<HashSet<JobId>>> = Arc::default();
        let runs = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::new();
        for w in 0..3 {
            let (running, runs, overlap) = (running.clone(), runs.clone(), overlap.clone());
            let mut worker = Worker::start(qm.clone(), options(&format!("exclusive-{w}")));
            worker
                .subscribe(
                    t.clone(),
                    handler_fn(move |_payload, ctx: JobContext| {
                        let (running, runs, overlap) = (running.clone(), runs.clone(), overlap.clone());
                        async move {
                            if !running.lock().unwrap().insert(ctx.job_id) {
                                overlap.store(true, Ordering::SeqCst);
                            }
                            runs.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(2)).await;
                            running.lock().unwrap().remove(&ctx.job_id);
                            Ok(json!({}))
                        }
                    }),
                    4,
                )
                .unwrap();
            workers.push(worker);
        }

        let stats = drained(&qm, std::slice::from_ref(&t)).await;
        for worker in workers {
            // Closing is idempotent for the shared backend.
            let report = worker.shutdown().await.unwrap();
            assert_eq!(report.aborted, 0);
        }

        assert!(!overlap.load(Ordering::SeqCst));
        assert_eq!(runs.load(Ordering::SeqCst), 60);
        assert_eq!(stats[0].completed, 60);
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed_without_spending_an_attempt() {
        let backend = MemoryBackend::arc();
        let qm = QueueManager::new(backend.clone(), settings());
        let t = topic("document-translation");
        let id = qm.enqueue(&t, json!({}), EnqueueOptions::default()).await.unwrap();

        let crashed = qm.claim(&t, &WorkerId::new("crashed/0")).await.unwrap().unwrap();
        assert!(qm.claim(&t, &WorkerId::new("other/0")).await.unwrap().is_none());

        backend.advance_clock(qm.settings().lease_duration + Duration::from_secs(1));
        let reclaimed = qm.reclaim_expired().await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].previous_owner, Some(WorkerId::new("crashed/0")));

        let again = qm.claim(&t, &WorkerId::new("other/0")).await.unwrap().unwrap();
        assert_eq!(again.job.id, id);
        assert_eq!(again.job.attempts, 0);

        // The crashed owner's late ack is rejected; the new owner's counts.
        assert!(qm.complete(&crashed.lease, json!({})).await.is_err());
        qm.complete(&again.lease, json!({})).await.unwrap();
        assert_eq!(qm.get(id).await.unwrap().unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn pause_lets_running_job_finish_and_holds_the_rest() {
        let qm = QueueManager::new(MemoryBackend::arc(), settings());
        let t = topic("document-translation");
        let release = Arc::new(Notify::new());
        let started = Arc::new(Notify::new());

        let first = qm.enqueue(&t, json!({"n": 1}), EnqueueOptions::default()).await.unwrap();

        let mut worker = Worker::start(qm.clone(), options("pause"));
        let (rel, st) = (release.clone(), started.clone());
        worker
            .subscribe(
                t.clone(),
                handler_fn(move |payload, _ctx| {
                    let (rel, st) = (rel.clone(), st.clone());
                    async move {
                        if payload["n"] == 1 {
                            st.notify_one();
                            rel.notified().await;
                        }
                        Ok(json!({}))
                    }
                }),
                1,
            )
            .unwrap();

        started.notified().await;
        worker.pause(&t).await.unwrap();
        assert!(qm.is_paused(&t).await.unwrap());
        let second = qm.enqueue(&t, json!({"n": 2}), EnqueueOptions::default()).await.unwrap();

        release.notify_one();
        wait_for_status(&qm, first, JobStatus::Completed).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(qm.get(second).await.unwrap().unwrap().status, JobStatus::Pending);

        worker.resume(&t).await.unwrap();
        wait_for_status(&qm, second, JobStatus::Completed).await;
        worker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn dedupe_holds_only_while_active() {
        let qm = QueueManager::new(MemoryBackend::arc(), settings());
        let t = topic("text-translation");
        let opts = || EnqueueOptions::default().with_dedupe_key("req-42");

        let a = qm.enqueue(&t, json!({}), opts()).await.unwrap();
        let b = qm.enqueue(&t, json!({}), opts()).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(qm.stats(&t).await.unwrap().pending, 1);

        // Same key on another topic is independent.
        let other = qm.enqueue(&topic("improvement"), json!({}), opts()).await.unwrap();
        assert_ne!(a, other);

        let claimed = qm.claim(&t, &WorkerId::new("w/0")).await.unwrap().unwrap();
        assert_eq!(qm.enqueue(&t, json!({}), opts()).await.unwrap(), a);
        qm.complete(&claimed.lease, json!({})).await.unwrap();

        let c = qm.enqueue(&t, json!({}), opts()).await.unwrap();
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn cancel_only_applies_to_pending_jobs() {
        let qm = QueueManager::new(MemoryBackend::arc(), settings());
        let t = topic("text-translation");
        let a = qm.enqueue(&t, json!({}), EnqueueOptions::default()).await.unwrap();
        let b = qm.enqueue(&t, json!({}), EnqueueOptions::default()).await.unwrap();

        let claimed = qm.claim(&t, &WorkerId::new("w/0")).await.unwrap().unwrap();
        assert_eq!(claimed.job.id, a);
        assert!(!qm.cancel(a).await.unwrap());
        assert!(qm.cancel(b).await.unwrap());
        assert!(qm.cancel(JobId::new()).await.is_err());

        let stats = qm.stats(&t).await.unwrap();
        assert_eq!((stats.processing, stats.cancelled, stats.total()), (1, 1, 2));

        qm.complete(&claimed.lease, json!({})).await.unwrap();
        let purged = qm.purge_terminal(chrono::Utc::now() + chrono::Duration::seconds(1)).await.unwrap();
        assert_eq!(purged, 2);
        assert_eq!(qm.stats(&t).await.unwrap().total(), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// Every job ends completed or dead, attempts never exceed the budget,
        /// and the counters add up to the number of jobs enqueued.
        #[test]
        fn outcomes_respect_budget_and_accounting(
            jobs in prop::collection::vec((1u32..5, 0u32..6), 1..12)
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let qm = QueueManager::new(MemoryBackend::arc(), settings());
                let t = topic("text-translation");
                let owner = WorkerId::new("prop/0");

                let mut plan = Vec::new();
                for (i, (max_attempts, failures)) in jobs.iter().copied().enumerate() {
                    let id = qm
                        .enqueue(&t, json!({"i": i}), EnqueueOptions::default().with_max_attempts(max_attempts))
                        .await
                        .unwrap();
                    plan.push((id, max_attempts, failures));
                }

                while let Some(claimed) = qm.claim(&t, &owner).await.unwrap() {
                    let (_, _, failures) = plan.iter().find(|(id, _, _)| *id == claimed.job.id).copied().unwrap();
                    if claimed.job.attempts < failures {
                        qm.fail(&claimed.job, &claimed.lease, "planned failure").await.unwrap();
                    } else {
                        qm.complete(&claimed.lease, json!({})).await.unwrap();
                    }
                }

                let stats = qm.stats(&t).await.unwrap();
                assert_eq!(stats.total(), jobs.len() as u64);
                assert_eq!(stats.pending + stats.processing, 0);

                for (id, max_attempts, failures) in plan {
                    let job = qm.get(id).await.unwrap().unwrap();
                    assert!(job.attempts <= job.max_attempts);
                    if failures >= max_attempts {
                        assert_eq!((job.status, job.attempts), (JobStatus::Dead, max_attempts));
                    } else {
                        assert_eq!((job.status, job.attempts), (JobStatus::Completed, failures + 1));
                    }
                }
            });
        }
    }
}
