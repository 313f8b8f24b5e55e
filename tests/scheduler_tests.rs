
use std::collections::HashSet;
use std::time::Duration;

use test_harness::{build, test_config, translation, TestScheduler, ALL_KINDS, TRANSLATION_TTL_MS};
use xeodocs_scheduler::error::SchedulerError;
use xeodocs_scheduler::scheduler::{JobFilter, JobKind, JobState, JobStore, Outcome};

// =============================================================================
// Submission
// =============================================================================

#[test]
fn test_submit_without_dependencies_is_ready() {
    let t = TestScheduler::with_defaults();
    let job = t.scheduler.submit(translation("docs")).unwrap();

    assert_eq!(job.state, JobState::Ready);
    assert_eq!(job.attempt_count, 0);
    assert_eq!(job.max_attempts, 3);
}

#[test]
fn test_submit_with_unfinished_dependency_is_pending() {
    let t = TestScheduler::with_defaults();
    let a = t.scheduler.submit(translation("docs")).unwrap();
    let b = t.scheduler.submit(build("docs").depends_on(a.id)).unwrap();

    assert_eq!(b.state, JobState::Pending);
}

#[test]
fn test_submit_rejects_unknown_dependency() {
    let t = TestScheduler::with_defaults();
    let err = t
        .scheduler
        .submit(build("docs").depends_on(uuid::Uuid::new_v4()))
        .unwrap_err();

    assert!(matches!(err, SchedulerError::InvalidDependency(_)));
    assert!(t.scheduler.store().is_empty(), "nothing stored on rejection");
}

#[test]
fn test_submit_rejects_cross_project_dependency() {
    let t = TestScheduler::with_defaults();
    let a = t.scheduler.submit(translation("project-a")).unwrap();
    let err = t
        .scheduler
        .submit(build("project-b").depends_on(a.id))
        .unwrap_err();

    assert!(matches!(err, SchedulerError::InvalidDependency(_)));
}

#[test]
fn test_submit_rejects_duplicate_dependency() {
    let t = TestScheduler::with_defaults();
    let a = t.scheduler.submit(translation("docs")).unwrap();
    let err = t
        .scheduler
        .submit(build("docs").depends_on(a.id).depends_on(a.id))
        .unwrap_err();

    assert!(matches!(err, SchedulerError::InvalidDependency(_)));
}

#[test]
fn test_submit_rejects_empty_project() {
    let t = TestScheduler::with_defaults();
    let err = t.scheduler.submit(translation("  ")).unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidRequest(_)));
}

#[test]
fn test_submit_on_already_failed_dependency_fails_immediately() {
    let t = TestScheduler::new(test_config().with_max_attempts(1));
    let a = t.scheduler.submit(translation("docs")).unwrap();
    let grant = t.scheduler.try_acquire("w1", ALL_KINDS).unwrap().unwrap();
    t.scheduler
        .release(&grant.token, Outcome::Failed, None, Some("boom".into()))
        .unwrap();
    assert_eq!(t.scheduler.status(&a.id).unwrap().state, JobState::Failed);

    let b = t.scheduler.submit(build("docs").depends_on(a.id)).unwrap();
    assert_eq!(b.state, JobState::Failed);
    assert!(b.failure_reason.unwrap().contains(&a.id.to_string()));
}

#[test]
fn test_queue_full() {
    let mut config = test_config();
    config.max_jobs = 2;
    let t = TestScheduler::new(config);

    t.scheduler.submit(translation("docs")).unwrap();
    t.scheduler.submit(translation("docs")).unwrap();
    let err = t.scheduler.submit(translation("docs")).unwrap_err();
    assert!(matches!(err, SchedulerError::QueueFull));
}

// =============================================================================
// Leasing
// =============================================================================

#[test]
fn test_acquire_and_succeed() {
    let t = TestScheduler::with_defaults();
    let job = t
        .scheduler
        .submit(translation("docs").with_payload(serde_json::json!({"lang": "es"})))
        .unwrap();

    let grant = t.scheduler.try_acquire("w1", ALL_KINDS).unwrap().unwrap();
    assert_eq!(grant.job_id, job.id);
    assert_eq!(grant.attempt_count, 0);
    assert_eq!(grant.lease_ttl_ms, TRANSLATION_TTL_MS);
    assert_eq!(grant.payload["lang"], "es");

    let leased = t.scheduler.status(&job.id).unwrap();
    assert_eq!(leased.state, JobState::Leased);
    assert_eq!(leased.worker_id.as_deref(), Some("w1"));

    let done = t
        .scheduler
        .release(&grant.token, Outcome::Succeeded, Some("s3://out/es".into()), None)
        .unwrap();
    assert_eq!(done.state, JobState::Succeeded);
    assert_eq!(done.result_ref.as_deref(), Some("s3://out/es"));
    assert_eq!(done.attempt_count, 0);
    assert!(t.scheduler.leases().is_empty());
}

#[test]
fn test_no_job_returns_none() {
    let t = TestScheduler::with_defaults();
    assert!(t.scheduler.try_acquire("w1", ALL_KINDS).unwrap().is_none());
}

#[test]
fn test_capability_filter() {
    let t = TestScheduler::with_defaults();
    let job = t.scheduler.submit(translation("docs")).unwrap();

    assert!(t
        .scheduler
        .try_acquire("builder", &[JobKind::Build])
        .unwrap()
        .is_none());
    let grant = t
        .scheduler
        .try_acquire("translator", &[JobKind::Translation])
        .unwrap()
        .unwrap();
    assert_eq!(grant.job_id, job.id);
}

#[test]
fn test_empty_capabilities_rejected() {
    let t = TestScheduler::with_defaults();
    t.scheduler.submit(translation("docs")).unwrap();
    let err = t.scheduler.try_acquire("w1", &[]).unwrap_err();
    assert!(matches!(err, SchedulerError::CapabilityMismatch(_)));
}

#[test]
fn test_empty_worker_id_rejected() {
    let t = TestScheduler::with_defaults();
    let err = t.scheduler.try_acquire("", ALL_KINDS).unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidRequest(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_double_grant_under_concurrent_acquire() {
    let t = TestScheduler::with_defaults();
    let job = t.scheduler.submit(translation("docs")).unwrap();

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let scheduler = t.scheduler.clone();
            tokio::spawn(async move { scheduler.try_acquire(&format!("w{}", i), ALL_KINDS) })
        })
        .collect();

    let mut grants = Vec::new();
    for result in futures::future::join_all(handles).await {
        if let Some(grant) = result.unwrap().unwrap() {
            grants.push(grant);
        }
    }

    assert_eq!(grants.len(), 1, "exactly one worker gets the job");
    assert_eq!(grants[0].job_id, job.id);
    assert_eq!(t.scheduler.leases().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_acquire_grants_each_job_once() {
    let t = TestScheduler::with_defaults();
    for _ in 0..20 {
        t.scheduler.submit(translation("docs")).unwrap();
    }

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let scheduler = t.scheduler.clone();
            tokio::spawn(async move {
                let mut mine = Vec::new();
                while let Some(grant) = scheduler
                    .try_acquire(&format!("w{}", i), ALL_KINDS)
                    .unwrap()
                {
                    mine.push(grant.job_id);
                }
                mine
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for result in futures::future::join_all(handles).await {
        for id in result.unwrap() {
            assert!(seen.insert(id), "job {} granted twice", id);
        }
    }
    assert_eq!(seen.len(), 20);
}

#[test]
fn test_pending_job_never_leased() {
    let t = TestScheduler::with_defaults();
    let a = t.scheduler.submit(translation("docs")).unwrap();
    let b = t.scheduler.submit(build("docs").depends_on(a.id)).unwrap();

    let grant = t.scheduler.try_acquire("w1", ALL_KINDS).unwrap().unwrap();
    assert_eq!(grant.job_id, a.id);
    assert!(t.scheduler.try_acquire("w2", ALL_KINDS).unwrap().is_none());
    assert_eq!(t.scheduler.status(&b.id).unwrap().state, JobState::Pending);
}

#[test]
fn test_store_unavailable_refuses_leases() {
    let t = TestScheduler::with_defaults();
    t.scheduler.submit(translation("docs")).unwrap();

    t.store.set_available(false);
    let err = t.scheduler.try_acquire("w1", ALL_KINDS).unwrap_err();
    assert!(matches!(err, SchedulerError::StoreUnavailable(_)));
    assert!(t.scheduler.leases().is_empty());

    t.store.set_available(true);
    assert!(t.scheduler.try_acquire("w1", ALL_KINDS).unwrap().is_some());
}

// =============================================================================
// Long-poll
// =============================================================================

#[tokio::test]
async fn test_long_poll_times_out_empty() {
    let t = TestScheduler::with_defaults();
    let started = std::time::Instant::now();
    let grant = t
        .scheduler
        .acquire("w1", ALL_KINDS, Some(Duration::from_millis(50)))
        .await
        .unwrap();

    assert!(grant.is_none());
    assert!(started.elapsed() >= Duration::from_millis(50));
}

#[tokio::test]
async fn test_long_poll_wakes_on_submit() {
    let t = TestScheduler::with_defaults();
    let scheduler = t.scheduler.clone();
    let waiter = tokio::spawn(async move {
        scheduler
            .acquire("w1", ALL_KINDS, Some(Duration::from_secs(5)))
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    let job = t.scheduler.submit(translation("docs")).unwrap();

    let grant = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("waiter should wake before its deadline")
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(grant.job_id, job.id);
}

#[tokio::test]
async fn test_long_poll_wakes_when_dependency_succeeds() {
    let t = TestScheduler::with_defaults();
    let a = t.scheduler.submit(translation("docs")).unwrap();
    let b = t.scheduler.submit(build("docs").depends_on(a.id)).unwrap();
    let grant_a = t.scheduler.try_acquire("w1", ALL_KINDS).unwrap().unwrap();

    let scheduler = t.scheduler.clone();
    let waiter = tokio::spawn(async move {
        scheduler
            .acquire("builder", &[JobKind::Build], Some(Duration::from_secs(5)))
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    t.scheduler
        .release(&grant_a.token, Outcome::Succeeded, None, None)
        .unwrap();

    let grant_b = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(grant_b.job_id, b.id);
}

// =============================================================================
// Renew and release
// =============================================================================

#[test]
fn test_renew_extends_lease() {
    let t = TestScheduler::with_defaults();
    t.scheduler.submit(translation("docs")).unwrap();
    let grant = t.scheduler.try_acquire("w1", ALL_KINDS).unwrap().unwrap();

    t.clock.advance_ms(800);
    let renewed = t.scheduler.renew(&grant.token).unwrap();
    assert!(renewed.expires_at > grant.expires_at);

    // Past the original deadline but inside the renewed one.
    t.clock.advance_ms(800);
    assert!(t.scheduler.renew(&grant.token).is_ok());
}

#[test]
fn test_renew_after_expiry_fails() {
    let t = TestScheduler::with_defaults();
    let job = t.scheduler.submit(translation("docs")).unwrap();
    let grant = t.scheduler.try_acquire("w1", ALL_KINDS).unwrap().unwrap();

    t.clock.advance_ms(TRANSLATION_TTL_MS + 1);
    let err = t.scheduler.renew(&grant.token).unwrap_err();
    assert!(matches!(err, SchedulerError::LeaseExpired(id) if id == job.id));
}

#[test]
fn test_renew_unknown_token() {
    let t = TestScheduler::with_defaults();
    let err = t.scheduler.renew(&uuid::Uuid::new_v4()).unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidLease));
}

#[test]
fn test_double_release_has_no_effect() {
    let t = TestScheduler::with_defaults();
    let job = t.scheduler.submit(translation("docs")).unwrap();
    let grant = t.scheduler.try_acquire("w1", ALL_KINDS).unwrap().unwrap();

    t.scheduler
        .release(&grant.token, Outcome::Failed, None, Some("flaky".into()))
        .unwrap();
    let after_first = t.scheduler.status(&job.id).unwrap();
    assert_eq!(after_first.state, JobState::Ready);
    assert_eq!(after_first.attempt_count, 1);

    let err = t
        .scheduler
        .release(&grant.token, Outcome::Failed, None, Some("flaky".into()))
        .unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidLease));

    let after_second = t.scheduler.status(&job.id).unwrap();
    assert_eq!(after_second.state, JobState::Ready);
    assert_eq!(after_second.attempt_count, 1);
}

#[test]
fn test_release_after_expiry_is_rejected_and_reaped() {
    let t = TestScheduler::with_defaults();
    let job = t.scheduler.submit(translation("docs")).unwrap();
    let grant = t.scheduler.try_acquire("w1", ALL_KINDS).unwrap().unwrap();

    t.clock.advance_ms(TRANSLATION_TTL_MS + 1);
    let err = t
        .scheduler
        .release(&grant.token, Outcome::Succeeded, Some("late".into()), None)
        .unwrap_err();
    assert!(matches!(err, SchedulerError::LeaseExpired(_)));
    assert_eq!(t.scheduler.status(&job.id).unwrap().state, JobState::Leased);

    let report = t.scheduler.reap_expired().unwrap();
    assert_eq!(report.requeued, vec![job.id]);
    let requeued = t.scheduler.status(&job.id).unwrap();
    assert_eq!(requeued.state, JobState::Ready);
    assert!(requeued.result_ref.is_none());
}

#[test]
fn test_release_retried_after_store_outage() {
    let t = TestScheduler::with_defaults();
    let job = t.scheduler.submit(translation("docs")).unwrap();
    let grant = t.scheduler.try_acquire("w1", ALL_KINDS).unwrap().unwrap();

    t.store.set_available(false);
    let err = t
        .scheduler
        .release(&grant.token, Outcome::Succeeded, Some("out".into()), None)
        .unwrap_err();
    assert!(matches!(err, SchedulerError::StoreUnavailable(_)));
    // The lease survives the failed transition.
    assert!(t.scheduler.leases().active(&job.id).is_some());

    t.store.set_available(true);
    let done = t
        .scheduler
        .release(&grant.token, Outcome::Succeeded, Some("out".into()), None)
        .unwrap();
    assert_eq!(done.state, JobState::Succeeded);
    assert_eq!(done.result_ref.as_deref(), Some("out"));
    assert!(t.scheduler.leases().is_empty());
}

#[test]
fn test_failed_transition_on_release_is_reaped_after_expiry() {
    let (t, flaky) = TestScheduler::flaky(test_config());
    let job = t.scheduler.submit(translation("docs")).unwrap();
    let grant = t.scheduler.try_acquire("w1", ALL_KINDS).unwrap().unwrap();

    flaky.fail_next_updates(1);
    let err = t
        .scheduler
        .release(&grant.token, Outcome::Failed, None, Some("boom".into()))
        .unwrap_err();
    assert!(matches!(err, SchedulerError::StoreUnavailable(_)));

    // The worker gives up; the restored lease expires and the reaper requeues.
    t.clock.advance_ms(TRANSLATION_TTL_MS + 1);
    let report = t.scheduler.reap_expired().unwrap();
    assert_eq!(report.requeued, vec![job.id]);

    let requeued = t.scheduler.status(&job.id).unwrap();
    assert_eq!(requeued.state, JobState::Ready);
    assert_eq!(requeued.attempt_count, 1);
}

#[test]
fn test_sweep_error_keeps_expired_lease_for_next_sweep() {
    let (t, flaky) = TestScheduler::flaky(test_config());
    let job = t.scheduler.submit(translation("docs")).unwrap();
    t.scheduler.try_acquire("w1", ALL_KINDS).unwrap().unwrap();
    t.clock.advance_ms(TRANSLATION_TTL_MS + 1);

    flaky.fail_next_updates(1);
    let err = t.scheduler.reap_expired().unwrap_err();
    assert!(matches!(err, SchedulerError::StoreUnavailable(_)));
    assert_eq!(t.scheduler.leases().len(), 1);

    let report = t.scheduler.reap_expired().unwrap();
    assert_eq!(report.requeued, vec![job.id]);
    let requeued = t.scheduler.status(&job.id).unwrap();
    assert_eq!(requeued.state, JobState::Ready);
    assert_eq!(requeued.attempt_count, 1);
    assert!(t.scheduler.leases().is_empty());
}

#[test]
fn test_leased_job_without_lease_is_requeued() {
    let t = TestScheduler::with_defaults();
    let job = t.scheduler.submit(translation("docs")).unwrap();
    t.scheduler.try_acquire("w1", ALL_KINDS).unwrap().unwrap();
    t.scheduler.leases().revoke(&job.id).unwrap();

    // First sight only marks the job; a release may still be in flight.
    assert!(t.scheduler.reap_expired().unwrap().requeued.is_empty());
    assert_eq!(t.scheduler.status(&job.id).unwrap().state, JobState::Leased);

    let report = t.scheduler.reap_expired().unwrap();
    assert_eq!(report.requeued, vec![job.id]);
    let requeued = t.scheduler.status(&job.id).unwrap();
    assert_eq!(requeued.state, JobState::Ready);
    assert_eq!(requeued.attempt_count, 1);
    assert_eq!(requeued.failure_reason.as_deref(), Some("lease lost"));
}

#[test]
fn test_regranted_job_is_not_treated_as_orphan() {
    let t = TestScheduler::with_defaults();
    let job = t.scheduler.submit(translation("docs")).unwrap();
    t.scheduler.try_acquire("w1", ALL_KINDS).unwrap().unwrap();
    t.scheduler.leases().revoke(&job.id).unwrap();
    t.scheduler.reap_expired().unwrap();

    // A lease shows up again before the second sweep.
    t.scheduler
        .leases()
        .acquire(job.id, "w1", std::time::Duration::from_millis(TRANSLATION_TTL_MS))
        .unwrap();
    assert!(t.scheduler.reap_expired().unwrap().is_empty());
    assert_eq!(t.scheduler.status(&job.id).unwrap().state, JobState::Leased);
}

#[test]
fn test_stale_worker_cannot_release_after_regrant() {
    let t = TestScheduler::with_defaults();
    let job = t.scheduler.submit(translation("docs")).unwrap();
    let old = t.scheduler.try_acquire("slow", ALL_KINDS).unwrap().unwrap();

    t.clock.advance_ms(TRANSLATION_TTL_MS + 1);
    t.scheduler.reap_expired().unwrap();
    let new = t.scheduler.try_acquire("fast", ALL_KINDS).unwrap().unwrap();
    assert_eq!(new.job_id, job.id);
    assert_eq!(new.attempt_count, 1);

    let err = t
        .scheduler
        .release(&old.token, Outcome::Succeeded, Some("stale".into()), None)
        .unwrap_err();
    assert!(err.is_lease_lost());

    let current = t.scheduler.status(&job.id).unwrap();
    assert_eq!(current.state, JobState::Leased);
    assert_eq!(current.worker_id.as_deref(), Some("fast"));
    assert!(current.result_ref.is_none());
}

#[test]
fn test_failed_releases_exhaust_attempts() {
    let t = TestScheduler::new(test_config().with_max_attempts(2));
    let job = t.scheduler.submit(translation("docs")).unwrap();

    for expected in [JobState::Ready, JobState::Failed] {
        let grant = t.scheduler.try_acquire("w1", ALL_KINDS).unwrap().unwrap();
        let released = t
            .scheduler
            .release(&grant.token, Outcome::Failed, None, Some("compile error".into()))
            .unwrap();
        assert_eq!(released.state, expected);
    }

    let failed = t.scheduler.status(&job.id).unwrap();
    assert_eq!(failed.attempt_count, 2);
    assert_eq!(failed.attempt_count, failed.max_attempts);
    assert_eq!(failed.failure_reason.as_deref(), Some("compile error"));
    assert!(t.scheduler.try_acquire("w1", ALL_KINDS).unwrap().is_none());
}

#[test]
fn test_expiries_exhaust_attempts() {
    let t = TestScheduler::new(test_config().with_max_attempts(2));
    let job = t.scheduler.submit(translation("docs")).unwrap();

    t.scheduler.try_acquire("w1", ALL_KINDS).unwrap().unwrap();
    t.clock.advance_ms(TRANSLATION_TTL_MS + 1);
    assert_eq!(t.scheduler.reap_expired().unwrap().requeued, vec![job.id]);

    t.scheduler.try_acquire("w2", ALL_KINDS).unwrap().unwrap();
    t.clock.advance_ms(TRANSLATION_TTL_MS + 1);
    assert_eq!(t.scheduler.reap_expired().unwrap().failed, vec![job.id]);

    let failed = t.scheduler.status(&job.id).unwrap();
    assert_eq!(failed.state, JobState::Failed);
    assert_eq!(failed.attempt_count, 2);
    assert_eq!(failed.failure_reason.as_deref(), Some("lease expired"));
}

#[test]
fn test_attempt_count_only_moves_on_lease_cycle_end() {
    let t = TestScheduler::with_defaults();
    let job = t.scheduler.submit(translation("docs")).unwrap();
    let grant = t.scheduler.try_acquire("w1", ALL_KINDS).unwrap().unwrap();
    t.scheduler.renew(&grant.token).unwrap();
    assert_eq!(t.scheduler.status(&job.id).unwrap().attempt_count, 0);

    t.scheduler
        .release(&grant.token, Outcome::Failed, None, None)
        .unwrap();
    let history = t.scheduler.history(&job.id).unwrap();
    for pair in history.windows(2) {
        let (before, after) = (&pair[0], &pair[1]);
        let bumped = after.attempt_count > before.attempt_count;
        let cycle_end = after.from_state == Some(JobState::Leased)
            && matches!(after.to_state, JobState::Ready | JobState::Failed);
        assert_eq!(bumped, cycle_end, "unexpected bump on {:?}", after);
    }
}

// =============================================================================
// Dependencies
// =============================================================================

#[test]
fn test_dependent_ready_only_after_success() {
    let t = TestScheduler::with_defaults();
    let a = t.scheduler.submit(translation("docs")).unwrap();
    let b = t.scheduler.submit(build("docs").depends_on(a.id)).unwrap();

    let grant = t.scheduler.try_acquire("w1", ALL_KINDS).unwrap().unwrap();
    t.scheduler
        .release(&grant.token, Outcome::Failed, None, None)
        .unwrap();
    assert_eq!(t.scheduler.status(&b.id).unwrap().state, JobState::Pending);

    let grant = t.scheduler.try_acquire("w1", ALL_KINDS).unwrap().unwrap();
    assert_eq!(grant.job_id, a.id);
    t.scheduler
        .release(&grant.token, Outcome::Succeeded, None, None)
        .unwrap();
    assert_eq!(t.scheduler.status(&b.id).unwrap().state, JobState::Ready);
}

#[test]
fn test_dependent_waits_for_all_dependencies() {
    let t = TestScheduler::with_defaults();
    let a1 = t.scheduler.submit(translation("docs")).unwrap();
    let a2 = t.scheduler.submit(translation("docs")).unwrap();
    let b = t
        .scheduler
        .submit(build("docs").depends_on(a1.id).depends_on(a2.id))
        .unwrap();

    let g1 = t.scheduler.try_acquire("w1", ALL_KINDS).unwrap().unwrap();
    let g2 = t.scheduler.try_acquire("w2", ALL_KINDS).unwrap().unwrap();
    t.scheduler
        .release(&g1.token, Outcome::Succeeded, None, None)
        .unwrap();
    assert_eq!(t.scheduler.status(&b.id).unwrap().state, JobState::Pending);

    t.scheduler
        .release(&g2.token, Outcome::Succeeded, None, None)
        .unwrap();
    assert_eq!(t.scheduler.status(&b.id).unwrap().state, JobState::Ready);
}

#[test]
fn test_lease_expiry_then_success_unblocks_dependent() {
    let t = TestScheduler::with_defaults();
    let a = t.scheduler.submit(translation("docs")).unwrap();
    let b = t.scheduler.submit(build("docs").depends_on(a.id)).unwrap();

    t.scheduler.try_acquire("w1", ALL_KINDS).unwrap().unwrap();
    t.clock.advance_ms(TRANSLATION_TTL_MS + 1);
    t.scheduler.reap_expired().unwrap();

    let a_now = t.scheduler.status(&a.id).unwrap();
    assert_eq!(a_now.state, JobState::Ready);
    assert_eq!(a_now.attempt_count, 1);

    let grant = t.scheduler.try_acquire("w2", ALL_KINDS).unwrap().unwrap();
    assert_eq!(grant.job_id, a.id);
    t.scheduler
        .release(&grant.token, Outcome::Succeeded, Some("out".into()), None)
        .unwrap();
    assert_eq!(t.scheduler.status(&b.id).unwrap().state, JobState::Ready);
}

#[test]
fn test_exhausted_dependency_fails_dependents_transitively() {
    let t = TestScheduler::new(test_config().with_max_attempts(1));
    let a = t.scheduler.submit(translation("docs")).unwrap();
    let b = t.scheduler.submit(build("docs").depends_on(a.id)).unwrap();
    let c = t.scheduler.submit(build("docs").depends_on(b.id)).unwrap();

    let grant = t.scheduler.try_acquire("w1", ALL_KINDS).unwrap().unwrap();
    t.scheduler
        .release(&grant.token, Outcome::Failed, None, Some("bad input".into()))
        .unwrap();

    let b = t.scheduler.status(&b.id).unwrap();
    let c = t.scheduler.status(&c.id).unwrap();
    assert_eq!(b.state, JobState::Failed);
    assert_eq!(c.state, JobState::Failed);
    assert!(b.failure_reason.unwrap().contains(&a.id.to_string()));
    assert_eq!(b.attempt_count, 0);
}

// =============================================================================
// Cancellation
// =============================================================================

#[test]
fn test_cancel_pending_fails_dependents() {
    let t = TestScheduler::with_defaults();
    let root = t.scheduler.submit(translation("docs")).unwrap();
    let a = t.scheduler.submit(translation("docs").depends_on(root.id)).unwrap();
    let b = t.scheduler.submit(build("docs").depends_on(a.id)).unwrap();
    assert_eq!(a.state, JobState::Pending);

    let cancelled = t.scheduler.cancel(&a.id).unwrap();
    assert_eq!(cancelled.state, JobState::Cancelled);

    let b = t.scheduler.status(&b.id).unwrap();
    assert_eq!(b.state, JobState::Failed);
    assert!(b.failure_reason.unwrap().contains("cancelled"));
}

#[test]
fn test_cancel_ready_removes_from_queue() {
    let t = TestScheduler::with_defaults();
    let job = t.scheduler.submit(translation("docs")).unwrap();
    t.scheduler.cancel(&job.id).unwrap();

    assert!(t.scheduler.try_acquire("w1", ALL_KINDS).unwrap().is_none());
}

#[test]
fn test_cancel_leased_reported_on_next_renew() {
    let t = TestScheduler::with_defaults();
    let job = t.scheduler.submit(translation("docs")).unwrap();
    let grant = t.scheduler.try_acquire("w1", ALL_KINDS).unwrap().unwrap();

    let cancelled = t.scheduler.cancel(&job.id).unwrap();
    assert_eq!(cancelled.state, JobState::Cancelled);

    let err = t.scheduler.renew(&grant.token).unwrap_err();
    assert!(matches!(err, SchedulerError::JobCancelled(id) if id == job.id));
    assert!(t.scheduler.leases().is_empty());
    assert_eq!(t.scheduler.status(&job.id).unwrap().state, JobState::Cancelled);
}

#[test]
fn test_release_after_cancel_keeps_cancelled() {
    let t = TestScheduler::with_defaults();
    let job = t.scheduler.submit(translation("docs")).unwrap();
    let grant = t.scheduler.try_acquire("w1", ALL_KINDS).unwrap().unwrap();
    t.scheduler.cancel(&job.id).unwrap();

    let released = t
        .scheduler
        .release(&grant.token, Outcome::Succeeded, Some("out".into()), None)
        .unwrap();
    assert_eq!(released.state, JobState::Cancelled);
    assert!(released.result_ref.is_none());
}

#[test]
fn test_cancel_is_idempotent_and_terminal_states_reject() {
    let t = TestScheduler::with_defaults();
    let job = t.scheduler.submit(translation("docs")).unwrap();
    t.scheduler.cancel(&job.id).unwrap();
    assert_eq!(
        t.scheduler.cancel(&job.id).unwrap().state,
        JobState::Cancelled
    );

    let done = t.scheduler.submit(translation("docs")).unwrap();
    let grant = t.scheduler.try_acquire("w1", ALL_KINDS).unwrap().unwrap();
    t.scheduler
        .release(&grant.token, Outcome::Succeeded, None, None)
        .unwrap();
    let err = t.scheduler.cancel(&done.id).unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidTransition { .. }));
}

#[test]
fn test_cancel_unknown_job() {
    let t = TestScheduler::with_defaults();
    let err = t.scheduler.cancel(&uuid::Uuid::new_v4()).unwrap_err();
    assert!(matches!(err, SchedulerError::JobNotFound(_)));
}

#[test]
fn test_reaper_drops_lease_of_cancelled_job() {
    let t = TestScheduler::with_defaults();
    let job = t.scheduler.submit(translation("docs")).unwrap();
    t.scheduler.try_acquire("w1", ALL_KINDS).unwrap().unwrap();
    t.scheduler.cancel(&job.id).unwrap();

    t.clock.advance_ms(TRANSLATION_TTL_MS + 1);
    let report = t.scheduler.reap_expired().unwrap();
    assert_eq!(report.dropped, 1);
    assert!(report.requeued.is_empty());
    assert_eq!(t.scheduler.status(&job.id).unwrap().state, JobState::Cancelled);
}

// =============================================================================
// Fairness
// =============================================================================

#[test]
fn test_round_robin_across_projects() {
    let t = TestScheduler::with_defaults();
    for _ in 0..3 {
        t.scheduler.submit(translation("alpha")).unwrap();
    }
    t.scheduler.submit(translation("beta")).unwrap();
    t.scheduler.submit(translation("gamma")).unwrap();

    let order: Vec<String> = std::iter::from_fn(|| {
        t.scheduler
            .try_acquire("w1", ALL_KINDS)
            .unwrap()
            .map(|g| g.project_id)
    })
    .collect();

    assert_eq!(order, ["alpha", "beta", "gamma", "alpha", "alpha"]);
}

#[test]
fn test_fairness_window_allows_streaks() {
    let t = TestScheduler::new(test_config().with_fairness_window(2));
    for _ in 0..3 {
        t.scheduler.submit(translation("alpha")).unwrap();
        t.scheduler.submit(translation("beta")).unwrap();
    }

    let order: Vec<String> = std::iter::from_fn(|| {
        t.scheduler
            .try_acquire("w1", ALL_KINDS)
            .unwrap()
            .map(|g| g.project_id)
    })
    .collect();

    assert_eq!(order, ["alpha", "alpha", "beta", "beta", "alpha", "beta"]);
}

#[test]
fn test_fifo_within_project() {
    let t = TestScheduler::with_defaults();
    let ids: Vec<_> = (0..4)
        .map(|_| t.scheduler.submit(translation("docs")).unwrap().id)
        .collect();

    let granted: Vec<_> = std::iter::from_fn(|| {
        t.scheduler
            .try_acquire("w1", ALL_KINDS)
            .unwrap()
            .map(|g| g.job_id)
    })
    .collect();
    assert_eq!(granted, ids);
}

// =============================================================================
// Maintenance, audit and telemetry
// =============================================================================

#[test]
fn test_history_records_every_transition() {
    let t = TestScheduler::with_defaults();
    let job = t.scheduler.submit(translation("docs")).unwrap();
    let grant = t.scheduler.try_acquire("w1", ALL_KINDS).unwrap().unwrap();
    t.scheduler
        .release(&grant.token, Outcome::Succeeded, None, None)
        .unwrap();

    let history = t.scheduler.history(&job.id).unwrap();
    let path: Vec<_> = history.iter().map(|e| (e.from_state, e.to_state)).collect();
    assert_eq!(
        path,
        vec![
            (None, JobState::Pending),
            (Some(JobState::Pending), JobState::Ready),
            (Some(JobState::Ready), JobState::Leased),
            (Some(JobState::Leased), JobState::Succeeded),
        ]
    );
    assert_eq!(history[2].worker_id.as_deref(), Some("w1"));
}

#[tokio::test]
async fn test_transitions_are_broadcast() {
    let t = TestScheduler::with_defaults();
    let mut events = t.scheduler.store().subscribe();

    let job = t.scheduler.submit(translation("docs")).unwrap();
    t.scheduler.cancel(&job.id).unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.job_id, job.id);
        assert_eq!(event.project_id, "docs");
        seen.push(event.to_state);
    }
    assert_eq!(
        seen,
        vec![JobState::Pending, JobState::Ready, JobState::Cancelled]
    );
}

#[test]
fn test_retention_removes_old_terminal_jobs() {
    let mut config = test_config();
    config.retention_ms = Some(10_000);
    let t = TestScheduler::new(config);

    let old = t.scheduler.submit(translation("docs")).unwrap();
    t.scheduler.cancel(&old.id).unwrap();
    t.clock.advance_ms(20_000);
    let live = t.scheduler.submit(translation("docs")).unwrap();

    let report = t.scheduler.reap_expired().unwrap();
    assert_eq!(report.removed, 1);
    assert!(matches!(
        t.scheduler.status(&old.id),
        Err(SchedulerError::JobNotFound(_))
    ));
    assert_eq!(t.scheduler.status(&live.id).unwrap().state, JobState::Ready);
}

#[test]
fn test_silent_workers_are_pruned() {
    let t = TestScheduler::with_defaults();
    t.scheduler.try_acquire("w1", ALL_KINDS).unwrap();
    assert_eq!(t.scheduler.workers().all().len(), 1);

    t.clock
        .advance_ms(t.scheduler.config().worker_timeout_ms + 1);
    t.scheduler.reap_expired().unwrap();
    assert!(t.scheduler.workers().all().is_empty());
}

#[test]
fn test_list_filters() {
    let t = TestScheduler::with_defaults();
    let a = t.scheduler.submit(translation("alpha")).unwrap();
    t.scheduler.submit(translation("beta")).unwrap();
    t.scheduler.cancel(&a.id).unwrap();

    let alpha = t
        .scheduler
        .list(&JobFilter {
            state: None,
            project_id: Some("alpha".into()),
        })
        .unwrap();
    assert_eq!(alpha.len(), 1);

    let ready = t
        .scheduler
        .list(&JobFilter {
            state: Some(JobState::Ready),
            project_id: None,
        })
        .unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].project_id, "beta");
}
