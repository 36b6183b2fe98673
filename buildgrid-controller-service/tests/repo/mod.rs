use assert2::{assert, check, let_assert};
use buildgrid_common::model::{now_utc, LogSeverity};
use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use test_r::test;
use uuid::Uuid;

use buildgrid_controller_service::repo::build::{
    BuildRecord, CancelOutcome, ClaimOutcome, OutcomeOutcome, RetryOutcome,
};
use buildgrid_controller_service::repo::token::OtpExchangeOutcome;
use buildgrid_controller_service::repo::worker::WorkerRecord;

use crate::common::repo_deps;

fn pending_build(id: Uuid, submitted_at: DateTime<Utc>) -> BuildRecord {
    BuildRecord {
        id,
        platform: "ios".to_string(),
        status: "pending".to_string(),
        worker_id: None,
        submitted_at,
        assigned_at: None,
        started_at: None,
        completed_at: None,
        source_path: format!("builds/{id}/source/bundle"),
        credentials_path: None,
        result_path: None,
        failure_reason: None,
        access_token: Uuid::new_v4(),
    }
}

fn idle_worker(id: Uuid, now: DateTime<Utc>) -> WorkerRecord {
    WorkerRecord {
        id,
        name: "test-worker".to_string(),
        capabilities: r#"{"platforms":["iOS"],"toolchains":{}}"#.to_string(),
        status: "idle".to_string(),
        session_token: Uuid::new_v4(),
        previous_session_token: None,
        session_expires_at: now + Duration::seconds(90),
        last_seen: now,
        completed_builds: 0,
        failed_builds: 0,
        created_at: now,
        shutdown_at: None,
    }
}

#[test]
async fn claim_follows_fifo_order_with_id_tiebreak() {
    let deps = repo_deps().await;
    let now = now_utc();

    let older = pending_build(Uuid::new_v4(), now - Duration::seconds(30));
    let tie_a = Uuid::from_u128(1);
    let tie_b = Uuid::from_u128(2);
    deps.build_repo.create(&older, "submitted").await.unwrap();
    deps.build_repo
        .create(&pending_build(tie_b, now - Duration::seconds(10)), "submitted")
        .await
        .unwrap();
    deps.build_repo
        .create(&pending_build(tie_a, now - Duration::seconds(10)), "submitted")
        .await
        .unwrap();

    let mut claimed = Vec::new();
    for _ in 0..3 {
        let worker_id = Uuid::new_v4();
        deps.worker_repo
            .create(&idle_worker(worker_id, now))
            .await
            .unwrap();
        let outcome = deps
            .build_repo
            .claim_oldest_pending(&worker_id, now, &Uuid::new_v4(), now + Duration::minutes(5))
            .await
            .unwrap();
        let_assert!(ClaimOutcome::Assigned(build) = outcome);
        claimed.push(build.id);
    }

    assert!(claimed == vec![older.id, tie_a, tie_b]);
}

#[test]
async fn claim_with_empty_queue_leaves_worker_idle() {
    let deps = repo_deps().await;
    let now = now_utc();
    let worker_id = Uuid::new_v4();
    deps.worker_repo
        .create(&idle_worker(worker_id, now))
        .await
        .unwrap();

    let outcome = deps
        .build_repo
        .claim_oldest_pending(&worker_id, now, &Uuid::new_v4(), now + Duration::minutes(5))
        .await
        .unwrap();

    let_assert!(ClaimOutcome::NothingPending = outcome);
    let worker = deps.worker_repo.get(&worker_id).await.unwrap().unwrap();
    check!(worker.status == "idle");
}

#[test]
async fn claim_by_busy_worker_is_rejected() {
    let deps = repo_deps().await;
    let now = now_utc();
    let worker_id = Uuid::new_v4();
    let mut worker = idle_worker(worker_id, now);
    worker.status = "building".to_string();
    deps.worker_repo.create(&worker).await.unwrap();
    deps.build_repo
        .create(&pending_build(Uuid::new_v4(), now), "submitted")
        .await
        .unwrap();

    let outcome = deps
        .build_repo
        .claim_oldest_pending(&worker_id, now, &Uuid::new_v4(), now + Duration::minutes(5))
        .await
        .unwrap();

    let_assert!(ClaimOutcome::WorkerNotIdle = outcome);
}

#[test]
async fn claim_records_worker_otp_and_log() {
    let deps = repo_deps().await;
    let now = now_utc();
    let worker_id = Uuid::new_v4();
    let otp = Uuid::new_v4();
    deps.worker_repo
        .create(&idle_worker(worker_id, now))
        .await
        .unwrap();
    let build = pending_build(Uuid::new_v4(), now);
    deps.build_repo.create(&build, "submitted").await.unwrap();

    let outcome = deps
        .build_repo
        .claim_oldest_pending(&worker_id, now, &otp, now + Duration::minutes(5))
        .await
        .unwrap();

    let_assert!(ClaimOutcome::Assigned(assigned) = outcome);
    check!(assigned.status == "assigned");
    check!(assigned.worker_id == Some(worker_id));
    check!(assigned.assigned_at == Some(now));

    let worker = deps.worker_repo.get(&worker_id).await.unwrap().unwrap();
    check!(worker.status == "building");

    let otp_record = deps.token_repo.get(&otp).await.unwrap().unwrap();
    check!(otp_record.class == "bootstrap_otp");
    check!(otp_record.build_id == build.id);
    check!(otp_record.worker_id == Some(worker_id));
    check!(!otp_record.consumed);

    let logs = deps.build_log_repo.query(&build.id, 10).await.unwrap();
    assert!(logs.len() == 2);
    check!(logs[0].message == "submitted");
    check!(logs[1].message.contains("assigned to worker"));
}

#[test]
async fn concurrent_claims_assign_each_build_exactly_once() {
    let deps = repo_deps().await;
    let now = now_utc();

    let build_count = 3;
    let worker_count = 6;
    let mut build_ids = Vec::new();
    for offset in 0..build_count {
        let build = pending_build(Uuid::new_v4(), now - Duration::seconds(60 - offset));
        deps.build_repo.create(&build, "submitted").await.unwrap();
        build_ids.push(build.id);
    }

    let mut worker_ids = Vec::new();
    for _ in 0..worker_count {
        let worker_id = Uuid::new_v4();
        deps.worker_repo
            .create(&idle_worker(worker_id, now))
            .await
            .unwrap();
        worker_ids.push(worker_id);
    }

    let claims = join_all(worker_ids.iter().map(|worker_id| {
        let build_repo = deps.build_repo.clone();
        async move {
            build_repo
                .claim_oldest_pending(worker_id, now, &Uuid::new_v4(), now + Duration::minutes(5))
                .await
                .unwrap()
        }
    }))
    .await;

    let mut assigned: Vec<Uuid> = claims
        .iter()
        .filter_map(|outcome| match outcome {
            ClaimOutcome::Assigned(build) => Some(build.id),
            _ => None,
        })
        .collect();
    let empty = claims
        .iter()
        .filter(|outcome| matches!(outcome, ClaimOutcome::NothingPending))
        .count();

    assigned.sort();
    assigned.dedup();
    assert!(assigned.len() == build_count as usize);
    assert!(empty == worker_count - build_count as usize);
    let mut expected = build_ids.clone();
    expected.sort();
    assert!(assigned == expected);
}

#[test]
async fn rotate_session_is_guarded_by_the_presented_token() {
    let deps = repo_deps().await;
    let now = now_utc();
    let worker_id = Uuid::new_v4();
    let worker = idle_worker(worker_id, now);
    deps.worker_repo.create(&worker).await.unwrap();

    let first_rotation = Uuid::new_v4();
    let rotated = deps
        .worker_repo
        .rotate_session(
            &worker_id,
            &worker.session_token,
            &first_rotation,
            now + Duration::seconds(90),
            now,
        )
        .await
        .unwrap();
    assert!(rotated);

    // replaying the original token must fail: it was rotated away
    let replayed = deps
        .worker_repo
        .rotate_session(
            &worker_id,
            &worker.session_token,
            &Uuid::new_v4(),
            now + Duration::seconds(90),
            now,
        )
        .await
        .unwrap();
    assert!(!replayed);

    let stored = deps.worker_repo.get(&worker_id).await.unwrap().unwrap();
    check!(stored.session_token == first_rotation);

    // the superseded value stays queryable so a replay classifies as expired
    let superseded = deps
        .worker_repo
        .get_by_previous_session_token(&worker.session_token)
        .await
        .unwrap();
    let_assert!(Some(superseded) = superseded);
    check!(superseded.id == worker_id);
}

#[test]
async fn otp_exchange_is_single_use() {
    let deps = repo_deps().await;
    let now = now_utc();
    let worker_id = Uuid::new_v4();
    let otp = Uuid::new_v4();
    deps.worker_repo
        .create(&idle_worker(worker_id, now))
        .await
        .unwrap();
    let build = pending_build(Uuid::new_v4(), now);
    deps.build_repo.create(&build, "submitted").await.unwrap();
    let_assert!(
        ClaimOutcome::Assigned(_) = deps
            .build_repo
            .claim_oldest_pending(&worker_id, now, &otp, now + Duration::minutes(5))
            .await
            .unwrap()
    );

    let first = deps
        .token_repo
        .exchange_otp(&otp, &build.id, &Uuid::new_v4(), now + Duration::hours(24), now)
        .await
        .unwrap();
    let_assert!(OtpExchangeOutcome::Exchanged(guest) = first);
    check!(guest.class == "guest");
    check!(guest.build_id == build.id);

    let second = deps
        .token_repo
        .exchange_otp(&otp, &build.id, &Uuid::new_v4(), now + Duration::hours(24), now)
        .await
        .unwrap();
    let_assert!(OtpExchangeOutcome::AlreadyConsumed = second);
}

#[test]
async fn otp_exchange_rejects_wrong_build_scope() {
    let deps = repo_deps().await;
    let now = now_utc();
    let worker_id = Uuid::new_v4();
    let otp = Uuid::new_v4();
    deps.worker_repo
        .create(&idle_worker(worker_id, now))
        .await
        .unwrap();
    let build = pending_build(Uuid::new_v4(), now);
    deps.build_repo.create(&build, "submitted").await.unwrap();
    let_assert!(
        ClaimOutcome::Assigned(_) = deps
            .build_repo
            .claim_oldest_pending(&worker_id, now, &otp, now + Duration::minutes(5))
            .await
            .unwrap()
    );

    let outcome = deps
        .token_repo
        .exchange_otp(
            &otp,
            &Uuid::new_v4(),
            &Uuid::new_v4(),
            now + Duration::hours(24),
            now,
        )
        .await
        .unwrap();

    // a scope mismatch must not consume the OTP
    let_assert!(OtpExchangeOutcome::Invalid = outcome);
    let stored = deps.token_repo.get(&otp).await.unwrap().unwrap();
    check!(!stored.consumed);
}

#[test]
async fn expired_otp_cannot_be_exchanged() {
    let deps = repo_deps().await;
    let now = now_utc();
    let worker_id = Uuid::new_v4();
    let otp = Uuid::new_v4();
    deps.worker_repo
        .create(&idle_worker(worker_id, now))
        .await
        .unwrap();
    let build = pending_build(Uuid::new_v4(), now);
    deps.build_repo.create(&build, "submitted").await.unwrap();
    let_assert!(
        ClaimOutcome::Assigned(_) = deps
            .build_repo
            .claim_oldest_pending(
                &worker_id,
                now - Duration::minutes(10),
                &otp,
                now - Duration::minutes(5)
            )
            .await
            .unwrap()
    );

    let outcome = deps
        .token_repo
        .exchange_otp(&otp, &build.id, &Uuid::new_v4(), now + Duration::hours(24), now)
        .await
        .unwrap();
    let_assert!(OtpExchangeOutcome::Invalid = outcome);
}

#[test]
async fn record_outcome_completes_build_and_frees_worker() {
    let deps = repo_deps().await;
    let now = now_utc();
    let worker_id = Uuid::new_v4();
    deps.worker_repo
        .create(&idle_worker(worker_id, now))
        .await
        .unwrap();
    let build = pending_build(Uuid::new_v4(), now);
    deps.build_repo.create(&build, "submitted").await.unwrap();
    let_assert!(
        ClaimOutcome::Assigned(_) = deps
            .build_repo
            .claim_oldest_pending(&worker_id, now, &Uuid::new_v4(), now + Duration::minutes(5))
            .await
            .unwrap()
    );

    let outcome = deps
        .build_repo
        .record_outcome(
            &build.id,
            &worker_id,
            true,
            Some(format!("builds/{}/result/artifact", build.id)),
            None,
            now,
        )
        .await
        .unwrap();

    let_assert!(OutcomeOutcome::Applied(completed) = outcome);
    check!(completed.status == "completed");
    check!(completed.completed_at == Some(now));
    check!(completed.result_path.is_some());

    let worker = deps.worker_repo.get(&worker_id).await.unwrap().unwrap();
    check!(worker.status == "idle");
    check!(worker.completed_builds == 1);
    check!(worker.failed_builds == 0);
}

#[test]
async fn record_outcome_rejects_the_wrong_worker() {
    let deps = repo_deps().await;
    let now = now_utc();
    let owner = Uuid::new_v4();
    let intruder = Uuid::new_v4();
    deps.worker_repo.create(&idle_worker(owner, now)).await.unwrap();
    deps.worker_repo
        .create(&idle_worker(intruder, now))
        .await
        .unwrap();
    let build = pending_build(Uuid::new_v4(), now);
    deps.build_repo.create(&build, "submitted").await.unwrap();
    let_assert!(
        ClaimOutcome::Assigned(_) = deps
            .build_repo
            .claim_oldest_pending(&owner, now, &Uuid::new_v4(), now + Duration::minutes(5))
            .await
            .unwrap()
    );

    let outcome = deps
        .build_repo
        .record_outcome(&build.id, &intruder, false, None, Some("nope".to_string()), now)
        .await
        .unwrap();

    let_assert!(OutcomeOutcome::WrongWorker = outcome);
    let stored = deps.build_repo.get(&build.id).await.unwrap().unwrap();
    check!(stored.status == "assigned");
}

#[test]
async fn duplicate_outcome_reports_are_rejected() {
    let deps = repo_deps().await;
    let now = now_utc();
    let worker_id = Uuid::new_v4();
    deps.worker_repo
        .create(&idle_worker(worker_id, now))
        .await
        .unwrap();
    let build = pending_build(Uuid::new_v4(), now);
    deps.build_repo.create(&build, "submitted").await.unwrap();
    let_assert!(
        ClaimOutcome::Assigned(_) = deps
            .build_repo
            .claim_oldest_pending(&worker_id, now, &Uuid::new_v4(), now + Duration::minutes(5))
            .await
            .unwrap()
    );
    let_assert!(
        OutcomeOutcome::Applied(_) = deps
            .build_repo
            .record_outcome(&build.id, &worker_id, false, None, Some("boom".to_string()), now)
            .await
            .unwrap()
    );

    let duplicate = deps
        .build_repo
        .record_outcome(&build.id, &worker_id, false, None, Some("boom".to_string()), now)
        .await
        .unwrap();

    let_assert!(OutcomeOutcome::InvalidStatus(status) = duplicate);
    check!(status == "failed");
}

#[test]
async fn terminal_transition_revokes_build_tokens() {
    let deps = repo_deps().await;
    let now = now_utc();
    let worker_id = Uuid::new_v4();
    let otp = Uuid::new_v4();
    deps.worker_repo
        .create(&idle_worker(worker_id, now))
        .await
        .unwrap();
    let build = pending_build(Uuid::new_v4(), now);
    deps.build_repo.create(&build, "submitted").await.unwrap();
    let_assert!(
        ClaimOutcome::Assigned(_) = deps
            .build_repo
            .claim_oldest_pending(&worker_id, now, &otp, now + Duration::minutes(5))
            .await
            .unwrap()
    );
    let guest_secret = Uuid::new_v4();
    let_assert!(
        OtpExchangeOutcome::Exchanged(_) = deps
            .token_repo
            .exchange_otp(&otp, &build.id, &guest_secret, now + Duration::hours(24), now)
            .await
            .unwrap()
    );

    let_assert!(
        OutcomeOutcome::Applied(_) = deps
            .build_repo
            .record_outcome(
                &build.id,
                &worker_id,
                true,
                Some(format!("builds/{}/result/artifact", build.id)),
                None,
                now
            )
            .await
            .unwrap()
    );

    check!(deps.token_repo.get(&guest_secret).await.unwrap().is_none());
    check!(deps.token_repo.get(&otp).await.unwrap().is_none());
}

#[test]
async fn cancel_is_only_legal_from_pending() {
    let deps = repo_deps().await;
    let now = now_utc();
    let build = pending_build(Uuid::new_v4(), now);
    deps.build_repo.create(&build, "submitted").await.unwrap();

    let cancelled = deps.build_repo.cancel(&build.id, now).await.unwrap();
    let_assert!(CancelOutcome::Cancelled(record) = cancelled);
    check!(record.status == "cancelled");
    check!(record.completed_at == Some(now));

    let again = deps.build_repo.cancel(&build.id, now).await.unwrap();
    let_assert!(CancelOutcome::InvalidStatus(status) = again);
    check!(status == "cancelled");

    let missing = deps.build_repo.cancel(&Uuid::new_v4(), now).await.unwrap();
    let_assert!(CancelOutcome::NotFound = missing);
}

#[test]
async fn retry_requires_a_failed_original() {
    let deps = repo_deps().await;
    let now = now_utc();
    let original = pending_build(Uuid::new_v4(), now);
    deps.build_repo.create(&original, "submitted").await.unwrap();

    let premature = deps
        .build_repo
        .create_retry(&original.id, &pending_build(Uuid::new_v4(), now), now)
        .await
        .unwrap();
    let_assert!(RetryOutcome::InvalidStatus(status) = premature);
    check!(status == "pending");

    let worker_id = Uuid::new_v4();
    deps.worker_repo
        .create(&idle_worker(worker_id, now))
        .await
        .unwrap();
    let_assert!(
        ClaimOutcome::Assigned(_) = deps
            .build_repo
            .claim_oldest_pending(&worker_id, now, &Uuid::new_v4(), now + Duration::minutes(5))
            .await
            .unwrap()
    );
    let_assert!(
        OutcomeOutcome::Applied(_) = deps
            .build_repo
            .record_outcome(&original.id, &worker_id, false, None, Some("boom".to_string()), now)
            .await
            .unwrap()
    );

    let retry = pending_build(Uuid::new_v4(), now);
    let_assert!(
        RetryOutcome::Created = deps
            .build_repo
            .create_retry(&original.id, &retry, now)
            .await
            .unwrap()
    );

    let original_logs = deps.build_log_repo.query(&original.id, 10).await.unwrap();
    check!(original_logs
        .iter()
        .any(|log| log.message.contains("retried as build")));
    let retry_logs = deps.build_log_repo.query(&retry.id, 10).await.unwrap();
    check!(retry_logs
        .iter()
        .any(|log| log.message.contains("retry of build")));
}

#[test]
async fn mark_offline_releases_builds_with_a_reassignment_log() {
    let deps = repo_deps().await;
    let now = now_utc();
    let worker_id = Uuid::new_v4();
    deps.worker_repo
        .create(&idle_worker(worker_id, now))
        .await
        .unwrap();
    let build = pending_build(Uuid::new_v4(), now);
    deps.build_repo.create(&build, "submitted").await.unwrap();
    let_assert!(
        ClaimOutcome::Assigned(_) = deps
            .build_repo
            .claim_oldest_pending(&worker_id, now, &Uuid::new_v4(), now + Duration::minutes(5))
            .await
            .unwrap()
    );

    let released = deps
        .worker_repo
        .mark_offline_and_release(&worker_id, None, now)
        .await
        .unwrap();

    assert!(released == vec![build.id]);
    let worker = deps.worker_repo.get(&worker_id).await.unwrap().unwrap();
    check!(worker.status == "offline");
    check!(worker.shutdown_at.is_none());

    let stored = deps.build_repo.get(&build.id).await.unwrap().unwrap();
    check!(stored.status == "pending");
    check!(stored.worker_id.is_none());
    check!(stored.assigned_at.is_none());

    let logs = deps.build_log_repo.query(&build.id, 10).await.unwrap();
    let_assert!(Some(last) = logs.last());
    check!(last.severity == LogSeverity::Warn.as_db_str());
    check!(last.message.contains("reassigned"));
}

#[test]
async fn stale_worker_detection_uses_last_seen() {
    let deps = repo_deps().await;
    let now = now_utc();
    let fresh = Uuid::new_v4();
    let stale = Uuid::new_v4();
    deps.worker_repo.create(&idle_worker(fresh, now)).await.unwrap();
    let mut stale_worker = idle_worker(stale, now);
    stale_worker.last_seen = now - Duration::minutes(10);
    deps.worker_repo.create(&stale_worker).await.unwrap();

    let found = deps
        .worker_repo
        .stale_workers(now - Duration::minutes(5))
        .await
        .unwrap();

    assert!(found.len() == 1);
    check!(found[0].id == stale);
}

#[test]
async fn expired_tokens_are_swept() {
    let deps = repo_deps().await;
    let now = now_utc();
    let worker_id = Uuid::new_v4();
    let expired_otp = Uuid::new_v4();
    let live_otp = Uuid::new_v4();
    deps.worker_repo
        .create(&idle_worker(worker_id, now))
        .await
        .unwrap();

    let first = pending_build(Uuid::new_v4(), now - Duration::seconds(10));
    deps.build_repo.create(&first, "submitted").await.unwrap();
    let_assert!(
        ClaimOutcome::Assigned(_) = deps
            .build_repo
            .claim_oldest_pending(&worker_id, now, &expired_otp, now - Duration::minutes(1))
            .await
            .unwrap()
    );

    let second_worker = Uuid::new_v4();
    deps.worker_repo
        .create(&idle_worker(second_worker, now))
        .await
        .unwrap();
    let second = pending_build(Uuid::new_v4(), now);
    deps.build_repo.create(&second, "submitted").await.unwrap();
    let_assert!(
        ClaimOutcome::Assigned(_) = deps
            .build_repo
            .claim_oldest_pending(&second_worker, now, &live_otp, now + Duration::minutes(5))
            .await
            .unwrap()
    );

    let dropped = deps.token_repo.delete_expired(now).await.unwrap();

    assert!(dropped == 1);
    check!(deps.token_repo.get(&expired_otp).await.unwrap().is_none());
    check!(deps.token_repo.get(&live_otp).await.unwrap().is_some());
}

#[test]
async fn random_legal_walks_only_reach_legal_states() {
    let deps = repo_deps().await;
    fastrand::seed(7);

    for _ in 0..20 {
        let now = now_utc();
        let worker_id = Uuid::new_v4();
        deps.worker_repo
            .create(&idle_worker(worker_id, now))
            .await
            .unwrap();
        let build = pending_build(Uuid::new_v4(), now);
        deps.build_repo.create(&build, "submitted").await.unwrap();

        // walk a random legal path through the transition graph
        match fastrand::u8(0..4) {
            0 => {
                let_assert!(
                    CancelOutcome::Cancelled(_) =
                        deps.build_repo.cancel(&build.id, now).await.unwrap()
                );
            }
            step => {
                let_assert!(
                    ClaimOutcome::Assigned(_) = deps
                        .build_repo
                        .claim_oldest_pending(
                            &worker_id,
                            now,
                            &Uuid::new_v4(),
                            now + Duration::minutes(5)
                        )
                        .await
                        .unwrap()
                );
                if fastrand::bool() {
                    deps.build_repo.mark_building(&build.id, now).await.unwrap();
                }
                if step == 1 {
                    let success = fastrand::bool();
                    let result_path =
                        success.then(|| format!("builds/{}/result/artifact", build.id));
                    let failure = (!success).then(|| "failed".to_string());
                    let_assert!(
                        OutcomeOutcome::Applied(_) = deps
                            .build_repo
                            .record_outcome(
                                &build.id,
                                &worker_id,
                                success,
                                result_path,
                                failure,
                                now
                            )
                            .await
                            .unwrap()
                    );
                } else if step == 2 {
                    deps.worker_repo
                        .mark_offline_and_release(&worker_id, None, now)
                        .await
                        .unwrap();
                    // take the released build back out of the queue so the
                    // next walk starts from an empty queue
                    let_assert!(
                        CancelOutcome::Cancelled(_) =
                            deps.build_repo.cancel(&build.id, now).await.unwrap()
                    );
                }
            }
        }

        let stored = deps.build_repo.get(&build.id).await.unwrap().unwrap();
        // every reachable state is a known status with a consistent worker
        check!(matches!(
            stored.status.as_str(),
            "pending" | "assigned" | "building" | "completed" | "failed" | "cancelled"
        ));
        if stored.status == "pending" {
            check!(stored.worker_id.is_none());
            check!(stored.assigned_at.is_none());
        }
        if matches!(stored.status.as_str(), "assigned" | "building") {
            check!(stored.worker_id.is_some());
        }
        if matches!(stored.status.as_str(), "completed" | "failed" | "cancelled") {
            check!(stored.completed_at.is_some());
        }
    }

    let audit = deps.build_repo.audit_counts().await.unwrap();
    check!(audit.pending_with_worker == 0);
    check!(audit.in_progress_without_worker == 0);
}

#[test]
async fn queue_counts_track_statuses() {
    let deps = repo_deps().await;
    let now = now_utc();
    deps.build_repo
        .create(&pending_build(Uuid::new_v4(), now), "submitted")
        .await
        .unwrap();
    deps.build_repo
        .create(&pending_build(Uuid::new_v4(), now), "submitted")
        .await
        .unwrap();
    let worker_id = Uuid::new_v4();
    deps.worker_repo
        .create(&idle_worker(worker_id, now))
        .await
        .unwrap();
    let_assert!(
        ClaimOutcome::Assigned(_) = deps
            .build_repo
            .claim_oldest_pending(&worker_id, now, &Uuid::new_v4(), now + Duration::minutes(5))
            .await
            .unwrap()
    );

    let counts = deps.build_repo.queue_counts().await.unwrap();
    check!(counts.pending == 1);
    check!(counts.active == 1);
}
