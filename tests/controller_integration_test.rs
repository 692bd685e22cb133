//! End-to-end reconciliation behavior against in-memory adapters.

mod common;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{eventually, feature_set, source, store, Harness};
use sluice::domain::models::{
    ControllerVersion, DeliveryState, FeatureSet, FeatureSetRef, FeatureSetSpecAck, FeatureSetStatus, Job,
    JobStatus, ValueType, VERSION_LABEL,
};
use sluice::domain::ports::{Catalog, JobManager, JobRepository};
use sluice::services::job_identity::identity;
use sluice::services::{AckConsumer, AckOutcome, ControllerDaemon, ControllerDaemonConfig};

fn reference(name: &str) -> FeatureSetRef {
    FeatureSetRef::new(common::PROJECT, name)
}

#[tokio::test]
async fn test_new_feature_set_gets_exactly_one_job() {
    let h = Harness::new().await;
    h.catalog.apply_feature_set(feature_set("test", "events")).await;

    let report = h.tick().await;
    assert_eq!(report.started.len(), 1);

    let jobs = h.running().await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].stores.len(), 1);
    assert_eq!(jobs[0].delivery_statuses.len(), 1);
    assert!(jobs[0].feature_sets.contains(&reference("test")));
}

#[tokio::test]
async fn test_added_store_grows_existing_job() {
    let h = Harness::with_options(ControllerVersion::new(1, 0, 0), &["online", "offline"]).await;
    h.catalog.apply_feature_set(feature_set("test", "events")).await;
    h.tick().await;
    let before = h.running().await.remove(0);
    assert_eq!(before.stores.len(), 1);

    h.catalog.apply_store(store("offline")).await;
    let report = h.tick().await;
    assert_eq!(report.updated, vec![before.id.clone()]);
    assert!(report.started.is_empty());

    let jobs = h.running().await;
    assert_eq!(jobs.len(), 1);
    let after = &jobs[0];
    assert_eq!(after.id, before.id);
    assert_eq!(after.stores.len(), 2);
    assert_eq!(after.delivery_statuses.len(), 1);
}

#[tokio::test]
async fn test_stale_ack_leaves_newer_version_pending() {
    let h = Harness::new().await;
    h.catalog.apply_feature_set(feature_set("test", "events")).await;
    h.tick().await;
    let job = h.running().await.remove(0);

    assert_eq!(h.ack("test", 1, &job.id).await, AckOutcome::Applied);
    assert_eq!(h.feature_set("test").await.status(), FeatureSetStatus::Ready);

    h.catalog
        .apply_feature_set(feature_set("test", "events").with_feature("rating", ValueType::Double))
        .await;
    h.tick().await;
    let fs = h.feature_set("test").await;
    assert_eq!(fs.version(), 2);
    assert_eq!(fs.status(), FeatureSetStatus::Pending);

    assert_eq!(h.ack("test", 1, &job.id).await, AckOutcome::Stale);
    let fs = h.feature_set("test").await;
    assert_eq!(fs.version(), 2);
    assert_eq!(fs.status(), FeatureSetStatus::Pending);

    assert_eq!(h.ack("test", 2, &job.id).await, AckOutcome::Applied);
    assert_eq!(h.feature_set("test").await.status(), FeatureSetStatus::Ready);
    let entry = h.job(&job.id).await.delivery_statuses[&reference("test")].clone();
    assert_eq!(entry.delivered_version, 2);
    assert_eq!(entry.status, DeliveryState::Delivered);
}

#[tokio::test]
async fn test_source_change_replaces_job_and_republishes() {
    let h = Harness::new().await;
    h.catalog.apply_feature_set(feature_set("test", "events")).await;
    h.tick().await;
    let old = h.running().await.remove(0);

    h.catalog.apply_feature_set(feature_set("test", "events-v2")).await;
    h.tick().await;

    assert_eq!(h.job(&old.id).await.status, JobStatus::Aborted);
    assert_eq!(
        h.manager.get_job_status(&old).await.unwrap(),
        JobStatus::Aborted
    );

    let jobs = h.running().await;
    assert_eq!(jobs.len(), 1);
    assert_ne!(jobs[0].id, old.id);
    assert!(jobs[0].source.same_as(&source("events-v2")));

    assert_eq!(h.bus.published_versions("default/test").await, vec![1, 2]);
    assert_eq!(h.feature_set("test").await.version(), 2);
}

#[tokio::test]
async fn test_outdated_version_label_is_upgraded() {
    let h = Harness::new().await;
    h.catalog.apply_feature_set(feature_set("test", "events")).await;

    let stale = Job::new(
        identity(&source("events")).unwrap(),
        source("events"),
        BTreeMap::from([("online".to_string(), store("online"))]),
        BTreeSet::new(),
        ControllerVersion::new(0, 9, 9),
    )
    .with_id("legacy-job")
    .with_label(VERSION_LABEL, "0-9-9");
    let stale = h.manager.start_job(stale).await.unwrap();
    h.repository.add(&stale).await.unwrap();

    let report = h.tick().await;
    assert_eq!(report.upgraded, vec!["legacy-job".to_string()]);

    assert_eq!(h.job("legacy-job").await.status, JobStatus::Aborted);
    let jobs = h.running().await;
    assert_eq!(jobs.len(), 1);
    let replacement = &jobs[0];
    assert_eq!(replacement.source, stale.source);
    assert_eq!(replacement.stores, stale.stores);
    assert_eq!(
        replacement.labels.get(VERSION_LABEL).map(String::as_str),
        Some("1-0-0")
    );
    assert_eq!(replacement.controller_version, ControllerVersion::new(1, 0, 0));
}

#[tokio::test]
async fn test_convergence_is_idempotent() {
    let h = Harness::new().await;
    h.catalog.apply_feature_set(feature_set("a", "events")).await;
    h.catalog.apply_feature_set(feature_set("b", "events")).await;
    h.catalog.apply_feature_set(feature_set("c", "clicks")).await;

    let first = h.tick().await;
    assert_eq!(first.started.len(), 2);
    let starts = h.manager.calls().starts;

    for _ in 0..3 {
        let report = h.tick().await;
        assert!(!report.changed(), "unexpected actions: {report:?}");
    }
    assert_eq!(h.manager.calls().starts, starts);
    assert_eq!(h.bus.published().await.len(), 3);
}

#[tokio::test]
async fn test_restart_replaces_running_job() {
    let h = Harness::new().await;
    h.catalog.apply_feature_set(feature_set("test", "events")).await;
    h.tick().await;
    let old = h.running().await.remove(0);

    h.reconciler.request_restart(&old.id).await.unwrap();
    let report = h.tick().await;
    assert_eq!(report.upgraded, vec![old.id.clone()]);

    let jobs = h.running().await;
    assert_eq!(jobs.len(), 1);
    assert_ne!(jobs[0].id, old.id);
    assert_eq!(jobs[0].identity, old.identity);
    assert_eq!(h.job(&old.id).await.status, JobStatus::Aborted);

    assert!(h.reconciler.request_restart(&old.id).await.is_err());
    assert!(h.reconciler.request_restart("missing").await.is_err());
}

#[tokio::test]
async fn test_unwanted_feature_set_is_ignored() {
    let h = Harness::new().await;
    h.catalog
        .apply_feature_set(FeatureSet::new("sandbox", "test", source("events")))
        .await;

    let report = h.tick().await;
    assert!(!report.changed());
    assert!(h.repository.find_all().await.unwrap().is_empty());
    assert!(h.bus.published().await.is_empty());
}

#[tokio::test]
async fn test_externally_stopped_job_is_restored() {
    let h = Harness::new().await;
    h.catalog.apply_feature_set(feature_set("test", "events")).await;
    h.tick().await;
    let old = h.running().await.remove(0);

    assert!(h.manager.stop_externally(&old.id).await);
    let report = h.tick().await;
    assert_eq!(report.reaped, vec![old.id.clone()]);
    assert_eq!(report.started.len(), 1);

    let jobs = h.running().await;
    assert_eq!(jobs.len(), 1);
    assert_ne!(jobs[0].id, old.id);
    assert_eq!(h.job(&old.id).await.status, JobStatus::Aborted);
}

#[tokio::test]
async fn test_ack_from_replaced_job_is_orphaned() {
    let h = Harness::new().await;
    h.catalog.apply_feature_set(feature_set("test", "events")).await;
    h.tick().await;
    let old = h.running().await.remove(0);

    h.catalog.apply_feature_set(feature_set("test", "events-v2")).await;
    h.tick().await;

    assert_eq!(h.ack("test", 2, &old.id).await, AckOutcome::Orphaned);
    assert_eq!(h.feature_set("test").await.status(), FeatureSetStatus::Pending);
}

/// Daemon, ack consumer and a fake ingestion job acking every spec it sees.
#[tokio::test]
async fn test_daemon_drives_feature_set_to_ready() {
    let h = Harness::new().await;
    let mut specs = h.bus.subscribe();
    let acks = h.bus.ack_sender();
    let responder = tokio::spawn(async move {
        while let Ok(update) = specs.recv().await {
            let ack = FeatureSetSpecAck::new(
                update.key(),
                update.version(),
                update.job_id.clone(),
            );
            if acks.send(ack).await.is_err() {
                break;
            }
        }
    });

    let consumer = AckConsumer::new(h.bus.clone(), h.tracker.clone());
    let consumer_task = consumer.spawn();
    let daemon = ControllerDaemon::new(
        h.reconciler.clone(),
        ControllerDaemonConfig::with_interval(Duration::from_millis(20)),
    );
    let handle = daemon.handle();
    let _events = daemon.run();

    h.catalog.apply_feature_set(feature_set("test", "events")).await;
    let ready = |version: u64| {
        let catalog = h.catalog.clone();
        move || {
            let catalog = catalog.clone();
            async move {
                catalog
                    .get_feature_set(&reference("test"))
                    .await
                    .ok()
                    .flatten()
                    .is_some_and(|fs| fs.version() == version && fs.status() == FeatureSetStatus::Ready)
            }
        }
    };
    assert!(eventually(Duration::from_secs(5), ready(1)).await);

    h.catalog
        .apply_feature_set(feature_set("test", "events").with_feature("rating", ValueType::Double))
        .await;
    assert!(eventually(Duration::from_secs(5), ready(2)).await);

    let job = h.running().await.remove(0);
    assert_eq!(job.delivery_statuses[&reference("test")].delivered_version, 2);
    assert!(h.tracker.stats().applied >= 2);

    handle.stop();
    consumer_task.abort();
    responder.abort();
    let status = handle.status().await;
    assert_eq!(status.failed_ticks, 0);
    assert!(status.jobs_started >= 1);
}

/// Operator requests and catalog churn never leave two running jobs for
/// one source.
#[tokio::test]
async fn test_at_most_one_running_job_per_source_under_churn() {
    let h = Harness::with_options(ControllerVersion::new(1, 0, 0), &["online", "offline"]).await;
    h.catalog.apply_feature_set(feature_set("a", "events")).await;
    h.catalog.apply_feature_set(feature_set("b", "events")).await;
    h.tick().await;

    let first = h.running().await.remove(0);
    h.reconciler.request_restart(&first.id).await.unwrap();
    h.catalog.apply_store(store("offline")).await;
    h.catalog.apply_feature_set(feature_set("b", "clicks")).await;
    h.tick().await;

    h.catalog.remove_store("offline").await;
    h.catalog.apply_feature_set(feature_set("a", "clicks")).await;
    h.tick().await;

    let jobs = h.running().await;
    let identities: HashSet<&str> = jobs.iter().map(|j| j.identity.as_str()).collect();
    assert_eq!(identities.len(), jobs.len());
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].feature_sets.len(), 2);
    assert!(jobs[0].source.same_as(&source("clicks")));

    let runtime = h.manager.list_running_jobs().await.unwrap();
    assert_eq!(runtime.len(), 1);
    assert!(!h.tick().await.changed());
}

/// Acks racing the replacement of the job they name are either applied
/// while it still runs, or rejected. Nothing lands on it after the abort.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_acks_racing_replacement_never_touch_aborted_job() {
    let h = Harness::new().await;
    h.catalog.apply_feature_set(feature_set("test", "events")).await;
    h.tick().await;
    let old = h.running().await.remove(0);

    let stop = Arc::new(AtomicBool::new(false));
    let mut ackers = Vec::new();
    for _ in 0..4 {
        let tracker = h.tracker.clone();
        let stop = stop.clone();
        let job_id = old.id.clone();
        ackers.push(tokio::spawn(async move {
            let ack = FeatureSetSpecAck::new(format!("{}/test", common::PROJECT), 1, job_id);
            let mut outcomes = Vec::new();
            while !stop.load(Ordering::Acquire) {
                outcomes.push(tracker.handle_ack(&ack).await.unwrap());
                tokio::task::yield_now().await;
            }
            outcomes
        }));
    }

    h.catalog.apply_feature_set(feature_set("test", "events-v2")).await;
    h.tick().await;
    let after_abort = h.job(&old.id).await;
    assert_eq!(after_abort.status, JobStatus::Aborted);

    tokio::time::sleep(Duration::from_millis(50)).await;
    stop.store(true, Ordering::Release);

    let mut applied = 0;
    for acker in ackers {
        let outcomes = acker.await.unwrap();
        let first_rejection = outcomes
            .iter()
            .position(|o| matches!(o, AckOutcome::Orphaned | AckOutcome::Stale));
        if let Some(index) = first_rejection {
            assert!(
                outcomes[index..]
                    .iter()
                    .all(|o| matches!(o, AckOutcome::Orphaned | AckOutcome::Stale)),
                "ack accepted after the job was replaced: {outcomes:?}"
            );
        }
        applied += outcomes.iter().filter(|o| **o == AckOutcome::Applied).count();
    }

    // Entries are frozen once the record left RUNNING.
    let final_record = h.job(&old.id).await;
    assert_eq!(final_record.status, JobStatus::Aborted);
    assert_eq!(final_record.delivery_statuses, after_abort.delivery_statuses);
    let entry = &final_record.delivery_statuses[&reference("test")];
    if applied == 0 {
        assert_ne!(entry.status, DeliveryState::Delivered);
    } else {
        assert_eq!(entry.delivered_version, 1);
        assert_eq!(entry.status, DeliveryState::Delivered);
    }

    let fs = h.feature_set("test").await;
    assert_eq!(fs.version(), 2);
    assert_eq!(fs.status(), FeatureSetStatus::Pending);
}
