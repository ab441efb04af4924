use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use streamward_common::{MonitorRecord, MonitorStatus, TermSignal};
use uuid::Uuid;

use super::fixtures::{after_grace, privileged, standard, TestHarness};
use super::{ControlError, RestartOutcome};
use crate::upstream::{ChannelStatus, MockStatusProvider, StatusError};

fn soon() -> chrono::DateTime<Utc> {
    Utc::now() + chrono::Duration::seconds(5)
}

// Control plane

#[tokio::test]
async fn test_start_creates_running_record() {
    let h = TestHarness::new();
    let record = h
        .supervisor
        .start_monitor(&standard("u1"), "https://www.twitch.tv/Alpha")
        .await
        .unwrap();

    assert_eq!(record.channel, "alpha");
    assert_eq!(record.status, MonitorStatus::Running);
    assert_eq!(record.restart_count, 0);
    let pid = record.process_handle.unwrap();
    assert!(h.table.is_alive(pid));

    let stored = h.record(&record.id).unwrap();
    assert_eq!(stored.process_handle, Some(pid));
    assert_eq!(h.launcher.launch_count(), 1);
}

#[tokio::test]
async fn test_second_channel_for_standard_owner_is_rejected() {
    let h = TestHarness::new();
    h.supervisor.start_monitor(&standard("u1"), "alpha").await.unwrap();

    let err = h
        .supervisor
        .start_monitor(&standard("u1"), "beta")
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::Policy(_)), "got {err:?}");

    let records = h.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].channel, "alpha");
    assert_eq!(h.launcher.launch_count(), 1);
}

#[tokio::test]
async fn test_same_channel_twice_for_standard_owner_is_rejected() {
    let h = TestHarness::new();
    h.supervisor.start_monitor(&standard("u1"), "alpha").await.unwrap();
    let err = h
        .supervisor
        .start_monitor(&standard("u1"), "alpha")
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::Policy(_)));
}

#[tokio::test]
async fn test_privileged_owner_is_exempt() {
    let h = TestHarness::new();
    let admin = privileged("ops");

    let first = h.supervisor.start_monitor(&admin, "alpha").await.unwrap();
    h.supervisor.start_monitor(&admin, "beta").await.unwrap();
    let again = h.supervisor.start_monitor(&admin, "alpha").await.unwrap();

    assert_eq!(again.id, first.id);
    assert_eq!(h.records().len(), 2);
    assert_eq!(h.launcher.launch_count(), 2);
}

#[tokio::test]
async fn test_dead_record_is_relaunched_in_place() {
    let h = TestHarness::new();
    let record = h.supervisor.start_monitor(&standard("u1"), "alpha").await.unwrap();
    let old_pid = record.process_handle.unwrap();

    // Age the record out of its grace period, then lose the process
    let mut aged = h.record(&record.id).unwrap();
    aged.started_at = Utc::now() - chrono::Duration::seconds(120);
    h.storage.update_monitor(&aged).unwrap();
    h.table.exit(old_pid);

    let relaunched = h.supervisor.start_monitor(&standard("u1"), "alpha").await.unwrap();
    assert_eq!(relaunched.id, record.id);
    assert_ne!(relaunched.process_handle, Some(old_pid));
    assert!(h.table.reaped().contains(&old_pid));
    assert!(!h.table.signalled(old_pid));
    assert_eq!(h.records().len(), 1);
}

#[tokio::test]
async fn test_invalid_channel_is_a_validation_error() {
    let h = TestHarness::new();
    let err = h
        .supervisor
        .start_monitor(&standard("u1"), "not a channel!")
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::Validation(_)));
    assert_eq!(h.launcher.launch_count(), 0);
}

#[tokio::test]
async fn test_missing_binary_fails_without_record() {
    let h = TestHarness::new();
    h.launcher.set_missing_binary(true);

    let err = h
        .supervisor
        .start_monitor(&standard("u1"), "alpha")
        .await
        .unwrap_err();
    match err {
        ControlError::Launch(e) => assert!(e.is_configuration()),
        other => panic!("expected launch error, got {other:?}"),
    }
    assert!(h.records().is_empty());
}

#[tokio::test]
async fn test_stop_terminates_and_deletes() {
    let h = TestHarness::new();
    let record = h.supervisor.start_monitor(&standard("u1"), "alpha").await.unwrap();
    let pid = record.process_handle.unwrap();

    let removed = h.supervisor.stop_monitor(&standard("u1"), "alpha").await.unwrap();
    assert_eq!(removed, 1);
    assert!(h.record(&record.id).is_none());
    assert!(!h.table.is_alive(pid));
    assert_eq!(h.table.signals(), vec![(pid, TermSignal::Graceful)]);

    // Idempotent
    let removed = h.supervisor.stop_monitor(&standard("u1"), "alpha").await.unwrap();
    assert_eq!(removed, 0);
}

#[tokio::test]
async fn test_stop_escalates_to_sigkill() {
    let h = TestHarness::new();
    let record = h.supervisor.start_monitor(&standard("u1"), "alpha").await.unwrap();
    let pid = record.process_handle.unwrap();
    h.table.set_ignores_term(pid, true);

    h.supervisor.stop_monitor(&standard("u1"), "alpha").await.unwrap();
    assert_eq!(
        h.table.signals(),
        vec![(pid, TermSignal::Graceful), (pid, TermSignal::Forced)]
    );
    assert!(!h.table.is_alive(pid));
}

#[tokio::test]
async fn test_stop_leaves_other_owners_alone() {
    let h = TestHarness::new();
    let record = h.supervisor.start_monitor(&standard("u1"), "alpha").await.unwrap();

    let removed = h.supervisor.stop_monitor(&standard("u2"), "alpha").await.unwrap();
    assert_eq!(removed, 0);
    assert!(h.record(&record.id).is_some());
    assert!(h.table.is_alive(record.process_handle.unwrap()));
}

#[tokio::test]
async fn test_list_scopes_by_tier() {
    let h = TestHarness::new();
    h.supervisor.start_monitor(&standard("u1"), "alpha").await.unwrap();
    h.supervisor.start_monitor(&standard("u2"), "beta").await.unwrap();

    let own = h.supervisor.list_monitors(&standard("u1"));
    assert_eq!(own.len(), 1);
    assert_eq!(own[0].owner_id, "u1");

    assert_eq!(h.supervisor.list_monitors(&privileged("ops")).len(), 2);
    assert!(h.supervisor.list_monitors(&standard("nobody")).is_empty());
}

#[tokio::test]
async fn test_health_of_running_monitor() {
    let h = TestHarness::with_live(true);
    let record = h.supervisor.start_monitor(&standard("u1"), "alpha").await.unwrap();

    let health = h.supervisor.monitor_health(&standard("u1"), "alpha").await;
    assert!(health.active);
    assert!(health.process_alive);
    assert_eq!(health.status, Some(MonitorStatus::Running));
    assert_eq!(health.process_handle, record.process_handle);
    assert_eq!(health.is_upstream_live, Some(true));
    assert_eq!(health.viewer_count, Some(42));
    assert!(health.cpu_percent_aggregate > 0.0);
    assert!(health.memory_mb > 0.0);
    assert!(health.warnings.iter().any(|w| w.contains("starting up")));
}

#[tokio::test]
async fn test_health_never_fails() {
    let h = TestHarness::new();

    let missing = h.supervisor.monitor_health(&standard("u1"), "alpha").await;
    assert!(!missing.active);
    assert_eq!(missing.channel, "alpha");

    let invalid = h.supervisor.monitor_health(&standard("u1"), "bad channel!").await;
    assert!(!invalid.active);
    assert_eq!(invalid.warnings.len(), 1);
}

#[tokio::test]
async fn test_health_reports_dead_pipeline() {
    let h = TestHarness::new();
    let record = h.supervisor.start_monitor(&standard("u1"), "alpha").await.unwrap();
    h.table.vanish(record.process_handle.unwrap());

    let health = h.supervisor.monitor_health(&standard("u1"), "alpha").await;
    assert!(health.active);
    assert!(!health.process_alive);
    assert_eq!(health.is_upstream_live, None);
    assert_eq!(health.last_segment_age_secs, None);
    assert!(health.warnings.iter().any(|w| w.contains("not running")));
}

#[tokio::test]
async fn test_health_is_not_cached() {
    let h = TestHarness::with_cache_ttl(Duration::from_secs(60));
    let record = h.supervisor.start_monitor(&standard("u1"), "alpha").await.unwrap();

    let before = h.supervisor.monitor_health(&standard("u1"), "alpha").await;
    assert!(before.process_alive);

    h.table.vanish(record.process_handle.unwrap());
    let after = h.supervisor.monitor_health(&standard("u1"), "alpha").await;
    assert!(after.active);
    assert!(!after.process_alive);
}

// Watchdog

#[tokio::test]
async fn test_killed_pipeline_is_restarted_after_grace() {
    let h = TestHarness::new();
    let record = h.supervisor.start_monitor(&standard("u1"), "alpha").await.unwrap();
    let old_pid = record.process_handle.unwrap();
    h.table.vanish(old_pid);

    let report = h.supervisor.watchdog_tick_at(after_grace()).await;
    assert_eq!(report.restarted, 1);
    assert_eq!(report.failed, 0);

    let stored = h.record(&record.id).unwrap();
    assert_eq!(stored.status, MonitorStatus::Running);
    assert_eq!(stored.restart_count, 1);
    assert!(stored.restarted_at.is_some());
    let new_pid = stored.process_handle.unwrap();
    assert_ne!(new_pid, old_pid);
    assert!(h.table.is_alive(new_pid));
}

#[tokio::test]
async fn test_dead_pipeline_inside_grace_is_left_alone() {
    let h = TestHarness::new();
    let record = h.supervisor.start_monitor(&standard("u1"), "alpha").await.unwrap();
    h.table.vanish(record.process_handle.unwrap());

    let report = h.supervisor.watchdog_tick_at(soon()).await;
    assert_eq!(report.restarted, 0);
    assert_eq!(h.launcher.launch_count(), 1);
    assert_eq!(h.record(&record.id).unwrap().process_handle, record.process_handle);
}

#[tokio::test]
async fn test_zombie_is_reaped_and_restarted_once() {
    let h = TestHarness::new();
    let record = h.supervisor.start_monitor(&standard("u1"), "alpha").await.unwrap();
    let old_pid = record.process_handle.unwrap();
    h.table.exit(old_pid);

    let later = after_grace();
    let report = h.supervisor.watchdog_tick_at(later).await;
    assert_eq!(report.restarted, 1);
    assert!(h.table.reaped().contains(&old_pid));
    assert!(!h.table.signalled(old_pid));

    let report = h.supervisor.watchdog_tick_at(later).await;
    assert_eq!(report.restarted, 0);
    assert_eq!(h.launcher.launch_count(), 2);
    assert_eq!(h.record(&record.id).unwrap().restart_count, 1);
}

#[tokio::test]
async fn test_stale_segments_trigger_restart() {
    let h = TestHarness::new();
    let record = h.supervisor.start_monitor(&standard("u1"), "alpha").await.unwrap();
    let old_pid = record.process_handle.unwrap();

    let report = h
        .supervisor
        .watchdog_tick_at(Utc::now() + chrono::Duration::seconds(200))
        .await;
    assert_eq!(report.restarted, 1);
    assert!(h.table.signalled(old_pid));
    assert!(!h.table.is_alive(old_pid));
    assert_eq!(h.record(&record.id).unwrap().restart_count, 1);
}

#[tokio::test]
async fn test_failed_relaunch_keeps_stale_handle() {
    let h = TestHarness::new();
    let record = h.supervisor.start_monitor(&standard("u1"), "alpha").await.unwrap();
    h.table.vanish(record.process_handle.unwrap());
    h.launcher.set_fail_spawn(true);

    let report = h.supervisor.watchdog_tick_at(after_grace()).await;
    assert_eq!(report.failed, 1);
    let stored = h.record(&record.id).unwrap();
    assert_eq!(stored.process_handle, record.process_handle);
    assert_eq!(stored.restart_count, 0);

    // Next tick heals it
    h.launcher.set_fail_spawn(false);
    let report = h.supervisor.watchdog_tick_at(after_grace()).await;
    assert_eq!(report.restarted, 1);
}

#[tokio::test]
async fn test_restart_of_deleted_record_kills_new_pipeline() {
    let h = TestHarness::new();
    let record = h.supervisor.start_monitor(&standard("u1"), "alpha").await.unwrap();
    h.storage.delete_monitor(&record.id).unwrap();

    let outcome = h.supervisor.restart_record(&record, Utc::now()).await.unwrap();
    assert_eq!(outcome, RestartOutcome::RecordGone);
    let (_, new_pid) = h.launcher.launches().last().cloned().unwrap();
    assert!(!h.table.is_alive(new_pid));
}

#[tokio::test]
async fn test_offline_upstream_pauses() {
    let h = TestHarness::with_live(false);
    let record = h.supervisor.start_monitor(&standard("u1"), "alpha").await.unwrap();

    let report = h.supervisor.watchdog_tick_at(soon()).await;
    assert_eq!(report.paused, 1);
    let stored = h.record(&record.id).unwrap();
    assert_eq!(stored.status, MonitorStatus::Paused);
    assert_eq!(stored.process_handle, record.process_handle);

    // Stays paused while offline
    let report = h.supervisor.watchdog_tick_at(soon()).await;
    assert_eq!(report.paused, 0);
    assert_eq!(h.record(&record.id).unwrap().status, MonitorStatus::Paused);
}

#[tokio::test]
async fn test_paused_monitor_resumes_when_live() {
    let live = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&live);
    let mut upstream = MockStatusProvider::new();
    upstream.expect_channel_status().returning(move |_| {
        Ok(ChannelStatus {
            is_live: flag.load(Ordering::SeqCst),
            ..Default::default()
        })
    });
    let h = TestHarness::with_upstream(Arc::new(upstream));
    let record = h.supervisor.start_monitor(&standard("u1"), "alpha").await.unwrap();

    h.supervisor.watchdog_tick_at(soon()).await;
    assert_eq!(h.record(&record.id).unwrap().status, MonitorStatus::Paused);

    live.store(true, Ordering::SeqCst);
    let report = h.supervisor.watchdog_tick_at(soon()).await;
    assert_eq!(report.resumed, 1);
    let stored = h.record(&record.id).unwrap();
    assert_eq!(stored.status, MonitorStatus::Running);
    assert_eq!(stored.restart_count, 0);
}

#[tokio::test]
async fn test_unknown_upstream_never_pauses() {
    let mut upstream = MockStatusProvider::new();
    upstream
        .expect_channel_status()
        .returning(|_| Err(StatusError::Timeout(Duration::from_secs(5))));
    let h = TestHarness::with_upstream(Arc::new(upstream));
    let record = h.supervisor.start_monitor(&standard("u1"), "alpha").await.unwrap();

    let report = h.supervisor.watchdog_tick_at(soon()).await;
    assert_eq!(report.paused, 0);
    assert_eq!(h.record(&record.id).unwrap().status, MonitorStatus::Running);
}

#[tokio::test]
async fn test_resource_usage_warns_only() {
    let h = TestHarness::new();
    let record = h.supervisor.start_monitor(&standard("u1"), "alpha").await.unwrap();
    let pid = record.process_handle.unwrap();
    h.table.set_usage(pid, 400.0, 4096 * 1024 * 1024);

    let report = h.supervisor.watchdog_tick_at(soon()).await;
    assert_eq!(report.warned, 1);
    assert!(!report.acted());
    assert!(h.table.is_alive(pid));
    assert!(h.table.signals().is_empty());
}

// Reconciler

#[tokio::test]
async fn test_orphan_is_killed_within_one_sweep() {
    let h = TestHarness::new();
    let root = h.plant("ghost", "alpha", Uuid::new_v4());

    let report = h.supervisor.reconcile_at(after_grace()).await.unwrap();
    assert_eq!(report.discovered, 1);
    assert_eq!(report.orphans_killed, 1);
    assert!(!h.table.is_alive(root));
    assert!(h.table.live_pids().is_empty());

    let second = h.supervisor.reconcile_at(after_grace()).await.unwrap();
    assert!(!second.acted(), "{second:?}");
}

#[tokio::test]
async fn test_young_orphan_is_spared() {
    let h = TestHarness::new();
    let root = h.plant("ghost", "alpha", Uuid::new_v4());

    let report = h.supervisor.reconcile_at(soon()).await.unwrap();
    assert_eq!(report.orphans_killed, 0);
    assert!(h.table.is_alive(root));
}

#[tokio::test]
async fn test_healthy_monitor_survives_sweeps_unchanged() {
    let h = TestHarness::new();
    let record = h.supervisor.start_monitor(&standard("u1"), "alpha").await.unwrap();

    let first = h.supervisor.reconcile_at(after_grace()).await.unwrap();
    assert_eq!(first.discovered, 1);
    assert!(!first.acted(), "{first:?}");

    let before = h.records();
    let second = h.supervisor.reconcile_at(after_grace()).await.unwrap();
    assert!(!second.acted());
    assert_eq!(h.records(), before);
    assert!(h.table.is_alive(record.process_handle.unwrap()));
    assert!(h.table.signals().is_empty());
}

#[tokio::test]
async fn test_stray_segmenter_is_killed() {
    let h = TestHarness::new();
    let work_root = h.supervisor.settings().pipeline.work_root.clone();
    let stray = h.table.spawn(
        "ffmpeg",
        &format!(
            "ffmpeg -i pipe:0 -f segment {}/u1/alpha/{}/seg_%Y%m%d_%H%M%S.ts",
            work_root.display(),
            Uuid::new_v4()
        ),
        None,
    );
    // Unrelated ffmpeg outside the work root
    let bystander = h.table.spawn("ffmpeg", "ffmpeg -i input.mkv output.mp4", None);

    let report = h.supervisor.reconcile_at(after_grace()).await.unwrap();
    assert_eq!(report.strays_killed, 1);
    assert!(!h.table.is_alive(stray));
    assert!(h.table.is_alive(bystander));
}

#[tokio::test]
async fn test_racing_starts_converge_to_one_running_record() {
    let h = TestHarness::new();
    let owner = standard("u1");

    // Both passed the policy check before either was written
    let first = MonitorRecord::new(Uuid::new_v4(), &owner, "alpha", h.plant("u1", "alpha", Uuid::new_v4()));
    let mut second = MonitorRecord::new(Uuid::new_v4(), &owner, "beta", h.plant("u1", "beta", Uuid::new_v4()));
    second.started_at = first.started_at + chrono::Duration::seconds(1);
    h.storage.insert_monitor(&first).unwrap();
    h.storage.insert_monitor(&second).unwrap();

    let report = h.supervisor.reconcile_at(Utc::now()).await.unwrap();
    assert_eq!(report.duplicates_removed, 1);

    let records = h.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, second.id);
    assert!(!h.table.is_alive(first.process_handle.unwrap()));

    let again = h.supervisor.reconcile_at(Utc::now()).await.unwrap();
    assert!(!again.acted());
}

#[tokio::test]
async fn test_dedup_prefers_live_record() {
    let h = TestHarness::new();
    let owner = standard("u1");

    let alive = MonitorRecord::new(Uuid::new_v4(), &owner, "alpha", h.plant("u1", "alpha", Uuid::new_v4()));
    let dead_pid = h.plant("u1", "alpha", Uuid::new_v4());
    let mut dead = MonitorRecord::new(Uuid::new_v4(), &owner, "alpha", dead_pid);
    dead.started_at = alive.started_at + chrono::Duration::seconds(1);
    h.table.vanish(dead_pid);
    h.storage.insert_monitor(&alive).unwrap();
    h.storage.insert_monitor(&dead).unwrap();

    let report = h.supervisor.reconcile_at(Utc::now()).await.unwrap();
    assert_eq!(report.duplicates_removed, 1);
    let records = h.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, alive.id);
}

#[tokio::test]
async fn test_pipeline_held_for_removed_duplicate_is_killed() {
    let h = TestHarness::new();
    let owner = standard("u1");
    let survivor = h.supervisor.start_monitor(&owner, "alpha").await.unwrap();

    let dead_pid = h.plant("u1", "beta", Uuid::new_v4());
    h.table.vanish(dead_pid);
    let mut duplicate = MonitorRecord::new(Uuid::new_v4(), &owner, "beta", dead_pid);
    duplicate.started_at = survivor.started_at - chrono::Duration::seconds(60);
    h.storage.insert_monitor(&duplicate).unwrap();
    let relaunched = h.plant("u1", "beta", duplicate.id);

    let report = h.supervisor.reconcile_at(after_grace()).await.unwrap();
    assert_eq!(report.duplicates_removed, 1);
    assert_eq!(report.orphans_killed, 1);
    assert_eq!(report.adopted, 0);
    assert!(!h.table.is_alive(relaunched));

    let records = h.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, survivor.id);

    let second = h.supervisor.reconcile_at(after_grace()).await.unwrap();
    assert!(!second.acted());
}

#[tokio::test]
async fn test_privileged_channels_are_not_duplicates() {
    let h = TestHarness::new();
    let admin = privileged("ops");
    h.supervisor.start_monitor(&admin, "alpha").await.unwrap();
    h.supervisor.start_monitor(&admin, "beta").await.unwrap();

    let report = h.supervisor.reconcile_at(Utc::now()).await.unwrap();
    assert_eq!(report.duplicates_removed, 0);
    assert_eq!(h.records().len(), 2);
}

#[tokio::test]
async fn test_dead_record_is_removed_after_grace() {
    let h = TestHarness::new();
    let record = h.supervisor.start_monitor(&standard("u1"), "alpha").await.unwrap();
    h.table.vanish(record.process_handle.unwrap());

    let report = h.supervisor.reconcile_at(soon()).await.unwrap();
    assert_eq!(report.marked_dead, 0);
    assert!(h.record(&record.id).is_some());

    let report = h.supervisor.reconcile_at(after_grace()).await.unwrap();
    assert_eq!(report.marked_dead, 1);
    assert!(h.record(&record.id).is_none());
}

#[tokio::test]
async fn test_zombie_handle_is_reaped_before_removal() {
    let h = TestHarness::new();
    let record = h.supervisor.start_monitor(&standard("u1"), "alpha").await.unwrap();
    let pid = record.process_handle.unwrap();
    h.table.exit(pid);

    let report = h.supervisor.reconcile_at(after_grace()).await.unwrap();
    assert_eq!(report.marked_dead, 1);
    assert!(h.table.reaped().contains(&pid));
    assert!(!h.table.signalled(pid));
}

#[tokio::test]
async fn test_relaunched_pipeline_is_adopted() {
    let h = TestHarness::new();
    let record = h.supervisor.start_monitor(&standard("u1"), "alpha").await.unwrap();
    h.table.vanish(record.process_handle.unwrap());
    let replacement = h.plant("u1", "alpha", record.id);

    let report = h.supervisor.reconcile_at(after_grace()).await.unwrap();
    assert_eq!(report.adopted, 1);
    assert_eq!(report.orphans_killed, 0);
    assert_eq!(report.marked_dead, 0);

    let stored = h.record(&record.id).unwrap();
    assert_eq!(stored.process_handle, Some(replacement));
    assert_eq!(stored.restart_count, 0);
    assert!(h.table.is_alive(replacement));

    let second = h.supervisor.reconcile_at(after_grace()).await.unwrap();
    assert!(!second.acted());
}

#[tokio::test]
async fn test_pipeline_of_other_owner_is_not_adopted() {
    let h = TestHarness::new();
    let record = h.supervisor.start_monitor(&standard("u1"), "alpha").await.unwrap();
    h.table.vanish(record.process_handle.unwrap());
    let foreign = h.plant("u2", "alpha", Uuid::new_v4());

    let report = h.supervisor.reconcile_at(after_grace()).await.unwrap();
    assert_eq!(report.adopted, 0);
    assert_eq!(report.orphans_killed, 1);
    assert_eq!(report.marked_dead, 1);
    assert!(!h.table.is_alive(foreign));
}
