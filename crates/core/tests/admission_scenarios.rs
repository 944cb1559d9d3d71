//! Admission and scheduling scenarios.
//!
//! Capacity limits, memory backpressure and the preparation lead window,
//! checked both on the building blocks and through whole runs.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};

use galadriel_core::{
    race::{RaceCalendar, Transition},
    source::PollOutcome,
    testing::{fixtures, FixedMemoryMonitor, MockDataSource, MockSink},
    AdmissionConfig, AdmissionController, Deferral, Race, RaceStatus, RunCoordinator, SlotKind,
};

fn controller(config: AdmissionConfig, memory: &Arc<FixedMemoryMonitor>) -> AdmissionController {
    AdmissionController::new(config, memory.clone())
}

#[test]
fn test_capacity_defers_third_preparation_until_release() {
    let memory = Arc::new(FixedMemoryMonitor::new(20.0));
    let admission = controller(
        AdmissionConfig {
            max_preparation: 2,
            ..AdmissionConfig::default()
        },
        &memory,
    );

    let first = admission.try_admit(SlotKind::Preparation, "r1").unwrap();
    let _second = admission.try_admit(SlotKind::Preparation, "r2").unwrap();
    assert!(matches!(
        admission.admit(SlotKind::Preparation, "r3"),
        Err(Deferral::Capacity)
    ));

    admission.release(first);
    assert!(admission.try_admit(SlotKind::Preparation, "r3").is_some());
}

#[test]
fn test_memory_ceiling_blocks_both_kinds_then_recovers() {
    let memory = Arc::new(FixedMemoryMonitor::new(95.0));
    let admission = controller(
        AdmissionConfig {
            max_memory_percent: 90.0,
            ..AdmissionConfig::default()
        },
        &memory,
    );

    // Tick N: plenty of capacity, no memory.
    assert!(admission.try_admit(SlotKind::Preparation, "r1").is_none());
    assert!(admission.try_admit(SlotKind::Watch, "r2").is_none());
    assert_eq!(admission.active(SlotKind::Preparation), 0);
    assert_eq!(admission.active(SlotKind::Watch), 0);

    // Tick N+1: below the ceiling again.
    memory.set(85.0);
    assert!(admission.try_admit(SlotKind::Preparation, "r1").is_some());
    assert!(admission.try_admit(SlotKind::Watch, "r2").is_some());

    let status = admission.status();
    assert_eq!(status.last_memory_percent, Some(85.0));
    assert_eq!(status.deferred_total, 2);
}

#[test]
fn test_terminal_race_is_never_admitted_again() {
    let memory = Arc::new(FixedMemoryMonitor::new(10.0));
    let admission = controller(AdmissionConfig::default(), &memory);

    let slot = admission.try_admit(SlotKind::Watch, "r1").unwrap();
    drop(slot);
    admission.retire("r1");

    assert!(matches!(
        admission.admit(SlotKind::Preparation, "r1"),
        Err(Deferral::Retired)
    ));
    assert!(matches!(
        admission.admit(SlotKind::Watch, "r1"),
        Err(Deferral::Retired)
    ));
}

#[test]
fn test_lead_window_controls_first_appearance() {
    let t = Utc.with_ymd_and_hms(2024, 6, 8, 18, 0, 0).unwrap();
    let mut calendar = RaceCalendar::new();
    calendar
        .ingest(vec![Race::scheduled(
            "bel-9",
            "belmont-park",
            9,
            t + chrono::Duration::minutes(30),
        )])
        .unwrap();
    let lead = chrono::Duration::minutes(10);

    let due_at = |now| {
        calendar
            .due_for_preparation(now, lead)
            .map(|race| race.id.clone())
            .collect::<Vec<_>>()
    };

    assert!(due_at(t).is_empty());
    assert!(due_at(t + chrono::Duration::minutes(19)).is_empty());
    assert!(due_at(t + chrono::Duration::minutes(20) - chrono::Duration::seconds(1)).is_empty());
    assert_eq!(due_at(t + chrono::Duration::minutes(20)), vec!["bel-9"]);
    assert_eq!(
        calendar.next_preparation_due(lead),
        Some(t + chrono::Duration::minutes(20))
    );
}

#[test]
fn test_terminal_race_does_not_reappear_as_candidate() {
    let mut calendar = RaceCalendar::new();
    calendar
        .ingest(vec![fixtures::race_in("r1", chrono::Duration::minutes(1))])
        .unwrap();
    calendar.record_outcome("r1", Transition::StartPreparing).unwrap();
    calendar
        .record_outcome(
            "r1",
            Transition::Errored {
                context: galadriel_core::FailureContext::new(
                    galadriel_core::Phase::Preparation,
                    "transient_provider",
                    "502",
                ),
                attempts: 3,
            },
        )
        .unwrap();

    let now = Utc::now();
    assert_eq!(
        calendar
            .due_for_preparation(now, chrono::Duration::hours(1))
            .count(),
        0
    );
    assert_eq!(calendar.due_for_watching().count(), 0);
    assert!(calendar.is_day_complete());
    assert!(calendar
        .record_outcome("r1", Transition::StartPreparing)
        .is_err());
}

#[tokio::test]
async fn test_run_never_exceeds_preparation_limit() {
    let source = MockDataSource::new();
    let sink = MockSink::new();
    let memory = Arc::new(FixedMemoryMonitor::new(20.0));
    let admission = controller(
        AdmissionConfig {
            max_preparation: 2,
            max_watch: 2,
            ..AdmissionConfig::default()
        },
        &memory,
    );

    source.set_schedule(fixtures::day_schedule(5)).await;
    source.set_prepare_delay(Duration::from_millis(60)).await;
    for n in 1..=5 {
        source
            .script_polls(&format!("bel-{}", n), vec![Ok(PollOutcome::ResultsPosted(vec![]))])
            .await;
    }

    let coordinator = RunCoordinator::new(
        fixtures::fast_config(),
        Arc::new(source.clone()),
        Arc::new(sink.clone()),
        admission.clone(),
    );
    let status = coordinator.status_handle();
    let run = tokio::spawn(coordinator.run());

    // Sample the live counters while the run is in flight.
    let mut observed_max = 0;
    while !run.is_finished() {
        let current = status.current();
        if let Some(admission) = current.admission {
            assert!(admission.active_preparation <= 2);
            assert!(admission.active_watch <= 2);
            observed_max = observed_max.max(admission.active_preparation);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let summary = run.await.unwrap().unwrap();
    assert_eq!(summary.completed, 5);
    assert_eq!(observed_max, 2);
    assert!(source.max_concurrent_prepares().await <= 2);
    assert_eq!(admission.active(SlotKind::Preparation), 0);

    for n in 1..=5 {
        assert_eq!(
            sink.statuses_for(&format!("bel-{}", n)).last(),
            Some(&RaceStatus::Completed)
        );
    }
}

#[tokio::test]
async fn test_deferred_candidates_dispatch_when_memory_recovers() {
    let source = MockDataSource::new();
    let sink = MockSink::new();
    let memory = Arc::new(FixedMemoryMonitor::new(95.0));
    let admission = controller(
        AdmissionConfig {
            max_memory_percent: 90.0,
            ..AdmissionConfig::default()
        },
        &memory,
    );

    source.set_schedule(fixtures::day_schedule(3)).await;
    for n in 1..=3 {
        source
            .script_polls(&format!("bel-{}", n), vec![Ok(PollOutcome::ResultsPosted(vec![]))])
            .await;
    }

    let coordinator = RunCoordinator::new(
        fixtures::fast_config(),
        Arc::new(source.clone()),
        Arc::new(sink.clone()),
        admission.clone(),
    );
    let run = tokio::spawn(coordinator.run());

    // Several ticks at 95%.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(sink.status_updates().is_empty());
    assert!(admission.status().deferred_total >= 1);
    assert_eq!(admission.status().granted_total, 0);

    memory.set(85.0);
    let summary = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(summary.completed, 3);
}
