// ABOUTME: Dependency scheduler behaviour: blocker ordering, the concurrency bound and event sequencing

use agents_runner::scheduler::{DependencyScheduler, SchedulerEvent, WorkItem};
use pretty_assertions::assert_eq;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

fn drain(rx: &mut mpsc::UnboundedReceiver<SchedulerEvent>) -> Vec<SchedulerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn position(events: &[SchedulerEvent], wanted: &SchedulerEvent) -> usize {
    events
        .iter()
        .position(|event| event == wanted)
        .unwrap_or_else(|| panic!("missing event {:?} in {:?}", wanted, events))
}

#[tokio::test]
async fn test_chain_runs_in_dependency_order() {
    for pool_size in 1..=3 {
        let items = vec![
            WorkItem::new("C").blocked_by(["B"]),
            WorkItem::new("B").blocked_by(["A"]),
            WorkItem::new("A"),
        ];
        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = order.clone();

        let report = DependencyScheduler::new(pool_size)
            .run(items, move |id| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(format!("start {}", id));
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    seen.lock().unwrap().push(format!("end {}", id));
                    Ok::<(), String>(())
                }
            })
            .await;

        assert_eq!(
            *order.lock().unwrap(),
            vec!["start A", "end A", "start B", "end B", "start C", "end C"],
            "pool size {}",
            pool_size
        );
        assert_eq!(report.completed, vec!["A".to_string(), "B".to_string(), "C".to_string()]);
    }
}

#[tokio::test]
async fn test_never_more_than_pool_size_in_flight() {
    let items: Vec<WorkItem> = (0..8).map(|i| WorkItem::new(format!("item-{}", i))).collect();
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (current, max_seen) = (in_flight.clone(), peak.clone());

    let report = DependencyScheduler::new(2)
        .run(items, move |_id| {
            let current = current.clone();
            let max_seen = max_seen.clone();
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok::<(), String>(())
            }
        })
        .await;

    assert_eq!(report.completed.len(), 8);
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(in_flight.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_blocked_item_waits_for_coordinator_to_see_blocker_complete() {
    // T1 and T3 are free, T2 waits on T1.
    let items = vec![
        WorkItem::new("T1"),
        WorkItem::new("T2").blocked_by(["T1"]),
        WorkItem::new("T3"),
    ];
    let release_t1 = Arc::new(Notify::new());
    let gate = release_t1.clone();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();

    let scheduler = DependencyScheduler::new(2).with_events(events_tx);
    let handle = tokio::spawn(async move {
        scheduler
            .run(items, move |id| {
                let gate = gate.clone();
                async move {
                    if id == "T1" {
                        gate.notified().await;
                    }
                    Ok::<(), String>(())
                }
            })
            .await
    });

    // Let T3 finish while T1 is held back.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let early = drain(&mut events_rx);
    let mut initially_ready: Vec<&SchedulerEvent> = early
        .iter()
        .filter(|event| matches!(event, SchedulerEvent::Ready(_)))
        .collect();
    initially_ready.sort_by_key(|event| format!("{:?}", event));
    assert_eq!(
        initially_ready,
        vec![
            &SchedulerEvent::Ready("T1".to_string()),
            &SchedulerEvent::Ready("T3".to_string()),
        ]
    );
    assert!(early.contains(&SchedulerEvent::Completed("T3".to_string())));
    assert!(!early.contains(&SchedulerEvent::Started("T2".to_string())));

    release_t1.notify_one();
    let report = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.total(), 3);
    assert!(report.failed.is_empty());

    let mut events = early;
    events.extend(drain(&mut events_rx));
    let t1_done = position(&events, &SchedulerEvent::Completed("T1".to_string()));
    let t2_ready = position(&events, &SchedulerEvent::Ready("T2".to_string()));
    let t2_started = position(&events, &SchedulerEvent::Started("T2".to_string()));
    assert!(t1_done < t2_ready);
    assert!(t2_ready < t2_started);
}

#[tokio::test]
async fn test_every_dependent_of_a_shared_blocker_runs_after_it() {
    let items = vec![
        WorkItem::new("base"),
        WorkItem::new("left").blocked_by(["base"]),
        WorkItem::new("right").blocked_by(["base"]),
        WorkItem::new("join").blocked_by(["left", "right"]),
    ];
    let finished_at = Arc::new(Mutex::new(HashMap::new()));
    let started_at = Arc::new(Mutex::new(HashMap::new()));
    let clock = Arc::new(AtomicUsize::new(0));
    let (finished, started, tick) = (finished_at.clone(), started_at.clone(), clock.clone());

    let report = DependencyScheduler::new(4)
        .run(items, move |id| {
            let (finished, started, tick) = (finished.clone(), started.clone(), tick.clone());
            async move {
                started.lock().unwrap().insert(id.clone(), tick.fetch_add(1, Ordering::SeqCst));
                tokio::time::sleep(Duration::from_millis(5)).await;
                finished.lock().unwrap().insert(id, tick.fetch_add(1, Ordering::SeqCst));
                Ok::<(), String>(())
            }
        })
        .await;

    assert_eq!(report.completed.len(), 4);
    let finished = finished_at.lock().unwrap();
    let started = started_at.lock().unwrap();
    assert!(finished["base"] < started["left"]);
    assert!(finished["base"] < started["right"]);
    assert!(finished["left"] < started["join"]);
    assert!(finished["right"] < started["join"]);
}

#[tokio::test]
async fn test_single_item_runs_directly() {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let report = DependencyScheduler::new(2)
        .with_events(events_tx)
        .run(vec![WorkItem::new("solo").blocked_by(["elsewhere"])], |_id| async {
            Ok::<(), String>(())
        })
        .await;

    assert_eq!(report.completed, vec!["solo".to_string()]);
    let events = drain(&mut events_rx);
    assert!(!events.contains(&SchedulerEvent::Ready("solo".to_string())));
    assert_eq!(events.last(), Some(&SchedulerEvent::Completed("solo".to_string())));
}

#[tokio::test]
async fn test_dependency_cycle_never_finishes() {
    let items = vec![
        WorkItem::new("X").blocked_by(["Y"]),
        WorkItem::new("Y").blocked_by(["X"]),
    ];
    let ran = Arc::new(AtomicUsize::new(0));
    let counter = ran.clone();

    let outcome = tokio::time::timeout(
        Duration::from_millis(300),
        DependencyScheduler::new(2).run(items, move |_id| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), String>(())
            }
        }),
    )
    .await;

    assert!(outcome.is_err());
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}
