// ABOUTME: Ticket batches end to end over a JSON ticket file: selection, blocker order and status transitions

use agents_runner::scheduler::{BatchRunner, SchedulerEvent};
use agents_runner::tickets::{FileTicketSource, Issue, TicketSource, STATUS_DONE, STATUS_IN_PROGRESS};
use pretty_assertions::assert_eq;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::mpsc;

fn ticket(key: &str, labels: &[&str], blocked_by: &[&str]) -> Issue {
    let mut issue = Issue::new(key, format!("Implement {}", key));
    issue.labels = labels.iter().map(|l| l.to_string()).collect();
    issue.blocked_by = blocked_by.iter().map(|b| b.to_string()).collect();
    issue
}

fn write_tickets(dir: &TempDir, tickets: &[Issue]) -> PathBuf {
    let path = dir.path().join("tickets.json");
    std::fs::write(&path, serde_json::to_string_pretty(tickets).unwrap()).unwrap();
    path
}

#[tokio::test]
async fn test_batch_respects_blockers_and_updates_tickets() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_tickets(
        &temp_dir,
        &[
            ticket("T1", &["sprint"], &[]),
            ticket("T2", &["sprint"], &["T1", "OLD-9"]),
            ticket("T3", &["sprint"], &[]),
            ticket("T4", &["later"], &[]),
        ],
    );
    let source = Arc::new(FileTicketSource::open(&path).unwrap());
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();

    let worked = Arc::new(Mutex::new(Vec::new()));
    let log = worked.clone();
    let report = BatchRunner::new(source.clone(), 2)
        .with_events(events_tx)
        .run("label:sprint", move |issue: Issue| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(issue.key);
                Ok::<(), String>(())
            }
        })
        .await
        .unwrap();

    let mut completed = report.completed.clone();
    completed.sort();
    assert_eq!(completed, vec!["T1".to_string(), "T2".to_string(), "T3".to_string()]);

    let worked = worked.lock().unwrap().clone();
    let t1 = worked.iter().position(|k| k == "T1").unwrap();
    let t2 = worked.iter().position(|k| k == "T2").unwrap();
    assert!(t1 < t2);

    let mut events = Vec::new();
    while let Ok(event) = events_rx.try_recv() {
        events.push(event);
    }
    let t1_done = events
        .iter()
        .position(|e| *e == SchedulerEvent::Completed("T1".to_string()))
        .unwrap();
    let t2_ready = events
        .iter()
        .position(|e| *e == SchedulerEvent::Ready("T2".to_string()))
        .unwrap();
    assert!(t1_done < t2_ready);

    let reopened = FileTicketSource::open(&path).unwrap();
    for key in ["T1", "T2", "T3"] {
        assert_eq!(reopened.get_ticket(key).await.unwrap().status, STATUS_DONE);
    }
    assert_eq!(reopened.get_ticket("T4").await.unwrap().status, "");
}

#[tokio::test]
async fn test_failed_ticket_stays_in_progress_and_dependents_still_run() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_tickets(
        &temp_dir,
        &[ticket("A", &[], &[]), ticket("B", &[], &["A"])],
    );
    let source = Arc::new(FileTicketSource::open(&path).unwrap());

    let report = BatchRunner::new(source.clone(), 2)
        .run("", |issue: Issue| async move {
            if issue.key == "A" {
                Err("container crashed".to_string())
            } else {
                Ok(())
            }
        })
        .await
        .unwrap();

    assert_eq!(report.failed, vec![("A".to_string(), "container crashed".to_string())]);
    assert_eq!(report.completed, vec!["B".to_string()]);
    assert_eq!(source.get_ticket("A").await.unwrap().status, STATUS_IN_PROGRESS);
    assert_eq!(source.get_ticket("B").await.unwrap().status, STATUS_DONE);
}

#[tokio::test]
async fn test_empty_selection_runs_nothing() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_tickets(&temp_dir, &[ticket("A", &["x"], &[])]);
    let source = Arc::new(FileTicketSource::open(&path).unwrap());

    let report = BatchRunner::new(source, 2)
        .run("label:nothing", |_issue: Issue| async { Ok::<(), String>(()) })
        .await
        .unwrap();
    assert_eq!(report.total(), 0);
}
