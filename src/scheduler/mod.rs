// ABOUTME: Dependency-ordered batch scheduler with a single coordinator and a bounded worker pool
// Blocked items become ready only after the coordinator has observed every in-batch blocker complete

pub mod batch;

pub use batch::BatchRunner;

use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub id: String,
    pub blocked_by: HashSet<String>,
}

impl WorkItem {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            blocked_by: HashSet::new(),
        }
    }

    pub fn blocked_by<I, S>(mut self, blockers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blocked_by.extend(blockers.into_iter().map(Into::into));
        self
    }
}

/// Progress notifications, in the order the scheduler produces them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// Pushed onto the ready queue.
    Ready(String),
    /// A worker holds a permit and is running the item.
    Started(String),
    /// The worker is done with the item and is about to report it.
    Finished { id: String, success: bool },
    /// The coordinator processed the completion.
    Completed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub completed: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.completed.len() + self.failed.len()
    }

    fn record(&mut self, id: String, outcome: Result<(), String>) {
        match outcome {
            Ok(()) => self.completed.push(id),
            Err(message) => self.failed.push((id, message)),
        }
    }
}

type Completion = (String, Result<(), String>);

pub struct DependencyScheduler {
    concurrency: usize,
    events: Option<mpsc::UnboundedSender<SchedulerEvent>>,
}

impl DependencyScheduler {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            events: None,
        }
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<SchedulerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Run `job` once per item, never before the item's in-batch blockers
    /// have completed and never more than `concurrency` at a time. Item
    /// failures are logged and reported, not propagated. A dependency cycle
    /// makes this wait forever.
    pub async fn run<F, Fut, E>(&self, items: Vec<WorkItem>, job: F) -> BatchReport
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let items = dedupe(items);
        let total = items.len();
        let mut report = BatchReport::default();

        match total {
            0 => return report,
            1 => {
                let id = items[0].id.clone();
                info!("Single work item {}, running directly", id);
                emit(&self.events, SchedulerEvent::Started(id.clone()));
                let outcome = run_isolated(job(id.clone())).await;
                if let Err(message) = &outcome {
                    error!("Work item {} failed: {}", id, message);
                }
                emit(
                    &self.events,
                    SchedulerEvent::Finished {
                        id: id.clone(),
                        success: outcome.is_ok(),
                    },
                );
                emit(&self.events, SchedulerEvent::Completed(id.clone()));
                report.record(id, outcome);
                return report;
            }
            _ => {}
        }

        let (mut remaining, dependents) = build_graph(&items);
        info!("Scheduling {} work items with concurrency {}", total, self.concurrency);

        // Every item passes through the ready queue exactly once, so a
        // capacity of `total` means sends never wait.
        let (ready_tx, mut ready_rx) = mpsc::channel::<String>(total);
        let (completion_tx, mut completion_rx) = mpsc::channel::<Completion>(total);

        for item in &items {
            if remaining.get(&item.id).copied().unwrap_or(0) == 0 {
                emit(&self.events, SchedulerEvent::Ready(item.id.clone()));
                if ready_tx.try_send(item.id.clone()).is_err() {
                    error!("Ready queue rejected {}", item.id);
                }
            }
        }

        // The coordinator is the only writer of the ready queue and closes
        // it by dropping the sender after exactly `total` completions.
        let coordinator_events = self.events.clone();
        let coordinator = tokio::spawn(async move {
            let mut report = BatchReport::default();
            let mut seen = 0;

            while seen < total {
                let Some((id, outcome)) = completion_rx.recv().await else {
                    warn!("Completion channel closed after {} of {} items", seen, total);
                    break;
                };
                seen += 1;
                emit(&coordinator_events, SchedulerEvent::Completed(id.clone()));

                for dependent in dependents.get(&id).into_iter().flatten() {
                    let Some(count) = remaining.get_mut(dependent) else {
                        continue;
                    };
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        debug!("{} unblocked by {}", dependent, id);
                        emit(&coordinator_events, SchedulerEvent::Ready(dependent.clone()));
                        if ready_tx.send(dependent.clone()).await.is_err() {
                            error!("Ready queue closed before {} could be queued", dependent);
                        }
                    }
                }

                report.record(id, outcome);
            }

            drop(ready_tx);
            report
        });

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let job = Arc::new(job);
        let mut workers = JoinSet::new();

        while let Some(id) = ready_rx.recv().await {
            let semaphore = semaphore.clone();
            let job = job.clone();
            let completion_tx = completion_tx.clone();
            let events = self.events.clone();

            workers.spawn(async move {
                let outcome = match semaphore.acquire_owned().await {
                    Ok(permit) => {
                        emit(&events, SchedulerEvent::Started(id.clone()));
                        let outcome = run_isolated(job(id.clone())).await;
                        drop(permit);
                        outcome
                    }
                    Err(_) => Err("worker pool closed".to_string()),
                };

                if let Err(message) = &outcome {
                    error!("Work item {} failed: {}", id, message);
                }
                emit(
                    &events,
                    SchedulerEvent::Finished {
                        id: id.clone(),
                        success: outcome.is_ok(),
                    },
                );
                if completion_tx.send((id, outcome)).await.is_err() {
                    error!("Coordinator stopped before completion was reported");
                }
            });
        }

        drop(completion_tx);
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("Worker task failed: {}", e);
            }
        }

        match coordinator.await {
            Ok(coordinated) => report = coordinated,
            Err(e) => error!("Coordinator task failed: {}", e),
        }

        info!(
            "Batch finished: {} completed, {} failed",
            report.completed.len(),
            report.failed.len()
        );
        report
    }
}

/// Run one job on its own task so a panic becomes a failed outcome.
async fn run_isolated<Fut, E>(work: Fut) -> Result<(), String>
where
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Display + Send + 'static,
{
    match tokio::spawn(work).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(join_err) => Err(format!("work item panicked: {}", join_err)),
    }
}

fn emit(events: &Option<mpsc::UnboundedSender<SchedulerEvent>>, event: SchedulerEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}

fn dedupe(items: Vec<WorkItem>) -> Vec<WorkItem> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| {
            let fresh = seen.insert(item.id.clone());
            if !fresh {
                warn!("Duplicate work item {} ignored", item.id);
            }
            fresh
        })
        .collect()
}

/// Remaining-blocker counts and the inverted dependents index. Self
/// references and blockers outside the batch are ignored.
fn build_graph(items: &[WorkItem]) -> (HashMap<String, usize>, HashMap<String, Vec<String>>) {
    let ids: HashSet<&str> = items.iter().map(|item| item.id.as_str()).collect();
    let mut remaining = HashMap::new();
    let mut dependents: HashMap<String, Vec<String>> = HashMap::new();

    for item in items {
        let mut count = 0;
        for blocker in &item.blocked_by {
            if blocker == &item.id {
                debug!("Ignoring self-reference on {}", item.id);
                continue;
            }
            if !ids.contains(blocker.as_str()) {
                debug!("Ignoring blocker {} of {} outside this batch", blocker, item.id);
                continue;
            }
            dependents
                .entry(blocker.clone())
                .or_default()
                .push(item.id.clone());
            count += 1;
        }
        remaining.insert(item.id.clone(), count);
    }

    (remaining, dependents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_graph_ignores_self_and_outside_blockers() {
        let items = vec![
            WorkItem::new("A").blocked_by(["A", "OLD-1"]),
            WorkItem::new("B").blocked_by(["A"]),
            WorkItem::new("C").blocked_by(["A", "B"]),
        ];
        let (remaining, dependents) = build_graph(&items);

        assert_eq!(remaining["A"], 0);
        assert_eq!(remaining["B"], 1);
        assert_eq!(remaining["C"], 2);
        let mut of_a = dependents["A"].clone();
        of_a.sort();
        assert_eq!(of_a, vec!["B".to_string(), "C".to_string()]);
        assert!(!dependents.contains_key("OLD-1"));
    }

    #[tokio::test]
    async fn test_empty_batch_returns_immediately() {
        let report = DependencyScheduler::new(2)
            .run(Vec::new(), |_id| async { Ok::<(), String>(()) })
            .await;
        assert_eq!(report, BatchReport::default());
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let items = vec![
            WorkItem::new("A"),
            WorkItem::new("B").blocked_by(["A"]),
            WorkItem::new("C"),
        ];
        let report = DependencyScheduler::new(2)
            .run(items, |id| async move {
                if id == "A" {
                    Err(format!("{} broke", id))
                } else {
                    Ok(())
                }
            })
            .await;

        let mut completed = report.completed.clone();
        completed.sort();
        assert_eq!(completed, vec!["B".to_string(), "C".to_string()]);
        assert_eq!(report.failed, vec![("A".to_string(), "A broke".to_string())]);
    }

    #[tokio::test]
    async fn test_panicking_item_is_reported_as_failed() {
        let items = vec![WorkItem::new("A"), WorkItem::new("B")];
        let report = DependencyScheduler::new(2)
            .run(items, |id| async move {
                if id == "A" {
                    panic!("boom");
                }
                Ok::<(), String>(())
            })
            .await;

        assert_eq!(report.completed, vec!["B".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "A");
    }

    #[tokio::test]
    async fn test_single_panicking_item_is_reported_as_failed() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let report = DependencyScheduler::new(2)
            .with_events(events_tx)
            .run(vec![WorkItem::new("solo")], |id| async move {
                if id == "solo" {
                    panic!("boom");
                }
                Ok::<(), String>(())
            })
            .await;

        assert!(report.completed.is_empty());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "solo");
        assert!(report.failed[0].1.starts_with("work item panicked"));

        let mut events = Vec::new();
        while let Ok(event) = events_rx.try_recv() {
            events.push(event);
        }
        assert!(events.contains(&SchedulerEvent::Finished {
            id: "solo".to_string(),
            success: false,
        }));
        assert_eq!(events.last(), Some(&SchedulerEvent::Completed("solo".to_string())));
    }
}
