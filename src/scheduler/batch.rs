// ABOUTME: Turns a ticket selector into a dependency-ordered batch and drives one job per ticket
// Tickets move to In Progress before their job runs and to Done when it succeeds

use super::{BatchReport, DependencyScheduler, SchedulerEvent, WorkItem};
use crate::tickets::{Issue, TicketError, TicketSource, STATUS_DONE, STATUS_IN_PROGRESS};
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub struct BatchRunner {
    tickets: Arc<dyn TicketSource>,
    concurrency: usize,
    events: Option<mpsc::UnboundedSender<SchedulerEvent>>,
}

impl BatchRunner {
    pub fn new(tickets: Arc<dyn TicketSource>, concurrency: usize) -> Self {
        Self {
            tickets,
            concurrency,
            events: None,
        }
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<SchedulerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Select tickets with `query`, graph them by their blockers and run
    /// `job` for each one as its blockers complete. Only the ticket search
    /// itself can fail the batch.
    pub async fn run<F, Fut, E>(&self, query: &str, job: F) -> Result<BatchReport, TicketError>
    where
        F: Fn(Issue) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let issues = self.tickets.search_issues(query).await?;
        if issues.is_empty() {
            info!("No tickets match '{}'", query);
            return Ok(BatchReport::default());
        }
        info!("Selected {} tickets with '{}'", issues.len(), query);

        let items = self.work_items(&issues).await;
        let by_key: Arc<HashMap<String, Issue>> =
            Arc::new(issues.into_iter().map(|issue| (issue.key.clone(), issue)).collect());
        let tickets = self.tickets.clone();
        let job = Arc::new(job);

        let mut scheduler = DependencyScheduler::new(self.concurrency);
        if let Some(events) = &self.events {
            scheduler = scheduler.with_events(events.clone());
        }

        let report = scheduler
            .run(items, move |key: String| {
                let tickets = tickets.clone();
                let job = job.clone();
                let issue = by_key.get(&key).cloned();
                async move {
                    let Some(issue) = issue else {
                        return Err(format!("ticket {} vanished from the batch", key));
                    };
                    run_ticket(tickets.as_ref(), issue, job.as_ref()).await
                }
            })
            .await;

        Ok(report)
    }

    async fn work_items(&self, issues: &[Issue]) -> Vec<WorkItem> {
        let mut items = Vec::with_capacity(issues.len());
        for issue in issues {
            let blockers = match self.tickets.get_blockers(issue).await {
                Ok(blockers) => blockers,
                Err(e) => {
                    warn!("Could not fetch blockers for {}, treating as unblocked: {}", issue.key, e);
                    Vec::new()
                }
            };
            items.push(WorkItem::new(issue.key.clone()).blocked_by(blockers));
        }
        items
    }
}

async fn run_ticket<F, Fut, E>(tickets: &dyn TicketSource, issue: Issue, job: &F) -> Result<(), String>
where
    F: Fn(Issue) -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    let key = issue.key.clone();
    if let Err(e) = tickets.transition(&key, STATUS_IN_PROGRESS).await {
        warn!("Failed to move {} to {}: {}", key, STATUS_IN_PROGRESS, e);
    }

    info!("Working on ticket {}", key);
    job(issue).await.map_err(|e| e.to_string())?;

    if let Err(e) = tickets.transition(&key, STATUS_DONE).await {
        warn!("Failed to move {} to {}: {}", key, STATUS_DONE, e);
    }
    info!("Ticket {} done", key);
    Ok(())
}
