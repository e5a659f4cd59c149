//! Services wired to an injected record store.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::analytics::{self, Kpis};
use crate::errors::{CrmError, Result, ValidationError};
use crate::forms::{ContactForm, DealForm, DocumentForm, TaskForm};
use crate::inbox::Inbox;
use crate::models::{
    Contact, Deal, DealStage, Document, Notification, Record, Snapshot, Table, Task, TaskStatus,
};
use crate::notifications;
use crate::store::{fetch_all, fetch_one, load_snapshot, ChangeFeed, FeedItem, RecordStore};

/// Write operations behind the create/edit forms.
pub struct CrmService {
    store: Arc<dyn RecordStore>,
}

impl CrmService {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    async fn insert<T: Record>(&self, record: T) -> Result<T> {
        let stored = self.store.insert(T::TABLE, record.to_row()).await?;
        tracing::info!(table = %T::TABLE, id = %record.id(), "record created");
        Ok(T::from_row(&stored))
    }

    pub async fn create_deal(&self, form: DealForm) -> Result<Deal> {
        self.insert(form.build(Utc::now())?).await
    }

    pub async fn create_contact(&self, form: ContactForm) -> Result<Contact> {
        self.insert(form.build(Utc::now())?).await
    }

    pub async fn create_task(&self, form: TaskForm) -> Result<Task> {
        self.insert(form.build(Utc::now())?).await
    }

    pub async fn upload_document(&self, form: DocumentForm) -> Result<Document> {
        self.insert(form.build(Utc::now())?).await
    }

    /// Moves a deal through the pipeline. Deals are closed by moving them to
    /// `Lost`, never deleted.
    pub async fn change_deal_stage(&self, id: &str, stage: DealStage) -> Result<Deal> {
        let deal = fetch_one::<Deal>(self.store.as_ref(), id)
            .await?
            .ok_or_else(|| CrmError::NotFound(format!("deals/{id}")))?
            .with_stage(stage);
        let patch = json!({ "stage": stage, "probability": deal.probability });
        let stored = self.store.update(Table::Deals, id, patch).await?;
        tracing::info!(%id, %stage, "deal stage changed");
        Ok(Deal::from_row(&stored))
    }

    pub async fn update_task_status(&self, id: &str, status: TaskStatus) -> Result<Task> {
        let stored = self
            .store
            .update(Table::Tasks, id, json!({ "status": status }))
            .await?;
        tracing::info!(%id, %status, "task status changed");
        Ok(Task::from_row(&stored))
    }

    pub async fn rate_contact(&self, id: &str, rating: u8) -> Result<Contact> {
        if !(1..=5).contains(&rating) {
            return Err(ValidationError::OutOfRange {
                field: "rating",
                min: 1.0,
                max: 5.0,
            }
            .into());
        }
        let stored = self
            .store
            .update(Table::Contacts, id, json!({ "rating": rating }))
            .await?;
        Ok(Contact::from_row(&stored))
    }

    /// Reassigns documents to `category`, stopping at the first failure.
    /// Returns how many were moved.
    pub async fn move_documents(&self, ids: &[String], category: &str) -> Result<usize> {
        let category = category.trim();
        if category.is_empty() {
            return Err(ValidationError::MissingField("category").into());
        }
        let mut moved = 0usize;
        for id in ids {
            self.store
                .update(Table::Documents, id, json!({ "category": category }))
                .await?;
            moved += 1;
        }
        tracing::info!(moved, %category, "documents moved");
        Ok(moved)
    }
}

/// Reads the current collections and reduces them to dashboard figures.
pub struct AnalyticsService {
    store: Arc<dyn RecordStore>,
}

impl AnalyticsService {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub async fn snapshot(&self) -> Result<Snapshot> {
        load_snapshot(self.store.as_ref()).await
    }

    pub async fn dashboard(&self) -> Result<Kpis> {
        let deals = fetch_all::<Deal>(self.store.as_ref()).await?;
        let contacts = fetch_all::<Contact>(self.store.as_ref()).await?;
        let tasks = fetch_all::<Task>(self.store.as_ref()).await?;
        tracing::debug!(
            deals = deals.len(),
            contacts = contacts.len(),
            tasks = tasks.len(),
            "computing dashboard"
        );
        Ok(analytics::compute_kpis(&deals, &contacts, &tasks))
    }
}

/// Keeps the notification inbox filled from a backfill scan and the live feed.
pub struct NotificationService {
    store: Arc<dyn RecordStore>,
    inbox: Inbox,
}

impl NotificationService {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            inbox: Inbox::default(),
        }
    }

    pub fn inbox(&self) -> &Inbox {
        &self.inbox
    }

    pub fn inbox_mut(&mut self) -> &mut Inbox {
        &mut self.inbox
    }

    pub async fn backfill(&mut self, now: DateTime<Utc>) -> Result<usize> {
        let snapshot = load_snapshot(self.store.as_ref()).await?;
        let derived = notifications::backfill(&snapshot, now);
        let count = derived.len();
        self.inbox.extend(derived);
        tracing::info!(count, "notifications backfilled");
        Ok(count)
    }

    pub async fn subscribe(&self) -> Result<ChangeFeed> {
        ChangeFeed::open(self.store.as_ref(), &Table::ALL).await
    }

    /// Applies one feed item to the inbox and returns the notification it produced.
    pub fn handle(&mut self, item: FeedItem, now: DateTime<Utc>) -> Option<Notification> {
        let notification = match item {
            FeedItem::Event(event) => notifications::derive_from_event(&event, now)?,
            FeedItem::Closed(table) => {
                tracing::warn!(%table, "change feed closed");
                notifications::feed_disconnected(table, now)
            }
        };
        self.inbox.push(notification.clone());
        Some(notification)
    }

    /// Processes everything already queued on `feed` without waiting.
    #[cfg(test)]
    pub fn drain(&mut self, feed: &mut ChangeFeed) -> Vec<Notification> {
        feed.drain()
            .into_iter()
            .filter_map(|item| self.handle(item, Utc::now()))
            .collect()
    }

    /// Follows the feed until `shutdown` resolves or every channel closes,
    /// handing each new notification to `on_notification`.
    pub async fn run<S, F>(&mut self, mut feed: ChangeFeed, shutdown: S, mut on_notification: F)
    where
        S: Future<Output = ()>,
        F: FnMut(&Notification),
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                item = feed.next() => {
                    let Some(item) = item else { break };
                    if let Some(notification) = self.handle(item, Utc::now()) {
                        on_notification(&notification);
                    }
                }
            }
        }
    }
}
