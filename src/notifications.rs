//! Turns record changes and record snapshots into user-facing notifications.
//!
//! Every function here is total: partial or malformed rows fall back to
//! placeholder text instead of failing.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use crate::models::{
    ChangeEvent, Contact, Deal, DealStage, Document, EventType, Notification,
    NotificationPriority, NotificationType, Record, Snapshot, Table, Task, TaskPriority,
    TaskStatus,
};

pub const CONTACT_LOOKBACK_DAYS: i64 = 7;
pub const DOCUMENT_LOOKBACK_DAYS: i64 = 3;
pub const HOT_DEAL_PROBABILITY: u8 = 70;

fn parse<T: Record>(row: Option<&Value>) -> T {
    row.map(T::from_row).unwrap_or_default()
}

/// Derives at most one notification from a change-feed event.
pub fn derive_from_event(event: &ChangeEvent, now: DateTime<Utc>) -> Option<Notification> {
    match (event.table, event.event_type) {
        (Table::Deals, EventType::Insert) => {
            let deal: Deal = parse(event.new.as_ref());
            Some(new_deal(&deal, now))
        }
        (Table::Deals, EventType::Update) => {
            let old: Deal = parse(event.old.as_ref());
            let new: Deal = parse(event.new.as_ref());
            if !changed(old.stage, new.stage, event, "stage") {
                return None;
            }
            Some(Notification::new(
                NotificationType::Deal,
                NotificationPriority::Medium,
                "Deal Stage Updated",
                format!(
                    "Deal with {} moved to {}",
                    new.company_or_default(),
                    stage_label(new.stage, event)
                ),
                now,
                new.id.as_str(),
            ))
        }
        (Table::Contacts, EventType::Insert) => {
            let contact: Contact = parse(event.new.as_ref());
            Some(new_contact(&contact, now))
        }
        (Table::Tasks, EventType::Insert) => {
            let task: Task = parse(event.new.as_ref());
            Some(new_task(&task, now))
        }
        (Table::Tasks, EventType::Update) => {
            let old: Task = parse(event.old.as_ref());
            let new: Task = parse(event.new.as_ref());
            if !changed(old.status, new.status, event, "status") {
                return None;
            }
            Some(Notification::new(
                NotificationType::Task,
                NotificationPriority::Low,
                "Task Status Updated",
                format!(
                    "{} is now {}",
                    new.title_or_default(),
                    new.status.map(|s| s.as_str()).unwrap_or("unknown")
                ),
                now,
                new.id.as_str(),
            ))
        }
        (Table::Documents, EventType::Insert) => {
            let document: Document = parse(event.new.as_ref());
            Some(new_document(&document, now))
        }
        _ => None,
    }
}

/// Compares typed values when both sides parse, and the raw field values
/// otherwise, so two unrecognised spellings still count as a change.
fn changed<T: PartialEq>(old: Option<T>, new: Option<T>, event: &ChangeEvent, field: &str) -> bool {
    match (old, new) {
        (Some(old), Some(new)) => old != new,
        _ => raw_field(event.old.as_ref(), field) != raw_field(event.new.as_ref(), field),
    }
}

fn raw_field<'a>(row: Option<&'a Value>, field: &str) -> Option<&'a Value> {
    row.and_then(|row| row.get(field)).filter(|value| !value.is_null())
}

fn stage_label(stage: Option<DealStage>, event: &ChangeEvent) -> String {
    match stage {
        Some(stage) => stage.as_str().to_string(),
        None => raw_field(event.new.as_ref(), "stage")
            .and_then(Value::as_str)
            .filter(|raw| !raw.trim().is_empty())
            .unwrap_or("an unknown stage")
            .to_string(),
    }
}

fn new_deal(deal: &Deal, timestamp: DateTime<Utc>) -> Notification {
    Notification::new(
        NotificationType::Deal,
        NotificationPriority::High,
        "New Deal Created",
        format!(
            "New deal with {} for {}",
            deal.company_or_default(),
            deal.product_or_default()
        ),
        timestamp,
        deal.id.as_str(),
    )
}

fn new_contact(contact: &Contact, timestamp: DateTime<Utc>) -> Notification {
    Notification::new(
        NotificationType::Contact,
        NotificationPriority::Medium,
        "New Contact Added",
        format!(
            "{} from {} was added to contacts",
            contact.name_or_default(),
            contact.company_or_default()
        ),
        timestamp,
        contact.id.as_str(),
    )
}

fn new_task(task: &Task, timestamp: DateTime<Utc>) -> Notification {
    let priority = if task.priority == Some(TaskPriority::High) {
        NotificationPriority::High
    } else {
        NotificationPriority::Medium
    };
    Notification::new(
        NotificationType::Task,
        priority,
        "New Task Assigned",
        format!(
            "{} assigned to {}",
            task.title_or_default(),
            task.assignee_or_default()
        ),
        timestamp,
        task.id.as_str(),
    )
}

fn new_document(document: &Document, timestamp: DateTime<Utc>) -> Notification {
    Notification::new(
        NotificationType::Document,
        NotificationPriority::Low,
        "New Document Uploaded",
        format!(
            "{} was uploaded{}",
            document.name_or_default(),
            document
                .company
                .as_deref()
                .map(|c| format!(" for {c}"))
                .unwrap_or_default()
        ),
        timestamp,
        document.id.as_str(),
    )
}

/// Scans full collections for records that deserve an alert right now.
/// The result is ordered newest first.
pub fn backfill(snapshot: &Snapshot, now: DateTime<Utc>) -> Vec<Notification> {
    let mut notifications = Vec::new();

    for deal in &snapshot.deals {
        let hot = deal.stage == Some(DealStage::Negotiation)
            && deal.probability.unwrap_or(0) > HOT_DEAL_PROBABILITY;
        if hot {
            notifications.push(Notification::new(
                NotificationType::Deal,
                NotificationPriority::High,
                "Hot Deal Alert",
                format!(
                    "{} deal with {} is at {}% probability",
                    deal.product_or_default(),
                    deal.company_or_default(),
                    deal.probability.unwrap_or(0)
                ),
                deal.created_at.unwrap_or(now),
                deal.id.as_str(),
            ));
        }
    }

    for task in &snapshot.tasks {
        if task.status == Some(TaskStatus::Pending) && task.priority == Some(TaskPriority::High) {
            notifications.push(Notification::new(
                NotificationType::Task,
                NotificationPriority::High,
                "Urgent Task Pending",
                format!(
                    "{} for {} is still pending",
                    task.title_or_default(),
                    task.assignee_or_default()
                ),
                task.created_at.unwrap_or(now),
                task.id.as_str(),
            ));
        }
    }

    let contact_cutoff = now - Duration::days(CONTACT_LOOKBACK_DAYS);
    for contact in &snapshot.contacts {
        if let Some(created) = contact.created_date.filter(|ts| *ts >= contact_cutoff) {
            let mut notification = new_contact(contact, created);
            notification.priority = NotificationPriority::Low;
            notifications.push(notification);
        }
    }

    let document_cutoff = now - Duration::days(DOCUMENT_LOOKBACK_DAYS);
    for document in &snapshot.documents {
        if let Some(uploaded) = document.upload_date.filter(|ts| *ts >= document_cutoff) {
            notifications.push(new_document(document, uploaded));
        }
    }

    sort_newest_first(&mut notifications);
    notifications
}

pub fn sort_newest_first(notifications: &mut [Notification]) {
    notifications.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
}

/// Raised when the live feed drops, so a backend failure is never silent.
pub fn feed_disconnected(table: Table, now: DateTime<Utc>) -> Notification {
    Notification::new(
        NotificationType::System,
        NotificationPriority::Medium,
        "Live Updates Disconnected",
        format!("Live updates for {table} stopped; reload to reconnect"),
        now,
        "",
    )
}
