//! The record store boundary: authentication, table CRUD and the change feed.

use std::collections::HashMap;

use argon2::password_hash::{Error as PasswordHashError, PasswordHash, SaltString};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

use crate::errors::{CrmError, Result};
use crate::models::{
    ChangeEvent, Contact, Deal, Document, EventType, Record, Snapshot, Table, Task,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub user_id: String,
    pub email: String,
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignUpProfile {
    pub full_name: Option<String>,
    pub company: Option<String>,
}

pub const SESSION_TTL_HOURS: i64 = 24;
pub const MIN_PASSWORD_LEN: usize = 8;

impl Session {
    pub fn issue(user_id: impl Into<String>, email: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            email: email.into(),
            access_token: Uuid::new_v4().simple().to_string(),
            expires_at: now + Duration::hours(SESSION_TTL_HOURS),
        }
    }
}

/// Hashes `password` with Argon2 and a fresh salt, returning the PHC string.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| CrmError::Backend(format!("failed to hash password: {err}")))
}

/// Checks `candidate` against a stored PHC string. A mismatch is `Ok(false)`;
/// an unreadable hash is a backend error.
pub fn verify_password(candidate: &str, stored: &str) -> Result<bool> {
    let parsed = PasswordHash::new(stored)
        .map_err(|err| CrmError::Backend(format!("stored password hash is invalid: {err}")))?;
    match Argon2::default().verify_password(candidate.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(PasswordHashError::Password) => Ok(false),
        Err(err) => Err(CrmError::Backend(format!("password verification failed: {err}"))),
    }
}

/// Validates sign-up credentials and returns the normalized email.
pub fn check_credentials(email: &str, password: &str) -> Result<String> {
    let email = email.trim().to_lowercase();
    if !email.contains('@') {
        return Err(CrmError::Auth(format!("'{email}' is not a valid email address")));
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(CrmError::Auth(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(email)
}

/// Equality filter on a top-level row field.
#[derive(Debug, Clone, PartialEq)]
pub struct RowFilter {
    pub field: String,
    pub equals: String,
}

impl RowFilter {
    pub fn eq(field: impl Into<String>, equals: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            equals: equals.into(),
        }
    }

    pub fn matches(&self, row: &Value) -> bool {
        match row.get(&self.field) {
            Some(Value::String(s)) => *s == self.equals,
            Some(Value::Null) | None => false,
            Some(other) => other.to_string() == self.equals,
        }
    }
}

pub type ChangeReceiver = UnboundedReceiver<ChangeEvent>;

/// Sending half of a table subscription, held by store implementations.
pub struct Subscriber {
    table: Table,
    event_types: Vec<EventType>,
    sender: UnboundedSender<ChangeEvent>,
}

impl Subscriber {
    pub fn channel(table: Table, event_types: &[EventType]) -> (Self, ChangeReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let subscriber = Self {
            table,
            event_types: event_types.to_vec(),
            sender,
        };
        (subscriber, receiver)
    }

    fn wants(&self, event: &ChangeEvent) -> bool {
        self.table == event.table && self.event_types.contains(&event.event_type)
    }
}

/// Delivers `event` to interested subscribers and forgets the ones whose
/// receiver has been dropped.
pub fn publish(subscribers: &mut Vec<Subscriber>, event: &ChangeEvent) {
    subscribers.retain(|subscriber| {
        !subscriber.wants(event) || subscriber.sender.send(event.clone()).is_ok()
    });
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn sign_in(&self, email: &str, password: &str) -> Result<Session>;
    async fn sign_up(&self, email: &str, password: &str, profile: SignUpProfile) -> Result<()>;

    async fn select(&self, table: Table, filter: Option<RowFilter>) -> Result<Vec<Value>>;
    async fn insert(&self, table: Table, row: Value) -> Result<Value>;
    async fn update(&self, table: Table, id: &str, patch: Value) -> Result<Value>;
    async fn delete(&self, table: Table, id: &str) -> Result<()>;

    /// Opens a channel that receives the table's changes of the given kinds.
    async fn subscribe(&self, table: Table, event_types: &[EventType]) -> Result<ChangeReceiver>;
}

pub async fn fetch_all<T: Record>(store: &dyn RecordStore) -> Result<Vec<T>> {
    let rows = store.select(T::TABLE, None).await?;
    Ok(rows.iter().map(T::from_row).collect())
}

pub async fn fetch_one<T: Record>(store: &dyn RecordStore, id: &str) -> Result<Option<T>> {
    let rows = store.select(T::TABLE, Some(RowFilter::eq("id", id))).await?;
    Ok(rows.first().map(T::from_row))
}

pub async fn load_snapshot(store: &dyn RecordStore) -> Result<Snapshot> {
    Ok(Snapshot {
        deals: fetch_all::<Deal>(store).await?,
        contacts: fetch_all::<Contact>(store).await?,
        tasks: fetch_all::<Task>(store).await?,
        documents: fetch_all::<Document>(store).await?,
    })
}

/// One receiver per subscribed table.
#[derive(Debug, Default)]
pub struct ChangeFeed {
    channels: HashMap<Table, ChangeReceiver>,
}

#[derive(Debug, PartialEq)]
pub enum FeedItem {
    Event(ChangeEvent),
    Closed(Table),
}

impl ChangeFeed {
    pub async fn open(store: &dyn RecordStore, tables: &[Table]) -> Result<Self> {
        let mut channels = HashMap::new();
        for table in tables {
            let receiver = store.subscribe(*table, &EventType::ALL).await?;
            channels.insert(*table, receiver);
        }
        Ok(Self { channels })
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Takes whatever is already queued, table by table, without waiting.
    /// Tables whose sender has gone away are reported once and dropped.
    #[cfg(test)]
    pub fn drain(&mut self) -> Vec<FeedItem> {
        let mut items = Vec::new();
        let mut closed = Vec::new();

        for table in Table::ALL {
            let Some(receiver) = self.channels.get_mut(&table) else {
                continue;
            };
            loop {
                match receiver.try_recv() {
                    Ok(event) => items.push(FeedItem::Event(event)),
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        closed.push(table);
                        break;
                    }
                }
            }
        }

        for table in closed {
            self.channels.remove(&table);
            items.push(FeedItem::Closed(table));
        }
        items
    }

    /// Waits for the next event on any table. Returns `None` once every
    /// channel has closed.
    pub async fn next(&mut self) -> Option<FeedItem> {
        if self.channels.is_empty() {
            return None;
        }
        let (table, received) = {
            let waits = self.channels.iter_mut().map(|(table, receiver)| {
                let table = *table;
                Box::pin(async move { (table, receiver.recv().await) })
            });
            futures::future::select_all(waits).await.0
        };
        match received {
            Some(event) => Some(FeedItem::Event(event)),
            None => {
                self.channels.remove(&table);
                Some(FeedItem::Closed(table))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn filters_compare_strings_and_scalars() {
        let row = json!({"id": "d1", "probability": 70, "status": null});
        assert!(RowFilter::eq("id", "d1").matches(&row));
        assert!(RowFilter::eq("probability", "70").matches(&row));
        assert!(!RowFilter::eq("status", "null").matches(&row));
        assert!(!RowFilter::eq("missing", "").matches(&row));
    }

    #[test]
    fn password_hashes_are_salted_argon2() {
        let first = hash_password("hunter22").unwrap();
        let second = hash_password("hunter22").unwrap();
        assert!(first.starts_with("$argon2id$"));
        assert_ne!(first, second);

        assert!(verify_password("hunter22", &first).unwrap());
        assert!(verify_password("hunter22", &second).unwrap());
        assert!(!verify_password("hunter23", &first).unwrap());
    }

    #[test]
    fn unreadable_stored_hash_is_a_backend_error() {
        assert!(matches!(
            verify_password("hunter22", "not-a-phc-string"),
            Err(CrmError::Backend(_))
        ));
    }

    #[test]
    fn credentials_are_normalized_and_checked() {
        assert_eq!(
            check_credentials(" Ops@Exim.Example ", "longenough").unwrap(),
            "ops@exim.example"
        );
        assert!(matches!(
            check_credentials("ops", "longenough"),
            Err(CrmError::Auth(_))
        ));
        assert!(matches!(
            check_credentials("ops@exim.example", "short"),
            Err(CrmError::Auth(_))
        ));
    }

    #[tokio::test]
    async fn drain_reports_closed_channels_once() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let mut feed = ChangeFeed {
            channels: HashMap::from([(Table::Deals, rx)]),
        };

        let event = ChangeEvent::insert(Table::Deals, json!({"id": "d1"}));
        tx.send(event.clone()).unwrap();
        drop(tx);

        assert_eq!(
            feed.drain(),
            vec![FeedItem::Event(event), FeedItem::Closed(Table::Deals)]
        );
        assert!(feed.is_empty());
        assert!(feed.drain().is_empty());
        assert!(feed.next().await.is_none());
    }
}
