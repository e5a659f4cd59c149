use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::errors::{CrmError, Result};
use crate::models::{ChangeEvent, EventType, Table};
use crate::store::{
    check_credentials, hash_password, publish, verify_password, ChangeReceiver, RecordStore,
    RowFilter, Session, SignUpProfile, Subscriber,
};

struct UserAccount {
    id: String,
    password_hash: String,
}

#[derive(Default)]
struct State {
    tables: HashMap<Table, Vec<Value>>,
    users: HashMap<String, UserAccount>,
    subscribers: Vec<Subscriber>,
}

impl State {
    fn emit(&mut self, event: ChangeEvent) {
        publish(&mut self.subscribers, &event);
    }

    fn rows(&mut self, table: Table) -> &mut Vec<Value> {
        self.tables.entry(table).or_default()
    }
}

/// Record store held entirely in memory. Every write is published to
/// subscribers synchronously, so tests observe changes without a runtime tick.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads rows without publishing change events.
    pub fn with_rows(self, table: Table, rows: Vec<Value>) -> Self {
        self.lock().rows(table).extend(rows);
        self
    }

    /// Drops every subscriber, closing their channels.
    pub fn disconnect_all(&self) {
        self.lock().subscribers.clear();
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means a test panicked mid-write; the data is still usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn row_id(row: &Value) -> Option<String> {
    match row.get("id") {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn sign_in(&self, email: &str, password: &str) -> Result<Session> {
        let email = email.trim().to_lowercase();
        let state = self.lock();
        let invalid = || CrmError::Auth("invalid email or password".to_string());
        let account = state.users.get(&email).ok_or_else(invalid)?;
        if !verify_password(password, &account.password_hash)? {
            return Err(invalid());
        }
        Ok(Session::issue(account.id.clone(), email, Utc::now()))
    }

    async fn sign_up(&self, email: &str, password: &str, _profile: SignUpProfile) -> Result<()> {
        let email = check_credentials(email, password)?;
        let mut state = self.lock();
        if state.users.contains_key(&email) {
            return Err(CrmError::Auth(format!("{email} is already registered")));
        }
        let password_hash = hash_password(password)?;
        state.users.insert(
            email,
            UserAccount {
                id: Uuid::new_v4().to_string(),
                password_hash,
            },
        );
        Ok(())
    }

    async fn select(&self, table: Table, filter: Option<RowFilter>) -> Result<Vec<Value>> {
        let mut state = self.lock();
        Ok(state
            .rows(table)
            .iter()
            .filter(|row| filter.as_ref().map(|f| f.matches(row)).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn insert(&self, table: Table, row: Value) -> Result<Value> {
        let Value::Object(mut fields) = row else {
            return Err(CrmError::Backend(format!("{table} rows must be JSON objects")));
        };
        let id = row_id(&Value::Object(fields.clone())).unwrap_or_else(|| Uuid::new_v4().to_string());
        fields.insert("id".to_string(), Value::String(id.clone()));
        let row = Value::Object(fields);

        let mut state = self.lock();
        if state.rows(table).iter().any(|r| row_id(r).as_deref() == Some(id.as_str())) {
            return Err(CrmError::Backend(format!("duplicate id {id} in {table}")));
        }
        state.rows(table).push(row.clone());
        state.emit(ChangeEvent::insert(table, row.clone()));
        Ok(row)
    }

    async fn update(&self, table: Table, id: &str, patch: Value) -> Result<Value> {
        let Value::Object(patch) = patch else {
            return Err(CrmError::Backend("patch must be a JSON object".to_string()));
        };

        let mut state = self.lock();
        let row = state
            .rows(table)
            .iter_mut()
            .find(|r| row_id(r).as_deref() == Some(id))
            .ok_or_else(|| CrmError::NotFound(format!("{table}/{id}")))?;
        let old = row.clone();
        if let Value::Object(fields) = &mut *row {
            for (key, value) in patch {
                if key != "id" {
                    fields.insert(key, value);
                }
            }
        }
        let new = row.clone();
        state.emit(ChangeEvent::update(table, old, new.clone()));
        Ok(new)
    }

    async fn delete(&self, table: Table, id: &str) -> Result<()> {
        let mut state = self.lock();
        let rows = state.rows(table);
        let index = rows
            .iter()
            .position(|r| row_id(r).as_deref() == Some(id))
            .ok_or_else(|| CrmError::NotFound(format!("{table}/{id}")))?;
        let old = rows.remove(index);
        state.emit(ChangeEvent::delete(table, old));
        Ok(())
    }

    async fn subscribe(&self, table: Table, event_types: &[EventType]) -> Result<ChangeReceiver> {
        let (subscriber, receiver) = Subscriber::channel(table, event_types);
        self.lock().subscribers.push(subscriber);
        Ok(receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn crud_round_trip_publishes_changes() {
        let store = InMemoryStore::new();
        let mut deals = store.subscribe(Table::Deals, &EventType::ALL).await.unwrap();
        let mut inserts_only = store
            .subscribe(Table::Deals, &[EventType::Insert])
            .await
            .unwrap();

        let row = store
            .insert(Table::Deals, json!({"company": "Atlas Metals", "stage": "Inquiry"}))
            .await
            .unwrap();
        let id = row["id"].as_str().unwrap().to_string();

        let updated = store
            .update(Table::Deals, &id, json!({"stage": "Negotiation", "id": "ignored"}))
            .await
            .unwrap();
        assert_eq!(updated["id"], json!(id));
        assert_eq!(updated["company"], json!("Atlas Metals"));

        store.delete(Table::Deals, &id).await.unwrap();
        assert!(store.select(Table::Deals, None).await.unwrap().is_empty());

        let kinds: Vec<EventType> = std::iter::from_fn(|| deals.try_recv().ok())
            .map(|e| e.event_type)
            .collect();
        assert_eq!(kinds, vec![EventType::Insert, EventType::Update, EventType::Delete]);

        let expected = ChangeEvent::insert(Table::Deals, row);
        assert_eq!(inserts_only.try_recv().unwrap(), expected);
        assert!(inserts_only.try_recv().is_err());
    }

    #[tokio::test]
    async fn missing_rows_and_duplicates_are_errors() {
        let store = InMemoryStore::new().with_rows(Table::Tasks, vec![json!({"id": "t1"})]);

        let dup = store.insert(Table::Tasks, json!({"id": "t1"})).await;
        assert!(matches!(dup, Err(CrmError::Backend(_))));

        let missing = store.update(Table::Tasks, "t9", json!({})).await;
        assert!(matches!(missing, Err(CrmError::NotFound(_))));

        let missing = store.delete(Table::Tasks, "t9").await;
        assert!(matches!(missing, Err(CrmError::NotFound(_))));

        let not_object = store.insert(Table::Tasks, json!([1, 2])).await;
        assert!(matches!(not_object, Err(CrmError::Backend(_))));
    }

    #[tokio::test]
    async fn select_applies_filter() {
        let store = InMemoryStore::new().with_rows(
            Table::Contacts,
            vec![
                json!({"id": "c1", "company": "Nord Freight"}),
                json!({"id": "c2", "company": "Atlas Metals"}),
            ],
        );
        let rows = store
            .select(Table::Contacts, Some(RowFilter::eq("company", "Atlas Metals")))
            .await
            .unwrap();
        assert_eq!(rows, vec![json!({"id": "c2", "company": "Atlas Metals"})]);
    }

    #[tokio::test]
    async fn sign_up_then_sign_in() {
        let store = InMemoryStore::new();
        store
            .sign_up("Trader@Exim.Example", "correct horse", SignUpProfile::default())
            .await
            .unwrap();

        let again = store
            .sign_up("trader@exim.example", "correct horse", SignUpProfile::default())
            .await;
        assert!(matches!(again, Err(CrmError::Auth(_))));

        let session = store.sign_in("trader@exim.example", "correct horse").await.unwrap();
        assert_eq!(session.email, "trader@exim.example");
        assert!(session.expires_at > Utc::now());

        let wrong = store.sign_in("trader@exim.example", "wrong password").await;
        assert!(matches!(wrong, Err(CrmError::Auth(_))));
    }
}
