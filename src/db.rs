use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::{json, Map, Value};
use sqlx::postgres::{PgListener, PgPoolOptions};
use sqlx::{PgPool, Row};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::errors::{CrmError, Result};
use crate::models::{ChangeEvent, Contact, Deal, Document, EventType, Record, Table, Task};
use crate::store::{
    check_credentials, hash_password, publish, verify_password, ChangeReceiver, RecordStore,
    RowFilter, Session, SignUpProfile, Subscriber,
};

pub const CHANGE_CHANNEL: &str = "crm_changes";

/// Row fields carried on `crm_changes` payloads. Everything else is dropped
/// by `crm.change_fields` to stay under the NOTIFY size limit.
pub const CHANGE_FIELDS: [&str; 9] = [
    "id", "company", "product", "stage", "name", "title", "assignee", "priority", "status",
];

/// Record store backed by Postgres. Rows live as JSONB in `crm.rows`; a
/// trigger publishes every change on the `crm_changes` channel.
pub struct PgStore {
    pool: PgPool,
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    listener: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("failed to connect to Postgres")?;
        Ok(Self::new(pool))
    }

    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            subscribers: Arc::new(Mutex::new(Vec::new())),
            listener: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn init_db(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Starts the LISTEN task that fans notifications out to subscribers, or
    /// restarts it if the previous one stopped.
    async fn ensure_listener(&self) -> Result<()> {
        let mut handle = self.listener.lock().await;
        if !listener_needed(handle.as_ref()) {
            return Ok(());
        }
        if handle.is_some() {
            tracing::info!("restarting change feed listener");
        }

        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(CHANGE_CHANNEL).await?;
        let subscribers = Arc::clone(&self.subscribers);
        *handle = Some(tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        let event: ChangeEvent = match serde_json::from_str(notification.payload()) {
                            Ok(event) => event,
                            Err(err) => {
                                tracing::warn!(error = %err, "ignoring malformed change payload");
                                continue;
                            }
                        };
                        tracing::debug!(table = %event.table, kind = ?event.event_type, "change received");
                        publish(&mut lock(&subscribers), &event);
                    }
                    Err(err) => {
                        // Dropping the senders closes every feed, which surfaces as a disconnect.
                        tracing::error!(error = %err, "change feed listener stopped");
                        lock(&subscribers).clear();
                        break;
                    }
                }
            }
        }));
        Ok(())
    }

    pub async fn seed(&self) -> anyhow::Result<usize> {
        let now = Utc::now();
        let day = |n: i64| (now - Duration::days(n)).to_rfc3339();
        let date = |n: i64| (now + Duration::days(n)).date_naive().to_string();

        let rows = vec![
            (
                Table::Deals,
                json!({
                    "id": "seed-deal-001", "company": "Kochi Spice Exports", "product": "Black pepper",
                    "value": 185000, "currency": "USD", "stage": "Negotiation", "probability": 80,
                    "probability_locked": true, "status": "active",
                    "expected_closure": date(21), "created_at": day(2)
                }),
            ),
            (
                Table::Deals,
                json!({
                    "id": "seed-deal-002", "company": "Nord Freight AS", "product": "Reefer containers",
                    "value": 64000, "currency": "EUR", "stage": "Inquiry", "probability": 40,
                    "status": "active", "expected_closure": date(45), "created_at": day(9)
                }),
            ),
            (
                Table::Deals,
                json!({
                    "id": "seed-deal-003", "company": "Atlas Metals", "product": "Copper cathodes",
                    "value": 420000, "currency": "USD", "stage": "Confirmed", "probability": 95,
                    "status": "closed", "expected_closure": date(-3), "created_at": day(30)
                }),
            ),
            (
                Table::Contacts,
                json!({
                    "id": "seed-contact-001", "name": "Priya Nair", "company": "Kochi Spice Exports",
                    "email": "priya.nair@kochispice.example", "category": "Supplier", "rating": 5,
                    "created_date": day(1)
                }),
            ),
            (
                Table::Contacts,
                json!({
                    "id": "seed-contact-002", "name": "Lars Berg", "company": "Nord Freight AS",
                    "email": "lars.berg@nordfreight.example", "category": "Logistics", "rating": 4,
                    "created_date": day(20)
                }),
            ),
            (
                Table::Tasks,
                json!({
                    "id": "seed-task-001", "title": "Book pre-shipment inspection",
                    "assignee": "Amara Okafor", "priority": "high", "status": "pending",
                    "due_date": date(2), "created_at": day(1)
                }),
            ),
            (
                Table::Tasks,
                json!({
                    "id": "seed-task-002", "title": "Renew export licence",
                    "assignee": "Diego Ruiz", "priority": "medium", "status": "completed",
                    "due_date": date(-5), "created_at": day(14)
                }),
            ),
            (
                Table::Documents,
                json!({
                    "id": "seed-doc-001", "name": "Letter of credit - Kochi.pdf", "category": "Finance",
                    "status": "active", "company": "Kochi Spice Exports", "upload_date": day(1)
                }),
            ),
        ];

        let mut inserted = 0usize;
        for (table, row) in rows {
            if self.insert_if_absent(table, row).await? {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn insert_if_absent(&self, table: Table, row: Value) -> Result<bool> {
        let id = row
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let result = sqlx::query(
            r#"
            INSERT INTO crm.rows (table_name, id, data)
            VALUES ($1, $2, $3)
            ON CONFLICT (table_name, id) DO NOTHING
            "#,
        )
        .bind(table.as_str())
        .bind(&id)
        .bind(with_id(row, &id))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Imports one table from a CSV file with a header row. Rows whose id is
    /// already present are skipped, so re-running an import is harmless.
    pub async fn import_csv(&self, table: Table, csv_path: &std::path::Path) -> anyhow::Result<usize> {
        let mut reader = csv::Reader::from_path(csv_path)
            .with_context(|| format!("failed to open {}", csv_path.display()))?;
        let mut inserted = 0usize;

        for (line, result) in reader.deserialize::<HashMap<String, String>>().enumerate() {
            let record = result.with_context(|| format!("bad CSV record at row {}", line + 1))?;
            let raw: Map<String, Value> = record
                .into_iter()
                .filter(|(_, value)| !value.trim().is_empty())
                .map(|(key, value)| (key, Value::String(value)))
                .collect();
            let row = normalize(table, &Value::Object(raw));

            if self.insert_if_absent(table, row).await? {
                inserted += 1;
            }
        }

        tracing::info!(%table, inserted, "csv import finished");
        Ok(inserted)
    }
}

fn lock(subscribers: &Mutex<Vec<Subscriber>>) -> std::sync::MutexGuard<'_, Vec<Subscriber>> {
    subscribers
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn listener_needed(handle: Option<&JoinHandle<()>>) -> bool {
    handle.map_or(true, JoinHandle::is_finished)
}

fn with_id(row: Value, id: &str) -> Value {
    match row {
        Value::Object(mut fields) => {
            fields.insert("id".to_string(), Value::String(id.to_string()));
            Value::Object(fields)
        }
        other => other,
    }
}

/// Reparses raw text fields into the table's typed shape. Deals with a stage
/// but no probability get the stage default.
fn normalize(table: Table, raw: &Value) -> Value {
    let mut row = match table {
        Table::Deals => {
            let deal = Deal::from_row(raw);
            match (deal.stage, deal.probability) {
                (Some(stage), None) => deal.with_stage(stage).to_row(),
                _ => deal.to_row(),
            }
        }
        Table::Contacts => Contact::from_row(raw).to_row(),
        Table::Tasks => Task::from_row(raw).to_row(),
        Table::Documents => Document::from_row(raw).to_row(),
    };
    if row.get("id").and_then(Value::as_str).map_or(true, str::is_empty) {
        row = with_id(row, &Uuid::new_v4().to_string());
    }
    row
}

#[async_trait]
impl RecordStore for PgStore {
    async fn sign_in(&self, email: &str, password: &str) -> Result<Session> {
        let email = email.trim().to_lowercase();
        let row = sqlx::query(
            "SELECT id, password_hash, email_confirmed FROM crm.users WHERE email = $1",
        )
        .bind(&email)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Err(CrmError::Auth("invalid email or password".to_string()));
        };
        let stored: String = row.get("password_hash");
        if !verify_password(password, &stored)? {
            return Err(CrmError::Auth("invalid email or password".to_string()));
        }
        if !row.get::<bool, _>("email_confirmed") {
            tracing::warn!(%email, "signing in before email verification");
        }

        let user_id: Uuid = row.get("id");
        Ok(Session::issue(user_id.to_string(), email, Utc::now()))
    }

    async fn sign_up(&self, email: &str, password: &str, profile: SignUpProfile) -> Result<()> {
        let email = check_credentials(email, password)?;
        let password_hash = hash_password(password)?;

        let result = sqlx::query(
            r#"
            INSERT INTO crm.users (id, email, password_hash, profile)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (email) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&email)
        .bind(&password_hash)
        .bind(serde_json::to_value(&profile)?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CrmError::Auth(format!("{email} is already registered")));
        }
        tracing::info!(%email, "account created; verification email pending");
        Ok(())
    }

    async fn select(&self, table: Table, filter: Option<RowFilter>) -> Result<Vec<Value>> {
        let rows = match filter {
            None => {
                sqlx::query(
                    "SELECT data FROM crm.rows WHERE table_name = $1 ORDER BY created_at, id",
                )
                .bind(table.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            Some(filter) => {
                sqlx::query(
                    "SELECT data FROM crm.rows \
                     WHERE table_name = $1 AND data->>$2 = $3 \
                     ORDER BY created_at, id",
                )
                .bind(table.as_str())
                .bind(&filter.field)
                .bind(&filter.equals)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows.iter().map(|row| row.get::<Value, _>("data")).collect())
    }

    async fn insert(&self, table: Table, row: Value) -> Result<Value> {
        if !row.is_object() {
            return Err(CrmError::Backend(format!("{table} rows must be JSON objects")));
        }
        let id = match row.get("id") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => Uuid::new_v4().to_string(),
        };

        let stored = sqlx::query(
            "INSERT INTO crm.rows (table_name, id, data) VALUES ($1, $2, $3) RETURNING data",
        )
        .bind(table.as_str())
        .bind(&id)
        .bind(with_id(row, &id))
        .fetch_one(&self.pool)
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                CrmError::Backend(format!("duplicate id {id} in {table}"))
            }
            other => other.into(),
        })?;
        Ok(stored.get("data"))
    }

    async fn update(&self, table: Table, id: &str, patch: Value) -> Result<Value> {
        let Value::Object(mut patch) = patch else {
            return Err(CrmError::Backend("patch must be a JSON object".to_string()));
        };
        patch.remove("id");

        let stored = sqlx::query(
            r#"
            UPDATE crm.rows
            SET data = data || $3, updated_at = now()
            WHERE table_name = $1 AND id = $2
            RETURNING data
            "#,
        )
        .bind(table.as_str())
        .bind(id)
        .bind(Value::Object(patch))
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CrmError::NotFound(format!("{table}/{id}")))?;
        Ok(stored.get("data"))
    }

    async fn delete(&self, table: Table, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM crm.rows WHERE table_name = $1 AND id = $2")
            .bind(table.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CrmError::NotFound(format!("{table}/{id}")));
        }
        Ok(())
    }

    async fn subscribe(&self, table: Table, event_types: &[EventType]) -> Result<ChangeReceiver> {
        self.ensure_listener().await?;
        let (subscriber, receiver) = Subscriber::channel(table, event_types);
        lock(&self.subscribers).push(subscriber);
        Ok(receiver)
    }
}
