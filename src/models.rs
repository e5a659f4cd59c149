use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const UNKNOWN_COMPANY: &str = "Unknown Company";
pub const UNKNOWN_PRODUCT: &str = "Unknown Product";
pub const UNNAMED_CONTACT: &str = "Unnamed Contact";
pub const UNTITLED_TASK: &str = "Untitled Task";
pub const UNASSIGNED: &str = "Unassigned";
pub const UNTITLED_DOCUMENT: &str = "Untitled Document";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Table {
    Deals,
    Contacts,
    Tasks,
    Documents,
}

impl Table {
    pub const ALL: [Table; 4] = [Table::Deals, Table::Contacts, Table::Tasks, Table::Documents];

    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Deals => "deals",
            Table::Contacts => "contacts",
            Table::Tasks => "tasks",
            Table::Documents => "documents",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Table {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deals" => Ok(Table::Deals),
            "contacts" => Ok(Table::Contacts),
            "tasks" => Ok(Table::Tasks),
            "documents" => Ok(Table::Documents),
            other => Err(format!("unknown table '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Insert,
    Update,
    Delete,
}

impl EventType {
    pub const ALL: [EventType; 3] = [EventType::Insert, EventType::Update, EventType::Delete];
}

/// A single row change as delivered by the store's change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub table: Table,
    pub event_type: EventType,
    #[serde(default)]
    pub old: Option<Value>,
    #[serde(default)]
    pub new: Option<Value>,
}

impl ChangeEvent {
    pub fn insert(table: Table, new: Value) -> Self {
        Self {
            table,
            event_type: EventType::Insert,
            old: None,
            new: Some(new),
        }
    }

    pub fn update(table: Table, old: Value, new: Value) -> Self {
        Self {
            table,
            event_type: EventType::Update,
            old: Some(old),
            new: Some(new),
        }
    }

    pub fn delete(table: Table, old: Value) -> Self {
        Self {
            table,
            event_type: EventType::Delete,
            old: Some(old),
            new: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DealStage {
    Inquiry,
    Negotiation,
    Confirmed,
    Lost,
}

impl DealStage {
    pub const PIPELINE: [DealStage; 4] = [
        DealStage::Inquiry,
        DealStage::Negotiation,
        DealStage::Confirmed,
        DealStage::Lost,
    ];

    /// Win probability applied whenever a deal enters this stage.
    pub fn default_probability(&self) -> u8 {
        match self {
            DealStage::Inquiry => 40,
            DealStage::Negotiation => 70,
            DealStage::Confirmed => 95,
            DealStage::Lost => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DealStage::Inquiry => "Inquiry",
            DealStage::Negotiation => "Negotiation",
            DealStage::Confirmed => "Confirmed",
            DealStage::Lost => "Lost",
        }
    }
}

impl fmt::Display for DealStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DealStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inquiry" => Ok(DealStage::Inquiry),
            "negotiation" => Ok(DealStage::Negotiation),
            "confirmed" => Ok(DealStage::Confirmed),
            "lost" => Ok(DealStage::Lost),
            other => Err(format!("unknown deal stage '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    Medium,
    High,
}

impl FromStr for TaskPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(TaskPriority::Low),
            "medium" => Ok(TaskPriority::Medium),
            "high" => Ok(TaskPriority::High),
            other => Err(format!("unknown task priority '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "in-progress")]
    InProgress,
    #[serde(rename = "completed")]
    Completed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in-progress",
            TaskStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "in-progress" | "in_progress" | "inprogress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Deal {
    #[serde(default, deserialize_with = "lenient::id")]
    pub id: String,
    #[serde(default, deserialize_with = "lenient::text", skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(default, deserialize_with = "lenient::text", skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(default, deserialize_with = "lenient::number", skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, deserialize_with = "lenient::text", skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(default, deserialize_with = "lenient::parsed", skip_serializing_if = "Option::is_none")]
    pub stage: Option<DealStage>,
    #[serde(default, deserialize_with = "lenient::percent", skip_serializing_if = "Option::is_none")]
    pub probability: Option<u8>,
    #[serde(default, alias = "probabilityLocked", deserialize_with = "lenient::flag")]
    pub probability_locked: bool,
    #[serde(default, deserialize_with = "lenient::text", skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(
        default,
        alias = "expectedClosure",
        deserialize_with = "lenient::date",
        skip_serializing_if = "Option::is_none"
    )]
    pub expected_closure: Option<NaiveDate>,
    #[serde(
        default,
        alias = "createdAt",
        deserialize_with = "lenient::timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<DateTime<Utc>>,
}

impl Deal {
    pub fn company_or_default(&self) -> &str {
        self.company.as_deref().unwrap_or(UNKNOWN_COMPANY)
    }

    pub fn product_or_default(&self) -> &str {
        self.product.as_deref().unwrap_or(UNKNOWN_PRODUCT)
    }

    pub fn value_or_zero(&self) -> f64 {
        self.value.filter(|v| v.is_finite()).unwrap_or(0.0)
    }

    /// Moves the deal to `stage`. The probability follows the stage unless
    /// it was set by hand.
    pub fn with_stage(mut self, stage: DealStage) -> Self {
        self.stage = Some(stage);
        if !self.probability_locked {
            self.probability = Some(stage.default_probability());
        }
        self
    }

    pub fn is_active(&self) -> bool {
        let active_status = self
            .status
            .as_deref()
            .map(|s| s.eq_ignore_ascii_case("active"))
            .unwrap_or(false);
        active_status || self.stage == Some(DealStage::Negotiation)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    #[serde(default, deserialize_with = "lenient::id")]
    pub id: String,
    #[serde(default, deserialize_with = "lenient::text", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient::text", skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(default, deserialize_with = "lenient::text", skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, deserialize_with = "lenient::text", skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, deserialize_with = "lenient::whole", skip_serializing_if = "Option::is_none")]
    pub rating: Option<u8>,
    #[serde(
        default,
        alias = "createdDate",
        deserialize_with = "lenient::timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_date: Option<DateTime<Utc>>,
}

impl Contact {
    pub fn name_or_default(&self) -> &str {
        self.name.as_deref().unwrap_or(UNNAMED_CONTACT)
    }

    pub fn company_or_default(&self) -> &str {
        self.company.as_deref().unwrap_or(UNKNOWN_COMPANY)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(default, deserialize_with = "lenient::id")]
    pub id: String,
    #[serde(default, deserialize_with = "lenient::text", skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "lenient::text", skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default, deserialize_with = "lenient::parsed", skip_serializing_if = "Option::is_none")]
    pub priority: Option<TaskPriority>,
    #[serde(default, deserialize_with = "lenient::parsed", skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(
        default,
        alias = "dueDate",
        deserialize_with = "lenient::date",
        skip_serializing_if = "Option::is_none"
    )]
    pub due_date: Option<NaiveDate>,
    #[serde(
        default,
        alias = "createdAt",
        deserialize_with = "lenient::timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn title_or_default(&self) -> &str {
        self.title.as_deref().unwrap_or(UNTITLED_TASK)
    }

    pub fn assignee_or_default(&self) -> &str {
        self.assignee.as_deref().unwrap_or(UNASSIGNED)
    }

    pub fn is_completed(&self) -> bool {
        self.status == Some(TaskStatus::Completed)
    }

    pub fn is_overdue(&self, today: NaiveDate) -> bool {
        !self.is_completed() && self.due_date.map(|due| due < today).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default, deserialize_with = "lenient::id")]
    pub id: String,
    #[serde(default, deserialize_with = "lenient::text", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient::text", skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, deserialize_with = "lenient::text", skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(
        default,
        alias = "uploadDate",
        deserialize_with = "lenient::timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub upload_date: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient::text", skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
}

impl Document {
    pub fn name_or_default(&self) -> &str {
        self.name.as_deref().unwrap_or(UNTITLED_DOCUMENT)
    }
}

/// Every table as read in one pass.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub deals: Vec<Deal>,
    pub contacts: Vec<Contact>,
    pub tasks: Vec<Task>,
    pub documents: Vec<Document>,
}

/// A row type stored in one of the CRM tables.
pub trait Record: Serialize + DeserializeOwned + Default {
    const TABLE: Table;

    fn id(&self) -> &str;

    /// Parses a raw row. Never fails: anything unreadable becomes an empty record.
    fn from_row(row: &Value) -> Self {
        serde_json::from_value(row.clone()).unwrap_or_default()
    }

    fn to_row(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl Record for Deal {
    const TABLE: Table = Table::Deals;

    fn id(&self) -> &str {
        &self.id
    }
}

impl Record for Contact {
    const TABLE: Table = Table::Contacts;

    fn id(&self) -> &str {
        &self.id
    }
}

impl Record for Task {
    const TABLE: Table = Table::Tasks;

    fn id(&self) -> &str {
        &self.id
    }
}

impl Record for Document {
    const TABLE: Table = Table::Documents;

    fn id(&self) -> &str {
        &self.id
    }
}

/// Case-insensitive substring search over the text fields a list view filters on.
pub trait Searchable {
    fn search_fields(&self) -> Vec<Option<&str>>;

    fn matches(&self, query: &str) -> bool {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return true;
        }
        self.search_fields()
            .into_iter()
            .flatten()
            .any(|field| field.to_lowercase().contains(&needle))
    }
}

impl Searchable for Deal {
    fn search_fields(&self) -> Vec<Option<&str>> {
        vec![self.company.as_deref(), self.product.as_deref()]
    }
}

impl Searchable for Contact {
    fn search_fields(&self) -> Vec<Option<&str>> {
        vec![
            self.name.as_deref(),
            self.company.as_deref(),
            self.email.as_deref(),
        ]
    }
}

impl Searchable for Task {
    fn search_fields(&self) -> Vec<Option<&str>> {
        vec![self.title.as_deref(), self.assignee.as_deref()]
    }
}

impl Searchable for Document {
    fn search_fields(&self) -> Vec<Option<&str>> {
        vec![
            self.name.as_deref(),
            self.company.as_deref(),
            self.category.as_deref(),
        ]
    }
}

pub fn search<'a, T: Searchable>(items: &'a [T], query: &str) -> Vec<&'a T> {
    items.iter().filter(|item| item.matches(query)).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationType {
    Deal,
    Contact,
    Task,
    Document,
    System,
    Interaction,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::Deal => "deal",
            NotificationType::Contact => "contact",
            NotificationType::Task => "task",
            NotificationType::Document => "document",
            NotificationType::System => "system",
            NotificationType::Interaction => "interaction",
        }
    }
}

impl FromStr for NotificationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deal" => Ok(NotificationType::Deal),
            "contact" => Ok(NotificationType::Contact),
            "task" => Ok(NotificationType::Task),
            "document" => Ok(NotificationType::Document),
            "system" => Ok(NotificationType::System),
            "interaction" => Ok(NotificationType::Interaction),
            other => Err(format!("unknown notification type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationPriority {
    High,
    Medium,
    Low,
}

impl NotificationPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationPriority::High => "high",
            NotificationPriority::Medium => "medium",
            NotificationPriority::Low => "low",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub priority: NotificationPriority,
    pub title: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub read: bool,
    pub actionable: bool,
    pub related_id: String,
}

impl Notification {
    pub fn new(
        notification_type: NotificationType,
        priority: NotificationPriority,
        title: impl Into<String>,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
        related_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            notification_type,
            priority,
            title: title.into(),
            message: message.into(),
            timestamp,
            read: false,
            actionable: matches!(
                notification_type,
                NotificationType::Deal | NotificationType::Task
            ),
            related_id: related_id.into(),
        }
    }
}

/// Field deserializers that turn malformed values into `None` instead of errors.
mod lenient {
    use std::str::FromStr;

    use chrono::{DateTime, NaiveDate, Utc};
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        Ok(match Value::deserialize(deserializer)? {
            Value::String(s) => s,
            Value::Number(n) => n.to_string(),
            _ => String::new(),
        })
    }

    pub fn text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
        Ok(match Value::deserialize(deserializer)? {
            Value::String(s) if !s.trim().is_empty() => Some(s),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    }

    pub fn number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
        let value = match Value::deserialize(deserializer)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        Ok(value.filter(|v| v.is_finite()))
    }

    pub fn whole<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u8>, D::Error> {
        Ok(number(deserializer)?
            .filter(|v| (0.0..=255.0).contains(v))
            .map(|v| v.round() as u8))
    }

    /// Whole number in 0..=100; anything else is absent.
    pub fn percent<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u8>, D::Error> {
        Ok(whole(deserializer)?.filter(|v| *v <= 100))
    }

    pub fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        Ok(match Value::deserialize(deserializer)? {
            Value::Bool(b) => b,
            Value::String(s) => s.trim().eq_ignore_ascii_case("true"),
            _ => false,
        })
    }

    pub fn parsed<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: FromStr,
    {
        Ok(match Value::deserialize(deserializer)? {
            Value::String(s) => s.parse().ok(),
            _ => None,
        })
    }

    pub fn date<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<NaiveDate>, D::Error> {
        Ok(match Value::deserialize(deserializer)? {
            Value::String(s) => parse_date(&s),
            _ => None,
        })
    }

    pub fn timestamp<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        Ok(match Value::deserialize(deserializer)? {
            Value::String(s) => parse_timestamp(&s),
            _ => None,
        })
    }

    fn parse_date(raw: &str) -> Option<NaiveDate> {
        let raw = raw.trim();
        NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .ok()
            .or_else(|| parse_timestamp(raw).map(|ts| ts.date_naive()))
    }

    fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
        let raw = raw.trim();
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Some(ts.with_timezone(&Utc));
        }
        NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc())
    }
}
