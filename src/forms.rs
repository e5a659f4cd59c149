//! Builders that collect form input and produce validated records.

use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::errors::ValidationError;
use crate::models::{Contact, Deal, DealStage, Document, Task, TaskPriority, TaskStatus};

fn required(value: Option<String>, field: &'static str) -> Result<String, ValidationError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(ValidationError::MissingField(field))
}

fn optional(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, Default)]
pub struct DealForm {
    company: Option<String>,
    product: Option<String>,
    value: Option<f64>,
    currency: Option<String>,
    stage: Option<DealStage>,
    probability: Option<u8>,
    status: Option<String>,
    expected_closure: Option<NaiveDate>,
}

impl DealForm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn company(mut self, company: impl Into<String>) -> Self {
        self.company = Some(company.into());
        self
    }

    pub fn product(mut self, product: impl Into<String>) -> Self {
        self.product = Some(product.into());
        self
    }

    pub fn value(mut self, value: f64) -> Self {
        self.value = Some(value);
        self
    }

    pub fn currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = Some(currency.into());
        self
    }

    pub fn stage(mut self, stage: DealStage) -> Self {
        self.stage = Some(stage);
        self
    }

    /// Sets the probability by hand; it then stays fixed across stage changes.
    pub fn probability(mut self, probability: u8) -> Self {
        self.probability = Some(probability);
        self
    }

    pub fn status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn expected_closure(mut self, date: NaiveDate) -> Self {
        self.expected_closure = Some(date);
        self
    }

    pub fn build(self, now: DateTime<Utc>) -> Result<Deal, ValidationError> {
        let company = required(self.company, "company")?;
        let product = required(self.product, "product")?;
        let value = self.value.unwrap_or(0.0);
        if !value.is_finite() || value < 0.0 {
            return Err(ValidationError::Negative("value"));
        }
        if let Some(p) = self.probability {
            if p > 100 {
                return Err(ValidationError::OutOfRange {
                    field: "probability",
                    min: 0.0,
                    max: 100.0,
                });
            }
        }

        let stage = self.stage.unwrap_or(DealStage::Inquiry);
        Ok(Deal {
            id: Uuid::new_v4().to_string(),
            company: Some(company),
            product: Some(product),
            value: Some(value),
            currency: Some(optional(self.currency).unwrap_or_else(|| "USD".to_string())),
            stage: Some(stage),
            probability: Some(self.probability.unwrap_or(stage.default_probability())),
            probability_locked: self.probability.is_some(),
            status: Some(optional(self.status).unwrap_or_else(|| "active".to_string())),
            expected_closure: self.expected_closure,
            created_at: Some(now),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContactForm {
    name: Option<String>,
    company: Option<String>,
    email: Option<String>,
    category: Option<String>,
    rating: Option<u8>,
}

impl ContactForm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn company(mut self, company: impl Into<String>) -> Self {
        self.company = Some(company.into());
        self
    }

    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn rating(mut self, rating: u8) -> Self {
        self.rating = Some(rating);
        self
    }

    pub fn build(self, now: DateTime<Utc>) -> Result<Contact, ValidationError> {
        let name = required(self.name, "name")?;
        let email = optional(self.email);
        if let Some(address) = &email {
            if !address.contains('@') {
                return Err(ValidationError::InvalidEmail(address.clone()));
            }
        }
        if let Some(rating) = self.rating {
            if !(1..=5).contains(&rating) {
                return Err(ValidationError::OutOfRange {
                    field: "rating",
                    min: 1.0,
                    max: 5.0,
                });
            }
        }

        Ok(Contact {
            id: Uuid::new_v4().to_string(),
            name: Some(name),
            company: optional(self.company),
            email,
            category: optional(self.category),
            rating: self.rating,
            created_date: Some(now),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskForm {
    title: Option<String>,
    assignee: Option<String>,
    priority: Option<TaskPriority>,
    status: Option<TaskStatus>,
    due_date: Option<NaiveDate>,
}

impl TaskForm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn assignee(mut self, assignee: impl Into<String>) -> Self {
        self.assignee = Some(assignee.into());
        self
    }

    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn due_date(mut self, due_date: NaiveDate) -> Self {
        self.due_date = Some(due_date);
        self
    }

    pub fn build(self, now: DateTime<Utc>) -> Result<Task, ValidationError> {
        Ok(Task {
            id: Uuid::new_v4().to_string(),
            title: Some(required(self.title, "title")?),
            assignee: optional(self.assignee),
            priority: Some(self.priority.unwrap_or(TaskPriority::Medium)),
            status: Some(self.status.unwrap_or(TaskStatus::Pending)),
            due_date: self.due_date,
            created_at: Some(now),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct DocumentForm {
    name: Option<String>,
    category: Option<String>,
    status: Option<String>,
    company: Option<String>,
}

impl DocumentForm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn company(mut self, company: impl Into<String>) -> Self {
        self.company = Some(company.into());
        self
    }

    pub fn build(self, now: DateTime<Utc>) -> Result<Document, ValidationError> {
        Ok(Document {
            id: Uuid::new_v4().to_string(),
            name: Some(required(self.name, "name")?),
            category: Some(optional(self.category).unwrap_or_else(|| "General".to_string())),
            status: Some(optional(self.status).unwrap_or_else(|| "active".to_string())),
            upload_date: Some(now),
            company: optional(self.company),
        })
    }
}
