use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

mod analytics;
mod config;
mod db;
mod errors;
mod forms;
mod inbox;
#[cfg(test)]
mod memory_store;
mod models;
mod notifications;
mod report;
mod service;
mod store;

use config::{Config, LogFormat};
use db::PgStore;
use forms::{ContactForm, DealForm, DocumentForm, TaskForm};
use models::{DealStage, Notification, NotificationType, Table, TaskPriority, TaskStatus};
use service::{AnalyticsService, CrmService, NotificationService};
use store::{RecordStore, SignUpProfile};

#[derive(Parser)]
#[command(name = "exim-crm")]
#[command(about = "Pipeline, contact and alert insights for an EXIM trading desk", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load a demo pipeline
    Seed,
    /// Import rows for one table from a CSV file
    Import {
        #[arg(long)]
        table: Table,
        #[arg(long)]
        csv: PathBuf,
    },
    /// Register a user account
    SignUp {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        company: Option<String>,
    },
    /// Check credentials and print the session
    SignIn {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    /// Print dashboard KPIs
    Dashboard,
    /// List rows of a table, optionally filtered by a search string
    List {
        #[arg(long)]
        table: Table,
        #[arg(long, default_value = "")]
        search: String,
    },
    /// Create a deal
    AddDeal {
        #[arg(long)]
        company: String,
        #[arg(long)]
        product: String,
        #[arg(long, default_value_t = 0.0)]
        value: f64,
        #[arg(long)]
        currency: Option<String>,
        #[arg(long)]
        stage: Option<DealStage>,
        /// Fixes the probability instead of deriving it from the stage
        #[arg(long)]
        probability: Option<u8>,
        #[arg(long)]
        expected_closure: Option<NaiveDate>,
    },
    /// Move a deal to another stage
    SetStage {
        #[arg(long)]
        id: String,
        #[arg(long)]
        stage: DealStage,
    },
    /// Create a contact
    AddContact {
        #[arg(long)]
        name: String,
        #[arg(long)]
        company: Option<String>,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        rating: Option<u8>,
    },
    /// Set a contact's 1-5 rating
    RateContact {
        #[arg(long)]
        id: String,
        #[arg(long)]
        rating: u8,
    },
    /// Create a task
    AddTask {
        #[arg(long)]
        title: String,
        #[arg(long)]
        assignee: Option<String>,
        #[arg(long)]
        priority: Option<TaskPriority>,
        #[arg(long)]
        due: Option<NaiveDate>,
    },
    /// Change a task's status
    SetTaskStatus {
        #[arg(long)]
        id: String,
        #[arg(long)]
        status: TaskStatus,
    },
    /// Register an uploaded document
    AddDocument {
        #[arg(long)]
        name: String,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        company: Option<String>,
        #[arg(long)]
        status: Option<String>,
    },
    /// Move documents to another category
    MoveDocuments {
        #[arg(long)]
        category: String,
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Show alerts derived from the current records
    Notifications {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Only show one kind: deal, contact, task, document or system
        #[arg(long = "type")]
        kind: Option<NotificationType>,
        /// Mark the listed notifications as read
        #[arg(long)]
        mark_read: bool,
    },
    /// Follow live changes and print alerts until interrupted
    Watch,
    /// Generate a markdown report
    Report {
        #[arg(long)]
        title: Option<String>,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Text => registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init(),
    }
}

fn print_notification(notification: &Notification) {
    println!(
        "- [{}] {} ({}) {}: {}",
        notification.priority.as_str(),
        notification.title,
        notification.notification_type.as_str(),
        notification.timestamp.format("%Y-%m-%d %H:%M"),
        notification.message
    );
}

fn print_rows<T>(rows: &[T], search: &str) -> anyhow::Result<()>
where
    T: serde::Serialize + models::Searchable,
{
    let matches = models::search(rows, search);
    if matches.is_empty() {
        println!("No matching rows.");
    }
    for row in matches {
        println!("{}", serde_json::to_string(row)?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;
    init_tracing(config.log_format);

    let pg = Arc::new(PgStore::connect(config.database_url()?, config.max_connections).await?);
    let store: Arc<dyn RecordStore> = pg.clone();

    match cli.command {
        Commands::InitDb => {
            pg.init_db().await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            let inserted = pg.seed().await?;
            println!("Seeded {inserted} rows.");
        }
        Commands::Import { table, csv } => {
            let inserted = pg.import_csv(table, &csv).await?;
            println!("Inserted {inserted} {table} rows from {}.", csv.display());
        }
        Commands::SignUp {
            email,
            password,
            name,
            company,
        } => {
            let profile = SignUpProfile {
                full_name: name,
                company,
            };
            store.sign_up(&email, &password, profile).await?;
            println!("Account created. Check {email} for a verification link.");
        }
        Commands::SignIn { email, password } => {
            let session = store.sign_in(&email, &password).await?;
            println!("Signed in as {} until {}.", session.email, session.expires_at);
            println!("Access token: {}", session.access_token);
        }
        Commands::Dashboard => {
            let kpis = AnalyticsService::new(store).dashboard().await?;
            println!("Total revenue:        {:.2}", kpis.total_revenue);
            println!("Active deals:         {}", kpis.active_deal_count);
            println!("Average deal value:   {:.0}", kpis.average_deal_value);
            println!("Task completion rate: {}%", kpis.task_completion_rate);
            println!("Companies:            {}", kpis.company_count);
        }
        Commands::List { table, search } => {
            let snapshot = AnalyticsService::new(store).snapshot().await?;
            match table {
                Table::Deals => print_rows(&snapshot.deals, &search)?,
                Table::Contacts => print_rows(&snapshot.contacts, &search)?,
                Table::Tasks => print_rows(&snapshot.tasks, &search)?,
                Table::Documents => print_rows(&snapshot.documents, &search)?,
            }
        }
        Commands::AddDeal {
            company,
            product,
            value,
            currency,
            stage,
            probability,
            expected_closure,
        } => {
            let mut form = DealForm::new().company(company).product(product).value(value);
            if let Some(currency) = currency {
                form = form.currency(currency);
            }
            if let Some(stage) = stage {
                form = form.stage(stage);
            }
            if let Some(probability) = probability {
                form = form.probability(probability);
            }
            if let Some(date) = expected_closure {
                form = form.expected_closure(date);
            }
            let deal = CrmService::new(store).create_deal(form).await?;
            println!("Created deal {}.", deal.id);
        }
        Commands::SetStage { id, stage } => {
            let deal = CrmService::new(store).change_deal_stage(&id, stage).await?;
            println!(
                "Deal {} is now {} at {}%.",
                deal.id,
                stage,
                deal.probability.unwrap_or(0)
            );
        }
        Commands::AddContact {
            name,
            company,
            email,
            category,
            rating,
        } => {
            let mut form = ContactForm::new().name(name);
            if let Some(company) = company {
                form = form.company(company);
            }
            if let Some(email) = email {
                form = form.email(email);
            }
            if let Some(category) = category {
                form = form.category(category);
            }
            if let Some(rating) = rating {
                form = form.rating(rating);
            }
            let contact = CrmService::new(store).create_contact(form).await?;
            println!("Created contact {}.", contact.id);
        }
        Commands::RateContact { id, rating } => {
            let contact = CrmService::new(store).rate_contact(&id, rating).await?;
            println!("{} is now rated {rating}.", contact.name_or_default());
        }
        Commands::AddTask {
            title,
            assignee,
            priority,
            due,
        } => {
            let mut form = TaskForm::new().title(title);
            if let Some(assignee) = assignee {
                form = form.assignee(assignee);
            }
            if let Some(priority) = priority {
                form = form.priority(priority);
            }
            if let Some(due) = due {
                form = form.due_date(due);
            }
            let task = CrmService::new(store).create_task(form).await?;
            println!("Created task {}.", task.id);
        }
        Commands::SetTaskStatus { id, status } => {
            CrmService::new(store).update_task_status(&id, status).await?;
            println!("Task {id} is now {status}.");
        }
        Commands::AddDocument {
            name,
            category,
            company,
            status,
        } => {
            let mut form = DocumentForm::new().name(name);
            if let Some(category) = category {
                form = form.category(category);
            }
            if let Some(company) = company {
                form = form.company(company);
            }
            if let Some(status) = status {
                form = form.status(status);
            }
            let document = CrmService::new(store).upload_document(form).await?;
            println!("Registered document {}.", document.id);
        }
        Commands::MoveDocuments { category, ids } => {
            let moved = CrmService::new(store).move_documents(&ids, &category).await?;
            println!("Moved {moved} documents to {category}.");
        }
        Commands::Notifications {
            limit,
            kind,
            mark_read,
        } => {
            let mut service = NotificationService::new(store);
            service.backfill(Utc::now()).await?;
            let shown: Vec<Notification> = match kind {
                Some(kind) => service.inbox().of_type(kind).into_iter().cloned().collect(),
                None => service.inbox().iter().cloned().collect(),
            };
            if shown.is_empty() {
                println!("No notifications.");
                return Ok(());
            }
            println!("{} notifications:", shown.len());
            for notification in shown.iter().take(limit) {
                print_notification(notification);
                if mark_read {
                    service.inbox_mut().mark_read(notification.id);
                }
            }
            println!("{} unread.", service.inbox().unread_count());
        }
        Commands::Watch => {
            let mut service = NotificationService::new(store);
            let feed = service.subscribe().await?;
            service.backfill(Utc::now()).await?;
            for notification in service.inbox().iter() {
                print_notification(notification);
            }
            service.inbox_mut().mark_all_read();

            println!("Watching for changes (Ctrl-C to stop)...");
            let shutdown = async {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %err, "failed to listen for Ctrl-C");
                }
            };
            service.run(feed, shutdown, print_notification).await;
            println!("{} unread notifications.", service.inbox().unread_count());
        }
        Commands::Report { title, out } => {
            let snapshot = AnalyticsService::new(store.clone()).snapshot().await?;
            let mut service = NotificationService::new(store);
            service.backfill(Utc::now()).await?;
            let notifications: Vec<Notification> = service.inbox().iter().cloned().collect();
            let report = report::build_report(title.as_deref(), Utc::now(), &snapshot, &notifications);
            std::fs::write(&out, report)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}
