use std::fmt::Write;

use chrono::{DateTime, Utc};

use crate::analytics;
use crate::models::{Notification, Snapshot};

pub const TOP_COMPANY_LIMIT: usize = 5;
pub const RECENT_NOTIFICATION_LIMIT: usize = 10;

pub fn build_report(
    title: Option<&str>,
    generated_at: DateTime<Utc>,
    snapshot: &Snapshot,
    notifications: &[Notification],
) -> String {
    let kpis = analytics::compute_kpis(&snapshot.deals, &snapshot.contacts, &snapshot.tasks);
    let pipeline = analytics::pipeline_by_stage(&snapshot.deals);
    let companies = analytics::top_companies(&snapshot.deals, TOP_COMPANY_LIMIT);
    let today = generated_at.date_naive();

    let mut output = String::new();

    let _ = writeln!(output, "# {}", title.unwrap_or("EXIM CRM Report"));
    let _ = writeln!(output, "Generated {}", generated_at.format("%Y-%m-%d %H:%M UTC"));
    let _ = writeln!(output);
    let _ = writeln!(output, "## Key Figures");
    let _ = writeln!(output, "- Total revenue: {:.2}", kpis.total_revenue);
    let _ = writeln!(output, "- Active deals: {}", kpis.active_deal_count);
    let _ = writeln!(output, "- Average deal value: {:.0}", kpis.average_deal_value);
    let _ = writeln!(
        output,
        "- Weighted pipeline: {:.2}",
        analytics::weighted_pipeline_value(&snapshot.deals)
    );
    let _ = writeln!(output, "- Task completion rate: {}%", kpis.task_completion_rate);
    let _ = writeln!(output, "- Companies in contacts: {}", kpis.company_count);
    let _ = writeln!(output, "- Documents on file: {}", snapshot.documents.len());

    let _ = writeln!(output);
    let _ = writeln!(output, "## Pipeline by Stage");

    if snapshot.deals.is_empty() {
        let _ = writeln!(output, "No deals recorded.");
    } else {
        for stage in pipeline.iter().filter(|s| s.deal_count > 0) {
            let _ = writeln!(
                output,
                "- {}: {} deals, value {:.2} (weighted {:.2})",
                stage.label(),
                stage.deal_count,
                stage.total_value,
                stage.weighted_value
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Top Companies");

    if companies.is_empty() {
        let _ = writeln!(output, "No deals recorded.");
    } else {
        for company in companies.iter() {
            let _ = writeln!(
                output,
                "- {}: {:.2} across {} deals",
                company.company, company.total_value, company.deal_count
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Tasks");
    let _ = writeln!(
        output,
        "- Open: {} (overdue: {})",
        analytics::open_task_count(&snapshot.tasks),
        analytics::overdue_task_count(&snapshot.tasks, today)
    );

    let mut overdue: Vec<_> = snapshot
        .tasks
        .iter()
        .filter(|task| task.is_overdue(today))
        .collect();
    overdue.sort_by_key(|task| task.due_date);
    for task in overdue.iter().take(5) {
        let _ = writeln!(
            output,
            "  - {} ({}), due {}",
            task.title_or_default(),
            task.assignee_or_default(),
            task.due_date.map(|d| d.to_string()).unwrap_or_default()
        );
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Recent Notifications");

    if notifications.is_empty() {
        let _ = writeln!(output, "No notifications.");
    } else {
        for notification in notifications.iter().take(RECENT_NOTIFICATION_LIMIT) {
            let _ = writeln!(
                output,
                "- [{}] {} on {}: {}",
                notification.priority.as_str(),
                notification.title,
                notification.timestamp.format("%Y-%m-%d"),
                notification.message
            );
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    use crate::models::{Deal, Record, Task};
    use crate::notifications;

    #[test]
    fn empty_snapshot_renders_placeholders() {
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap();
        let report = build_report(None, now, &Snapshot::default(), &[]);

        assert!(report.starts_with("# EXIM CRM Report\nGenerated 2026-10-19 09:00 UTC"));
        assert!(report.contains("- Total revenue: 0.00"));
        assert!(report.contains("- Task completion rate: 0%"));
        assert!(report.contains("No deals recorded."));
        assert!(report.contains("- Open: 0 (overdue: 0)"));
        assert!(report.contains("No notifications."));
    }

    #[test]
    fn report_lists_pipeline_companies_and_alerts() {
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap();
        let snapshot = Snapshot {
            deals: vec![
                Deal::from_row(&json!({"company": "Atlas Metals", "value": 100000, "stage": "Negotiation", "probability": 80, "status": "active"})),
                Deal::from_row(&json!({"company": "Nord Freight", "value": 50000, "stage": "Confirmed", "probability": 95})),
            ],
            tasks: vec![Task::from_row(&json!({"title": "Renew licence", "status": "pending", "due_date": "2026-10-01"}))],
            ..Snapshot::default()
        };
        let alerts = notifications::backfill(&snapshot, now);
        let report = build_report(Some("Q4 Review"), now, &snapshot, &alerts);

        assert!(report.starts_with("# Q4 Review"));
        assert!(report.contains("- Total revenue: 150000.00"));
        assert!(report.contains("- Average deal value: 75000"));
        assert!(report.contains("- Weighted pipeline: 127500.00"));
        assert!(report.contains("- Negotiation: 1 deals, value 100000.00 (weighted 80000.00)"));
        assert!(!report.contains("- Inquiry:"));
        assert!(report.contains("- Atlas Metals: 100000.00 across 1 deals"));
        assert!(report.contains("- Open: 1 (overdue: 1)"));
        assert!(report.contains("  - Renew licence (Unassigned), due 2026-10-01"));
        assert!(report.contains("- [high] Hot Deal Alert"));
    }
}
