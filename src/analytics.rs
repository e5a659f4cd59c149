use std::collections::{BTreeMap, HashSet};

use chrono::NaiveDate;
use serde::Serialize;

use crate::models::{Contact, Deal, DealStage, Task, UNKNOWN_COMPANY};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Kpis {
    pub total_revenue: f64,
    pub active_deal_count: usize,
    pub task_completion_rate: u32,
    pub average_deal_value: f64,
    pub company_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageSummary {
    /// `None` collects deals that carry no readable stage.
    pub stage: Option<DealStage>,
    pub deal_count: usize,
    pub total_value: f64,
    pub weighted_value: f64,
}

impl StageSummary {
    pub fn label(&self) -> &'static str {
        self.stage.map(|s| s.as_str()).unwrap_or("Unstaged")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanyRevenue {
    pub company: String,
    pub deal_count: usize,
    pub total_value: f64,
}

pub fn compute_kpis(deals: &[Deal], contacts: &[Contact], tasks: &[Task]) -> Kpis {
    Kpis {
        total_revenue: total_revenue(deals),
        active_deal_count: active_deal_count(deals),
        task_completion_rate: task_completion_rate(tasks),
        average_deal_value: average_deal_value(deals),
        company_count: company_count(contacts),
    }
}

pub fn total_revenue(deals: &[Deal]) -> f64 {
    deals.iter().map(Deal::value_or_zero).sum()
}

pub fn active_deal_count(deals: &[Deal]) -> usize {
    deals.iter().filter(|deal| deal.is_active()).count()
}

pub fn task_completion_rate(tasks: &[Task]) -> u32 {
    if tasks.is_empty() {
        return 0;
    }
    let completed = tasks.iter().filter(|task| task.is_completed()).count();
    ((completed as f64 / tasks.len() as f64) * 100.0).round() as u32
}

pub fn average_deal_value(deals: &[Deal]) -> f64 {
    if deals.is_empty() {
        return 0.0;
    }
    (total_revenue(deals) / deals.len() as f64).round()
}

pub fn company_count(contacts: &[Contact]) -> usize {
    contacts
        .iter()
        .filter_map(|contact| contact.company.as_deref())
        .map(str::trim)
        .filter(|company| !company.is_empty())
        .collect::<HashSet<_>>()
        .len()
}

fn weighted_value(deal: &Deal) -> f64 {
    let probability = deal
        .probability
        .or_else(|| deal.stage.map(|s| s.default_probability()))
        .unwrap_or(0)
        .min(100);
    deal.value_or_zero() * f64::from(probability) / 100.0
}

/// Sums deals per stage in pipeline order, with unstaged deals last.
pub fn pipeline_by_stage(deals: &[Deal]) -> Vec<StageSummary> {
    let mut summaries: Vec<StageSummary> = DealStage::PIPELINE
        .iter()
        .map(|stage| Some(*stage))
        .chain(std::iter::once(None))
        .map(|stage| StageSummary {
            stage,
            deal_count: 0,
            total_value: 0.0,
            weighted_value: 0.0,
        })
        .collect();

    for deal in deals {
        let index = match deal.stage {
            Some(stage) => DealStage::PIPELINE
                .iter()
                .position(|s| *s == stage)
                .unwrap_or(DealStage::PIPELINE.len()),
            None => DealStage::PIPELINE.len(),
        };
        let entry = &mut summaries[index];
        entry.deal_count += 1;
        entry.total_value += deal.value_or_zero();
        entry.weighted_value += weighted_value(deal);
    }

    summaries
}

pub fn weighted_pipeline_value(deals: &[Deal]) -> f64 {
    deals
        .iter()
        .filter(|deal| deal.stage != Some(DealStage::Lost))
        .map(weighted_value)
        .sum()
}

pub fn top_companies(deals: &[Deal], limit: usize) -> Vec<CompanyRevenue> {
    let mut map: BTreeMap<String, (usize, f64)> = BTreeMap::new();

    for deal in deals {
        let company = deal
            .company
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or(UNKNOWN_COMPANY);
        let entry = map.entry(company.to_string()).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += deal.value_or_zero();
    }

    let mut values: Vec<CompanyRevenue> = map
        .into_iter()
        .map(|(company, (deal_count, total_value))| CompanyRevenue {
            company,
            deal_count,
            total_value,
        })
        .collect();
    // BTreeMap order gives the name tie-break; the sort is stable.
    values.sort_by(|a, b| {
        b.total_value
            .partial_cmp(&a.total_value)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    values.truncate(limit);
    values
}

pub fn open_task_count(tasks: &[Task]) -> usize {
    tasks.iter().filter(|task| !task.is_completed()).count()
}

pub fn overdue_task_count(tasks: &[Task], today: NaiveDate) -> usize {
    tasks.iter().filter(|task| task.is_overdue(today)).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TaskPriority, TaskStatus};
    use proptest::prelude::*;

    fn deal(value: Option<f64>, stage: Option<DealStage>, status: Option<&str>) -> Deal {
        Deal {
            value,
            stage,
            status: status.map(str::to_string),
            ..Deal::default()
        }
    }

    fn task(status: TaskStatus) -> Task {
        Task {
            status: Some(status),
            priority: Some(TaskPriority::Medium),
            ..Task::default()
        }
    }

    #[test]
    fn dashboard_scenario_matches_expected_kpis() {
        let deals = vec![
            deal(Some(100_000.0), Some(DealStage::Negotiation), Some("active")),
            deal(Some(50_000.0), Some(DealStage::Confirmed), Some("closed")),
        ];

        let kpis = compute_kpis(&deals, &[], &[]);
        assert_eq!(kpis.total_revenue, 150_000.0);
        assert_eq!(kpis.active_deal_count, 1);
        assert_eq!(kpis.average_deal_value, 75_000.0);
        assert_eq!(kpis.task_completion_rate, 0);
        assert_eq!(kpis.company_count, 0);
    }

    #[test]
    fn empty_inputs_default_to_zero() {
        let kpis = compute_kpis(&[], &[], &[]);
        assert_eq!(
            kpis,
            Kpis {
                total_revenue: 0.0,
                active_deal_count: 0,
                task_completion_rate: 0,
                average_deal_value: 0.0,
                company_count: 0,
            }
        );
    }

    #[test]
    fn active_counts_status_or_negotiation_stage() {
        let deals = vec![
            deal(None, Some(DealStage::Inquiry), Some("Active")),
            deal(None, Some(DealStage::Negotiation), None),
            deal(None, Some(DealStage::Negotiation), Some("active")),
            deal(None, Some(DealStage::Lost), Some("closed")),
            deal(None, None, None),
        ];
        assert_eq!(active_deal_count(&deals), 3);
    }

    #[test]
    fn completion_rate_rounds_to_nearest() {
        let tasks = vec![
            task(TaskStatus::Completed),
            task(TaskStatus::Pending),
            task(TaskStatus::InProgress),
        ];
        assert_eq!(task_completion_rate(&tasks), 33);

        let tasks = vec![
            task(TaskStatus::Completed),
            task(TaskStatus::Completed),
            task(TaskStatus::Pending),
        ];
        assert_eq!(task_completion_rate(&tasks), 67);
    }

    #[test]
    fn company_count_ignores_blank_and_duplicate_names() {
        let contacts: Vec<Contact> = ["Acme", "Acme", " ", "Globex"]
            .iter()
            .map(|c| Contact {
                company: Some(c.to_string()),
                ..Contact::default()
            })
            .chain(std::iter::once(Contact::default()))
            .collect();
        assert_eq!(company_count(&contacts), 2);
    }

    #[test]
    fn pipeline_groups_by_stage_with_weighted_value() {
        let deals = vec![
            deal(Some(1000.0), Some(DealStage::Inquiry), None).with_stage(DealStage::Inquiry),
            deal(Some(2000.0), Some(DealStage::Negotiation), None),
            deal(Some(500.0), None, None),
            deal(Some(4000.0), Some(DealStage::Lost), None),
        ];

        let pipeline = pipeline_by_stage(&deals);
        assert_eq!(pipeline.len(), 5);
        assert_eq!(pipeline[0].label(), "Inquiry");
        assert_eq!(pipeline[0].weighted_value, 400.0);
        assert_eq!(pipeline[1].weighted_value, 1400.0);
        assert_eq!(pipeline[2].deal_count, 0);
        assert_eq!(pipeline[4].label(), "Unstaged");
        assert_eq!(pipeline[4].total_value, 500.0);

        assert_eq!(weighted_pipeline_value(&deals), 1800.0);
    }

    #[test]
    fn top_companies_rank_by_value_then_name() {
        let named = |company: &str, value: f64| Deal {
            company: Some(company.to_string()),
            value: Some(value),
            ..Deal::default()
        };
        let deals = vec![
            named("Nord Freight", 300.0),
            named("Kochi Spice", 200.0),
            named("Nord Freight", 100.0),
            named("Atlas Metals", 400.0),
            Deal {
                value: Some(50.0),
                ..Deal::default()
            },
        ];

        let top = top_companies(&deals, 3);
        let names: Vec<&str> = top.iter().map(|c| c.company.as_str()).collect();
        assert_eq!(names, vec!["Atlas Metals", "Nord Freight", "Kochi Spice"]);
        assert_eq!(top[1].deal_count, 2);

        let all = top_companies(&deals, 10);
        assert_eq!(all.last().map(|c| c.company.as_str()), Some(UNKNOWN_COMPANY));
    }

    #[test]
    fn overdue_tasks_exclude_completed() {
        let today = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        let yesterday = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        let tasks = vec![
            Task {
                due_date: Some(yesterday),
                status: Some(TaskStatus::Pending),
                ..Task::default()
            },
            Task {
                due_date: Some(yesterday),
                status: Some(TaskStatus::Completed),
                ..Task::default()
            },
            Task {
                due_date: Some(today),
                ..Task::default()
            },
        ];
        assert_eq!(open_task_count(&tasks), 2);
        assert_eq!(overdue_task_count(&tasks, today), 1);
    }

    fn arb_deal() -> impl Strategy<Value = Deal> {
        (
            proptest::option::of(0.0f64..1_000_000.0),
            proptest::option::of(prop_oneof![
                Just(DealStage::Inquiry),
                Just(DealStage::Negotiation),
                Just(DealStage::Confirmed),
                Just(DealStage::Lost),
            ]),
        )
            .prop_map(|(value, stage)| Deal {
                value,
                stage,
                ..Deal::default()
            })
    }

    fn arb_task() -> impl Strategy<Value = Task> {
        proptest::option::of(prop_oneof![
            Just(TaskStatus::Pending),
            Just(TaskStatus::InProgress),
            Just(TaskStatus::Completed),
        ])
        .prop_map(|status| Task {
            status,
            ..Task::default()
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_total_revenue_sums_values(deals in proptest::collection::vec(arb_deal(), 0..50)) {
            let expected: f64 = deals.iter().map(|d| d.value.unwrap_or(0.0)).sum();
            prop_assert!((total_revenue(&deals) - expected).abs() < 1e-6);
        }

        #[test]
        fn prop_completion_rate_is_a_percentage(tasks in proptest::collection::vec(arb_task(), 0..50)) {
            let rate = task_completion_rate(&tasks);
            prop_assert!(rate <= 100);
            if tasks.is_empty() {
                prop_assert_eq!(rate, 0);
            }
        }

        #[test]
        fn prop_recomputing_is_idempotent(deals in proptest::collection::vec(arb_deal(), 0..30)) {
            let first = compute_kpis(&deals, &[], &[]);
            let second = compute_kpis(&deals, &[], &[]);
            prop_assert_eq!(first, second);
        }
    }
}
