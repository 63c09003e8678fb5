//! Weighted complexity scoring for work items and goals.
//!
//! Each factor maps through a fixed step function to a 0-100 sub-score which
//! is multiplied by the factor weight. Weights per subject sum to 1.0.

use serde::Serialize;

use crate::traits::{Goal, WorkItem};
use crate::types::{ComplexityTier, Effort, WorkItemType};

pub const SIMPLE_MAX: u8 = 35;
pub const MEDIUM_MAX: u8 = 65;

const W_ITEM_TYPE: f64 = 0.25;
const W_EFFORT: f64 = 0.25;
const W_DEPENDENCIES: f64 = 0.15;
const W_DESCRIPTION: f64 = 0.15;
const W_PRIORITY: f64 = 0.10;
const W_RETRIES: f64 = 0.10;

const W_GOAL_DESCRIPTION: f64 = 0.35;
const W_GOAL_CRITERIA: f64 = 0.30;
const W_GOAL_PRIORITY: f64 = 0.15;
const W_GOAL_BUDGET: f64 = 0.20;

#[derive(Debug, Clone, Serialize)]
pub struct ComplexityFactor {
    pub name: &'static str,
    /// The observed input, for explanations.
    pub value: String,
    pub sub_score: f64,
    pub weight: f64,
}

impl ComplexityFactor {
    pub fn contribution(&self) -> f64 {
        self.sub_score * self.weight
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ComplexityScore {
    pub score: u8,
    pub tier: ComplexityTier,
    pub factors: Vec<ComplexityFactor>,
}

impl ComplexityScore {
    fn from_factors(factors: Vec<ComplexityFactor>) -> Self {
        let total: f64 = factors.iter().map(ComplexityFactor::contribution).sum();
        let score = total.round().clamp(0.0, 100.0) as u8;
        Self {
            score,
            tier: tier_for_score(score),
            factors,
        }
    }

    /// Factors sorted by weighted contribution, largest first.
    pub fn top_factors(&self, n: usize) -> Vec<&ComplexityFactor> {
        let mut sorted: Vec<&ComplexityFactor> = self.factors.iter().collect();
        sorted.sort_by(|a, b| b.contribution().total_cmp(&a.contribution()));
        sorted.truncate(n);
        sorted
    }
}

pub fn tier_for_score(score: u8) -> ComplexityTier {
    if score <= SIMPLE_MAX {
        ComplexityTier::Simple
    } else if score <= MEDIUM_MAX {
        ComplexityTier::Medium
    } else {
        ComplexityTier::Complex
    }
}

fn factor(name: &'static str, value: impl ToString, sub_score: f64, weight: f64) -> ComplexityFactor {
    ComplexityFactor {
        name,
        value: value.to_string(),
        sub_score,
        weight,
    }
}

fn item_type_score(t: WorkItemType) -> f64 {
    match t {
        WorkItemType::Doc => 20.0,
        WorkItemType::Test => 40.0,
        WorkItemType::Analysis => 50.0,
        WorkItemType::Refactor => 60.0,
        WorkItemType::Code => 70.0,
    }
}

fn effort_score(e: Effort) -> f64 {
    match e {
        Effort::S => 20.0,
        Effort::M => 45.0,
        Effort::L => 70.0,
        Effort::XL => 95.0,
    }
}

fn dependency_score(n: usize) -> f64 {
    match n {
        0 => 10.0,
        1..=2 => 35.0,
        3..=5 => 65.0,
        _ => 90.0,
    }
}

fn description_score(len: usize) -> f64 {
    match len {
        0..=99 => 15.0,
        100..=299 => 40.0,
        300..=799 => 65.0,
        _ => 90.0,
    }
}

fn priority_score(p: i32) -> f64 {
    if p >= 80 {
        80.0
    } else if p >= 50 {
        55.0
    } else if p >= 20 {
        35.0
    } else {
        15.0
    }
}

fn retry_score(n: i32) -> f64 {
    match n {
        i32::MIN..=0 => 10.0,
        1 => 50.0,
        _ => 85.0,
    }
}

fn criteria_score(n: usize) -> f64 {
    match n {
        0 => 10.0,
        1..=2 => 35.0,
        3..=5 => 60.0,
        _ => 85.0,
    }
}

fn budget_score(tokens: Option<i64>) -> f64 {
    match tokens {
        None => 50.0,
        Some(t) if t < 10_000 => 15.0,
        Some(t) if t < 100_000 => 40.0,
        Some(t) if t < 500_000 => 65.0,
        Some(_) => 85.0,
    }
}

pub fn score_work_item(item: &WorkItem) -> ComplexityScore {
    let desc_len = item.description.chars().count();
    ComplexityScore::from_factors(vec![
        factor("item_type", item.item_type, item_type_score(item.item_type), W_ITEM_TYPE),
        factor(
            "estimated_effort",
            item.estimated_effort,
            effort_score(item.estimated_effort),
            W_EFFORT,
        ),
        factor(
            "dependencies",
            item.dependencies.len(),
            dependency_score(item.dependencies.len()),
            W_DEPENDENCIES,
        ),
        factor("description_length", desc_len, description_score(desc_len), W_DESCRIPTION),
        factor("priority", item.priority, priority_score(item.priority), W_PRIORITY),
        factor("retry_count", item.retry_count, retry_score(item.retry_count), W_RETRIES),
    ])
}

pub fn score_goal(goal: &Goal) -> ComplexityScore {
    let desc_len = goal.description.chars().count();
    let criteria = goal.success_criteria.len();
    ComplexityScore::from_factors(vec![
        factor(
            "description_length",
            desc_len,
            description_score(desc_len),
            W_GOAL_DESCRIPTION,
        ),
        factor("success_criteria", criteria, criteria_score(criteria), W_GOAL_CRITERIA),
        factor("priority", goal.priority, priority_score(goal.priority), W_GOAL_PRIORITY),
        factor(
            "budget_tokens",
            goal.budget_tokens
                .map(|t| t.to_string())
                .unwrap_or_else(|| "unbounded".into()),
            budget_score(goal.budget_tokens),
            W_GOAL_BUDGET,
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{NewGoal, NewWorkItem};

    fn item(item_type: WorkItemType, effort: Effort, deps: usize, desc_len: usize) -> WorkItem {
        WorkItem::new(
            "g",
            NewWorkItem {
                title: "t".into(),
                description: "x".repeat(desc_len),
                item_type,
                estimated_effort: effort,
                dependencies: (0..deps).map(|i| format!("d{i}")).collect(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn weights_sum_to_one() {
        let item_sum = W_ITEM_TYPE + W_EFFORT + W_DEPENDENCIES + W_DESCRIPTION + W_PRIORITY + W_RETRIES;
        let goal_sum = W_GOAL_DESCRIPTION + W_GOAL_CRITERIA + W_GOAL_PRIORITY + W_GOAL_BUDGET;
        assert!((item_sum - 1.0).abs() < 1e-9);
        assert!((goal_sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn small_doc_is_simple() {
        // 20*.25 + 20*.25 + 10*.15 + 15*.15 + 55*.10 + 10*.10 = 20.25
        let s = score_work_item(&item(WorkItemType::Doc, Effort::S, 0, 10));
        assert_eq!(s.score, 20);
        assert_eq!(s.tier, ComplexityTier::Simple);
    }

    #[test]
    fn large_code_change_is_complex() {
        // 70*.25 + 95*.25 + 65*.15 + 90*.15 + 55*.10 + 10*.10 = 71
        let s = score_work_item(&item(WorkItemType::Code, Effort::XL, 4, 1000));
        assert_eq!(s.score, 71);
        assert_eq!(s.tier, ComplexityTier::Complex);
    }

    #[test]
    fn tier_thresholds_are_inclusive() {
        assert_eq!(tier_for_score(35), ComplexityTier::Simple);
        assert_eq!(tier_for_score(36), ComplexityTier::Medium);
        assert_eq!(tier_for_score(65), ComplexityTier::Medium);
        assert_eq!(tier_for_score(66), ComplexityTier::Complex);
    }

    #[test]
    fn top_factors_are_ordered_by_contribution() {
        let s = score_work_item(&item(WorkItemType::Code, Effort::XL, 0, 10));
        let top: Vec<&str> = s.top_factors(3).iter().map(|f| f.name).collect();
        assert_eq!(top, vec!["estimated_effort", "item_type", "priority"]);
    }

    #[test]
    fn goal_scoring_uses_criteria_and_budget() {
        let goal = Goal::new(NewGoal {
            title: "g".into(),
            description: "y".repeat(400),
            success_criteria: vec!["a".into(), "b".into(), "c".into()],
            budget_tokens: Some(250_000),
            ..Default::default()
        });
        // 65*.35 + 60*.30 + 55*.15 + 65*.20 = 62
        let s = score_goal(&goal);
        assert_eq!(s.score, 62);
        assert_eq!(s.tier, ComplexityTier::Medium);
        assert_eq!(s.factors.len(), 4);
    }
}
