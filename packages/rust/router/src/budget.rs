//! Monthly cost guard.
//!
//! Spend is tracked per stage per calendar month (UTC). A dispatch is
//! affordable only if its projected cost fits under the stage's ceiling
//! together with everything already reserved this month.

use std::collections::HashMap;

use chrono::Utc;
use curricula_shared::{BudgetConfig, StageKind};

/// `YYYY-MM` for the current UTC month.
pub fn current_month() -> String {
    Utc::now().format("%Y-%m").to_string()
}

/// In-memory view of one month's spend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CostLedger {
    month: String,
    spent: HashMap<StageKind, f64>,
}

impl CostLedger {
    /// Build a ledger from persisted `(stage, spent)` rows.
    pub fn from_rows(month: &str, rows: &[(String, f64)]) -> Self {
        let spent = rows
            .iter()
            .filter_map(|(stage, amount)| stage.parse::<StageKind>().ok().map(|s| (s, *amount)))
            .collect();
        Self {
            month: month.to_string(),
            spent,
        }
    }

    pub fn month(&self) -> &str {
        &self.month
    }

    pub fn spent(&self, stage: StageKind) -> f64 {
        self.spent.get(&stage).copied().unwrap_or(0.0)
    }

    /// Start a fresh month if the calendar has rolled over.
    pub fn roll_to(&mut self, month: &str) {
        if self.month != month {
            tracing::info!(from = %self.month, to = %month, "cost ledger rolled over");
            self.month = month.to_string();
            self.spent.clear();
        }
    }

    /// Whether a dispatch costing `cost` fits under the stage's ceiling.
    /// Zero-cost dispatches always fit.
    pub fn can_afford(&self, budget: &BudgetConfig, stage: StageKind, cost: f64) -> bool {
        cost <= 0.0 || self.spent(stage) + cost <= budget.ceiling(stage)
    }

    pub fn reserve(&mut self, stage: StageKind, cost: f64) {
        *self.spent.entry(stage).or_insert(0.0) += cost;
    }

    /// Undo a reservation that could not be persisted.
    pub fn release(&mut self, month: &str, stage: StageKind, cost: f64) {
        if self.month == month {
            if let Some(spent) = self.spent.get_mut(&stage) {
                *spent = (*spent - cost).max(0.0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceiling_is_inclusive() {
        let budget = BudgetConfig {
            parsing_usd: 1.0,
            ..Default::default()
        };
        let mut ledger = CostLedger::from_rows("2026-10", &[("parsing".into(), 0.5)]);
        assert!(ledger.can_afford(&budget, StageKind::Parsing, 0.5));
        ledger.reserve(StageKind::Parsing, 0.5);
        assert!(!ledger.can_afford(&budget, StageKind::Parsing, 0.01));
        assert!(ledger.can_afford(&budget, StageKind::Parsing, 0.0));
    }

    #[test]
    fn release_undoes_a_reservation_in_the_same_month() {
        let mut ledger = CostLedger::from_rows("2026-10", &[]);
        ledger.reserve(StageKind::Parsing, 0.5);
        ledger.release("2026-09", StageKind::Parsing, 0.5);
        assert_eq!(ledger.spent(StageKind::Parsing), 0.5);
        ledger.release("2026-10", StageKind::Parsing, 0.5);
        assert_eq!(ledger.spent(StageKind::Parsing), 0.0);
    }

    #[test]
    fn zero_budget_affords_nothing_paid() {
        let budget = BudgetConfig {
            generation_usd: 0.0,
            ..Default::default()
        };
        let ledger = CostLedger::default();
        assert!(!ledger.can_afford(&budget, StageKind::Generation, 0.001));
    }

    #[test]
    fn rollover_clears_spend() {
        let mut ledger = CostLedger::from_rows(
            "2026-09",
            &[("search".into(), 4.0), ("bogus".into(), 1.0)],
        );
        assert_eq!(ledger.spent(StageKind::Search), 4.0);
        ledger.roll_to("2026-10");
        assert_eq!(ledger.month(), "2026-10");
        assert_eq!(ledger.spent(StageKind::Search), 0.0);
    }
}
