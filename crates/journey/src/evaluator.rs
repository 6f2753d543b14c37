use chrono::{DateTime, Utc};
use tracing::debug;

use donorflow_core::types::DonationAggregates;

use crate::types::{AmountBasis, ConditionPredicate};

/// Evaluates condition-node predicates against a contact's donation
/// aggregates. Pure: no I/O, and the clock is passed in.
#[derive(Debug, Clone, Default)]
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    /// Creates a new evaluator.
    pub fn new() -> Self {
        Self
    }

    /// Returns the predicate's truth value.
    ///
    /// Missing data never errors: a predicate that needs a last donation date
    /// evaluates to `false` when the contact has none.
    pub fn evaluate(
        &self,
        predicate: &ConditionPredicate,
        aggregates: &DonationAggregates,
        now: DateTime<Utc>,
    ) -> bool {
        let result = match predicate {
            ConditionPredicate::HasDonated => aggregates.has_donated,
            ConditionPredicate::DonationAmountGt { value, basis } => {
                let amount = match basis {
                    AmountBasis::Total => aggregates.total_amount,
                    AmountBasis::Max => aggregates.max_amount,
                };
                amount > *value
            }
            ConditionPredicate::DaysSinceLastDonationGt { value } => {
                match aggregates.last_donation_date {
                    Some(last) => now.signed_duration_since(last).num_days() > *value,
                    None => false,
                }
            }
        };

        debug!(?predicate, result, "Condition evaluated");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn donor(total: f64, max: f64, days_ago: Option<i64>, now: DateTime<Utc>) -> DonationAggregates {
        DonationAggregates {
            has_donated: total > 0.0,
            last_donation_date: days_ago.map(|d| now - Duration::days(d)),
            total_amount: total,
            max_amount: max,
        }
    }

    #[test]
    fn test_has_donated() {
        let eval = ConditionEvaluator::new();
        let now = Utc::now();
        assert!(eval.evaluate(&ConditionPredicate::HasDonated, &donor(50.0, 50.0, Some(3), now), now));
        assert!(!eval.evaluate(&ConditionPredicate::HasDonated, &DonationAggregates::none(), now));
    }

    #[test]
    fn test_amount_is_strictly_greater() {
        let eval = ConditionEvaluator::new();
        let now = Utc::now();
        let agg = donor(100.0, 60.0, Some(1), now);

        let total_gt = |value| ConditionPredicate::DonationAmountGt {
            value,
            basis: AmountBasis::Total,
        };
        assert!(eval.evaluate(&total_gt(99.99), &agg, now));
        assert!(!eval.evaluate(&total_gt(100.0), &agg, now));

        let max_gt = ConditionPredicate::DonationAmountGt {
            value: 75.0,
            basis: AmountBasis::Max,
        };
        assert!(!eval.evaluate(&max_gt, &agg, now));
    }

    #[test]
    fn test_days_since_last_donation() {
        let eval = ConditionEvaluator::new();
        let now = Utc::now();
        let pred = ConditionPredicate::DaysSinceLastDonationGt { value: 30 };

        assert!(eval.evaluate(&pred, &donor(10.0, 10.0, Some(45), now), now));
        assert!(!eval.evaluate(&pred, &donor(10.0, 10.0, Some(30), now), now));
        assert!(!eval.evaluate(&pred, &donor(10.0, 10.0, Some(2), now), now));
    }

    #[test]
    fn test_missing_last_donation_date_is_false() {
        let eval = ConditionEvaluator::new();
        let now = Utc::now();
        // Even a negative threshold cannot be met without a date.
        let pred = ConditionPredicate::DaysSinceLastDonationGt { value: -1 };
        let agg = DonationAggregates {
            has_donated: true,
            last_donation_date: None,
            total_amount: 25.0,
            max_amount: 25.0,
        };
        assert!(!eval.evaluate(&pred, &agg, now));
    }
}
