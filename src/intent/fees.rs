use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::Serialize;

use crate::error::{AppError, AppResult};

/// Fee terms fixed on an intent at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FeeBreakdown {
    #[serde(with = "rust_decimal::serde::float")]
    pub fee_rate: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub fee_amount: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub total_amount: Decimal,
}

impl FeeBreakdown {
    /// `fee_rate` is a percentage; the fee is rounded to cents, midpoint away from zero
    pub fn compute(amount: Decimal, fee_rate: Decimal) -> AppResult<Self> {
        if amount <= Decimal::ZERO {
            return Err(AppError::Validation(format!(
                "Amount must be positive, got {}",
                amount
            )));
        }
        if fee_rate < Decimal::ZERO || fee_rate > dec!(100) {
            return Err(AppError::Validation(format!(
                "Fee rate must be between 0 and 100, got {}",
                fee_rate
            )));
        }

        let fee_amount = (amount * fee_rate / dec!(100))
            .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);

        Ok(Self {
            fee_rate,
            fee_amount,
            total_amount: amount + fee_amount,
        })
    }
}
