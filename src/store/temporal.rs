//! Decision logic for price observations, shared by every backend.
//!
//! Backends read the open interval under their own lock or transaction,
//! ask [`plan_price_change`] what to do, and apply the plan atomically.

use chrono::{DateTime, SubsecRound, Utc};
use rust_decimal::Decimal;

use super::PriceInterval;
use crate::error::{StoreError, StoreResult};

/// What a backend must write for one observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PricePlan {
    NoPrice,
    Unchanged,
    /// Insert `[at, open)`; no prior history.
    Open { price: Decimal, at: DateTime<Utc> },
    /// Close interval `close_id` at `at` and insert `[at, open)`.
    Supersede {
        close_id: i64,
        previous: Decimal,
        price: Decimal,
        at: DateTime<Utc>,
    },
}

/// Truncate to microseconds, the precision of Postgres `timestamptz`.
pub fn normalize_instant(instant: DateTime<Utc>) -> DateTime<Utc> {
    instant.trunc_subsecs(6)
}

pub fn validate_code(code: &str) -> StoreResult<()> {
    if code.trim().is_empty() {
        return Err(StoreError::InvalidObservation(
            "product code must not be empty".to_string(),
        ));
    }
    if code.trim() != code {
        return Err(StoreError::InvalidObservation(format!(
            "product code '{}' has surrounding whitespace",
            code
        )));
    }
    Ok(())
}

pub fn plan_price_change(
    code: &str,
    open: Option<&PriceInterval>,
    price: Option<Decimal>,
    effective_from: DateTime<Utc>,
) -> StoreResult<PricePlan> {
    validate_code(code)?;
    let Some(price) = price else {
        return Ok(PricePlan::NoPrice);
    };
    if price < Decimal::ZERO {
        return Err(StoreError::InvalidObservation(format!(
            "negative price {} for {}",
            price, code
        )));
    }
    let at = normalize_instant(effective_from);

    let Some(open) = open else {
        return Ok(PricePlan::Open { price, at });
    };

    // Exact decimal equality; scale is ignored (1000.0 == 1000.00).
    if open.price == price {
        return Ok(PricePlan::Unchanged);
    }

    if at <= open.effective_from {
        return Err(StoreError::OutOfOrderObservation {
            code: code.to_string(),
            open_from: open.effective_from,
            observed: at,
        });
    }

    Ok(PricePlan::Supersede {
        close_id: open.id,
        previous: open.price,
        price,
        at,
    })
}

/// Structural backstop: reject a candidate interval that overlaps any
/// existing interval for the same code. Independent of the plan logic.
pub fn check_no_overlap(existing: &[PriceInterval], candidate: &PriceInterval) -> StoreResult<()> {
    if let Some(conflict) = existing
        .iter()
        .filter(|i| i.code == candidate.code && i.id != candidate.id)
        .find(|i| i.overlaps(candidate))
    {
        return Err(StoreError::OverlapRejected {
            code: candidate.code.clone(),
            detail: format!(
                "[{}, {}) overlaps interval {} starting {}",
                candidate.effective_from,
                candidate
                    .effective_to
                    .map_or_else(|| "open".to_string(), |t| t.to_string()),
                conflict.id,
                conflict.effective_from
            ),
        });
    }
    Ok(())
}
