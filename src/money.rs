//! Money handling
//!
//! All monetary quantities are arbitrary-precision decimals
//! (`rust_decimal::Decimal`), serialized as strings at every boundary.
//! No floating point is allowed in price, amount, or balance paths.
//!
//! ## Design Principles
//! 1. Single entry point: external amounts come in through [`parse_amount`]
//! 2. Explicit error handling: no silent truncation or clamping
//! 3. Basis-point math lives here, nowhere else

use rust_decimal::Decimal;
use thiserror::Error;

/// One hundred percent, in basis points.
pub const BPS_DENOMINATOR: u32 = 10_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MoneyError {
    #[error("amount is not a valid decimal: {0}")]
    Malformed(String),

    #[error("amount must be positive")]
    NotPositive,

    #[error("slippage out of range: {0} bps")]
    SlippageOutOfRange(u32),
}

/// Parse a client-supplied amount string.
///
/// Rejects anything that is not a strictly positive finite decimal.
/// `Decimal` has no NaN/Inf representation, so malformed text covers those.
pub fn parse_amount(raw: &str) -> Result<Decimal, MoneyError> {
    let amount: Decimal = raw
        .trim()
        .parse()
        .map_err(|_| MoneyError::Malformed(raw.to_string()))?;
    ensure_positive(amount)?;
    Ok(amount)
}

/// Validate an already-parsed amount at an engine boundary.
pub fn ensure_positive(amount: Decimal) -> Result<Decimal, MoneyError> {
    if amount <= Decimal::ZERO {
        return Err(MoneyError::NotPositive);
    }
    Ok(amount)
}

/// Minimum acceptable swap output for a quoted output and slippage bound.
///
/// `min_out = quoted × (1 − bps/10000)`
pub fn min_output(quoted_out: Decimal, slippage_bps: u32) -> Result<Decimal, MoneyError> {
    if slippage_bps >= BPS_DENOMINATOR {
        return Err(MoneyError::SlippageOutOfRange(slippage_bps));
    }
    let keep = Decimal::from(BPS_DENOMINATOR - slippage_bps) / Decimal::from(BPS_DENOMINATOR);
    Ok(quoted_out * keep)
}

/// Fee charged on `amount` at `fee_bps`.
pub fn fee_amount(amount: Decimal, fee_bps: u32) -> Decimal {
    amount * Decimal::from(fee_bps) / Decimal::from(BPS_DENOMINATOR)
}

/// Net amount after the platform fee.
pub fn net_of_fee(amount: Decimal, fee_bps: u32) -> Decimal {
    amount - fee_amount(amount, fee_bps)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_amount_accepts_positive_decimal() {
        assert_eq!(parse_amount("1.5").unwrap(), d("1.5"));
        assert_eq!(parse_amount(" 42 ").unwrap(), d("42"));
    }

    #[test]
    fn test_parse_amount_rejects_garbage() {
        assert!(matches!(parse_amount("NaN"), Err(MoneyError::Malformed(_))));
        assert!(matches!(parse_amount("1e999"), Err(MoneyError::Malformed(_))));
        assert!(matches!(parse_amount(""), Err(MoneyError::Malformed(_))));
    }

    #[test]
    fn test_parse_amount_rejects_non_positive() {
        assert_eq!(parse_amount("0"), Err(MoneyError::NotPositive));
        assert_eq!(parse_amount("-3"), Err(MoneyError::NotPositive));
    }

    #[test]
    fn test_min_output_applies_bps() {
        // 100 with 50 bps slippage -> 99.5
        assert_eq!(min_output(d("100"), 50).unwrap(), d("99.5"));
        // 0 bps keeps the full quote
        assert_eq!(min_output(d("100"), 0).unwrap(), d("100"));
    }

    #[test]
    fn test_min_output_rejects_full_slippage() {
        assert_eq!(
            min_output(d("100"), 10_000),
            Err(MoneyError::SlippageOutOfRange(10_000))
        );
    }

    #[test]
    fn test_fee_math() {
        // 25 bps of 200 = 0.5
        assert_eq!(fee_amount(d("200"), 25), d("0.5"));
        assert_eq!(net_of_fee(d("200"), 25), d("199.5"));
        assert_eq!(fee_amount(d("10"), 0), Decimal::ZERO);
    }
}
