//! Balances travel as decimal integer strings in the smallest on-chain unit.
//! Anything that needs arithmetic goes through `BigUint`, never floats.

use num_bigint::BigUint;

use crate::error::{StoreError, StoreResult};

/// True when `s` is a non-empty run of ASCII digits.
pub fn is_valid_balance(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

pub fn parse_balance(s: &str) -> StoreResult<BigUint> {
    if !is_valid_balance(s) {
        return Err(StoreError::validation(format!(
            "balance must be a non-negative integer string, got '{s}'"
        )));
    }
    BigUint::parse_bytes(s.as_bytes(), 10)
        .ok_or_else(|| StoreError::validation(format!("unparseable balance '{s}'")))
}

/// Canonical form: leading zeros stripped, `"0"` for zero.
pub fn normalize_balance(s: &str) -> StoreResult<String> {
    Ok(parse_balance(s)?.to_string())
}

/// Sum decimal balance strings without losing precision.
pub fn sum_balances<'a, I>(values: I) -> StoreResult<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut total = BigUint::default();
    for v in values {
        total += parse_balance(v)?;
    }
    Ok(total.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_balance_strings() {
        assert!(is_valid_balance("0"));
        assert!(is_valid_balance("123456789012345678901234567890"));
        assert!(!is_valid_balance(""));
        assert!(!is_valid_balance("-1"));
        assert!(!is_valid_balance("1.5"));
        assert!(!is_valid_balance("1e18"));
    }

    #[test]
    fn test_sum_exceeds_u128() {
        let big = "340282366920938463463374607431768211455"; // u128::MAX
        let total = sum_balances([big, "1"]).unwrap();
        assert_eq!(total, "340282366920938463463374607431768211456");
    }

    #[test]
    fn test_sum_of_nothing_is_zero() {
        assert_eq!(sum_balances(std::iter::empty()).unwrap(), "0");
    }

    #[test]
    fn test_sum_rejects_float_strings() {
        let err = sum_balances(["1", "2.5"]).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_normalize_strips_leading_zeros() {
        assert_eq!(normalize_balance("000120").unwrap(), "120");
        assert_eq!(normalize_balance("0000").unwrap(), "0");
    }
}
