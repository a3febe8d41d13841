use std::fmt;
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Fixed-point decimal with 2 decimal places, stored as a scaled integer.
///
/// Balances and transfer amounts are denominated in cents internally so that
/// repeated debits and credits never accumulate floating-point drift. The
/// wire carries plain JSON numbers; conversion happens at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Amount(i64);

impl Amount {
    const SCALE: i64 = 100;

    pub const ZERO: Amount = Amount(0);

    pub fn from_f64(value: f64) -> Self {
        Amount((value * Self::SCALE as f64).round() as i64)
    }

    pub fn from_scaled(value: i64) -> Self {
        Amount(value)
    }

    pub fn to_f64(self) -> f64 {
        self.0 as f64 / Self::SCALE as f64
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }
}

/// Error parsing a decimal amount from text.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid amount '{0}'")]
pub struct ParseAmountError(String);

impl FromStr for Amount {
    type Err = ParseAmountError;

    /// Parses `123`, `123.4`, `123.45` or `-0.50`. At most two fractional
    /// digits are accepted; anything else is rejected.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseAmountError(s.to_string());
        let (negative, digits) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };

        let (whole, frac) = match digits.split_once('.') {
            Some((w, f)) => (w, f),
            None => (digits, ""),
        };
        if whole.is_empty() || (digits.contains('.') && frac.is_empty()) || frac.len() > 2 {
            return Err(err());
        }
        if !whole.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return Err(err());
        }

        let whole: i64 = whole.parse().map_err(|_| err())?;
        let mut cents = 0i64;
        let mut frac_bytes = frac.bytes();
        for scale in [10, 1] {
            if let Some(b) = frac_bytes.next() {
                cents += (b - b'0') as i64 * scale;
            }
        }

        let scaled = whole * Self::SCALE + cents;
        Ok(Amount(if negative { -scaled } else { scaled }))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.abs();
        let whole = abs / Self::SCALE;
        let frac = abs % Self::SCALE;
        write!(f, "{sign}{whole}.{frac:02}")
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.to_f64())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct AmountVisitor;

        impl Visitor<'_> for AmountVisitor {
            type Value = Amount;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a decimal amount as a number or string")
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Amount, E> {
                Ok(Amount::from_f64(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Amount, E> {
                Ok(Amount::from_scaled(v * Amount::SCALE))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Amount, E> {
                self.visit_i64(v as i64)
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Amount, E> {
                v.parse().map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_any(AmountVisitor)
    }
}

impl std::ops::Add for Amount {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Amount(self.0 + rhs.0)
    }
}

impl std::ops::Sub for Amount {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Amount(self.0 - rhs.0)
    }
}

impl std::ops::AddAssign for Amount {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl std::ops::SubAssign for Amount {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

impl std::iter::Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Amount {
        iter.fold(Amount::ZERO, |acc, a| acc + a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_scaled_preserves_value() {
        assert_eq!(Amount::from_scaled(12345), Amount(12345));
    }

    #[test]
    fn from_f64_converts_and_rounds() {
        assert_eq!(Amount::from_f64(100.0), Amount::from_scaled(10_000));
        assert_eq!(Amount::from_f64(1.5), Amount::from_scaled(150));
        assert_eq!(Amount::from_f64(-50.25), Amount::from_scaled(-5_025));
    }

    #[test]
    fn display_formats_two_decimals() {
        assert_eq!(Amount::from_scaled(50_000).to_string(), "500.00");
        assert_eq!(Amount::from_scaled(150).to_string(), "1.50");
        assert_eq!(Amount::from_scaled(1).to_string(), "0.01");
        assert_eq!(Amount::from_scaled(-5_025).to_string(), "-50.25");
        assert_eq!(Amount::ZERO.to_string(), "0.00");
    }

    #[test]
    fn parse_accepts_common_forms() {
        assert_eq!("500.00".parse::<Amount>(), Ok(Amount::from_scaled(50_000)));
        assert_eq!("500".parse::<Amount>(), Ok(Amount::from_scaled(50_000)));
        assert_eq!("0.5".parse::<Amount>(), Ok(Amount::from_scaled(50)));
        assert_eq!("-2.25".parse::<Amount>(), Ok(Amount::from_scaled(-225)));
    }

    #[test]
    fn parse_rejects_malformed_input() {
        for bad in ["", "-", "1.234", "12a", "1.", ".5", "1,50"] {
            assert!(bad.parse::<Amount>().is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn display_round_trips_through_parse() {
        for scaled in [0, 1, 99, 100, 12_345, -12_345] {
            let amount = Amount::from_scaled(scaled);
            assert_eq!(amount.to_string().parse::<Amount>(), Ok(amount));
        }
    }

    #[test]
    fn serde_uses_json_numbers() {
        let json = serde_json::to_string(&Amount::from_scaled(10_050)).unwrap();
        assert_eq!(json, "100.5");
        let back: Amount = serde_json::from_str("100.5").unwrap();
        assert_eq!(back, Amount::from_scaled(10_050));
        let from_int: Amount = serde_json::from_str("100").unwrap();
        assert_eq!(from_int, Amount::from_scaled(10_000));
        let from_str: Amount = serde_json::from_str("\"100.50\"").unwrap();
        assert_eq!(from_str, Amount::from_scaled(10_050));
    }

    #[test]
    fn arithmetic() {
        let mut a = Amount::from_scaled(100);
        a += Amount::from_scaled(50);
        assert_eq!(a, Amount::from_scaled(150));
        a -= Amount::from_scaled(30);
        assert_eq!(a, Amount::from_scaled(120));
        assert_eq!(a - Amount::from_scaled(20), Amount::from_scaled(100));
        assert_eq!(a + Amount::from_scaled(30), Amount::from_scaled(150));
    }

    #[test]
    fn ordering_and_sign() {
        assert!(Amount::from_scaled(-1).is_negative());
        assert!(Amount::from_scaled(1).is_positive());
        assert!(!Amount::ZERO.is_positive());
        assert!(Amount::from_scaled(100) < Amount::from_scaled(200));
    }

    #[test]
    fn sum_of_amounts() {
        let total: Amount = [100, 200, 300].into_iter().map(Amount::from_scaled).sum();
        assert_eq!(total, Amount::from_scaled(600));
    }
}
