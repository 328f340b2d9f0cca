//! Exact resource quantities
//!
//! Kubernetes expresses resources as decimal numbers with an SI or binary
//! suffix (`200m`, `1.5`, `300Mi`, `1e3`). Values are held as a signed
//! count of nano-units so that repeated additions never drift.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const NANO_EXP: i32 = 9;
const NANOS_PER_UNIT: i128 = 1_000_000_000;

/// Resource name to quantity
pub type ResourceList = BTreeMap<String, Quantity>;

/// Errors produced while parsing a quantity
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuantityParseError {
    #[error("quantity is empty")]
    Empty,

    #[error("quantity {0:?} has no numeric part")]
    MissingNumber(String),

    #[error("quantity {0:?} has an unknown suffix")]
    InvalidSuffix(String),

    #[error("quantity {0:?} is out of range")]
    OutOfRange(String),
}

/// How a quantity is rendered back to text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantityFormat {
    /// `m`, `k`, `M`, ... suffixes
    DecimalSI,
    /// `Ki`, `Mi`, `Gi`, ... suffixes
    BinarySI,
    /// `e<exp>` notation
    DecimalExponent,
}

/// An exact resource quantity
///
/// Equality compares the amount only, not the rendering format.
#[derive(Debug, Clone, Copy)]
pub struct Quantity {
    nanos: i128,
    format: QuantityFormat,
}

impl Quantity {
    /// A zero quantity
    pub fn zero(format: QuantityFormat) -> Self {
        Self { nanos: 0, format }
    }

    /// A whole-unit quantity
    pub fn new(value: i64, format: QuantityFormat) -> Self {
        Self {
            nanos: value as i128 * NANOS_PER_UNIT,
            format,
        }
    }

    /// A quantity expressed in thousandths of a unit
    pub fn from_milli(milli: i64, format: QuantityFormat) -> Self {
        Self {
            nanos: milli as i128 * 1_000_000,
            format,
        }
    }

    pub fn format(&self) -> QuantityFormat {
        self.format
    }

    pub fn is_zero(&self) -> bool {
        self.nanos == 0
    }

    pub fn is_negative(&self) -> bool {
        self.nanos < 0
    }

    /// Whole units, rounded away from zero
    pub fn value(&self) -> i128 {
        div_away_from_zero(self.nanos, NANOS_PER_UNIT)
    }

    /// Sum of two quantities, `None` on overflow
    ///
    /// The result takes the format of `rhs` when `self` is zero.
    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        let format = if self.is_zero() { rhs.format } else { self.format };
        Some(Self {
            nanos: self.nanos.checked_add(rhs.nanos)?,
            format,
        })
    }

    /// Rendering parts as `mantissa * 10^exponent`, exponent a multiple of 3
    fn decimal_parts(&self) -> (i128, i32) {
        let mut mantissa = self.nanos;
        let mut exponent = -NANO_EXP;

        while mantissa % 1000 == 0 && exponent < 18 {
            mantissa /= 1000;
            exponent += 3;
        }

        (mantissa, exponent)
    }
}

impl Default for Quantity {
    fn default() -> Self {
        Self::zero(QuantityFormat::DecimalSI)
    }
}

impl PartialEq for Quantity {
    fn eq(&self, other: &Self) -> bool {
        self.nanos == other.nanos
    }
}

impl Eq for Quantity {}

impl FromStr for Quantity {
    type Err = QuantityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(QuantityParseError::Empty);
        }

        let number_len = s
            .char_indices()
            .find(|&(i, c)| {
                let sign = i == 0 && (c == '+' || c == '-');
                !(sign || c.is_ascii_digit() || c == '.')
            })
            .map(|(i, _)| i)
            .unwrap_or(s.len());
        let (number, suffix) = s.split_at(number_len);

        let (negative, digits) = match number.as_bytes().first() {
            Some(b'-') => (true, &number[1..]),
            Some(b'+') => (false, &number[1..]),
            _ => (false, number),
        };

        let (whole, fraction) = digits.split_once('.').unwrap_or((digits, ""));
        if (whole.is_empty() && fraction.is_empty()) || fraction.contains('.') {
            return Err(QuantityParseError::MissingNumber(s.to_string()));
        }

        let out_of_range = || QuantityParseError::OutOfRange(s.to_string());

        let mut mantissa: i128 = 0;
        for b in whole.bytes().chain(fraction.bytes()) {
            mantissa = mantissa
                .checked_mul(10)
                .and_then(|m| m.checked_add((b - b'0') as i128))
                .ok_or_else(out_of_range)?;
        }

        let (decimal_exp, binary_exp, format) = parse_suffix(suffix)
            .ok_or_else(|| QuantityParseError::InvalidSuffix(s.to_string()))?;

        let scaled = mantissa
            .checked_mul(1i128 << binary_exp)
            .ok_or_else(out_of_range)?;

        let power = i32::try_from(fraction.len())
            .ok()
            .and_then(|digits| decimal_exp.checked_add(NANO_EXP)?.checked_sub(digits))
            .ok_or_else(out_of_range)?;
        let nanos = if power >= 0 {
            10i128
                .checked_pow(power as u32)
                .and_then(|p| scaled.checked_mul(p))
                .ok_or_else(out_of_range)?
        } else {
            match 10i128.checked_pow(power.unsigned_abs()) {
                Some(divisor) => div_away_from_zero(scaled, divisor),
                None if scaled == 0 => 0,
                None => 1,
            }
        };

        Ok(Self {
            nanos: if negative { -nanos } else { nanos },
            format,
        })
    }
}

/// Returns (power of ten, power of two, format) for a suffix
fn parse_suffix(suffix: &str) -> Option<(i32, u32, QuantityFormat)> {
    use QuantityFormat::*;

    let parsed = match suffix {
        "" => (0, 0, DecimalSI),
        "n" => (-9, 0, DecimalSI),
        "u" => (-6, 0, DecimalSI),
        "m" => (-3, 0, DecimalSI),
        "k" => (3, 0, DecimalSI),
        "M" => (6, 0, DecimalSI),
        "G" => (9, 0, DecimalSI),
        "T" => (12, 0, DecimalSI),
        "P" => (15, 0, DecimalSI),
        "E" => (18, 0, DecimalSI),
        "Ki" => (0, 10, BinarySI),
        "Mi" => (0, 20, BinarySI),
        "Gi" => (0, 30, BinarySI),
        "Ti" => (0, 40, BinarySI),
        "Pi" => (0, 50, BinarySI),
        "Ei" => (0, 60, BinarySI),
        _ => {
            let exp = suffix
                .strip_prefix('e')
                .or_else(|| suffix.strip_prefix('E'))?;
            (exp.parse::<i32>().ok()?, 0, DecimalExponent)
        }
    };

    Some(parsed)
}

fn div_away_from_zero(value: i128, divisor: i128) -> i128 {
    let quotient = value / divisor;
    if value % divisor == 0 {
        quotient
    } else {
        quotient + value.signum()
    }
}

fn decimal_suffix(exponent: i32) -> &'static str {
    match exponent {
        -9 => "n",
        -6 => "u",
        -3 => "m",
        3 => "k",
        6 => "M",
        9 => "G",
        12 => "T",
        15 => "P",
        18 => "E",
        _ => "",
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            return write!(f, "0");
        }

        if self.format == QuantityFormat::BinarySI && self.nanos % NANOS_PER_UNIT == 0 {
            const SUFFIXES: [&str; 7] = ["", "Ki", "Mi", "Gi", "Ti", "Pi", "Ei"];

            let mut value = self.nanos / NANOS_PER_UNIT;
            let mut index = 0;
            while index < SUFFIXES.len() - 1 && value % 1024 == 0 {
                value /= 1024;
                index += 1;
            }
            return write!(f, "{}{}", value, SUFFIXES[index]);
        }

        let (mantissa, exponent) = self.decimal_parts();
        match self.format {
            QuantityFormat::DecimalExponent if exponent != 0 => {
                write!(f, "{}e{}", mantissa, exponent)
            }
            QuantityFormat::DecimalExponent => write!(f, "{}", mantissa),
            _ => write!(f, "{}{}", mantissa, decimal_suffix(exponent)),
        }
    }
}

/// Parse a `name -> quantity text` map
pub fn parse_resource_list(
    raw: &BTreeMap<String, String>,
) -> Result<ResourceList, QuantityParseError> {
    raw.iter()
        .map(|(name, value)| Ok((name.clone(), value.parse()?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(s: &str) -> Quantity {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_and_render_decimal() {
        assert_eq!(q("200m").to_string(), "200m");
        assert_eq!(q("1").to_string(), "1");
        assert_eq!(q("1.5").to_string(), "1500m");
        assert_eq!(q("2000").to_string(), "2k");
        assert_eq!(q("1500").to_string(), "1500");
        assert_eq!(q("0.1").to_string(), "100m");
        assert_eq!(q("0").to_string(), "0");
    }

    #[test]
    fn test_parse_and_render_binary() {
        assert_eq!(q("300Mi").to_string(), "300Mi");
        assert_eq!(q("1024Mi").to_string(), "1Gi");
        assert_eq!(q("0.5Gi").to_string(), "512Mi");
        assert_eq!(q("1536").to_string(), "1536");
        assert_eq!(q("1000Ki").to_string(), "1000Ki");
    }

    #[test]
    fn test_parse_exponent() {
        assert_eq!(q("1e3"), q("1k"));
        assert_eq!(q("1e3").to_string(), "1e3");
        assert_eq!(q("5E-3"), q("5m"));
    }

    #[test]
    fn test_sub_nano_rounds_up() {
        assert_eq!(q("0.1n"), q("1n"));
    }

    #[test]
    fn test_negative() {
        let value = q("-100m");
        assert!(value.is_negative());
        assert_eq!(value.to_string(), "-100m");
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!("".parse::<Quantity>(), Err(QuantityParseError::Empty));
        assert!(matches!(
            "Mi".parse::<Quantity>(),
            Err(QuantityParseError::MissingNumber(_))
        ));
        assert!(matches!(
            "10Xi".parse::<Quantity>(),
            Err(QuantityParseError::InvalidSuffix(_))
        ));
        assert!(matches!(
            "1.2.3".parse::<Quantity>(),
            Err(QuantityParseError::MissingNumber(_))
        ));
        assert!(matches!(
            "99999999999999999999999999999999999999999E".parse::<Quantity>(),
            Err(QuantityParseError::OutOfRange(_))
        ));
    }

    #[test]
    fn test_addition_is_exact() {
        let mut total = Quantity::zero(QuantityFormat::DecimalSI);
        for _ in 0..1000 {
            total = total.checked_add(q("0.001")).unwrap();
        }
        assert_eq!(total, q("1"));
        assert_eq!(total.to_string(), "1");
    }

    #[test]
    fn test_addition_adopts_format_of_first_operand() {
        let total = Quantity::zero(QuantityFormat::DecimalSI)
            .checked_add(q("300Mi"))
            .and_then(|t| t.checked_add(q("1Gi")))
            .unwrap();
        assert_eq!(total.format(), QuantityFormat::BinarySI);
        assert_eq!(total.to_string(), "1324Mi");

        let cpu = Quantity::zero(QuantityFormat::DecimalSI)
            .checked_add(q("200m"))
            .and_then(|t| t.checked_add(q("300m")))
            .unwrap();
        assert_eq!(cpu.to_string(), "500m");
    }

    #[test]
    fn test_extreme_exponent_is_out_of_range() {
        for raw in ["1e2147483647", "1.0000000000e-2147483648", "-2.5E2147483640"] {
            assert!(
                matches!(raw.parse::<Quantity>(), Err(QuantityParseError::OutOfRange(_))),
                "{raw} should be out of range"
            );
        }
    }

    #[test]
    fn test_tiny_exponent_rounds_to_one_nano() {
        assert_eq!(q("1e-40"), q("1n"));
        assert_eq!(q("0e-40"), q("0"));
    }

    #[test]
    fn test_checked_add_overflow() {
        let huge = q("100000000000E");
        assert_eq!(huge.checked_add(huge), None);
        assert_eq!(huge.checked_add(q("-100000000000E")), Some(q("0")));
    }

    #[test]
    fn test_render_large_values() {
        assert_eq!(q("100000000000E").to_string(), "100000000000E");
        let max = "170141183460469231731687303715884105727n";
        assert_eq!(q(max).to_string(), max);
    }

    #[test]
    fn test_value_rounds_up() {
        assert_eq!(q("1500m").value(), 2);
        assert_eq!(q("4Gi").value(), 4 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_parse_resource_list() {
        let raw = BTreeMap::from([
            ("cpu".to_string(), "200m".to_string()),
            ("memory".to_string(), "300Mi".to_string()),
        ]);
        let list = parse_resource_list(&raw).unwrap();
        assert_eq!(list["cpu"], q("200m"));
        assert_eq!(list["memory"], q("300Mi"));

        let bad = BTreeMap::from([("cpu".to_string(), "lots".to_string())]);
        assert!(parse_resource_list(&bad).is_err());
    }
}
