//! Human-readable resource strings.

use crate::Error;

const KIB: f64 = 1024.0;

/// Parses a human size (`512M`, `1G`, `1.5Gi`, `256MB`, `1024`) into bytes.
///
/// Unit letters are binary multiples and case-insensitive; an optional `i`
/// and/or `B` may follow the unit.
pub fn parse_size(value: &str) -> crate::Result<u64> {
    let invalid = |reason| Error::InvalidSize {
        value: value.to_owned(),
        reason,
    };

    let trimmed = value.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, suffix) = trimmed.split_at(split);
    if number.is_empty() {
        return Err(invalid("missing number"));
    }

    let amount: f64 = number.parse().map_err(|_| invalid("malformed number"))?;

    let mut unit = suffix.trim_start().chars();
    let exponent = match unit.next().map(|c| c.to_ascii_lowercase()) {
        None => return Ok(amount as u64),
        Some('b') => 0,
        Some('k') => 1,
        Some('m') => 2,
        Some('g') => 3,
        Some('t') => 4,
        Some(_) => return Err(invalid("unknown unit")),
    };
    let rest = unit.as_str().to_ascii_lowercase();
    let valid_rest = if exponent == 0 {
        rest.is_empty()
    } else {
        matches!(rest.as_str(), "" | "i" | "b" | "ib")
    };
    if !valid_rest {
        return Err(invalid("unknown unit"));
    }
    let multiplier = KIB.powi(exponent);

    Ok((amount * multiplier) as u64)
}

/// Parses fractional cores (`0.5`, `2`) into a positive finite value.
pub fn parse_cpu(value: &str) -> crate::Result<f64> {
    let cores: f64 = value.trim().parse().map_err(|_| Error::InvalidCpu {
        value: value.to_owned(),
        reason: "not a number",
    })?;
    if !cores.is_finite() || cores <= 0.0 {
        return Err(Error::InvalidCpu {
            value: value.to_owned(),
            reason: "must be a positive number of cores",
        });
    }
    Ok(cores)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn sizes_with_units() {
        assert_eq!(parse_size("512M").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_size("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_size("1.5Gi").unwrap(), 1536 * 1024 * 1024);
        assert_eq!(parse_size("256MB").unwrap(), 256 * 1024 * 1024);
        assert_eq!(parse_size("64 k").unwrap(), 64 * 1024);
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("100b").unwrap(), 100);
    }

    #[test]
    fn sizes_rejected() {
        assert!(parse_size("bogus").is_err());
        assert!(parse_size("").is_err());
        assert!(parse_size("12X").is_err());
        assert!(parse_size("1.2.3G").is_err());
        assert!(parse_size("5Gx").is_err());
    }

    #[test]
    fn cpu_values() {
        assert_eq!(parse_cpu("2").unwrap(), 2.0);
        assert_eq!(parse_cpu(" 0.25 ").unwrap(), 0.25);
        assert!(parse_cpu("0").is_err());
        assert!(parse_cpu("-1").is_err());
        assert!(parse_cpu("NaN").is_err());
        assert!(parse_cpu("two").is_err());
    }

    proptest! {
        #[test]
        fn unit_suffixes_scale_by_1024(n in 0u64..1_000_000, unit in prop::sample::select(vec!["k", "M", "g", "T"])) {
            let exponent = match unit.to_ascii_lowercase().as_str() {
                "k" => 1,
                "m" => 2,
                "g" => 3,
                _ => 4,
            };
            let expected = n * 1024u64.pow(exponent);
            prop_assert_eq!(parse_size(&format!("{n}{unit}")).unwrap(), expected);
            prop_assert_eq!(parse_size(&format!("{n}{unit}iB")).unwrap(), expected);
        }
    }
}
