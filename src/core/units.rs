use crate::error::{Error, Result};

/// SPICE metric suffixes, longest first so `meg` wins over `m`.
const SUFFIXES: &[(&str, i32)] = &[
    ("meg", 6),
    ("t", 12),
    ("g", 9),
    ("k", 3),
    ("m", -3),
    ("u", -6),
    ("µ", -6),
    ("μ", -6),
    ("n", -9),
    ("p", -12),
    ("f", -15),
    ("a", -18),
    ("z", -21),
    ("y", -24),
];

/// Suffixes used when rendering, indexed by engineering exponent.
const FORMAT_SUFFIXES: &[(i32, &str)] = &[
    (12, "T"),
    (9, "G"),
    (6, "meg"),
    (3, "k"),
    (0, ""),
    (-3, "m"),
    (-6, "u"),
    (-9, "n"),
    (-12, "p"),
    (-15, "f"),
    (-18, "a"),
    (-21, "z"),
    (-24, "y"),
];

/// Parse a circuit value literal such as `1k`, `0.47u` or `1meg`.
///
/// Suffix matching is case-insensitive, so `M` means milli and `MEG` means
/// mega. A literal without a suffix is read as a plain float.
pub fn parse_value(text: &str) -> Result<f64> {
    let text = text.trim();
    let invalid = |reason: &str| Error::ValueFormat {
        literal: text.to_string(),
        reason: reason.to_string(),
    };

    if text.is_empty() {
        return Err(invalid("empty literal"));
    }

    if let Ok(value) = text.parse::<f64>() {
        return if value.is_finite() {
            Ok(value)
        } else {
            Err(invalid("value is not finite"))
        };
    }

    // Suffix is the trailing run of alphabetic characters
    let split = text
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_alphabetic())
        .last()
        .map(|(i, _)| i)
        .ok_or_else(|| invalid("not a number"))?;
    let (prefix, suffix) = text.split_at(split);

    let exponent = SUFFIXES
        .iter()
        .find(|(s, _)| s.eq_ignore_ascii_case(suffix) || *s == suffix)
        .map(|&(_, e)| e)
        .ok_or_else(|| invalid(&format!("unrecognized suffix '{}'", suffix)))?;

    let mantissa: f64 = prefix
        .parse()
        .map_err(|_| invalid(&format!("unparseable numeric prefix '{}'", prefix)))?;

    // Scale through the decimal exponent so 0.47u reads exactly as 4.7e-7
    let value = format!("{}e{}", prefix, exponent)
        .parse::<f64>()
        .unwrap_or(mantissa * 10f64.powi(exponent));
    if !value.is_finite() {
        return Err(invalid("value is not finite"));
    }
    Ok(value)
}

/// Render a value in engineering notation with a SPICE suffix.
pub fn format_value(value: f64) -> String {
    if value == 0.0 || !value.is_finite() {
        return format!("{}", value);
    }

    let magnitude = value.abs();
    let mut exponent = (magnitude.log10().floor() as i32).div_euclid(3) * 3;
    let mut mantissa = value / 10f64.powi(exponent);
    // Rounding can push the mantissa to 1000 (e.g. 999.9999999999999k)
    if mantissa.abs() >= 999.999_999_999_5 {
        exponent += 3;
        mantissa = value / 10f64.powi(exponent);
    }
    // No suffix covers it: scientific notation keeps every digit
    if !(-24..=12).contains(&exponent) {
        return format!("{:e}", value);
    }

    let suffix = FORMAT_SUFFIXES
        .iter()
        .find(|(e, _)| *e == exponent)
        .map(|&(_, s)| s)
        .unwrap_or("");

    let integer_digits = (mantissa.abs().log10().floor() as i32 + 1).max(1) as usize;
    let decimals = 12usize.saturating_sub(integer_digits);
    let mut text = format!("{:.*}", decimals, mantissa);
    if text.contains('.') {
        while text.ends_with('0') {
            text.pop();
        }
        if text.ends_with('.') {
            text.pop();
        }
    }
    text.push_str(suffix);
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_plain_numbers() {
        assert_eq!(parse_value("1000").unwrap(), 1000.0);
        assert_eq!(parse_value("1e-3").unwrap(), 1e-3);
        assert_eq!(parse_value(" 2.5 ").unwrap(), 2.5);
    }

    #[test]
    fn test_suffixes() {
        assert_eq!(parse_value("1k").unwrap(), 1000.0);
        assert_eq!(parse_value("0.47u").unwrap(), 4.7e-7);
        assert_eq!(parse_value("1meg").unwrap(), 1_000_000.0);
        assert_eq!(parse_value("1MEG").unwrap(), 1_000_000.0);
        assert_relative_eq!(parse_value("10m").unwrap(), 1e-2, max_relative = 1e-12);
        assert_relative_eq!(parse_value("10M").unwrap(), 1e-2, max_relative = 1e-12);
        assert_relative_eq!(parse_value("4.7µ").unwrap(), 4.7e-6, max_relative = 1e-12);
        assert_relative_eq!(parse_value("22p").unwrap(), 22e-12, max_relative = 1e-12);
        assert_eq!(parse_value("2G").unwrap(), 2e9);
        assert_eq!(parse_value("3T").unwrap(), 3e12);
        assert_relative_eq!(parse_value("5f").unwrap(), 5e-15, max_relative = 1e-12);
    }

    #[test]
    fn test_rejects_bad_literals() {
        assert!(matches!(parse_value("1x"), Err(Error::ValueFormat { .. })));
        assert!(matches!(parse_value("abc"), Err(Error::ValueFormat { .. })));
        assert!(matches!(parse_value("1kohm"), Err(Error::ValueFormat { .. })));
        assert!(matches!(parse_value(""), Err(Error::ValueFormat { .. })));
        assert!(matches!(parse_value("inf"), Err(Error::ValueFormat { .. })));
        assert!(matches!(parse_value("k"), Err(Error::ValueFormat { .. })));
    }

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(1500.0), "1.5k");
        assert_eq!(format_value(1e6), "1meg");
        assert_eq!(format_value(4.7e-7), "470n");
        assert_eq!(format_value(0.0), "0");
        assert_eq!(format_value(-2.2e-3), "-2.2m");
        assert_eq!(format_value(47.0), "47");
    }

    #[test]
    fn test_format_parses_back() {
        for &value in &[1.0, 12.5e3, 3.3e-9, 0.1, 999.5, 1234567.0, 6.8e-12] {
            let text = format_value(value);
            assert_relative_eq!(parse_value(&text).unwrap(), value, max_relative = 1e-10);
        }
    }

    #[test]
    fn test_format_outside_suffix_range() {
        assert_eq!(format_value(1.23456789e-30), "1.23456789e-30");
        assert_eq!(format_value(2.5e15), "2.5e15");
        assert_eq!(format_value(1e-24), "1y");
        for &value in &[1.23456789012e-30, -9.87654321098e20] {
            let text = format_value(value);
            assert_relative_eq!(parse_value(&text).unwrap(), value, max_relative = 1e-12);
        }
    }
}
