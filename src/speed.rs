//! Speed-string normalization: legacy configuration may express a service's
//! speed as `"2M"`, `"1.5M"`, or a bare `"2000"`. Everything downstream
//! (RADIUS reply attributes, the policy resolver) deals in kilobits/sec, so
//! every speed string is normalized to the `"<n>k"` form once, at the edge.
//!
//! The historical bug this guards against: a previous implementation
//! multiplied already-kilobit values by 1000 again when re-normalizing,
//! turning a 2000 kbps service into a 2,000,000 kbps one. `normalize` never
//! multiplies a `k` or bare-integer input; only `M` inputs are converted.

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SpeedParseError {
    #[error("empty speed string")]
    Empty,
    #[error("unrecognized speed string {0:?}")]
    Unrecognized(String),
    #[error("speed value out of range {0:?}")]
    OutOfRange(String),
}

/// Normalize a speed string to the `"<n>k"` kilobit form.
///
/// Accepted grammar: `"<n>"`, `"<n>k"`, `"<n>M"`, `"<n.n>M"` (case-insensitive
/// suffix). Bare integers and `k`-suffixed integers are assumed to already be
/// kilobits and are passed through unchanged (re-stamped with `k`). `M`
/// suffixed values (integer or one-decimal-place) are converted to kilobits
/// by multiplying by 1000.
pub fn normalize(input: &str) -> Result<String, SpeedParseError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(SpeedParseError::Empty);
    }

    let (numeric_part, suffix) = split_suffix(trimmed);

    match suffix {
        Suffix::None | Suffix::Kilo => {
            let n: u64 = numeric_part
                .parse()
                .map_err(|_| SpeedParseError::Unrecognized(input.to_owned()))?;
            Ok(format!("{}k", n))
        }
        Suffix::Mega => {
            let mbps: f64 = numeric_part
                .parse()
                .map_err(|_| SpeedParseError::Unrecognized(input.to_owned()))?;
            if !mbps.is_finite() || mbps < 0.0 {
                return Err(SpeedParseError::OutOfRange(input.to_owned()));
            }
            let kbps = (mbps * 1000.0).round() as u64;
            Ok(format!("{}k", kbps))
        }
    }
}

enum Suffix {
    None,
    Kilo,
    Mega,
}

fn split_suffix(s: &str) -> (&str, Suffix) {
    if let Some(stripped) = s.strip_suffix(['k', 'K']) {
        (stripped, Suffix::Kilo)
    } else if let Some(stripped) = s.strip_suffix(['m', 'M']) {
        (stripped, Suffix::Mega)
    } else {
        (s, Suffix::None)
    }
}

/// Encode an `(up_kbps, down_kbps)` pair as the vendor rate-limit attribute
/// value, in the vendor's documented order: upload first, download second.
pub fn encode_rate_limit_attribute(up_kbps: u64, down_kbps: u64) -> String {
    format!("{}k/{}k", up_kbps, down_kbps)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_integer_is_kilobits() {
        assert_eq!(normalize("2000").unwrap(), "2000k");
    }

    #[test]
    fn kilo_suffix_passes_through() {
        assert_eq!(normalize("2000k").unwrap(), "2000k");
        assert_eq!(normalize("2000K").unwrap(), "2000k");
    }

    #[test]
    fn mega_suffix_converts_to_kilobits() {
        assert_eq!(normalize("2M").unwrap(), "2000k");
        assert_eq!(normalize("1.5M").unwrap(), "1500k");
    }

    #[test]
    fn never_multiplies_kilobits_by_1000() {
        // Regression target: this must never become "2000000k".
        assert_eq!(normalize("2000k").unwrap(), "2000k");
    }

    #[test]
    fn involutive_over_accepted_grammar() {
        for input in ["2000", "2000k", "2M", "1.5M"] {
            let once = normalize(input).unwrap();
            let twice = normalize(&once).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn rejects_empty() {
        assert_eq!(normalize("").unwrap_err(), SpeedParseError::Empty);
    }

    #[test]
    fn rejects_garbage() {
        assert!(normalize("fast").is_err());
    }

    #[test]
    fn rate_limit_attribute_orders_upload_first() {
        assert_eq!(encode_rate_limit_attribute(1200, 4000), "1200k/4000k");
    }
}
