//! The helper namespace handed to guest `render` calls. Guest code gets
//! these three functions and nothing else from the host.
use serde_json::Value;

#[derive(Debug, Clone, Copy, Default)]
pub struct Helpers;

impl Helpers {
    /// Sums the finite numbers of an array; anything else counts as 0.
    pub fn sum(&self, values: &Value) -> f64 {
        values
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(number)
                    .filter(|n| n.is_finite())
                    .sum::<f64>()
            })
            .unwrap_or(0.0)
    }

    pub fn clamp(&self, value: f64, min: f64, max: f64) -> f64 {
        if !value.is_finite() {
            return min;
        }
        value.max(min).min(max)
    }

    /// Formats with `en-US` grouping and a fixed number of decimals.
    /// Exact ties round away from zero, as `toLocaleString` does.
    pub fn format_number(&self, value: f64, digits: u32) -> String {
        if !value.is_finite() {
            return "0".to_string();
        }
        let fixed = to_fixed(value.abs(), digits.min(20) as usize);
        let (int_part, frac_part) = match fixed.split_once('.') {
            Some((i, f)) => (i, Some(f)),
            None => (fixed.as_str(), None),
        };

        let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
        for (i, c) in int_part.chars().enumerate() {
            if i > 0 && (int_part.len() - i) % 3 == 0 {
                grouped.push(',');
            }
            grouped.push(c);
        }

        let is_zero = fixed.bytes().all(|b| b == b'0' || b == b'.');
        let mut out = String::new();
        if value < 0.0 && !is_zero {
            out.push('-');
        }
        out.push_str(&grouped);
        if let Some(frac) = frac_part {
            out.push('.');
            out.push_str(frac);
        }
        out
    }
}

// Digits printed past the requested precision. A double's decimal
// expansion departs from a run of zeros within 17 significant digits, so
// a '5' followed by this many zeros is an exact tie.
const GUARD_DIGITS: usize = 25;

/// Rounds a non-negative `value` to `digits` decimals, half away from zero.
/// `{:.*}` alone breaks exact ties toward even.
fn to_fixed(value: f64, digits: usize) -> String {
    let wide = format!("{:.*}", digits + GUARD_DIGITS, value);
    let (kept, rest) = wide.split_at(wide.len() - GUARD_DIGITS);
    let kept = kept.strip_suffix('.').unwrap_or(kept);
    if rest.chars().next().is_some_and(|c| c >= '5') {
        increment_last_digit(kept)
    } else {
        kept.to_string()
    }
}

fn increment_last_digit(fixed: &str) -> String {
    let mut bytes = fixed.as_bytes().to_vec();
    for i in (0..bytes.len()).rev() {
        match bytes[i] {
            b'.' => continue,
            b'9' => bytes[i] = b'0',
            d => {
                bytes[i] = d + 1;
                return String::from_utf8_lossy(&bytes).into_owned();
            }
        }
    }
    format!("1{}", String::from_utf8_lossy(&bytes))
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sum() {
        let h = Helpers;
        assert_eq!(h.sum(&json!([1, 2, 3.5])), 6.5);
        assert_eq!(h.sum(&json!([1, "2", null, {}])), 3.0);
        assert_eq!(h.sum(&json!("nope")), 0.0);
        assert_eq!(h.sum(&json!([])), 0.0);
    }

    #[test]
    fn test_clamp() {
        let h = Helpers;
        assert_eq!(h.clamp(5.0, 0.0, 3.0), 3.0);
        assert_eq!(h.clamp(-1.0, 0.0, 3.0), 0.0);
        assert_eq!(h.clamp(f64::NAN, 1.0, 3.0), 1.0);
    }

    #[test]
    fn test_format_number() {
        let h = Helpers;
        assert_eq!(h.format_number(1234567.0, 0), "1,234,567");
        assert_eq!(h.format_number(999.0, 0), "999");
        assert_eq!(h.format_number(1000.0, 0), "1,000");
        assert_eq!(h.format_number(-1234.5, 1), "-1,234.5");
        assert_eq!(h.format_number(0.126, 2), "0.13");
        assert_eq!(h.format_number(-0.0001, 0), "0");
        assert_eq!(h.format_number(f64::INFINITY, 0), "0");
    }

    #[test]
    fn test_format_number_ties_round_away_from_zero() {
        let h = Helpers;
        assert_eq!(h.format_number(0.125, 2), "0.13");
        assert_eq!(h.format_number(-0.125, 2), "-0.13");
        assert_eq!(h.format_number(2.5, 0), "3");
        assert_eq!(h.format_number(0.5, 0), "1");
        assert_eq!(h.format_number(999.5, 0), "1,000");
        assert_eq!(h.format_number(9.96875, 4), "9.9688");
        // Not exact ties in binary: these round on the true value
        assert_eq!(h.format_number(1.005, 2), "1.00");
        assert_eq!(h.format_number(9.995, 2), "9.99");
        assert_eq!(h.format_number(0.0, 3), "0.000");
    }
}
