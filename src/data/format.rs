//! Number parsing helpers
//!
//! Exchange pages render figures as comma-grouped text ("1,234.50"), sometimes
//! with a currency prefix or a trailing percent sign.

/// Parses a figure as shown on the exchange pages.
///
/// Accepts thousands separators, a leading `Rs.`/`Rs`/`रु` prefix, a leading
/// `+` sign, surrounding parentheses and a trailing `%`. Returns `None` for
/// empty or dash-only cells.
pub fn parse_number(text: &str) -> Option<f64> {
    let mut s = text.trim();
    for prefix in ["Rs.", "Rs", "रु"] {
        if let Some(rest) = s.strip_prefix(prefix) {
            s = rest.trim_start();
        }
    }
    let s = s.trim_end_matches('%').trim();
    let s = s
        .strip_prefix('(')
        .and_then(|inner| inner.strip_suffix(')'))
        .unwrap_or(s);

    let cleaned: String = s.chars().filter(|c| *c != ',' && !c.is_whitespace()).collect();
    let cleaned = cleaned.strip_prefix('+').unwrap_or(&cleaned);

    if cleaned.is_empty() || cleaned.chars().all(|c| c == '-') {
        return None;
    }

    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Parses a traded quantity, dropping any fractional part.
pub fn parse_quantity(text: &str) -> Option<u64> {
    parse_number(text).filter(|v| *v >= 0.0).map(|v| v.trunc() as u64)
}

/// Rounds to two decimal places.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Percent change relative to the previous close (`ltp - change`).
///
/// Zero when there was no change or the previous close would be zero.
pub fn percent_change(ltp: f64, change: f64) -> f64 {
    let previous = ltp - change;
    if change == 0.0 || previous == 0.0 {
        return 0.0;
    }
    round2(change / previous * 100.0)
}
