//! Time trigger expressions.
//!
//! An expression is a space separated list of tokens summed relative to a
//! base instant. Each token is a bare integer (seconds), `NOW`, `FOREVER`,
//! or a number followed by a unit: `n`/`nanoseconds`, `s`/`seconds`,
//! `m`/`minutes`, `h`/`hours`, `d`/`days` (case-insensitive). Anything the
//! relative grammar rejects is tried as an absolute date.

use std::sync::OnceLock;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum TimeExprError {
    #[error("empty time expression")]
    Empty,
    #[error("cannot parse time expression {0:?}")]
    Invalid(String),
    #[error("time expression {0:?} is out of range")]
    OutOfRange(String),
}

fn unit_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(\d+(?:\.\d+)?)(nanoseconds|n|seconds|s|minutes|m|hours|h|days|d)$")
            .expect("unit regex is valid")
    })
}

enum Relative {
    Forever,
    After(Duration),
}

fn unit_nanos(unit: &str) -> i64 {
    match unit.to_ascii_lowercase().as_str() {
        "n" | "nanoseconds" => 1,
        "s" | "seconds" => 1_000_000_000,
        "m" | "minutes" => 60 * 1_000_000_000,
        "h" | "hours" => 3_600 * 1_000_000_000,
        _ => 86_400 * 1_000_000_000,
    }
}

/// Amount of `number` units in nanoseconds; `None` on overflow.
fn scaled(number: &str, per_unit: i64) -> Option<i64> {
    if number.contains('.') {
        let nanos = number.parse::<f64>().ok()? * per_unit as f64;
        (nanos.is_finite() && nanos < i64::MAX as f64).then_some(nanos as i64)
    } else {
        number.parse::<i64>().ok()?.checked_mul(per_unit)
    }
}

fn parse_token(token: &str, expr: &str) -> Result<Option<Relative>, TimeExprError> {
    let out_of_range = || TimeExprError::OutOfRange(expr.to_string());
    if token.eq_ignore_ascii_case("now") {
        return Ok(Some(Relative::After(Duration::zero())));
    }
    if token.eq_ignore_ascii_case("forever") {
        return Ok(Some(Relative::Forever));
    }
    if !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit()) {
        let secs: i64 = token.parse().map_err(|_| out_of_range())?;
        return Duration::try_seconds(secs).map(|d| Some(Relative::After(d))).ok_or_else(out_of_range);
    }
    match unit_re().captures(token) {
        Some(c) => {
            let nanos = scaled(&c[1], unit_nanos(&c[2])).ok_or_else(out_of_range)?;
            Ok(Some(Relative::After(Duration::nanoseconds(nanos))))
        }
        None => Ok(None),
    }
}

fn parse_relative(expr: &str, base: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, TimeExprError> {
    let mut total = Duration::zero();
    let mut forever = false;
    for token in expr.split_whitespace() {
        match parse_token(token, expr)? {
            Some(Relative::Forever) => forever = true,
            Some(Relative::After(d)) => {
                total = total.checked_add(&d).ok_or_else(|| TimeExprError::OutOfRange(expr.to_string()))?;
            }
            None => return Ok(None),
        }
    }
    if forever {
        return Ok(Some(DateTime::<Utc>::MAX_UTC));
    }
    base.checked_add_signed(total)
        .map(Some)
        .ok_or_else(|| TimeExprError::OutOfRange(expr.to_string()))
}

const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
    "%d %b %Y %H:%M:%S",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%d %b %Y", "%b %d %Y", "%B %d %Y"];

/// Absolute timestamps; zone-less forms are read as UTC.
fn parse_absolute(expr: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(expr) {
        return Some(t.with_timezone(&Utc));
    }
    if let Ok(t) = DateTime::parse_from_rfc2822(expr) {
        return Some(t.with_timezone(&Utc));
    }
    if let Ok(t) = DateTime::parse_from_str(expr, "%Y-%m-%d %H:%M:%S %z") {
        return Some(t.with_timezone(&Utc));
    }
    for f in NAIVE_DATETIME_FORMATS {
        if let Ok(t) = NaiveDateTime::parse_from_str(expr, f) {
            return Some(t.and_utc());
        }
    }
    for f in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(expr, f) {
            return d.and_hms_opt(0, 0, 0).map(|t| t.and_utc());
        }
    }
    None
}

/// Resolve `expr` to an instant, relative expressions counting from `base`.
pub fn parse_time_expression(expr: &str, base: DateTime<Utc>) -> Result<DateTime<Utc>, TimeExprError> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Err(TimeExprError::Empty);
    }
    if let Some(t) = parse_relative(expr, base)? {
        return Ok(t);
    }
    parse_absolute(expr).ok_or_else(|| TimeExprError::Invalid(expr.to_string()))
}
