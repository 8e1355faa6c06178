//! Best-effort extraction of quota figures from relayed status text such as
//! `5h 18% left ⏱3h 45m · Week 60% left ⏱2d 4h`.
//!
//! Nothing here fails: text without a recognizable `N% left` segment yields
//! an empty result.

use chrono::Duration;
use regex::Regex;
use std::sync::LazyLock;

static SEGMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:\b(?P<label>5h|session|24h|daily|day|7d|weekly|week|30d|monthly|month)\b\s*[:\-]?\s*)?(?P<pct>\d{1,3}(?:\.\d+)?)\s*%\s*left(?:\s*(?:⏱\x{FE0F}?|resets?\s+in|·|\|)?\s*(?P<dur>\d+\s*[dhm](?:\s*\d+\s*[dhm])*))?",
    )
    .expect("valid status segment pattern")
});

static DURATION_PART_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+)\s*([dhm])").expect("valid duration pattern"));

#[derive(Debug, Clone, PartialEq)]
pub struct RelayedWindow {
    pub key: String,
    pub percent_left: f64,
    pub reset_after: Option<Duration>,
}

fn period_for_label(label: Option<&str>) -> &'static str {
    match label.map(str::to_ascii_lowercase).as_deref() {
        Some("24h" | "day" | "daily") => "daily",
        Some("7d" | "week" | "weekly") => "weekly",
        Some("30d" | "month" | "monthly") => "monthly",
        _ => "session",
    }
}

/// Parses a compact duration like `2d 4h` or `3h 45m`. `None` when nothing
/// matches or the total does not fit a `Duration`.
pub fn parse_compact_duration(raw: &str) -> Option<Duration> {
    let mut total: Option<Duration> = None;

    for cap in DURATION_PART_RE.captures_iter(raw) {
        let amount: i64 = cap[1].parse().ok()?;
        let part = match cap[2].to_ascii_lowercase().as_str() {
            "d" => Duration::try_days(amount),
            "h" => Duration::try_hours(amount),
            _ => Duration::try_minutes(amount),
        }?;
        total = Some(total.unwrap_or_else(Duration::zero).checked_add(&part)?);
    }

    total
}

/// Extracts one entry per recognized period. The first segment for a period
/// wins; unlabelled segments count as `session`.
pub fn parse_status_text(text: &str) -> Vec<RelayedWindow> {
    let mut out: Vec<RelayedWindow> = Vec::new();

    for cap in SEGMENT_RE.captures_iter(text) {
        let key = period_for_label(cap.name("label").map(|m| m.as_str()));
        if out.iter().any(|w| w.key == key) {
            continue;
        }

        let Some(percent_left) = cap
            .name("pct")
            .and_then(|m| m.as_str().parse::<f64>().ok())
            .filter(|p| p.is_finite())
        else {
            continue;
        };

        let duration = cap
            .name("dur")
            .and_then(|m| parse_compact_duration(m.as_str()))
            .filter(|d| *d > Duration::zero());

        out.push(RelayedWindow {
            key: key.to_string(),
            percent_left: percent_left.clamp(0.0, 100.0),
            reset_after: duration,
        });
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_labelled_session_with_timer() {
        let parsed = parse_status_text("5h 18% left ⏱3h 45m");
        assert_eq!(
            parsed,
            vec![RelayedWindow {
                key: "session".into(),
                percent_left: 18.0,
                reset_after: Some(Duration::minutes(225)),
            }]
        );
    }

    #[test]
    fn parses_multiple_segments() {
        let parsed =
            parse_status_text("🧠 Usage: 5h 72% left ⏱1h 5m · Week 40% left ⏱2d 4h · Month 90% left");
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0].key, "session");
        assert_eq!(parsed[0].percent_left, 72.0);
        assert_eq!(parsed[1].key, "weekly");
        assert_eq!(parsed[1].reset_after, Some(Duration::hours(52)));
        assert_eq!(parsed[2].key, "monthly");
        assert_eq!(parsed[2].reset_after, None);
    }

    #[test]
    fn unlabelled_segment_defaults_to_session() {
        let parsed = parse_status_text("Claude: 64% LEFT");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].key, "session");
        assert_eq!(parsed[0].percent_left, 64.0);
        assert_eq!(parsed[0].reset_after, None);
    }

    #[test]
    fn first_segment_per_period_wins() {
        let parsed = parse_status_text("daily 10% left, day 90% left");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].key, "daily");
        assert_eq!(parsed[0].percent_left, 10.0);
    }

    #[test]
    fn unparseable_text_yields_nothing() {
        assert!(parse_status_text("").is_empty());
        assert!(parse_status_text("all good, no numbers here").is_empty());
        assert!(parse_status_text("50% used").is_empty());
    }

    #[test]
    fn percent_left_is_clamped() {
        let parsed = parse_status_text("session 250% left");
        assert_eq!(parsed[0].percent_left, 100.0);
    }

    #[test]
    fn compact_duration_normalizes_spacing() {
        assert_eq!(
            parse_compact_duration("1d4h 5M"),
            Some(Duration::days(1) + Duration::hours(4) + Duration::minutes(5))
        );
        assert_eq!(parse_compact_duration("soon"), None);
    }

    #[test]
    fn oversized_durations_are_dropped_not_fatal() {
        assert_eq!(parse_compact_duration("9999999999999999d"), None);
        assert_eq!(parse_compact_duration("99999999999999999999h"), None);
        assert_eq!(
            parse_compact_duration("100000000000d 100000000000d"),
            None
        );

        let parsed = parse_status_text("5h 18% left ⏱9999999999999999d");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].percent_left, 18.0);
        assert_eq!(parsed[0].reset_after, None);
    }
}
