//! Five-field cron expressions for recurring jobs.
//!
//! Fields are `minute hour day-of-month month day-of-week`. Each field is a
//! comma list of atoms: `*`, `N`, `A-B`, `*/S`, or `A-B/S`. Months and
//! weekdays also accept their case-insensitive three-letter names, and whole
//! expressions may be one of the `@hourly`-style aliases.
//!
//! Day matching follows classical cron: when both the day-of-month and
//! day-of-week fields are restricted, a minute matches if either field does;
//! a `*` on one side defers entirely to the other.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike};

use crate::error::Error;

const MONTH_NAMES: &[(&str, u8)] = &[
    ("jan", 1),
    ("feb", 2),
    ("mar", 3),
    ("apr", 4),
    ("may", 5),
    ("jun", 6),
    ("jul", 7),
    ("aug", 8),
    ("sep", 9),
    ("oct", 10),
    ("nov", 11),
    ("dec", 12),
];

const DAY_NAMES: &[(&str, u8)] = &[
    ("sun", 0),
    ("mon", 1),
    ("tue", 2),
    ("wed", 3),
    ("thu", 4),
    ("fri", 5),
    ("sat", 6),
];

/// Upper bound on the minute scan in [`CronExpr::next_fire`], four years out.
/// Expressions that never match (such as a Feb 30 date) return `None`.
const MAX_SCAN_MINUTES: u32 = 4 * 366 * 24 * 60;

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minutes: BTreeSet<u8>,
    hours: BTreeSet<u8>,
    days: BTreeSet<u8>,
    months: BTreeSet<u8>,
    weekdays: BTreeSet<u8>,
    dom_wildcard: bool,
    dow_wildcard: bool,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self, Error> {
        let normalized = expr.trim().to_ascii_lowercase();
        let body = match normalized.as_str() {
            "@hourly" => "0 * * * *",
            "@daily" | "@midnight" => "0 0 * * *",
            "@weekly" => "0 0 * * 0",
            "@monthly" => "0 0 1 * *",
            "@yearly" | "@annually" => "0 0 1 1 *",
            other if other.starts_with('@') => {
                return Err(invalid(expr, format!("unknown alias {other:?}")))
            }
            other => other,
        };

        let fields: Vec<&str> = body.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid(expr, format!("expected 5 fields, got {}", fields.len())));
        }

        Ok(Self {
            minutes: parse_field(fields[0], 0, 59, &[]).map_err(|r| invalid(expr, r))?,
            hours: parse_field(fields[1], 0, 23, &[]).map_err(|r| invalid(expr, r))?,
            days: parse_field(fields[2], 1, 31, &[]).map_err(|r| invalid(expr, r))?,
            months: parse_field(fields[3], 1, 12, MONTH_NAMES).map_err(|r| invalid(expr, r))?,
            weekdays: parse_field(fields[4], 0, 6, DAY_NAMES).map_err(|r| invalid(expr, r))?,
            dom_wildcard: fields[2] == "*",
            dow_wildcard: fields[4] == "*",
        })
    }

    /// Whether the expression matches the minute containing `t`.
    pub fn matches<T: TimeZone>(&self, t: &DateTime<T>) -> bool {
        self.minutes.contains(&(t.minute() as u8))
            && self.hours.contains(&(t.hour() as u8))
            && self.months.contains(&(t.month() as u8))
            && self.day_matches(t.day() as u8, t.weekday().num_days_from_sunday() as u8)
    }

    /// The first matching minute boundary strictly after `t`, in `t`'s zone.
    ///
    /// Zone transitions follow the wall clock: a minute skipped by a forward
    /// jump never fires, a repeated minute fires in both offsets.
    pub fn next_fire<T: TimeZone>(&self, t: &DateTime<T>) -> Option<DateTime<T>> {
        let mut cursor = truncate_minute(t.clone() + Duration::minutes(1));
        for _ in 0..MAX_SCAN_MINUTES {
            if self.matches(&cursor) {
                return Some(cursor);
            }
            cursor = cursor + Duration::minutes(1);
        }
        None
    }

    fn day_matches(&self, day: u8, weekday: u8) -> bool {
        match (self.dom_wildcard, self.dow_wildcard) {
            (true, true) => true,
            (true, false) => self.weekdays.contains(&weekday),
            (false, true) => self.days.contains(&day),
            (false, false) => self.days.contains(&day) || self.weekdays.contains(&weekday),
        }
    }
}

impl FromStr for CronExpr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Canonical form: wildcards render as `*`, everything else as an expanded
/// comma list. Reparsing the canonical form yields an equal expression.
impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let star = |set: &BTreeSet<u8>, min: u8, max: u8| set.len() == (max - min + 1) as usize;
        write!(
            f,
            "{} {} {} {} {}",
            render(&self.minutes, star(&self.minutes, 0, 59)),
            render(&self.hours, star(&self.hours, 0, 23)),
            render(&self.days, self.dom_wildcard),
            render(&self.months, star(&self.months, 1, 12)),
            render(&self.weekdays, self.dow_wildcard),
        )
    }
}

fn render(set: &BTreeSet<u8>, star: bool) -> String {
    if star {
        "*".to_string()
    } else {
        set.iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn invalid(expr: &str, reason: impl Into<String>) -> Error {
    Error::InvalidCron {
        expr: expr.to_string(),
        reason: reason.into(),
    }
}

fn parse_field(
    field: &str,
    min: u8,
    max: u8,
    names: &[(&str, u8)],
) -> Result<BTreeSet<u8>, String> {
    let mut set = BTreeSet::new();
    for atom in field.split(',') {
        if atom.is_empty() {
            return Err(format!("empty atom in field {field:?}"));
        }

        let (range, step) = match atom.split_once('/') {
            Some((range, step)) => {
                let step: u16 = step
                    .parse()
                    .map_err(|_| format!("bad step in atom {atom:?}"))?;
                if step == 0 {
                    return Err(format!("step must be positive in atom {atom:?}"));
                }
                (range, Some(step))
            }
            None => (atom, None),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (
                parse_value(a, min, max, names)?,
                parse_value(b, min, max, names)?,
            )
        } else {
            if step.is_some() {
                return Err(format!("step requires a range in atom {atom:?}"));
            }
            let v = parse_value(range, min, max, names)?;
            (v, v)
        };

        if lo > hi {
            return Err(format!("inverted range in atom {atom:?}"));
        }

        let step = step.unwrap_or(1);
        let mut v = lo as u16;
        while v <= hi as u16 {
            set.insert(v as u8);
            v += step;
        }
    }
    Ok(set)
}

fn parse_value(raw: &str, min: u8, max: u8, names: &[(&str, u8)]) -> Result<u8, String> {
    let value = match names.iter().find(|(name, _)| *name == raw) {
        Some(&(_, value)) => value,
        None => raw
            .parse::<u8>()
            .map_err(|_| format!("bad value {raw:?}"))?,
    };
    if value < min || value > max {
        return Err(format!("value {value} out of range {min}-{max}"));
    }
    Ok(value)
}

fn truncate_minute<T: TimeZone>(t: DateTime<T>) -> DateTime<T> {
    let fallback = t.clone();
    t.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use chrono_tz::Tz;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn star_matches_every_minute() {
        let expr: CronExpr = "* * * * *".parse().unwrap();
        assert!(expr.matches(&at(2025, 6, 15, 9, 41)));
    }

    #[test]
    fn step_fires_on_quarter_hours() {
        let expr: CronExpr = "*/15 * * * *".parse().unwrap();
        let mut fire = expr.next_fire(&at(2025, 6, 15, 12, 7)).unwrap();
        assert_eq!(fire, at(2025, 6, 15, 12, 15));
        fire = expr.next_fire(&fire).unwrap();
        assert_eq!(fire, at(2025, 6, 15, 12, 30));
        fire = expr.next_fire(&fire).unwrap();
        assert_eq!(fire, at(2025, 6, 15, 12, 45));
        fire = expr.next_fire(&fire).unwrap();
        assert_eq!(fire, at(2025, 6, 15, 13, 0));
    }

    #[test]
    fn ranges_steps_and_lists_combine() {
        let expr: CronExpr = "0,30 8-17/3 * * *".parse().unwrap();
        assert!(expr.matches(&at(2025, 6, 15, 8, 0)));
        assert!(expr.matches(&at(2025, 6, 15, 11, 30)));
        assert!(expr.matches(&at(2025, 6, 15, 14, 0)));
        assert!(expr.matches(&at(2025, 6, 15, 17, 30)));
        assert!(!expr.matches(&at(2025, 6, 15, 9, 0)));
        assert!(!expr.matches(&at(2025, 6, 15, 8, 15)));
    }

    #[test]
    fn aliases_expand() {
        assert_eq!(
            "@hourly".parse::<CronExpr>().unwrap(),
            "0 * * * *".parse().unwrap()
        );
        assert_eq!(
            "@midnight".parse::<CronExpr>().unwrap(),
            "@daily".parse().unwrap()
        );
        assert_eq!(
            "@weekly".parse::<CronExpr>().unwrap(),
            "0 0 * * 0".parse().unwrap()
        );
        assert_eq!(
            "@yearly".parse::<CronExpr>().unwrap(),
            "@annually".parse().unwrap()
        );
    }

    #[test]
    fn month_and_day_names_resolve() {
        let expr: CronExpr = "0 12 * JAN-MAR SUN".parse().unwrap();
        // 2025-01-05 and 2025-03-02 are Sundays.
        assert!(expr.matches(&at(2025, 1, 5, 12, 0)));
        assert!(expr.matches(&at(2025, 3, 2, 12, 0)));
        assert!(!expr.matches(&at(2025, 4, 6, 12, 0)));
        assert!(!expr.matches(&at(2025, 1, 6, 12, 0)));
    }

    #[test]
    fn restricted_dom_and_dow_match_as_a_union() {
        // Fire on the 13th or on Fridays.
        let expr: CronExpr = "0 0 13 * 5".parse().unwrap();
        assert!(expr.matches(&at(2025, 6, 13, 0, 0))); // Friday the 13th
        assert!(expr.matches(&at(2025, 6, 6, 0, 0))); // a Friday
        assert!(expr.matches(&at(2025, 7, 13, 0, 0))); // a Sunday, but the 13th
        assert!(!expr.matches(&at(2025, 6, 12, 0, 0)));
    }

    #[test]
    fn wildcard_dom_defers_to_dow() {
        let expr: CronExpr = "0 0 * * 1".parse().unwrap();
        assert!(expr.matches(&at(2025, 6, 16, 0, 0))); // Monday
        assert!(!expr.matches(&at(2025, 6, 17, 0, 0)));
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert!("* * * *".parse::<CronExpr>().is_err());
        assert!("60 * * * *".parse::<CronExpr>().is_err());
        assert!("* * 0 * *".parse::<CronExpr>().is_err());
        assert!("*/0 * * * *".parse::<CronExpr>().is_err());
        assert!("5/2 * * * *".parse::<CronExpr>().is_err());
        assert!("9-3 * * * *".parse::<CronExpr>().is_err());
        assert!("@fortnightly".parse::<CronExpr>().is_err());
        assert!("* * * * 7".parse::<CronExpr>().is_err());
    }

    #[test]
    fn canonical_form_round_trips() {
        for raw in ["*/15 8-10 1,15 jan-jun/2 mon-fri", "@monthly", "* * * * *"] {
            let parsed: CronExpr = raw.parse().unwrap();
            let reparsed: CronExpr = parsed.to_string().parse().unwrap();
            assert_eq!(parsed, reparsed, "{raw} did not round-trip");
        }
    }

    #[test]
    fn skipped_dst_minute_does_not_fire() {
        let zone: Tz = "America/New_York".parse().unwrap();
        let expr: CronExpr = "30 2 * * *".parse().unwrap();
        // 2025-03-09 02:30 does not exist in this zone; the clock jumps from
        // 01:59 EST to 03:00 EDT.
        let before = zone.with_ymd_and_hms(2025, 3, 9, 0, 0, 0).unwrap();
        let fire = expr.next_fire(&before).unwrap();
        assert_eq!(fire, zone.with_ymd_and_hms(2025, 3, 10, 2, 30, 0).unwrap());
    }
}
