// Crontab rule parsing
//
// A rule is "<minute> <hour> <day> <month> <weekday>". Every field resolves to
// a list of integers inside its domain. Besides the usual `*`, lists, ranges
// and steps, an expression may carry an additive offset (`expr+n`) which is
// applied modulo the domain size, and the offset may be `@` to use the job
// skew instead of a fixed number.

use crate::errors::{Field, RuleSyntaxError};
use chrono::{Datelike, Timelike};
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

static EXPR_PATTERN: OnceLock<Regex> = OnceLock::new();

fn expr_pattern() -> &'static Regex {
    EXPR_PATTERN.get_or_init(|| {
        Regex::new(r"^(?:(\*)|(\d+)(?:-(\d+))?)(?:/(\d+))?(?:\+(\d+|@))?$")
            .expect("Invalid regex pattern")
    })
}

/// Resolved integer values of each rule field, in expansion order
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Intervals {
    pub minutes: Vec<u32>,
    pub hours: Vec<u32>,
    pub days: Vec<u32>,
    pub months: Vec<u32>,
    pub weekdays: Vec<u32>,
}

impl Intervals {
    /// Values resolved for one field
    pub fn get(&self, field: Field) -> &[u32] {
        match field {
            Field::Minute => &self.minutes,
            Field::Hour => &self.hours,
            Field::Day => &self.days,
            Field::Month => &self.months,
            Field::Weekday => &self.weekdays,
        }
    }

    pub fn contains(&self, field: Field, value: u32) -> bool {
        self.get(field).contains(&value)
    }
}

/// A parsed crontab rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronRule {
    fields: [String; 5],
    intervals: Intervals,
    /// Weekday field is a bare `*`
    any_weekday: bool,
}

impl CronRule {
    /// Parse a rule, resolving `@` offsets with a skew of zero
    pub fn parse(rule: &str) -> Result<Self, RuleSyntaxError> {
        Self::parse_with_skew(rule, 0)
    }

    /// Parse a rule, resolving `@` offsets from `skew`
    pub fn parse_with_skew(rule: &str, skew: u32) -> Result<Self, RuleSyntaxError> {
        let parts: Vec<&str> = rule.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(RuleSyntaxError::FieldCount {
                rule: rule.to_string(),
                found: parts.len(),
            });
        }

        let mut resolved: [Vec<u32>; 5] = Default::default();
        for (slot, (field, text)) in resolved.iter_mut().zip(Field::ALL.iter().zip(&parts)) {
            *slot = parse_field(*field, text, skew)?;
        }
        let [minutes, hours, days, months, weekdays] = resolved;

        Ok(Self {
            fields: [
                parts[0].to_string(),
                parts[1].to_string(),
                parts[2].to_string(),
                parts[3].to_string(),
                parts[4].to_string(),
            ],
            intervals: Intervals {
                minutes,
                hours,
                days,
                months,
                weekdays,
            },
            any_weekday: parts[4] == "*",
        })
    }

    /// Whether `rule` parses
    pub fn is_valid(rule: &str) -> bool {
        Self::parse(rule).is_ok()
    }

    pub fn intervals(&self) -> &Intervals {
        &self.intervals
    }

    /// Test whether the calendar minute of `at` satisfies the rule.
    ///
    /// Day-of-month and weekday are alternatives: the date matches when
    /// either list contains it. A bare `*` weekday does not take part in the
    /// alternative, so `0 0 1 * *` fires on the first of the month only.
    pub fn matches<T: Datelike + Timelike>(&self, at: &T) -> bool {
        self.matches_hour(at) && self.intervals.contains(Field::Minute, at.minute())
    }

    /// Test everything but the minute field
    pub fn matches_hour<T: Datelike + Timelike>(&self, at: &T) -> bool {
        let i = &self.intervals;
        i.contains(Field::Hour, at.hour())
            && i.contains(Field::Month, at.month())
            && self.matches_date(at)
    }

    fn matches_date<T: Datelike>(&self, at: &T) -> bool {
        let day = self.intervals.contains(Field::Day, at.day());
        if self.any_weekday {
            return day;
        }
        day || self
            .intervals
            .contains(Field::Weekday, at.weekday().num_days_from_sunday())
    }
}

impl FromStr for CronRule {
    type Err = RuleSyntaxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fields.join(" "))
    }
}

fn parse_field(field: Field, text: &str, skew: u32) -> Result<Vec<u32>, RuleSyntaxError> {
    let mut values = Vec::new();
    for expr in text.split(',') {
        if expr.is_empty() {
            return Err(RuleSyntaxError::invalid(field, text, "empty list element"));
        }
        values.extend(parse_expr(field, expr, skew)?);
    }
    Ok(values)
}

fn parse_expr(field: Field, expr: &str, skew: u32) -> Result<Vec<u32>, RuleSyntaxError> {
    let caps = expr_pattern()
        .captures(expr)
        .ok_or_else(|| RuleSyntaxError::invalid(field, expr, "unrecognised expression"))?;

    let (min, max) = field.bounds();
    let number = |idx: usize| -> Result<Option<u32>, RuleSyntaxError> {
        match caps.get(idx) {
            None => Ok(None),
            Some(m) => m
                .as_str()
                .parse::<u32>()
                .map(Some)
                .map_err(|_| RuleSyntaxError::invalid(field, expr, "number too large")),
        }
    };
    let in_domain = |value: u32| -> Result<u32, RuleSyntaxError> {
        if (min..=max).contains(&value) {
            Ok(value)
        } else {
            Err(RuleSyntaxError::invalid(
                field,
                expr,
                format!("value {} out of range {}-{}", value, min, max),
            ))
        }
    };

    let step = match number(4)? {
        Some(0) => return Err(RuleSyntaxError::invalid(field, expr, "step must be positive")),
        other => other,
    };

    let base: Vec<u32> = if caps.get(1).is_some() {
        (min..=max).collect()
    } else {
        // Group 2 is always present when the wildcard did not match.
        let start = in_domain(number(2)?.unwrap_or(min))?;
        match number(3)? {
            Some(end) => {
                let end = in_domain(end)?;
                if start <= end {
                    (start..=end).collect()
                } else {
                    (start..=max).chain(min..=end).collect()
                }
            }
            None if step.is_some() => (start..=max).collect(),
            None => vec![start],
        }
    };

    let stepped: Vec<u32> = match step {
        Some(n) => base.into_iter().step_by(n as usize).collect(),
        None => base,
    };

    let offset = match caps.get(5).map(|m| m.as_str()) {
        None => 0,
        Some("@") => match step {
            Some(n) => skew % n,
            None => skew % field.size(),
        },
        Some(_) => number(5)?.unwrap_or(0) % field.size(),
    };

    if offset == 0 {
        return Ok(stepped);
    }
    let size = field.size();
    Ok(stepped
        .into_iter()
        .map(|v| (v - min + offset) % size + min)
        .collect())
}
