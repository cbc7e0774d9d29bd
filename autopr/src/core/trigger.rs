//! Time-based triggers for scheduled runs.
//!
//! Users write standard five-field cron expressions
//! (`minute hour day-of-month month day-of-week`, Sunday = 0 or 7). The
//! `cron` crate expects a leading seconds field and numbers weekdays
//! 1 (Sunday) through 7 (Saturday), so expressions are translated once at
//! parse time.

use std::str::FromStr;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local};
use cron::Schedule;

/// Something that can compute the next instant a cycle should start.
pub trait Trigger: Send {
    /// First fire time strictly after `after`, or `None` if the trigger never fires again.
    fn next_fire(&self, after: DateTime<Local>) -> Option<DateTime<Local>>;

    /// Short human-readable description for logs.
    fn describe(&self) -> String;
}

#[derive(Debug, Clone)]
pub struct CronTrigger {
    expression: String,
    schedule: Schedule,
}

impl CronTrigger {
    pub fn parse(expression: &str) -> Result<Self> {
        let expression = expression.trim();
        validate_cron_expression(expression)?;
        let translated = to_cron_crate_syntax(expression)?;
        let schedule = Schedule::from_str(&translated)
            .with_context(|| format!("invalid cron expression: {expression}"))?;
        Ok(Self {
            expression: expression.to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }
}

impl Trigger for CronTrigger {
    fn next_fire(&self, after: DateTime<Local>) -> Option<DateTime<Local>> {
        self.schedule.after(&after).next()
    }

    fn describe(&self) -> String {
        format!("cron '{}'", self.expression)
    }
}

/// Check shape and character set before handing the expression to the parser.
pub fn validate_cron_expression(expression: &str) -> Result<()> {
    let expression = expression.trim();
    if expression.is_empty() {
        bail!("cron expression cannot be empty");
    }
    if let Some(ch) = expression.chars().find(|c| {
        !(c.is_ascii_alphanumeric() || matches!(c, '*' | '/' | ',' | '-' | '?' | ' '))
    }) {
        bail!("cron expression contains invalid character {ch:?}: {expression}");
    }
    let fields = expression.split_whitespace().count();
    if fields != 5 {
        bail!("cron expression must have exactly 5 fields (minute hour day month weekday), got {fields}");
    }
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if is_restricted(fields[2]) && is_restricted(fields[4]) {
        // Classic cron fires when either field matches; the parser requires both.
        bail!(
            "cron expression restricts both day-of-month and day-of-week, which is not supported; use '*' for one of them: {expression}"
        );
    }
    Ok(())
}

fn is_restricted(field: &str) -> bool {
    !matches!(field, "*" | "?")
}

/// Rewrite a five-field expression into the six-field dialect of the `cron` crate.
pub fn to_cron_crate_syntax(expression: &str) -> Result<String> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    let [minute, hour, dom, month, dow] = fields.as_slice() else {
        bail!("cron expression must have exactly 5 fields, got {}", fields.len());
    };
    let dow = translate_weekday_field(dow)?;
    Ok(format!("0 {minute} {hour} {dom} {month} {dow}"))
}

fn translate_weekday_field(field: &str) -> Result<String> {
    let items = field
        .split(',')
        .map(translate_weekday_item)
        .collect::<Result<Vec<_>>>()?;
    Ok(items.join(","))
}

fn translate_weekday_item(item: &str) -> Result<String> {
    let (range, step) = match item.split_once('/') {
        Some((range, step)) => (range, Some(step)),
        None => (item, None),
    };
    let suffix = step.map(|s| format!("/{s}")).unwrap_or_default();

    if range == "*" {
        return Ok(match step {
            Some(_) => format!("1-7{suffix}"),
            None => "*".to_string(),
        });
    }
    if range == "?" {
        return Ok(range.to_string());
    }

    match range.split_once('-') {
        Some((start, end)) => {
            let (Some(start), Some(end)) = (weekday_number(start)?, weekday_number(end)?) else {
                return Ok(item.to_ascii_uppercase());
            };
            if end == 7 {
                if start == 0 {
                    return Ok(format!("1-7{suffix}"));
                }
                let stride = step
                    .map(|s| s.parse::<u32>().context("invalid weekday step"))
                    .transpose()?
                    .unwrap_or(1);
                let mut out = format!("{}-7{suffix}", start + 1);
                if stride > 0 && (7 - start) % stride == 0 {
                    out.push_str(",1");
                }
                return Ok(out);
            }
            Ok(format!("{}-{}{suffix}", start + 1, end + 1))
        }
        None => match weekday_number(range)? {
            Some(day) => Ok(format!("{}{suffix}", shift_weekday(day))),
            None => Ok(item.to_ascii_uppercase()),
        },
    }
}

/// Numeric weekday in 0..=7, or `None` for a named day like `MON`.
fn weekday_number(token: &str) -> Result<Option<u32>> {
    if !token.chars().all(|c| c.is_ascii_digit()) {
        return Ok(None);
    }
    let day: u32 = token
        .parse()
        .with_context(|| format!("invalid weekday: {token}"))?;
    if day > 7 {
        bail!("weekday out of range (0-7): {day}");
    }
    Ok(Some(day))
}

fn shift_weekday(day: u32) -> u32 {
    if day == 7 { 1 } else { day + 1 }
}
