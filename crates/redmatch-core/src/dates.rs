//! Parsing and truncation of REDCap date values
//!
//! REDCap exports every date in year-month-day order whatever the field's
//! display validation, so only the presence of a time part varies.

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};

use crate::ast::DatePrecision;
use crate::schema::TextValidation;

/// Layout of a raw date value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateLayout {
    /// `2009-01-12`
    Date,
    /// `2009-01-12 05:55`
    DateTime,
    /// `2009-01-12 05:55:10`
    DateTimeSeconds,
}

impl DateLayout {
    pub fn for_validation(validation: TextValidation) -> Option<DateLayout> {
        match validation {
            TextValidation::DateYmd | TextValidation::DateMdy | TextValidation::DateDmy => {
                Some(DateLayout::Date)
            }
            TextValidation::DatetimeYmd
            | TextValidation::DatetimeMdy
            | TextValidation::DatetimeDmy => Some(DateLayout::DateTime),
            TextValidation::DatetimeSecondsYmd
            | TextValidation::DatetimeSecondsMdy
            | TextValidation::DatetimeSecondsDmy => Some(DateLayout::DateTimeSeconds),
            _ => None,
        }
    }

    fn pattern(&self) -> &'static str {
        match self {
            DateLayout::Date => "%Y-%m-%d",
            DateLayout::DateTime => "%Y-%m-%d %H:%M",
            DateLayout::DateTimeSeconds => "%Y-%m-%d %H:%M:%S",
        }
    }

    pub fn has_time(&self) -> bool {
        !matches!(self, DateLayout::Date)
    }
}

pub fn parse(raw: &str, layout: DateLayout) -> Result<NaiveDateTime, chrono::ParseError> {
    let raw = raw.trim();
    match layout {
        DateLayout::Date => {
            NaiveDate::parse_from_str(raw, layout.pattern()).map(|d| d.and_time(NaiveTime::MIN))
        }
        _ => NaiveDateTime::parse_from_str(raw, layout.pattern()),
    }
}

/// Clear every component finer than `precision`
pub fn truncate(value: NaiveDateTime, precision: DatePrecision) -> NaiveDateTime {
    let date = value.date();
    let time = value.time();
    let (month, day) = match precision {
        DatePrecision::Year => (1, 1),
        DatePrecision::Month => (date.month(), 1),
        _ => (date.month(), date.day()),
    };
    let (hour, minute, second) = match precision {
        DatePrecision::Year | DatePrecision::Month | DatePrecision::Day => (0, 0, 0),
        DatePrecision::Hour => (time.hour(), 0, 0),
        DatePrecision::Minute => (time.hour(), time.minute(), 0),
        DatePrecision::Second => (time.hour(), time.minute(), time.second()),
    };
    NaiveDate::from_ymd_opt(date.year(), month, day)
        .and_then(|d| d.and_hms_opt(hour, minute, second))
        .unwrap_or(value)
}

/// Parse, truncate and re-render in the same layout
pub fn truncate_str(
    raw: &str,
    layout: DateLayout,
    precision: DatePrecision,
) -> Result<String, chrono::ParseError> {
    let value = truncate(parse(raw, layout)?, precision);
    Ok(value.format(layout.pattern()).to_string())
}

/// Render as a FHIR `date` or `dateTime`. Values carry no zone and are
/// emitted as UTC.
pub fn to_fhir(value: NaiveDateTime, layout: DateLayout, date_only: bool) -> String {
    if date_only || !layout.has_time() {
        value.format("%Y-%m-%d").to_string()
    } else {
        value.format("%Y-%m-%dT%H:%M:%SZ").to_string()
    }
}
