// src/work_hours.rs
//
// Normal/overtime hour splitting against the fixed working window, and the
// weekly/invoice aggregation built on top of it. This is the single
// implementation every handler goes through; nothing else in the crate
// computes hours.

use chrono::{NaiveTime, Timelike};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use thiserror::Error;

use crate::models::{DayEntry, TimeParseError, Timesheet, WeeklyHours};

/// Default normal working window, 08:00-16:00. The window is configuration
/// (WORK_WINDOW_START / WORK_WINDOW_END), not a buried constant.
pub const DEFAULT_WINDOW_START: &str = "08:00";
pub const DEFAULT_WINDOW_END: &str = "16:00";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WindowError {
    #[error("invalid working window time '{0}', expected HH:MM")]
    BadTime(String),
    #[error("working window start {start} must be before end {end}")]
    Inverted { start: NaiveTime, end: NaiveTime },
}

/// The span of the day paid at the normal rate. Anything worked outside it
/// is overtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkingWindow {
    start: NaiveTime,
    end: NaiveTime,
}

impl WorkingWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Result<Self, WindowError> {
        if end <= start {
            return Err(WindowError::Inverted { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn parse(start: &str, end: &str) -> Result<Self, WindowError> {
        let parse = |raw: &str| {
            NaiveTime::parse_from_str(raw, "%H:%M")
                .map_err(|_| WindowError::BadTime(raw.to_string()))
        };
        Self::new(parse(start)?, parse(end)?)
    }

    pub fn start(&self) -> NaiveTime {
        self.start
    }

    pub fn end(&self) -> NaiveTime {
        self.end
    }
}

impl Default for WorkingWindow {
    fn default() -> Self {
        Self::parse(DEFAULT_WINDOW_START, DEFAULT_WINDOW_END)
            .expect("default working window constants are valid")
    }
}

/// A day's hours split into normal and overtime portions. Hours are exact
/// decimals; rounding to 2 dp happens only when a record is persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HourSplit {
    pub normal: Decimal,
    pub overtime: Decimal,
}

impl HourSplit {
    pub fn total(&self) -> Decimal {
        self.normal + self.overtime
    }
}

fn minutes_from_midnight(t: NaiveTime) -> i64 {
    t.num_seconds_from_midnight() as i64 / 60
}

/// Splits one worked span into normal and overtime hours. Total function:
/// an inverted or empty span yields a zero split, never an error.
pub fn split(window: &WorkingWindow, start: NaiveTime, end: NaiveTime) -> HourSplit {
    let start_min = minutes_from_midnight(start);
    let end_min = minutes_from_midnight(end);
    if end_min <= start_min {
        return HourSplit::default();
    }

    let window_start = minutes_from_midnight(window.start);
    let window_end = minutes_from_midnight(window.end);

    let normal_overlap = (end_min.min(window_end) - start_min.max(window_start)).max(0);
    let total_minutes = end_min - start_min;
    let overtime_minutes = total_minutes - normal_overlap;

    HourSplit {
        normal: Decimal::from(normal_overlap) / dec!(60),
        overtime: Decimal::from(overtime_minutes) / dec!(60),
    }
}

/// Splits a single day entry, treating a missing start or end as zero hours.
pub fn split_entry(window: &WorkingWindow, entry: &DayEntry) -> Result<HourSplit, TimeParseError> {
    match entry.times()? {
        Some((start, end)) => Ok(split(window, start, end)),
        None => Ok(HourSplit::default()),
    }
}

/// Totals for one timesheet week.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WeekTotals {
    pub normal: Decimal,
    pub overtime: Decimal,
}

impl WeekTotals {
    pub fn total(&self) -> Decimal {
        self.normal + self.overtime
    }
}

/// Sums the split of each of the seven fixed days, Monday through Sunday.
pub fn aggregate_week(
    window: &WorkingWindow,
    weekly: &WeeklyHours,
) -> Result<WeekTotals, TimeParseError> {
    let mut totals = WeekTotals::default();
    for (_, entry) in weekly.days() {
        let day = split_entry(window, entry)?;
        totals.normal += day.normal;
        totals.overtime += day.overtime;
    }
    Ok(totals)
}

pub fn compute_cost(
    normal_hours: Decimal,
    normal_rate: Decimal,
    overtime_hours: Decimal,
    overtime_rate: Decimal,
) -> Decimal {
    normal_hours * normal_rate + overtime_hours * overtime_rate
}

/// The aggregation basis for bundling several timesheets into one invoice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvoiceBasis {
    pub subtotal: Decimal,
    pub normal_hours: Decimal,
    pub overtime_hours: Decimal,
}

/// Sums the *stored* per-timesheet cost and hour fields. The snapshotted
/// values are authoritative; raw daily entries are never re-split here.
pub fn aggregate_many(timesheets: &[Timesheet]) -> InvoiceBasis {
    let mut basis = InvoiceBasis::default();
    for sheet in timesheets {
        basis.subtotal += sheet.total_cost;
        basis.normal_hours += sheet.normal_hours;
        basis.overtime_hours += sheet.overtime_hours;
    }
    basis
}
