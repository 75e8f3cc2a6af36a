// src/models.rs

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type UserId = i64;
pub type ProjectId = i64;
pub type TimesheetId = i64;
pub type InvoiceId = i64;
pub type LinkId = i64;

/// The acting principal, as supplied by the authenticating front proxy.
/// The kernel only ever consults the role and the ownership comparison
/// `timesheet.user_id == principal.user_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub user_id: UserId,
    pub role: Role,
}

impl Principal {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Client,
    Candidate,
}

impl std::str::FromStr for Role {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "client" => Ok(Role::Client),
            "candidate" => Ok(Role::Candidate),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimesheetStatus {
    Draft,
    Pending,
    Approved,
    Rejected,
    Invoiced,
}

impl std::fmt::Display for TimesheetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TimesheetStatus::Draft => "draft",
            TimesheetStatus::Pending => "pending",
            TimesheetStatus::Approved => "approved",
            TimesheetStatus::Rejected => "rejected",
            TimesheetStatus::Invoiced => "invoiced",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Pending,
    Paid,
    Overdue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentFrequency {
    Weekly,
    Fortnightly,
    Monthly,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid time of day '{raw}', expected HH:MM")]
pub struct TimeParseError {
    pub raw: String,
}

/// One calendar day's worked window. The client sends empty strings for
/// untouched days, so both empty and absent values count as "no time".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl DayEntry {
    /// Returns the parsed (start, end) pair, or `None` when either side is
    /// missing or empty. A present but malformed value is an error.
    pub fn times(&self) -> Result<Option<(NaiveTime, NaiveTime)>, TimeParseError> {
        let start = match self.start.as_deref() {
            None | Some("") => return Ok(None),
            Some(s) => parse_time_of_day(s)?,
        };
        let end = match self.end.as_deref() {
            None | Some("") => return Ok(None),
            Some(s) => parse_time_of_day(s)?,
        };
        Ok(Some((start, end)))
    }
}

pub fn parse_time_of_day(raw: &str) -> Result<NaiveTime, TimeParseError> {
    NaiveTime::parse_from_str(raw, "%H:%M").map_err(|_| TimeParseError {
        raw: raw.to_string(),
    })
}

/// The seven fixed weekdays of a timesheet, Monday through Sunday. All keys
/// are always present; an untouched day is an empty `DayEntry`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyHours {
    #[serde(default)]
    pub monday: DayEntry,
    #[serde(default)]
    pub tuesday: DayEntry,
    #[serde(default)]
    pub wednesday: DayEntry,
    #[serde(default)]
    pub thursday: DayEntry,
    #[serde(default)]
    pub friday: DayEntry,
    #[serde(default)]
    pub saturday: DayEntry,
    #[serde(default)]
    pub sunday: DayEntry,
}

impl WeeklyHours {
    /// Days in their fixed Monday-to-Sunday order.
    pub fn days(&self) -> [(&'static str, &DayEntry); 7] {
        [
            ("monday", &self.monday),
            ("tuesday", &self.tuesday),
            ("wednesday", &self.wednesday),
            ("thursday", &self.thursday),
            ("friday", &self.friday),
            ("saturday", &self.saturday),
            ("sunday", &self.sunday),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub role: Role,
    pub active: bool,
    pub normal_rate: Option<Decimal>,
    pub overtime_rate: Option<Decimal>,
    pub payment_frequency: Option<PaymentFrequency>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub hourly_rate: Decimal,
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timesheet {
    pub id: TimesheetId,
    pub reference_number: String,
    pub user_id: UserId,
    pub project_id: ProjectId,
    /// Monday of the week this sheet covers.
    pub week_starting: NaiveDate,
    pub daily_hours: WeeklyHours,
    pub total_hours: Decimal,
    pub normal_hours: Decimal,
    pub overtime_hours: Decimal,
    /// Rates are snapshotted from the user record at creation time so that
    /// historical invoices stay stable when a user's rate changes later.
    pub normal_rate: Decimal,
    pub overtime_rate: Decimal,
    pub total_cost: Decimal,
    pub status: TimesheetStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
    pub id: InvoiceId,
    pub reference_number: String,
    pub user_id: UserId,
    pub subtotal: Decimal,
    pub vat_rate: Decimal,
    pub cis_rate: Decimal,
    pub vat_amount: Decimal,
    pub cis_amount: Decimal,
    pub total_amount: Decimal,
    pub normal_hours: Decimal,
    pub overtime_hours: Decimal,
    pub status: InvoiceStatus,
    pub created_at: NaiveDateTime,
    pub due_date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Join row recording which timesheets compose which invoice. A timesheet
/// appears in at most one invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceTimesheetLink {
    pub id: LinkId,
    pub invoice_id: InvoiceId,
    pub timesheet_id: TimesheetId,
}

pub fn timesheet_reference(id: TimesheetId) -> String {
    format!("TS-{}", id)
}

pub fn invoice_reference(id: InvoiceId) -> String {
    format!("INV-{}", id)
}

/// Normalizes any date to the Monday of its week, the anchor day every
/// timesheet is keyed on.
pub fn week_anchor(date: NaiveDate) -> NaiveDate {
    use chrono::Datelike;
    date - chrono::Duration::days(date.weekday().num_days_from_monday() as i64)
}

#[cfg(test)]
mod models_tests {
    use super::*;

    fn d(date_str: &str) -> NaiveDate {
        NaiveDate::parse_from_str(date_str, "%Y-%m-%d")
            .unwrap_or_else(|_| panic!("Invalid date string format: {}", date_str))
    }

    #[test]
    fn week_anchor_maps_any_weekday_to_monday() {
        // 2024-01-15 is a Monday
        assert_eq!(week_anchor(d("2024-01-15")), d("2024-01-15"));
        assert_eq!(week_anchor(d("2024-01-17")), d("2024-01-15"));
        assert_eq!(week_anchor(d("2024-01-21")), d("2024-01-15"));
    }

    #[test]
    fn day_entry_treats_empty_strings_as_missing() {
        let entry = DayEntry {
            start: Some("".to_string()),
            end: Some("17:00".to_string()),
            notes: None,
        };
        assert_eq!(entry.times().unwrap(), None);
        assert_eq!(DayEntry::default().times().unwrap(), None);
    }

    #[test]
    fn day_entry_rejects_malformed_time() {
        let entry = DayEntry {
            start: Some("9am".to_string()),
            end: Some("17:00".to_string()),
            notes: None,
        };
        assert!(entry.times().is_err());
    }

    #[test]
    fn weekly_hours_deserializes_with_missing_days() {
        let weekly: WeeklyHours =
            serde_json::from_str(r#"{"monday":{"start":"08:00","end":"16:00"}}"#).unwrap();
        assert_eq!(weekly.monday.start.as_deref(), Some("08:00"));
        assert_eq!(weekly.sunday, DayEntry::default());
        assert_eq!(weekly.days().len(), 7);
    }

    #[test]
    fn reference_numbers_follow_record_ids() {
        assert_eq!(timesheet_reference(12), "TS-12");
        assert_eq!(invoice_reference(7), "INV-7");
    }
}
