// src/timesheet_system.rs
//
// The timesheet/invoicing kernel: record stores, the status state machine
// applied through the shared policy table, and the invoice creation flow.
// HTTP handlers stay thin; everything they do funnels through here.

use chrono::{Local, NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{info, warn};

use crate::invoice_math;
use crate::models::{
    invoice_reference, timesheet_reference, week_anchor, Invoice, InvoiceId, InvoiceStatus,
    InvoiceTimesheetLink, PaymentFrequency, Principal, Project, ProjectId, Role, TimeParseError,
    Timesheet, TimesheetId, TimesheetStatus, User, UserId, WeeklyHours,
};
use crate::policy::{self, Actor};
use crate::work_hours::{self, WorkingWindow};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("forbidden: {0}")]
    Authorization(String),
    #[error("{what} {id} not found")]
    NotFound { what: &'static str, id: i64 },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("storage failure: {0}")]
    Persistence(String),
}

impl From<TimeParseError> for CoreError {
    fn from(err: TimeParseError) -> Self {
        CoreError::Validation(err.to_string())
    }
}

/// Wall clock for `created_at`/due-date stamping. `Fixed` mirrors the
/// settable test clock the validation suite drives; `System` is what the
/// server runs on.
#[derive(Clone)]
pub enum Clock {
    System,
    Fixed(Arc<Mutex<NaiveDateTime>>),
}

impl Clock {
    pub fn fixed(datetime_str: &str) -> Self {
        let dt = NaiveDateTime::parse_from_str(datetime_str, "%Y-%m-%d %H:%M:%S")
            .expect("Failed to parse datetime string in Clock::fixed");
        Clock::Fixed(Arc::new(Mutex::new(dt)))
    }

    pub fn set_time(&self, datetime_str: &str) {
        match self {
            Clock::Fixed(current) => {
                *current.lock().unwrap() =
                    NaiveDateTime::parse_from_str(datetime_str, "%Y-%m-%d %H:%M:%S")
                        .expect("Failed to parse datetime string in Clock::set_time");
            }
            Clock::System => panic!("cannot set the time on the system clock"),
        }
    }

    pub fn now_dt(&self) -> NaiveDateTime {
        match self {
            Clock::System => Local::now().naive_local(),
            Clock::Fixed(current) => *current.lock().unwrap(),
        }
    }
}

// --- Request payloads ---

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewUser {
    pub username: String,
    pub role: Role,
    #[serde(default)]
    pub normal_rate: Option<Decimal>,
    #[serde(default)]
    pub overtime_rate: Option<Decimal>,
    #[serde(default)]
    pub payment_frequency: Option<PaymentFrequency>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPatch {
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub normal_rate: Option<Decimal>,
    #[serde(default)]
    pub overtime_rate: Option<Decimal>,
    #[serde(default)]
    pub payment_frequency: Option<PaymentFrequency>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProject {
    pub name: String,
    pub hourly_rate: Decimal,
    pub location: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub hourly_rate: Option<Decimal>,
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTimesheet {
    pub project_id: ProjectId,
    pub week_starting: NaiveDate,
    pub daily_hours: WeeklyHours,
    #[serde(default)]
    pub status: Option<TimesheetStatus>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimesheetPatch {
    #[serde(default)]
    pub daily_hours: Option<WeeklyHours>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub status: Option<TimesheetStatus>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInvoice {
    pub user_id: UserId,
    pub timesheet_ids: Vec<TimesheetId>,
    pub vat_rate: Decimal,
    pub cis_rate: Decimal,
}

/// The slimmed user row the admin filter dropdowns consume.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: UserId,
    pub username: String,
    pub role: Role,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct StoreCounters {
    pub users: usize,
    pub projects: usize,
    pub timesheets: usize,
    pub invoices: usize,
}

#[derive(Debug, Default)]
struct IdSequences {
    user: i64,
    project: i64,
    timesheet: i64,
    invoice: i64,
    link: i64,
}

// --- The system ---

pub struct TimesheetSystem {
    clock: Clock,
    window: WorkingWindow,
    users: Mutex<HashMap<UserId, User>>,
    projects: Mutex<HashMap<ProjectId, Project>>,
    timesheets: Mutex<HashMap<TimesheetId, Timesheet>>,
    invoices: Mutex<HashMap<InvoiceId, Invoice>>,
    invoice_links: Mutex<Vec<InvoiceTimesheetLink>>,
    sequences: Mutex<IdSequences>,
    /// Serializes invoice creation end to end; held across the validate,
    /// persist and claim steps so two simultaneous admin actions cannot
    /// both pass the precondition check for the same timesheets.
    invoicing_gate: Mutex<()>,
}

impl TimesheetSystem {
    pub fn new(clock: Clock, window: WorkingWindow) -> Self {
        Self {
            clock,
            window,
            users: Mutex::new(HashMap::new()),
            projects: Mutex::new(HashMap::new()),
            timesheets: Mutex::new(HashMap::new()),
            invoices: Mutex::new(HashMap::new()),
            invoice_links: Mutex::new(Vec::new()),
            sequences: Mutex::new(IdSequences::default()),
            invoicing_gate: Mutex::new(()),
        }
    }

    pub fn counters(&self) -> StoreCounters {
        StoreCounters {
            users: self.users.lock().unwrap().len(),
            projects: self.projects.lock().unwrap().len(),
            timesheets: self.timesheets.lock().unwrap().len(),
            invoices: self.invoices.lock().unwrap().len(),
        }
    }

    fn require_admin(&self, principal: &Principal) -> Result<(), CoreError> {
        if principal.is_admin() {
            Ok(())
        } else {
            Err(CoreError::Authorization(
                "administrator role required".to_string(),
            ))
        }
    }

    fn require_non_negative(value: Decimal, what: &str) -> Result<(), CoreError> {
        if value < dec!(0) {
            Err(CoreError::Validation(format!(
                "{} must be non-negative",
                what
            )))
        } else {
            Ok(())
        }
    }

    // --- Users ---

    pub fn create_user(&self, principal: &Principal, req: NewUser) -> Result<User, CoreError> {
        self.require_admin(principal)?;
        if req.username.trim().is_empty() {
            return Err(CoreError::Validation("username must not be empty".into()));
        }
        if let Some(rate) = req.normal_rate {
            Self::require_non_negative(rate, "normal rate")?;
        }
        if let Some(rate) = req.overtime_rate {
            Self::require_non_negative(rate, "overtime rate")?;
        }

        let mut users = self.users.lock().unwrap();
        if users.values().any(|u| u.username == req.username) {
            return Err(CoreError::Conflict(format!(
                "username '{}' is already taken",
                req.username
            )));
        }
        let id = {
            let mut seq = self.sequences.lock().unwrap();
            seq.user += 1;
            seq.user
        };
        let user = User {
            id,
            username: req.username,
            role: req.role,
            active: true,
            normal_rate: req.normal_rate,
            overtime_rate: req.overtime_rate,
            payment_frequency: req.payment_frequency,
            email: req.email,
            phone_number: req.phone_number,
            address: req.address,
        };
        info!("Created user {} ({:?})", user.username, user.role);
        users.insert(id, user.clone());
        Ok(user)
    }

    pub fn list_users(&self, principal: &Principal) -> Result<Vec<UserSummary>, CoreError> {
        self.require_admin(principal)?;
        let mut summaries: Vec<UserSummary> = self
            .users
            .lock()
            .unwrap()
            .values()
            .map(|u| UserSummary {
                id: u.id,
                username: u.username.clone(),
                role: u.role,
            })
            .collect();
        summaries.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(summaries)
    }

    pub fn get_user(&self, principal: &Principal, id: UserId) -> Result<User, CoreError> {
        self.require_admin(principal)?;
        self.users
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(CoreError::NotFound { what: "user", id })
    }

    pub fn update_user(
        &self,
        principal: &Principal,
        id: UserId,
        patch: UserPatch,
    ) -> Result<User, CoreError> {
        self.require_admin(principal)?;
        if let Some(rate) = patch.normal_rate {
            Self::require_non_negative(rate, "normal rate")?;
        }
        if let Some(rate) = patch.overtime_rate {
            Self::require_non_negative(rate, "overtime rate")?;
        }

        let mut users = self.users.lock().unwrap();
        let user = users
            .get_mut(&id)
            .ok_or(CoreError::NotFound { what: "user", id })?;
        if let Some(active) = patch.active {
            user.active = active;
        }
        if let Some(rate) = patch.normal_rate {
            user.normal_rate = Some(rate);
        }
        if let Some(rate) = patch.overtime_rate {
            user.overtime_rate = Some(rate);
        }
        if let Some(frequency) = patch.payment_frequency {
            user.payment_frequency = Some(frequency);
        }
        if let Some(email) = patch.email {
            user.email = Some(email);
        }
        if let Some(phone) = patch.phone_number {
            user.phone_number = Some(phone);
        }
        if let Some(address) = patch.address {
            user.address = Some(address);
        }
        info!("Updated user {}", user.username);
        Ok(user.clone())
    }

    // --- Projects ---

    pub fn create_project(
        &self,
        principal: &Principal,
        req: NewProject,
    ) -> Result<Project, CoreError> {
        self.require_admin(principal)?;
        if req.name.trim().is_empty() {
            return Err(CoreError::Validation(
                "project name must not be empty".into(),
            ));
        }
        Self::require_non_negative(req.hourly_rate, "hourly rate")?;

        let mut projects = self.projects.lock().unwrap();
        if projects.values().any(|p| p.name == req.name) {
            return Err(CoreError::Conflict(format!(
                "project '{}' already exists",
                req.name
            )));
        }
        let id = {
            let mut seq = self.sequences.lock().unwrap();
            seq.project += 1;
            seq.project
        };
        let project = Project {
            id,
            name: req.name,
            hourly_rate: req.hourly_rate,
            location: req.location,
        };
        info!("Created project {} at {}", project.name, project.location);
        projects.insert(id, project.clone());
        Ok(project)
    }

    pub fn list_projects(&self, _principal: &Principal) -> Result<Vec<Project>, CoreError> {
        let mut projects: Vec<Project> = self.projects.lock().unwrap().values().cloned().collect();
        projects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(projects)
    }

    pub fn update_project(
        &self,
        principal: &Principal,
        id: ProjectId,
        patch: ProjectPatch,
    ) -> Result<Project, CoreError> {
        self.require_admin(principal)?;
        if let Some(rate) = patch.hourly_rate {
            Self::require_non_negative(rate, "hourly rate")?;
        }
        let mut projects = self.projects.lock().unwrap();
        let project = projects
            .get_mut(&id)
            .ok_or(CoreError::NotFound { what: "project", id })?;
        if let Some(name) = patch.name {
            project.name = name;
        }
        if let Some(rate) = patch.hourly_rate {
            project.hourly_rate = rate;
        }
        if let Some(location) = patch.location {
            project.location = location;
        }
        Ok(project.clone())
    }

    pub fn delete_project(&self, principal: &Principal, id: ProjectId) -> Result<(), CoreError> {
        self.require_admin(principal)?;
        let referenced = self
            .timesheets
            .lock()
            .unwrap()
            .values()
            .any(|t| t.project_id == id);
        if referenced {
            return Err(CoreError::Conflict(
                "project is referenced by existing timesheets".into(),
            ));
        }
        let removed = self.projects.lock().unwrap().remove(&id);
        if removed.is_none() {
            return Err(CoreError::NotFound { what: "project", id });
        }
        info!("Deleted project {}", id);
        Ok(())
    }

    // --- Timesheets ---

    pub fn create_timesheet(
        &self,
        principal: &Principal,
        req: NewTimesheet,
    ) -> Result<Timesheet, CoreError> {
        let status = req.status.unwrap_or(TimesheetStatus::Draft);
        if !matches!(status, TimesheetStatus::Draft | TimesheetStatus::Pending) {
            return Err(CoreError::Validation(format!(
                "a new timesheet starts as draft or pending, not {}",
                status
            )));
        }

        // Rates are read once here and snapshotted onto the record; later
        // changes to the user's rates must not move historical costs.
        let (normal_rate, overtime_rate) = {
            let users = self.users.lock().unwrap();
            let user = users.get(&principal.user_id).ok_or(CoreError::NotFound {
                what: "user",
                id: principal.user_id,
            })?;
            (
                user.normal_rate.unwrap_or(dec!(0)),
                user.overtime_rate.unwrap_or(dec!(0)),
            )
        };
        if !self.projects.lock().unwrap().contains_key(&req.project_id) {
            return Err(CoreError::NotFound {
                what: "project",
                id: req.project_id,
            });
        }

        let week_starting = week_anchor(req.week_starting);
        let totals = work_hours::aggregate_week(&self.window, &req.daily_hours)?;
        let total_cost = work_hours::compute_cost(
            totals.normal,
            normal_rate,
            totals.overtime,
            overtime_rate,
        );

        let mut timesheets = self.timesheets.lock().unwrap();
        let duplicate = timesheets
            .values()
            .any(|t| t.user_id == principal.user_id && t.week_starting == week_starting);
        if duplicate {
            return Err(CoreError::Conflict(format!(
                "a timesheet for the week starting {} already exists",
                week_starting
            )));
        }

        let id = {
            let mut seq = self.sequences.lock().unwrap();
            seq.timesheet += 1;
            seq.timesheet
        };
        let mut sheet = Timesheet {
            id,
            reference_number: "TEMP".to_string(),
            user_id: principal.user_id,
            project_id: req.project_id,
            week_starting,
            daily_hours: req.daily_hours,
            total_hours: totals.total().round_dp(2),
            normal_hours: totals.normal.round_dp(2),
            overtime_hours: totals.overtime.round_dp(2),
            normal_rate,
            overtime_rate,
            total_cost: total_cost.round_dp(2),
            status,
            notes: req.notes.filter(|n| !n.is_empty()),
        };
        timesheets.insert(id, sheet.clone());
        // The reference derives from the generated id, so it is assigned in
        // a second write after the insert.
        let reference = timesheet_reference(id);
        timesheets
            .get_mut(&id)
            .expect("timesheet row present immediately after insert")
            .reference_number = reference.clone();
        sheet.reference_number = reference;

        info!(
            "Created timesheet {} for user {} week {} ({} status)",
            sheet.reference_number, sheet.user_id, sheet.week_starting, sheet.status
        );
        Ok(sheet)
    }

    pub fn list_own_timesheets(&self, principal: &Principal) -> Result<Vec<Timesheet>, CoreError> {
        let mut sheets: Vec<Timesheet> = self
            .timesheets
            .lock()
            .unwrap()
            .values()
            .filter(|t| t.user_id == principal.user_id)
            .cloned()
            .collect();
        sheets.sort_by(|a, b| b.week_starting.cmp(&a.week_starting).then(a.id.cmp(&b.id)));
        Ok(sheets)
    }

    pub fn find_week_timesheet(
        &self,
        principal: &Principal,
        date: NaiveDate,
    ) -> Result<Option<Timesheet>, CoreError> {
        let week = week_anchor(date);
        Ok(self
            .timesheets
            .lock()
            .unwrap()
            .values()
            .find(|t| t.user_id == principal.user_id && t.week_starting == week)
            .cloned())
    }

    pub fn list_all_timesheets(&self, principal: &Principal) -> Result<Vec<Timesheet>, CoreError> {
        self.require_admin(principal)?;
        let mut sheets: Vec<Timesheet> =
            self.timesheets.lock().unwrap().values().cloned().collect();
        sheets.sort_by(|a, b| b.week_starting.cmp(&a.week_starting).then(a.id.cmp(&b.id)));
        Ok(sheets)
    }

    /// Approved timesheets for one user, oldest week first: the candidate
    /// set the invoicing screen offers for bundling.
    pub fn list_approved_for_user(
        &self,
        principal: &Principal,
        user_id: UserId,
    ) -> Result<Vec<Timesheet>, CoreError> {
        self.require_admin(principal)?;
        let mut sheets: Vec<Timesheet> = self
            .timesheets
            .lock()
            .unwrap()
            .values()
            .filter(|t| t.user_id == user_id && t.status == TimesheetStatus::Approved)
            .cloned()
            .collect();
        sheets.sort_by(|a, b| a.week_starting.cmp(&b.week_starting).then(a.id.cmp(&b.id)));
        Ok(sheets)
    }

    /// Applies an hours/notes/status update under the edit-lock and
    /// transition rules. Everything is validated against the current record
    /// before anything is written, so a rejected call leaves the stored
    /// record untouched.
    pub fn update_timesheet(
        &self,
        principal: &Principal,
        id: TimesheetId,
        patch: TimesheetPatch,
    ) -> Result<Timesheet, CoreError> {
        let mut timesheets = self.timesheets.lock().unwrap();
        let current = timesheets
            .get(&id)
            .ok_or(CoreError::NotFound { what: "timesheet", id })?
            .clone();
        let actor = Actor::for_principal(principal, current.user_id);
        if actor == Actor::Other {
            return Err(CoreError::Authorization(
                "timesheet belongs to another user".into(),
            ));
        }

        let wants_field_edit = patch.daily_hours.is_some() || patch.notes.is_some();
        if wants_field_edit && !policy::can_edit_fields(actor, current.status) {
            warn!(
                "Rejected locked edit of {} ({}) by user {}",
                current.reference_number, current.status, principal.user_id
            );
            return Err(CoreError::Authorization(format!(
                "timesheet is locked while {}",
                current.status
            )));
        }

        let mut updated = current.clone();
        if let Some(status) = patch.status {
            if status != current.status {
                if !policy::can_transition(actor, current.status, status) {
                    warn!(
                        "Rejected transition {} -> {} of {} by user {}",
                        current.status, status, current.reference_number, principal.user_id
                    );
                    return Err(CoreError::Authorization(format!(
                        "cannot move timesheet from {} to {}",
                        current.status, status
                    )));
                }
                updated.status = status;
            }
        }
        if let Some(daily_hours) = patch.daily_hours {
            // Recompute from the submitted hours with the rates snapshotted
            // at creation time, never the user's current rates.
            let totals = work_hours::aggregate_week(&self.window, &daily_hours)?;
            let total_cost = work_hours::compute_cost(
                totals.normal,
                updated.normal_rate,
                totals.overtime,
                updated.overtime_rate,
            );
            updated.daily_hours = daily_hours;
            updated.total_hours = totals.total().round_dp(2);
            updated.normal_hours = totals.normal.round_dp(2);
            updated.overtime_hours = totals.overtime.round_dp(2);
            updated.total_cost = total_cost.round_dp(2);
        }
        if let Some(notes) = patch.notes {
            updated.notes = if notes.is_empty() { None } else { Some(notes) };
        }

        if updated.status != current.status {
            info!(
                "Timesheet {} moved {} -> {}",
                updated.reference_number, current.status, updated.status
            );
        }
        timesheets.insert(id, updated.clone());
        Ok(updated)
    }

    pub fn delete_timesheet(
        &self,
        principal: &Principal,
        id: TimesheetId,
    ) -> Result<(), CoreError> {
        let mut timesheets = self.timesheets.lock().unwrap();
        let current = timesheets
            .get(&id)
            .ok_or(CoreError::NotFound { what: "timesheet", id })?;
        let actor = Actor::for_principal(principal, current.user_id);
        if !policy::can_delete(actor, current.status) {
            return Err(CoreError::Authorization(format!(
                "cannot delete a {} timesheet",
                current.status
            )));
        }
        info!(
            "Deleting timesheet {} ({})",
            current.reference_number, current.status
        );
        timesheets.remove(&id);
        self.invoice_links
            .lock()
            .unwrap()
            .retain(|link| link.timesheet_id != id);
        Ok(())
    }

    // --- Invoicing ---

    /// Bundles a set of approved timesheets into one invoice. The whole
    /// flow runs behind the invoicing gate and the final claim re-checks
    /// every sheet is still approved before flipping it to invoiced, so a
    /// sheet can never be billed twice.
    pub fn create_invoice(
        &self,
        principal: &Principal,
        req: CreateInvoice,
    ) -> Result<Invoice, CoreError> {
        self.require_admin(principal)?;
        if req.timesheet_ids.is_empty() {
            return Err(CoreError::Validation(
                "at least one timesheet is required".into(),
            ));
        }
        Self::require_non_negative(req.vat_rate, "VAT rate")?;
        Self::require_non_negative(req.cis_rate, "CIS rate")?;

        let _gate = self.invoicing_gate.lock().unwrap();

        // Resolve the requested set; a duplicate id, wrong owner, wrong
        // status or unknown id shrinks it below the request size.
        let resolved: Vec<Timesheet> = {
            let timesheets = self.timesheets.lock().unwrap();
            let mut seen = HashSet::new();
            req.timesheet_ids
                .iter()
                .filter(|id| seen.insert(**id))
                .filter_map(|id| {
                    timesheets
                        .get(id)
                        .filter(|t| {
                            t.user_id == req.user_id && t.status == TimesheetStatus::Approved
                        })
                        .cloned()
                })
                .collect()
        };
        if resolved.len() != req.timesheet_ids.len() {
            warn!(
                "Invoice rejected for user {}: {} of {} timesheets invalid or not approved",
                req.user_id,
                req.timesheet_ids.len() - resolved.len(),
                req.timesheet_ids.len()
            );
            return Err(CoreError::Validation(
                "one or more timesheets are invalid or not approved".into(),
            ));
        }

        let payment_frequency = {
            let users = self.users.lock().unwrap();
            users
                .get(&req.user_id)
                .ok_or(CoreError::NotFound {
                    what: "user",
                    id: req.user_id,
                })?
                .payment_frequency
        };

        let basis = work_hours::aggregate_many(&resolved);
        let totals = invoice_math::calculate(basis.subtotal, req.vat_rate, req.cis_rate);
        let created_at = self.clock.now_dt();
        let due_date = invoice_math::due_date(created_at.date(), payment_frequency);

        let id = {
            let mut seq = self.sequences.lock().unwrap();
            seq.invoice += 1;
            seq.invoice
        };
        let mut invoice = Invoice {
            id,
            reference_number: "TEMP".to_string(),
            user_id: req.user_id,
            subtotal: basis.subtotal.round_dp(2),
            vat_rate: req.vat_rate,
            cis_rate: req.cis_rate,
            vat_amount: totals.vat_amount.round_dp(2),
            cis_amount: totals.cis_amount.round_dp(2),
            total_amount: totals.total_amount.round_dp(2),
            normal_hours: basis.normal_hours.round_dp(2),
            overtime_hours: basis.overtime_hours.round_dp(2),
            status: InvoiceStatus::Pending,
            created_at,
            due_date,
            pdf_url: None,
            notes: None,
        };
        {
            let mut invoices = self.invoices.lock().unwrap();
            invoices.insert(id, invoice.clone());
            // Reference derives from the generated id: second write.
            let reference = invoice_reference(id);
            invoices
                .get_mut(&id)
                .expect("invoice row present immediately after insert")
                .reference_number = reference.clone();
            invoice.reference_number = reference;
        }
        {
            let mut links = self.invoice_links.lock().unwrap();
            for timesheet_id in &req.timesheet_ids {
                let link_id = {
                    let mut seq = self.sequences.lock().unwrap();
                    seq.link += 1;
                    seq.link
                };
                links.push(InvoiceTimesheetLink {
                    id: link_id,
                    invoice_id: id,
                    timesheet_id: *timesheet_id,
                });
            }
        }

        // Claim the timesheets: conditional flip approved -> invoiced under
        // one store lock. If anything changed underneath us the invoice row
        // and links above are compensated away and the call fails.
        {
            let mut timesheets = self.timesheets.lock().unwrap();
            let claimable = req.timesheet_ids.iter().all(|tid| {
                timesheets
                    .get(tid)
                    .map(|t| {
                        policy::can_transition(Actor::System, t.status, TimesheetStatus::Invoiced)
                    })
                    .unwrap_or(false)
            });
            if !claimable {
                drop(timesheets);
                self.invoices.lock().unwrap().remove(&id);
                self.invoice_links
                    .lock()
                    .unwrap()
                    .retain(|link| link.invoice_id != id);
                warn!(
                    "Invoice {} rolled back: timesheet no longer approved",
                    invoice.reference_number
                );
                return Err(CoreError::Conflict(
                    "timesheet no longer approved; invoice creation rolled back".into(),
                ));
            }
            for tid in &req.timesheet_ids {
                timesheets
                    .get_mut(tid)
                    .expect("claimable timesheet present under the same lock")
                    .status = TimesheetStatus::Invoiced;
            }
        }

        info!(
            "Created invoice {} for user {}: subtotal {}, total {}, due {}",
            invoice.reference_number,
            invoice.user_id,
            invoice.subtotal,
            invoice.total_amount,
            invoice.due_date
        );
        Ok(invoice)
    }

    pub fn list_invoices(&self, principal: &Principal) -> Result<Vec<Invoice>, CoreError> {
        self.require_admin(principal)?;
        let mut invoices: Vec<Invoice> = self.invoices.lock().unwrap().values().cloned().collect();
        invoices.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(invoices)
    }

    pub fn get_invoice(
        &self,
        principal: &Principal,
        id: InvoiceId,
    ) -> Result<(Invoice, Vec<TimesheetId>), CoreError> {
        self.require_admin(principal)?;
        let invoice = self
            .invoices
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(CoreError::NotFound { what: "invoice", id })?;
        let timesheet_ids: Vec<TimesheetId> = self
            .invoice_links
            .lock()
            .unwrap()
            .iter()
            .filter(|link| link.invoice_id == id)
            .map(|link| link.timesheet_id)
            .collect();
        Ok((invoice, timesheet_ids))
    }

    pub fn set_invoice_status(
        &self,
        principal: &Principal,
        id: InvoiceId,
        status: InvoiceStatus,
    ) -> Result<Invoice, CoreError> {
        self.require_admin(principal)?;
        let mut invoices = self.invoices.lock().unwrap();
        let invoice = invoices
            .get_mut(&id)
            .ok_or(CoreError::NotFound { what: "invoice", id })?;
        invoice.status = status;
        info!("Invoice {} marked {:?}", invoice.reference_number, status);
        Ok(invoice.clone())
    }

    /// Loads a small local data set so the server is usable out of the box
    /// with `--seed-demo`.
    pub fn seed_demo(&self) {
        let admin = Principal {
            user_id: 0,
            role: Role::Admin,
        };
        let seeded = (|| -> Result<(), CoreError> {
            self.create_user(
                &admin,
                NewUser {
                    username: "office".into(),
                    role: Role::Admin,
                    normal_rate: None,
                    overtime_rate: None,
                    payment_frequency: None,
                    email: None,
                    phone_number: None,
                    address: None,
                },
            )?;
            self.create_user(
                &admin,
                NewUser {
                    username: "jsmith".into(),
                    role: Role::Candidate,
                    normal_rate: Some(dec!(18.50)),
                    overtime_rate: Some(dec!(27.75)),
                    payment_frequency: Some(PaymentFrequency::Weekly),
                    email: None,
                    phone_number: None,
                    address: None,
                },
            )?;
            self.create_user(
                &admin,
                NewUser {
                    username: "apatel".into(),
                    role: Role::Candidate,
                    normal_rate: Some(dec!(21.00)),
                    overtime_rate: Some(dec!(31.50)),
                    payment_frequency: Some(PaymentFrequency::Monthly),
                    email: None,
                    phone_number: None,
                    address: None,
                },
            )?;
            self.create_project(
                &admin,
                NewProject {
                    name: "Fibre rollout - Manchester".into(),
                    hourly_rate: dec!(35.00),
                    location: "Manchester".into(),
                },
            )?;
            self.create_project(
                &admin,
                NewProject {
                    name: "Data centre cabling - Slough".into(),
                    hourly_rate: dec!(42.00),
                    location: "Slough".into(),
                },
            )?;
            Ok(())
        })();
        match seeded {
            Ok(()) => info!("Seeded demo users and projects"),
            Err(err) => warn!("Demo seed skipped: {}", err),
        }
    }
}
