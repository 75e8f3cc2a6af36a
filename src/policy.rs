// src/policy.rs
//
// The single authorization/state-machine check every timesheet operation
// goes through. Handlers never inspect roles or statuses themselves.

use crate::models::{Principal, TimesheetStatus, UserId};

/// Who is acting on a timesheet, reduced to the only distinctions the rules
/// care about. `System` is reserved for the invoicing flow and is never
/// derived from a request principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    Admin,
    Owner,
    Other,
    System,
}

impl Actor {
    pub fn for_principal(principal: &Principal, timesheet_owner: UserId) -> Actor {
        if principal.is_admin() {
            Actor::Admin
        } else if principal.user_id == timesheet_owner {
            Actor::Owner
        } else {
            Actor::Other
        }
    }
}

/// Legal status transitions:
///
///   draft    -> pending   owner submits
///   pending  -> approved  admin
///   pending  -> rejected  admin
///   rejected -> pending   owner resubmits
///   approved -> invoiced  system (invoice creation only)
///   any      -> any       admin override
///
/// `invoiced` is terminal for everyone except the admin override.
pub fn can_transition(actor: Actor, from: TimesheetStatus, to: TimesheetStatus) -> bool {
    use crate::models::TimesheetStatus::*;
    match actor {
        Actor::Admin => true,
        Actor::System => from == Approved && to == Invoiced,
        Actor::Owner => matches!((from, to), (Draft, Pending) | (Rejected, Pending)),
        Actor::Other => false,
    }
}

/// Edit lock for the hours/notes payload, independent of the transition
/// table: a non-admin owner may only touch an unlocked sheet (draft or
/// rejected).
pub fn can_edit_fields(actor: Actor, status: TimesheetStatus) -> bool {
    match actor {
        Actor::Admin => true,
        Actor::Owner => matches!(status, TimesheetStatus::Draft | TimesheetStatus::Rejected),
        Actor::Other | Actor::System => false,
    }
}

/// Deletion policy: admin always; owner only while the sheet is still theirs
/// to edit (draft or rejected).
pub fn can_delete(actor: Actor, status: TimesheetStatus) -> bool {
    match actor {
        Actor::Admin => true,
        Actor::Owner => matches!(status, TimesheetStatus::Draft | TimesheetStatus::Rejected),
        Actor::Other | Actor::System => false,
    }
}

#[cfg(test)]
mod policy_tests {
    use super::*;
    use crate::models::Role;
    use crate::models::TimesheetStatus::*;

    fn owner() -> Actor {
        Actor::Owner
    }

    #[test]
    fn actor_derivation_from_principal() {
        let admin = Principal {
            user_id: 1,
            role: Role::Admin,
        };
        let candidate = Principal {
            user_id: 2,
            role: Role::Candidate,
        };
        assert_eq!(Actor::for_principal(&admin, 99), Actor::Admin);
        assert_eq!(Actor::for_principal(&candidate, 2), Actor::Owner);
        assert_eq!(Actor::for_principal(&candidate, 3), Actor::Other);
    }

    #[test]
    fn owner_transitions_limited_to_submit_and_resubmit() {
        assert!(can_transition(owner(), Draft, Pending));
        assert!(can_transition(owner(), Rejected, Pending));

        assert!(!can_transition(owner(), Pending, Approved));
        assert!(!can_transition(owner(), Pending, Rejected));
        assert!(!can_transition(owner(), Approved, Invoiced));
        assert!(!can_transition(owner(), Invoiced, Draft));
        assert!(!can_transition(owner(), Draft, Approved));
    }

    #[test]
    fn admin_may_force_any_transition() {
        for from in [Draft, Pending, Approved, Rejected, Invoiced] {
            for to in [Draft, Pending, Approved, Rejected, Invoiced] {
                assert!(can_transition(Actor::Admin, from, to));
            }
        }
    }

    #[test]
    fn system_only_claims_approved_sheets() {
        assert!(can_transition(Actor::System, Approved, Invoiced));
        assert!(!can_transition(Actor::System, Pending, Invoiced));
        assert!(!can_transition(Actor::System, Draft, Pending));
    }

    #[test]
    fn strangers_can_do_nothing() {
        assert!(!can_transition(Actor::Other, Draft, Pending));
        assert!(!can_edit_fields(Actor::Other, Draft));
        assert!(!can_delete(Actor::Other, Rejected));
    }

    #[test]
    fn edit_lock_engages_once_submitted() {
        assert!(can_edit_fields(owner(), Draft));
        assert!(can_edit_fields(owner(), Rejected));
        assert!(!can_edit_fields(owner(), Pending));
        assert!(!can_edit_fields(owner(), Approved));
        assert!(!can_edit_fields(owner(), Invoiced));

        for status in [Draft, Pending, Approved, Rejected, Invoiced] {
            assert!(can_edit_fields(Actor::Admin, status));
        }
    }

    #[test]
    fn delete_policy_mirrors_edit_lock_for_owners() {
        assert!(can_delete(owner(), Draft));
        assert!(can_delete(owner(), Rejected));
        assert!(!can_delete(owner(), Pending));
        assert!(!can_delete(owner(), Approved));
        assert!(!can_delete(owner(), Invoiced));
        assert!(can_delete(Actor::Admin, Invoiced));
    }
}
