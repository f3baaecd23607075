//! Incident status transitions and their guards
//!
//! Every legal transition is listed in [`TRANSITIONS`] together with the
//! permission it requires. Validation runs in a fixed order: the state
//! change must exist, then the caller's role must hold the guard token,
//! then any side-fields the transition needs must be present. Only a
//! validated [`TransitionPlan`] can produce the store patch.

use serde_json::{json, Value};

use super::model::{IncidentStatus, TransitionRequest};
use crate::auth::{tokens, PermissionCatalog};
use crate::store::{server_sequence, server_timestamp};
use crate::types::{BeaconError, Result};

/// One edge of the transition graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionRule {
    pub from: IncidentStatus,
    pub to: IncidentStatus,
    /// Guard token
    pub permission: &'static str,
    /// Dispatch must name who is dispatched in the same write
    pub requires_assignee: bool,
}

const fn rule(
    from: IncidentStatus,
    to: IncidentStatus,
    permission: &'static str,
    requires_assignee: bool,
) -> TransitionRule {
    TransitionRule {
        from,
        to,
        permission,
        requires_assignee,
    }
}

use IncidentStatus::*;

/// The complete transition table. Anything not listed is invalid.
pub const TRANSITIONS: &[TransitionRule] = &[
    rule(Reported, Verified, tokens::INCIDENTS_VERIFY, false),
    rule(Reported, Rejected, tokens::INCIDENTS_REJECT, false),
    rule(Verified, TeamDispatched, tokens::INCIDENTS_DISPATCH, true),
    rule(Verified, Rejected, tokens::INCIDENTS_REJECT, false),
    rule(TeamDispatched, InProgress, tokens::INCIDENTS_UPDATE, false),
    rule(InProgress, Resolved, tokens::INCIDENTS_RESOLVE, false),
];

/// Status every new incident starts in
pub const INITIAL_STATUS: IncidentStatus = Reported;

/// Permission needed to create an incident
pub const CREATE_PERMISSION: &str = tokens::INCIDENTS_CREATE;

pub fn rule_for(from: IncidentStatus, to: IncidentStatus) -> Option<&'static TransitionRule> {
    TRANSITIONS.iter().find(|r| r.from == from && r.to == to)
}

/// Statuses reachable in one step from `from`
pub fn next_statuses(from: IncidentStatus) -> Vec<IncidentStatus> {
    TRANSITIONS
        .iter()
        .filter(|r| r.from == from)
        .map(|r| r.to)
        .collect()
}

/// Transitions from `from` that `role` may perform
pub fn permitted_transitions(
    catalog: &PermissionCatalog,
    role: &str,
    from: IncidentStatus,
) -> Vec<IncidentStatus> {
    TRANSITIONS
        .iter()
        .filter(|r| r.from == from && catalog.has_permission(role, r.permission))
        .map(|r| r.to)
        .collect()
}

/// A transition that passed every guard
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionPlan {
    pub from: IncidentStatus,
    pub to: IncidentStatus,
    pub assigned_to: Option<String>,
}

impl TransitionPlan {
    /// Field the commit is conditioned on, and the value it must still hold
    pub fn precondition(&self) -> (&'static str, Value) {
        ("status", json!(self.from.as_str()))
    }

    /// New status plus the updated-at and revision markers, committed as one write
    pub fn patch(&self) -> Value {
        let mut patch = json!({
            "status": self.to.as_str(),
            "updatedAt": server_timestamp(),
            "rev": server_sequence(),
        });
        if let Some(assignee) = &self.assigned_to {
            patch["assignedTo"] = json!(assignee);
        }
        patch
    }
}

/// Validate `request` against the current status and the caller's role
pub fn validate_transition(
    catalog: &PermissionCatalog,
    role: &str,
    current: IncidentStatus,
    request: &TransitionRequest,
) -> Result<TransitionPlan> {
    if current.is_terminal() {
        return Err(BeaconError::InvalidStateTransition(format!(
            "{} is final, no transition to {}",
            current, request.to
        )));
    }
    let rule = rule_for(current, request.to).ok_or_else(|| {
        BeaconError::InvalidStateTransition(format!("{} -> {} is not allowed", current, request.to))
    })?;

    catalog.require(role, rule.permission)?;

    let assignee = request
        .assigned_to
        .as_deref()
        .map(str::trim)
        .filter(|a| !a.is_empty());

    let assigned_to = match (rule.requires_assignee, assignee) {
        (true, Some(assignee)) => Some(assignee.to_string()),
        (true, None) => {
            return Err(BeaconError::InvalidStateTransition(format!(
                "{} -> {} requires assignedTo",
                current, request.to
            )))
        }
        (false, Some(_)) => {
            return Err(BeaconError::BadRequest(format!(
                "assignedTo is only accepted when dispatching, not on {} -> {}",
                current, request.to
            )))
        }
        (false, None) => None,
    };

    Ok(TransitionPlan {
        from: current,
        to: request.to,
        assigned_to,
    })
}
