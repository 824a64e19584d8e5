//! SCA authorisation Finite State Machine (FSM)
//!
//! Formal model of one authorisation attempt, from creation until it reaches
//! a terminal status. Every "update PSU data" request is routed to the
//! stage handler registered for the record's current status; the handler
//! does the I/O and returns a [`StageOutcome`] that this module checks
//! against the transition rules before anything is persisted.
//!
//! # States
//!
//! ```text
//!   ┌──────────┐  PSU id only   ┌───────────────┐
//!   │ RECEIVED │───────────────▶│ PSU_IDENTIFIED│
//!   └────┬─────┘                └───────┬───────┘
//!        │ credential / bank proof      │ credential / bank proof
//!        ▼                              ▼
//!   ┌──────────────────┐  method selected   ┌────────────────────┐
//!   │ PSU_AUTHENTICATED│───────────────────▶│ SCA_METHOD_SELECTED│
//!   └────────┬─────────┘                    └─────────┬──────────┘
//!            │ zero methods / one-factor              │ code confirmed
//!            │              ┌───────────┐             │
//!            └─────────────▶│ FINALISED │◀────────────┘
//!                           └───────────┘
//!
//!   any non-terminal ──▶ FAILED      (credentials, SCA, expiry, backend)
//!   early stages     ──▶ EXEMPTED    (backend reports no SCA required)
//! ```
//!
//! # Monotonicity
//!
//! Non-terminal statuses only move forward in the order listed above.
//! `FINALISED`, `FAILED` and `EXEMPTED` are terminal: once stored, no
//! further transition is accepted.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::stages::{self, StageContext};
use crate::approach::BankOutcome;
use crate::error::ErrorKind;
use crate::storage::PsuIdData;

// ---------------------------------------------------------------------------
// SCA statuses
// ---------------------------------------------------------------------------

/// Status of a single authorisation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScaStatus {
    /// Created, nothing submitted yet.
    Received,
    /// The PSU identified itself without credentials.
    PsuIdentified,
    /// The PSU passed the first factor.
    PsuAuthenticated,
    /// An SCA method was chosen and a challenge issued.
    ScaMethodSelected,
    /// SCA completed and the underlying operation was executed. Terminal.
    Finalised,
    /// SCA failed. Terminal.
    Failed,
    /// The bank waived SCA. Terminal.
    Exempted,
}

impl ScaStatus {
    /// Returns true if this is a terminal status (no further transitions).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScaStatus::Finalised | ScaStatus::Failed | ScaStatus::Exempted
        )
    }

    /// Position in the forward-only ordering of the flow.
    pub fn rank(&self) -> u8 {
        match self {
            ScaStatus::Received => 0,
            ScaStatus::PsuIdentified => 1,
            ScaStatus::PsuAuthenticated => 2,
            ScaStatus::ScaMethodSelected => 3,
            ScaStatus::Finalised | ScaStatus::Failed | ScaStatus::Exempted => 4,
        }
    }
}

impl fmt::Display for ScaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScaStatus::Received => write!(f, "received"),
            ScaStatus::PsuIdentified => write!(f, "psuIdentified"),
            ScaStatus::PsuAuthenticated => write!(f, "psuAuthenticated"),
            ScaStatus::ScaMethodSelected => write!(f, "scaMethodSelected"),
            ScaStatus::Finalised => write!(f, "finalised"),
            ScaStatus::Failed => write!(f, "failed"),
            ScaStatus::Exempted => write!(f, "exempted"),
        }
    }
}

impl FromStr for ScaStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "received" => Ok(ScaStatus::Received),
            "psuIdentified" => Ok(ScaStatus::PsuIdentified),
            "psuAuthenticated" => Ok(ScaStatus::PsuAuthenticated),
            "scaMethodSelected" => Ok(ScaStatus::ScaMethodSelected),
            "finalised" => Ok(ScaStatus::Finalised),
            "failed" => Ok(ScaStatus::Failed),
            "exempted" => Ok(ScaStatus::Exempted),
            _ => Err(format!("Invalid SCA status: {}", s)),
        }
    }
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

/// What happens when the bank offers no SCA method after authentication.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZeroMethodsPolicy {
    /// Treat authentication as sufficient: execute and finalise.
    #[default]
    Finalise,
    /// Fail the authorisation with `SCA_METHOD_UNKNOWN`.
    Reject,
}

/// From which statuses a backend exemption may move a record to `EXEMPTED`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExemptionPolicy {
    /// Only before an SCA method was selected.
    #[default]
    PreAuthenticationOnly,
    /// From any non-terminal status.
    AnyNonTerminal,
}

impl ExemptionPolicy {
    pub fn allows_from(&self, status: ScaStatus) -> bool {
        match self {
            ExemptionPolicy::PreAuthenticationOnly => matches!(
                status,
                ScaStatus::Received | ScaStatus::PsuIdentified | ScaStatus::PsuAuthenticated
            ),
            ExemptionPolicy::AnyNonTerminal => !status.is_terminal(),
        }
    }
}

/// Policies the stage handlers consult.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagePolicy {
    pub zero_methods: ZeroMethodsPolicy,
    pub exemption: ExemptionPolicy,
    /// Attempt failures tolerated before the record is failed.
    pub max_failed_attempts: u32,
}

impl Default for StagePolicy {
    fn default() -> Self {
        Self {
            zero_methods: ZeroMethodsPolicy::default(),
            exemption: ExemptionPolicy::default(),
            max_failed_attempts: 3,
        }
    }
}

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

/// Payload of an "update PSU data" request.
///
/// Which fields are meaningful depends on the current status and on the
/// record's SCA approach.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePsuDataRequest {
    /// PSU identity submitted with the request
    pub psu: Option<PsuIdData>,
    /// First-factor credential collected by the TPP (embedded/decoupled)
    pub password: Option<String>,
    /// Chosen SCA method
    pub authentication_method_id: Option<String>,
    /// OTP or confirmation code
    pub sca_authentication_data: Option<String>,
    /// Result reported by the bank on a redirect callback or decoupled channel
    pub bank_outcome: Option<BankOutcome>,
}

impl UpdatePsuDataRequest {
    pub fn identification(psu: PsuIdData) -> Self {
        Self {
            psu: Some(psu),
            ..Default::default()
        }
    }

    pub fn authentication(psu: PsuIdData, password: impl Into<String>) -> Self {
        Self {
            psu: Some(psu),
            password: Some(password.into()),
            ..Default::default()
        }
    }

    pub fn method_selection(method_id: impl Into<String>) -> Self {
        Self {
            authentication_method_id: Some(method_id.into()),
            ..Default::default()
        }
    }

    pub fn confirmation(code: impl Into<String>) -> Self {
        Self {
            sca_authentication_data: Some(code.into()),
            ..Default::default()
        }
    }

    pub fn bank_callback(outcome: BankOutcome) -> Self {
        Self {
            bank_outcome: Some(outcome),
            ..Default::default()
        }
    }

    /// The submitted PSU, if it carries an identity.
    pub fn submitted_psu(&self) -> Option<&PsuIdData> {
        self.psu.as_ref().filter(|p| !p.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Stage outcome
// ---------------------------------------------------------------------------

/// A business failure produced by a stage handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageError {
    pub kind: ErrorKind,
    pub message: String,
}

impl StageError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// What a stage handler decided.
///
/// Handlers mutate a working copy of the record; whether that copy is
/// persisted depends on the variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// Persist the working copy with this status.
    Transition(ScaStatus),
    /// Report the error and discard the working copy.
    Reject(StageError),
    /// Persist the working copy (attempt counter) without changing status.
    Retry(StageError),
    /// Persist the working copy as `FAILED`.
    Fail(StageError),
}

impl StageOutcome {
    pub fn reject(kind: ErrorKind, message: impl Into<String>) -> Self {
        StageOutcome::Reject(StageError::new(kind, message))
    }

    pub fn fail(kind: ErrorKind, message: impl Into<String>) -> Self {
        StageOutcome::Fail(StageError::new(kind, message))
    }

    pub fn retry(kind: ErrorKind, message: impl Into<String>) -> Self {
        StageOutcome::Retry(StageError::new(kind, message))
    }
}

// ---------------------------------------------------------------------------
// Transition result
// ---------------------------------------------------------------------------

/// A checked status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from_status: ScaStatus,
    pub to_status: ScaStatus,
}

impl Transition {
    pub fn is_change(&self) -> bool {
        self.from_status != self.to_status
    }
}

/// Error returned when a handler proposes a forbidden transition.
#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_status: ScaStatus,
    pub requested: ScaStatus,
    pub reason: String,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Invalid transition: cannot move from {} to {} ({})",
            self.current_status, self.requested, self.reason
        )
    }
}

impl std::error::Error for InvalidTransition {}

// ---------------------------------------------------------------------------
// The FSM engine
// ---------------------------------------------------------------------------

/// A stage handler: async function over a [`StageContext`].
pub type StageHandler = for<'a> fn(StageContext<'a>) -> BoxFuture<'a, StageOutcome>;

/// Pure-logic FSM engine for SCA authorisations.
///
/// Holds the dispatch table and the transition rules. It performs no I/O;
/// the processor loads and persists records around it.
pub struct AuthorisationFsm;

impl AuthorisationFsm {
    /// The handler responsible for requests against a record in `status`.
    ///
    /// The table is total: every status, terminal ones included, has a handler.
    pub fn handler_for(status: ScaStatus) -> StageHandler {
        match status {
            ScaStatus::Received | ScaStatus::PsuIdentified => stages::authenticate_psu,
            ScaStatus::PsuAuthenticated => stages::select_method,
            ScaStatus::ScaMethodSelected => stages::confirm_sca,
            ScaStatus::Finalised | ScaStatus::Failed | ScaStatus::Exempted => stages::terminal,
        }
    }

    /// Validate a proposed status change.
    pub fn check_transition(
        from: ScaStatus,
        to: ScaStatus,
        exemption: ExemptionPolicy,
    ) -> Result<Transition, InvalidTransition> {
        let invalid = |reason: &str| {
            log::debug!("Refusing transition {} -> {}: {}", from, to, reason);
            InvalidTransition {
                current_status: from,
                requested: to,
                reason: reason.to_string(),
            }
        };

        if from.is_terminal() {
            return Err(invalid("status is terminal"));
        }

        match to {
            ScaStatus::Failed | ScaStatus::Finalised => {}
            ScaStatus::Exempted => {
                if !exemption.allows_from(from) {
                    return Err(invalid("exemption not allowed at this stage"));
                }
            }
            _ => {
                if to.rank() < from.rank() {
                    return Err(invalid("status may not move backwards"));
                }
            }
        }

        Ok(Transition {
            from_status: from,
            to_status: to,
        })
    }

    /// Returns all statuses reachable from `status` (for documentation/UI).
    pub fn valid_next(status: ScaStatus, exemption: ExemptionPolicy) -> Vec<ScaStatus> {
        [
            ScaStatus::Received,
            ScaStatus::PsuIdentified,
            ScaStatus::PsuAuthenticated,
            ScaStatus::ScaMethodSelected,
            ScaStatus::Finalised,
            ScaStatus::Failed,
            ScaStatus::Exempted,
        ]
        .into_iter()
        .filter(|to| *to != status)
        .filter(|to| Self::check_transition(status, *to, exemption).is_ok())
        .collect()
    }
}
