//! Stage handlers
//!
//! One handler per status group, registered in
//! [`AuthorisationFsm::handler_for`](super::AuthorisationFsm::handler_for).
//! Handlers mutate the working copy of the record and return a
//! [`StageOutcome`]; they never persist anything themselves.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::fsm::{StageOutcome, StagePolicy, UpdatePsuDataRequest, ZeroMethodsPolicy};
use super::ScaStatus;
use crate::approach::{BankOutcome, Evidence, EvidenceSource};
use crate::backend::{AuthenticationOutcome, BackendCaller, BackendError, BackendRequest};
use crate::error::ErrorKind;
use crate::storage::{AuthenticationMethod, AuthorisationRecord, ParentResource, PsuIdData};

/// Everything a stage handler may read or mutate.
pub struct StageContext<'a> {
    /// Working copy of the record
    pub record: &'a mut AuthorisationRecord,
    pub request: &'a UpdatePsuDataRequest,
    pub resource: &'a ParentResource,
    pub backend: &'a BackendCaller,
    pub evidence: &'a dyn EvidenceSource,
    pub policy: StagePolicy,
    pub now: DateTime<Utc>,
}

impl StageContext<'_> {
    fn psu(&self) -> PsuIdData {
        self.record.psu.clone().unwrap_or_default()
    }

    fn record_attempt_failure(&mut self, kind: ErrorKind, message: &str) -> StageOutcome {
        self.record.failed_attempts += 1;
        if self.record.failed_attempts >= self.policy.max_failed_attempts {
            info!(
                "Authorisation {} exhausted {} attempts",
                self.record.authorisation_id, self.record.failed_attempts
            );
            StageOutcome::fail(kind, format!("{}, no attempts left", message))
        } else {
            StageOutcome::retry(
                kind,
                format!(
                    "{}, {} attempt(s) left",
                    message,
                    self.policy.max_failed_attempts - self.record.failed_attempts
                ),
            )
        }
    }
}

/// base64 SHA-256 of a confirmation code.
pub fn hash_confirmation_code(code: &str) -> String {
    STANDARD.encode(Sha256::digest(code.as_bytes()))
}

fn backend_failure(operation: &str, err: BackendError, rejected_kind: ErrorKind) -> StageOutcome {
    match err {
        BackendError::Timeout { .. } | BackendError::Unavailable(_) => StageOutcome::fail(
            ErrorKind::ServiceUnavailable,
            format!("{} failed: {}", operation, err),
        ),
        BackendError::Rejected(reason) => {
            StageOutcome::fail(rejected_kind, format!("{} rejected: {}", operation, reason))
        }
    }
}

// ---------------------------------------------------------------------------
// RECEIVED / PSU_IDENTIFIED
// ---------------------------------------------------------------------------

/// Identification and first-factor authentication.
pub fn authenticate_psu(mut ctx: StageContext<'_>) -> BoxFuture<'_, StageOutcome> {
    Box::pin(async move {
        if ctx.record.psu.is_none() {
            ctx.record.psu = ctx.request.submitted_psu().cloned();
        }

        match ctx.evidence.authentication_evidence(ctx.request) {
            None => {
                if ctx.record.psu.is_none() {
                    StageOutcome::reject(ErrorKind::FormatError, "PSU identification data missing")
                } else if ctx.record.sca_status == ScaStatus::Received {
                    debug!("PSU identified on {}", ctx.record.authorisation_id);
                    StageOutcome::Transition(ScaStatus::PsuIdentified)
                } else {
                    StageOutcome::reject(ErrorKind::FormatError, "PSU credentials missing")
                }
            }
            Some(Evidence::Credential(credential)) => {
                if ctx.record.psu.is_none() {
                    return StageOutcome::reject(
                        ErrorKind::FormatError,
                        "PSU identification data missing",
                    );
                }
                let psu = ctx.psu();
                let request = BackendRequest {
                    psu: &psu,
                    resource: ctx.resource,
                    aspsp_data: ctx.record.aspsp_data.as_deref(),
                };
                let outcome = ctx
                    .backend
                    .call(
                        "authenticate",
                        ctx.backend.backend().authenticate(request, &credential),
                    )
                    .await;

                match outcome {
                    Ok(AuthenticationOutcome::Success) => after_authentication(&mut ctx).await,
                    Ok(AuthenticationOutcome::Exempted) => exempt(&mut ctx).await,
                    Ok(AuthenticationOutcome::AttemptFailure) => ctx.record_attempt_failure(
                        ErrorKind::PsuCredentialsInvalid,
                        "PSU credentials invalid",
                    ),
                    Ok(AuthenticationOutcome::Failure) => StageOutcome::fail(
                        ErrorKind::PsuCredentialsInvalid,
                        "PSU authentication rejected",
                    ),
                    Err(err) => {
                        backend_failure("authentication", err, ErrorKind::PsuCredentialsInvalid)
                    }
                }
            }
            Some(Evidence::BankOutcome(BankOutcome::Confirmed)) => {
                after_authentication(&mut ctx).await
            }
            Some(Evidence::BankOutcome(BankOutcome::Rejected)) => StageOutcome::fail(
                ErrorKind::PsuCredentialsInvalid,
                "PSU authentication rejected by the bank",
            ),
            Some(Evidence::ScaCode(_)) => StageOutcome::reject(
                ErrorKind::FormatError,
                "SCA authentication data not expected before authentication",
            ),
        }
    })
}

async fn after_authentication(ctx: &mut StageContext<'_>) -> StageOutcome {
    ctx.record.failed_attempts = 0;
    if ctx.resource.one_factor_authorisation {
        debug!(
            "One-factor authorisation on {}, finalising",
            ctx.record.authorisation_id
        );
        return finalise(ctx, ScaStatus::Finalised).await;
    }
    offer_methods(ctx).await
}

async fn offer_methods(ctx: &mut StageContext<'_>) -> StageOutcome {
    let psu = ctx.psu();
    let request = BackendRequest {
        psu: &psu,
        resource: ctx.resource,
        aspsp_data: ctx.record.aspsp_data.as_deref(),
    };
    let methods = match ctx
        .backend
        .call(
            "list_sca_methods",
            ctx.backend.backend().list_sca_methods(request),
        )
        .await
    {
        Ok(methods) => methods,
        Err(err) => {
            return backend_failure("listing SCA methods", err, ErrorKind::ServiceUnavailable)
        }
    };

    match methods.len() {
        0 => match ctx.policy.zero_methods {
            ZeroMethodsPolicy::Finalise => finalise(ctx, ScaStatus::Finalised).await,
            ZeroMethodsPolicy::Reject => {
                StageOutcome::fail(ErrorKind::ScaMethodUnknown, "no SCA method available")
            }
        },
        1 => {
            ctx.record.available_sca_methods = methods.clone();
            let method = methods[0].clone();
            issue_challenge(ctx, method).await
        }
        _ => {
            ctx.record.available_sca_methods = methods;
            StageOutcome::Transition(ScaStatus::PsuAuthenticated)
        }
    }
}

// ---------------------------------------------------------------------------
// PSU_AUTHENTICATED
// ---------------------------------------------------------------------------

/// SCA method selection.
pub fn select_method(mut ctx: StageContext<'_>) -> BoxFuture<'_, StageOutcome> {
    Box::pin(async move {
        if ctx.record.available_sca_methods.is_empty() {
            return offer_methods(&mut ctx).await;
        }

        let Some(method_id) = ctx.request.authentication_method_id.as_deref() else {
            return StageOutcome::reject(ErrorKind::FormatError, "authentication method id missing");
        };

        match ctx.record.offered_method(method_id).cloned() {
            Some(method) => issue_challenge(&mut ctx, method).await,
            None => StageOutcome::reject(
                ErrorKind::ScaMethodUnknown,
                format!("SCA method {} was not offered", method_id),
            ),
        }
    })
}

async fn issue_challenge(ctx: &mut StageContext<'_>, method: AuthenticationMethod) -> StageOutcome {
    if let Err(reason) = ctx.record.choose_method(method.clone()) {
        return StageOutcome::reject(ErrorKind::StatusInvalid, reason);
    }

    let psu = ctx.psu();
    let request = BackendRequest {
        psu: &psu,
        resource: ctx.resource,
        aspsp_data: ctx.record.aspsp_data.as_deref(),
    };
    let result = match ctx
        .backend
        .call(
            "request_authorisation_code",
            ctx.backend
                .backend()
                .request_authorisation_code(request, &method),
        )
        .await
    {
        Ok(result) => result,
        Err(err) => {
            return backend_failure(
                "requesting authorisation code",
                err,
                ErrorKind::ScaMethodUnknown,
            )
        }
    };

    if let Some(data) = result.aspsp_data {
        ctx.record.aspsp_data = Some(data);
    }

    if result.sca_exempted {
        return exempt(ctx).await;
    }

    ctx.record.challenge_data = result.challenge_data;
    ctx.record.confirmation_code_hash = result
        .confirmation_code
        .as_deref()
        .map(hash_confirmation_code);

    info!(
        "SCA method {} selected on {}",
        method.authentication_method_id, ctx.record.authorisation_id
    );
    StageOutcome::Transition(ScaStatus::ScaMethodSelected)
}

// ---------------------------------------------------------------------------
// SCA_METHOD_SELECTED
// ---------------------------------------------------------------------------

/// Confirmation of the SCA code.
pub fn confirm_sca(mut ctx: StageContext<'_>) -> BoxFuture<'_, StageOutcome> {
    Box::pin(async move {
        let evidence = ctx.evidence.confirmation_evidence(ctx.record, ctx.request);

        if evidence.is_none() && ctx.request.authentication_method_id.is_some() {
            return StageOutcome::reject(ErrorKind::StatusInvalid, "SCA method already chosen");
        }

        match evidence {
            None => StageOutcome::reject(ErrorKind::FormatError, "SCA authentication data missing"),
            Some(Evidence::ScaCode(code)) => confirm_code(&mut ctx, &code).await,
            Some(Evidence::BankOutcome(BankOutcome::Confirmed)) => {
                finalise(&mut ctx, ScaStatus::Finalised).await
            }
            Some(Evidence::BankOutcome(BankOutcome::Rejected)) => {
                StageOutcome::fail(ErrorKind::ScaInvalid, "SCA rejected by the bank")
            }
            Some(Evidence::Credential(_)) => {
                StageOutcome::reject(ErrorKind::FormatError, "PSU already authenticated")
            }
        }
    })
}

async fn confirm_code(ctx: &mut StageContext<'_>, code: &str) -> StageOutcome {
    if let Some(expected) = ctx.record.confirmation_code_hash.as_deref() {
        return if hash_confirmation_code(code) == expected {
            finalise(ctx, ScaStatus::Finalised).await
        } else {
            StageOutcome::fail(ErrorKind::ScaInvalid, "confirmation code does not match")
        };
    }

    let psu = ctx.psu();
    let request = BackendRequest {
        psu: &psu,
        resource: ctx.resource,
        aspsp_data: ctx.record.aspsp_data.as_deref(),
    };
    let outcome = ctx
        .backend
        .call(
            "confirm",
            ctx.backend
                .backend()
                .confirm(request, code, ctx.record.challenge_data.as_ref()),
        )
        .await;

    match outcome {
        Ok(AuthenticationOutcome::Success) => finalise(ctx, ScaStatus::Finalised).await,
        Ok(AuthenticationOutcome::Exempted) => exempt(ctx).await,
        Ok(AuthenticationOutcome::AttemptFailure) => {
            ctx.record_attempt_failure(ErrorKind::ScaInvalid, "SCA code invalid")
        }
        Ok(AuthenticationOutcome::Failure) => {
            StageOutcome::fail(ErrorKind::ScaInvalid, "SCA code rejected")
        }
        Err(err) => backend_failure("SCA confirmation", err, ErrorKind::ScaInvalid),
    }
}

// ---------------------------------------------------------------------------
// Terminal statuses
// ---------------------------------------------------------------------------

/// Terminal records accept no input.
pub fn terminal(ctx: StageContext<'_>) -> BoxFuture<'_, StageOutcome> {
    Box::pin(async move {
        StageOutcome::reject(
            ErrorKind::StatusInvalid,
            format!("authorisation is {}", ctx.record.sca_status),
        )
    })
}

// ---------------------------------------------------------------------------
// Shared completion
// ---------------------------------------------------------------------------

/// Exemption outside the policy still executes, but is recorded as finalised.
async fn exempt(ctx: &mut StageContext<'_>) -> StageOutcome {
    if ctx.policy.exemption.allows_from(ctx.record.sca_status) {
        finalise(ctx, ScaStatus::Exempted).await
    } else {
        finalise(ctx, ScaStatus::Finalised).await
    }
}

/// Execute the underlying operation, then move to `status`.
async fn finalise(ctx: &mut StageContext<'_>, status: ScaStatus) -> StageOutcome {
    let psu = ctx.psu();
    let request = BackendRequest {
        psu: &psu,
        resource: ctx.resource,
        aspsp_data: ctx.record.aspsp_data.as_deref(),
    };
    match ctx
        .backend
        .call(
            "execute_underlying_operation",
            ctx.backend.backend().execute_underlying_operation(request),
        )
        .await
    {
        Ok(()) => {
            info!(
                "Executed {} {} after SCA on {}",
                ctx.resource.resource_kind, ctx.resource.resource_id, ctx.record.authorisation_id
            );
            StageOutcome::Transition(status)
        }
        Err(err) => backend_failure("executing the operation", err, ErrorKind::ServiceUnavailable),
    }
}
