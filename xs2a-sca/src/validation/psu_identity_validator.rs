//! PSU identity checks

use super::{AuthorisationValidator, ValidationContext, ValidationResult};
use crate::error::ErrorKind;
use async_trait::async_trait;

/// Validator that checks who is acting on an authorisation
///
/// - A submitted PSU must match the PSU already bound to the record.
/// - On multilevel resources the PSU must be one of the expected co-signers
///   and must not have completed another authorisation of the same resource.
pub struct PsuIdentityValidator;

#[async_trait]
impl AuthorisationValidator for PsuIdentityValidator {
    async fn validate(&self, ctx: &ValidationContext<'_>) -> ValidationResult {
        let submitted = ctx.request.submitted_psu();

        if let (Some(bound), Some(submitted)) = (ctx.record.psu.as_ref(), submitted) {
            if !bound.matches(submitted) {
                return ValidationResult::Reject(
                    ErrorKind::ResourceUnknown,
                    "PSU does not match the authorisation".to_string(),
                );
            }
        }

        if !ctx.resource.multilevel_sca_required {
            return ValidationResult::Accept;
        }

        let Some(psu) = ctx.record.psu.as_ref().or(submitted) else {
            return ValidationResult::Accept;
        };

        if !ctx.resource.psus.is_empty() && !ctx.resource.psus.iter().any(|p| p.matches(psu)) {
            return ValidationResult::Reject(
                ErrorKind::ResourceUnknown,
                "PSU is not a co-signer of this resource".to_string(),
            );
        }

        let already_signed = ctx.siblings.iter().any(|other| {
            other.authorisation_id != ctx.record.authorisation_id
                && other.is_successful()
                && other.psu.as_ref().map_or(false, |p| p.matches(psu))
        });
        if already_signed {
            return ValidationResult::Reject(
                ErrorKind::StatusInvalid,
                "PSU has already authorised this resource".to_string(),
            );
        }

        ValidationResult::Accept
    }
}
