//! Request validation for "update PSU data"
//!
//! Validators run after the record was loaded and found live, and before any
//! stage handler executes. A rejection here never touches the stored record.
//! The standard chain checks, in order:
//! - PSU identity (submitted PSU matches the record, co-signer rules)
//! - Stage policy (deployment restrictions on which stages a channel may drive)
//! - Payload format (pluggable structural checks)

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::ErrorKind;
use crate::state_machine::UpdatePsuDataRequest;
use crate::storage::{AuthorisationRecord, ParentResource};

pub mod format_validator;
pub mod psu_identity_validator;
pub mod stage_policy_validator;

pub use format_validator::{BasicPayloadFormat, FormatValidator, PayloadFormatValidator};
pub use psu_identity_validator::PsuIdentityValidator;
pub use stage_policy_validator::{AllowedStagePolicy, StagePolicyValidator};

/// Result of request validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    /// Request passed validation
    Accept,
    /// Request failed validation
    Reject(ErrorKind, String),
}

/// What a validator gets to look at.
#[derive(Debug, Clone, Copy)]
pub struct ValidationContext<'a> {
    pub request: &'a UpdatePsuDataRequest,
    pub record: &'a AuthorisationRecord,
    pub resource: &'a ParentResource,
    /// Other authorisations of the same parent (multilevel resources only)
    pub siblings: &'a [AuthorisationRecord],
}

/// Trait for request validators
#[async_trait]
pub trait AuthorisationValidator: Send + Sync {
    /// Returns Accept if the request passes validation,
    /// or Reject with an error kind and reason if it fails.
    async fn validate(&self, ctx: &ValidationContext<'_>) -> ValidationResult;
}

/// Composite validator that runs multiple validators, first rejection wins
pub struct CompositeValidator {
    validators: Vec<Box<dyn AuthorisationValidator>>,
}

impl CompositeValidator {
    /// Create a new composite validator
    pub fn new(validators: Vec<Box<dyn AuthorisationValidator>>) -> Self {
        Self { validators }
    }
}

#[async_trait]
impl AuthorisationValidator for CompositeValidator {
    async fn validate(&self, ctx: &ValidationContext<'_>) -> ValidationResult {
        for validator in &self.validators {
            match validator.validate(ctx).await {
                ValidationResult::Accept => continue,
                reject => return reject,
            }
        }
        ValidationResult::Accept
    }
}

/// Standard validator configuration
#[derive(Clone)]
pub struct StandardValidatorConfig {
    pub allowed_stages: AllowedStagePolicy,
    pub format: Arc<dyn PayloadFormatValidator>,
}

impl Default for StandardValidatorConfig {
    fn default() -> Self {
        Self {
            allowed_stages: AllowedStagePolicy::default(),
            format: Arc::new(BasicPayloadFormat::default()),
        }
    }
}

/// Create the standard validation chain
pub fn create_standard_validator(config: StandardValidatorConfig) -> CompositeValidator {
    let validators: Vec<Box<dyn AuthorisationValidator>> = vec![
        Box::new(PsuIdentityValidator),
        Box::new(StagePolicyValidator::new(config.allowed_stages)),
        Box::new(FormatValidator::new(config.format)),
    ];

    CompositeValidator::new(validators)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::approach::ScaApproach;
    use crate::storage::{PsuIdData, ResourceKind};
    use chrono::{Duration, Utc};

    pub(crate) fn fixture(kind: ResourceKind) -> (ParentResource, AuthorisationRecord) {
        let resource = ParentResource::new("res-1", kind);
        let record = AuthorisationRecord::new(
            &resource,
            Some(PsuIdData::new("alice")),
            ScaApproach::Embedded,
            Duration::minutes(10),
            Duration::hours(1),
            Utc::now(),
        );
        (resource, record)
    }

    struct AlwaysAcceptValidator;

    #[async_trait]
    impl AuthorisationValidator for AlwaysAcceptValidator {
        async fn validate(&self, _ctx: &ValidationContext<'_>) -> ValidationResult {
            ValidationResult::Accept
        }
    }

    struct AlwaysRejectValidator {
        kind: ErrorKind,
    }

    #[async_trait]
    impl AuthorisationValidator for AlwaysRejectValidator {
        async fn validate(&self, _ctx: &ValidationContext<'_>) -> ValidationResult {
            ValidationResult::Reject(self.kind, "Test rejection".to_string())
        }
    }

    #[tokio::test]
    async fn test_composite_validator_first_reject_wins() {
        let validators: Vec<Box<dyn AuthorisationValidator>> = vec![
            Box::new(AlwaysAcceptValidator),
            Box::new(AlwaysRejectValidator {
                kind: ErrorKind::StatusInvalid,
            }),
            Box::new(AlwaysRejectValidator {
                kind: ErrorKind::FormatError,
            }),
        ];
        let composite = CompositeValidator::new(validators);

        let (resource, record) = fixture(ResourceKind::AisConsent);
        let request = UpdatePsuDataRequest::default();
        let ctx = ValidationContext {
            request: &request,
            record: &record,
            resource: &resource,
            siblings: &[],
        };

        assert_eq!(
            composite.validate(&ctx).await,
            ValidationResult::Reject(ErrorKind::StatusInvalid, "Test rejection".to_string())
        );
    }

    #[tokio::test]
    async fn test_standard_validator_accepts_plain_request() {
        let validator = create_standard_validator(StandardValidatorConfig::default());
        let (resource, record) = fixture(ResourceKind::PisPayment);
        let request = UpdatePsuDataRequest::authentication(PsuIdData::new("alice"), "pw");
        let ctx = ValidationContext {
            request: &request,
            record: &record,
            resource: &resource,
            siblings: &[],
        };
        assert_eq!(validator.validate(&ctx).await, ValidationResult::Accept);
    }
}
