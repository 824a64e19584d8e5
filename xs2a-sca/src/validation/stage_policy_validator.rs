//! Deployment restrictions on which stages a channel may drive

use super::{AuthorisationValidator, ValidationContext, ValidationResult};
use crate::approach::ScaApproach;
use crate::error::ErrorKind;
use crate::state_machine::ScaStatus;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Statuses from which "update PSU data" is accepted, per approach.
///
/// Approaches without an entry are unrestricted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedStagePolicy {
    #[serde(default)]
    pub restrictions: HashMap<ScaApproach, Vec<ScaStatus>>,
}

impl AllowedStagePolicy {
    /// Restrict `approach` to the given statuses.
    pub fn restrict(mut self, approach: ScaApproach, statuses: Vec<ScaStatus>) -> Self {
        self.restrictions.insert(approach, statuses);
        self
    }

    pub fn allows(&self, approach: ScaApproach, status: ScaStatus) -> bool {
        self.restrictions
            .get(&approach)
            .map_or(true, |allowed| allowed.contains(&status))
    }
}

/// Validator enforcing an [`AllowedStagePolicy`]
pub struct StagePolicyValidator {
    policy: AllowedStagePolicy,
}

impl StagePolicyValidator {
    pub fn new(policy: AllowedStagePolicy) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl AuthorisationValidator for StagePolicyValidator {
    async fn validate(&self, ctx: &ValidationContext<'_>) -> ValidationResult {
        let record = ctx.record;
        if self.policy.allows(record.sca_approach, record.sca_status) {
            ValidationResult::Accept
        } else {
            ValidationResult::Reject(
                ErrorKind::StatusInvalid,
                format!(
                    "{} authorisations cannot be updated in status {}",
                    record.sca_approach, record.sca_status
                ),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::UpdatePsuDataRequest;
    use crate::storage::ResourceKind;
    use crate::validation::tests::fixture;

    #[tokio::test]
    async fn test_restricted_stage_is_rejected() {
        let (resource, mut record) = fixture(ResourceKind::AisConsent);
        let policy = AllowedStagePolicy::default()
            .restrict(ScaApproach::Embedded, vec![ScaStatus::ScaMethodSelected]);
        let validator = StagePolicyValidator::new(policy);
        let request = UpdatePsuDataRequest::default();

        let ctx = ValidationContext {
            request: &request,
            record: &record,
            resource: &resource,
            siblings: &[],
        };
        assert!(matches!(
            validator.validate(&ctx).await,
            ValidationResult::Reject(ErrorKind::StatusInvalid, _)
        ));

        record.sca_status = ScaStatus::ScaMethodSelected;
        let ctx = ValidationContext {
            request: &request,
            record: &record,
            resource: &resource,
            siblings: &[],
        };
        assert_eq!(validator.validate(&ctx).await, ValidationResult::Accept);
        assert!(AllowedStagePolicy::default().allows(ScaApproach::Redirect, ScaStatus::Received));
    }
}
