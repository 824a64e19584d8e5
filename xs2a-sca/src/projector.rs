//! Projection of authorisation outcomes onto the parent resource status

use crate::multilevel::{AggregateStatus, AggregationPolicy, MultilevelAggregator};
use crate::state_machine::ScaStatus;
use crate::storage::{ConsentStatus, ParentResource, ParentStatus, ResourceKind, TransactionStatus};

pub struct StatusProjector;

impl StatusProjector {
    /// Map an aggregate onto the status vocabulary of the parent kind.
    pub fn project(kind: ResourceKind, aggregate: AggregateStatus) -> ParentStatus {
        if kind.is_consent() {
            ParentStatus::Consent(match aggregate {
                AggregateStatus::Received => ConsentStatus::Received,
                AggregateStatus::PartiallyAuthorised => ConsentStatus::PartiallyAuthorised,
                AggregateStatus::Finalised | AggregateStatus::Exempted => ConsentStatus::Valid,
                AggregateStatus::Failed => ConsentStatus::Rejected,
            })
        } else {
            ParentStatus::Payment(match aggregate {
                AggregateStatus::Received => TransactionStatus::Rcvd,
                AggregateStatus::PartiallyAuthorised => TransactionStatus::Patc,
                AggregateStatus::Finalised | AggregateStatus::Exempted => TransactionStatus::Acsp,
                AggregateStatus::Failed => TransactionStatus::Rjct,
            })
        }
    }

    /// The status `resource` should have given the statuses of all its
    /// authorisations, or `None` if the stored status must stay.
    pub fn derive(resource: &ParentResource, statuses: &[ScaStatus]) -> Option<ParentStatus> {
        if resource.status.is_closed() {
            return None;
        }

        let aggregate = if resource.multilevel_sca_required {
            MultilevelAggregator::aggregate(
                statuses,
                &AggregationPolicy {
                    required_signers: resource.required_signers(),
                    partial_authorisation_allowed: resource.partial_authorisation_allowed,
                },
            )
        } else {
            MultilevelAggregator::single_level(statuses)
        };

        let projected = Self::project(resource.resource_kind, aggregate);
        (projected != resource.status).then_some(projected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::PsuIdData;

    #[test]
    fn test_payment_projection() {
        assert_eq!(
            StatusProjector::project(
                ResourceKind::PisPayment,
                AggregateStatus::PartiallyAuthorised
            ),
            ParentStatus::Payment(TransactionStatus::Patc)
        );
        assert_eq!(
            StatusProjector::project(ResourceKind::PisPayment, AggregateStatus::Exempted),
            ParentStatus::Payment(TransactionStatus::Acsp)
        );
        assert_eq!(
            StatusProjector::project(ResourceKind::PiisConsent, AggregateStatus::Failed),
            ParentStatus::Consent(ConsentStatus::Rejected)
        );
    }

    #[test]
    fn test_derive_skips_unchanged_and_closed() {
        let resource = ParentResource::new("c-1", ResourceKind::AisConsent);
        assert_eq!(StatusProjector::derive(&resource, &[ScaStatus::Received]), None);
        assert_eq!(
            StatusProjector::derive(&resource, &[ScaStatus::Finalised]),
            Some(ParentStatus::Consent(ConsentStatus::Valid))
        );

        let mut revoked = resource.clone();
        revoked.status = ParentStatus::Consent(ConsentStatus::RevokedByPsu);
        assert_eq!(StatusProjector::derive(&revoked, &[ScaStatus::Finalised]), None);
    }

    #[test]
    fn test_derive_multilevel() {
        let resource = ParentResource::new("p-1", ResourceKind::PisPayment)
            .with_co_signers(vec![PsuIdData::new("a"), PsuIdData::new("b")]);
        assert_eq!(
            StatusProjector::derive(&resource, &[ScaStatus::Finalised, ScaStatus::Received]),
            Some(ParentStatus::Payment(TransactionStatus::Patc))
        );
    }
}
