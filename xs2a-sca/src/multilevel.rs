//! Aggregation of co-signer authorisations on multilevel resources
//!
//! Pure functions: the caller loads all records of a parent and passes their
//! statuses in.

use serde::{Deserialize, Serialize};

use crate::state_machine::ScaStatus;

/// Combined status of all authorisations of one parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateStatus {
    /// Nobody has completed SCA yet
    Received,
    /// Some but not all required co-signers completed SCA
    PartiallyAuthorised,
    Finalised,
    /// Every co-signer completed and at least one was exempted
    Exempted,
    Failed,
}

/// How a multilevel resource treats its co-signers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregationPolicy {
    /// Successful authorisations needed
    pub required_signers: usize,
    /// When false a single failed co-signer fails the resource
    pub partial_authorisation_allowed: bool,
}

pub struct MultilevelAggregator;

impl MultilevelAggregator {
    /// Aggregate the statuses of all authorisations of a multilevel resource.
    pub fn aggregate(statuses: &[ScaStatus], policy: &AggregationPolicy) -> AggregateStatus {
        if statuses.is_empty() {
            return AggregateStatus::Received;
        }

        let failed = statuses.iter().filter(|s| **s == ScaStatus::Failed).count();
        if failed > 0 && !policy.partial_authorisation_allowed {
            return AggregateStatus::Failed;
        }
        if failed == statuses.len() {
            return AggregateStatus::Failed;
        }

        let live = statuses.len() - failed;
        let finalised = statuses
            .iter()
            .filter(|s| **s == ScaStatus::Finalised)
            .count();
        let exempted = statuses
            .iter()
            .filter(|s| **s == ScaStatus::Exempted)
            .count();
        let successful = finalised + exempted;

        if successful == live && successful >= policy.required_signers {
            if exempted > 0 {
                AggregateStatus::Exempted
            } else {
                AggregateStatus::Finalised
            }
        } else if successful > 0 {
            AggregateStatus::PartiallyAuthorised
        } else {
            AggregateStatus::Received
        }
    }

    /// Aggregate for a resource without multilevel SCA: the first successful
    /// authorisation wins, and only all-failed fails the resource.
    pub fn single_level(statuses: &[ScaStatus]) -> AggregateStatus {
        if statuses.contains(&ScaStatus::Finalised) {
            AggregateStatus::Finalised
        } else if statuses.contains(&ScaStatus::Exempted) {
            AggregateStatus::Exempted
        } else if !statuses.is_empty() && statuses.iter().all(|s| *s == ScaStatus::Failed) {
            AggregateStatus::Failed
        } else {
            AggregateStatus::Received
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::ScaStatus::*;

    const STRICT: AggregationPolicy = AggregationPolicy {
        required_signers: 2,
        partial_authorisation_allowed: false,
    };

    #[test]
    fn test_two_signers() {
        assert_eq!(
            MultilevelAggregator::aggregate(&[Received, Received], &STRICT),
            AggregateStatus::Received
        );
        assert_eq!(
            MultilevelAggregator::aggregate(&[Finalised, ScaMethodSelected], &STRICT),
            AggregateStatus::PartiallyAuthorised
        );
        assert_eq!(
            MultilevelAggregator::aggregate(&[Finalised, Finalised], &STRICT),
            AggregateStatus::Finalised
        );
        assert_eq!(
            MultilevelAggregator::aggregate(&[Exempted, Finalised], &STRICT),
            AggregateStatus::Exempted
        );
        assert_eq!(
            MultilevelAggregator::aggregate(&[Finalised, Failed], &STRICT),
            AggregateStatus::Failed
        );
    }

    #[test]
    fn test_one_finalised_is_not_enough_for_two_signers() {
        assert_eq!(
            MultilevelAggregator::aggregate(&[Finalised], &STRICT),
            AggregateStatus::PartiallyAuthorised
        );
    }

    #[test]
    fn test_partial_authorisation_tolerates_failures() {
        let lenient = AggregationPolicy {
            required_signers: 2,
            partial_authorisation_allowed: true,
        };
        assert_eq!(
            MultilevelAggregator::aggregate(&[Finalised, Failed], &lenient),
            AggregateStatus::PartiallyAuthorised
        );
        assert_eq!(
            MultilevelAggregator::aggregate(&[Finalised, Failed, Finalised], &lenient),
            AggregateStatus::Finalised
        );
        assert_eq!(
            MultilevelAggregator::aggregate(&[Failed, Failed], &lenient),
            AggregateStatus::Failed
        );
    }

    #[test]
    fn test_single_level() {
        assert_eq!(
            MultilevelAggregator::single_level(&[Failed, Finalised]),
            AggregateStatus::Finalised
        );
        assert_eq!(
            MultilevelAggregator::single_level(&[Failed, Received]),
            AggregateStatus::Received
        );
        assert_eq!(
            MultilevelAggregator::single_level(&[Failed]),
            AggregateStatus::Failed
        );
        assert_eq!(MultilevelAggregator::single_level(&[]), AggregateStatus::Received);
    }
}
