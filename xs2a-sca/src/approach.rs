//! SCA approaches and the links that tell the TPP what to do next
//!
//! All approaches share one transition table. They differ only in where the
//! authentication proof comes from, which an [`EvidenceSource`] encapsulates,
//! and in the next link handed back to the TPP.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use url::Url;

use crate::error::{Error, Result};
use crate::state_machine::{ScaStatus, UpdatePsuDataRequest};
use crate::storage::{AuthorisationRecord, ResourceKind};

/// Characters left unescaped in path segments.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// How the PSU performs SCA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ScaApproach {
    /// The TPP collects credentials and OTPs and forwards them.
    Embedded,
    /// The PSU authenticates on the bank's own pages.
    Redirect,
    /// The PSU confirms on a separate device, the TPP polls.
    Decoupled,
}

impl fmt::Display for ScaApproach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScaApproach::Embedded => write!(f, "EMBEDDED"),
            ScaApproach::Redirect => write!(f, "REDIRECT"),
            ScaApproach::Decoupled => write!(f, "DECOUPLED"),
        }
    }
}

impl FromStr for ScaApproach {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "EMBEDDED" => Ok(ScaApproach::Embedded),
            "REDIRECT" => Ok(ScaApproach::Redirect),
            "DECOUPLED" => Ok(ScaApproach::Decoupled),
            _ => Err(format!("Invalid SCA approach: {}", s)),
        }
    }
}

/// Result the bank reports out-of-band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BankOutcome {
    Confirmed,
    Rejected,
}

/// Proof submitted for the current stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evidence {
    /// First-factor credential, checked by the backend
    Credential(String),
    /// OTP or confirmation code
    ScaCode(String),
    /// Bank-side result, already decided
    BankOutcome(BankOutcome),
}

/// Where an approach takes its authentication proof from.
pub trait EvidenceSource: Send + Sync + fmt::Debug {
    fn approach(&self) -> ScaApproach;

    /// Proof for the authentication stage.
    fn authentication_evidence(&self, request: &UpdatePsuDataRequest) -> Option<Evidence>;

    /// Proof for the confirmation stage of `record`.
    fn confirmation_evidence(
        &self,
        record: &AuthorisationRecord,
        request: &UpdatePsuDataRequest,
    ) -> Option<Evidence>;
}

fn password(request: &UpdatePsuDataRequest) -> Option<Evidence> {
    request
        .password
        .as_ref()
        .filter(|p| !p.is_empty())
        .map(|p| Evidence::Credential(p.clone()))
}

fn sca_code(request: &UpdatePsuDataRequest) -> Option<Evidence> {
    request
        .sca_authentication_data
        .as_ref()
        .filter(|c| !c.is_empty())
        .map(|c| Evidence::ScaCode(c.clone()))
}

fn bank_outcome(request: &UpdatePsuDataRequest) -> Option<Evidence> {
    request.bank_outcome.map(Evidence::BankOutcome)
}

/// Embedded: the TPP forwards credential and OTP.
#[derive(Debug, Default)]
pub struct EmbeddedEvidence;

impl EvidenceSource for EmbeddedEvidence {
    fn approach(&self) -> ScaApproach {
        ScaApproach::Embedded
    }

    fn authentication_evidence(&self, request: &UpdatePsuDataRequest) -> Option<Evidence> {
        password(request)
    }

    fn confirmation_evidence(
        &self,
        record: &AuthorisationRecord,
        request: &UpdatePsuDataRequest,
    ) -> Option<Evidence> {
        // Only a decoupled method reports back via the bank, OTP methods need the code
        match &record.chosen_sca_method {
            Some(method) if method.decoupled => bank_outcome(request),
            _ => sca_code(request),
        }
    }
}

/// Redirect: the bank authenticates the PSU and calls back with the result.
#[derive(Debug, Default)]
pub struct RedirectEvidence;

impl EvidenceSource for RedirectEvidence {
    fn approach(&self) -> ScaApproach {
        ScaApproach::Redirect
    }

    fn authentication_evidence(&self, request: &UpdatePsuDataRequest) -> Option<Evidence> {
        bank_outcome(request)
    }

    fn confirmation_evidence(
        &self,
        _record: &AuthorisationRecord,
        request: &UpdatePsuDataRequest,
    ) -> Option<Evidence> {
        sca_code(request).or_else(|| bank_outcome(request))
    }
}

/// Decoupled: credential via the TPP, confirmation on the PSU's device.
#[derive(Debug, Default)]
pub struct DecoupledEvidence;

impl EvidenceSource for DecoupledEvidence {
    fn approach(&self) -> ScaApproach {
        ScaApproach::Decoupled
    }

    fn authentication_evidence(&self, request: &UpdatePsuDataRequest) -> Option<Evidence> {
        password(request).or_else(|| bank_outcome(request))
    }

    fn confirmation_evidence(
        &self,
        _record: &AuthorisationRecord,
        request: &UpdatePsuDataRequest,
    ) -> Option<Evidence> {
        bank_outcome(request)
    }
}

/// The evidence source for an approach.
pub fn evidence_source(approach: ScaApproach) -> &'static dyn EvidenceSource {
    match approach {
        ScaApproach::Embedded => &EmbeddedEvidence,
        ScaApproach::Redirect => &RedirectEvidence,
        ScaApproach::Decoupled => &DecoupledEvidence,
    }
}

/// Picks the approach of a new authorisation from the TPP preference and
/// what the bank supports.
#[derive(Debug, Clone)]
pub struct ScaApproachResolver {
    supported: Vec<ScaApproach>,
    default: ScaApproach,
}

impl ScaApproachResolver {
    pub fn new(supported: Vec<ScaApproach>, default: ScaApproach) -> Self {
        Self { supported, default }
    }

    /// The preferred approach if supported, otherwise the bank default.
    pub fn resolve(&self, preferred: Option<ScaApproach>) -> ScaApproach {
        preferred
            .filter(|p| self.supported.contains(p))
            .unwrap_or(self.default)
    }
}

/// Relation name of a next link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LinkRelation {
    ScaRedirect,
    ScaStatus,
    UpdatePsuIdentification,
    UpdatePsuAuthentication,
    SelectAuthenticationMethod,
    AuthoriseTransaction,
}

/// Hypermedia link telling the TPP the next step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextLink {
    pub rel: LinkRelation,
    pub href: String,
}

/// Builds next links for authorisation records.
#[derive(Debug, Clone)]
pub struct LinkBuilder {
    api_base: Url,
    redirect_base: Url,
}

impl LinkBuilder {
    pub fn new(api_base_url: &str, redirect_base_url: &str) -> Result<Self> {
        let api_base = Url::parse(api_base_url)
            .map_err(|e| Error::Configuration(format!("api base url {}: {}", api_base_url, e)))?;
        let redirect_base = Url::parse(redirect_base_url).map_err(|e| {
            Error::Configuration(format!("redirect base url {}: {}", redirect_base_url, e))
        })?;
        Ok(Self {
            api_base,
            redirect_base,
        })
    }

    fn encode(segment: &str) -> String {
        utf8_percent_encode(segment, PATH_SEGMENT).to_string()
    }

    /// Path of the authorisation sub-resource.
    pub fn authorisation_path(&self, record: &AuthorisationRecord) -> String {
        let parent = Self::encode(&record.parent_id);
        let authorisation = Self::encode(&record.authorisation_id);
        match record.resource_kind {
            ResourceKind::AisConsent => {
                format!("/v1/consents/{}/authorisations/{}", parent, authorisation)
            }
            ResourceKind::PisPayment => {
                format!("/v1/payments/{}/authorisations/{}", parent, authorisation)
            }
            ResourceKind::PiisConsent => format!(
                "/v2/consents/confirmation-of-funds/{}/authorisations/{}",
                parent, authorisation
            ),
        }
    }

    fn api_link(&self, rel: LinkRelation, record: &AuthorisationRecord) -> NextLink {
        NextLink {
            rel,
            href: format!(
                "{}{}",
                self.api_base.as_str().trim_end_matches('/'),
                self.authorisation_path(record)
            ),
        }
    }

    fn redirect_link(&self, record: &AuthorisationRecord) -> NextLink {
        NextLink {
            rel: LinkRelation::ScaRedirect,
            href: format!(
                "{}/{}",
                self.redirect_base.as_str().trim_end_matches('/'),
                Self::encode(&record.authorisation_id)
            ),
        }
    }

    /// The next step for the TPP given the record's approach and status.
    pub fn next_link(&self, record: &AuthorisationRecord) -> NextLink {
        let decoupled_method = record
            .chosen_sca_method
            .as_ref()
            .map_or(false, |m| m.decoupled);

        if record.sca_status.is_terminal() {
            return self.api_link(LinkRelation::ScaStatus, record);
        }

        match (record.sca_approach, record.sca_status) {
            (ScaApproach::Redirect, ScaStatus::Received | ScaStatus::PsuIdentified) => {
                self.redirect_link(record)
            }
            (ScaApproach::Redirect, _) => self.api_link(LinkRelation::ScaStatus, record),
            (_, ScaStatus::Received) if record.psu.is_none() => {
                self.api_link(LinkRelation::UpdatePsuIdentification, record)
            }
            (_, ScaStatus::Received | ScaStatus::PsuIdentified) => {
                self.api_link(LinkRelation::UpdatePsuAuthentication, record)
            }
            (_, ScaStatus::PsuAuthenticated) => {
                self.api_link(LinkRelation::SelectAuthenticationMethod, record)
            }
            (ScaApproach::Decoupled, ScaStatus::ScaMethodSelected) => {
                self.api_link(LinkRelation::ScaStatus, record)
            }
            (_, ScaStatus::ScaMethodSelected) if decoupled_method => {
                self.api_link(LinkRelation::ScaStatus, record)
            }
            _ => self.api_link(LinkRelation::AuthoriseTransaction, record),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{AuthenticationMethod, ParentResource, PsuIdData};
    use chrono::{Duration, Utc};

    fn record(kind: ResourceKind, approach: ScaApproach) -> AuthorisationRecord {
        let parent = ParentResource::new("res 1/x", kind);
        AuthorisationRecord::new(
            &parent,
            Some(PsuIdData::new("alice")),
            approach,
            Duration::minutes(10),
            Duration::hours(1),
            Utc::now(),
        )
    }

    fn links() -> LinkBuilder {
        LinkBuilder::new("https://api.bank.test/", "https://login.bank.test/sca").unwrap()
    }

    #[test]
    fn test_resolver_falls_back_to_default() {
        let resolver = ScaApproachResolver::new(
            vec![ScaApproach::Redirect, ScaApproach::Embedded],
            ScaApproach::Redirect,
        );
        assert_eq!(resolver.resolve(Some(ScaApproach::Embedded)), ScaApproach::Embedded);
        assert_eq!(resolver.resolve(Some(ScaApproach::Decoupled)), ScaApproach::Redirect);
        assert_eq!(resolver.resolve(None), ScaApproach::Redirect);
    }

    #[test]
    fn test_paths_are_percent_encoded() {
        let rec = record(ResourceKind::AisConsent, ScaApproach::Embedded);
        let path = links().authorisation_path(&rec);
        assert!(path.starts_with("/v1/consents/res%201%2Fx/authorisations/"));
        assert!(path.ends_with(&rec.authorisation_id));
    }

    #[test]
    fn test_embedded_links_follow_status() {
        let links = links();
        let mut rec = record(ResourceKind::PisPayment, ScaApproach::Embedded);
        assert_eq!(links.next_link(&rec).rel, LinkRelation::UpdatePsuAuthentication);

        rec.sca_status = ScaStatus::PsuAuthenticated;
        assert_eq!(links.next_link(&rec).rel, LinkRelation::SelectAuthenticationMethod);

        rec.sca_status = ScaStatus::ScaMethodSelected;
        assert_eq!(links.next_link(&rec).rel, LinkRelation::AuthoriseTransaction);

        rec.chosen_sca_method = Some(AuthenticationMethod::new("app", "PUSH_OTP").decoupled());
        assert_eq!(links.next_link(&rec).rel, LinkRelation::ScaStatus);

        rec.sca_status = ScaStatus::Finalised;
        let link = links.next_link(&rec);
        assert_eq!(link.rel, LinkRelation::ScaStatus);
        assert!(link.href.starts_with("https://api.bank.test/v1/payments/"));
    }

    #[test]
    fn test_redirect_link_points_to_bank() {
        let rec = record(ResourceKind::PiisConsent, ScaApproach::Redirect);
        let link = links().next_link(&rec);
        assert_eq!(link.rel, LinkRelation::ScaRedirect);
        assert_eq!(
            link.href,
            format!("https://login.bank.test/sca/{}", rec.authorisation_id)
        );
    }

    #[test]
    fn test_evidence_sources() {
        let request = UpdatePsuDataRequest {
            password: Some("secret".to_string()),
            bank_outcome: Some(BankOutcome::Confirmed),
            ..Default::default()
        };
        assert_eq!(
            evidence_source(ScaApproach::Embedded).authentication_evidence(&request),
            Some(Evidence::Credential("secret".to_string()))
        );
        assert_eq!(
            evidence_source(ScaApproach::Redirect).authentication_evidence(&request),
            Some(Evidence::BankOutcome(BankOutcome::Confirmed))
        );
        let rec = record(ResourceKind::AisConsent, ScaApproach::Decoupled);
        assert_eq!(
            evidence_source(ScaApproach::Decoupled).confirmation_evidence(&rec, &request),
            Some(Evidence::BankOutcome(BankOutcome::Confirmed))
        );
        assert!(LinkBuilder::new("not a url", "https://x.test").is_err());
    }

    #[test]
    fn test_embedded_bank_outcome_needs_decoupled_method() {
        let request = UpdatePsuDataRequest {
            bank_outcome: Some(BankOutcome::Confirmed),
            ..Default::default()
        };
        let embedded = evidence_source(ScaApproach::Embedded);

        let mut rec = record(ResourceKind::AisConsent, ScaApproach::Embedded);
        rec.chosen_sca_method = Some(AuthenticationMethod::new("sms", "SMS_OTP"));
        assert_eq!(embedded.confirmation_evidence(&rec, &request), None);

        rec.chosen_sca_method = Some(AuthenticationMethod::new("app", "PUSH_OTP").decoupled());
        assert_eq!(
            embedded.confirmation_evidence(&rec, &request),
            Some(Evidence::BankOutcome(BankOutcome::Confirmed))
        );
    }
}
