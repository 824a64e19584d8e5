use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::approach::ScaApproach;
use crate::state_machine::ScaStatus;

/// Kind of the parent resource an authorisation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Account information consent
    AisConsent,
    /// Payment initiation
    PisPayment,
    /// Confirmation of funds consent
    PiisConsent,
}

impl ResourceKind {
    /// Whether the parent carries a consent status (as opposed to a transaction status).
    pub fn is_consent(&self) -> bool {
        matches!(self, ResourceKind::AisConsent | ResourceKind::PiisConsent)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::AisConsent => write!(f, "ais_consent"),
            ResourceKind::PisPayment => write!(f, "pis_payment"),
            ResourceKind::PiisConsent => write!(f, "piis_consent"),
        }
    }
}

impl TryFrom<&str> for ResourceKind {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "ais_consent" => Ok(ResourceKind::AisConsent),
            "pis_payment" => Ok(ResourceKind::PisPayment),
            "piis_consent" => Ok(ResourceKind::PiisConsent),
            _ => Err(format!("Invalid resource kind: {}", value)),
        }
    }
}

/// Consent status as exposed on the consent resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConsentStatus {
    Received,
    PartiallyAuthorised,
    Valid,
    Rejected,
    RevokedByPsu,
    Expired,
    TerminatedByTpp,
}

impl fmt::Display for ConsentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsentStatus::Received => write!(f, "received"),
            ConsentStatus::PartiallyAuthorised => write!(f, "partiallyAuthorised"),
            ConsentStatus::Valid => write!(f, "valid"),
            ConsentStatus::Rejected => write!(f, "rejected"),
            ConsentStatus::RevokedByPsu => write!(f, "revokedByPsu"),
            ConsentStatus::Expired => write!(f, "expired"),
            ConsentStatus::TerminatedByTpp => write!(f, "terminatedByTpp"),
        }
    }
}

impl TryFrom<&str> for ConsentStatus {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "received" => Ok(ConsentStatus::Received),
            "partiallyAuthorised" => Ok(ConsentStatus::PartiallyAuthorised),
            "valid" => Ok(ConsentStatus::Valid),
            "rejected" => Ok(ConsentStatus::Rejected),
            "revokedByPsu" => Ok(ConsentStatus::RevokedByPsu),
            "expired" => Ok(ConsentStatus::Expired),
            "terminatedByTpp" => Ok(ConsentStatus::TerminatedByTpp),
            _ => Err(format!("Invalid consent status: {}", value)),
        }
    }
}

/// ISO 20022 transaction status of a payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionStatus {
    /// Received
    Rcvd,
    /// Partially accepted technical correct (multilevel SCA pending)
    Patc,
    /// Accepted technical validation
    Actc,
    /// Accepted settlement in process
    Acsp,
    /// Accepted settlement completed
    Acsc,
    /// Rejected
    Rjct,
    /// Cancelled
    Canc,
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionStatus::Rcvd => write!(f, "RCVD"),
            TransactionStatus::Patc => write!(f, "PATC"),
            TransactionStatus::Actc => write!(f, "ACTC"),
            TransactionStatus::Acsp => write!(f, "ACSP"),
            TransactionStatus::Acsc => write!(f, "ACSC"),
            TransactionStatus::Rjct => write!(f, "RJCT"),
            TransactionStatus::Canc => write!(f, "CANC"),
        }
    }
}

impl TryFrom<&str> for TransactionStatus {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "RCVD" => Ok(TransactionStatus::Rcvd),
            "PATC" => Ok(TransactionStatus::Patc),
            "ACTC" => Ok(TransactionStatus::Actc),
            "ACSP" => Ok(TransactionStatus::Acsp),
            "ACSC" => Ok(TransactionStatus::Acsc),
            "RJCT" => Ok(TransactionStatus::Rjct),
            "CANC" => Ok(TransactionStatus::Canc),
            _ => Err(format!("Invalid transaction status: {}", value)),
        }
    }
}

/// Status of a parent resource, either a consent or a payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParentStatus {
    Consent(ConsentStatus),
    Payment(TransactionStatus),
}

impl ParentStatus {
    /// Initial status of a freshly created resource of the given kind.
    pub fn initial(kind: ResourceKind) -> Self {
        if kind.is_consent() {
            ParentStatus::Consent(ConsentStatus::Received)
        } else {
            ParentStatus::Payment(TransactionStatus::Rcvd)
        }
    }

    /// Whether new authorisations may still be started against the resource.
    pub fn accepts_authorisation(&self) -> bool {
        matches!(
            self,
            ParentStatus::Consent(ConsentStatus::Received)
                | ParentStatus::Consent(ConsentStatus::PartiallyAuthorised)
                | ParentStatus::Payment(TransactionStatus::Rcvd)
                | ParentStatus::Payment(TransactionStatus::Patc)
        )
    }

    /// Statuses set outside of SCA (revocation, expiry, settlement) that the
    /// projection never overwrites.
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            ParentStatus::Consent(ConsentStatus::RevokedByPsu)
                | ParentStatus::Consent(ConsentStatus::Expired)
                | ParentStatus::Consent(ConsentStatus::TerminatedByTpp)
                | ParentStatus::Payment(TransactionStatus::Acsc)
                | ParentStatus::Payment(TransactionStatus::Canc)
        )
    }

    /// Parse a stored status string for a resource of the given kind.
    pub fn parse(kind: ResourceKind, value: &str) -> Result<Self, String> {
        if kind.is_consent() {
            ConsentStatus::try_from(value).map(ParentStatus::Consent)
        } else {
            TransactionStatus::try_from(value).map(ParentStatus::Payment)
        }
    }
}

impl fmt::Display for ParentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParentStatus::Consent(status) => write!(f, "{}", status),
            ParentStatus::Payment(status) => write!(f, "{}", status),
        }
    }
}

/// PSU identification data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PsuIdData {
    pub psu_id: Option<String>,
    pub psu_id_type: Option<String>,
    pub psu_corporate_id: Option<String>,
    pub psu_corporate_id_type: Option<String>,
    /// Informational only, never part of identity comparison
    pub psu_ip_address: Option<String>,
}

impl PsuIdData {
    pub fn new(psu_id: impl Into<String>) -> Self {
        Self {
            psu_id: Some(psu_id.into()),
            ..Default::default()
        }
    }

    /// True when neither a PSU id nor a corporate id is present.
    pub fn is_empty(&self) -> bool {
        self.psu_id.as_deref().map_or(true, str::is_empty)
            && self.psu_corporate_id.as_deref().map_or(true, str::is_empty)
    }

    /// Identity comparison on the identifying fields.
    pub fn matches(&self, other: &PsuIdData) -> bool {
        self.psu_id == other.psu_id
            && self.psu_id_type == other.psu_id_type
            && self.psu_corporate_id == other.psu_corporate_id
            && self.psu_corporate_id_type == other.psu_corporate_id_type
    }
}

/// An SCA method the bank offers to the PSU.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationMethod {
    pub authentication_method_id: String,
    /// e.g. `SMS_OTP`, `PUSH_OTP`, `CHIP_OTP`
    pub authentication_type: String,
    pub name: Option<String>,
    /// The PSU confirms out-of-band on a separate device
    #[serde(default)]
    pub decoupled: bool,
}

impl AuthenticationMethod {
    pub fn new(id: impl Into<String>, authentication_type: impl Into<String>) -> Self {
        Self {
            authentication_method_id: id.into(),
            authentication_type: authentication_type.into(),
            name: None,
            decoupled: false,
        }
    }

    pub fn decoupled(mut self) -> Self {
        self.decoupled = true;
        self
    }
}

/// Challenge presented to the PSU after an SCA method was selected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeData {
    pub otp_format: Option<String>,
    pub otp_max_length: Option<u32>,
    pub image: Option<String>,
    pub additional_information: Option<String>,
}

/// A consent or payment whose authorisation is driven by SCA.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentResource {
    pub resource_id: String,
    pub resource_kind: ResourceKind,
    pub status: ParentStatus,
    pub multilevel_sca_required: bool,
    /// Authentication alone authorises the resource, no second factor
    pub one_factor_authorisation: bool,
    /// A failed co-signer does not fail the whole resource
    pub partial_authorisation_allowed: bool,
    /// Co-signers expected to authorise a multilevel resource
    pub psus: Vec<PsuIdData>,
    pub created_at: DateTime<Utc>,
}

impl ParentResource {
    pub fn new(resource_id: impl Into<String>, resource_kind: ResourceKind) -> Self {
        Self {
            resource_id: resource_id.into(),
            resource_kind,
            status: ParentStatus::initial(resource_kind),
            multilevel_sca_required: false,
            one_factor_authorisation: false,
            partial_authorisation_allowed: false,
            psus: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Turn this into a multilevel resource signed by the given PSUs.
    pub fn with_co_signers(mut self, psus: Vec<PsuIdData>) -> Self {
        self.multilevel_sca_required = true;
        self.psus = psus;
        self
    }

    /// Number of successful authorisations a multilevel resource needs.
    pub fn required_signers(&self) -> usize {
        self.psus.len().max(1)
    }
}

/// One SCA attempt of one PSU against one parent resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorisationRecord {
    pub authorisation_id: String,
    pub parent_id: String,
    pub resource_kind: ResourceKind,
    pub psu: Option<PsuIdData>,
    pub sca_status: ScaStatus,
    pub sca_approach: ScaApproach,
    pub chosen_sca_method: Option<AuthenticationMethod>,
    pub available_sca_methods: Vec<AuthenticationMethod>,
    pub challenge_data: Option<ChallengeData>,
    /// base64 SHA-256 of a confirmation code the bank handed over for local checking
    pub confirmation_code_hash: Option<String>,
    /// Opaque backend correlation data
    pub aspsp_data: Option<Vec<u8>>,
    pub failed_attempts: u32,
    pub redirect_url_expiration: DateTime<Utc>,
    pub authorisation_expiration: DateTime<Utc>,
    /// Bumped by every successful save
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AuthorisationRecord {
    /// Create a new `RECEIVED` record with a generated id.
    pub fn new(
        parent: &ParentResource,
        psu: Option<PsuIdData>,
        sca_approach: ScaApproach,
        redirect_url_ttl: Duration,
        authorisation_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            authorisation_id: uuid::Uuid::new_v4().to_string(),
            parent_id: parent.resource_id.clone(),
            resource_kind: parent.resource_kind,
            psu: psu.filter(|p| !p.is_empty()),
            sca_status: ScaStatus::Received,
            sca_approach,
            chosen_sca_method: None,
            available_sca_methods: Vec::new(),
            challenge_data: None,
            confirmation_code_hash: None,
            aspsp_data: None,
            failed_attempts: 0,
            redirect_url_expiration: now + redirect_url_ttl,
            authorisation_expiration: now + authorisation_ttl,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// A record is expired once either deadline has passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.redirect_url_expiration || now > self.authorisation_expiration
    }

    /// Record the chosen SCA method. A method can only be chosen once.
    pub fn choose_method(&mut self, method: AuthenticationMethod) -> Result<(), String> {
        if let Some(existing) = &self.chosen_sca_method {
            return Err(format!(
                "SCA method {} already chosen",
                existing.authentication_method_id
            ));
        }
        self.chosen_sca_method = Some(method);
        Ok(())
    }

    /// Look up an offered method by id.
    pub fn offered_method(&self, method_id: &str) -> Option<&AuthenticationMethod> {
        self.available_sca_methods
            .iter()
            .find(|m| m.authentication_method_id == method_id)
    }

    /// Whether this record counts as a successful authorisation.
    pub fn is_successful(&self) -> bool {
        matches!(self.sca_status, ScaStatus::Finalised | ScaStatus::Exempted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_psu_matching_ignores_ip() {
        let mut a = PsuIdData::new("alice");
        a.psu_ip_address = Some("10.0.0.1".to_string());
        let b = PsuIdData::new("alice");
        assert!(a.matches(&b));
        assert!(!a.matches(&PsuIdData::new("bob")));
        assert!(PsuIdData::default().is_empty());
        assert!(PsuIdData::new("").is_empty());
    }

    #[test]
    fn test_parent_status_parsing() {
        assert_eq!(
            ParentStatus::parse(ResourceKind::PisPayment, "PATC").unwrap(),
            ParentStatus::Payment(TransactionStatus::Patc)
        );
        assert_eq!(
            ParentStatus::parse(ResourceKind::AisConsent, "partiallyAuthorised").unwrap(),
            ParentStatus::Consent(ConsentStatus::PartiallyAuthorised)
        );
        assert!(ParentStatus::parse(ResourceKind::PiisConsent, "ACSP").is_err());
        assert!(ParentStatus::Payment(TransactionStatus::Canc).is_closed());
        assert!(!ParentStatus::Consent(ConsentStatus::Valid).accepts_authorisation());
    }

    #[test]
    fn test_record_expiry_and_method_choice() {
        let now = Utc::now();
        let parent = ParentResource::new("consent-1", ResourceKind::AisConsent);
        let mut record = AuthorisationRecord::new(
            &parent,
            Some(PsuIdData::new("alice")),
            ScaApproach::Embedded,
            Duration::seconds(60),
            Duration::seconds(3600),
            now,
        );

        assert_eq!(record.sca_status, ScaStatus::Received);
        assert!(!record.is_expired(now));
        assert!(record.is_expired(now + Duration::seconds(61)));

        record
            .choose_method(AuthenticationMethod::new("sms", "SMS_OTP"))
            .unwrap();
        assert!(record
            .choose_method(AuthenticationMethod::new("push", "PUSH_OTP"))
            .is_err());
    }
}
