//! Structural validation of the request payload

use super::{AuthorisationValidator, ValidationContext, ValidationResult};
use crate::error::ErrorKind;
use crate::state_machine::UpdatePsuDataRequest;
use async_trait::async_trait;
use std::sync::Arc;

/// Pluggable payload checks. Return `Err(reason)` to reject with `FORMAT_ERROR`.
pub trait PayloadFormatValidator: Send + Sync {
    fn check(&self, request: &UpdatePsuDataRequest) -> Result<(), String>;
}

/// Length and emptiness checks on the text fields.
#[derive(Debug, Clone)]
pub struct BasicPayloadFormat {
    pub max_psu_id_length: usize,
    pub max_credential_length: usize,
    pub max_sca_data_length: usize,
}

impl Default for BasicPayloadFormat {
    fn default() -> Self {
        Self {
            max_psu_id_length: 140,
            max_credential_length: 256,
            max_sca_data_length: 256,
        }
    }
}

fn check_field(name: &str, value: Option<&str>, max: usize) -> Result<(), String> {
    match value {
        Some(v) if v.trim().is_empty() => Err(format!("{} must not be blank", name)),
        Some(v) if v.chars().count() > max => {
            Err(format!("{} exceeds {} characters", name, max))
        }
        _ => Ok(()),
    }
}

impl PayloadFormatValidator for BasicPayloadFormat {
    fn check(&self, request: &UpdatePsuDataRequest) -> Result<(), String> {
        if let Some(psu) = &request.psu {
            check_field("psuId", psu.psu_id.as_deref(), self.max_psu_id_length)?;
            check_field(
                "psuCorporateId",
                psu.psu_corporate_id.as_deref(),
                self.max_psu_id_length,
            )?;
        }
        check_field(
            "password",
            request.password.as_deref(),
            self.max_credential_length,
        )?;
        check_field(
            "authenticationMethodId",
            request.authentication_method_id.as_deref(),
            self.max_credential_length,
        )?;
        check_field(
            "scaAuthenticationData",
            request.sca_authentication_data.as_deref(),
            self.max_sca_data_length,
        )
    }
}

/// Validator delegating to a [`PayloadFormatValidator`]
pub struct FormatValidator {
    format: Arc<dyn PayloadFormatValidator>,
}

impl FormatValidator {
    pub fn new(format: Arc<dyn PayloadFormatValidator>) -> Self {
        Self { format }
    }
}

#[async_trait]
impl AuthorisationValidator for FormatValidator {
    async fn validate(&self, ctx: &ValidationContext<'_>) -> ValidationResult {
        match self.format.check(ctx.request) {
            Ok(()) => ValidationResult::Accept,
            Err(reason) => ValidationResult::Reject(ErrorKind::FormatError, reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_format_checks() {
        let format = BasicPayloadFormat::default();
        assert!(format
            .check(&UpdatePsuDataRequest::confirmation("123456"))
            .is_ok());
        assert!(format.check(&UpdatePsuDataRequest::confirmation("  ")).is_err());
        assert!(format
            .check(&UpdatePsuDataRequest::method_selection("x".repeat(300)))
            .is_err());
    }
}
