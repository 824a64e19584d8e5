//! The bank-side authentication backend
//!
//! Every call the state machine makes into the bank goes through
//! [`BackendCaller`], which enforces the configured timeout. A timeout is
//! reported as [`BackendError::Timeout`] and handled like an unavailable
//! backend.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::storage::{AuthenticationMethod, ChallengeData, ParentResource, PsuIdData};

/// Result of checking a credential or an SCA code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthenticationOutcome {
    Success,
    /// PSU authenticated and the bank waives further SCA
    Exempted,
    /// Wrong input, the PSU may try again
    AttemptFailure,
    /// Definitive rejection
    Failure,
}

/// Result of requesting an authorisation code for a chosen method.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorisationCodeResult {
    pub challenge_data: Option<ChallengeData>,
    /// The bank decided no SCA is needed for this operation
    pub sca_exempted: bool,
    /// Code the bank lets us check locally instead of calling `confirm`
    pub confirmation_code: Option<String>,
    /// Replacement correlation data
    pub aspsp_data: Option<Vec<u8>>,
}

/// Data every backend call carries.
#[derive(Debug, Clone, Copy)]
pub struct BackendRequest<'a> {
    pub psu: &'a PsuIdData,
    pub resource: &'a ParentResource,
    pub aspsp_data: Option<&'a [u8]>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Backend call {operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("Backend rejected request: {0}")]
    Rejected(String),
}

/// The bank's authentication and execution API.
#[async_trait]
pub trait PsuAuthenticationBackend: Send + Sync + Debug {
    /// Check the PSU's first-factor credential.
    async fn authenticate(
        &self,
        request: BackendRequest<'_>,
        credential: &str,
    ) -> Result<AuthenticationOutcome, BackendError>;

    /// SCA methods available to the PSU for this resource.
    async fn list_sca_methods(
        &self,
        request: BackendRequest<'_>,
    ) -> Result<Vec<AuthenticationMethod>, BackendError>;

    /// Issue a challenge over the chosen method.
    async fn request_authorisation_code(
        &self,
        request: BackendRequest<'_>,
        method: &AuthenticationMethod,
    ) -> Result<AuthorisationCodeResult, BackendError>;

    /// Verify the SCA code the PSU entered.
    async fn confirm(
        &self,
        request: BackendRequest<'_>,
        code: &str,
        challenge: Option<&ChallengeData>,
    ) -> Result<AuthenticationOutcome, BackendError>;

    /// Execute the consent or payment once SCA is done.
    async fn execute_underlying_operation(
        &self,
        request: BackendRequest<'_>,
    ) -> Result<(), BackendError>;
}

/// Backend handle with timeout enforcement.
#[derive(Debug, Clone)]
pub struct BackendCaller {
    backend: Arc<dyn PsuAuthenticationBackend>,
    timeout: Duration,
}

impl BackendCaller {
    pub fn new(backend: Arc<dyn PsuAuthenticationBackend>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    pub fn backend(&self) -> &dyn PsuAuthenticationBackend {
        self.backend.as_ref()
    }

    /// Run a backend future under the configured timeout.
    pub async fn call<T, F>(&self, operation: &'static str, fut: F) -> Result<T, BackendError>
    where
        F: Future<Output = Result<T, BackendError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Backend call {} timed out after {:?}", operation, self.timeout);
                Err(BackendError::Timeout {
                    operation,
                    timeout: self.timeout,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_call_times_out() {
        let caller = BackendCaller::new(
            Arc::new(crate::test_utils::MockBackend::new()),
            Duration::from_millis(20),
        );

        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, BackendError>(())
        };
        assert_matches!(
            caller.call("slow", slow).await,
            Err(BackendError::Timeout { operation: "slow", .. })
        );

        let fast = async { Ok::<_, BackendError>(7) };
        assert_eq!(caller.call("fast", fast).await.unwrap(), 7);
    }
}
