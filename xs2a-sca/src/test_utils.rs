//! Test utilities for the SCA node
//!
//! [`MockBackend`] is a scriptable [`PsuAuthenticationBackend`]: by default
//! it accepts the password `secret` for any PSU, offers a single SMS method
//! and accepts the OTP `123456`.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::backend::{
    AuthenticationOutcome, AuthorisationCodeResult, BackendError, BackendRequest,
    PsuAuthenticationBackend,
};
use crate::storage::{AuthenticationMethod, ChallengeData};

/// Scriptable backend for tests
#[derive(Debug)]
pub struct MockBackend {
    password: String,
    otp: String,
    methods: Vec<AuthenticationMethod>,
    /// Wrong input is a definitive failure instead of an attempt failure
    hard_failures: bool,
    exempt_on_authentication: bool,
    exempt_on_code_request: bool,
    exempt_on_confirmation: bool,
    local_confirmation_code: Option<String>,
    delay: Option<Duration>,
    unavailable: bool,
    execution_fails: bool,
    authentications: AtomicUsize,
    confirmations: AtomicUsize,
    executions: AtomicUsize,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            password: "secret".to_string(),
            otp: "123456".to_string(),
            methods: vec![AuthenticationMethod::new("sms", "SMS_OTP")],
            hard_failures: false,
            exempt_on_authentication: false,
            exempt_on_code_request: false,
            exempt_on_confirmation: false,
            local_confirmation_code: None,
            delay: None,
            unavailable: false,
            execution_fails: false,
            authentications: AtomicUsize::new(0),
            confirmations: AtomicUsize::new(0),
            executions: AtomicUsize::new(0),
        }
    }

    pub fn with_methods(mut self, methods: Vec<AuthenticationMethod>) -> Self {
        self.methods = methods;
        self
    }

    pub fn with_otp(mut self, otp: impl Into<String>) -> Self {
        self.otp = otp.into();
        self
    }

    pub fn hard_failures(mut self) -> Self {
        self.hard_failures = true;
        self
    }

    pub fn exempt_on_authentication(mut self) -> Self {
        self.exempt_on_authentication = true;
        self
    }

    pub fn exempt_on_code_request(mut self) -> Self {
        self.exempt_on_code_request = true;
        self
    }

    pub fn exempt_on_confirmation(mut self) -> Self {
        self.exempt_on_confirmation = true;
        self
    }

    /// Hand the confirmation code over for local checking.
    pub fn with_local_confirmation_code(mut self, code: impl Into<String>) -> Self {
        self.local_confirmation_code = Some(code.into());
        self
    }

    /// Delay every call, to exercise timeouts.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    pub fn failing_execution(mut self) -> Self {
        self.execution_fails = true;
        self
    }

    pub fn authentications(&self) -> usize {
        self.authentications.load(Ordering::SeqCst)
    }

    pub fn confirmations(&self) -> usize {
        self.confirmations.load(Ordering::SeqCst)
    }

    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    async fn before_call(&self) -> Result<(), BackendError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.unavailable {
            return Err(BackendError::Unavailable("mock backend down".to_string()));
        }
        Ok(())
    }

    fn wrong_input(&self) -> AuthenticationOutcome {
        if self.hard_failures {
            AuthenticationOutcome::Failure
        } else {
            AuthenticationOutcome::AttemptFailure
        }
    }
}

#[async_trait]
impl PsuAuthenticationBackend for MockBackend {
    async fn authenticate(
        &self,
        _request: BackendRequest<'_>,
        credential: &str,
    ) -> Result<AuthenticationOutcome, BackendError> {
        self.before_call().await?;
        self.authentications.fetch_add(1, Ordering::SeqCst);
        if credential != self.password {
            return Ok(self.wrong_input());
        }
        if self.exempt_on_authentication {
            Ok(AuthenticationOutcome::Exempted)
        } else {
            Ok(AuthenticationOutcome::Success)
        }
    }

    async fn list_sca_methods(
        &self,
        _request: BackendRequest<'_>,
    ) -> Result<Vec<AuthenticationMethod>, BackendError> {
        self.before_call().await?;
        Ok(self.methods.clone())
    }

    async fn request_authorisation_code(
        &self,
        _request: BackendRequest<'_>,
        method: &AuthenticationMethod,
    ) -> Result<AuthorisationCodeResult, BackendError> {
        self.before_call().await?;
        Ok(AuthorisationCodeResult {
            challenge_data: Some(ChallengeData {
                otp_format: Some("characters".to_string()),
                otp_max_length: Some(self.otp.len() as u32),
                image: None,
                additional_information: Some(format!(
                    "code sent via {}",
                    method.authentication_type
                )),
            }),
            sca_exempted: self.exempt_on_code_request,
            confirmation_code: self.local_confirmation_code.clone(),
            aspsp_data: Some(method.authentication_method_id.as_bytes().to_vec()),
        })
    }

    async fn confirm(
        &self,
        _request: BackendRequest<'_>,
        code: &str,
        _challenge: Option<&ChallengeData>,
    ) -> Result<AuthenticationOutcome, BackendError> {
        self.before_call().await?;
        self.confirmations.fetch_add(1, Ordering::SeqCst);
        if code != self.otp {
            return Ok(self.wrong_input());
        }
        if self.exempt_on_confirmation {
            Ok(AuthenticationOutcome::Exempted)
        } else {
            Ok(AuthenticationOutcome::Success)
        }
    }

    async fn execute_underlying_operation(
        &self,
        _request: BackendRequest<'_>,
    ) -> Result<(), BackendError> {
        self.before_call().await?;
        if self.execution_fails {
            return Err(BackendError::Rejected("execution refused".to_string()));
        }
        self.executions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
