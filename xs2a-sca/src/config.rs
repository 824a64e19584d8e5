//! Configuration for the SCA node.

use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::approach::{LinkBuilder, ScaApproach};
use crate::error::{Error, Result};
use crate::state_machine::{ExemptionPolicy, StagePolicy, ZeroMethodsPolicy};
use crate::validation::AllowedStagePolicy;

/// Configuration for the SCA node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaConfig {
    /// Approach used when the TPP has no (supported) preference.
    pub default_approach: ScaApproach,

    /// Approaches the bank supports.
    pub supported_approaches: Vec<ScaApproach>,

    /// Lifetime of the redirect link in seconds.
    pub redirect_url_expiration_secs: u64,

    /// Overall lifetime of an authorisation in seconds.
    pub authorisation_expiration_secs: u64,

    /// Timeout for every backend call in seconds.
    pub backend_timeout_secs: u64,

    /// Attempt failures tolerated before an authorisation fails.
    pub max_failed_attempts: u32,

    pub zero_methods_policy: ZeroMethodsPolicy,

    pub exemption_policy: ExemptionPolicy,

    /// Deployment restrictions on which stages each approach may drive.
    pub allowed_stages: AllowedStagePolicy,

    /// Base URL of the XS2A API, used for next links.
    pub api_base_url: String,

    /// Base URL of the bank's SCA pages for the redirect approach.
    pub redirect_base_url: String,

    /// Interval of the background expiry sweep in seconds. `None` disables it.
    pub expiry_sweep_interval_secs: Option<u64>,
}

impl Default for ScaConfig {
    fn default() -> Self {
        Self {
            default_approach: ScaApproach::Redirect,
            supported_approaches: vec![
                ScaApproach::Redirect,
                ScaApproach::Embedded,
                ScaApproach::Decoupled,
            ],
            redirect_url_expiration_secs: 600,
            authorisation_expiration_secs: 86_400,
            backend_timeout_secs: 30,
            max_failed_attempts: 3,
            zero_methods_policy: ZeroMethodsPolicy::default(),
            exemption_policy: ExemptionPolicy::default(),
            allowed_stages: AllowedStagePolicy::default(),
            api_base_url: "http://localhost:8080".to_string(),
            redirect_base_url: "http://localhost:4200/authorisation".to_string(),
            expiry_sweep_interval_secs: Some(60),
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|e| Error::Configuration(format!("{}={}: {}", name, value, e))),
        Err(_) => Ok(None),
    }
}

impl ScaConfig {
    /// Defaults overridden by `XS2A_SCA_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(approach) = env_parse::<ScaApproach>("XS2A_SCA_DEFAULT_APPROACH")? {
            config.default_approach = approach;
        }
        if let Ok(list) = env::var("XS2A_SCA_SUPPORTED_APPROACHES") {
            config.supported_approaches = list
                .split(',')
                .map(|s| s.trim().parse::<ScaApproach>().map_err(Error::Configuration))
                .collect::<Result<Vec<_>>>()?;
        }
        if let Some(secs) = env_parse("XS2A_SCA_REDIRECT_URL_EXPIRATION_SECS")? {
            config.redirect_url_expiration_secs = secs;
        }
        if let Some(secs) = env_parse("XS2A_SCA_AUTHORISATION_EXPIRATION_SECS")? {
            config.authorisation_expiration_secs = secs;
        }
        if let Some(secs) = env_parse("XS2A_SCA_BACKEND_TIMEOUT_SECS")? {
            config.backend_timeout_secs = secs;
        }
        if let Some(max) = env_parse("XS2A_SCA_MAX_FAILED_ATTEMPTS")? {
            config.max_failed_attempts = max;
        }
        if let Ok(url) = env::var("XS2A_SCA_API_BASE_URL") {
            config.api_base_url = url;
        }
        if let Ok(url) = env::var("XS2A_SCA_REDIRECT_BASE_URL") {
            config.redirect_base_url = url;
        }
        if let Some(secs) = env_parse::<u64>("XS2A_SCA_EXPIRY_SWEEP_INTERVAL_SECS")? {
            config.expiry_sweep_interval_secs = (secs > 0).then_some(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<()> {
        if !self.supported_approaches.contains(&self.default_approach) {
            return Err(Error::Configuration(format!(
                "default approach {} is not supported",
                self.default_approach
            )));
        }
        if self.max_failed_attempts == 0 {
            return Err(Error::Configuration(
                "max_failed_attempts must be at least 1".to_string(),
            ));
        }
        if self.backend_timeout_secs == 0 {
            return Err(Error::Configuration(
                "backend_timeout_secs must be at least 1".to_string(),
            ));
        }
        self.link_builder().map(|_| ())
    }

    /// Returns the backend timeout as a Duration.
    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.backend_timeout_secs)
    }

    pub fn redirect_url_ttl(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.redirect_url_expiration_secs as i64)
    }

    pub fn authorisation_ttl(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.authorisation_expiration_secs as i64)
    }

    /// Returns the expiry sweep interval, if enabled.
    pub fn expiry_sweep_interval(&self) -> Option<Duration> {
        self.expiry_sweep_interval_secs.map(Duration::from_secs)
    }

    pub fn stage_policy(&self) -> StagePolicy {
        StagePolicy {
            zero_methods: self.zero_methods_policy,
            exemption: self.exemption_policy,
            max_failed_attempts: self.max_failed_attempts,
        }
    }

    pub fn link_builder(&self) -> Result<LinkBuilder> {
        LinkBuilder::new(&self.api_base_url, &self.redirect_base_url)
    }
}
