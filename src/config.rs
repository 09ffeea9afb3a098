use std::env;
use std::fmt;
use std::fmt::Debug;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use log::error;
use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

use crate::error::VtopError;
use crate::utils::mask_identifier;

pub const DEFAULT_BASE_URL: &str = "https://vtop.vitap.ac.in";
pub const DEFAULT_WEIGHTS_PATH: &str = "resources/weights.json";

// Two digits, three letters, one or more digits (e.g. 24BCE1000).
static REGISTRATION_NUMBER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d{2}[A-Za-z]{3}\d+$").expect("Failed to compile registration number regex")
});

/// Login identity for one client instance. Immutable once built.
#[derive(Clone)]
pub struct Credentials {
    identifier: String,
    secret: String,
}

impl Credentials {
    pub fn new(identifier: &str, secret: &str) -> Result<Self, VtopError> {
        let identifier = identifier.trim().to_uppercase();
        if identifier.is_empty() || secret.is_empty() {
            return Err(VtopError::Config(
                "registration number and password are required".to_string(),
            ));
        }
        if !REGISTRATION_NUMBER_RE.is_match(&identifier) {
            return Err(VtopError::Config(format!(
                "invalid registration number format: {}",
                mask_identifier(&identifier)
            )));
        }
        Ok(Self {
            identifier,
            secret: secret.to_string(),
        })
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub(crate) fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Display for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{\"identifier\":\"{}\",\"secret\":\"[REDACTED]\"}}",
            mask_identifier(&self.identifier)
        )
    }
}

impl Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("identifier", &mask_identifier(&self.identifier))
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Tunables for the transport and the login retry loops.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: Url,
    /// Per-request timeout.
    pub timeout: Duration,
    pub max_login_attempts: u32,
    pub captcha_retries: u32,
    pub csrf_retries: u32,
    /// Pause between fetch retries and the unit of the outer login backoff.
    pub retry_delay: Duration,
    pub weights_path: PathBuf,
}

pub fn get_env_or_default<T: FromStr>(env_var: &str, default: T) -> T
where
    <T as FromStr>::Err: Debug,
{
    match env::var(env_var) {
        Ok(val) => val.parse::<T>().unwrap_or_else(|_| {
            error!("Failed to parse {}: {}, using default", env_var, val);
            default
        }),
        Err(_) => default,
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            base_url: default_base_url(),
            timeout: Duration::from_secs(30),
            max_login_attempts: 3,
            captcha_retries: 5,
            csrf_retries: 3,
            retry_delay: Duration::from_secs(1),
            weights_path: PathBuf::from(DEFAULT_WEIGHTS_PATH),
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let defaults = ClientConfig::default();
        ClientConfig {
            base_url: get_env_or_default("VTOP_BASE_URL", defaults.base_url),
            timeout: Duration::from_secs(get_env_or_default("VTOP_TIMEOUT_SECS", 30)),
            max_login_attempts: get_env_or_default(
                "VTOP_MAX_LOGIN_ATTEMPTS",
                defaults.max_login_attempts,
            ),
            captcha_retries: get_env_or_default("VTOP_CAPTCHA_RETRIES", defaults.captcha_retries),
            csrf_retries: get_env_or_default("VTOP_CSRF_RETRIES", defaults.csrf_retries),
            retry_delay: Duration::from_millis(get_env_or_default("VTOP_RETRY_DELAY_MS", 1000)),
            weights_path: get_env_or_default("VTOP_CAPTCHA_WEIGHTS", defaults.weights_path),
        }
        .normalized()
    }

    /// Every retry budget allows at least one attempt.
    pub fn normalized(mut self) -> Self {
        self.max_login_attempts = self.max_login_attempts.max(1);
        self.captcha_retries = self.captcha_retries.max(1);
        self.csrf_retries = self.csrf_retries.max(1);
        self
    }
}

fn default_base_url() -> Url {
    Url::parse(DEFAULT_BASE_URL).expect("default base url is valid")
}
