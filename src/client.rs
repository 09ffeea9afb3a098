use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use log::{debug, info, warn};
use reqwest::Client;
use tokio::sync::Mutex;

use crate::captcha_solver::{self, CaptchaSolver, SharedClassifier};
use crate::config::{ClientConfig, Credentials};
use crate::error::VtopError;
use crate::login::{perform_login_sequence, EstablishedSession};
use crate::network_client::{self, PortalPage};
use crate::utils::mask_identifier;

#[derive(Default)]
struct LoginRecord {
    last_failure: Option<VtopError>,
}

/// Authenticated channel to the portal for one set of credentials.
///
/// The cookie jar lives inside the http client, so a `VtopClient` must never
/// be shared between identities. Logins are lazy and single-flight: callers
/// that race into `ensure_session` while a login is running wait for it and
/// all receive its result.
pub struct VtopClient {
    http: Client,
    config: ClientConfig,
    credentials: Credentials,
    solver: Arc<dyn CaptchaSolver>,
    session: RwLock<Option<Arc<EstablishedSession>>>,
    login_gate: Mutex<LoginRecord>,
    finished_logins: AtomicU64,
}

impl VtopClient {
    /// Client that solves CAPTCHAs with the process-wide classifier, loading
    /// it from `config.weights_path` unless an earlier call already did.
    pub fn new(credentials: Credentials, config: ClientConfig) -> Result<Self, VtopError> {
        captcha_solver::init_classifier(&config.weights_path);
        Self::with_solver(credentials, config, Arc::new(SharedClassifier))
    }

    pub fn with_solver(
        credentials: Credentials,
        config: ClientConfig,
        solver: Arc<dyn CaptchaSolver>,
    ) -> Result<Self, VtopError> {
        let config = config.normalized();
        let http = network_client::build_client(&config)?;
        Ok(Self {
            http,
            config,
            credentials,
            solver,
            session: RwLock::new(None),
            login_gate: Mutex::new(LoginRecord::default()),
            finished_logins: AtomicU64::new(0),
        })
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The underlying transport, for resource fetchers that issue their own
    /// requests after `ensure_session`.
    pub fn http_client(&self) -> &Client {
        &self.http
    }

    pub fn cached_session(&self) -> Option<Arc<EstablishedSession>> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the current session, logging in first if there is none.
    pub async fn ensure_session(&self) -> Result<Arc<EstablishedSession>, VtopError> {
        if let Some(session) = self.cached_session() {
            return Ok(session);
        }

        let ticket = self.finished_logins.load(Ordering::Acquire);
        let mut record = self.login_gate.lock().await;

        if let Some(session) = self.cached_session() {
            debug!("Session established by a concurrent caller");
            return Ok(session);
        }
        // A login finished while this caller was queued. If it failed, its
        // error is the answer for everyone who was waiting on it.
        if self.finished_logins.load(Ordering::Acquire) != ticket {
            if let Some(error) = &record.last_failure {
                return Err(error.clone());
            }
        }

        info!(
            "No session for {}, starting login",
            mask_identifier(self.credentials.identifier())
        );
        let result = perform_login_sequence(
            &self.http,
            &self.config,
            &self.credentials,
            Arc::clone(&self.solver),
        )
        .await;

        let outcome = match result {
            Ok(session) => {
                let session = Arc::new(session);
                *self.session.write().unwrap_or_else(PoisonError::into_inner) =
                    Some(Arc::clone(&session));
                record.last_failure = None;
                Ok(session)
            }
            Err(error) => {
                record.last_failure = Some(error.clone());
                Err(error)
            }
        };
        self.finished_logins.fetch_add(1, Ordering::AcqRel);
        outcome
    }

    /// Drops the cached session; the next `ensure_session` logs in again.
    pub fn invalidate(&self) {
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    // Leaves a newer session alone if another caller already replaced `stale`.
    fn invalidate_if_current(&self, stale: &Arc<EstablishedSession>) {
        let mut slot = self.session.write().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, stale)) {
            *slot = None;
        }
    }

    /// Posts `form` to `path` as the logged-in user, adding the session's
    /// CSRF token and registration number. A dead session is re-established
    /// once before giving up with `VtopError::Session`.
    pub async fn post_authenticated(
        &self,
        path: &str,
        form: &[(&str, &str)],
    ) -> Result<PortalPage, VtopError> {
        let url = network_client::portal_url(&self.config.base_url, path)?;

        for _ in 0..2 {
            let session = self.ensure_session().await?;
            let mut params = vec![
                ("_csrf", session.post_login_csrf_token.as_str()),
                ("authorizedID", session.registration_number.as_str()),
            ];
            params.extend_from_slice(form);

            let page = network_client::post_page_with_cookies(&self.http, &url, &params).await?;
            if !page.session_expired(&self.config.base_url) {
                return Ok(page);
            }
            warn!(
                "Session for {} expired, logging in again",
                mask_identifier(&session.registration_number)
            );
            self.invalidate_if_current(&session);
        }

        Err(VtopError::Session(format!(
            "portal kept rejecting the session for {}",
            path
        )))
    }
}
