use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, warn};
use reqwest::Client;

use crate::captcha_solver::{solve_off_thread, CaptchaSolver};
use crate::config::{ClientConfig, Credentials};
use crate::error::{LoginFailure, VtopError};
use crate::network_client::{self, LoginOutcome};
use crate::utils::{mask_identifier, mask_token};

/// Identity the portal handed back after a successful login. Resource
/// requests must use this registration number and token, not the ones the
/// caller logged in with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EstablishedSession {
    pub registration_number: String,
    pub post_login_csrf_token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoginStage {
    FetchingCsrf,
    PreLogin,
    FetchingCaptcha,
    SolvingCaptcha,
    Attempting,
}

/// Runs the full login sequence with bounded retries.
///
/// Every outer attempt starts from a fresh CSRF token and CAPTCHA, since the
/// portal accepts each pair only once. CAPTCHA failures retry after
/// `retry_delay`; bad credentials and unexpected redirects end the sequence
/// immediately; anything else backs off `retry_delay * attempt` before the
/// next attempt. The error of the final attempt is returned unchanged.
///
/// A CAPTCHA fetch that exhausts `captcha_retries` counts as a CAPTCHA miss
/// here, so a portal that never serves the image costs up to
/// `max_login_attempts * captcha_retries` login page fetches.
pub async fn perform_login_sequence(
    client: &Client,
    config: &ClientConfig,
    credentials: &Credentials,
    solver: Arc<dyn CaptchaSolver>,
) -> Result<EstablishedSession, VtopError> {
    let max_attempts = config.max_login_attempts.max(1);
    let who = mask_identifier(credentials.identifier());
    let start_time = Instant::now();

    for attempt in 1..=max_attempts {
        info!("Login attempt {}/{} for {}", attempt, max_attempts, who);

        let (error, delay) =
            match attempt_once(client, config, credentials, Arc::clone(&solver)).await {
                Ok(LoginOutcome::Success {
                    registration_number,
                    post_login_csrf_token,
                }) => {
                    info!(
                        "[TIMING] login for {} took {:.2?}",
                        who,
                        start_time.elapsed()
                    );
                    return Ok(EstablishedSession {
                        registration_number,
                        post_login_csrf_token,
                    });
                }
                Ok(LoginOutcome::BadCredentials { message }) => {
                    warn!("Login rejected for {}: {}", who, message);
                    return Err(LoginFailure::BadCredentials(message).into());
                }
                Ok(LoginOutcome::UnexpectedRedirect { url, status }) => {
                    warn!("Login for {} landed on {} ({})", who, url, status);
                    return Err(LoginFailure::UnexpectedRedirect { url, status }.into());
                }
                Ok(LoginOutcome::CaptchaRejected { message }) => (
                    VtopError::Captcha(format!("server rejected the solved text: {}", message)),
                    config.retry_delay,
                ),
                Err(error @ VtopError::Captcha(_)) => (error, config.retry_delay),
                Err(error @ VtopError::Config(_)) => return Err(error),
                Err(error) => (error, config.retry_delay * attempt),
            };

        if attempt == max_attempts {
            warn!(
                "Login for {} failed after {} attempts: {}",
                who, max_attempts, error
            );
            return Err(error);
        }
        warn!(
            "Login attempt {} for {} failed: {}; retrying in {:?}",
            attempt, who, error, delay
        );
        tokio::time::sleep(delay).await;
    }

    Err(VtopError::Session(format!(
        "no login attempt was made for {}",
        who
    )))
}

async fn attempt_once(
    client: &Client,
    config: &ClientConfig,
    credentials: &Credentials,
    solver: Arc<dyn CaptchaSolver>,
) -> Result<LoginOutcome, VtopError> {
    let base_url = &config.base_url;

    debug!("[Login] {:?}", LoginStage::FetchingCsrf);
    let csrf_token = network_client::fetch_csrf_token(
        client,
        base_url,
        config.csrf_retries,
        config.retry_delay,
    )
    .await?;
    debug!("[Login] CSRF token: {}", mask_token(&csrf_token));

    debug!("[Login] {:?}", LoginStage::PreLogin);
    network_client::pre_login(client, base_url, &csrf_token).await?;

    debug!("[Login] {:?}", LoginStage::FetchingCaptcha);
    let captcha = network_client::fetch_captcha(
        client,
        base_url,
        config.captcha_retries,
        config.retry_delay,
    )
    .await?;

    debug!("[Login] {:?}", LoginStage::SolvingCaptcha);
    let captcha_text = solve_off_thread(solver, captcha).await?;

    debug!("[Login] {:?}", LoginStage::Attempting);
    network_client::attempt_login(
        client,
        base_url,
        &csrf_token,
        credentials.identifier(),
        credentials.secret(),
        &captcha_text,
    )
    .await
}
