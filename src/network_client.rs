use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use once_cell::sync::Lazy;
use reqwest::header::{
    HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CACHE_CONTROL, PRAGMA, USER_AGENT,
};
use reqwest::{Client, Response, StatusCode};
use url::Url;

use crate::config::ClientConfig;
use crate::error::{LoginFailure, VtopError};
use crate::html_parser;
use crate::utils::{mask_identifier, mask_token};

pub const ENTRY_PATH: &str = "/vtop/open/page";
pub const PRELOGIN_PATH: &str = "/vtop/prelogin/setup";
pub const LOGIN_PATH: &str = "/vtop/login";
pub const LOGIN_ERROR_PATH: &str = "/vtop/login/error";
pub const CONTENT_PATH: &str = "/vtop/content";

static BASE_HEADERS: Lazy<HeaderMap> = Lazy::new(|| {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"));
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.5"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(USER_AGENT, HeaderValue::from_static("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36"));
    headers
});

/// How the portal answered a credential submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    Success {
        registration_number: String,
        post_login_csrf_token: String,
    },
    BadCredentials {
        message: String,
    },
    /// The error page blamed the CAPTCHA text rather than the credentials.
    CaptchaRejected {
        message: String,
    },
    UnexpectedRedirect {
        url: String,
        status: StatusCode,
    },
}

/// Builds the cookie-keeping client used for every request of one identity.
pub fn build_client(config: &ClientConfig) -> Result<Client, VtopError> {
    Client::builder()
        .default_headers(BASE_HEADERS.clone())
        .cookie_provider(Arc::new(reqwest::cookie::Jar::default()))
        .timeout(config.timeout)
        .build()
        .map_err(|e| VtopError::connection("building the http client", e))
}

pub(crate) fn portal_url(base_url: &Url, path: &str) -> Result<Url, VtopError> {
    base_url
        .join(path)
        .map_err(|e| VtopError::Config(format!("cannot join {} onto {}: {}", path, base_url, e)))
}

fn lands_on(final_url: &Url, expected: &Url) -> bool {
    final_url.origin() == expected.origin()
        && final_url.path().trim_end_matches('/') == expected.path().trim_end_matches('/')
}

async fn timed_get(client: &Client, url: &Url, what: &str) -> Result<Response, VtopError> {
    let start_time = Instant::now();
    let response_result = client.get(url.clone()).send().await;
    info!("[TIMING] {} GET {} took {:.2?}", what, url, start_time.elapsed());
    response_result.map_err(|e| VtopError::connection(format!("fetching {}", what), e))
}

async fn timed_post(
    client: &Client,
    url: &Url,
    form: &[(&str, &str)],
    what: &str,
) -> Result<Response, VtopError> {
    let start_time = Instant::now();
    let response_result = client.post(url.clone()).form(form).send().await;
    info!("[TIMING] {} POST {} took {:.2?}", what, url, start_time.elapsed());
    response_result.map_err(|e| VtopError::connection(format!("submitting {}", what), e))
}

async fn read_body(response: Response, what: &str) -> Result<String, VtopError> {
    response
        .text()
        .await
        .map_err(|e| VtopError::connection(format!("reading the {} body", what), e))
}

/// Fetches the entry page until it carries a CSRF token.
pub async fn fetch_csrf_token(
    client: &Client,
    base_url: &Url,
    max_attempts: u32,
    retry_delay: Duration,
) -> Result<String, VtopError> {
    let entry_url = portal_url(base_url, ENTRY_PATH)?;
    let max_attempts = max_attempts.max(1);

    for attempt in 1..=max_attempts {
        debug!("Fetching initial CSRF token, attempt {}/{}", attempt, max_attempts);
        let response = timed_get(client, &entry_url, "entry page").await?;
        let status = response.status();
        if !status.is_success() {
            return Err(VtopError::Csrf(format!(
                "entry page returned status {}",
                status
            )));
        }
        let html = read_body(response, "entry page").await?;

        if let Some(token) = html_parser::find_csrf(&html) {
            debug!("Initial CSRF token found: {}", mask_token(&token));
            return Ok(token);
        }
        if attempt < max_attempts {
            warn!("CSRF token not found in entry page, retrying");
            tokio::time::sleep(retry_delay).await;
        }
    }

    Err(VtopError::Csrf(format!(
        "token not found after {} attempts",
        max_attempts
    )))
}

/// Best-effort context setup the portal expects before the login form.
pub async fn pre_login(client: &Client, base_url: &Url, csrf_token: &str) -> Result<(), VtopError> {
    let url = portal_url(base_url, PRELOGIN_PATH)?;
    let params = [("_csrf", csrf_token), ("flag", "VTOP")];
    let response = timed_post(client, &url, &params, "pre-login").await?;

    if response.status().is_success() {
        debug!("Pre-login succeeded");
    } else {
        warn!("Pre-login returned status {}, continuing", response.status());
    }
    Ok(())
}

/// Fetches the login page until it embeds a CAPTCHA image.
pub async fn fetch_captcha(
    client: &Client,
    base_url: &Url,
    max_attempts: u32,
    retry_delay: Duration,
) -> Result<String, VtopError> {
    let login_url = portal_url(base_url, LOGIN_PATH)?;
    let max_attempts = max_attempts.max(1);

    for attempt in 1..=max_attempts {
        debug!("Fetching captcha, attempt {}/{}", attempt, max_attempts);
        let response = timed_get(client, &login_url, "login page").await?;
        let status = response.status();
        if !status.is_success() {
            return Err(VtopError::Captcha(format!(
                "login page returned status {}",
                status
            )));
        }
        let html = read_body(response, "login page").await?;

        if let Some(captcha) = html_parser::find_captcha(&html) {
            debug!("Captcha image found ({} base64 bytes)", captcha.len());
            return Ok(captcha);
        }
        if attempt < max_attempts {
            warn!("Captcha image not found in login page, retrying");
            tokio::time::sleep(retry_delay).await;
        }
    }

    Err(VtopError::Captcha(format!(
        "image not found after {} attempts",
        max_attempts
    )))
}

/// Submits the credentials and classifies where the portal redirected.
pub async fn attempt_login(
    client: &Client,
    base_url: &Url,
    csrf_token: &str,
    identifier: &str,
    secret: &str,
    captcha_text: &str,
) -> Result<LoginOutcome, VtopError> {
    let login_url = portal_url(base_url, LOGIN_PATH)?;
    let content_url = portal_url(base_url, CONTENT_PATH)?;
    let error_url = portal_url(base_url, LOGIN_ERROR_PATH)?;

    let params = [
        ("_csrf", csrf_token),
        ("username", identifier),
        ("password", secret),
        ("captchaStr", captcha_text),
    ];
    let response = timed_post(client, &login_url, &params, "login form").await?;
    let final_url = response.url().clone();
    let status = response.status();

    if lands_on(&final_url, &content_url) {
        info!(
            "Login accepted for {}, reading content page",
            mask_identifier(identifier)
        );
        let content = timed_get(client, &content_url, "content page").await?;
        let html = read_body(content, "content page").await?;

        let post_login_csrf_token = html_parser::find_csrf(&html)
            .ok_or(LoginFailure::MissingSessionData("the post-login csrf token"))?;
        let registration_number = html_parser::find_registration_number(&html)
            .ok_or(LoginFailure::MissingSessionData("the registration number"))?;

        return Ok(LoginOutcome::Success {
            registration_number,
            post_login_csrf_token,
        });
    }

    if lands_on(&final_url, &error_url) {
        let html = read_body(response, "login error page").await?;
        let message = html_parser::find_login_error(&html)
            .unwrap_or_else(|| "login rejected without a message".to_string());
        if message.to_ascii_lowercase().contains("captcha") {
            return Ok(LoginOutcome::CaptchaRejected { message });
        }
        return Ok(LoginOutcome::BadCredentials { message });
    }

    Ok(LoginOutcome::UnexpectedRedirect {
        url: final_url.to_string(),
        status,
    })
}

/// A page fetched with the session cookies of the client.
#[derive(Debug, Clone)]
pub struct PortalPage {
    pub url: Url,
    pub status: StatusCode,
    pub body: String,
}

impl PortalPage {
    /// The portal answers requests from a dead session by bouncing to the
    /// entry or login pages instead of returning an error status.
    pub fn session_expired(&self, base_url: &Url) -> bool {
        if matches!(self.status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return true;
        }
        let bounced = [ENTRY_PATH, LOGIN_PATH, LOGIN_ERROR_PATH]
            .iter()
            .filter_map(|path| portal_url(base_url, path).ok())
            .any(|url| lands_on(&self.url, &url));
        bounced || html_parser::is_login_page(&self.body)
    }
}

/// Posts a form with whatever cookies the client already holds.
pub async fn post_page_with_cookies(
    client: &Client,
    url: &Url,
    form: &[(&str, &str)],
) -> Result<PortalPage, VtopError> {
    let response = timed_post(client, url, form, "portal form").await?;
    let url = response.url().clone();
    let status = response.status();
    let body = read_body(response, "portal page").await?;
    Ok(PortalPage { url, status, body })
}
