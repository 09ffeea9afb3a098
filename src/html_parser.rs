use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};

static CSRF_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<input type="hidden" name="_csrf" value="([0-9a-f-]+)""#)
        .expect("Failed to compile csrf regex")
});
static CAPTCHA_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"data:image/(?:jpeg|jpg|png);base64,([^"']+)"#)
        .expect("Failed to compile captcha regex")
});
static REGISTRATION_SELECTOR: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(r#"input[type="hidden"][name="authorizedIDX"]"#)
        .expect("Failed to parse registration number selector")
});
static STRONG_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("strong").expect("Failed to parse strong selector"));
static LOGIN_FORM_SELECTOR: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(r#"input[name="captchaStr"], form#vtopLoginForm"#)
        .expect("Failed to parse login form selector")
});

/// Returns the hidden `_csrf` form value, if the page carries one.
pub fn find_csrf(html: &str) -> Option<String> {
    CSRF_RE
        .captures(html)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str().to_string())
}

/// Returns the base64 payload of the first embedded CAPTCHA image, without
/// its data-URI prefix.
pub fn find_captcha(html: &str) -> Option<String> {
    CAPTCHA_RE
        .captures(html)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|payload| !payload.is_empty())
}

/// The canonical registration number the portal echoes back after login.
pub fn find_registration_number(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let value = document
        .select(&REGISTRATION_SELECTOR)
        .next()
        .and_then(|element| element.value().attr("value"))
        .map(|value| value.trim().to_string());
    value.filter(|value| !value.is_empty())
}

/// Text of the first `<strong>` element, which is where the login page
/// renders its inline error.
pub fn find_login_error(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let message = document.select(&STRONG_SELECTOR).next().map(|element| {
        element
            .text()
            .collect::<String>()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    });
    message.filter(|text| !text.is_empty())
}

/// A page showing the login form means the server no longer recognizes the
/// session cookie.
pub fn is_login_page(html: &str) -> bool {
    Html::parse_document(html)
        .select(&LOGIN_FORM_SELECTOR)
        .next()
        .is_some()
}
