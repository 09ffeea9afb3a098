#![allow(dead_code)]

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use url::Url;
use vtop_session::captcha_solver::{
    cell_rect, CaptchaSolver, ClassifierParameters, GlyphClassifier, ALPHABET, CELL_PIXELS,
    CELL_WIDTH,
};
use vtop_session::{ClientConfig, Credentials, VtopClient};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

pub const ENTRY_TOKEN: &str = "abc123";
pub const POST_LOGIN_TOKEN: &str = "def456";
pub const REGISTRATION_NUMBER: &str = "24BCE1000";
pub const CAPTCHA_TEXT: &str = "XJ4PQ7";

/// Classifier whose glyph k is the set of cell pixels with index k mod 32.
pub fn template_classifier() -> Arc<dyn CaptchaSolver> {
    let symbols = ALPHABET.len();
    let weights = (0..CELL_PIXELS)
        .map(|pixel| {
            (0..symbols)
                .map(|symbol| if pixel % symbols == symbol { 1.0 } else { 0.0 })
                .collect()
        })
        .collect();
    let parameters = ClassifierParameters {
        weights,
        biases: vec![0.0; symbols],
    };
    Arc::new(GlyphClassifier::new(parameters).unwrap())
}

/// Base64 PNG that `template_classifier` reads as `text`.
pub fn captcha_base64(text: &str) -> String {
    let mut image = GrayImage::from_pixel(200, 40, Luma([255]));
    for (index, symbol) in text.chars().enumerate() {
        let rect = cell_rect(index);
        let k = ALPHABET.chars().position(|c| c == symbol).unwrap();
        for pixel in (0..CELL_PIXELS).filter(|p| p % ALPHABET.len() == k) {
            let x = rect.x1 + (pixel as u32 % CELL_WIDTH);
            let y = rect.y1 + (pixel as u32 / CELL_WIDTH);
            image.put_pixel(x, y, Luma([0]));
        }
    }
    let mut bytes = Vec::new();
    DynamicImage::ImageLuma8(image)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    STANDARD.encode(bytes)
}

pub fn entry_page(token: &str) -> String {
    format!(
        r#"<html><body><form id="stdForm"><input type="hidden" name="_csrf" value="{token}"/></form></body></html>"#
    )
}

pub fn login_page(captcha: Option<&str>) -> String {
    let image = captcha
        .map(|payload| format!(r#"<img src="data:image/jpeg;base64,{payload}" alt="captcha">"#))
        .unwrap_or_default();
    format!(
        r#"<html><body><form id="vtopLoginForm"><input name="captchaStr">{image}</form></body></html>"#
    )
}

pub fn content_page(token: &str, registration_number: &str) -> String {
    format!(
        r#"<html><body>
        <input type="hidden" name="_csrf" value="{token}"/>
        <input type="hidden" name="authorizedIDX" value="{registration_number}"/>
        <div id="page-holder">Welcome</div>
        </body></html>"#
    )
}

pub fn error_page(message: &str) -> String {
    format!(r#"<html><body><div class="alert"><strong>{message}</strong></div></body></html>"#)
}

pub fn redirect_to(server: &MockServer, target: &str) -> ResponseTemplate {
    ResponseTemplate::new(302).insert_header("Location", format!("{}{}", server.uri(), target))
}

pub fn html(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("Content-Type", "text/html;charset=UTF-8")
        .set_body_string(body)
}

pub fn test_config(server: &MockServer) -> ClientConfig {
    ClientConfig {
        base_url: Url::parse(&server.uri()).unwrap(),
        timeout: Duration::from_secs(5),
        max_login_attempts: 3,
        captcha_retries: 3,
        csrf_retries: 3,
        retry_delay: Duration::from_millis(10),
        ..ClientConfig::default()
    }
}

pub fn credentials() -> Credentials {
    Credentials::new("24bce1000", "secret-password").unwrap()
}

pub fn client_with(config: ClientConfig) -> VtopClient {
    VtopClient::with_solver(credentials(), config, template_classifier()).unwrap()
}

/// Mounts the entry, pre-login and CAPTCHA pages of a healthy portal.
pub async fn mount_login_pages(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/vtop/open/page"))
        .respond_with(html(entry_page(ENTRY_TOKEN)))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/vtop/prelogin/setup"))
        .respond_with(html("<html></html>".to_string()))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/vtop/login"))
        .respond_with(html(login_page(Some(&captcha_base64(CAPTCHA_TEXT)))))
        .mount(server)
        .await;
}

/// Mounts the page a successful login lands on.
pub async fn mount_content_page(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/vtop/content"))
        .respond_with(html(content_page(POST_LOGIN_TOKEN, REGISTRATION_NUMBER)))
        .mount(server)
        .await;
}

pub async fn count_requests(server: &MockServer, verb: &str, route: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|request: &&Request| {
            request.method.as_str() == verb && request.url.path() == route
        })
        .count()
}
