/// Keeps the first five characters of a registration number for log output.
pub fn mask_identifier(identifier: &str) -> String {
    let visible: String = identifier.chars().take(5).collect();
    format!("{}****", visible)
}

/// Shortens a CSRF token to its first segment so logs never carry a usable value.
pub fn mask_token(token: &str) -> String {
    let visible: String = token.chars().take(8).collect();
    format!("{}-****", visible)
}
