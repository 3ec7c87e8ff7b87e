use axum::http::{header, HeaderMap};

/// Cookies that may carry the access token, in lookup order.
const TOKEN_COOKIES: [&str; 2] = ["access_token", "id_token"];

/// Raw token from `Authorization: Bearer` or one of the token cookies.
pub fn token_from_headers(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
    {
        return Some(token.to_string());
    }

    let cookies: Vec<(&str, &str)> = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|h| h.to_str().ok())
        .flat_map(|h| h.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .collect();

    TOKEN_COOKIES.iter().find_map(|wanted| {
        cookies
            .iter()
            .find(|(name, value)| name == wanted && !value.is_empty())
            .map(|(_, value)| value.to_string())
    })
}
