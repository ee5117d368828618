// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! HTTP basic auth for the Backup Server.

use crate::config::Account;
use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{prelude::BASE64_STANDARD, Engine};
use std::sync::Arc;
use tracing::warn;

const REALM: &str = "Basic realm=\"mysql-sidecar\"";

/// Reject requests whose `Authorization` header does not carry `expected`.
pub async fn require_basic_auth(
    State(expected): State<Arc<Account>>,
    request: Request,
    next: Next,
) -> Response {
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(decode_basic);

    match presented {
        Some((user, password)) if matches(&expected, &user, &password) => next.run(request).await,
        Some((user, _)) => {
            warn!(user = %user, path = %request.uri().path(), "Rejected backup credentials");
            unauthorized()
        }
        None => unauthorized(),
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, REALM)],
        "authorization required",
    )
        .into_response()
}

/// `Basic dXNlcjpwdw==` → `("user", "pw")`.
pub fn decode_basic(value: &str) -> Option<(String, String)> {
    let (scheme, data) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = BASE64_STANDARD.decode(data.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

fn matches(expected: &Account, user: &str, password: &str) -> bool {
    constant_time_eq(expected.user.as_bytes(), user.as_bytes())
        & constant_time_eq(expected.password.as_bytes(), password.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_basic() {
        let header = format!("Basic {}", BASE64_STANDARD.encode("backup:p:w"));
        assert_eq!(
            decode_basic(&header),
            Some(("backup".to_string(), "p:w".to_string()))
        );
        assert_eq!(decode_basic("Bearer abc"), None);
        assert_eq!(decode_basic("Basic !!!"), None);
        assert_eq!(decode_basic("Basic"), None);
    }

    #[test]
    fn test_matches() {
        let account = Account::new("backup", "pw");
        assert!(matches(&account, "backup", "pw"));
        assert!(!matches(&account, "backup", "pw2"));
        assert!(!matches(&account, "other", "pw"));
    }
}
