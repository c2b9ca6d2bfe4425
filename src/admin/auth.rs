//! Shared-secret admin token gate, constant-time compared. See spec §4.8.

use axum::http::HeaderMap;
use subtle::ConstantTimeEq;

use crate::error::AdminError;

pub const TOKEN_HEADER: &str = "x-admin-token";

fn token_matches(configured: &str, provided: &str) -> bool {
    configured.as_bytes().ct_eq(provided.as_bytes()).into()
}

/// Constant-time token check. Used directly by the `token_gate` middleware
/// in [`crate::admin`].
pub fn check(headers: &HeaderMap, configured_token: &str) -> Result<(), AdminError> {
    let provided = headers
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if provided.is_empty() || !token_matches(configured_token, provided) {
        return Err(AdminError::Unauthorized);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_token_passes() {
        let mut headers = HeaderMap::new();
        headers.insert(TOKEN_HEADER, "secret".parse().unwrap());
        assert!(check(&headers, "secret").is_ok());
    }

    #[test]
    fn missing_token_is_unauthorized() {
        let headers = HeaderMap::new();
        assert!(matches!(check(&headers, "secret"), Err(AdminError::Unauthorized)));
    }

    #[test]
    fn wrong_token_is_unauthorized() {
        let mut headers = HeaderMap::new();
        headers.insert(TOKEN_HEADER, "nope".parse().unwrap());
        assert!(matches!(check(&headers, "secret"), Err(AdminError::Unauthorized)));
    }
}
