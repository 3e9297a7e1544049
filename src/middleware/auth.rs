use crate::{error::AuthError, session::Caller, AppState};
use axum::{
    extract::{Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;

/// Query parameters that must never carry a credential.
const CREDENTIAL_QUERY_PARAMS: [&str; 4] = ["token", "access_token", "apiKey", "api_key"];

/// Extract the presented API key from the Authorization header
///
/// Accepts the raw key (`Authorization: <key>`) or a bearer form
/// (`Authorization: Bearer <key>`).
///
/// # Errors
///
/// * `MissingAuthorizationHeader` - header absent or blank
/// * `MalformedAuthorizationHeader` - non-ASCII value, or `Bearer` without a token
pub fn parse_authorization(headers: &HeaderMap) -> Result<String, AuthError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or(AuthError::MissingAuthorizationHeader)?
        .to_str()
        .map_err(|_| AuthError::MalformedAuthorizationHeader)?
        .trim();

    if value.is_empty() {
        return Err(AuthError::MissingAuthorizationHeader);
    }

    let scheme_len = "bearer".len();
    let is_bearer = value.len() >= scheme_len
        && value.is_char_boundary(scheme_len)
        && value[..scheme_len].eq_ignore_ascii_case("bearer")
        && value[scheme_len..]
            .chars()
            .next()
            .map_or(true, char::is_whitespace);

    if is_bearer {
        let token = value[scheme_len..].trim();
        if token.is_empty() {
            return Err(AuthError::MalformedAuthorizationHeader);
        }
        return Ok(token.to_string());
    }

    Ok(value.to_string())
}

fn query_carries_credential(query: Option<&str>) -> bool {
    query.is_some_and(|q| {
        q.split('&')
            .filter_map(|pair| pair.split('=').next())
            .any(|name| CREDENTIAL_QUERY_PARAMS.contains(&name))
    })
}

fn keys_match(presented: &str, expected: &str) -> bool {
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// API key authentication for the MCP surfaces and `/close`
///
/// With no API key configured every request passes as an anonymous caller.
/// Otherwise the request must present the key; the resulting [`Caller`] is
/// attached to the request extensions for the handlers. The presented value
/// is never logged.
pub async fn api_key_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let Some(expected) = state.gateway.config().api_key.as_deref() else {
        request.extensions_mut().insert(Caller::anonymous());
        return Ok(next.run(request).await);
    };

    let path = request.uri().path().to_string();

    if query_carries_credential(request.uri().query()) {
        tracing::warn!(path = %path, "rejected request with credential in query string");
        return Err(AuthError::CredentialInQueryString);
    }

    let presented = match parse_authorization(request.headers()) {
        Ok(presented) => presented,
        Err(err) => {
            tracing::warn!(path = %path, error = %err, "rejected unauthenticated request");
            return Err(err);
        }
    };

    if !keys_match(&presented, expected) {
        tracing::warn!(path = %path, "rejected request with invalid API key");
        return Err(AuthError::InvalidApiKey);
    }

    request
        .extensions_mut()
        .insert(Caller::from_credential(&presented));
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with(value: &[u8]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_bytes(value).unwrap(),
        );
        headers
    }

    #[test]
    fn raw_key_is_accepted() {
        assert_eq!(parse_authorization(&headers_with(b"k-123")).unwrap(), "k-123");
    }

    #[test]
    fn bearer_prefix_is_stripped() {
        assert_eq!(
            parse_authorization(&headers_with(b"Bearer k-123")).unwrap(),
            "k-123"
        );
        assert_eq!(
            parse_authorization(&headers_with(b"bearer   k-123")).unwrap(),
            "k-123"
        );
    }

    #[test]
    fn key_starting_with_bearer_letters_is_raw() {
        assert_eq!(
            parse_authorization(&headers_with(b"bearerish")).unwrap(),
            "bearerish"
        );
    }

    #[test]
    fn empty_bearer_is_malformed() {
        assert!(matches!(
            parse_authorization(&headers_with(b"Bearer ")),
            Err(AuthError::MalformedAuthorizationHeader)
        ));
    }

    #[test]
    fn non_ascii_is_malformed() {
        assert!(matches!(
            parse_authorization(&headers_with("clé".as_bytes())),
            Err(AuthError::MalformedAuthorizationHeader)
        ));
    }

    #[test]
    fn missing_header_is_reported() {
        assert!(matches!(
            parse_authorization(&HeaderMap::new()),
            Err(AuthError::MissingAuthorizationHeader)
        ));
    }

    #[test]
    fn credential_query_params_are_detected() {
        assert!(query_carries_credential(Some("a=1&api_key=x")));
        assert!(query_carries_credential(Some("token")));
        assert!(!query_carries_credential(Some("tokens=1")));
        assert!(!query_carries_credential(None));
    }

    #[test]
    fn key_comparison() {
        assert!(keys_match("secret", "secret"));
        assert!(!keys_match("secret", "secreT"));
        assert!(!keys_match("secret", "secret2"));
    }
}
