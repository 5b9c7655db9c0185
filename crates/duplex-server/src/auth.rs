//! API key authentication for the socket and `/status`.

use std::collections::HashMap;

use axum::http::HeaderMap;
use duplex_core::errors::GatewayError;

/// Query parameter carrying the key.
pub const API_KEY_QUERY: &str = "api_key";
/// Header carrying the key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Decides whether a presented key is valid.
pub trait Authenticator: Send + Sync {
    /// Accept or reject `key` (`None` when the client sent none).
    fn authenticate(&self, key: Option<&str>) -> Result<(), GatewayError>;
}

/// A fixed set of accepted keys. An empty set rejects everything.
#[derive(Clone, Debug, Default)]
pub struct StaticKeys {
    keys: Vec<String>,
}

impl StaticKeys {
    /// Accept exactly `keys`.
    pub fn new(keys: impl IntoIterator<Item = String>) -> Self {
        Self {
            keys: keys.into_iter().filter(|k| !k.is_empty()).collect(),
        }
    }
}

impl Authenticator for StaticKeys {
    fn authenticate(&self, key: Option<&str>) -> Result<(), GatewayError> {
        let Some(key) = key.filter(|k| !k.is_empty()) else {
            return Err(GatewayError::Authentication {
                reason: "missing API key".into(),
            });
        };
        if self.keys.iter().any(|k| k == key) {
            Ok(())
        } else {
            Err(GatewayError::Authentication {
                reason: "invalid API key".into(),
            })
        }
    }
}

/// Key from the `api_key` query parameter, falling back to `X-API-Key`.
pub fn extract_api_key<'a>(
    query: &'a HashMap<String, String>,
    headers: &'a HeaderMap,
) -> Option<&'a str> {
    query
        .get(API_KEY_QUERY)
        .map(String::as_str)
        .or_else(|| headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use axum::http::HeaderValue;

    use super::*;

    fn keys() -> StaticKeys {
        StaticKeys::new(["alpha".to_string(), "beta".to_string()])
    }

    #[test]
    fn accepts_known_key() {
        assert!(keys().authenticate(Some("beta")).is_ok());
    }

    #[test]
    fn rejects_missing_and_unknown() {
        assert_matches!(
            keys().authenticate(None),
            Err(GatewayError::Authentication { reason }) if reason.contains("missing")
        );
        assert_matches!(
            keys().authenticate(Some("")),
            Err(GatewayError::Authentication { .. })
        );
        assert_matches!(
            keys().authenticate(Some("gamma")),
            Err(GatewayError::Authentication { reason }) if reason.contains("invalid")
        );
    }

    #[test]
    fn empty_key_set_rejects_everything() {
        let none = StaticKeys::new(Vec::new());
        assert!(none.authenticate(Some("alpha")).is_err());
        let blank = StaticKeys::new([String::new()]);
        assert!(blank.authenticate(Some("")).is_err());
    }

    #[test]
    fn query_wins_over_header() {
        let mut query = HashMap::new();
        let _ = query.insert("api_key".to_string(), "from-query".to_string());
        let mut headers = HeaderMap::new();
        let _ = headers.insert("X-API-Key", HeaderValue::from_static("from-header"));
        assert_eq!(extract_api_key(&query, &headers), Some("from-query"));
        assert_eq!(
            extract_api_key(&HashMap::new(), &headers),
            Some("from-header")
        );
        assert_eq!(extract_api_key(&HashMap::new(), &HeaderMap::new()), None);
    }
}
