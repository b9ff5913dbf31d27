//! Shared-token authentication.
//!
//! Connections authenticate with a single shared bearer token presented at
//! handshake time. Token checks use a constant-time comparison so response
//! timing leaks nothing about the secret.

/// Token configuration for a broker listener.
///
/// # Example
///
/// ```
/// use buildmesh_proto::auth::TokenConfig;
///
/// let auth = TokenConfig::with_token("secret");
/// assert!(auth.requires_auth());
/// assert!(auth.validate(Some("secret")));
/// assert!(!auth.validate(Some("wrong")));
/// assert!(!auth.validate(None));
///
/// let open = TokenConfig::disabled();
/// assert!(open.validate(None));
/// ```
#[derive(Clone, Debug, Default)]
pub struct TokenConfig {
    token: Option<String>,
}

impl TokenConfig {
    /// Creates a config that accepts every connection.
    pub fn disabled() -> Self {
        Self { token: None }
    }

    /// Creates a config requiring the given token.
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }

    /// Returns true when connections must present a token.
    pub fn requires_auth(&self) -> bool {
        self.token.is_some()
    }

    /// Validates a presented token.
    pub fn validate(&self, presented: Option<&str>) -> bool {
        match (&self.token, presented) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(expected), Some(presented)) => constant_time_eq(expected.as_bytes(), presented.as_bytes()),
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}
