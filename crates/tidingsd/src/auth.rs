//! Authentication schemes
//!
//! Each configured scheme maps a client secret to a principal. Only the
//! `token` scheme is built in:
//!
//! ```yaml
//! auth:
//!   token:
//!     tokens: { "s3cret": alice, "hunter2": bob }
//! ```

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

pub trait Authenticator: Send + Sync {
    /// Scheme name as used in configuration and login requests
    fn scheme(&self) -> &'static str;

    fn initialize(&mut self, config: &serde_json::Value) -> Result<()>;

    /// Principal for a valid secret
    fn authenticate(&self, secret: &str) -> Result<String>;
}

/// Static shared-secret tokens
#[derive(Debug, Default)]
pub struct TokenAuth {
    tokens: HashMap<String, String>,
}

#[derive(Deserialize)]
struct TokenAuthConfig {
    tokens: HashMap<String, String>,
}

impl Authenticator for TokenAuth {
    fn scheme(&self) -> &'static str {
        "token"
    }

    fn initialize(&mut self, config: &serde_json::Value) -> Result<()> {
        let config: TokenAuthConfig = serde_json::from_value(config.clone())
            .map_err(|e| Error::Config(format!("auth token: {}", e)))?;
        for principal in config.tokens.values() {
            crate::topic::TopicName::resolve("me", principal)
                .map_err(|_| Error::Config(format!("auth token: invalid principal '{}'", principal)))?;
        }
        self.tokens = config.tokens;
        Ok(())
    }

    fn authenticate(&self, secret: &str) -> Result<String> {
        self.tokens
            .get(secret)
            .cloned()
            .ok_or_else(|| Error::PermissionDenied("invalid credentials".into()))
    }
}

/// Configured authentication schemes
#[derive(Default)]
pub struct AuthRegistry {
    schemes: HashMap<&'static str, Box<dyn Authenticator>>,
}

impl AuthRegistry {
    pub fn from_config(config: &BTreeMap<String, serde_json::Value>) -> Result<Self> {
        let mut schemes = HashMap::new();
        for (name, settings) in config {
            let mut auth: Box<dyn Authenticator> = match name.as_str() {
                "token" => Box::new(TokenAuth::default()),
                other => return Err(Error::Config(format!("unknown auth scheme '{}'", other))),
            };
            auth.initialize(settings)?;
            schemes.insert(auth.scheme(), auth);
        }
        Ok(Self { schemes })
    }

    pub fn authenticate(&self, scheme: &str, secret: &str) -> Result<String> {
        let auth = self.schemes.get(scheme).ok_or_else(|| {
            warn!(scheme = %scheme, "Login with unconfigured auth scheme");
            Error::PermissionDenied(format!("auth scheme '{}' not enabled", scheme))
        })?;
        let principal = auth.authenticate(secret)?;
        debug!(scheme = %scheme, principal = %principal, "Authenticated");
        Ok(principal)
    }

    pub fn is_empty(&self) -> bool {
        self.schemes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> AuthRegistry {
        let mut config = BTreeMap::new();
        config.insert(
            "token".to_string(),
            json!({"tokens": {"s3cret": "alice", "hunter2": "bob"}}),
        );
        AuthRegistry::from_config(&config).unwrap()
    }

    #[test]
    fn test_token_login() {
        let auth = registry();
        assert_eq!(auth.authenticate("token", "s3cret").unwrap(), "alice");
        assert_eq!(auth.authenticate("token", "hunter2").unwrap(), "bob");
        assert!(matches!(
            auth.authenticate("token", "wrong"),
            Err(Error::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_unknown_scheme() {
        let auth = registry();
        assert!(matches!(
            auth.authenticate("basic", "alice:pw"),
            Err(Error::PermissionDenied(_))
        ));

        let mut config = BTreeMap::new();
        config.insert("oauth".to_string(), json!({}));
        assert!(matches!(
            AuthRegistry::from_config(&config),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_invalid_principal_rejected() {
        let mut auth = TokenAuth::default();
        assert!(auth.initialize(&json!({"tokens": {"t": "not valid"}})).is_err());
        assert!(auth.initialize(&json!({})).is_err());
    }
}
