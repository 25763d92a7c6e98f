//! Process-wide server context
//!
//! Built once at startup and shared by `Arc` with the hub, the cluster
//! layer and the session store.

use crate::auth::AuthRegistry;
use crate::config::{LimitsConfig, ServerConfig, TimeoutConfig};
use crate::error::Result;
use crate::push::{self, PushNotifier};
use crate::store::{self, Store};
use crate::validate::ValidatorRegistry;
use std::sync::Arc;
use tracing::info;

pub struct ServerContext {
    pub config: ServerConfig,
    pub store: Arc<dyn Store>,
    pub validators: ValidatorRegistry,
    pub auth: AuthRegistry,
    pub push: Arc<dyn PushNotifier>,
}

impl ServerContext {
    /// Validate the configuration and build every configured backend
    pub fn from_config(config: ServerConfig) -> Result<Arc<Self>> {
        Self::builder(config).build()
    }

    pub fn builder(config: ServerConfig) -> ServerContextBuilder {
        ServerContextBuilder {
            config,
            store: None,
            push: None,
        }
    }

    pub fn timeouts(&self) -> &TimeoutConfig {
        &self.config.timeouts
    }

    pub fn limits(&self) -> &LimitsConfig {
        &self.config.limits
    }
}

/// Builder allowing backends to be supplied directly instead of by name
pub struct ServerContextBuilder {
    config: ServerConfig,
    store: Option<Arc<dyn Store>>,
    push: Option<Arc<dyn PushNotifier>>,
}

impl ServerContextBuilder {
    /// Use this store instead of the configured adapter
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use this push handler instead of the configured one
    pub fn push(mut self, push: Arc<dyn PushNotifier>) -> Self {
        self.push = Some(push);
        self
    }

    pub fn build(self) -> Result<Arc<ServerContext>> {
        self.config.validate()?;

        let store = match self.store {
            Some(store) => store,
            None => store::open(&self.config.store)?,
        };
        let push = match self.push {
            Some(push) => push,
            None => push::open(&self.config.push)?,
        };
        let validators = ValidatorRegistry::from_config(&self.config.validators)?;
        let auth = AuthRegistry::from_config(&self.config.auth)?;

        info!(
            node = %self.config.cluster.this_name,
            store = store.name(),
            push = push.name(),
            validators = ?validators.names(),
            "Server context ready"
        );

        Ok(Arc::new(ServerContext {
            config: self.config,
            store,
            validators,
            auth,
            push,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::store::MemoryStore;

    #[test]
    fn test_default_context() {
        let ctx = ServerContext::from_config(ServerConfig::default()).unwrap();
        assert_eq!(ctx.store.name(), "memory");
        assert_eq!(ctx.push.name(), "none");
        assert!(ctx.auth.is_empty());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = ServerConfig::default();
        config.validators.insert("regex".into(), serde_json::Value::Null);
        assert!(matches!(
            ServerContext::from_config(config),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_injected_store() {
        let store = Arc::new(MemoryStore::new());
        let ctx = ServerContext::builder(ServerConfig::default())
            .store(store.clone())
            .build()
            .unwrap();
        assert!(Arc::ptr_eq(
            &(store as Arc<dyn Store>),
            &ctx.store
        ));
    }
}
