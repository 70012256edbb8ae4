//! [`RuleResolver`] backed by the SQLite [`RuleStore`].

use async_trait::async_trait;
use tracing::debug;

use super::store::RuleStore;
use super::{normalize_hostname, redirect_key, Backend, RuleError, RuleResolver};

/// Resolves rules from a [`RuleStore`], mapping stored backends to the
/// configured backend hosts.
#[derive(Clone)]
pub struct StoreResolver {
    store: RuleStore,
    host_a: String,
    host_b: String,
}

impl StoreResolver {
    pub fn new(store: RuleStore, host_a: impl Into<String>, host_b: impl Into<String>) -> Self {
        Self {
            store,
            host_a: host_a.into(),
            host_b: host_b.into(),
        }
    }

    fn host_for(&self, backend: Backend) -> &str {
        match backend {
            Backend::A => &self.host_a,
            Backend::B => &self.host_b,
        }
    }

    /// Run a store call on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, RuleError>
    where
        T: Send + 'static,
        F: FnOnce(RuleStore) -> Result<T, super::StoreError> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(store))
            .await
            .map_err(|e| RuleError::Unavailable(e.to_string()))?
            .map_err(RuleError::from)
    }
}

#[async_trait]
impl RuleResolver for StoreResolver {
    async fn resolve_proxy_target(&self, hostname: &str) -> Result<Option<String>, RuleError> {
        let domain = normalize_hostname(hostname);
        let rule = self
            .blocking(move |store| store.get_proxy_rule(&domain))
            .await?;

        Ok(rule
            .and_then(|rule| rule.backend)
            .map(|backend| self.host_for(backend).to_string()))
    }

    async fn resolve_redirect_target(
        &self,
        hostname: &str,
        path: &str,
    ) -> Result<Option<String>, RuleError> {
        let Some(prefix) = redirect_key(&normalize_hostname(hostname), path) else {
            debug!(hostname, path, "Path does not have redirect prefix shape");
            return Ok(None);
        };

        let rule = self
            .blocking(move |store| store.get_redirect_rule(&prefix))
            .await?;
        Ok(rule.map(|rule| rule.to_url))
    }
}
