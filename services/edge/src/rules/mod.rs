//! Proxy and redirect rules.
//!
//! The dispatch engine only sees rules through [`RuleResolver`]: two
//! read-only lookups that return `Ok(None)` when nothing matches and an
//! error only when the store itself failed.
//!
//! Rule shapes:
//! - proxy rule: `domain -> backend (a | b)`
//! - redirect rule: `{domain}/{category}/{numeric-id} -> URL`

mod resolver;
mod store;

use async_trait::async_trait;
use thiserror::Error;

pub use resolver::StoreResolver;
pub use store::{ProxyRule, RedirectRule, RuleStore, StoreError};

/// Errors from rule lookups.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("rule store error: {0}")]
    Store(#[from] StoreError),

    #[error("rule store unavailable: {0}")]
    Unavailable(String),
}

/// Read-only rule lookups consumed by the dispatch engine.
#[async_trait]
pub trait RuleResolver: Send + Sync {
    /// Backend host a domain has been migrated to, if any.
    async fn resolve_proxy_target(&self, hostname: &str) -> Result<Option<String>, RuleError>;

    /// Redirect destination for `{hostname}{path}`, if any.
    async fn resolve_redirect_target(
        &self,
        hostname: &str,
        path: &str,
    ) -> Result<Option<String>, RuleError>;
}

/// One of the two fixed backends a proxy rule can point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    A,
    B,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::A => "a",
            Self::B => "b",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "a" => Some(Self::A),
            "b" => Some(Self::B),
            _ => None,
        }
    }
}

/// Normalize a hostname for rule matching.
///
/// - Convert to lowercase
/// - Trim trailing dot
pub fn normalize_hostname(hostname: &str) -> String {
    hostname.to_lowercase().trim_end_matches('.').to_string()
}

fn is_domain_char(c: char) -> bool {
    matches!(c, 'a'..='z' | '0'..='9' | '-' | '_' | '.')
}

fn is_category_char(c: char) -> bool {
    matches!(c, 'a'..='z' | '0'..='9' | '-' | '_')
}

/// Rough domain validation: `[a-z0-9._-]+`.
pub fn is_valid_domain(domain: &str) -> bool {
    !domain.is_empty() && domain.chars().all(is_domain_char)
}

/// Whether `prefix` looks like `{domain}/{category}/{numeric-id}`.
pub fn is_valid_redirect_prefix(prefix: &str) -> bool {
    let mut segments = prefix.split('/');
    let (Some(domain), Some(category), Some(id), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return false;
    };

    is_valid_domain(domain)
        && !category.is_empty()
        && category.chars().all(is_category_char)
        && !id.is_empty()
        && id.chars().all(|c| c.is_ascii_digit())
}

/// Redirect lookup key for a request, or `None` when `{hostname}{path}`
/// does not have the redirect prefix shape.
pub fn redirect_key(hostname: &str, path: &str) -> Option<String> {
    let key = format!("{hostname}{path}");
    is_valid_redirect_prefix(&key).then_some(key)
}
