//! Precedence logic for inbound requests.

use std::sync::Arc;

use axum::body::Body;
use axum::http::header::{HOST, LOCATION};
use axum::http::{HeaderValue, Request, Response, StatusCode};
use axum::response::IntoResponse;
use tracing::{debug, error, info};

use super::forwarded::{prepare_forward, split_host_port};
use super::upstream::{Upstream, UpstreamError};
use crate::rules::{RuleError, RuleResolver};

/// Host header suffix of legacy traffic that always goes to backend A.
pub const SPECIAL_PORT_SUFFIX: &str = ":4443";

/// Why a request is being proxied where it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchReason {
    /// Arrived on the special alternate port.
    SpecialPort,
    /// A proxy rule matched the hostname.
    ProxyRule,
    /// Nothing matched.
    Default,
}

/// What to do with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Forward to `target` (`host` or `host:port`) over TLS.
    Proxy {
        target: String,
        reason: DispatchReason,
    },
    /// Answer with a temporary redirect.
    Redirect { location: String },
}

/// Decides and carries out the disposition of every inbound request.
pub struct DispatchEngine {
    host_a: String,
    rules: Arc<dyn RuleResolver>,
    upstream: Arc<dyn Upstream>,
}

impl DispatchEngine {
    pub fn new(
        host_a: impl Into<String>,
        rules: Arc<dyn RuleResolver>,
        upstream: Arc<dyn Upstream>,
    ) -> Self {
        Self {
            host_a: host_a.into(),
            rules,
            upstream,
        }
    }

    /// Decide what to do with a request for `host` (Host header, port
    /// included) and `path`.
    ///
    /// A lookup failure is returned as-is; it never counts as "no rule".
    pub async fn decide(&self, host: &str, path: &str) -> Result<Disposition, RuleError> {
        if host.ends_with(SPECIAL_PORT_SUFFIX) {
            return Ok(Disposition::Proxy {
                target: format!("{}{}", self.host_a, SPECIAL_PORT_SUFFIX),
                reason: DispatchReason::SpecialPort,
            });
        }

        let (hostname, _) = split_host_port(host);

        if let Some(target) = self.rules.resolve_proxy_target(hostname).await? {
            return Ok(Disposition::Proxy {
                target,
                reason: DispatchReason::ProxyRule,
            });
        }

        if let Some(location) = self.rules.resolve_redirect_target(hostname, path).await? {
            return Ok(Disposition::Redirect { location });
        }

        Ok(Disposition::Proxy {
            target: self.host_a.clone(),
            reason: DispatchReason::Default,
        })
    }

    /// Handle one inbound request end to end.
    pub async fn handle(&self, request: Request<Body>) -> Response<Body> {
        let host = request_host(&request);
        info!(
            method = %request.method(),
            host = %host,
            uri = %request.uri(),
            "Request"
        );

        let disposition = match self.decide(&host, request.uri().path()).await {
            Ok(disposition) => disposition,
            Err(e) => {
                error!(host = %host, error = %e, "Rule lookup failed");
                return (StatusCode::INTERNAL_SERVER_ERROR, "Proxy error").into_response();
            }
        };

        match disposition {
            Disposition::Redirect { location } => {
                debug!(host = %host, location = %location, "Redirect rule matched");
                redirect(&location)
            }
            Disposition::Proxy { target, reason } => {
                debug!(host = %host, target = %target, reason = ?reason, "Proxying");
                self.proxy(request, &target, &host).await
            }
        }
    }

    async fn proxy(&self, request: Request<Body>, target: &str, host: &str) -> Response<Body> {
        let result = match prepare_forward(request, target, host) {
            Ok(outbound) => self.upstream.forward(outbound).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(response) => response,
            Err(UpstreamError::ClientCancelled) => {
                debug!(target = %target, "Client cancelled proxied request");
                bad_gateway()
            }
            Err(e) => {
                error!(target = %target, error = %e, "Proxy error");
                bad_gateway()
            }
        }
    }
}

/// Host the client asked for: the Host header, or the URI authority for
/// HTTP/2 requests that carry none.
fn request_host(request: &Request<Body>) -> String {
    request
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| request.uri().authority().map(|a| a.to_string()))
        .unwrap_or_default()
}

fn redirect(location: &str) -> Response<Body> {
    match HeaderValue::from_str(location) {
        Ok(value) => {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::TEMPORARY_REDIRECT;
            response.headers_mut().insert(LOCATION, value);
            response
        }
        Err(e) => {
            error!(location = %location, error = %e, "Stored redirect URL is not a valid header");
            (StatusCode::INTERNAL_SERVER_ERROR, "Proxy error").into_response()
        }
    }
}

fn bad_gateway() -> Response<Body> {
    StatusCode::BAD_GATEWAY.into_response()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use axum::body::to_bytes;
    use rstest::rstest;

    use super::*;
    use crate::dispatch::X_FORWARDED_HOST;

    #[derive(Default)]
    struct FakeRules {
        proxy: HashMap<String, String>,
        redirect: HashMap<String, String>,
        fail: bool,
        lookups: AtomicUsize,
    }

    impl FakeRules {
        fn with_proxy(mut self, hostname: &str, target: &str) -> Self {
            self.proxy.insert(hostname.to_string(), target.to_string());
            self
        }

        fn with_redirect(mut self, key: &str, location: &str) -> Self {
            self.redirect.insert(key.to_string(), location.to_string());
            self
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl RuleResolver for FakeRules {
        async fn resolve_proxy_target(&self, hostname: &str) -> Result<Option<String>, RuleError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(RuleError::Unavailable("store offline".to_string()));
            }
            Ok(self.proxy.get(hostname).cloned())
        }

        async fn resolve_redirect_target(
            &self,
            hostname: &str,
            path: &str,
        ) -> Result<Option<String>, RuleError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(RuleError::Unavailable("store offline".to_string()));
            }
            Ok(self.redirect.get(&format!("{hostname}{path}")).cloned())
        }
    }

    /// Records forwarded requests and answers 200.
    #[derive(Default)]
    struct RecordingUpstream {
        seen: Mutex<Vec<Request<Body>>>,
        fail_with_cancel: bool,
    }

    impl RecordingUpstream {
        fn forwarded(&self) -> Vec<(String, Option<String>)> {
            self.seen
                .lock()
                .unwrap()
                .iter()
                .map(|r| {
                    let forwarded_host = r
                        .headers()
                        .get(X_FORWARDED_HOST)
                        .map(|v| v.to_str().unwrap().to_string());
                    (r.uri().to_string(), forwarded_host)
                })
                .collect()
        }
    }

    #[async_trait]
    impl Upstream for RecordingUpstream {
        async fn forward(&self, request: Request<Body>) -> Result<Response<Body>, UpstreamError> {
            self.seen.lock().unwrap().push(request);
            if self.fail_with_cancel {
                return Err(UpstreamError::ClientCancelled);
            }
            Ok(Response::new(Body::from("backend")))
        }
    }

    fn engine(rules: FakeRules) -> (DispatchEngine, Arc<FakeRules>, Arc<RecordingUpstream>) {
        let rules = Arc::new(rules);
        let upstream = Arc::new(RecordingUpstream::default());
        let engine = DispatchEngine::new(
            "a.internal",
            Arc::clone(&rules) as Arc<dyn RuleResolver>,
            Arc::clone(&upstream) as Arc<dyn Upstream>,
        );
        (engine, rules, upstream)
    }

    fn get(host: &str, path: &str) -> Request<Body> {
        Request::builder()
            .uri(path)
            .header(HOST, host)
            .body(Body::empty())
            .unwrap()
    }

    fn all_rules() -> FakeRules {
        FakeRules::default()
            .with_proxy("example.com", "b.internal")
            .with_redirect("example.com/blog/42", "https://new.example.com/post/42")
    }

    #[rstest]
    #[case::special_port_beats_rules(
        all_rules(),
        "example.com:4443",
        "/blog/42",
        Disposition::Proxy { target: "a.internal:4443".into(), reason: DispatchReason::SpecialPort }
    )]
    #[case::proxy_rule_beats_redirect(
        all_rules(),
        "example.com",
        "/blog/42",
        Disposition::Proxy { target: "b.internal".into(), reason: DispatchReason::ProxyRule }
    )]
    #[case::proxy_rule_ignores_port(
        all_rules(),
        "example.com:8080",
        "/",
        Disposition::Proxy { target: "b.internal".into(), reason: DispatchReason::ProxyRule }
    )]
    #[case::redirect_rule(
        FakeRules::default().with_redirect("example.com/blog/42", "https://new.example.com/post/42"),
        "example.com",
        "/blog/42",
        Disposition::Redirect { location: "https://new.example.com/post/42".into() }
    )]
    #[case::default_backend(
        FakeRules::default(),
        "example.com",
        "/",
        Disposition::Proxy { target: "a.internal".into(), reason: DispatchReason::Default }
    )]
    #[tokio::test]
    async fn test_precedence(
        #[case] rules: FakeRules,
        #[case] host: &str,
        #[case] path: &str,
        #[case] expected: Disposition,
    ) {
        let (engine, _, _) = engine(rules);
        assert_eq!(engine.decide(host, path).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_special_port_skips_lookups() {
        let (engine, rules, _) = engine(FakeRules::failing());
        let disposition = engine.decide("example.com:4443", "/").await.unwrap();
        assert!(matches!(
            disposition,
            Disposition::Proxy {
                reason: DispatchReason::SpecialPort,
                ..
            }
        ));
        assert_eq!(rules.lookups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_default_forwards_to_host_a() {
        let (engine, _, upstream) = engine(FakeRules::default());
        let response = engine.handle(get("example.com", "/")).await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"backend");
        assert_eq!(
            upstream.forwarded(),
            vec![(
                "https://a.internal/".to_string(),
                Some("example.com".to_string())
            )]
        );
    }

    #[tokio::test]
    async fn test_proxy_rule_forwards_to_rule_target() {
        let (engine, _, upstream) = engine(all_rules());
        engine.handle(get("example.com", "/posts?id=3")).await;

        assert_eq!(
            upstream.forwarded(),
            vec![(
                "https://b.internal/posts?id=3".to_string(),
                Some("example.com".to_string())
            )]
        );
    }

    #[tokio::test]
    async fn test_special_port_forwards_to_host_a_same_port() {
        let (engine, _, upstream) = engine(all_rules());
        engine.handle(get("example.com:4443", "/blog/42")).await;

        assert_eq!(
            upstream.forwarded(),
            vec![(
                "https://a.internal:4443/blog/42".to_string(),
                Some("example.com:4443".to_string())
            )]
        );
    }

    #[tokio::test]
    async fn test_redirect_is_not_forwarded() {
        let rules = FakeRules::default()
            .with_redirect("example.com/blog/42", "https://new.example.com/post/42");
        let (engine, _, upstream) = engine(rules);

        let response = engine.handle(get("example.com", "/blog/42")).await;

        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(
            response.headers()[LOCATION],
            "https://new.example.com/post/42"
        );
        assert!(upstream.forwarded().is_empty());
    }

    #[tokio::test]
    async fn test_lookup_failure_is_500_and_not_forwarded() {
        let (engine, _, upstream) = engine(FakeRules::failing());

        let response = engine.handle(get("example.com", "/")).await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"Proxy error");
        assert!(upstream.forwarded().is_empty());
    }

    #[tokio::test]
    async fn test_upstream_failure_is_502() {
        let upstream = Arc::new(RecordingUpstream {
            fail_with_cancel: true,
            ..RecordingUpstream::default()
        });
        let engine = DispatchEngine::new(
            "a.internal",
            Arc::new(FakeRules::default()),
            Arc::clone(&upstream) as Arc<dyn Upstream>,
        );

        let response = engine.handle(get("example.com", "/")).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_request_host_falls_back_to_authority() {
        let request = Request::builder()
            .uri("https://example.com:8443/x")
            .body(Body::empty())
            .unwrap();
        assert_eq!(request_host(&request), "example.com:8443");
    }
}
