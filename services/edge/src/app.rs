//! HTTP routing table.
//!
//! Built once at startup. Paths are matched by prefix, first match wins:
//!
//! ```text
//! /goproxy/proxy-rules*     -> admin::proxy_rules
//! /goproxy/redirect-rules*  -> admin::redirect_rules
//! /goproxy*                 -> admin::stats
//! anything else             -> DispatchEngine
//! ```

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::request::Parts,
    response::{IntoResponse, Response},
    routing::any,
    Router,
};

use crate::admin;
use crate::dispatch::DispatchEngine;
use crate::rules::RuleStore;
use crate::stats::ConnectionCounter;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<DispatchEngine>,
    pub store: RuleStore,
    pub counter: Arc<ConnectionCounter>,
    pub api_key: Arc<str>,
}

pub const PROXY_RULES_PATH: &str = "/goproxy/proxy-rules";
pub const REDIRECT_RULES_PATH: &str = "/goproxy/redirect-rules";
pub const TELEMETRY_PATH: &str = "/goproxy";

/// Handler selected for a request path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    ProxyRules,
    RedirectRules,
    Telemetry,
    Dispatch,
}

impl Route {
    pub fn for_path(path: &str) -> Self {
        if path.starts_with(PROXY_RULES_PATH) {
            Self::ProxyRules
        } else if path.starts_with(REDIRECT_RULES_PATH) {
            Self::RedirectRules
        } else if path.starts_with(TELEMETRY_PATH) {
            Self::Telemetry
        } else {
            Self::Dispatch
        }
    }
}

/// Build the router.
///
/// The canonical admin paths are registered directly; every other path,
/// including prefix matches such as `/goproxy/proxy-rules/` or
/// `/goproxy-status`, is classified by [`Route::for_path`] in the fallback.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(PROXY_RULES_PATH, any(admin::proxy_rules))
        .route(REDIRECT_RULES_PATH, any(admin::redirect_rules))
        .route(TELEMETRY_PATH, any(admin::stats))
        .fallback(fallback)
        .with_state(state)
}

async fn fallback(State(state): State<AppState>, request: Request) -> Response {
    match Route::for_path(request.uri().path()) {
        Route::ProxyRules => {
            let Parts {
                method,
                headers,
                uri,
                ..
            } = request.into_parts().0;
            admin::proxy_rules(State(state), method, headers, uri)
                .await
                .into_response()
        }
        Route::RedirectRules => {
            let Parts {
                method,
                headers,
                uri,
                ..
            } = request.into_parts().0;
            admin::redirect_rules(State(state), method, headers, uri)
                .await
                .into_response()
        }
        Route::Telemetry => admin::stats(State(state)).await.into_response(),
        Route::Dispatch => state.engine.handle(request).await,
    }
}
