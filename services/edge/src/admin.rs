//! Rule administration endpoints and connection telemetry.
//!
//! ```text
//! POST|DELETE /goproxy/proxy-rules?domain=example.com&backend=a|b
//! POST|DELETE /goproxy/redirect-rules?prefix=example.com/blog/42&to-url=https://...
//! GET         /goproxy            -> "Connections <n>"
//! ```
//!
//! Rule endpoints require the API key in the `Authorization` header.

use axum::{
    extract::{Query, State},
    http::{header::AUTHORIZATION, header::CONTENT_TYPE, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};

use crate::app::AppState;
use crate::rules::{is_valid_domain, is_valid_redirect_prefix, Backend, RuleStore, StoreError};

#[derive(Debug, Serialize)]
struct Message {
    message: String,
}

/// Admin API error, rendered as `{"message": ...}`.
#[derive(Debug)]
pub struct AdminError {
    status: StatusCode,
    message: String,
}

impl AdminError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn forbidden() -> Self {
        Self::new(StatusCode::FORBIDDEN, "Invalid Authorization header.")
    }

    pub fn method_not_allowed() -> Self {
        Self::new(StatusCode::METHOD_NOT_ALLOWED, "Unsupported HTTP method.")
    }

    pub fn internal() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "An unknown error occurred.")
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(Message {
                message: self.message,
            }),
        )
            .into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ProxyRuleParams {
    pub domain: Option<String>,
    pub backend: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RedirectRuleParams {
    pub prefix: Option<String>,
    #[serde(rename = "to-url")]
    pub to_url: Option<String>,
}

/// Mutation requested by an admin call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Upsert,
    Delete,
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), AdminError> {
    let presented = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if presented == state.api_key.as_ref() {
        Ok(())
    } else {
        Err(AdminError::forbidden())
    }
}

fn change_for(method: &Method) -> Result<Change, AdminError> {
    match *method {
        Method::POST => Ok(Change::Upsert),
        Method::DELETE => Ok(Change::Delete),
        _ => Err(AdminError::method_not_allowed()),
    }
}

fn params<T: serde::de::DeserializeOwned>(uri: &Uri) -> Result<T, AdminError> {
    Query::try_from_uri(uri)
        .map(|Query(params)| params)
        .map_err(|e| AdminError::bad_request(format!("Invalid query string: {e}")))
}

/// Whether `url` is an absolute URL or an absolute path.
fn is_valid_redirect_url(url: &str) -> bool {
    if url.starts_with('/') {
        return !url.starts_with("//");
    }
    reqwest::Url::parse(url).is_ok_and(|u| !u.cannot_be_a_base())
}

async fn write<F>(store: &RuleStore, f: F) -> Result<(), AdminError>
where
    F: FnOnce(RuleStore) -> Result<(), StoreError> + Send + 'static,
{
    let store = store.clone();
    match tokio::task::spawn_blocking(move || f(store)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!(error = %e, "Rule store write failed");
            Err(AdminError::internal())
        }
        Err(e) => {
            error!(error = %e, "Rule store write task failed");
            Err(AdminError::internal())
        }
    }
}

fn ok() -> Response {
    Json(json!({})).into_response()
}

/// Add or remove a proxy rule.
pub async fn proxy_rules(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    uri: Uri,
) -> Result<Response, AdminError> {
    authorize(&state, &headers)?;
    let change = change_for(&method)?;
    let params: ProxyRuleParams = params(&uri)?;

    let domain = params.domain.unwrap_or_default();
    if !is_valid_domain(&domain) {
        return Err(AdminError::bad_request("Query param domain is required"));
    }

    match change {
        Change::Upsert => {
            let backend = params
                .backend
                .as_deref()
                .and_then(Backend::parse)
                .ok_or_else(|| AdminError::bad_request("Query param backend must be a or b"))?;
            info!(domain = %domain, backend = backend.as_str(), "Setting proxy rule");
            write(&state.store, move |store| store.upsert_proxy_rule(&domain, backend)).await?;
        }
        Change::Delete => {
            info!(domain = %domain, "Removing proxy rule");
            write(&state.store, move |store| {
                store.delete_proxy_rule(&domain).map(|_| ())
            })
            .await?;
        }
    }

    Ok(ok())
}

/// Add or remove a redirect rule.
pub async fn redirect_rules(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    uri: Uri,
) -> Result<Response, AdminError> {
    authorize(&state, &headers)?;
    let change = change_for(&method)?;
    let params: RedirectRuleParams = params(&uri)?;

    let to_url = params.to_url.unwrap_or_default();
    if change == Change::Upsert && !is_valid_redirect_url(&to_url) {
        return Err(AdminError::bad_request("Invalid to-url"));
    }

    let prefix = params.prefix.unwrap_or_default();
    if !is_valid_redirect_prefix(&prefix) {
        return Err(AdminError::bad_request(
            "Prefix must look like {domain}/{type}/{number}",
        ));
    }

    match change {
        Change::Upsert => {
            info!(prefix = %prefix, to_url = %to_url, "Setting redirect rule");
            write(&state.store, move |store| {
                store.upsert_redirect_rule(&prefix, &to_url)
            })
            .await?;
        }
        Change::Delete => {
            info!(prefix = %prefix, "Removing redirect rule");
            write(&state.store, move |store| {
                store.delete_redirect_rule(&prefix).map(|_| ())
            })
            .await?;
        }
    }

    Ok(ok())
}

/// Current tunneled connection count, unauthenticated.
pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.counter.render(),
    )
}
