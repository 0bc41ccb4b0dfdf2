//! HTTP admission middleware for axum.
//!
//! Classifies each request, resolves the caller, asks the engine for a
//! decision and either rejects with `429 Too Many Requests` or runs the inner
//! service and attaches admission headers. Once the response is ready, a
//! request admitted through the shared store reports completion to the
//! engine on a spawned task.
//!
//! ## Response Headers
//!
//! Every checked request gets:
//! - `X-RateLimit-Limit` with the per-minute limit
//! - `X-RateLimit-Remaining` with the remaining quota
//! - `X-RateLimit-Reset` with the unix second the next minute window opens
//! - `X-RateLimit-Category` with the request category
//!
//! Rejections also carry `Retry-After` and `X-RateLimit-Queue-Depth`.
//!
//! ## Example
//!
//! ```no_run
//! use admission_gate::infrastructure::interceptor::{
//!     accounting_summary, admission_middleware, AdmissionState,
//! };
//! use admission_gate::AdmissionEngine;
//! use axum::{middleware, routing::get, Router};
//! use std::net::SocketAddr;
//! use std::sync::Arc;
//!
//! # async fn run() {
//! let engine = Arc::new(AdmissionEngine::builder().build().unwrap());
//! let state = Arc::new(AdmissionState::new(engine));
//!
//! let app = Router::new()
//!     .route("/documents", get(|| async { "ok" }))
//!     .route("/metrics/admission", get(accounting_summary))
//!     .layer(middleware::from_fn_with_state(state.clone(), admission_middleware))
//!     .with_state(state);
//!
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
//! axum::serve(
//!     listener,
//!     app.into_make_service_with_connect_info::<SocketAddr>(),
//! )
//! .await
//! .unwrap();
//! # }
//! ```

use crate::application::accounting::AccountingSummary;
use crate::application::engine::AdmissionEngine;
use crate::domain::category::Category;
use crate::domain::decision::Decision;
use crate::domain::identity::{CallerIdentity, ANONYMOUS_ORG};
use crate::infrastructure::classifier::RequestClassifier;
use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::header::{HeaderName, InvalidHeaderValue, RETRY_AFTER};
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::fmt::Display;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

pub const ERROR_CODE: &str = "RATE_LIMIT_EXCEEDED";

const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
const X_RATELIMIT_CATEGORY: HeaderName = HeaderName::from_static("x-ratelimit-category");
const X_RATELIMIT_QUEUE_DEPTH: HeaderName = HeaderName::from_static("x-ratelimit-queue-depth");

/// Failure inside the interceptor itself. Never rejects a request.
#[derive(Debug, thiserror::Error)]
pub enum InterceptError {
    #[error("invalid value for header {name}: {source}")]
    Header {
        name: HeaderName,
        #[source]
        source: InvalidHeaderValue,
    },
}

/// Shared state of the admission middleware.
#[derive(Debug, Clone)]
pub struct AdmissionState {
    engine: Arc<AdmissionEngine>,
    classifier: RequestClassifier,
    anonymous_org: String,
}

impl AdmissionState {
    pub fn new(engine: Arc<AdmissionEngine>) -> Self {
        Self {
            engine,
            classifier: RequestClassifier::new(),
            anonymous_org: ANONYMOUS_ORG.to_string(),
        }
    }

    pub fn with_classifier(mut self, classifier: RequestClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Organization that unauthenticated callers are bucketed under.
    pub fn with_anonymous_org(mut self, org: impl Into<String>) -> Self {
        self.anonymous_org = org.into();
        self
    }

    pub fn engine(&self) -> &Arc<AdmissionEngine> {
        &self.engine
    }
}

/// Admission middleware; install with `axum::middleware::from_fn_with_state`.
pub async fn admission_middleware(
    State(state): State<Arc<AdmissionState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let path = req.uri().path().to_string();
    if state.classifier.is_exempt(&path) {
        return next.run(req).await;
    }

    let category = state.classifier.classify(req.method().as_str(), &path);
    let Some(identity) = resolve_identity(&req, &state.anonymous_org) else {
        tracing::warn!(
            path = %path,
            category = %category,
            "Caller identity unresolved, admitting without admission check"
        );
        state.engine.accounting().record_bypass();
        return next.run(req).await;
    };

    let decision = state.engine.check(&identity, category).await;

    if decision.is_denied() {
        tracing::warn!(
            user_id = %identity.user_id,
            org_id = %identity.org_id,
            category = %category,
            path = %path,
            retry_after = decision.retry_after,
            "Request rejected by admission control"
        );
        return match rejection(&decision, category, &path) {
            Ok(response) => response,
            Err(err) => {
                tracing::error!(
                    error = %err,
                    path = %path,
                    "Failed to build rejection, admitting request"
                );
                next.run(req).await
            }
        };
    }

    let mut response = next.run(req).await;
    if let Err(err) = add_admission_headers(response.headers_mut(), &decision, category) {
        tracing::warn!(error = %err, path = %path, "Failed to attach admission headers");
    }

    // Fallback admissions pushed no marker and must not pop someone else's.
    if decision.holds_marker() {
        let engine = Arc::clone(&state.engine);
        tokio::spawn(async move {
            engine.complete(&identity, category).await;
        });
    }

    response
}

/// Serve the engine's accounting summary as JSON.
pub async fn accounting_summary(
    State(state): State<Arc<AdmissionState>>,
) -> Json<AccountingSummary> {
    Json(state.engine.accounting().summary())
}

/// Authenticated identity if one was attached, else the peer address
/// (falling back to forwarding headers) under the anonymous organization.
fn resolve_identity(req: &Request<Body>, anonymous_org: &str) -> Option<CallerIdentity> {
    if let Some(identity) = req.extensions().get::<CallerIdentity>() {
        return Some(identity.clone());
    }
    let addr = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(peer)| peer.ip())
        .or_else(|| forwarded_ip(req.headers()))?;
    Some(CallerIdentity::anonymous(addr, anonymous_org))
}

fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    let first_hop = |name: &str| -> Option<IpAddr> {
        headers
            .get(name)?
            .to_str()
            .ok()?
            .split(',')
            .next()?
            .trim()
            .parse()
            .ok()
    };
    first_hop("x-forwarded-for").or_else(|| first_hop("x-real-ip"))
}

fn insert_header(
    headers: &mut HeaderMap,
    name: HeaderName,
    value: impl Display,
) -> Result<(), InterceptError> {
    let value = HeaderValue::from_str(&value.to_string()).map_err(|source| {
        InterceptError::Header {
            name: name.clone(),
            source,
        }
    })?;
    headers.insert(name, value);
    Ok(())
}

fn add_admission_headers(
    headers: &mut HeaderMap,
    decision: &Decision,
    category: Category,
) -> Result<(), InterceptError> {
    insert_header(headers, X_RATELIMIT_LIMIT, decision.limit)?;
    insert_header(headers, X_RATELIMIT_REMAINING, decision.requests_remaining)?;
    insert_header(headers, X_RATELIMIT_RESET, decision.reset_time)?;
    insert_header(headers, X_RATELIMIT_CATEGORY, category)
}

fn rejection(
    decision: &Decision,
    category: Category,
    path: &str,
) -> Result<Response, InterceptError> {
    let retry_after = decision.retry_after.unwrap_or(1);
    let body = serde_json::json!({
        "detail": format!(
            "Rate limit exceeded for {category} requests. Retry after {retry_after} seconds."
        ),
        "error_code": ERROR_CODE,
        "retry_after": retry_after,
        "category": category,
        "path": path,
    });

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    let headers = response.headers_mut();
    add_admission_headers(headers, decision, category)?;
    insert_header(headers, RETRY_AFTER, retry_after)?;
    insert_header(headers, X_RATELIMIT_QUEUE_DEPTH, decision.queue_depth)?;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forwarded_ip_takes_first_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7, 10.0.0.1"));
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.2"));
        assert_eq!(forwarded_ip(&headers), Some("203.0.113.7".parse().unwrap()));

        headers.remove("x-forwarded-for");
        assert_eq!(forwarded_ip(&headers), Some("198.51.100.2".parse().unwrap()));

        headers.insert("x-real-ip", HeaderValue::from_static("not-an-ip"));
        assert_eq!(forwarded_ip(&headers), None);
    }

    #[test]
    fn test_peer_address_wins_over_headers() {
        let mut req = Request::builder()
            .uri("/documents")
            .header("x-forwarded-for", "203.0.113.7")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([192, 0, 2, 1], 4321))));

        let identity = resolve_identity(&req, "anonymous").unwrap();
        assert_eq!(identity.user_id, "ip:192.0.2.1");
        assert_eq!(identity.org_id, "anonymous");
        assert!(!identity.is_premium);
    }

    #[test]
    fn test_authenticated_identity_wins() {
        let mut req = Request::builder()
            .uri("/documents")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut()
            .insert(CallerIdentity::new("u1", "acme", true));
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([192, 0, 2, 1], 4321))));

        let identity = resolve_identity(&req, "anonymous").unwrap();
        assert_eq!(identity, CallerIdentity::new("u1", "acme", true));
    }

    #[test]
    fn test_unresolvable_identity() {
        let req = Request::builder()
            .uri("/documents")
            .body(Body::empty())
            .unwrap();
        assert!(resolve_identity(&req, "anonymous").is_none());
    }
}
