//! Tower middleware turning limiter decisions into HTTP outcomes.
//!
//! Per request: extract the client key, reject with 400 if there is none
//! (before any store access), otherwise ask the limiter. A store failure
//! becomes a 500, a denial a 429, and an admission is passed to the inner
//! service. The `X-RateLimit-*` headers go on every decided response.

use crate::error::{AdmissionError, StoreError};
use crate::rate_limit::{ClientKey, Decision, RateLimiter};
use http::header::{HeaderName, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, Request, Response, StatusCode};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Transport-level peer address, inserted into request extensions by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr(pub SocketAddr);

/// Derive the client key: first `X-Forwarded-For` hop, else the peer IP.
pub fn client_key<B>(req: &Request<B>) -> Option<ClientKey> {
    let forwarded = req
        .headers()
        .get(X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(ClientKey::new);

    forwarded.or_else(|| {
        req.extensions().get::<PeerAddr>().and_then(|peer| ClientKey::new(peer.0.ip().to_string()))
    })
}

/// Write `X-RateLimit-Limit`, `X-RateLimit-Remaining` and `X-RateLimit-Reset`.
pub fn apply_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(decision.reset_seconds));
}

/// Terminal outcome of one admission check.
#[derive(Debug)]
pub enum Verdict {
    /// Hand the request to the inner service.
    Continue(Decision),
    /// Answer without calling the inner service.
    Reject(Rejection),
}

/// Why a request was answered by the middleware itself.
#[derive(Debug)]
pub enum Rejection {
    /// No client key could be derived (400).
    ClientIdentityMissing,
    /// The limiter denied the request (429).
    RateLimited(Decision),
    /// The store failed; neither admitted nor denied (500).
    StoreUnavailable(StoreError),
}

impl From<AdmissionError> for Rejection {
    fn from(err: AdmissionError) -> Self {
        match err {
            AdmissionError::ClientIdentityMissing => Rejection::ClientIdentityMissing,
            AdmissionError::Store(e) => Rejection::StoreUnavailable(e),
        }
    }
}

impl Rejection {
    pub fn status(&self) -> StatusCode {
        match self {
            Rejection::ClientIdentityMissing => StatusCode::BAD_REQUEST,
            Rejection::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Rejection::StoreUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Human-readable message placed in the JSON body.
    pub fn message(&self) -> String {
        match self {
            Rejection::ClientIdentityMissing => "Client identity is required".to_string(),
            Rejection::RateLimited(_) => "Too Many Requests".to_string(),
            Rejection::StoreUnavailable(e) => format!("Internal Server Error: {}", e),
        }
    }

    /// Render as `{"message": ...}` with the matching status.
    pub fn into_response<B: From<String>>(self) -> Response<B> {
        let body = serde_json::json!({ "message": self.message() }).to_string();
        let mut res = Response::new(B::from(body));
        *res.status_mut() = self.status();
        res.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Rejection::RateLimited(decision) = &self {
            apply_headers(res.headers_mut(), decision);
        }
        res
    }
}

async fn decide<L>(limiter: &L, client: Option<&ClientKey>) -> Result<Decision, AdmissionError>
where
    L: RateLimiter + ?Sized,
{
    let client = client.ok_or(AdmissionError::ClientIdentityMissing)?;
    limiter.check(client).await.map_err(|e| {
        tracing::error!(client = %client, error = %e, "rate limiter error");
        AdmissionError::Store(e)
    })
}

/// Run the admission state machine for one request without any HTTP plumbing.
pub async fn evaluate<L>(limiter: &L, client: Option<&ClientKey>) -> Verdict
where
    L: RateLimiter + ?Sized,
{
    match decide(limiter, client).await {
        Ok(decision) if decision.is_allowed() => Verdict::Continue(decision),
        Ok(decision) => Verdict::Reject(Rejection::RateLimited(decision)),
        Err(err) => Verdict::Reject(err.into()),
    }
}

/// A layer that enforces admission control using a [`RateLimiter`].
#[derive(Debug)]
pub struct AdmissionLayer<L: ?Sized> {
    limiter: Arc<L>,
}

impl<L: ?Sized> Clone for AdmissionLayer<L> {
    fn clone(&self) -> Self {
        Self { limiter: self.limiter.clone() }
    }
}

impl<L> AdmissionLayer<L> {
    /// Create a new admission layer.
    pub fn new(limiter: L) -> Self {
        Self { limiter: Arc::new(limiter) }
    }
}

impl<L: ?Sized> AdmissionLayer<L> {
    /// Share an existing limiter, e.g. an `Arc<dyn RateLimiter>` chosen at startup.
    pub fn from_arc(limiter: Arc<L>) -> Self {
        Self { limiter }
    }
}

impl<S, L> Layer<S> for AdmissionLayer<L>
where
    L: RateLimiter + ?Sized + 'static,
{
    type Service = AdmissionService<S, L>;

    fn layer(&self, service: S) -> Self::Service {
        AdmissionService { inner: service, limiter: self.limiter.clone() }
    }
}

/// Middleware service that enforces admission control.
#[derive(Debug)]
pub struct AdmissionService<S, L: ?Sized> {
    inner: S,
    limiter: Arc<L>,
}

impl<S: Clone, L: ?Sized> Clone for AdmissionService<S, L> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), limiter: self.limiter.clone() }
    }
}

impl<S, L, ReqBody, ResBody> Service<Request<ReqBody>> for AdmissionService<S, L>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    L: RateLimiter + ?Sized + 'static,
    ReqBody: Send + 'static,
    ResBody: From<String> + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let limiter = self.limiter.clone();
        // Take the service that was driven to readiness, leave a clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let client = client_key(&req);

        Box::pin(async move {
            match evaluate(&*limiter, client.as_ref()).await {
                Verdict::Continue(decision) => inner.call(req).await.map(|mut res| {
                    apply_headers(res.headers_mut(), &decision);
                    res
                }),
                Verdict::Reject(rejection) => Ok(rejection.into_response()),
            }
        })
    }
}
