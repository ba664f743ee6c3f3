//! Tower middleware that gates requests through a [`LimiterRegistry`].

use std::net::SocketAddr;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use http::{Request, StatusCode};
use tower::{Layer, Service};
use tracing::warn;

use super::client_key::client_key;
use crate::ratelimit::LimiterRegistry;

/// Key used for requests that carry no client signal at all.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Layer that rejects requests with `429 Too Many Requests` once the
/// client's bucket is empty.
#[derive(Clone)]
pub struct RateLimitLayer {
    registry: LimiterRegistry,
}

impl RateLimitLayer {
    /// Create a layer backed by `registry`.
    pub fn new(registry: LimiterRegistry) -> Self {
        Self { registry }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            registry: self.registry.clone(),
        }
    }
}

/// Service produced by [`RateLimitLayer`].
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    registry: LimiterRegistry,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ci| ci.0);
        let key = client_key(request.headers(), peer)
            .unwrap_or_else(|| UNKNOWN_CLIENT.to_string());

        if !self.registry.check(key.as_str()) {
            warn!(
                key = %key,
                path = %request.uri().path(),
                "Rejecting request over rate limit"
            );
            return Box::pin(async { Ok(too_many_requests()) });
        }

        // Call the instance that was driven to readiness and leave a fresh
        // clone behind for the next request.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(async move { inner.call(request).await })
    }
}

fn too_many_requests() -> Response {
    (StatusCode::TOO_MANY_REQUESTS, "Too Many Requests").into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimiterConfig;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    fn app(capacity: u32) -> (Router, LimiterRegistry) {
        let registry = LimiterRegistry::new(LimiterConfig {
            rate: 0.001,
            capacity,
            sweep_interval_secs: 60,
            idle_threshold_secs: 180,
        })
        .unwrap();

        let router = Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(RateLimitLayer::new(registry.clone()));

        (router, registry)
    }

    fn request_from(ip: &str) -> Request<Body> {
        Request::builder()
            .uri("/")
            .header("x-forwarded-for", ip)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_admits_within_burst_then_rejects() {
        let (app, _registry) = app(2);

        for _ in 0..2 {
            let response = app.clone().oneshot(request_from("203.0.113.5")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app.clone().oneshot(request_from("203.0.113.5")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"Too Many Requests");
    }

    #[tokio::test]
    async fn test_clients_limited_independently() {
        let (app, registry) = app(1);

        let response = app.clone().oneshot(request_from("203.0.113.5")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app.clone().oneshot(request_from("203.0.113.5")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let response = app.clone().oneshot(request_from("198.51.100.7")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_connect_info_used_without_headers() {
        let (app, registry) = app(1);

        let mut request = Request::builder().uri("/").body(Body::empty()).unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo::<SocketAddr>("192.0.2.10:40000".parse().unwrap()));

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(registry.contains("192.0.2.10"));
    }

    #[tokio::test]
    async fn test_requests_without_signal_share_unknown_key() {
        let (app, registry) = app(1);

        let request = || Request::builder().uri("/").body(Body::empty()).unwrap();

        let response = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        assert!(registry.contains(UNKNOWN_CLIENT));
    }
}
