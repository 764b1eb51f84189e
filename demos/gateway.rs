//! Admission control in front of a tower service.
//!
//! Run with `cargo run --example gateway -- token-bucket` (or `fixed-window`).
//! Requests are simulated in-process; wire `AdmissionLayer` into any
//! tower-compatible server the same way.

use http::{Request, Response};
use std::convert::Infallible;
use std::sync::Arc;
use tollgate::prelude::*;
use tower::{service_fn, ServiceBuilder, ServiceExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();

    let store = InMemoryStore::new();
    let limiter: Arc<dyn RateLimiter> = match std::env::args().nth(1).as_deref() {
        Some("fixed-window") => Arc::new(FixedWindow::new(
            store,
            FixedWindowConfig::new(3, 10 * 1000)?.with_debug(true),
        )?),
        _ => Arc::new(TokenBucket::new(
            store,
            TokenBucketConfig::new(3, 1.0, 60 * 1000)?.with_debug(true),
        )?),
    };

    let svc = ServiceBuilder::new().layer(AdmissionLayer::from_arc(limiter)).service(service_fn(
        |_req: Request<String>| async {
            Ok::<_, Infallible>(Response::new("Hello from tollgate!".to_string()))
        },
    ));

    for i in 1..=5 {
        let req = Request::builder().header("x-forwarded-for", "203.0.113.50").body(String::new())?;
        let res = svc.clone().oneshot(req).await?;
        println!(
            "request {}: {} remaining={:?} body={}",
            i,
            res.status(),
            res.headers().get("x-ratelimit-remaining"),
            res.body()
        );
    }

    Ok(())
}
