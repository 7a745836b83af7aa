//! Liveness and readiness endpoints, served separately from the main proxy
//! so probes keep answering while it drains.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::net::TcpListener;

use crate::error::ProxyError;

pub fn router(ready: Arc<AtomicBool>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(ready)
}

pub async fn serve(port: u16, ready: Arc<AtomicBool>) -> Result<(), ProxyError> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, router(ready)).await?;
    Ok(())
}

async fn healthz() -> &'static str {
    "OK"
}

async fn readyz(State(ready): State<Arc<AtomicBool>>) -> Response {
    if ready.load(Ordering::SeqCst) {
        (StatusCode::OK, "OK").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Not Ready").into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::util::ServiceExt;

    #[tokio::test]
    async fn healthz_is_unconditionally_ok() {
        let ready = Arc::new(AtomicBool::new(false));
        let response = router(ready)
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body, "OK");
    }

    #[tokio::test]
    async fn readyz_flips_with_the_flag() {
        let ready = Arc::new(AtomicBool::new(true));
        let app = router(ready.clone());

        let response = app
            .clone()
            .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        ready.store(false, Ordering::SeqCst);
        let response = app
            .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body, "Not Ready");
    }
}
