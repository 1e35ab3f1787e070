//! Cross-cutting HTTP layers shared by every route.
//!
//! Authentication is not a tower layer here: each handler resolves its
//! session key from the sync header itself, since the header's shape
//! (and whether a session is even expected) differs per endpoint. This
//! module only carries the concerns that really are uniform across
//! every request: tracing spans and CORS.

use tower_http::classify::{ServerErrorsAsFailures, SharedClassifier};
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};

/// Build the layers every route gets wrapped in, in application order.
pub fn create_middleware_stack() -> (TraceLayer<SharedClassifier<ServerErrorsAsFailures>>, CorsLayer) {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(tracing::Level::DEBUG))
        .on_request(DefaultOnRequest::new().level(tracing::Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(tracing::Level::DEBUG));

    let cors_layer = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any);

    (trace_layer, cors_layer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use axum::routing::get;
    use axum::Router;
    use hyper::StatusCode;
    use tower::ServiceExt;

    #[tokio::test]
    async fn stacked_layers_still_serve_requests() {
        let (trace, cors) = create_middleware_stack();
        let app = Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(trace)
            .layer(cors);

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }
}
