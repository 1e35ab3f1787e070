//! HTTP transport shim: wire types, the collection and media sync
//! engines, and the axum router binding them to `/sync/*`/`/msync/*`.

pub mod collection_sync;
pub mod compression;
pub mod error;
pub mod hostkey;
pub mod media_sync;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod wire;

pub use collection_sync::CollectionSyncEngine;
pub use error::ApiError;
pub use hostkey::HostKeyService;
pub use media_sync::MediaSyncService;
pub use state::AppState;

use axum::Router;

/// Build the full application: every route, wrapped in the shared
/// tracing/CORS layers.
pub fn app(state: AppState) -> Router {
    let (trace_layer, cors_layer) = middleware::create_middleware_stack();
    routes::router(state).layer(trace_layer).layer(cors_layer)
}
