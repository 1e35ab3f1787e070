//! Route table and handlers for the `/sync/*` and `/msync/*` endpoints.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use cardsync_core::error::{Error, Result};
use cardsync_core::ids::{HostId, SessionKey, UserKey};
use serde::Serialize;
use tracing::instrument;

use crate::compression::{compress, decompress, SyncHeader};
use crate::error::ApiError;
use crate::state::AppState;
use crate::wire::{
    ApplyChangesRequest, ApplyChunkRequest, BeginRequest, DownloadFilesRequest, HostKeyRequest,
    MediaChangesRequest, MediaSanityRequest, MetaRequest, SanityCheckRequest, StartRequest,
};

/// The header every sync request carries, JSON-encoding protocol
/// version, session key, client id, and host id.
const SYNC_HEADER_NAME: &str = "x-sync-header";
const ORIGINAL_SIZE_HEADER: &str = "original-size";

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/sync/hostKey", post(host_key))
        .route("/sync/meta", post(meta))
        .route("/sync/start", post(start))
        .route("/sync/applyChanges", post(apply_changes))
        .route("/sync/applyChunk", post(apply_chunk))
        .route("/sync/chunk", post(chunk))
        .route("/sync/sanityCheck2", post(sanity_check))
        .route("/sync/finish", post(finish))
        .route("/sync/abort", post(abort))
        .route("/sync/upload", post(upload))
        .route("/sync/download", post(download))
        .route("/msync/begin", post(media_begin))
        .route("/msync/mediaChanges", post(media_changes))
        .route("/msync/uploadChanges", post(media_upload_changes))
        .route("/msync/downloadFiles", post(media_download_files))
        .route("/msync/mediaSanity", post(media_sanity))
        .with_state(state)
}

fn parse_header(headers: &HeaderMap) -> Result<SyncHeader> {
    let raw = headers
        .get(SYNC_HEADER_NAME)
        .map(|v| v.to_str().unwrap_or_default())
        .unwrap_or_default();
    SyncHeader::parse(raw)
}

fn decode_request_body(header: &SyncHeader, body: Bytes) -> Result<Vec<u8>> {
    if body.is_empty() {
        return Ok(Vec::new());
    }
    if header.supports_compression() {
        decompress(&body)
    } else {
        Ok(body.to_vec())
    }
}

fn json_response<T: Serialize>(header: &SyncHeader, value: &T) -> Result<Response> {
    let raw = serde_json::to_vec(value)?;
    encode_response(header, raw, "application/json")
}

fn binary_response(header: &SyncHeader, raw: Vec<u8>) -> Result<Response> {
    encode_response(header, raw, "application/octet-stream")
}

fn encode_response(header: &SyncHeader, raw: Vec<u8>, content_type: &'static str) -> Result<Response> {
    if header.supports_compression() {
        let original_size = raw.len();
        let compressed = compress(&raw)?;
        let mut response = (StatusCode::OK, compressed).into_response();
        response
            .headers_mut()
            .insert("content-type", HeaderValue::from_static(content_type));
        response.headers_mut().insert(
            ORIGINAL_SIZE_HEADER,
            HeaderValue::from_str(&original_size.to_string()).expect("ascii digits"),
        );
        Ok(response)
    } else {
        let mut response = (StatusCode::OK, raw).into_response();
        response
            .headers_mut()
            .insert("content-type", HeaderValue::from_static(content_type));
        Ok(response)
    }
}

async fn resolve_user(state: &AppState, header: &SyncHeader) -> Result<(UserKey, SessionKey)> {
    let key = SessionKey(header.k.clone());
    let session = state.sessions.resolve(&key)?;
    Ok((session.user, key))
}

#[instrument(skip_all)]
async fn host_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> std::result::Result<Response, ApiError> {
    let header = parse_header(&headers)?;
    let decoded = decode_request_body(&header, body)?;
    let req: HostKeyRequest = if decoded.is_empty() {
        HostKeyRequest { u: None, p: None }
    } else {
        serde_json::from_slice(&decoded)?
    };

    let resp = state.host_key.host_key(HostId(header.c.clone()), req).await?;
    Ok(json_response(&header, &resp)?)
}

#[instrument(skip_all)]
async fn meta(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> std::result::Result<Response, ApiError> {
    let header = parse_header(&headers)?;
    let (user, _session) = resolve_user(&state, &header).await?;
    let decoded = decode_request_body(&header, body)?;
    let req: MetaRequest = serde_json::from_slice(&decoded)?;

    let resp = state.collection_sync.meta(&user, &req)?;
    Ok(json_response(&header, &resp)?)
}

#[instrument(skip_all)]
async fn start(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> std::result::Result<Response, ApiError> {
    let header = parse_header(&headers)?;
    let (user, session) = resolve_user(&state, &header).await?;
    let decoded = decode_request_body(&header, body)?;
    let req: StartRequest = serde_json::from_slice(&decoded)?;

    let guard = state.user_locks.try_acquire(&user).await?;
    let resp = state.collection_sync.start(&session, &user, &req, guard)?;
    Ok(json_response(&header, &resp)?)
}

#[instrument(skip_all)]
async fn apply_changes(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> std::result::Result<Response, ApiError> {
    let header = parse_header(&headers)?;
    let (_user, session) = resolve_user(&state, &header).await?;
    let decoded = decode_request_body(&header, body)?;
    let req: ApplyChangesRequest = serde_json::from_slice(&decoded)?;

    let resp = state.collection_sync.apply_changes(&session, &req)?;
    Ok(json_response(&header, &resp)?)
}

#[instrument(skip_all)]
async fn chunk(
    State(state): State<AppState>,
    headers: HeaderMap,
    _body: Bytes,
) -> std::result::Result<Response, ApiError> {
    let header = parse_header(&headers)?;
    let (_user, session) = resolve_user(&state, &header).await?;
    let resp = state.collection_sync.chunk(&session)?;
    Ok(json_response(&header, &resp)?)
}

#[instrument(skip_all)]
async fn apply_chunk(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> std::result::Result<Response, ApiError> {
    let header = parse_header(&headers)?;
    let (_user, session) = resolve_user(&state, &header).await?;
    let decoded = decode_request_body(&header, body)?;
    let req: ApplyChunkRequest = serde_json::from_slice(&decoded)?;

    state.collection_sync.apply_chunk(&session, &req)?;
    Ok(json_response(&header, &serde_json::json!({}))?)
}

#[instrument(skip_all)]
async fn sanity_check(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> std::result::Result<Response, ApiError> {
    let header = parse_header(&headers)?;
    let (_user, session) = resolve_user(&state, &header).await?;
    let decoded = decode_request_body(&header, body)?;
    let req: SanityCheckRequest = serde_json::from_slice(&decoded)?;

    let resp = state.collection_sync.sanity_check(&session, &req)?;
    Ok(json_response(&header, &resp)?)
}

#[instrument(skip_all)]
async fn finish(
    State(state): State<AppState>,
    headers: HeaderMap,
    _body: Bytes,
) -> std::result::Result<Response, ApiError> {
    let header = parse_header(&headers)?;
    let (_user, session) = resolve_user(&state, &header).await?;
    let resp = state.collection_sync.finish(&session)?;
    Ok(json_response(&header, &resp)?)
}

#[instrument(skip_all)]
async fn abort(
    State(state): State<AppState>,
    headers: HeaderMap,
    _body: Bytes,
) -> std::result::Result<Response, ApiError> {
    let header = parse_header(&headers)?;
    let (_user, session) = resolve_user(&state, &header).await?;
    state.collection_sync.abort(&session);
    Ok(json_response(&header, &serde_json::json!({}))?)
}

#[instrument(skip_all)]
async fn upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> std::result::Result<Response, ApiError> {
    let header = parse_header(&headers)?;
    let (user, _session) = resolve_user(&state, &header).await?;
    let decoded = decode_request_body(&header, body)?;
    if decoded.len() as u64 > state.config.limits.max_collection_upload_bytes {
        return Err(Error::BadRequest("collection upload exceeds configured limit".into()).into());
    }

    let resp = state.collection_sync.upload(&user, &decoded)?;
    Ok(json_response(&header, &resp)?)
}

#[instrument(skip_all)]
async fn download(
    State(state): State<AppState>,
    headers: HeaderMap,
    _body: Bytes,
) -> std::result::Result<Response, ApiError> {
    let header = parse_header(&headers)?;
    let (user, _session) = resolve_user(&state, &header).await?;
    let bytes = state.collection_sync.download(&user)?;
    Ok(binary_response(&header, bytes)?)
}

#[instrument(skip_all)]
async fn media_begin(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> std::result::Result<Response, ApiError> {
    let header = parse_header(&headers)?;
    let (user, _session) = resolve_user(&state, &header).await?;
    let decoded = decode_request_body(&header, body)?;
    let req: BeginRequest = if decoded.is_empty() {
        BeginRequest { sk: header.k.clone() }
    } else {
        serde_json::from_slice(&decoded)?
    };

    let resp = state.media_sync.begin(&user, req.sk).await?;
    Ok(json_response(&header, &resp)?)
}

#[instrument(skip_all)]
async fn media_changes(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> std::result::Result<Response, ApiError> {
    let header = parse_header(&headers)?;
    let (user, _session) = resolve_user(&state, &header).await?;
    let decoded = decode_request_body(&header, body)?;
    let req: MediaChangesRequest = serde_json::from_slice(&decoded)?;

    let resp = state.media_sync.media_changes(&user, req.last_usn).await?;
    Ok(json_response(&header, &resp)?)
}

#[instrument(skip_all)]
async fn media_upload_changes(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> std::result::Result<Response, ApiError> {
    let header = parse_header(&headers)?;
    let (user, _session) = resolve_user(&state, &header).await?;
    let decoded = decode_request_body(&header, body)?;
    if decoded.len() as u64 > state.config.limits.max_media_archive_bytes {
        return Err(Error::BadRequest("media archive exceeds configured limit".into()).into());
    }

    let resp = state.media_sync.upload_changes(&user, &decoded).await?;
    Ok(json_response(&header, &resp)?)
}

#[instrument(skip_all)]
async fn media_download_files(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> std::result::Result<Response, ApiError> {
    let header = parse_header(&headers)?;
    let (user, _session) = resolve_user(&state, &header).await?;
    let decoded = decode_request_body(&header, body)?;
    let req: DownloadFilesRequest = serde_json::from_slice(&decoded)?;

    let archive = state.media_sync.download_files(&user, &req.files).await?;
    Ok(binary_response(&header, archive)?)
}

#[instrument(skip_all)]
async fn media_sanity(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> std::result::Result<Response, ApiError> {
    let header = parse_header(&headers)?;
    let (user, _session) = resolve_user(&state, &header).await?;
    let decoded = decode_request_body(&header, body)?;
    let req: MediaSanityRequest = serde_json::from_slice(&decoded)?;

    let resp = state.media_sync.media_sanity(&user, req.local).await?;
    Ok(json_response(&header, &resp)?)
}
