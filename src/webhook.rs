//! Webhook router: propagate origin document events into the object store.
//!
//! Inbound bodies arrive in several framings (bare JSON, API-Gateway
//! envelopes with a JSON-string `body`, optionally base64-encoded) and
//! several event vocabularies. Everything is normalized, classified into
//! one of four actions, and dispatched with a small match.

use crate::config::Config;
use crate::content_type::guess_content_type;
use crate::error::SyncResult;
use crate::object_store::ObjectStore;
use crate::origin::{native_id, OriginClient};
use crate::paths::{is_placeholder_key, path_levels, sanitize, to_key};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// What an inbound event asks of us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookAction {
    /// Mirror the whole project into the object store.
    FullSync,
    /// Remove the objects for one document.
    DocumentDelete,
    /// Download one document from the origin and store it.
    DocumentCreateOrUpdate,
    /// Ask the origin whether the document still exists, then decide.
    ProbeThenDecide,
}

/// Classify an event. Background syncs win; otherwise the event-type
/// token decides; an unclassified event with a document id gets probed;
/// everything else refreshes the project.
pub fn classify(event_type: &str, has_document_id: bool, background: bool) -> WebhookAction {
    if background {
        return WebhookAction::FullSync;
    }
    if looks_like_delete(event_type) {
        return WebhookAction::DocumentDelete;
    }
    if looks_like_create_or_update(event_type) {
        return WebhookAction::DocumentCreateOrUpdate;
    }
    if has_document_id {
        return WebhookAction::ProbeThenDecide;
    }
    WebhookAction::FullSync
}

fn looks_like_delete(event_type: &str) -> bool {
    ["delete", "remove", "trash", "purge"]
        .iter()
        .any(|t| event_type.contains(t))
}

fn looks_like_create_or_update(event_type: &str) -> bool {
    ["create", "upload", "update", "rename", "moved"]
        .iter()
        .any(|t| event_type.contains(t))
}

/// Unwrap an API-Gateway-style envelope: a `body` field holding a JSON
/// string (optionally base64-encoded). A bare JSON object passes through.
pub fn parse_envelope(event: &Value) -> Value {
    let body = match event.get("body") {
        Some(body) => body,
        None => event,
    };

    match body {
        Value::String(raw) => {
            let decoded;
            let text = if event["isBase64Encoded"].as_bool().unwrap_or(false) {
                match BASE64.decode(raw.as_bytes()) {
                    Ok(bytes) => {
                        decoded = String::from_utf8_lossy(&bytes).into_owned();
                        decoded.as_str()
                    }
                    Err(e) => {
                        error!("cannot base64-decode body: {}", e);
                        raw.as_str()
                    }
                }
            } else {
                raw.as_str()
            };
            match serde_json::from_str(text) {
                Ok(parsed) => parsed,
                Err(e) => {
                    error!("cannot parse body JSON: {}", e);
                    json!({})
                }
            }
        }
        Value::Object(_) => body.clone(),
        _ => json!({}),
    }
}

/// Pull an event-type hint from the common body fields or the event header.
pub fn extract_event_type(body: &Value, headers: &HeaderMap) -> String {
    for field in ["eventType", "event", "type", "name", "action"] {
        if let Some(value) = body[field].as_str() {
            let value = value.trim();
            if !value.is_empty() {
                return value.to_lowercase();
            }
        }
    }
    headers
        .get("x-filevine-event")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_lowercase())
        .unwrap_or_default()
}

/// Document id in any of its shapes: scalar, `{native: n}`, or nested
/// under `payload`.
pub fn extract_document_id(body: &Value) -> Option<i64> {
    for candidate in [
        &body["documentId"],
        &body["DocumentId"],
        &body["payload"]["documentId"],
    ] {
        if let Some(id) = native_id(candidate) {
            return Some(id);
        }
    }
    None
}

/// Project id from its usual homes.
pub fn extract_project_id(body: &Value) -> Option<i64> {
    for candidate in [
        &body["projectId"],
        &body["ProjectId"],
        &body["payload"]["projectId"],
        &body["recordId"],
    ] {
        if let Some(id) = native_id(candidate) {
            return Some(id);
        }
    }
    None
}

/// Shared state for the webhook handlers.
pub struct WebhookState {
    pub config: Arc<Config>,
    pub store: Arc<dyn ObjectStore>,
    pub origin: Arc<OriginClient>,
    /// documentId → object keys written for it, so deletes skip the tag scan.
    doc_keys: Mutex<HashMap<i64, Vec<String>>>,
}

impl WebhookState {
    pub fn new(config: Arc<Config>, store: Arc<dyn ObjectStore>, origin: Arc<OriginClient>) -> Self {
        Self {
            config,
            store,
            origin,
            doc_keys: Mutex::new(HashMap::new()),
        }
    }
}

/// Build the webhook router.
pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new().route("/", post(handle_event)).with_state(state)
}

type Reply = (StatusCode, Json<Value>);

fn ok(body: Value) -> Reply {
    (StatusCode::OK, Json(body))
}

fn fail(code: StatusCode, message: &str) -> Reply {
    (code, Json(json!({ "error": message })))
}

async fn handle_event(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    Json(event): Json<Value>,
) -> Reply {
    let body = parse_envelope(&event);

    // Background seed runs before the projectId/allowlist gates: a
    // self-queued seed must complete even for projects outside the
    // rollout list.
    if body["__background_sync"].as_bool().unwrap_or(false) {
        let Some(project_id) = extract_project_id(&body) else {
            return fail(StatusCode::BAD_REQUEST, "missing projectId");
        };
        info!("background sync for project {}", project_id);
        return sync_project(&state, project_id).await;
    }

    let Some(project_id) = extract_project_id(&body) else {
        return fail(StatusCode::BAD_REQUEST, "missing projectId");
    };
    if !state.config.project_allowed(project_id) {
        info!("skipping project {} (not in allowlist)", project_id);
        return ok(json!({ "status": "skipped", "projectId": project_id }));
    }

    let event_type = extract_event_type(&body, &headers);
    let document_id = extract_document_id(&body);
    info!(
        "router: eventType='{}' documentId={:?} projectId={}",
        event_type, document_id, project_id
    );

    match classify(&event_type, document_id.is_some(), false) {
        WebhookAction::FullSync => sync_project(&state, project_id).await,
        WebhookAction::DocumentDelete => match document_id {
            Some(doc_id) => delete_document(&state, project_id, doc_id).await,
            None => fail(StatusCode::BAD_REQUEST, "delete event missing documentId"),
        },
        WebhookAction::DocumentCreateOrUpdate => match document_id {
            Some(doc_id) => upload_document(&state, project_id, doc_id).await,
            None => fail(
                StatusCode::BAD_REQUEST,
                "create/update event missing documentId",
            ),
        },
        WebhookAction::ProbeThenDecide => match document_id {
            Some(doc_id) => {
                if state.origin.doc_exists(doc_id).await {
                    upload_document(&state, project_id, doc_id).await
                } else {
                    delete_document(&state, project_id, doc_id).await
                }
            }
            None => fail(StatusCode::BAD_REQUEST, "event missing documentId"),
        },
    }
}

async fn project_prefix(state: &WebhookState, project_id: i64) -> (String, String) {
    let name = state.origin.project_name(project_id).await;
    let prefix = state.config.project_prefix(&name);
    (name, prefix)
}

/// Create `.placeholder` objects for every level of every folder path
/// that does not already have one.
async fn ensure_placeholders(state: &WebhookState, prefix: &str, folder_paths: &HashSet<String>) {
    let existing: HashSet<String> = match state.store.list_recursive(prefix).await {
        Ok(objects) => objects
            .into_iter()
            .filter(|o| is_placeholder_key(&o.rel_original))
            .map(|o| o.real_key)
            .collect(),
        Err(e) => {
            warn!("placeholder listing failed: {}", e);
            HashSet::new()
        }
    };

    let mut levels: HashSet<String> = HashSet::new();
    for path in folder_paths {
        levels.extend(path_levels(path));
    }

    for level in levels {
        let key = to_key(&[prefix, &level, ".placeholder"]);
        if existing.contains(&key) {
            continue;
        }
        match state
            .store
            .put_bytes(&key, Vec::new(), "application/octet-stream", &[], &[])
            .await
        {
            Ok(()) => info!("created folder placeholder {}", key),
            Err(e) => error!("cannot create placeholder {}: {}", key, e),
        }
    }
}

fn object_metadata(
    document_id: i64,
    project_id: i64,
    folder_id: Option<i64>,
    folder_path: &str,
) -> (Vec<(String, String)>, Vec<(String, String)>) {
    let metadata = vec![
        ("documentId".to_string(), document_id.to_string()),
        ("projectId".to_string(), project_id.to_string()),
        (
            "folderId".to_string(),
            folder_id.map(|id| id.to_string()).unwrap_or_default(),
        ),
        ("folderPath".to_string(), folder_path.to_string()),
    ];
    let tags = vec![
        ("origin".to_string(), "filevine".to_string()),
        ("fv_docid".to_string(), document_id.to_string()),
        ("projectId".to_string(), project_id.to_string()),
    ];
    (metadata, tags)
}

#[allow(clippy::too_many_arguments)]
async fn store_document(
    state: &WebhookState,
    project_id: i64,
    doc_id: i64,
    key: &str,
    filename: &str,
    bytes: Vec<u8>,
    folder_id: Option<i64>,
    folder_path: &str,
) -> SyncResult<()> {
    let (metadata, tags) = object_metadata(doc_id, project_id, folder_id, folder_path);
    state
        .store
        .put_bytes(key, bytes, guess_content_type(filename), &metadata, &tags)
        .await?;
    state
        .doc_keys
        .lock()
        .await
        .entry(doc_id)
        .or_default()
        .push(key.to_string());
    Ok(())
}

/// Mirror the entire project: folders first (including empty ones), then
/// every document to its exact path.
async fn sync_project(state: &Arc<WebhookState>, project_id: i64) -> Reply {
    let (name, prefix) = project_prefix(state, project_id).await;
    info!("full sync for project {} -> {}/", project_id, prefix);

    let folder_map = state.origin.folder_structure(project_id).await;
    let documents = state.origin.fetch_all_documents(project_id).await;

    // Attach a folder path to every document; the BFS map first, then an
    // on-demand parent climb, then the listing's last-segment fallback.
    let mut folder_paths: HashSet<String> = folder_map.values().cloned().collect();
    folder_paths.insert("Documents".to_string());
    let mut placed = Vec::with_capacity(documents.len());
    for doc in documents {
        let path = match doc.folder_id.and_then(|fid| folder_map.get(&fid).cloned()) {
            Some(path) => path,
            None => {
                let fallback = doc.folder_name.clone().unwrap_or_else(|| "Documents".into());
                state
                    .origin
                    .resolve_folder_path(doc.folder_id, &fallback, false)
                    .await
                    .unwrap_or_else(|_| sanitize(&fallback))
            }
        };
        folder_paths.insert(path.clone());
        placed.push((doc, path));
    }

    ensure_placeholders(state, &prefix, &folder_paths).await;

    let ids: Vec<i64> = placed.iter().map(|(d, _)| d.id).collect();
    let links = state.origin.download_links(&ids).await;

    let mut uploaded = 0usize;
    let mut failed = 0usize;
    for (doc, folder_path) in &placed {
        let Some(url) = links.get(&doc.id) else {
            error!("no download link for doc {} ({})", doc.id, doc.filename);
            failed += 1;
            continue;
        };
        let bytes = match state.origin.download(url).await {
            Ok(b) => b,
            Err(e) => {
                error!("download failed for doc {} ({}): {}", doc.id, doc.filename, e);
                failed += 1;
                continue;
            }
        };
        let key = to_key(&[&prefix, folder_path, &doc.filename]);
        match store_document(
            state,
            project_id,
            doc.id,
            &key,
            &doc.filename,
            bytes,
            doc.folder_id,
            folder_path,
        )
        .await
        {
            Ok(()) => uploaded += 1,
            Err(e) => {
                error!("upload failed for {}: {}", key, e);
                failed += 1;
            }
        }
    }

    let result = json!({
        "status": "success",
        "projectId": project_id,
        "projectName": name,
        "documentCount": placed.len(),
        "uploadedCount": uploaded,
        "failedCount": failed,
    });
    info!("full sync complete: {}", result);
    ok(result)
}

/// If the project's prefix is empty, queue a background full sync and
/// tell the caller to come back.
async fn seed_if_needed(state: &Arc<WebhookState>, project_id: i64, prefix: &str) -> Option<Reply> {
    match state.store.list_recursive(prefix).await {
        Ok(objects) if objects.is_empty() => {
            info!("queueing initial seed for {}/", prefix);
            let state = state.clone();
            tokio::spawn(async move {
                let _ = sync_project(&state, project_id).await;
            });
            Some(ok(json!({
                "status": "initial_seed_queued",
                "message": "Project seed scheduled in background.",
            })))
        }
        Ok(_) => None,
        Err(e) => {
            warn!("seed check failed for {}: {}", prefix, e);
            None
        }
    }
}

async fn upload_document(state: &Arc<WebhookState>, project_id: i64, doc_id: i64) -> Reply {
    let (_, prefix) = project_prefix(state, project_id).await;

    if let Some(reply) = seed_if_needed(state, project_id, &prefix).await {
        return reply;
    }

    let meta = match state.origin.document_meta(doc_id).await {
        Ok(meta) => meta,
        Err(e) => {
            error!("cannot fetch document {}: {}", doc_id, e);
            return fail(StatusCode::BAD_GATEWAY, "cannot fetch document metadata");
        }
    };

    let filename = meta["filename"]
        .as_str()
        .map(sanitize)
        .unwrap_or_else(|| format!("document_{}", doc_id));
    let folder_id = native_id(&meta["folderId"]);
    let folder_fallback = meta["folderName"]
        .as_str()
        .map(sanitize)
        .unwrap_or_else(|| "Documents".to_string());

    // Strict resolution: retrying beats placing the file in a guessed
    // folder.
    let folder_path = match state
        .origin
        .resolve_folder_path(folder_id, &folder_fallback, true)
        .await
    {
        Ok(path) => path,
        Err(e) => {
            error!("cannot resolve folder for doc {}: {}", doc_id, e);
            return fail(
                StatusCode::SERVICE_UNAVAILABLE,
                "rate-limited resolving folder path; please retry",
            );
        }
    };

    let mut wanted = HashSet::new();
    wanted.insert(folder_path.clone());
    ensure_placeholders(state, &prefix, &wanted).await;

    let links = state.origin.download_links(&[doc_id]).await;
    let Some(url) = links.get(&doc_id) else {
        return fail(
            StatusCode::BAD_GATEWAY,
            &format!("no download link for document {}", doc_id),
        );
    };
    let bytes = match state.origin.download(url).await {
        Ok(b) => b,
        Err(e) => {
            error!("download failed for doc {}: {}", doc_id, e);
            return fail(StatusCode::BAD_GATEWAY, "document download failed");
        }
    };

    let key = to_key(&[&prefix, &folder_path, &filename]);
    info!("single upload '{}' -> {}", filename, key);
    match store_document(
        state,
        project_id,
        doc_id,
        &key,
        &filename,
        bytes,
        folder_id,
        &folder_path,
    )
    .await
    {
        Ok(()) => ok(json!({ "s3Key": key })),
        Err(e) => {
            error!("store failed for {}: {}", key, e);
            fail(StatusCode::INTERNAL_SERVER_ERROR, "failed to store object")
        }
    }
}

async fn delete_document(state: &Arc<WebhookState>, project_id: i64, doc_id: i64) -> Reply {
    let (_, prefix) = project_prefix(state, project_id).await;

    // Cached keys first; fall back to scanning tags and metadata.
    let mut keys = state
        .doc_keys
        .lock()
        .await
        .remove(&doc_id)
        .unwrap_or_default();
    if keys.is_empty() {
        keys = match state.store.find_keys_by_doc_id(&prefix, doc_id).await {
            Ok(keys) => keys,
            Err(e) => {
                error!("key scan failed for doc {}: {}", doc_id, e);
                Vec::new()
            }
        };
    }

    if keys.is_empty() {
        info!("no objects found for deleted doc {} (project {})", doc_id, project_id);
        return ok(json!({
            "status": "not_found",
            "projectId": project_id,
            "documentId": doc_id,
        }));
    }

    let mut deleted = Vec::new();
    for key in keys {
        match state.store.remove(&key).await {
            Ok(()) => {
                info!("deleted object {}", key);
                deleted.push(key);
            }
            Err(e) => error!("cannot delete {}: {}", key, e),
        }
    }

    ok(json!({
        "status": "deleted",
        "projectId": project_id,
        "documentId": doc_id,
        "deletedKeys": deleted,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_matrix() {
        assert_eq!(classify("anything", true, true), WebhookAction::FullSync);
        assert_eq!(
            classify("documentdeleted", true, false),
            WebhookAction::DocumentDelete
        );
        assert_eq!(
            classify("documentcreated", true, false),
            WebhookAction::DocumentCreateOrUpdate
        );
        assert_eq!(
            classify("documentuploaded", true, false),
            WebhookAction::DocumentCreateOrUpdate
        );
        assert_eq!(
            classify("docmoved", true, false),
            WebhookAction::DocumentCreateOrUpdate
        );
        assert_eq!(
            classify("somethingelse", true, false),
            WebhookAction::ProbeThenDecide
        );
        assert_eq!(classify("", true, false), WebhookAction::ProbeThenDecide);
        assert_eq!(classify("", false, false), WebhookAction::FullSync);
        assert_eq!(
            classify("somethingelse", false, false),
            WebhookAction::FullSync
        );
    }

    #[test]
    fn test_parse_envelope_bare_object() {
        let event = json!({ "eventType": "DocumentDeleted", "projectId": 1 });
        assert_eq!(parse_envelope(&event), event);
    }

    #[test]
    fn test_parse_envelope_string_body() {
        let event = json!({ "body": "{\"projectId\": 2370300}" });
        assert_eq!(parse_envelope(&event)["projectId"], json!(2370300));
    }

    #[test]
    fn test_parse_envelope_base64_body() {
        let inner = json!({ "projectId": 7 }).to_string();
        let event = json!({
            "body": BASE64.encode(inner.as_bytes()),
            "isBase64Encoded": true,
        });
        assert_eq!(parse_envelope(&event)["projectId"], json!(7));
    }

    #[test]
    fn test_parse_envelope_garbage_body() {
        let event = json!({ "body": "{broken" });
        assert_eq!(parse_envelope(&event), json!({}));
    }

    #[test]
    fn test_extract_document_id_shapes() {
        assert_eq!(
            extract_document_id(&json!({ "documentId": 12345678 })),
            Some(12345678)
        );
        assert_eq!(
            extract_document_id(&json!({ "documentId": { "native": 12345678 } })),
            Some(12345678)
        );
        assert_eq!(
            extract_document_id(&json!({ "DocumentId": { "native": 5 } })),
            Some(5)
        );
        assert_eq!(
            extract_document_id(&json!({ "payload": { "documentId": 9 } })),
            Some(9)
        );
        assert_eq!(extract_document_id(&json!({})), None);
        assert_eq!(
            extract_document_id(&json!({ "documentId": { "native": null } })),
            None
        );
    }

    #[test]
    fn test_extract_project_id_shapes() {
        assert_eq!(extract_project_id(&json!({ "projectId": 1 })), Some(1));
        assert_eq!(extract_project_id(&json!({ "ProjectId": 2 })), Some(2));
        assert_eq!(
            extract_project_id(&json!({ "payload": { "projectId": 3 } })),
            Some(3)
        );
        assert_eq!(extract_project_id(&json!({ "recordId": 4 })), Some(4));
        assert_eq!(extract_project_id(&json!({})), None);
    }

    #[test]
    fn test_extract_event_type_fields_and_header() {
        let headers = HeaderMap::new();
        assert_eq!(
            extract_event_type(&json!({ "eventType": " DocumentDeleted " }), &headers),
            "documentdeleted"
        );
        assert_eq!(
            extract_event_type(&json!({ "action": "Uploaded" }), &headers),
            "uploaded"
        );

        let mut headers = HeaderMap::new();
        headers.insert("x-filevine-event", "DocumentCreated".parse().unwrap());
        assert_eq!(extract_event_type(&json!({}), &headers), "documentcreated");
    }

    #[test]
    fn test_scenario_delete_routing_shape() {
        // The §8 scenario-7 payload classifies as a delete.
        let body = json!({
            "eventType": "DocumentDeleted",
            "projectId": 2370300,
            "documentId": { "native": 12345678 },
        });
        let headers = HeaderMap::new();
        let event_type = extract_event_type(&body, &headers);
        let doc_id = extract_document_id(&body);
        assert_eq!(doc_id, Some(12345678));
        assert_eq!(extract_project_id(&body), Some(2370300));
        assert_eq!(
            classify(&event_type, doc_id.is_some(), false),
            WebhookAction::DocumentDelete
        );
    }
}
