//! Origin HTTP client: retrying request layer and the REST surface the
//! sync engine consumes.
//!
//! Retry policy: one re-authentication on 401, then exponential backoff
//! with full jitter (base 1 s, cap 30 s, 5 attempts) on 429/5xx and
//! transport errors. Anything else bubbles up to be logged per key.

use crate::error::{SyncError, SyncResult};
use crate::origin::auth::{authenticate, session_headers, OriginCredentials, Session};
use crate::paths::{sanitize, to_key};
use rand::Rng;
use reqwest::{Client, Method, Response, StatusCode};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS: u32 = 5;

/// Page size for folder and project listings.
const PAGE_LIMIT: usize = 500;
/// Page size for document listings.
const DOC_PAGE_LIMIT: usize = 200;
/// Download-link batch size, kept small to stay under rate limits.
const LINK_CHUNK: usize = 10;
/// Signed download URL lifetime, seconds.
const LINK_TTL: u64 = 600;
/// Webhook refresh request timeout.
const REFRESH_TIMEOUT: Duration = Duration::from_secs(60);
/// Settle delay after a successful refresh, letting the origin finish
/// fanning out before we list.
const REFRESH_SETTLE: Duration = Duration::from_secs(4);

/// One document from the origin's project listing.
#[derive(Debug, Clone)]
pub struct OriginDocument {
    pub id: i64,
    pub filename: String,
    pub size: u64,
    pub folder_id: Option<i64>,
    pub folder_name: Option<String>,
}

/// Authenticated origin client with a session cache and a folder-path
/// cache shared across calls.
pub struct OriginClient {
    http: Client,
    base_url: String,
    creds: OriginCredentials,
    session: RwLock<Option<Session>>,
    folder_cache: Mutex<HashMap<i64, String>>,
}

impl OriginClient {
    pub fn new(base_url: impl Into<String>, creds: OriginCredentials) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
            creds,
            session: RwLock::new(None),
            folder_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn headers(&self) -> SyncResult<reqwest::header::HeaderMap> {
        if let Some(session) = self.session.read().await.as_ref() {
            return session_headers(&self.creds, session);
        }
        self.reauthenticate().await
    }

    async fn reauthenticate(&self) -> SyncResult<reqwest::header::HeaderMap> {
        let session = authenticate(&self.http, &self.creds).await?;
        let headers = session_headers(&self.creds, &session)?;
        *self.session.write().await = Some(session);
        Ok(headers)
    }

    /// Issue a request, retrying per the module policy. The returned
    /// response has any non-retryable error status still attached.
    async fn request(&self, method: Method, url: &str, body: Option<&Value>) -> SyncResult<Response> {
        let mut attempt: u32 = 0;
        let mut refreshed = false;

        loop {
            let mut req = self
                .http
                .request(method.clone(), url)
                .headers(self.headers().await?);
            if let Some(body) = body {
                req = req.json(body);
            }

            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status == StatusCode::UNAUTHORIZED && !refreshed {
                        error!("401 from {}; refreshing origin session", url);
                        refreshed = true;
                        self.reauthenticate().await?;
                        continue;
                    }
                    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                        if attempt >= MAX_ATTEMPTS {
                            return Err(SyncError::RetriesExhausted(format!(
                                "{} {} -> {}",
                                method, url, status
                            )));
                        }
                        let delay = backoff_delay(attempt);
                        warn!("{} from {}; backing off {:?}", status, url, delay);
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(e) => {
                    if attempt >= MAX_ATTEMPTS {
                        return Err(SyncError::RetriesExhausted(format!(
                            "{} {} -> {}",
                            method, url, e
                        )));
                    }
                    let delay = backoff_delay(attempt);
                    warn!("request error for {}: {}; backing off {:?}", url, e, delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    pub async fn get_json(&self, url: &str) -> SyncResult<Value> {
        let resp = self.request(Method::GET, url, None).await?;
        Ok(resp.error_for_status()?.json().await?)
    }

    pub async fn post_json(&self, url: &str, body: &Value) -> SyncResult<Value> {
        let resp = self.request(Method::POST, url, Some(body)).await?;
        Ok(resp.error_for_status()?.json().await?)
    }

    // -----------------------------------------------------------------
    // Projects
    // -----------------------------------------------------------------

    /// Resolve a project display name to its numeric id, paginating the
    /// project listing. Comparison is trimmed and case-insensitive.
    pub async fn resolve_project_id(&self, name: &str) -> SyncResult<Option<i64>> {
        let target = name.trim().to_lowercase();
        let mut offset = 0;
        loop {
            let url = format!(
                "{}/core/projects?offset={}&limit={}",
                self.base_url, offset, 100
            );
            let payload = self.get_json(&url).await?;
            let Some(items) = payload["items"].as_array() else {
                return Ok(None);
            };
            if items.is_empty() {
                return Ok(None);
            }
            for item in items {
                let project_name = item["projectName"].as_str().unwrap_or_default();
                if project_name.trim().to_lowercase() == target {
                    return Ok(native_id(&item["projectId"]));
                }
            }
            offset += 100;
        }
    }

    /// Display name for a project id; falls back to `Project_<id>`.
    pub async fn project_name(&self, project_id: i64) -> String {
        let url = format!("{}/core/projects/{}", self.base_url, project_id);
        match self.get_json(&url).await {
            Ok(payload) => payload["projectOrClientName"]
                .as_str()
                .map(sanitize)
                .unwrap_or_else(|| format!("Project_{}", project_id)),
            Err(e) => {
                error!("cannot fetch project {} name: {}", project_id, e);
                format!("Project_{}", project_id)
            }
        }
    }

    /// Best-effort refresh: ask the origin-side webhook to re-emit the
    /// project's documents, then let it settle.
    pub async fn refresh_project(&self, webhook_url: &str, project_id: i64) {
        let body = json!({ "projectId": project_id });
        let result = self
            .http
            .post(webhook_url)
            .timeout(REFRESH_TIMEOUT)
            .json(&body)
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => {
                info!("refresh requested for project {}", project_id);
                tokio::time::sleep(REFRESH_SETTLE).await;
            }
            Ok(resp) => warn!(
                "refresh for project {} returned {}",
                project_id,
                resp.status()
            ),
            Err(e) => warn!("refresh for project {} failed: {}", project_id, e),
        }
    }

    // -----------------------------------------------------------------
    // Folders
    // -----------------------------------------------------------------

    /// `(name, parent_id)` for a folder.
    pub async fn folder_info(&self, folder_id: i64) -> SyncResult<(String, Option<i64>)> {
        let url = format!("{}/core/folders/{}", self.base_url, folder_id);
        let payload = self.get_json(&url).await?;
        let name = sanitize(payload["name"].as_str().unwrap_or("Unnamed"));
        Ok((name, extract_parent_id(&payload)))
    }

    /// Resolve a folder id to its full `A/B/C` path by climbing parents.
    ///
    /// Resolved paths are cached; fallbacks never are. With `strict` the
    /// error propagates so the caller can retry instead of misplacing a
    /// document.
    pub async fn resolve_folder_path(
        &self,
        folder_id: Option<i64>,
        fallback: &str,
        strict: bool,
    ) -> SyncResult<String> {
        let Some(folder_id) = folder_id else {
            return Ok(sanitize(fallback));
        };
        if let Some(cached) = self.folder_cache.lock().await.get(&folder_id) {
            return Ok(cached.clone());
        }

        let (name, parent_id) = match self.folder_info(folder_id).await {
            Ok(info) => info,
            Err(e) => {
                error!("cannot fetch folder {}: {}", folder_id, e);
                if strict {
                    return Err(e);
                }
                return Ok(sanitize(fallback));
            }
        };

        let full = match parent_id {
            Some(parent) => {
                let parent_path =
                    Box::pin(self.resolve_folder_path(Some(parent), "", strict)).await?;
                if parent_path.is_empty() {
                    name
                } else {
                    to_key(&[&parent_path, &name])
                }
            }
            None => name,
        };

        self.folder_cache.lock().await.insert(folder_id, full.clone());
        Ok(full)
    }

    async fn fetch_root_folders(&self, project_id: i64) -> Vec<i64> {
        let mut roots = Vec::new();
        let mut offset = 0;
        loop {
            let url = format!(
                "{}/core/folders?projectId={}&offset={}&limit={}",
                self.base_url, project_id, offset, PAGE_LIMIT
            );
            let payload = match self.get_json(&url).await {
                Ok(p) => p,
                Err(e) => {
                    error!("cannot fetch root folders (offset={}): {}", offset, e);
                    break;
                }
            };
            for item in payload["items"].as_array().into_iter().flatten() {
                if let Some(fid) = native_id(&item["folderId"]) {
                    roots.push(fid);
                }
            }
            if !payload["hasMore"].as_bool().unwrap_or(false) {
                break;
            }
            offset += PAGE_LIMIT;
        }
        roots
    }

    /// `{folderId → full path}` for the whole project, BFS from the root
    /// tiles so empty folders are included. Falls back to deriving paths
    /// from document folder ids when the root listing is unavailable.
    pub async fn folder_structure(&self, project_id: i64) -> HashMap<i64, String> {
        let mut folder_map: HashMap<i64, String> = HashMap::new();
        let roots = self.fetch_root_folders(project_id).await;

        if roots.is_empty() {
            warn!("root folder listing unavailable; deriving structure from documents");
            for doc in self.fetch_all_documents(project_id).await {
                let Some(fid) = doc.folder_id else { continue };
                if folder_map.contains_key(&fid) {
                    continue;
                }
                if let Ok(path) = self
                    .resolve_folder_path(Some(fid), doc.folder_name.as_deref().unwrap_or("Documents"), false)
                    .await
                {
                    folder_map.insert(fid, path);
                }
            }
            return folder_map;
        }

        let mut queue: VecDeque<i64> = VecDeque::new();
        for fid in roots {
            match self.resolve_folder_path(Some(fid), "Documents", false).await {
                Ok(path) => {
                    folder_map.insert(fid, path);
                    queue.push_back(fid);
                }
                Err(e) => error!("cannot resolve root folder {}: {}", fid, e),
            }
        }

        while let Some(parent_id) = queue.pop_front() {
            let parent_path = folder_map.get(&parent_id).cloned().unwrap_or_default();
            let mut offset = 0;
            loop {
                let url = format!(
                    "{}/core/folders/{}/children?projectId={}&offset={}&limit={}",
                    self.base_url, parent_id, project_id, offset, PAGE_LIMIT
                );
                let payload = match self.get_json(&url).await {
                    Ok(p) => p,
                    Err(e) => {
                        error!("cannot fetch children of folder {}: {}", parent_id, e);
                        break;
                    }
                };

                for child in payload["items"].as_array().into_iter().flatten() {
                    let Some(cid) = native_id(&child["folderId"]) else {
                        continue;
                    };
                    let name = match child["name"].as_str() {
                        Some(n) => sanitize(n),
                        None => match self.folder_info(cid).await {
                            Ok((n, _)) => n,
                            Err(e) => {
                                error!("cannot resolve child {} name: {}", cid, e);
                                continue;
                            }
                        },
                    };
                    let full = if parent_path.is_empty() {
                        name
                    } else {
                        to_key(&[&parent_path, &name])
                    };
                    if folder_map.insert(cid, full).is_none() {
                        queue.push_back(cid);
                    }
                }

                if !payload["hasMore"].as_bool().unwrap_or(false) {
                    break;
                }
                offset += PAGE_LIMIT;
            }
        }

        info!("folder structure: {} folders", folder_map.len());
        folder_map
    }

    // -----------------------------------------------------------------
    // Documents
    // -----------------------------------------------------------------

    /// All documents in a project, paginated.
    pub async fn fetch_all_documents(&self, project_id: i64) -> Vec<OriginDocument> {
        let mut docs = Vec::new();
        let mut offset = 0;
        loop {
            let url = format!(
                "{}/core/documents?projectId={}&offset={}&limit={}",
                self.base_url, project_id, offset, DOC_PAGE_LIMIT
            );
            let payload = match self.get_json(&url).await {
                Ok(p) => p,
                Err(e) => {
                    error!("cannot list documents (offset={}): {}", offset, e);
                    break;
                }
            };
            for item in payload["items"].as_array().into_iter().flatten() {
                let Some(id) = native_id(&item["documentId"]) else {
                    continue;
                };
                docs.push(OriginDocument {
                    id,
                    filename: sanitize(item["filename"].as_str().unwrap_or("unnamed")),
                    size: item["size"].as_u64().unwrap_or(0),
                    folder_id: native_id(&item["folderId"]),
                    folder_name: item["folderName"].as_str().map(str::to_string),
                });
            }
            if !payload["hasMore"].as_bool().unwrap_or(false) {
                break;
            }
            offset += DOC_PAGE_LIMIT;
        }
        info!("documents collected: {}", docs.len());
        docs
    }

    /// Metadata for one document.
    pub async fn document_meta(&self, document_id: i64) -> SyncResult<Value> {
        let url = format!("{}/core/documents/{}", self.base_url, document_id);
        self.get_json(&url).await
    }

    /// Probe whether a document still exists. 200 → yes, 404 → no;
    /// anything else assumes yes so a transient error never turns into a
    /// delete.
    pub async fn doc_exists(&self, document_id: i64) -> bool {
        let url = format!("{}/core/documents/{}", self.base_url, document_id);
        match self.request(Method::GET, &url, None).await {
            Ok(resp) => match resp.status() {
                StatusCode::OK => true,
                StatusCode::NOT_FOUND => false,
                status => {
                    warn!("doc_exists: unexpected {} for {}", status, document_id);
                    true
                }
            },
            Err(e) => {
                error!("doc_exists: request failed for {}: {}", document_id, e);
                true
            }
        }
    }

    /// Signed download links for a set of document ids: chunked batch
    /// calls first, then per-doc fallback for any misses.
    pub async fn download_links(&self, ids: &[i64]) -> HashMap<i64, String> {
        let mut out = HashMap::new();
        if ids.is_empty() {
            return out;
        }
        let url = format!("{}/core/documents/batch/download", self.base_url);

        for chunk in ids.chunks(LINK_CHUNK) {
            let body = json!({ "DocumentIds": chunk, "DownloadUrlTimeToLive": LINK_TTL });
            match self.post_json(&url, &body).await {
                Ok(Value::Array(items)) => {
                    for (i, item) in items.iter().enumerate() {
                        if let Some(link) = item["downloadLink"].as_str() {
                            if let Some(id) = chunk.get(i) {
                                out.insert(*id, link.to_string());
                            }
                        }
                    }
                }
                Ok(other) => error!("unexpected batch payload shape: {}", other),
                Err(e) => error!("batch download links failed: {}", e),
            }
        }

        let missing: Vec<i64> = ids.iter().copied().filter(|id| !out.contains_key(id)).collect();
        for id in missing {
            let body = json!({ "DocumentIds": [id], "DownloadUrlTimeToLive": LINK_TTL });
            match self.post_json(&url, &body).await {
                Ok(Value::Array(items)) => {
                    if let Some(link) = items.first().and_then(|i| i["downloadLink"].as_str()) {
                        out.insert(id, link.to_string());
                    } else {
                        error!("no download link for doc {}", id);
                    }
                }
                Ok(_) | Err(_) => error!("single download link fetch failed for doc {}", id),
            }
        }
        out
    }

    /// Fetch a signed URL's content. Signed URLs carry their own auth,
    /// so no origin headers are attached.
    pub async fn download(&self, url: &str) -> SyncResult<Vec<u8>> {
        let mut attempt: u32 = 0;
        loop {
            match self.http.get(url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    return Ok(resp.bytes().await?.to_vec());
                }
                Ok(resp)
                    if resp.status() == StatusCode::TOO_MANY_REQUESTS
                        || resp.status().is_server_error() =>
                {
                    if attempt >= 4 {
                        return Err(SyncError::RetriesExhausted(format!(
                            "GET {} -> {}",
                            url,
                            resp.status()
                        )));
                    }
                    tokio::time::sleep(backoff_delay(attempt)).await;
                    attempt += 1;
                }
                Ok(resp) => {
                    let status = resp.status();
                    resp.error_for_status()?;
                    return Err(SyncError::RetriesExhausted(format!("GET {} -> {}", url, status)));
                }
                Err(e) => {
                    if attempt >= 4 {
                        return Err(SyncError::RetriesExhausted(format!("GET {} -> {}", url, e)));
                    }
                    tokio::time::sleep(backoff_delay(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Exponential backoff with full jitter.
fn backoff_delay(attempt: u32) -> Duration {
    let base = backoff_base_delay(attempt);
    let jitter = rand::thread_rng().gen_range(0..250u64);
    base + Duration::from_millis(jitter)
}

fn backoff_base_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE.saturating_mul(2u32.saturating_pow(attempt));
    exp.min(BACKOFF_CAP)
}

/// Accept document/folder/project ids as either a bare integer or the
/// origin's `{ "native": <int> }` wrapper.
pub fn native_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::Object(map) => map.get("native").and_then(Value::as_i64),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Normalize the several shapes the origin uses for a folder's parent.
pub fn extract_parent_id(payload: &Value) -> Option<i64> {
    for key in ["parentId", "parentFolderId", "parentFolder"] {
        if let Some(id) = native_id(&payload[key]) {
            return Some(id);
        }
    }
    // Fallback: links.parent like "/folders/54224569".
    let link = payload["links"]["parent"].as_str()?;
    let idx = link.rfind("/folders/")?;
    let digits: String = link[idx + "/folders/".len()..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_id_shapes() {
        assert_eq!(native_id(&json!(12345678)), Some(12345678));
        assert_eq!(native_id(&json!({ "native": 12345678 })), Some(12345678));
        assert_eq!(native_id(&json!("12345678")), Some(12345678));
        assert_eq!(native_id(&json!({ "native": null })), None);
        assert_eq!(native_id(&json!(null)), None);
        assert_eq!(native_id(&json!([1])), None);
        assert_eq!(native_id(&json!("not-a-number")), None);
    }

    #[test]
    fn test_extract_parent_id_structured() {
        assert_eq!(
            extract_parent_id(&json!({ "parentId": { "native": 77 } })),
            Some(77)
        );
        assert_eq!(
            extract_parent_id(&json!({ "parentFolderId": 88 })),
            Some(88)
        );
    }

    #[test]
    fn test_extract_parent_id_from_links() {
        let payload = json!({ "links": { "parent": "/folders/54224569" } });
        assert_eq!(extract_parent_id(&payload), Some(54224569));
        assert_eq!(extract_parent_id(&json!({ "links": {} })), None);
        assert_eq!(extract_parent_id(&json!({})), None);
    }

    #[test]
    fn test_backoff_base_is_capped() {
        assert_eq!(backoff_base_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_base_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_base_delay(4), Duration::from_secs(16));
        assert_eq!(backoff_base_delay(5), Duration::from_secs(30));
        assert_eq!(backoff_base_delay(30), Duration::from_secs(30));
    }
}
