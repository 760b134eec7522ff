//! Push one local file into the origin at a given folder subpath.
//!
//! Flow: resolve the target folder id, register the document, stream the
//! bytes to the returned signed URL (presigned PUT or multipart POST),
//! then finalize with the folder id in the query string. The origin
//! routes placement by that query parameter, not the body.

use crate::content_type::guess_content_type;
use crate::error::{SyncError, SyncResult};
use crate::origin::client::{native_id, OriginClient};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

/// Where the registered document's bytes should go.
#[derive(Debug, Clone)]
pub struct UploadTarget {
    pub url: String,
    /// Present for presigned-POST targets; absent means presigned PUT.
    pub fields: Option<HashMap<String, String>>,
}

/// Infer the project root folder id: the most common parent among the
/// project's top-level tiles.
pub async fn guess_root_folder_id(client: &OriginClient, project_id: i64) -> Option<i64> {
    let url = format!(
        "{}/core/folders?projectId={}&offset=0&limit=200",
        client.base_url(),
        project_id
    );
    let payload = client.get_json(&url).await.ok()?;
    let mut counts: HashMap<i64, usize> = HashMap::new();
    for item in payload["items"].as_array().into_iter().flatten() {
        if let Some(parent) = native_id(&item["parentId"]) {
            *counts.entry(parent).or_default() += 1;
        }
    }
    counts.into_iter().max_by_key(|(_, n)| *n).map(|(id, _)| id)
}

async fn list_children(client: &OriginClient, project_id: i64, folder_id: i64) -> Vec<Value> {
    let mut items = Vec::new();
    let mut offset = 0;
    loop {
        let url = format!(
            "{}/core/folders/{}/children?projectId={}&offset={}&limit=500",
            client.base_url(),
            folder_id,
            project_id,
            offset
        );
        let page = match client.get_json(&url).await {
            Ok(p) => p,
            Err(e) => {
                warn!("cannot list children of {}: {}", folder_id, e);
                break;
            }
        };
        let Some(batch) = page["items"].as_array() else { break };
        if batch.is_empty() {
            break;
        }
        let len = batch.len();
        items.extend(batch.iter().cloned());
        if len < 500 {
            break;
        }
        offset += 500;
    }
    items
}

/// Resolve `subpath` (case-insensitive) under a root folder id.
pub async fn resolve_under_root(
    client: &OriginClient,
    project_id: i64,
    root_folder_id: i64,
    subpath: &str,
) -> Option<i64> {
    let normalized = subpath.replace('\\', "/");
    let segments: Vec<String> = normalized
        .split('/')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    if segments.is_empty() {
        return Some(root_folder_id);
    }

    let mut current = root_folder_id;
    for segment in segments {
        let target = segment.to_lowercase();
        let mut found = None;
        for child in list_children(client, project_id, current).await {
            let cid = native_id(&child["folderId"]);
            let name = child["name"].as_str().unwrap_or("").trim().to_lowercase();
            if let (Some(cid), true) = (cid, name == target) {
                found = Some(cid);
                break;
            }
        }
        current = found?;
    }
    Some(current)
}

/// Resolve with fallback variants when the direct subpath misses:
/// prepend `Documents/`, drop a leading `Documents/`, then try any root
/// tile whose name contains "doc".
pub async fn resolve_smart_path(
    client: &OriginClient,
    project_id: i64,
    root_folder_id: i64,
    subpath: &str,
) -> Option<i64> {
    if let Some(fid) = resolve_under_root(client, project_id, root_folder_id, subpath).await {
        return Some(fid);
    }

    let root_children = list_children(client, project_id, root_folder_id).await;
    let names: Vec<String> = root_children
        .iter()
        .filter_map(|c| c["name"].as_str().map(|n| n.trim().to_string()))
        .collect();

    let lower = subpath.to_lowercase();
    if names.iter().any(|n| n.eq_ignore_ascii_case("documents")) && !lower.starts_with("documents/")
    {
        let candidate = format!("Documents/{}", subpath);
        if let Some(fid) = resolve_under_root(client, project_id, root_folder_id, &candidate).await
        {
            return Some(fid);
        }
    }

    let marker = "documents/";
    let has_marker_prefix = subpath
        .get(..marker.len())
        .is_some_and(|p| p.eq_ignore_ascii_case(marker));
    if has_marker_prefix && subpath.len() > marker.len() {
        if let Some(fid) =
            resolve_under_root(client, project_id, root_folder_id, &subpath[marker.len()..]).await
        {
            return Some(fid);
        }
    }

    for name in &names {
        if name.to_lowercase().contains("doc") {
            let candidate = format!("{}/{}", name, subpath);
            if let Some(fid) =
                resolve_under_root(client, project_id, root_folder_id, &candidate).await
            {
                return Some(fid);
            }
        }
    }

    None
}

/// Register a document shell and get back its id plus upload target.
async fn register_document(
    client: &OriginClient,
    file_name: &str,
    file_size: u64,
) -> SyncResult<(i64, UploadTarget)> {
    let url = format!("{}/core/Documents", client.base_url());
    let body = json!({
        "fileName": file_name,
        "length": file_size,
        "contentType": guess_content_type(file_name),
    });
    let data = client.post_json(&url, &body).await?;

    let doc_id = native_id(&data["documentId"]).ok_or(SyncError::MissingField("documentId"))?;
    let upload_url = data["url"]
        .as_str()
        .ok_or(SyncError::MissingField("url"))?
        .to_string();
    let fields = data["fields"].as_object().map(|map| {
        map.iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect()
    });

    Ok((doc_id, UploadTarget { url: upload_url, fields }))
}

/// Stream file bytes to the signed target. Handles both presigned PUT
/// and presigned multipart POST.
async fn upload_to_signed_url(target: &UploadTarget, local_path: &Path) -> SyncResult<bool> {
    let bytes = tokio::fs::read(local_path)
        .await
        .map_err(|e| SyncError::io(local_path, e))?;
    let file_name = local_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string());
    let ctype = guess_content_type(&file_name);

    let http = reqwest::Client::new();
    if let Some(fields) = &target.fields {
        let mut form = reqwest::multipart::Form::new();
        for (k, v) in fields {
            form = form.text(k.clone(), v.clone());
        }
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(ctype)
            .map_err(|e| SyncError::Parse(e.to_string()))?;
        form = form.part("file", part);
        let resp = http.post(&target.url).multipart(form).send().await?;
        Ok(resp.status().is_success())
    } else {
        let resp = http
            .put(&target.url)
            .header("Content-Type", ctype)
            .body(bytes)
            .send()
            .await?;
        Ok(matches!(resp.status().as_u16(), 200 | 204))
    }
}

/// Associate the uploaded content with the project, placing it by folder
/// id in the query string.
async fn finalize_document(
    client: &OriginClient,
    project_id: i64,
    doc_id: i64,
    file_name: &str,
    file_size: u64,
    folder_id: Option<i64>,
) -> SyncResult<()> {
    let base = format!(
        "{}/core/projects/{}/Documents/{}",
        client.base_url(),
        project_id,
        doc_id
    );
    let url = match folder_id {
        Some(fid) => format!("{}?folderId={}", base, fid),
        None => base,
    };
    let body = json!({
        "fileName": file_name,
        "contentType": guess_content_type(file_name),
        "length": file_size,
    });
    client.post_json(&url, &body).await?;
    Ok(())
}

/// Upload one local file to the origin under `folder_subpath`.
///
/// Returns the new document id. With `require_resolved`, an unresolvable
/// subpath aborts; otherwise the file lands in the project root.
pub async fn upload_file(
    client: &OriginClient,
    project_id: i64,
    local_path: &Path,
    folder_subpath: &str,
    root_folder_id: Option<i64>,
    require_resolved: bool,
) -> SyncResult<i64> {
    let subpath = folder_subpath.trim().trim_matches(|c| c == '/' || c == '\\');

    let root_id = match root_folder_id {
        Some(id) => id,
        None => guess_root_folder_id(client, project_id)
            .await
            .ok_or_else(|| {
                SyncError::Parse(format!(
                    "cannot determine root folder for project {}",
                    project_id
                ))
            })?,
    };

    let folder_id = match resolve_smart_path(client, project_id, root_id, subpath).await {
        Some(fid) => Some(fid),
        None if require_resolved && !subpath.is_empty() => {
            return Err(SyncError::Parse(format!(
                "cannot resolve folder path '{}' under root {}",
                subpath, root_id
            )));
        }
        None => {
            warn!(
                "cannot resolve '{}' under root {}; uploading to project root",
                subpath, root_id
            );
            Some(root_id)
        }
    };

    let metadata = tokio::fs::metadata(local_path)
        .await
        .map_err(|e| SyncError::io(local_path, e))?;
    let file_name = local_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string());
    let file_size = metadata.len();

    let (doc_id, target) = register_document(client, &file_name, file_size).await?;
    info!("[Project {}] [Doc {}] registered", project_id, doc_id);

    let mut uploaded = false;
    for attempt in 0..3 {
        if upload_to_signed_url(&target, local_path).await? {
            uploaded = true;
            break;
        }
        warn!(
            "[Project {}] [Doc {}] upload attempt {} failed, retrying",
            project_id,
            doc_id,
            attempt + 1
        );
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    }
    if !uploaded {
        return Err(SyncError::RetriesExhausted(format!(
            "signed upload failed for doc {}",
            doc_id
        )));
    }
    info!("[Project {}] [Doc {}] content uploaded", project_id, doc_id);

    finalize_document(client, project_id, doc_id, &file_name, file_size, folder_id).await?;
    info!(
        "[Project {}] [Doc {}] finalized (folderId={:?})",
        project_id, doc_id, folder_id
    );
    Ok(doc_id)
}
