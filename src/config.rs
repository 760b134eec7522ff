//! Startup configuration: CLI options, environment file, layout constants.
//!
//! A single immutable [`Config`] is built at startup and shared by every
//! component. Missing origin credentials degrade the origin features
//! instead of failing startup; only an unusable mirror root or bucket
//! spec is fatal.

use crate::error::{SyncError, SyncResult};
use crate::origin::auth::OriginCredentials;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Interval between discovery/reconciliation sweeps.
pub const POLL_INTERVAL: Duration = Duration::from_secs(300);

/// Modification-time window under which a both-sides difference is
/// treated as clock skew rather than a change.
pub const SKEW_WINDOW: Duration = Duration::from_secs(2);

/// Immutable process-wide configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Local mirror root (one subdirectory per project).
    pub mirror_root: PathBuf,
    /// Object-store bucket, from `s3://<bucket>`.
    pub bucket: String,
    /// Key prefix under which all projects live.
    pub root_prefix: String,
    /// Organization display segment inserted in every project prefix.
    pub org_folder_name: String,
    /// Known project root folder id on the origin side, if fixed.
    pub root_folder_id: Option<i64>,
    /// Abort origin uploads whose folder path cannot be resolved.
    pub require_resolved: bool,
    /// Forward local changes to the origin as well as the object store.
    pub enable_origin_upload: bool,
    /// Where the project-name → id map is persisted.
    pub project_map_path: PathBuf,
    /// Origin REST base URL.
    pub base_url: String,
    /// Webhook that triggers an origin-side refresh for a project.
    pub webhook_url: Option<String>,
    /// Origin credentials; `None` disables origin features.
    pub origin: Option<OriginCredentials>,
    /// Optional rollout allowlist of origin project ids.
    pub project_allowlist: Option<HashSet<i64>>,
}

impl Config {
    /// Assemble a config from CLI inputs and an env map.
    pub fn build(
        mirror_root: PathBuf,
        s3_path: &str,
        env: &HashMap<String, String>,
    ) -> SyncResult<Self> {
        let bucket = parse_bucket(s3_path)?;

        let origin = OriginCredentials::from_env(env);
        if origin.is_none() {
            warn!("origin credentials incomplete; origin features disabled");
        }

        let webhook_url = env.get("FILEVINE_TO_S3_WEBHOOK").cloned();
        if webhook_url.is_none() {
            warn!("FILEVINE_TO_S3_WEBHOOK not set; project refresh disabled");
        }

        let project_allowlist = match env.get("PROJECT_ALLOWLIST_JSON") {
            Some(raw) if !raw.trim().is_empty() => match serde_json::from_str::<Vec<i64>>(raw) {
                Ok(ids) => Some(ids.into_iter().collect()),
                Err(e) => {
                    warn!("invalid PROJECT_ALLOWLIST_JSON: {}; allowing all projects", e);
                    None
                }
            },
            _ => None,
        };

        let project_map_path = env
            .get("PROJECT_MAP_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| mirror_root.join(".project_map.json"));

        Ok(Config {
            mirror_root,
            bucket,
            root_prefix: env
                .get("S3_ROOT_PREFIX")
                .cloned()
                .unwrap_or_else(|| "mirror".to_string()),
            org_folder_name: env
                .get("ORG_FOLDER_NAME")
                .cloned()
                .unwrap_or_else(|| "Org".to_string()),
            root_folder_id: env
                .get("ROOT_FOLDER_ID")
                .and_then(|v| v.parse().ok()),
            require_resolved: env_flag(env, "REQUIRE_RESOLVED"),
            enable_origin_upload: env_flag(env, "ENABLE_ORIGIN_UPLOAD"),
            project_map_path,
            base_url: env
                .get("FILEVINE_BASE_URL")
                .cloned()
                .unwrap_or_else(|| "https://api.filevineapp.com".to_string()),
            webhook_url,
            origin,
            project_allowlist,
        })
    }

    /// Object-key prefix for a project under this config's layout.
    pub fn project_prefix(&self, project: &str) -> String {
        crate::paths::project_prefix(&self.root_prefix, project, &self.org_folder_name)
    }

    /// Whether a project id passes the rollout allowlist.
    pub fn project_allowed(&self, project_id: i64) -> bool {
        match &self.project_allowlist {
            Some(allowed) => allowed.contains(&project_id),
            None => true,
        }
    }
}

fn env_flag(env: &HashMap<String, String>, key: &str) -> bool {
    env.get(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// Parse `s3://<bucket>` (a trailing slash or extra path is rejected).
fn parse_bucket(s3_path: &str) -> SyncResult<String> {
    let rest = s3_path
        .strip_prefix("s3://")
        .ok_or_else(|| SyncError::Config(format!("S3 path must be s3://<bucket>: {}", s3_path)))?;
    let bucket = rest.trim_end_matches('/');
    if bucket.is_empty() || bucket.contains('/') {
        return Err(SyncError::Config(format!(
            "S3 path must name a bare bucket: {}",
            s3_path
        )));
    }
    Ok(bucket.to_string())
}

/// Parse a `key=value` env file: `#` comments, blank lines, and optional
/// double-quoted values. Returns the process environment overlaid with
/// the file contents (file wins).
pub fn load_env_file(path: Option<&Path>) -> SyncResult<HashMap<String, String>> {
    let mut env: HashMap<String, String> = std::env::vars().collect();

    let Some(path) = path else {
        return Ok(env);
    };

    let content =
        std::fs::read_to_string(path).map_err(|e| SyncError::io(path, e))?;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            warn!("env file: skipping malformed line: {:?}", line);
            continue;
        };
        let key = key.trim();
        let mut value = value.trim();
        if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
            value = &value[1..value.len() - 1];
        }
        env.insert(key.to_string(), value.to_string());
    }
    Ok(env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn env_with(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_bucket() {
        assert_eq!(parse_bucket("s3://two-way-sync").unwrap(), "two-way-sync");
        assert_eq!(parse_bucket("s3://b/").unwrap(), "b");
        assert!(parse_bucket("two-way-sync").is_err());
        assert!(parse_bucket("s3://").is_err());
        assert!(parse_bucket("s3://b/extra").is_err());
    }

    #[test]
    fn test_env_file_parsing() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# origin credentials").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "API_KEY=abc123").unwrap();
        writeln!(file, "SESSION_URL = \"https://identity.example.com/session\"").unwrap();
        writeln!(file, "garbage line").unwrap();
        file.flush().unwrap();

        let env = load_env_file(Some(file.path())).unwrap();
        assert_eq!(env.get("API_KEY").unwrap(), "abc123");
        assert_eq!(
            env.get("SESSION_URL").unwrap(),
            "https://identity.example.com/session"
        );
        assert!(!env.contains_key("garbage line"));
    }

    #[test]
    fn test_build_degrades_without_origin() {
        let env = env_with(&[("S3_ROOT_PREFIX", "cases")]);
        let config = Config::build(PathBuf::from("/tmp/mirror"), "s3://bucket", &env).unwrap();
        assert!(config.origin.is_none());
        assert!(config.webhook_url.is_none());
        assert_eq!(config.root_prefix, "cases");
        assert!(!config.enable_origin_upload);
        assert!(config.project_allowed(12345));
    }

    #[test]
    fn test_build_with_allowlist_and_flags() {
        let env = env_with(&[
            ("PROJECT_ALLOWLIST_JSON", "[2370300, 2455703]"),
            ("ENABLE_ORIGIN_UPLOAD", "true"),
            ("REQUIRE_RESOLVED", "1"),
            ("ROOT_FOLDER_ID", "54224569"),
        ]);
        let config = Config::build(PathBuf::from("/tmp/mirror"), "s3://bucket", &env).unwrap();
        assert!(config.project_allowed(2370300));
        assert!(!config.project_allowed(999));
        assert!(config.enable_origin_upload);
        assert!(config.require_resolved);
        assert_eq!(config.root_folder_id, Some(54224569));
    }

    #[test]
    fn test_project_prefix_layout() {
        let env = env_with(&[("S3_ROOT_PREFIX", "mirror"), ("ORG_FOLDER_NAME", "Acme Legal")]);
        let config = Config::build(PathBuf::from("/tmp/m"), "s3://b", &env).unwrap();
        assert_eq!(
            config.project_prefix("Smith v. Jones"),
            "mirror/Smith v. Jones/Acme Legal/Smith v. Jones"
        );
    }
}
