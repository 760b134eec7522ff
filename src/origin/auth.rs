//! Origin session authentication.
//!
//! Every origin call carries headers minted from a short-lived session.
//! The session is obtained by posting a keyed MD5 hash of the api key,
//! a millisecond UTC timestamp, and the api secret to the session URL.

use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::info;

/// Credentials for the origin session handshake.
#[derive(Debug, Clone)]
pub struct OriginCredentials {
    pub api_key: String,
    pub api_secret: String,
    pub user_id: String,
    pub org_id: String,
    pub session_url: String,
}

impl OriginCredentials {
    /// Build from an env map; `None` when any required variable is absent.
    pub fn from_env(env: &HashMap<String, String>) -> Option<Self> {
        Some(Self {
            api_key: env.get("API_KEY")?.clone(),
            api_secret: env.get("API_SECRET")?.clone(),
            user_id: env.get("USER_ID")?.clone(),
            org_id: env.get("ORG_ID")?.clone(),
            session_url: env.get("SESSION_URL")?.clone(),
        })
    }
}

/// Tokens returned by the session endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    pub user_id: String,
}

/// `now` as ISO-8601 with millisecond precision and a trailing `Z`.
pub fn api_timestamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// `md5(apiKey + "/" + timestamp + "/" + apiSecret)` as lowercase hex.
pub fn api_hash(api_key: &str, timestamp: &str, api_secret: &str) -> String {
    format!(
        "{:x}",
        md5::compute(format!("{}/{}/{}", api_key, timestamp, api_secret))
    )
}

/// Perform the session handshake and return fresh tokens.
pub async fn authenticate(client: &Client, creds: &OriginCredentials) -> SyncResult<Session> {
    let timestamp = api_timestamp(Utc::now());
    let hash = api_hash(&creds.api_key, &timestamp, &creds.api_secret);

    let body = serde_json::json!({
        "mode": "key",
        "apiKey": creds.api_key,
        "apiSecret": creds.api_secret,
        "apiHash": hash,
        "apiTimestamp": timestamp,
        "userId": creds.user_id,
        "orgId": creds.org_id,
    });

    let resp = client
        .post(&creds.session_url)
        .json(&body)
        .send()
        .await?
        .error_for_status()?;

    let session: Session = resp.json().await?;
    info!("origin session established for user {}", session.user_id);
    Ok(session)
}

/// Request headers for an authenticated origin call.
pub fn session_headers(creds: &OriginCredentials, session: &Session) -> SyncResult<HeaderMap> {
    let mut headers = HeaderMap::new();
    let bearer = format!("Bearer {}", session.access_token);
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&bearer).map_err(|_| SyncError::MissingField("accessToken"))?,
    );
    headers.insert(
        "x-fv-userid",
        HeaderValue::from_str(&session.user_id)
            .map_err(|_| SyncError::MissingField("userId"))?,
    );
    headers.insert(
        "x-fv-orgid",
        HeaderValue::from_str(&creds.org_id).map_err(|_| SyncError::MissingField("orgId"))?,
    );
    headers.insert(
        "x-fv-sessionid",
        HeaderValue::from_str(&session.refresh_token)
            .map_err(|_| SyncError::MissingField("refreshToken"))?,
    );
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_api_timestamp_shape() {
        let t = Utc.with_ymd_and_hms(2024, 3, 5, 12, 30, 45).unwrap();
        let stamp = api_timestamp(t);
        assert_eq!(stamp, "2024-03-05T12:30:45.000Z");
    }

    #[test]
    fn test_api_hash_is_keyed_md5() {
        let hash = api_hash("key", "2024-03-05T12:30:45.000Z", "secret");
        assert_eq!(
            hash,
            format!("{:x}", md5::compute("key/2024-03-05T12:30:45.000Z/secret"))
        );
        assert_eq!(hash.len(), 32);
    }

    #[test]
    fn test_credentials_require_all_fields() {
        let mut env: HashMap<String, String> = [
            ("API_KEY", "k"),
            ("API_SECRET", "s"),
            ("USER_ID", "u"),
            ("ORG_ID", "o"),
            ("SESSION_URL", "https://identity.example.com/session"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        assert!(OriginCredentials::from_env(&env).is_some());
        env.remove("API_SECRET");
        assert!(OriginCredentials::from_env(&env).is_none());
    }

    #[test]
    fn test_session_headers() {
        let creds = OriginCredentials {
            api_key: "k".into(),
            api_secret: "s".into(),
            user_id: "u".into(),
            org_id: "org-9".into(),
            session_url: "https://id.example.com".into(),
        };
        let session = Session {
            access_token: "tok".into(),
            refresh_token: "refresh".into(),
            user_id: "native-user".into(),
        };
        let headers = session_headers(&creds, &session).unwrap();
        assert_eq!(headers[AUTHORIZATION], "Bearer tok");
        assert_eq!(headers["x-fv-userid"], "native-user");
        assert_eq!(headers["x-fv-orgid"], "org-9");
        assert_eq!(headers["x-fv-sessionid"], "refresh");
    }
}
