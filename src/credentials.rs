//! Credential lifecycle: static keys or IMDSv2 instance credentials
//! that refresh themselves before use.

use crate::error::{Error, Result};
use crate::transport::Transport;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hyper::{Method, Request};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

const IMDS_TOKEN_HEADER: &str = "X-aws-ec2-metadata-token";
const IMDS_TOKEN_TTL_HEADER: &str = "X-aws-ec2-metadata-token-ttl-seconds";
const METADATA_BASE_URL: &str = "http://169.254.169.254/latest";
const SECURITY_CREDENTIALS_URI: &str = "/meta-data/iam/security-credentials/";
const IMDS_TOKEN_URI: &str = "/api/token";
const DEFAULT_IMDS_TOKEN_TTL: &str = "60";

/// Per-call deadline for instance metadata requests.
const IMDS_TIMEOUT: Duration = Duration::from_secs(3);

/// Where a credential came from; only instance-metadata credentials expire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialOrigin {
    Static,
    InstanceMetadata,
}

/// An access key pair with optional session token.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    pub origin: CredentialOrigin,
    /// Set only when origin is [`CredentialOrigin::InstanceMetadata`].
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credentials {
    /// Long-lived credentials supplied at construction.
    pub fn from_static(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
            origin: CredentialOrigin::Static,
            expires_at: None,
        }
    }

    /// Static credentials carrying an STS session token.
    pub fn from_static_with_token(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        session_token: impl Into<String>,
    ) -> Self {
        let token = session_token.into();
        Self {
            session_token: (!token.is_empty()).then_some(token),
            ..Self::from_static(access_key_id, secret_access_key)
        }
    }

    fn from_imds(resp: ImdsCredentials) -> Result<Self> {
        if resp.token.is_empty() {
            return Err(Error::Auth("instance metadata returned an empty session token".into()));
        }
        Ok(Self {
            access_key_id: resp.access_key_id,
            secret_access_key: resp.secret_access_key,
            session_token: Some(resp.token),
            origin: CredentialOrigin::InstanceMetadata,
            expires_at: Some(resp.expiration),
        })
    }

    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        match (self.origin, self.expires_at) {
            (CredentialOrigin::Static, _) => true,
            (CredentialOrigin::InstanceMetadata, Some(expires_at)) => now < expires_at,
            // Unreachable by construction; treat as expired so we re-fetch.
            (CredentialOrigin::InstanceMetadata, None) => false,
        }
    }
}

/// JSON document served by the role credential endpoint.
#[derive(Debug, Deserialize)]
struct ImdsCredentials {
    #[serde(rename = "AccessKeyId")]
    access_key_id: String,
    #[serde(rename = "SecretAccessKey")]
    secret_access_key: String,
    #[serde(rename = "Token")]
    token: String,
    #[serde(rename = "Expiration")]
    expiration: DateTime<Utc>,
}

/// Holds the current credential and refreshes instance-metadata
/// credentials before expiry. Readers take cheap snapshots; at most one
/// refresh is in flight at a time.
pub struct CredentialManager {
    current: RwLock<Credentials>,
    refresh_lock: Mutex<()>,
    imds: Option<ImdsSource>,
}

impl std::fmt::Debug for CredentialManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialManager")
            .field("imds", &self.imds.is_some())
            .finish()
    }
}

struct ImdsSource {
    transport: Arc<dyn Transport>,
    base_url: String,
}

impl CredentialManager {
    /// Manager around credentials that never refresh.
    pub fn new_static(credentials: Credentials) -> Self {
        Self {
            current: RwLock::new(credentials),
            refresh_lock: Mutex::new(()),
            imds: None,
        }
    }

    /// Manager backed by the EC2 instance metadata service. Performs the
    /// initial fetch eagerly so construction fails fast off-instance.
    pub async fn new_instance_metadata(transport: Arc<dyn Transport>) -> Result<Self> {
        Self::new_instance_metadata_at(transport, METADATA_BASE_URL).await
    }

    /// Same as [`new_instance_metadata`](Self::new_instance_metadata) with
    /// a custom metadata base URL.
    pub async fn new_instance_metadata_at(
        transport: Arc<dyn Transport>,
        base_url: impl Into<String>,
    ) -> Result<Self> {
        let source = ImdsSource {
            transport,
            base_url: base_url.into(),
        };
        let credentials = source.fetch().await?;
        Ok(Self {
            current: RwLock::new(credentials),
            refresh_lock: Mutex::new(()),
            imds: Some(source),
        })
    }

    /// Current credential snapshot. Call [`refresh_if_needed`](Self::refresh_if_needed)
    /// first on request paths.
    pub async fn snapshot(&self) -> Credentials {
        self.current.read().await.clone()
    }

    /// Refresh the stored credential when it has expired. No-op for
    /// static credentials. Concurrent callers serialize on a single
    /// refresh; late arrivals observe the already-updated credential.
    pub async fn refresh_if_needed(&self) -> Result<()> {
        if self.current.read().await.is_fresh(Utc::now()) {
            return Ok(());
        }

        let _guard = self.refresh_lock.lock().await;

        // Another caller may have refreshed while we waited on the lock.
        if self.current.read().await.is_fresh(Utc::now()) {
            return Ok(());
        }

        let source = self
            .imds
            .as_ref()
            .ok_or_else(|| Error::Auth("expired credentials with no metadata source".into()))?;

        let fresh = source.fetch().await?;
        tracing::debug!(
            access_key = %fresh.access_key_id,
            expires_at = ?fresh.expires_at,
            "refreshed instance metadata credentials"
        );
        *self.current.write().await = fresh;
        Ok(())
    }
}

impl ImdsSource {
    /// Three-step IMDSv2 fetch: session token, role name, role credentials.
    async fn fetch(&self) -> Result<Credentials> {
        let token = self.fetch_token().await?;

        let creds_url = format!("{}{}", self.base_url, SECURITY_CREDENTIALS_URI);
        let role = self.get_with_token(&creds_url, &token).await?;
        let role = String::from_utf8_lossy(&role).trim().to_string();

        let body = self.get_with_token(&format!("{}{}", creds_url, role), &token).await?;
        let parsed: ImdsCredentials = serde_json::from_slice(&body).map_err(|e| {
            Error::Auth(format!("error parsing role credentials JSON: {}", e))
        })?;

        Credentials::from_imds(parsed)
    }

    async fn fetch_token(&self) -> Result<String> {
        let request = Request::builder()
            .method(Method::PUT)
            .uri(format!("{}{}", self.base_url, IMDS_TOKEN_URI))
            .header(IMDS_TOKEN_TTL_HEADER, DEFAULT_IMDS_TOKEN_TTL)
            .body(Bytes::new())
            .map_err(|e| Error::Auth(format!("error building IMDSv2 token request: {}", e)))?;

        let response = self.send(request).await?;
        if response.status() != hyper::StatusCode::OK {
            return Err(Error::Auth(format!(
                "failed to request IMDSv2 token: status {}",
                response.status()
            )));
        }
        Ok(String::from_utf8_lossy(response.body()).to_string())
    }

    async fn get_with_token(&self, url: &str, token: &str) -> Result<Bytes> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(url)
            .header(IMDS_TOKEN_HEADER, token)
            .body(Bytes::new())
            .map_err(|e| Error::Auth(format!("error building metadata request: {}", e)))?;

        let response = self.send(request).await?;
        if response.status() != hyper::StatusCode::OK {
            return Err(Error::Auth(format!(
                "error fetching instance metadata from {}: status {}",
                url,
                response.status()
            )));
        }
        Ok(response.into_body())
    }

    async fn send(&self, request: Request<Bytes>) -> Result<hyper::Response<Bytes>> {
        match tokio::time::timeout(IMDS_TIMEOUT, self.transport.send(request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(Error::Auth(format!("instance metadata request failed: {}", e))),
            Err(_) => Err(Error::Auth("instance metadata request timed out".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_static_credentials_never_expire() {
        let creds = Credentials::from_static("AKID", "secret");
        assert_eq!(creds.origin, CredentialOrigin::Static);
        assert!(creds.is_fresh(Utc::now() + ChronoDuration::days(365)));
    }

    #[test]
    fn test_empty_session_token_not_stored() {
        let creds = Credentials::from_static_with_token("AKID", "secret", "");
        assert!(creds.session_token.is_none());
    }

    #[test]
    fn test_imds_credentials_require_token() {
        let resp = ImdsCredentials {
            access_key_id: "AKID".into(),
            secret_access_key: "secret".into(),
            token: String::new(),
            expiration: Utc::now(),
        };
        assert!(matches!(Credentials::from_imds(resp), Err(Error::Auth(_))));
    }

    #[test]
    fn test_imds_freshness_window() {
        let resp = ImdsCredentials {
            access_key_id: "AKID".into(),
            secret_access_key: "secret".into(),
            token: "tok".into(),
            expiration: Utc::now() + ChronoDuration::hours(1),
        };
        let creds = Credentials::from_imds(resp).unwrap();
        assert!(creds.is_fresh(Utc::now()));
        assert!(!creds.is_fresh(Utc::now() + ChronoDuration::hours(2)));
    }

    #[test]
    fn test_imds_json_shape() {
        let json = r#"{
            "Code": "Success",
            "LastUpdated": "2025-11-02T10:04:09Z",
            "Type": "AWS-HMAC",
            "AccessKeyId": "ASIAEXAMPLE",
            "SecretAccessKey": "secret",
            "Token": "session-token",
            "Expiration": "2025-11-02T16:39:13Z"
        }"#;
        let parsed: ImdsCredentials = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.access_key_id, "ASIAEXAMPLE");
        assert_eq!(parsed.token, "session-token");
    }

    #[tokio::test]
    async fn test_static_refresh_is_noop() {
        let manager = CredentialManager::new_static(Credentials::from_static("AKID", "secret"));
        manager.refresh_if_needed().await.unwrap();
        let snap = manager.snapshot().await;
        assert_eq!(snap.access_key_id, "AKID");
    }
}
