//! POST upload policies for browser-driven uploads.
//!
//! The policy is a base64 JSON document signed with the SigV4 key and
//! embedded as a form field. The `conditions` array is order-sensitive
//! for AWS acceptance, so it is assembled explicitly rather than through
//! a map.

use crate::config::ClientConfig;
use crate::credentials::Credentials;
use crate::error::Result;
use crate::presign::DEFAULT_PRESIGNED_HOST;
use crate::sigv4::{format_amz_date, format_date_stamp, hmac_sha256, Signer, ALGORITHM};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Metadata header prefix added to caller-supplied names that lack it.
pub const AMZ_META_PREFIX: &str = "x-amz-meta-";

fn default_expiration() -> Duration {
    Duration::hours(1)
}

/// Input to [`S3Client::create_upload_policy`](crate::S3Client::create_upload_policy).
#[derive(Debug, Clone)]
pub struct PostPolicyInput {
    pub bucket: String,
    pub object_key: String,
    pub content_type: String,
    /// Exact size the browser must submit (`content-length-range` pins both ends)
    pub file_size: u64,
    pub content_disposition: Option<String>,
    pub acl: Option<String>,
    /// Metadata entries, kept in insertion order in the policy conditions
    pub metadata: Vec<(String, String)>,
    /// Policy validity window; one hour when absent
    pub expiration: Option<Duration>,
    /// Signing instant; current UTC when absent
    pub timestamp: Option<DateTime<Utc>>,
}

impl PostPolicyInput {
    pub fn new(
        bucket: impl Into<String>,
        object_key: impl Into<String>,
        content_type: impl Into<String>,
        file_size: u64,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            object_key: object_key.into(),
            content_type: content_type.into(),
            file_size,
            content_disposition: None,
            acl: None,
            metadata: Vec::new(),
            expiration: None,
            timestamp: None,
        }
    }
}

/// A signed upload policy: the URL to POST to and the form fields the
/// browser must submit unchanged.
#[derive(Debug, Clone)]
pub struct PostPolicy {
    pub post_url: String,
    pub form_fields: BTreeMap<String, String>,
}

/// Serialized field order matters only for reproducibility; AWS reads
/// the keys, but the conditions array must stay in this order.
#[derive(Serialize)]
struct PolicyDocument<'a> {
    expiration: String,
    conditions: &'a [Value],
}

pub(crate) fn create_upload_policy(
    signer: &Signer,
    config: &ClientConfig,
    credentials: &Credentials,
    input: &PostPolicyInput,
) -> Result<PostPolicy> {
    let now = input.timestamp.unwrap_or_else(Utc::now);
    let amz_date = format_amz_date(now);
    let date_stamp = format_date_stamp(now);
    let credential = format!("{}/{}", credentials.access_key_id, signer.scope(&date_stamp));

    let metadata: Vec<(String, String)> = input
        .metadata
        .iter()
        .map(|(k, v)| (with_meta_prefix(k), v.clone()))
        .collect();

    let mut conditions: Vec<Value> = vec![
        json!({ "bucket": input.bucket }),
        json!({ "key": input.object_key }),
        json!({ "Content-Type": input.content_type }),
        json!(["content-length-range", input.file_size, input.file_size]),
        json!({ "x-amz-credential": credential }),
        json!({ "x-amz-algorithm": ALGORITHM }),
        json!({ "x-amz-date": amz_date }),
    ];
    if let Some(disposition) = &input.content_disposition {
        conditions.push(json!({ "Content-Disposition": disposition }));
    }
    if let Some(acl) = &input.acl {
        conditions.push(json!({ "acl": acl }));
    }
    for (k, v) in &metadata {
        let mut entry = serde_json::Map::new();
        entry.insert(k.clone(), Value::String(v.clone()));
        conditions.push(Value::Object(entry));
    }

    let expiration = now + input.expiration.unwrap_or_else(default_expiration);
    let document = PolicyDocument {
        expiration: expiration.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        conditions: &conditions,
    };

    let policy = BASE64_STANDARD.encode(serde_json::to_vec(&document)?);
    let key = signer.signing_key(credentials, &date_stamp);
    let signature = hex::encode(hmac_sha256(&key, policy.as_bytes()));

    let post_url = match &config.endpoint {
        Some(_) => format!("{}/{}", config.endpoint_base(), input.bucket),
        None => format!("https://{}.{}/", input.bucket, DEFAULT_PRESIGNED_HOST),
    };

    let mut form_fields = BTreeMap::new();
    form_fields.insert("key".to_string(), input.object_key.clone());
    form_fields.insert("Content-Type".to_string(), input.content_type.clone());
    form_fields.insert("X-Amz-Credential".to_string(), credential);
    form_fields.insert("X-Amz-Algorithm".to_string(), ALGORITHM.to_string());
    form_fields.insert("X-Amz-Date".to_string(), amz_date);
    form_fields.insert("Policy".to_string(), policy);
    form_fields.insert("X-Amz-Signature".to_string(), signature);
    if let Some(disposition) = &input.content_disposition {
        form_fields.insert("Content-Disposition".to_string(), disposition.clone());
    }
    if let Some(acl) = &input.acl {
        form_fields.insert("acl".to_string(), acl.clone());
    }
    for (k, v) in metadata {
        form_fields.insert(k, v);
    }

    Ok(PostPolicy { post_url, form_fields })
}

/// Prefix a metadata name with `x-amz-meta-` unless already present.
pub(crate) fn with_meta_prefix(name: &str) -> String {
    if name.starts_with(AMZ_META_PREFIX) {
        name.to_string()
    } else {
        format!("{}{}", AMZ_META_PREFIX, name)
    }
}
