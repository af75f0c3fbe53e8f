//! S3 client: URL building, signed request execution, and the multipart
//! wire operations the upload coordinator drives.
//!
//! Clone is cheap: the transport and credential manager are shared
//! behind `Arc`, so clones reuse the same HTTP connection pool.

use crate::config::ClientConfig;
use crate::credentials::{CredentialManager, Credentials};
use crate::encode::{encode_path, uri_encode_into};
use crate::error::{Error, Result};
use crate::multipart::MAX_PARTS;
use crate::policy::{create_upload_policy, with_meta_prefix, PostPolicy, PostPolicyInput};
use crate::presign::{presigned_url, PresignInput};
use crate::sigv4::{Payload, Signer};
use crate::transport::{HyperTransport, Transport};
use crate::types::{
    CompleteMultipartUploadOutput, CompletedPart, InitiateMultipartUploadOutput, ListPartsOutput,
    PartInfo, UploadPartOutput,
};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bytes::Bytes;
use hyper::{HeaderMap, Method, Request, StatusCode};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::BTreeMap;
use std::fmt::Write as FmtWrite;
use std::sync::Arc;

const COMPLETE_XMLNS: &str = "http://s3.amazonaws.com/doc/2006-03-01/";

/// Parameters for [`S3Client::initiate_multipart_upload`].
#[derive(Debug, Clone, Default)]
pub struct InitiateMultipartUploadInput {
    pub bucket: String,
    pub object_key: String,
    pub content_type: Option<String>,
    /// Metadata entries; names gain the `x-amz-meta-` prefix when missing
    pub metadata: Vec<(String, String)>,
    pub acl: Option<String>,
}

/// Parameters for [`S3Client::list_parts`].
#[derive(Debug, Clone, Default)]
pub struct ListPartsInput {
    pub bucket: String,
    pub object_key: String,
    pub upload_id: String,
    /// Page size, up to 1000
    pub max_parts: Option<u32>,
    /// Resume listing after this part number
    pub part_number_marker: Option<u32>,
}

/// S3 client for any SigV4-compatible endpoint.
#[derive(Clone)]
pub struct S3Client {
    transport: Arc<dyn Transport>,
    signer: Signer,
    credentials: Arc<CredentialManager>,
    config: ClientConfig,
}

impl S3Client {
    /// Client with static credentials and the production transport.
    pub fn new(config: ClientConfig, credentials: Credentials) -> Result<Self> {
        let transport = Arc::new(HyperTransport::new(config.request_timeout, config.insecure_tls)?);
        let manager = Arc::new(CredentialManager::new_static(credentials));
        Ok(Self::with_transport(config, transport, manager))
    }

    /// Client whose credentials come from the EC2 instance metadata
    /// service and refresh themselves before expiry.
    pub async fn new_with_instance_metadata(config: ClientConfig) -> Result<Self> {
        let transport: Arc<dyn Transport> =
            Arc::new(HyperTransport::new(config.request_timeout, config.insecure_tls)?);
        let manager = Arc::new(CredentialManager::new_instance_metadata(transport.clone()).await?);
        Ok(Self::with_transport(config, transport, manager))
    }

    /// Client over an explicit transport and credential manager. This is
    /// the seam the test suite uses to substitute a recording stub.
    pub fn with_transport(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        credentials: Arc<CredentialManager>,
    ) -> Self {
        let signer = Signer::new(config.region.clone());
        Self {
            transport,
            signer,
            credentials,
            config,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Sign an arbitrary request, returning the full header map to send.
    /// External per-operation builders consume this and
    /// [`multipart_upload`](Self::multipart_upload); nothing else.
    pub async fn sign_request(
        &self,
        method: &str,
        url: &str,
        headers: BTreeMap<String, String>,
        payload: Payload<'_>,
    ) -> Result<BTreeMap<String, String>> {
        self.credentials.refresh_if_needed().await?;
        let creds = self.credentials.snapshot().await;
        self.signer.sign(method, url, headers, &creds, payload)
    }

    /// Presigned URL carrying the signature in its query string.
    pub async fn presigned_url(&self, input: &PresignInput) -> Result<String> {
        if input.bucket.is_empty() {
            return Err(Error::Validation("bucket name is required".into()));
        }
        if input.object_key.is_empty() {
            return Err(Error::Validation("object key is required".into()));
        }
        self.credentials.refresh_if_needed().await?;
        let creds = self.credentials.snapshot().await;
        presigned_url(&self.signer, &self.config, &creds, input)
    }

    /// Signed POST upload policy for browser-driven uploads.
    pub async fn create_upload_policy(&self, input: &PostPolicyInput) -> Result<PostPolicy> {
        if input.bucket.is_empty() {
            return Err(Error::Validation("bucket name is required".into()));
        }
        if input.object_key.is_empty() {
            return Err(Error::Validation("object key is required".into()));
        }
        self.credentials.refresh_if_needed().await?;
        let creds = self.credentials.snapshot().await;
        create_upload_policy(&self.signer, &self.config, &creds, input)
    }

    /// Build the URL for an object, encoding the bucket/key path.
    pub(crate) fn object_url(&self, bucket: &str, key: &str) -> String {
        let base = self.config.endpoint_base();
        let joined = format!("{}/{}", bucket, key);
        let path = encode_path(&joined);
        let mut url = String::with_capacity(base.len() + 1 + path.len());
        url.push_str(&base);
        url.push('/');
        url.push_str(&path);
        url
    }

    /// Sign and send one request, returning status, headers, and body.
    async fn execute(
        &self,
        method: Method,
        url: &str,
        headers: BTreeMap<String, String>,
        body: Bytes,
        payload: Payload<'_>,
    ) -> Result<(StatusCode, HeaderMap, Bytes)> {
        self.credentials.refresh_if_needed().await?;
        let creds = self.credentials.snapshot().await;
        let signed = self.signer.sign(method.as_str(), url, headers, &creds, payload)?;

        let mut request = Request::builder().method(method).uri(url);
        for (k, v) in &signed {
            request = request.header(k, v);
        }
        let request = request
            .body(body)
            .map_err(|e| Error::Encoding(format!("request build error: {}", e)))?;

        let response = self.transport.send(request).await?;
        let (parts, body) = response.into_parts();
        Ok((parts.status, parts.headers, body))
    }

    /// Initiate a multipart upload (`POST <bucket>/<key>?uploads`).
    pub async fn initiate_multipart_upload(
        &self,
        input: &InitiateMultipartUploadInput,
    ) -> Result<InitiateMultipartUploadOutput> {
        if input.bucket.is_empty() {
            return Err(Error::Validation("bucket name is required".into()));
        }
        if input.object_key.is_empty() {
            return Err(Error::Validation("object key is required".into()));
        }

        let url = format!("{}?uploads", self.object_url(&input.bucket, &input.object_key));

        let mut headers = BTreeMap::new();
        if let Some(content_type) = &input.content_type {
            headers.insert("content-type".to_string(), content_type.clone());
        }
        if let Some(acl) = &input.acl {
            headers.insert("x-amz-acl".to_string(), acl.clone());
        }
        for (k, v) in &input.metadata {
            headers.insert(with_meta_prefix(k), v.clone());
        }

        let (status, _, body) = self
            .execute(Method::POST, &url, headers, Bytes::new(), Payload::None)
            .await?;
        if !status.is_success() {
            return Err(Error::protocol(status, &body));
        }

        parse_initiate_response(&body)
    }

    /// Upload one part (`PUT ?partNumber=<n>&uploadId=<id>`), returning
    /// the server ETag paired with the part number.
    pub async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<UploadPartOutput> {
        if upload_id.is_empty() {
            return Err(Error::Validation("upload ID is required".into()));
        }
        if part_number < 1 || part_number > MAX_PARTS {
            return Err(Error::Validation(format!(
                "part number must be between 1 and {}",
                MAX_PARTS
            )));
        }
        if data.is_empty() {
            return Err(Error::Validation("part body must not be empty".into()));
        }

        let base_url = self.object_url(bucket, key);
        let mut url = String::with_capacity(base_url.len() + 64);
        url.push_str(&base_url);
        url.push_str("?partNumber=");
        let _ = write!(url, "{}", part_number);
        url.push_str("&uploadId=");
        uri_encode_into(&mut url, upload_id, true);

        let mut headers = BTreeMap::new();
        headers.insert("content-length".to_string(), data.len().to_string());

        let (status, resp_headers, body) = self
            .execute(Method::PUT, &url, headers, data.clone(), Payload::Bytes(&data))
            .await?;
        if !status.is_success() {
            return Err(Error::protocol(status, &body));
        }

        let etag = resp_headers
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim_matches('"').to_string())
            .ok_or_else(|| Error::Encoding("missing ETag header in UploadPart response".into()))?;

        Ok(UploadPartOutput { part_number, etag })
    }

    /// Complete a multipart upload. Parts must already be sorted
    /// ascending by part number; the coordinator sorts before calling.
    pub async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<CompleteMultipartUploadOutput> {
        if parts.is_empty() {
            return Err(Error::Validation("parts list cannot be empty".into()));
        }

        let base_url = self.object_url(bucket, key);
        let mut url = String::with_capacity(base_url.len() + 64);
        url.push_str(&base_url);
        url.push_str("?uploadId=");
        uri_encode_into(&mut url, upload_id, true);

        let xml = build_complete_xml(parts);
        let xml_bytes = Bytes::from(xml);

        let md5_hash = md5::compute(&xml_bytes);
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "application/xml".to_string());
        headers.insert("content-length".to_string(), xml_bytes.len().to_string());
        headers.insert("content-md5".to_string(), BASE64_STANDARD.encode(&md5_hash[..]));

        let (status, _, body) = self
            .execute(
                Method::POST,
                &url,
                headers,
                xml_bytes.clone(),
                Payload::Bytes(&xml_bytes),
            )
            .await?;
        if !status.is_success() {
            return Err(Error::protocol(status, &body));
        }

        parse_complete_response(&body)
    }

    /// Abort a multipart upload, deleting all uploaded parts.
    pub async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()> {
        let base_url = self.object_url(bucket, key);
        let mut url = String::with_capacity(base_url.len() + 64);
        url.push_str(&base_url);
        url.push_str("?uploadId=");
        uri_encode_into(&mut url, upload_id, true);

        let (status, _, body) = self
            .execute(Method::DELETE, &url, BTreeMap::new(), Bytes::new(), Payload::None)
            .await?;
        // Abort answers 204 No Content
        if !status.is_success() {
            return Err(Error::protocol(status, &body));
        }
        Ok(())
    }

    /// List uploaded parts of an in-progress multipart upload.
    pub async fn list_parts(&self, input: &ListPartsInput) -> Result<ListPartsOutput> {
        if input.upload_id.is_empty() {
            return Err(Error::Validation("upload ID is required".into()));
        }

        let base_url = self.object_url(&input.bucket, &input.object_key);
        let mut url = String::with_capacity(base_url.len() + 96);
        url.push_str(&base_url);
        url.push('?');
        // Alphabetical parameter order keeps the canonical-query fast path.
        if let Some(max_parts) = input.max_parts {
            let _ = write!(url, "max-parts={}&", max_parts);
        }
        if let Some(marker) = input.part_number_marker {
            let _ = write!(url, "part-number-marker={}&", marker);
        }
        url.push_str("uploadId=");
        uri_encode_into(&mut url, &input.upload_id, true);

        let (status, _, body) = self
            .execute(Method::GET, &url, BTreeMap::new(), Bytes::new(), Payload::None)
            .await?;
        if !status.is_success() {
            return Err(Error::protocol(status, &body));
        }

        parse_list_parts_response(&body)
    }

    pub(crate) async fn abort_best_effort(&self, bucket: &str, key: &str, upload_id: &str) {
        if let Err(err) = self.abort_multipart_upload(bucket, key, upload_id).await {
            tracing::warn!(
                bucket = %bucket,
                key = %key,
                upload_id = %upload_id,
                error = %err,
                "failed to abort multipart upload"
            );
        }
    }
}

/// CompleteMultipartUpload request body, parts in the given order.
fn build_complete_xml(parts: &[CompletedPart]) -> String {
    let mut xml = String::with_capacity(parts.len() * 90 + 96);
    xml.push_str("<CompleteMultipartUpload xmlns=\"");
    xml.push_str(COMPLETE_XMLNS);
    xml.push_str("\">");
    for part in parts {
        xml.push_str("<Part><PartNumber>");
        let _ = write!(xml, "{}", part.part_number);
        xml.push_str("</PartNumber><ETag>\"");
        // Stored ETags carry no quotes; tolerate either form
        xml.push_str(part.etag.trim_matches('"'));
        xml.push_str("\"</ETag></Part>");
    }
    xml.push_str("</CompleteMultipartUpload>");
    xml
}

/// Parse InitiateMultipartUploadResult with byte-slice tag matching.
fn parse_initiate_response(xml_data: &[u8]) -> Result<InitiateMultipartUploadOutput> {
    let mut reader = Reader::from_reader(xml_data);
    reader.config_mut().trim_text_start = true;
    reader.config_mut().trim_text_end = true;

    let mut bucket = String::new();
    let mut key = String::new();
    let mut upload_id = String::new();
    let mut current_text = String::with_capacity(256);

    loop {
        match reader.read_event() {
            Ok(Event::Text(e)) => {
                current_text.clear();
                current_text.push_str(&e.unescape()?);
            }
            Ok(Event::End(e)) => {
                match e.local_name().as_ref() {
                    b"Bucket" => bucket = std::mem::take(&mut current_text),
                    b"Key" => key = std::mem::take(&mut current_text),
                    b"UploadId" => upload_id = std::mem::take(&mut current_text),
                    _ => {}
                }
                current_text.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(Error::Encoding(format!("XML parse error: {}", e))),
            _ => {}
        }
    }

    if upload_id.is_empty() {
        return Err(Error::Encoding("missing UploadId in InitiateMultipartUploadResult".into()));
    }

    Ok(InitiateMultipartUploadOutput { bucket, key, upload_id })
}

/// Parse CompleteMultipartUploadResult.
fn parse_complete_response(xml_data: &[u8]) -> Result<CompleteMultipartUploadOutput> {
    let mut reader = Reader::from_reader(xml_data);
    reader.config_mut().trim_text_start = true;
    reader.config_mut().trim_text_end = true;

    let mut location = None;
    let mut bucket = String::new();
    let mut key = String::new();
    let mut etag = String::new();
    let mut current_text = String::with_capacity(256);

    loop {
        match reader.read_event() {
            Ok(Event::Text(e)) => {
                current_text.clear();
                current_text.push_str(&e.unescape()?);
            }
            Ok(Event::End(e)) => {
                match e.local_name().as_ref() {
                    b"Location" => location = Some(std::mem::take(&mut current_text)),
                    b"Bucket" => bucket = std::mem::take(&mut current_text),
                    b"Key" => key = std::mem::take(&mut current_text),
                    b"ETag" => etag = std::mem::take(&mut current_text).trim_matches('"').to_string(),
                    _ => {}
                }
                current_text.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(Error::Encoding(format!("XML parse error: {}", e))),
            _ => {}
        }
    }

    Ok(CompleteMultipartUploadOutput { location, bucket, key, etag })
}

/// Parse ListPartsResult including pagination markers.
fn parse_list_parts_response(xml_data: &[u8]) -> Result<ListPartsOutput> {
    let mut reader = Reader::from_reader(xml_data);
    reader.config_mut().trim_text_start = true;
    reader.config_mut().trim_text_end = true;

    let mut out = ListPartsOutput::default();
    let mut current_part: Option<PartInfo> = None;
    let mut current_text = String::with_capacity(256);

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"Part" {
                    current_part = Some(PartInfo {
                        part_number: 0,
                        etag: String::new(),
                        size: 0,
                        last_modified: None,
                    });
                }
            }
            Ok(Event::Text(e)) => {
                current_text.clear();
                current_text.push_str(&e.unescape()?);
            }
            Ok(Event::End(e)) => {
                match e.local_name().as_ref() {
                    b"PartNumber" => {
                        if let Some(ref mut part) = current_part {
                            part.part_number = current_text.parse().unwrap_or(0);
                        }
                    }
                    b"ETag" => {
                        if let Some(ref mut part) = current_part {
                            part.etag = current_text.trim_matches('"').to_string();
                        }
                    }
                    b"Size" => {
                        if let Some(ref mut part) = current_part {
                            part.size = current_text.parse().unwrap_or(0);
                        }
                    }
                    b"LastModified" => {
                        if let Some(ref mut part) = current_part {
                            part.last_modified = Some(std::mem::take(&mut current_text));
                        }
                    }
                    b"Part" => {
                        if let Some(part) = current_part.take() {
                            out.parts.push(part);
                        }
                    }
                    b"Bucket" => out.bucket = std::mem::take(&mut current_text),
                    b"Key" => out.key = std::mem::take(&mut current_text),
                    b"UploadId" => out.upload_id = std::mem::take(&mut current_text),
                    b"IsTruncated" => out.is_truncated = current_text == "true",
                    b"NextPartNumberMarker" => {
                        out.next_part_number_marker = current_text.parse().ok();
                    }
                    b"MaxParts" => out.max_parts = current_text.parse().ok(),
                    _ => {}
                }
                current_text.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(Error::Encoding(format!("XML parse error: {}", e))),
            _ => {}
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialManager;

    fn test_client(endpoint: Option<&str>) -> S3Client {
        let mut config = ClientConfig::new("us-east-1").unwrap();
        if let Some(ep) = endpoint {
            config = config.with_endpoint(ep);
        }
        // Parsers and URL builders never touch the network.
        let transport = Arc::new(NullTransport);
        let manager = Arc::new(CredentialManager::new_static(Credentials::from_static(
            "AKID", "secret",
        )));
        S3Client::with_transport(config, transport, manager)
    }

    struct NullTransport;

    #[async_trait::async_trait]
    impl Transport for NullTransport {
        async fn send(&self, _request: Request<Bytes>) -> Result<hyper::Response<Bytes>> {
            Err(Error::Transport("no network in unit tests".into()))
        }
    }

    #[test]
    fn test_object_url_default_endpoint() {
        let client = test_client(None);
        assert_eq!(
            client.object_url("bucket", "path/to/file.txt"),
            "https://s3.us-east-1.amazonaws.com/bucket/path/to/file.txt"
        );
    }

    #[test]
    fn test_object_url_encodes_key() {
        let client = test_client(None);
        assert_eq!(
            client.object_url("bucket", "file with space.txt"),
            "https://s3.us-east-1.amazonaws.com/bucket/file%20with%20space.txt"
        );
    }

    #[test]
    fn test_object_url_custom_endpoint_with_prefix() {
        let client = test_client(Some("https://storage.example.com/base/"));
        assert_eq!(
            client.object_url("bucket", "key"),
            "https://storage.example.com/base/bucket/key"
        );
    }

    #[test]
    fn test_build_complete_xml() {
        let parts = vec![
            CompletedPart::new(1, "p1".to_string()),
            CompletedPart::new(2, "\"p2\"".to_string()),
        ];
        assert_eq!(
            build_complete_xml(&parts),
            "<CompleteMultipartUpload xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">\
             <Part><PartNumber>1</PartNumber><ETag>\"p1\"</ETag></Part>\
             <Part><PartNumber>2</PartNumber><ETag>\"p2\"</ETag></Part>\
             </CompleteMultipartUpload>"
        );
    }

    #[test]
    fn test_parse_initiate_response() {
        let xml = br#"<?xml version="1.0" encoding="UTF-8"?>
<InitiateMultipartUploadResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Bucket>example-bucket</Bucket>
  <Key>example-object</Key>
  <UploadId>VXBsb2FkIElEIGZvciBlbHZpbmcncyBteS1tb3ZpZS5tMnRzIHVwbG9hZA</UploadId>
</InitiateMultipartUploadResult>"#;
        let out = parse_initiate_response(xml).unwrap();
        assert_eq!(out.bucket, "example-bucket");
        assert_eq!(out.key, "example-object");
        assert_eq!(out.upload_id, "VXBsb2FkIElEIGZvciBlbHZpbmcncyBteS1tb3ZpZS5tMnRzIHVwbG9hZA");
    }

    #[test]
    fn test_parse_initiate_response_missing_upload_id() {
        let xml = b"<InitiateMultipartUploadResult></InitiateMultipartUploadResult>";
        assert!(matches!(parse_initiate_response(xml), Err(Error::Encoding(_))));
    }

    #[test]
    fn test_parse_complete_response() {
        let xml = br#"<CompleteMultipartUploadResult>
  <Location>https://example-bucket.s3.us-east-1.amazonaws.com/example-object</Location>
  <Bucket>example-bucket</Bucket>
  <Key>example-object</Key>
  <ETag>"3858f62230ac3c915f300c664312c11f-9"</ETag>
</CompleteMultipartUploadResult>"#;
        let out = parse_complete_response(xml).unwrap();
        assert_eq!(out.etag, "3858f62230ac3c915f300c664312c11f-9");
        assert_eq!(
            out.location.as_deref(),
            Some("https://example-bucket.s3.us-east-1.amazonaws.com/example-object")
        );
    }

    #[test]
    fn test_parse_list_parts_response() {
        let xml = br#"<ListPartsResult>
  <Bucket>example-bucket</Bucket>
  <Key>example-object</Key>
  <UploadId>upload-id-1</UploadId>
  <IsTruncated>true</IsTruncated>
  <NextPartNumberMarker>2</NextPartNumberMarker>
  <MaxParts>2</MaxParts>
  <Part>
    <PartNumber>1</PartNumber>
    <LastModified>2026-01-10T20:48:33.000Z</LastModified>
    <ETag>"7778aef83f66abc1fa1e8477f296d394"</ETag>
    <Size>5242880</Size>
  </Part>
  <Part>
    <PartNumber>2</PartNumber>
    <ETag>"aaaa18db4cc2f85cedef654fccc4a4x8"</ETag>
    <Size>1024</Size>
  </Part>
</ListPartsResult>"#;
        let out = parse_list_parts_response(xml).unwrap();
        assert_eq!(out.upload_id, "upload-id-1");
        assert!(out.is_truncated);
        assert_eq!(out.next_part_number_marker, Some(2));
        assert_eq!(out.parts.len(), 2);
        assert_eq!(out.parts[0].part_number, 1);
        assert_eq!(out.parts[0].etag, "7778aef83f66abc1fa1e8477f296d394");
        assert_eq!(out.parts[0].size, 5_242_880);
        assert_eq!(out.parts[1].last_modified, None);
    }
}
