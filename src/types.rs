//! Multipart wire types and response structures.

use serde::{Deserialize, Serialize};

/// Response from CreateMultipartUpload (`POST ?uploads`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitiateMultipartUploadOutput {
    /// Bucket name
    pub bucket: String,
    /// Object key
    pub key: String,
    /// Upload ID for subsequent UploadPart / Complete / Abort requests
    pub upload_id: String,
}

/// Response from UploadPart: the part number paired with the server ETag
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadPartOutput {
    pub part_number: u32,
    /// ETag without surrounding quotes
    pub etag: String,
}

/// Part entry submitted to CompleteMultipartUpload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    /// Part number (1-10000)
    pub part_number: u32,
    /// ETag returned from UploadPart
    pub etag: String,
}

impl CompletedPart {
    pub fn new(part_number: u32, etag: String) -> Self {
        Self { part_number, etag }
    }
}

/// Response from CompleteMultipartUpload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteMultipartUploadOutput {
    /// Location URL of the completed object
    pub location: Option<String>,
    pub bucket: String,
    pub key: String,
    /// Composite ETag of the assembled object
    pub etag: String,
}

/// One uploaded part as reported by ListParts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartInfo {
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
    pub last_modified: Option<String>,
}

/// Response from ListParts, with pagination markers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListPartsOutput {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
    pub parts: Vec<PartInfo>,
    pub is_truncated: bool,
    pub next_part_number_marker: Option<u32>,
    pub max_parts: Option<u32>,
}

/// Result of a full coordinator run
#[derive(Debug, Clone)]
pub struct MultipartUploadOutput {
    pub location: Option<String>,
    pub bucket: String,
    pub key: String,
    pub etag: String,
    pub upload_id: String,
}

/// Snapshot handed to the progress callback after each completed part.
///
/// In parallel mode `uploaded_bytes` is the approximation
/// `min(completed_parts * part_size, total_bytes)`, which overcounts
/// while the short final part is outstanding; the sequential path
/// accumulates exact sizes.
#[derive(Debug, Clone, Copy)]
pub struct ProgressInfo {
    /// Total bytes to upload
    pub total_bytes: u64,
    /// Bytes uploaded so far
    pub uploaded_bytes: u64,
    /// Parts completed so far (sequential: the part just finished)
    pub current_part: u32,
    /// Total parts in this upload
    pub total_parts: u32,
    /// Average throughput since the upload started; zero while elapsed
    /// time rounds to nothing
    pub bytes_per_second: u64,
}
