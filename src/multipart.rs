//! High-level multipart upload coordinator.
//!
//! One `multipart_upload` call owns the whole lifecycle of an upload ID:
//! initiate, stream the body into parts, upload them (sequentially or
//! through a bounded worker pool), complete with parts in ascending
//! order, and on any failure after initiate emit a best-effort abort
//! before surfacing the original error. Per upload ID the states are
//! Init -> (Active <-> Retry)* -> Complete | Aborted.

use crate::client::S3Client;
use crate::error::{Error, Result};
use crate::types::{CompletedPart, MultipartUploadOutput, ProgressInfo, UploadPartOutput};
use bytes::Bytes;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::Mutex;

pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;
pub const MAX_PARTS: u32 = 10_000;
pub const DEFAULT_PART_SIZE: u64 = MIN_PART_SIZE;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BASE: Duration = Duration::from_millis(100);
pub const DEFAULT_RETRY_CAP: Duration = Duration::from_secs(5);

/// Invoked after each completed part. The coordinator serializes calls
/// even in parallel mode.
pub type ProgressCallback = Box<dyn FnMut(ProgressInfo) + Send>;

/// Parameters for [`S3Client::multipart_upload`].
pub struct MultipartUploadInput {
    pub bucket: String,
    pub object_key: String,
    /// Entire object body; parts are zero-copy slices of this buffer
    pub body: Bytes,
    /// Part size in bytes; 5 MiB when absent
    pub part_size: Option<u64>,
    /// Parallel part uploads; 1 (sequential) when absent or non-positive
    pub concurrency: Option<usize>,
    /// Retry budget per part; 3 when absent
    pub max_retries: Option<u32>,
    pub content_type: Option<String>,
    /// Metadata entries; names gain the `x-amz-meta-` prefix when missing
    pub metadata: Vec<(String, String)>,
    pub acl: Option<String>,
    pub on_progress: Option<ProgressCallback>,
}

impl MultipartUploadInput {
    pub fn new(bucket: impl Into<String>, object_key: impl Into<String>, body: Bytes) -> Self {
        Self {
            bucket: bucket.into(),
            object_key: object_key.into(),
            body,
            part_size: None,
            concurrency: None,
            max_retries: None,
            content_type: None,
            metadata: Vec::new(),
            acl: None,
            on_progress: None,
        }
    }

    pub fn with_part_size(mut self, part_size: u64) -> Self {
        self.part_size = Some(part_size);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }
}

/// Shared bookkeeping for progress snapshots.
struct ProgressState {
    total_bytes: u64,
    total_parts: u32,
    started: Instant,
    callback: Option<ProgressCallback>,
}

impl ProgressState {
    fn emit(&mut self, uploaded_bytes: u64, current_part: u32) {
        let Some(callback) = self.callback.as_mut() else {
            return;
        };
        let elapsed = self.started.elapsed().as_secs_f64();
        let bytes_per_second = if elapsed > 0.0 {
            (uploaded_bytes as f64 / elapsed) as u64
        } else {
            0
        };
        callback(ProgressInfo {
            total_bytes: self.total_bytes,
            uploaded_bytes,
            current_part,
            total_parts: self.total_parts,
            bytes_per_second,
        });
    }
}

impl S3Client {
    /// Upload a body as a multipart object.
    ///
    /// Validation failures surface before any request is issued. Every
    /// failure after initiate triggers a best-effort abort for the
    /// allocated upload ID, then the original error is returned.
    pub async fn multipart_upload(&self, mut input: MultipartUploadInput) -> Result<MultipartUploadOutput> {
        if input.bucket.is_empty() {
            return Err(Error::Validation("bucket name is required".into()));
        }
        if input.object_key.is_empty() {
            return Err(Error::Validation("object key is required".into()));
        }
        if input.body.is_empty() {
            return Err(Error::Validation("body must not be empty".into()));
        }

        let part_size = input.part_size.unwrap_or(DEFAULT_PART_SIZE);
        let total_size = input.body.len() as u64;
        let total_parts = validate_part_plan(total_size, part_size)?;

        let concurrency = input.concurrency.unwrap_or(1).max(1);
        let max_retries = input.max_retries.unwrap_or(DEFAULT_MAX_RETRIES);

        let init = self
            .initiate_multipart_upload(&crate::client::InitiateMultipartUploadInput {
                bucket: input.bucket.clone(),
                object_key: input.object_key.clone(),
                content_type: input.content_type.clone(),
                metadata: std::mem::take(&mut input.metadata),
                acl: input.acl.clone(),
            })
            .await?;
        let upload_id = init.upload_id;

        tracing::debug!(
            bucket = %input.bucket,
            key = %input.object_key,
            upload_id = %upload_id,
            total_parts = total_parts,
            part_size = part_size,
            concurrency = concurrency,
            "multipart upload started"
        );

        let mut progress = ProgressState {
            total_bytes: total_size,
            total_parts,
            started: Instant::now(),
            callback: input.on_progress.take(),
        };

        let uploaded = if concurrency <= 1 {
            self.upload_parts_sequential(&input, &upload_id, part_size, total_parts, max_retries, &mut progress)
                .await
        } else {
            self.upload_parts_parallel(
                &input,
                &upload_id,
                part_size,
                total_parts,
                max_retries,
                concurrency,
                &mut progress,
            )
            .await
        };

        let mut completed = match uploaded {
            Ok(parts) => parts,
            Err(err) => {
                self.abort_best_effort(&input.bucket, &input.object_key, &upload_id).await;
                return Err(err);
            }
        };

        // S3 requires ascending part numbers in the completion body.
        completed.sort_by_key(|p| p.part_number);

        let complete = match self
            .complete_multipart_upload(&input.bucket, &input.object_key, &upload_id, &completed)
            .await
        {
            Ok(out) => out,
            Err(err) => {
                self.abort_best_effort(&input.bucket, &input.object_key, &upload_id).await;
                return Err(err);
            }
        };

        Ok(MultipartUploadOutput {
            location: complete.location,
            bucket: complete.bucket,
            key: complete.key,
            etag: complete.etag,
            upload_id,
        })
    }

    /// Read a file and upload it through [`multipart_upload`](Self::multipart_upload).
    pub async fn upload_file(
        &self,
        bucket: &str,
        object_key: &str,
        path: impl AsRef<Path>,
    ) -> Result<MultipartUploadOutput> {
        let data = tokio::fs::read(path.as_ref())
            .await
            .map_err(|e| Error::Transport(format!("failed to read {:?}: {}", path.as_ref(), e)))?;
        self.multipart_upload(MultipartUploadInput::new(bucket, object_key, Bytes::from(data)))
            .await
    }

    async fn upload_parts_sequential(
        &self,
        input: &MultipartUploadInput,
        upload_id: &str,
        part_size: u64,
        total_parts: u32,
        max_retries: u32,
        progress: &mut ProgressState,
    ) -> Result<Vec<CompletedPart>> {
        let mut completed = Vec::with_capacity(total_parts as usize);
        let mut uploaded_bytes = 0u64;

        for part_number in 1..=total_parts {
            let data = slice_part(&input.body, part_number, part_size);
            let len = data.len() as u64;
            let out = self
                .upload_part_with_retry(&input.bucket, &input.object_key, upload_id, part_number, data, max_retries)
                .await?;
            completed.push(CompletedPart::new(out.part_number, out.etag));

            uploaded_bytes += len;
            progress.emit(uploaded_bytes, part_number);
        }

        Ok(completed)
    }

    /// Bounded worker pool: one producer feeds a part channel of capacity
    /// `concurrency`, workers push `(part_number, etag)` completions into
    /// a result channel, and this task collects them, serializing the
    /// progress callback. The first failure sets the cancellation flag;
    /// producer and workers exit within one iteration of observing it.
    async fn upload_parts_parallel(
        &self,
        input: &MultipartUploadInput,
        upload_id: &str,
        part_size: u64,
        total_parts: u32,
        max_retries: u32,
        concurrency: usize,
        progress: &mut ProgressState,
    ) -> Result<Vec<CompletedPart>> {
        let cancel = Arc::new(AtomicBool::new(false));
        let (job_tx, job_rx) = mpsc::channel::<(u32, Bytes)>(concurrency);
        let (result_tx, mut result_rx) = mpsc::channel::<Result<UploadPartOutput>>(total_parts as usize);

        let producer = {
            let body = input.body.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                for part_number in 1..=total_parts {
                    if cancel.load(Ordering::Relaxed) {
                        break;
                    }
                    let data = slice_part(&body, part_number, part_size);
                    // Send fails once every worker is gone; stop producing.
                    if job_tx.send((part_number, data)).await.is_err() {
                        break;
                    }
                }
            })
        };

        let job_rx = Arc::new(Mutex::new(job_rx));
        let mut workers = Vec::with_capacity(concurrency);
        for _ in 0..concurrency {
            let client = self.clone();
            let bucket = input.bucket.clone();
            let key = input.object_key.clone();
            let upload_id = upload_id.to_string();
            let job_rx = Arc::clone(&job_rx);
            let result_tx = result_tx.clone();
            let cancel = cancel.clone();

            workers.push(tokio::spawn(async move {
                loop {
                    if cancel.load(Ordering::Relaxed) {
                        break;
                    }
                    let job = { job_rx.lock().await.recv().await };
                    let Some((part_number, data)) = job else {
                        break;
                    };
                    if cancel.load(Ordering::Relaxed) {
                        break;
                    }

                    match client
                        .upload_part_with_retry(&bucket, &key, &upload_id, part_number, data, max_retries)
                        .await
                    {
                        Ok(out) => {
                            if result_tx.send(Ok(out)).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            cancel.store(true, Ordering::Relaxed);
                            let _ = result_tx.send(Err(err)).await;
                            break;
                        }
                    }
                }
            }));
        }
        // The collector must see the channel close once workers finish.
        drop(result_tx);
        drop(job_rx);

        let mut completed: Vec<CompletedPart> = Vec::with_capacity(total_parts as usize);
        let mut failure: Option<Error> = None;

        while let Some(result) = result_rx.recv().await {
            match result {
                Ok(out) => {
                    completed.push(CompletedPart::new(out.part_number, out.etag));
                    // Approximate accounting: the short last part counts as
                    // full until capping against the total.
                    let uploaded = (completed.len() as u64 * part_size).min(progress.total_bytes);
                    progress.emit(uploaded, completed.len() as u32);
                    if completed.len() as u32 == total_parts {
                        break;
                    }
                }
                Err(err) => {
                    cancel.store(true, Ordering::Relaxed);
                    failure = Some(err);
                    break;
                }
            }
        }

        let _ = producer.await;
        for worker in workers {
            let _ = worker.await;
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(completed),
        }
    }

    /// Upload one part with exponential backoff: attempt k waits
    /// `min(2^(k-1) * 100ms, 5s)` before retrying. Only retryable errors
    /// (transport transience, 5xx) consume the retry budget.
    async fn upload_part_with_retry(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
        max_retries: u32,
    ) -> Result<UploadPartOutput> {
        let mut last_err = None;

        for attempt in 0..=max_retries {
            if attempt > 0 {
                let wait = DEFAULT_RETRY_BASE
                    .saturating_mul(1 << (attempt - 1).min(31))
                    .min(DEFAULT_RETRY_CAP);
                tokio::time::sleep(wait).await;
            }

            match self.upload_part(bucket, key, upload_id, part_number, data.clone()).await {
                Ok(out) => return Ok(out),
                Err(err) if err.is_retryable() => {
                    tracing::debug!(
                        part_number = part_number,
                        attempt = attempt + 1,
                        error = %err,
                        "retrying part upload"
                    );
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_err.expect("retry loop ran at least once"))
    }
}

/// Check part-size bounds and the part-count ceiling, returning the
/// number of parts. Runs before any request is issued.
fn validate_part_plan(total_size: u64, part_size: u64) -> Result<u32> {
    if part_size < MIN_PART_SIZE {
        return Err(Error::Validation(format!(
            "part size must be at least {} bytes",
            MIN_PART_SIZE
        )));
    }
    if part_size > MAX_PART_SIZE {
        return Err(Error::Validation(format!(
            "part size must be at most {} bytes",
            MAX_PART_SIZE
        )));
    }

    let total_parts = total_size.div_ceil(part_size);
    if total_parts > MAX_PARTS as u64 {
        return Err(Error::Validation(format!(
            "object requires {} parts, maximum is {}",
            total_parts, MAX_PARTS
        )));
    }
    Ok(total_parts as u32)
}

/// Part i spans `[(i-1) * part_size, min(i * part_size, total))`.
fn slice_part(body: &Bytes, part_number: u32, part_size: u64) -> Bytes {
    let start = (part_number as u64 - 1) * part_size;
    let end = (start + part_size).min(body.len() as u64);
    body.slice(start as usize..end as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_part_boundaries() {
        let body = Bytes::from(vec![7u8; (MIN_PART_SIZE + 1) as usize]);
        let first = slice_part(&body, 1, MIN_PART_SIZE);
        let second = slice_part(&body, 2, MIN_PART_SIZE);
        assert_eq!(first.len() as u64, MIN_PART_SIZE);
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn test_slice_part_exact_multiple() {
        let body = Bytes::from(vec![0u8; (2 * MIN_PART_SIZE) as usize]);
        assert_eq!(slice_part(&body, 2, MIN_PART_SIZE).len() as u64, MIN_PART_SIZE);
    }

    #[test]
    fn test_constants() {
        assert_eq!(MIN_PART_SIZE, 5_242_880);
        assert_eq!(MAX_PART_SIZE, 5_368_709_120);
        assert_eq!(DEFAULT_PART_SIZE, 5_242_880);
        assert_eq!(MAX_PARTS, 10_000);
    }

    #[test]
    fn test_part_plan_rejects_small_parts() {
        assert!(matches!(
            validate_part_plan(100 * MIN_PART_SIZE, MIN_PART_SIZE - 1),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_part_plan_rejects_oversized_parts() {
        assert!(matches!(
            validate_part_plan(MAX_PART_SIZE, MAX_PART_SIZE + 1),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_part_plan_counts() {
        assert_eq!(validate_part_plan(MIN_PART_SIZE, MIN_PART_SIZE).unwrap(), 1);
        // One extra byte spills into a second, one-byte part
        assert_eq!(validate_part_plan(MIN_PART_SIZE + 1, MIN_PART_SIZE).unwrap(), 2);
        assert_eq!(
            validate_part_plan(MAX_PARTS as u64 * MIN_PART_SIZE, MIN_PART_SIZE).unwrap(),
            MAX_PARTS
        );
    }

    #[test]
    fn test_part_plan_rejects_too_many_parts() {
        let total = MAX_PARTS as u64 * MIN_PART_SIZE + 1;
        assert!(matches!(
            validate_part_plan(total, MIN_PART_SIZE),
            Err(Error::Validation(_))
        ));
    }
}
