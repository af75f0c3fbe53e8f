//! s3surge - S3 client core: SigV4 signing, presigned URLs, POST upload
//! policies, and a parallel multipart upload engine for any
//! S3-compatible endpoint (AWS S3, MinIO, Spaces, R2).

pub mod client;
pub mod config;
pub mod credentials;
pub mod encode;
pub mod error;
pub mod multipart;
pub mod policy;
pub mod presign;
pub mod sigv4;
pub mod transport;
pub mod types;

pub use client::{InitiateMultipartUploadInput, ListPartsInput, S3Client};
pub use config::{ClientConfig, Profile, Profiles};
pub use credentials::{CredentialManager, CredentialOrigin, Credentials};
pub use encode::encode_path;
pub use error::{Error, Result};
pub use multipart::{
    MultipartUploadInput, ProgressCallback, DEFAULT_MAX_RETRIES, DEFAULT_PART_SIZE, MAX_PARTS,
    MAX_PART_SIZE, MIN_PART_SIZE,
};
pub use policy::{PostPolicy, PostPolicyInput};
pub use presign::PresignInput;
pub use sigv4::{Payload, Signer, ALGORITHM, EMPTY_SHA256, SERVICE, UNSIGNED_PAYLOAD};
pub use transport::{HyperTransport, Transport};
pub use types::{
    CompleteMultipartUploadOutput, CompletedPart, InitiateMultipartUploadOutput, ListPartsOutput,
    MultipartUploadOutput, PartInfo, ProgressInfo, UploadPartOutput,
};
