//! Upload service
//!
//! Copies finished artifacts to remote object storage.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{ObjectCannedAcl, ServerSideEncryption};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::S3Config;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("failed to read artifact {path}: {message}")]
    ReadArtifact { path: PathBuf, message: String },

    #[error("put object {key} failed: {message}")]
    Request { key: String, message: String },
}

/// Uploader trait
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Uploads the file at `local_path` under `key`
    async fn upload(&self, local_path: &Path, key: &str) -> Result<(), UploadError>;
}

/// Uploader writing private, server-side encrypted objects to one S3 bucket
pub struct S3Uploader {
    client: Client,
    bucket: String,
}

impl S3Uploader {
    /// Builds a client with static credentials for the configured region
    pub async fn new(config: &S3Config) -> Self {
        let credentials = Credentials::new(
            config.access_key_id.clone(),
            config.secret_access_key.clone(),
            None,
            None,
            "easel-static",
        );

        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .load()
            .await;

        Self {
            client: Client::new(&sdk_config),
            bucket: config.bucket.clone(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl Uploader for S3Uploader {
    async fn upload(&self, local_path: &Path, key: &str) -> Result<(), UploadError> {
        let body =
            ByteStream::from_path(local_path)
                .await
                .map_err(|e| UploadError::ReadArtifact {
                    path: local_path.to_path_buf(),
                    message: e.to_string(),
                })?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .acl(ObjectCannedAcl::Private)
            .server_side_encryption(ServerSideEncryption::Aes256)
            .content_type("image/png")
            .content_disposition("attachment")
            .send()
            .await
            .map_err(|e| UploadError::Request {
                key: key.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        tracing::info!(bucket = %self.bucket, key, "Artifact uploaded");
        Ok(())
    }
}
