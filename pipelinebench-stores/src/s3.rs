//! [`ArtifactStore`] backed by S3 or an S3-compatible service such as LocalStack.

use std::fmt;

use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;

use crate::common::{ArtifactStore, AwsOptions, StoreError, StoreResult};

/// Uploads artifacts into a single S3 bucket.
pub struct S3ArtifactStore {
    client: Client,
    bucket: String,
}

impl S3ArtifactStore {
    /// Creates a store bound to `bucket`.
    ///
    /// Path-style addressing is forced whenever an endpoint override is configured, since
    /// LocalStack does not resolve virtual-hosted bucket names.
    pub async fn new(options: &AwsOptions, bucket: impl Into<String>) -> Self {
        let shared = options.load().await;
        let config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(options.endpoint.is_some())
            .build();

        Self {
            client: Client::from_conf(config),
            bucket: bucket.into(),
        }
    }
}

impl fmt::Debug for S3ArtifactStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3ArtifactStore")
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl ArtifactStore for S3ArtifactStore {
    fn name(&self) -> &'static str {
        "s3"
    }

    #[tracing::instrument(level = "trace", fields(bucket = %self.bucket, key = %key), skip_all)]
    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> StoreResult<()> {
        tracing::debug!(bytes = body.len(), "Uploading to s3");

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|cause| StoreError::Upload {
                context: format!("s3://{}/{key}", self.bucket),
                cause: cause.into(),
            })?;

        Ok(())
    }
}
