use std::fmt::Debug;

use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_credential_types::Credentials;
use aws_credential_types::provider::SharedCredentialsProvider;
use bytes::Bytes;
use thiserror::Error;

/// Maximum number of keys a single batch delete may carry.
///
/// This is the hard `BatchWriteItem` limit of DynamoDB. [`CompletionStore::clear_all`] never
/// exceeds it, and the in-memory store rejects larger batches.
pub const MAX_BATCH_DELETE: usize = 25;

/// A type-erased error cause.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The processor's signal that it has handled a trial's artifact.
///
/// The benchmark only ever reads these records. Absence of a record is the normal "not yet
/// processed" state.
#[derive(Clone, Debug, PartialEq)]
pub struct CompletionRecord {
    /// The trial id the record belongs to.
    pub id: String,
    /// Processing time reported by the processor, if it reported one.
    pub processing_time_ms: Option<f64>,
    /// Free-form status written by the processor, e.g. `completed` or `failed`.
    pub status: Option<String>,
}

impl CompletionRecord {
    /// Creates a record for the given id without any optional fields.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            processing_time_ms: None,
            status: None,
        }
    }

    /// Sets the processing time reported by the processor.
    pub fn with_processing_time(mut self, processing_time_ms: f64) -> Self {
        self.processing_time_ms = Some(processing_time_ms);
        self
    }
}

/// Destination for uploaded artifacts.
#[async_trait::async_trait]
pub trait ArtifactStore: Debug + Send + Sync + 'static {
    /// The store name, used for diagnostics.
    fn name(&self) -> &'static str;

    /// Uploads `body` under `key`.
    ///
    /// Callers measure latency around this call. Implementations must not retry beyond what the
    /// underlying client does on its own.
    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> StoreResult<()>;
}

/// Lookup of completion records written by the downstream processor.
#[async_trait::async_trait]
pub trait CompletionStore: Debug + Send + Sync + 'static {
    /// The store name, used for diagnostics.
    fn name(&self) -> &'static str;

    /// Looks up the completion record for `id`.
    ///
    /// Returns `Ok(None)` if no record exists yet. Errors are reserved for transport failures.
    async fn get(&self, id: &str) -> StoreResult<Option<CompletionRecord>>;

    /// Enumerates the ids of all stored records, following pagination to the end.
    async fn list_ids(&self) -> StoreResult<Vec<String>>;

    /// Deletes the given ids in a single call.
    ///
    /// `ids` must not contain more than [`MAX_BATCH_DELETE`] entries.
    async fn batch_delete(&self, ids: &[String]) -> StoreResult<()>;

    /// Removes every stored record, issuing one [`batch_delete`](Self::batch_delete) per chunk of
    /// at most [`MAX_BATCH_DELETE`] ids.
    ///
    /// Returns the number of records deleted. Stops at the first failing batch.
    async fn clear_all(&self) -> StoreResult<usize> {
        let ids = self.list_ids().await?;
        for chunk in ids.chunks(MAX_BATCH_DELETE) {
            self.batch_delete(chunk).await?;
            tracing::trace!(batch = chunk.len(), "deleted completion records");
        }
        Ok(ids.len())
    }
}

/// Errors returned by store clients.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Transport failure while uploading an artifact.
    #[error("upload failed: {context}")]
    Upload {
        /// What was being uploaded.
        context: String,
        /// The underlying client error.
        #[source]
        cause: BoxError,
    },

    /// Transport failure while looking up a completion record.
    #[error("lookup failed: {context}")]
    Lookup {
        /// What was being looked up.
        context: String,
        /// The underlying client error.
        #[source]
        cause: BoxError,
    },

    /// Failure while enumerating stored completion records.
    #[error("scan failed: {context}")]
    Scan {
        /// The table or store being scanned.
        context: String,
        /// The underlying client error.
        #[source]
        cause: BoxError,
    },

    /// Failure while deleting a batch of completion records.
    #[error("batch delete failed: {context}")]
    Delete {
        /// The table or store being cleared.
        context: String,
        /// The underlying client error.
        #[source]
        cause: BoxError,
    },

    /// A batch delete was attempted with more keys than the backend accepts.
    #[error("batch of {len} keys exceeds the limit of {MAX_BATCH_DELETE}")]
    BatchTooLarge {
        /// Number of keys in the rejected batch.
        len: usize,
    },
}

/// Result type for store operations.
pub type StoreResult<T, E = StoreError> = Result<T, E>;

/// Connection settings shared by the AWS-backed stores.
#[derive(Clone, Debug, Default)]
pub struct AwsOptions {
    /// AWS region, e.g. `us-east-1`.
    pub region: String,
    /// Endpoint override, used for LocalStack.
    pub endpoint: Option<String>,
    /// Static access key and secret, used instead of the default credential chain.
    pub static_credentials: Option<(String, String)>,
}

impl AwsOptions {
    /// Resolves a shared SDK configuration from these options.
    pub async fn load(&self) -> SdkConfig {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(self.region.clone()));

        if let Some(endpoint) = &self.endpoint {
            loader = loader.endpoint_url(endpoint.clone());
        }

        if let Some((access_key, secret_key)) = &self.static_credentials {
            loader = loader.credentials_provider(SharedCredentialsProvider::new(Credentials::new(
                access_key.clone(),
                secret_key.clone(),
                None,
                None,
                "pipelinebench",
            )));
        }

        loader.load().await
    }
}
