//! [`CompletionStore`] backed by a DynamoDB table.

use std::collections::HashMap;
use std::fmt;

use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::types::{AttributeValue, DeleteRequest, WriteRequest};

use crate::common::{
    AwsOptions, CompletionRecord, CompletionStore, MAX_BATCH_DELETE, StoreError, StoreResult,
};

/// Attribute holding the trial id, unless configured otherwise.
pub const DEFAULT_KEY_ATTRIBUTE: &str = "job_id";

const PROCESSING_TIME_ATTRIBUTE: &str = "processing_time_ms";
const STATUS_ATTRIBUTE: &str = "status";

/// Reads and clears completion records in a single DynamoDB table.
pub struct DynamoCompletionStore {
    client: Client,
    table: String,
    key_attribute: String,
}

impl DynamoCompletionStore {
    /// Creates a store bound to `table`, keyed by [`DEFAULT_KEY_ATTRIBUTE`].
    pub async fn new(options: &AwsOptions, table: impl Into<String>) -> Self {
        let shared = options.load().await;
        Self {
            client: Client::new(&shared),
            table: table.into(),
            key_attribute: DEFAULT_KEY_ATTRIBUTE.to_owned(),
        }
    }

    /// Overrides the name of the partition key attribute.
    pub fn with_key_attribute(mut self, key_attribute: impl Into<String>) -> Self {
        self.key_attribute = key_attribute.into();
        self
    }

    fn key(&self, id: &str) -> HashMap<String, AttributeValue> {
        HashMap::from([(self.key_attribute.clone(), AttributeValue::S(id.to_owned()))])
    }
}

impl fmt::Debug for DynamoCompletionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamoCompletionStore")
            .field("table", &self.table)
            .field("key_attribute", &self.key_attribute)
            .finish_non_exhaustive()
    }
}

/// Converts a stored item into a [`CompletionRecord`].
///
/// A found item is always a completion. Attributes of an unexpected type are treated as absent.
fn decode_item(id: &str, item: &HashMap<String, AttributeValue>) -> CompletionRecord {
    let processing_time_ms = match item.get(PROCESSING_TIME_ATTRIBUTE) {
        Some(AttributeValue::N(value)) => match value.parse::<f64>() {
            Ok(ms) => Some(ms),
            Err(_) => {
                tracing::warn!(id, %value, "ignoring unparsable processing time");
                None
            }
        },
        Some(other) => {
            tracing::warn!(id, ?other, "ignoring non-numeric processing time");
            None
        }
        None => None,
    };

    let status = match item.get(STATUS_ATTRIBUTE) {
        Some(AttributeValue::S(status)) => Some(status.clone()),
        _ => None,
    };

    CompletionRecord {
        id: id.to_owned(),
        processing_time_ms,
        status,
    }
}

#[async_trait::async_trait]
impl CompletionStore for DynamoCompletionStore {
    fn name(&self) -> &'static str {
        "dynamodb"
    }

    #[tracing::instrument(level = "trace", fields(table = %self.table, id = %id), skip_all)]
    async fn get(&self, id: &str) -> StoreResult<Option<CompletionRecord>> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table)
            .set_key(Some(self.key(id)))
            .send()
            .await
            .map_err(|cause| StoreError::Lookup {
                context: format!("{}[{id}]", self.table),
                cause: cause.into(),
            })?;

        Ok(output.item().map(|item| decode_item(id, item)))
    }

    #[tracing::instrument(level = "trace", fields(table = %self.table), skip_all)]
    async fn list_ids(&self) -> StoreResult<Vec<String>> {
        let mut pages = self
            .client
            .scan()
            .table_name(&self.table)
            .projection_expression("#id")
            .expression_attribute_names("#id", &self.key_attribute)
            .into_paginator()
            .items()
            .send();

        let mut ids = Vec::new();
        while let Some(item) = pages.next().await {
            let item = item.map_err(|cause| StoreError::Scan {
                context: self.table.clone(),
                cause: cause.into(),
            })?;

            match item.get(&self.key_attribute) {
                Some(AttributeValue::S(id)) => ids.push(id.clone()),
                _ => tracing::warn!(table = %self.table, "skipping item without string key"),
            }
        }

        tracing::debug!(count = ids.len(), "scanned completion records");
        Ok(ids)
    }

    #[tracing::instrument(level = "trace", fields(table = %self.table, batch = ids.len()), skip_all)]
    async fn batch_delete(&self, ids: &[String]) -> StoreResult<()> {
        if ids.len() > MAX_BATCH_DELETE {
            return Err(StoreError::BatchTooLarge { len: ids.len() });
        }
        if ids.is_empty() {
            return Ok(());
        }

        let requests = ids
            .iter()
            .map(|id| {
                let delete = DeleteRequest::builder()
                    .set_key(Some(self.key(id)))
                    .build()
                    .map_err(|cause| StoreError::Delete {
                        context: format!("{}[{id}]", self.table),
                        cause: cause.into(),
                    })?;
                Ok(WriteRequest::builder().delete_request(delete).build())
            })
            .collect::<StoreResult<Vec<_>>>()?;

        let output = self
            .client
            .batch_write_item()
            .request_items(&self.table, requests)
            .send()
            .await
            .map_err(|cause| StoreError::Delete {
                context: self.table.clone(),
                cause: cause.into(),
            })?;

        let unprocessed = output
            .unprocessed_items()
            .and_then(|items| items.get(&self.table))
            .map_or(0, Vec::len);
        if unprocessed > 0 {
            tracing::warn!(table = %self.table, unprocessed, "batch delete left items behind");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(attributes: &[(&str, AttributeValue)]) -> HashMap<String, AttributeValue> {
        attributes
            .iter()
            .map(|(name, value)| ((*name).to_owned(), value.clone()))
            .collect()
    }

    #[test]
    fn decodes_processing_time_and_status() {
        let item = item(&[
            ("job_id", AttributeValue::S("abcd1234".to_owned())),
            ("processing_time_ms", AttributeValue::N("412.5".to_owned())),
            ("status", AttributeValue::S("completed".to_owned())),
        ]);

        let record = decode_item("abcd1234", &item);

        assert_eq!(record.id, "abcd1234");
        assert_eq!(record.processing_time_ms, Some(412.5));
        assert_eq!(record.status.as_deref(), Some("completed"));
    }

    #[test]
    fn malformed_processing_time_is_absent() {
        let text = item(&[("processing_time_ms", AttributeValue::S("fast".to_owned()))]);
        assert_eq!(decode_item("a", &text).processing_time_ms, None);

        let garbage = item(&[("processing_time_ms", AttributeValue::N("n/a".to_owned()))]);
        assert_eq!(decode_item("a", &garbage).processing_time_ms, None);
    }

    #[test]
    fn bare_item_is_still_a_completion() {
        let record = decode_item("a", &HashMap::new());
        assert_eq!(record, CompletionRecord::new("a"));
    }
}
