use async_trait::async_trait;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as AwsS3SdkClient;
use chrono::DateTime;
use tracing::debug;

use super::{BlobError, BlobLocation, BlobMeta, BlobStore};

/// Blob store backed by S3 (or any S3-compatible endpoint).
pub struct S3BlobStore {
    client: AwsS3SdkClient,
}

impl S3BlobStore {
    pub fn new(client: AwsS3SdkClient) -> Self {
        Self { client }
    }

    /// Build a client from the ambient AWS configuration.
    pub async fn from_env(endpoint: Option<String>) -> Self {
        let shared = aws_config::load_from_env().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        Self::new(AwsS3SdkClient::from_conf(builder.build()))
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn read(&self, location: &BlobLocation) -> Result<Vec<u8>, BlobError> {
        let output = self
            .client
            .get_object()
            .bucket(&location.bucket)
            .key(&location.name)
            .send()
            .await
            .map_err(|e| {
                let message = format!("failed to get {location}: {e}");
                match e.into_service_error() {
                    GetObjectError::NoSuchKey(_) => BlobError::NotFound(location.to_string()),
                    _ => BlobError::OperationFailed(message),
                }
            })?;

        let body = output.body.collect().await.map_err(|e| {
            BlobError::OperationFailed(format!("failed to read body of {location}: {e}"))
        })?;
        Ok(body.to_vec())
    }

    async fn write(
        &self,
        location: &BlobLocation,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), BlobError> {
        self.client
            .put_object()
            .bucket(&location.bucket)
            .key(&location.name)
            .content_type(content_type)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| BlobError::OperationFailed(format!("failed to put {location}: {e}")))?;
        Ok(())
    }

    async fn delete(&self, location: &BlobLocation) -> Result<(), BlobError> {
        self.client
            .delete_object()
            .bucket(&location.bucket)
            .key(&location.name)
            .send()
            .await
            .map_err(|e| BlobError::OperationFailed(format!("failed to delete {location}: {e}")))?;
        Ok(())
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<BlobMeta>, BlobError> {
        debug!("listing objects in bucket {} with prefix {}", bucket, prefix);
        let mut objects = Vec::new();
        let mut continuation_token = None;
        loop {
            let mut cmd = self.client.list_objects_v2().bucket(bucket).prefix(prefix);
            if let Some(token) = continuation_token {
                cmd = cmd.continuation_token(token);
            }
            let output = cmd.send().await.map_err(|e| {
                BlobError::OperationFailed(format!("failed to list {bucket}/{prefix}: {e}"))
            })?;

            for object in output.contents() {
                let (Some(name), Some(modified)) = (object.key(), object.last_modified()) else {
                    continue;
                };
                let Some(last_modified) =
                    DateTime::from_timestamp(modified.secs(), modified.subsec_nanos())
                else {
                    continue;
                };
                objects.push(BlobMeta {
                    name: name.to_owned(),
                    last_modified,
                });
            }

            match output.next_continuation_token {
                Some(token) => continuation_token = Some(token),
                None => break,
            }
        }
        Ok(objects)
    }
}
