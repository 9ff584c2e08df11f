use super::sink::SnapshotSink;
use anyhow::{Context, Result};
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;

/// Publishes snapshots to an S3 bucket with `application/json` content type.
pub struct S3Sink {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3Sink {
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Creates a sink using the ambient AWS configuration (env vars, instance
    /// profile, etc.).
    pub async fn from_env(bucket: impl Into<String>) -> Self {
        let config = aws_config::load_from_env().await;
        Self::new(aws_sdk_s3::Client::new(&config), bucket)
    }
}

#[async_trait::async_trait]
impl SnapshotSink for S3Sink {
    async fn put(&self, key: &str, body: Bytes) -> Result<String> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type("application/json")
            .send()
            .await
            .with_context(|| format!("S3 PutObject failed for s3://{}/{key}", self.bucket))?;

        Ok(format!("s3://{}/{key}", self.bucket))
    }
}
