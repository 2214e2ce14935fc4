//! Amazon S3 as the object store
//!
//! Each event gets its own client, built for the region the event came
//! from. Credentials and everything else come from the usual AWS SDK
//! environment/profile chain.

use aws_sdk_s3::Client;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_smithy_types::timeout::TimeoutConfig;
use bytes::Bytes;
use std::fmt::Debug;
use std::time::Duration;

use crate::store::{ObjectBody, ObjectStore, StoreError, StoreFactory};

/// S3 client settings shared by every region
#[derive(Debug, Clone, Default)]
pub struct S3Config {
    /// Endpoint override (e.g. LocalStack/MinIO)
    pub endpoint: Option<String>,
    /// Address buckets by path instead of by subdomain
    pub force_path_style: bool,
    /// Operation timeout in milliseconds, including SDK-internal retries
    pub timeout_ms: Option<u64>,
}

/// S3-backed [`ObjectStore`]
#[derive(Debug, Clone)]
pub struct S3Store {
    client: Client,
}

impl S3Store {
    /// Build a store from loaded SDK config plus our overrides
    pub fn new(sdk_config: &aws_config::SdkConfig, config: &S3Config) -> Result<Self, StoreError> {
        if sdk_config.region().is_none() {
            return Err(StoreError::InvalidConfig("missing AWS region".to_string()));
        }

        let mut builder = aws_sdk_s3::config::Builder::from(sdk_config);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        if config.force_path_style {
            builder = builder.force_path_style(true);
        }
        if let Some(timeout_ms) = config.timeout_ms {
            let timeout_config = TimeoutConfig::builder()
                .operation_timeout(Duration::from_millis(timeout_ms))
                .build();
            builder = builder.timeout_config(timeout_config);
        }

        Ok(Self::from_client(Client::from_conf(builder.build())))
    }

    /// Wrap a pre-built client
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

impl ObjectStore for S3Store {
    async fn get(&self, bucket: &str, key: &str) -> Result<ObjectBody, StoreError> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_s3_error(e, bucket, key))?;

        log::debug!(
            "opened s3://{bucket}/{key} ({} bytes)",
            response.content_length().unwrap_or(-1)
        );
        Ok(Box::pin(response.body.into_async_read()))
    }

    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<(), StoreError> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| map_s3_error(e, bucket, key))?;
        Ok(())
    }
}

/// Makes a fresh [`S3Store`] for every region asked for
#[derive(Debug, Clone, Default)]
pub struct S3StoreFactory {
    config: S3Config,
}

impl S3StoreFactory {
    pub fn new(config: S3Config) -> Self {
        Self { config }
    }
}

impl StoreFactory for S3StoreFactory {
    type Store = S3Store;

    async fn for_region(&self, region: &str) -> Result<Self::Store, StoreError> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if region.is_empty() {
            log::debug!("no region on the event, using the default region chain");
        } else {
            loader = loader.region(Region::new(region.to_string()));
        }
        let sdk_config = loader.load().await;
        S3Store::new(&sdk_config, &self.config)
    }
}

/// Classify an SDK error by HTTP status
fn map_s3_error<E: Debug>(err: SdkError<E>, bucket: &str, key: &str) -> StoreError {
    match &err {
        SdkError::ServiceError(service_err) => {
            let status = service_err.raw().status().as_u16();
            match status {
                404 => StoreError::not_found(bucket, key),
                401 => StoreError::Unauthorized(format!("{bucket}/{key}")),
                403 => StoreError::Forbidden(format!("{bucket}/{key}")),
                429 | 500 | 502 | 503 | 504 => {
                    StoreError::Throttled(format!("{bucket}/{key} (HTTP {status})"))
                }
                _ => StoreError::S3(format!("{bucket}/{key} (HTTP {status}): {err:?}")),
            }
        }
        SdkError::TimeoutError(_) => StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("S3 timeout for {bucket}/{key}: {err:?}"),
        )),
        SdkError::DispatchFailure(_) => StoreError::Io(std::io::Error::other(format!(
            "S3 connection error for {bucket}/{key}: {err:?}"
        ))),
        _ => StoreError::S3(format!("{bucket}/{key}: {err:?}")),
    }
}
