//! [`ObjectStore`] over any S3-compatible endpoint.
//!
//! # Environment Variables
//!
//! | Variable | Required | Description |
//! |---|---|---|
//! | `S3_ENDPOINT` | Unless `endpoint` is configured | Endpoint URL |
//! | `S3_ACCESS_KEY` | Yes | Access key |
//! | `S3_SECRET_KEY` | Yes | Secret key |
//! | `S3_BUCKET` | No | Bucket, default `scout-sport` |
//! | `S3_REGION` | No | Region, default `auto` |
//!
//! Values in [`BackupConfig`] win over the environment.

use async_trait::async_trait;
use aws_config::Region;
use aws_sdk_s3::config::{Credentials, StalledStreamProtectionConfig};
use aws_sdk_s3::operation::head_object::HeadObjectError;
use scout_ingest_models::BackupConfig;

use crate::{BackupError, ObjectStore, RemoteMeta};

const DEFAULT_BUCKET: &str = "scout-sport";
const DEFAULT_REGION: &str = "auto";

/// An `aws-sdk-s3` client bound to one bucket.
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3ObjectStore {
    /// Builds a client from `config`, falling back to `S3_*` variables.
    ///
    /// # Errors
    ///
    /// Returns [`BackupError::MissingEnv`] if the endpoint or either
    /// credential is unset.
    pub fn from_env(config: &BackupConfig) -> Result<Self, BackupError> {
        let endpoint = match &config.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => require_env("S3_ENDPOINT")?,
        };
        let access_key = require_env("S3_ACCESS_KEY")?;
        let secret_key = require_env("S3_SECRET_KEY")?;

        let bucket = config
            .bucket
            .clone()
            .or_else(|| std::env::var("S3_BUCKET").ok())
            .unwrap_or_else(|| DEFAULT_BUCKET.to_string());
        let region = config
            .region
            .clone()
            .or_else(|| std::env::var("S3_REGION").ok())
            .unwrap_or_else(|| DEFAULT_REGION.to_string());

        let creds = Credentials::new(&access_key, &secret_key, None, None, "s3-env");

        let sdk_config = aws_sdk_s3::Config::builder()
            .endpoint_url(&endpoint)
            .region(Region::new(region))
            .credentials_provider(creds)
            .force_path_style(true)
            .stalled_stream_protection(StalledStreamProtectionConfig::disabled())
            .build();

        log::debug!("S3 backup target: {endpoint} bucket {bucket}");

        Ok(Self {
            client: aws_sdk_s3::Client::from_conf(sdk_config),
            bucket,
        })
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn head(&self, key: &str) -> Result<Option<RemoteMeta>, BackupError> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(output) => {
                let size = output.content_length().unwrap_or(0);
                #[allow(clippy::cast_sign_loss)]
                let size = size as u64;
                let etag = output.e_tag().map(str::to_string);
                Ok(Some(RemoteMeta { size, etag }))
            }
            Err(err) => {
                if err
                    .as_service_error()
                    .is_some_and(HeadObjectError::is_not_found)
                {
                    return Ok(None);
                }
                Err(BackupError::Head {
                    bucket: self.bucket.clone(),
                    key: key.to_string(),
                    source: Box::new(err),
                })
            }
        }
    }

    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), BackupError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(aws_sdk_s3::primitives::ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| BackupError::Upload {
                bucket: self.bucket.clone(),
                key: key.to_string(),
                source: Box::new(e),
            })?;
        Ok(())
    }
}

fn require_env(name: &str) -> Result<String, BackupError> {
    std::env::var(name).map_err(|_| BackupError::MissingEnv {
        name: name.to_string(),
    })
}
