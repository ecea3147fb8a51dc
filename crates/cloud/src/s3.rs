//! S3 implementation of [`ObjectStore`].
//!
//! The client is built once from an [`SdkConfig`] (normally loaded
//! through the standard AWS provider chain) and passed to whoever
//! uploads; there is no process-wide client.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, SdkConfig};
use aws_credential_types::provider::error::CredentialsError;
use aws_credential_types::provider::{ProvideCredentials, SharedCredentialsProvider};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;

use crate::store::{ObjectStore, StorageError};

/// S3-backed object store.
pub struct S3Store {
    client: aws_sdk_s3::Client,
    credentials: Option<SharedCredentialsProvider>,
}

impl S3Store {
    /// Load region and credentials from the environment (env vars,
    /// profile files, instance/pod roles) and build a client.
    pub async fn from_env() -> Self {
        let config = aws_config::load_defaults(BehaviorVersion::latest()).await;
        Self::from_config(&config)
    }

    pub fn from_config(config: &SdkConfig) -> Self {
        Self {
            client: aws_sdk_s3::Client::new(config),
            credentials: config.credentials_provider(),
        }
    }

    /// Resolve credentials once, mapping "nothing configured" to
    /// [`StorageError::MissingCredentials`].
    pub async fn check_credentials(&self) -> Result<(), StorageError> {
        let provider = self
            .credentials
            .as_ref()
            .ok_or(StorageError::MissingCredentials)?;

        match provider.provide_credentials().await {
            Ok(_) => Ok(()),
            Err(CredentialsError::CredentialsNotLoaded(_)) => Err(StorageError::MissingCredentials),
            Err(e) => Err(StorageError::Credentials(DisplayErrorContext(&e).to_string())),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError> {
        self.check_credentials().await?;

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| StorageError::PutObject {
                bucket: bucket.to_string(),
                key: key.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use aws_credential_types::provider::future;
    use aws_credential_types::Credentials;
    use aws_sdk_s3::config::Region;

    use super::*;
    use crate::store::upload_png;

    #[derive(Debug)]
    struct EmptyChain;

    impl ProvideCredentials for EmptyChain {
        fn provide_credentials<'a>(&'a self) -> future::ProvideCredentials<'a>
        where
            Self: 'a,
        {
            future::ProvideCredentials::ready(Err(CredentialsError::not_loaded(
                "no providers in chain provided credentials",
            )))
        }
    }

    fn base_config() -> aws_config::SdkConfig {
        SdkConfig::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("eu-west-2"))
            .build()
    }

    #[tokio::test]
    async fn no_provider_means_missing_credentials() {
        let store = S3Store::from_config(&base_config());

        let result = upload_png(&store, "out.png", vec![0u8; 4], "bucket", "out.png").await;

        assert_matches!(result, Err(StorageError::MissingCredentials));
    }

    #[tokio::test]
    async fn empty_provider_chain_means_missing_credentials() {
        let config = base_config()
            .into_builder()
            .credentials_provider(SharedCredentialsProvider::new(EmptyChain))
            .build();
        let store = S3Store::from_config(&config);

        assert_matches!(
            store.check_credentials().await,
            Err(StorageError::MissingCredentials)
        );
    }

    #[tokio::test]
    async fn static_credentials_resolve() {
        let config = base_config()
            .into_builder()
            .credentials_provider(SharedCredentialsProvider::new(Credentials::new(
                "AKIDEXAMPLE",
                "secret",
                None,
                None,
                "test",
            )))
            .build();
        let store = S3Store::from_config(&config);

        assert!(store.check_credentials().await.is_ok());
    }
}
