//! Object storage seam and PNG upload.

use async_trait::async_trait;

/// Content type of every uploaded image.
pub const PNG_CONTENT_TYPE: &str = "image/png";

/// Errors from object storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("AWS credentials not found")]
    MissingCredentials,

    #[error("Failed to resolve AWS credentials: {0}")]
    Credentials(String),

    #[error("Failed to upload to s3://{bucket}/{key}: {message}")]
    PutObject {
        bucket: String,
        key: String,
        message: String,
    },
}

/// A bucket/key addressed object store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `body` under `bucket`/`key` in a single request.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError>;
}

/// Turn a server-side image filename into an object key.
///
/// ComfyUI filenames may use `\` separators and a leading separator
/// (`\21_11\run\out_00001_.png`); keys always use `/`, never start with
/// one, and have no empty segments. `prefix` is prepended as a folder.
pub fn object_key(filename: &str, prefix: Option<&str>) -> String {
    let segments = prefix
        .into_iter()
        .chain(std::iter::once(filename))
        .flat_map(|part| part.split(['\\', '/']))
        .filter(|segment| !segment.is_empty());

    segments.collect::<Vec<_>>().join("/")
}

/// Upload one PNG image.
///
/// Logs the destination on success. Missing credentials are logged and
/// returned as [`StorageError::MissingCredentials`]; there is no retry.
pub async fn upload_png(
    store: &dyn ObjectStore,
    file_name: &str,
    data: Vec<u8>,
    bucket: &str,
    key: &str,
) -> Result<(), StorageError> {
    match store.put_object(bucket, key, data, PNG_CONTENT_TYPE).await {
        Ok(()) => {
            tracing::info!(file_name, bucket, key, "Uploaded {file_name} to s3://{bucket}/{key}");
            Ok(())
        }
        Err(StorageError::MissingCredentials) => {
            tracing::error!(
                bucket,
                key,
                "AWS credentials not found. Ensure they're configured in your environment."
            );
            Err(StorageError::MissingCredentials)
        }
        Err(e) => {
            tracing::error!(bucket, key, error = %e, "Upload failed");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use assert_matches::assert_matches;

    use super::*;

    #[derive(Default)]
    struct RecordingStore {
        puts: Mutex<Vec<(String, String, usize, String)>>,
    }

    #[async_trait]
    impl ObjectStore for RecordingStore {
        async fn put_object(
            &self,
            bucket: &str,
            key: &str,
            body: Vec<u8>,
            content_type: &str,
        ) -> Result<(), StorageError> {
            self.puts.lock().unwrap().push((
                bucket.to_string(),
                key.to_string(),
                body.len(),
                content_type.to_string(),
            ));
            Ok(())
        }
    }

    struct NoCredentialsStore;

    #[async_trait]
    impl ObjectStore for NoCredentialsStore {
        async fn put_object(
            &self,
            _bucket: &str,
            _key: &str,
            _body: Vec<u8>,
            _content_type: &str,
        ) -> Result<(), StorageError> {
            Err(StorageError::MissingCredentials)
        }
    }

    #[test]
    fn object_key_normalizes_windows_paths() {
        assert_eq!(
            object_key("\\21_11\\API_Test\\run\\out_00001_.png", None),
            "21_11/API_Test/run/out_00001_.png"
        );
    }

    #[test]
    fn object_key_applies_prefix() {
        assert_eq!(object_key("out.png", Some("comfyui-images")), "comfyui-images/out.png");
        assert_eq!(object_key("/a//b.png", Some("/pre/")), "pre/a/b.png");
    }

    #[test]
    fn object_key_plain_filename_unchanged() {
        assert_eq!(object_key("out.png", None), "out.png");
    }

    #[tokio::test]
    async fn upload_sends_png_content_type() {
        let store = RecordingStore::default();

        upload_png(&store, "out.png", vec![1, 2, 3], "bucket", "dir/out.png")
            .await
            .unwrap();

        let puts = store.puts.lock().unwrap();
        assert_eq!(
            puts.as_slice(),
            &[(
                "bucket".to_string(),
                "dir/out.png".to_string(),
                3,
                PNG_CONTENT_TYPE.to_string()
            )]
        );
    }

    #[tokio::test]
    async fn upload_without_credentials_fails() {
        let result = upload_png(&NoCredentialsStore, "out.png", vec![0], "bucket", "out.png").await;
        assert_matches!(result, Err(StorageError::MissingCredentials));
    }
}
