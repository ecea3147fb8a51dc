//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps the ComfyUI HTTP API (workflow submission, history retrieval,
//! image view/upload, queue deletion) using [`reqwest`].

use std::path::{Path, PathBuf};

use comfyrun_core::workflow::Workflow;
use reqwest::header::{HeaderMap, COOKIE, SET_COOKIE};
use serde::{Deserialize, Serialize};

use crate::history::{HistoryResponse, ImageDescriptor};

/// Folder type of server-side input images.
const INPUT_FOLDER_TYPE: &str = "input";

/// HTTP client for a single ComfyUI instance.
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

/// Load-balancer session cookie returned when a prompt is queued.
///
/// Holds the `name=value` pairs of every `Set-Cookie` header, joined with
/// `"; "`, ready to be replayed as a `Cookie` header so that follow-up
/// requests reach the instance that accepted the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffinityCookie(String);

/// Result of queuing a workflow.
#[derive(Debug, Clone)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    pub prompt_id: String,
    /// Position in the execution queue.
    pub number: i64,
    /// Session-affinity cookie, if the server (or its load balancer) set one.
    pub affinity: Option<AffinityCookie>,
}

/// Response of `POST /upload/image`.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadResponse {
    pub name: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default)]
    pub folder_type: String,
}

#[derive(Serialize)]
struct SubmitRequest<'a> {
    prompt: &'a Workflow,
    client_id: &'a str,
}

#[derive(Deserialize)]
struct SubmitBody {
    prompt_id: String,
    #[serde(default)]
    number: i64,
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// ComfyUI returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// A local input image could not be read for upload.
    #[error("Failed to read input image {path}: {source}")]
    ReadInput {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl AffinityCookie {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Extract the cookie pairs from the `Set-Cookie` headers of a
    /// response, dropping attributes (`Path`, `Expires`, ...).
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let pairs: Vec<&str> = headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter_map(|value| value.split(';').next())
            .map(str::trim)
            .filter(|pair| !pair.is_empty())
            .collect();

        if pairs.is_empty() {
            None
        } else {
            Some(Self(pairs.join("; ")))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl ComfyUIApi {
    /// Create a new API client for a ComfyUI instance.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8188`.
    pub fn new(api_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    /// Create an API client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        let api_url = api_url.into().trim_end_matches('/').to_string();
        Self { client, api_url }
    }

    /// HTTP API base URL.
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Submit a workflow for execution.
    ///
    /// Sends a `POST /prompt` request with the workflow and client ID.
    /// Returns the server-assigned `prompt_id`, queue position and the
    /// affinity cookie to replay on later requests.
    pub async fn submit_workflow(
        &self,
        workflow: &Workflow,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .json(&SubmitRequest {
                prompt: workflow,
                client_id,
            })
            .send()
            .await?;

        let response = Self::ensure_success(response).await?;
        let affinity = AffinityCookie::from_headers(response.headers());
        let body: SubmitBody = response.json().await?;

        Ok(SubmitResponse {
            prompt_id: body.prompt_id,
            number: body.number,
            affinity,
        })
    }

    /// Retrieve execution history for a specific prompt.
    ///
    /// Sends a `GET /history/{prompt_id}` request. The map is empty until
    /// the prompt has finished executing.
    pub async fn get_history(
        &self,
        prompt_id: &str,
        affinity: Option<&AffinityCookie>,
    ) -> Result<HistoryResponse, ComfyUIApiError> {
        let request = self
            .client
            .get(format!("{}/history/{}", self.api_url, prompt_id));
        let response = Self::with_affinity(request, affinity).send().await?;

        Self::parse_response(response).await
    }

    /// Download the bytes of an image via `GET /view`.
    pub async fn get_image(
        &self,
        image: &ImageDescriptor,
        affinity: Option<&AffinityCookie>,
    ) -> Result<Vec<u8>, ComfyUIApiError> {
        let request = self.client.get(format!("{}/view", self.api_url)).query(&[
            ("filename", image.filename.as_str()),
            ("subfolder", image.subfolder.as_str()),
            ("type", image.folder_type.as_str()),
        ]);
        let response = Self::with_affinity(request, affinity).send().await?;
        let response = Self::ensure_success(response).await?;

        Ok(response.bytes().await?.to_vec())
    }

    /// Check whether an input image is already present on the server.
    ///
    /// Any non-2xx answer from `GET /view?type=input` counts as absent.
    pub async fn input_image_exists(&self, filename: &str) -> Result<bool, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/view", self.api_url))
            .query(&[
                ("filename", filename),
                ("subfolder", ""),
                ("type", INPUT_FOLDER_TYPE),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            tracing::debug!(filename, status = status.as_u16(), "Input image not on server");
        }
        Ok(status.is_success())
    }

    /// Upload a local file as input image `name`.
    ///
    /// Sends a multipart `POST /upload/image` with `overwrite=true`. A
    /// `name` containing `/` is split into the `subfolder` field and the
    /// file name.
    pub async fn upload_image(
        &self,
        local_path: &Path,
        name: &str,
    ) -> Result<UploadResponse, ComfyUIApiError> {
        let data = tokio::fs::read(local_path)
            .await
            .map_err(|source| ComfyUIApiError::ReadInput {
                path: local_path.to_path_buf(),
                source,
            })?;

        let (subfolder, file_name) = match name.rsplit_once('/') {
            Some((subfolder, file_name)) => (subfolder.to_string(), file_name.to_string()),
            None => (String::new(), name.to_string()),
        };

        let mut form = reqwest::multipart::Form::new()
            .part(
                "image",
                reqwest::multipart::Part::bytes(data).file_name(file_name),
            )
            .text("overwrite", "true");
        if !subfolder.is_empty() {
            form = form.text("subfolder", subfolder);
        }

        let response = self
            .client
            .post(format!("{}/upload/image", self.api_url))
            .multipart(form)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Cancel a queued execution.
    ///
    /// Sends a `POST /queue` request asking ComfyUI to delete the
    /// specified prompt from the queue. The affinity cookie routes the
    /// request to the instance that accepted the prompt.
    pub async fn cancel_execution(
        &self,
        prompt_id: &str,
        affinity: Option<&AffinityCookie>,
    ) -> Result<(), ComfyUIApiError> {
        let body = serde_json::json!({
            "delete": [prompt_id],
        });

        let request = self
            .client
            .post(format!("{}/queue", self.api_url))
            .json(&body);
        let response = Self::with_affinity(request, affinity).send().await?;

        Self::check_status(response).await
    }

    // ---- private helpers ----

    fn with_affinity(
        request: reqwest::RequestBuilder,
        affinity: Option<&AffinityCookie>,
    ) -> reqwest::RequestBuilder {
        match affinity {
            Some(cookie) => request.header(COOKIE, cookie.as_str()),
            None => request,
        }
    }

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`ComfyUIApiError::ApiError`]
    /// containing the status and body text on failure.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyUIApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyUIApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }

    /// Assert the response has a success status code, discarding the body.
    async fn check_status(response: reqwest::Response) -> Result<(), ComfyUIApiError> {
        Self::ensure_success(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use reqwest::header::HeaderValue;

    use super::*;

    #[test]
    fn affinity_cookie_strips_attributes() {
        let mut headers = HeaderMap::new();
        headers.append(
            SET_COOKIE,
            HeaderValue::from_static("AWSALB=abc123; Expires=Tue, 01 Jan 2030 00:00:00 GMT; Path=/"),
        );
        let cookie = AffinityCookie::from_headers(&headers).unwrap();
        assert_eq!(cookie.as_str(), "AWSALB=abc123");
    }

    #[test]
    fn affinity_cookie_joins_multiple_headers() {
        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_static("AWSALB=abc; Path=/"));
        headers.append(
            SET_COOKIE,
            HeaderValue::from_static("AWSALBCORS=abc; Path=/; SameSite=None; Secure"),
        );
        let cookie = AffinityCookie::from_headers(&headers).unwrap();
        assert_eq!(cookie.as_str(), "AWSALB=abc; AWSALBCORS=abc");
    }

    #[test]
    fn affinity_cookie_absent_without_header() {
        assert!(AffinityCookie::from_headers(&HeaderMap::new()).is_none());
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let api = ComfyUIApi::new("http://localhost:8188/");
        assert_eq!(api.api_url(), "http://localhost:8188");
    }
}
