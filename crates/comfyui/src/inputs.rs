//! Input image readiness.
//!
//! Workflows reference input images by server-side filename
//! (`inputs.image` on `LoadImage`-style nodes). Before submission each
//! referenced image must exist in the server's input folder; missing ones
//! are uploaded from a local directory.

use std::path::Path;

use comfyrun_core::workflow::Workflow;

use crate::api::{ComfyUIApi, ComfyUIApiError};

/// Make sure every input image referenced by `workflow` exists on the
/// server, uploading missing ones from `input_dir`.
///
/// Each distinct filename is checked once. Returns the names that were
/// uploaded. A missing local file or an unreachable server aborts with
/// an error.
pub async fn ensure_input_images(
    api: &ComfyUIApi,
    workflow: &Workflow,
    input_dir: &Path,
) -> Result<Vec<String>, ComfyUIApiError> {
    let mut uploaded = Vec::new();

    for filename in workflow.input_images() {
        if api.input_image_exists(filename).await? {
            tracing::debug!(filename, "Input image already on server");
            continue;
        }

        let local_path = input_dir.join(filename);
        tracing::info!(filename, path = %local_path.display(), "Uploading input image");
        let response = api.upload_image(&local_path, filename).await?;
        tracing::info!(
            filename,
            stored_as = %response.name,
            subfolder = %response.subfolder,
            "Input image uploaded",
        );
        uploaded.push(filename.to_string());
    }

    Ok(uploaded)
}
