//! End-to-end invocation of one workflow.
//!
//! [`Invoker::run`] loads and parameterizes a workflow, makes sure its
//! input images are on the server, submits it, waits for the history
//! record, and collects the final images (optionally downloading them
//! and uploading them to object storage).

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio_util::sync::CancellationToken;

use comfyrun_cloud::store::{object_key, upload_png, ObjectStore, StorageError};
use comfyrun_comfyui::api::{AffinityCookie, ComfyUIApi, ComfyUIApiError};
use comfyrun_comfyui::history::{output_images, HistoryRecord, ImageDescriptor};
use comfyrun_comfyui::inputs::ensure_input_images;
use comfyrun_comfyui::poll::{wait_for_completion, PollError};
use comfyrun_core::error::CoreError;
use comfyrun_core::params::{apply_colors, apply_params, apply_token, randomize_seeds};
use comfyrun_core::workflow::{TitleSource, Workflow};

use crate::config::InvokeConfig;

/// Errors that end an invocation.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error(transparent)]
    Workflow(#[from] CoreError),

    #[error(transparent)]
    Api(#[from] ComfyUIApiError),

    #[error(transparent)]
    Poll(#[from] PollError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// One final image of the run.
#[derive(Debug, Clone)]
pub struct OutputImage {
    pub descriptor: ImageDescriptor,
    /// Image bytes, when fetching is enabled.
    pub data: Option<Vec<u8>>,
    /// Object key the image was uploaded to.
    pub object_key: Option<String>,
}

/// Summary of a finished invocation.
#[derive(Debug, Clone)]
pub struct InvocationReport {
    pub client_id: String,
    pub prompt_id: String,
    /// Final images per output node.
    pub outputs: BTreeMap<String, Vec<OutputImage>>,
    pub elapsed: Duration,
}

impl InvocationReport {
    pub fn image_count(&self) -> usize {
        self.outputs.values().map(Vec::len).sum()
    }
}

/// Runs workflows against one ComfyUI server.
pub struct Invoker {
    api: ComfyUIApi,
    store: Option<Arc<dyn ObjectStore>>,
    config: InvokeConfig,
}

/// Load a workflow and apply seeds and titled parameters.
pub fn prepare_workflow<R: Rng + ?Sized>(
    path: &Path,
    config: &InvokeConfig,
    rng: &mut R,
) -> Result<Workflow, CoreError> {
    let mut workflow = Workflow::from_path(path)?;
    tracing::debug!(path = %path.display(), nodes = workflow.len(), "Workflow loaded");

    if config.randomize_seeds {
        let replaced = randomize_seeds(&mut workflow, rng);
        tracing::debug!(replaced, "Randomized seeds");
    }

    let applied = match config.title_source {
        TitleSource::Meta => apply_params(&mut workflow, &config.params, rng),
        TitleSource::Legacy => {
            let params = &config.params;
            let mut applied =
                apply_colors(&mut workflow, &params.color_details, &params.color_body);
            applied.extend(apply_token(&mut workflow, &params.prompt_token));
            applied
        }
    };
    for param in &applied {
        tracing::info!(node_id = %param.node_id, "Set {}", param.label.as_str());
    }

    Ok(workflow)
}

impl Invoker {
    pub fn new(api: ComfyUIApi, config: InvokeConfig) -> Self {
        Self {
            api,
            store: None,
            config,
        }
    }

    /// Attach the object store used when `s3_bucket` is configured.
    pub fn with_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Run the workflow at `path` to completion.
    pub async fn run<R: Rng + ?Sized>(
        &self,
        path: &Path,
        rng: &mut R,
        cancel: &CancellationToken,
    ) -> Result<InvocationReport, InvokeError> {
        let started = Instant::now();

        let workflow = prepare_workflow(path, &self.config, rng)?;
        let uploaded = ensure_input_images(&self.api, &workflow, &self.config.input_dir).await?;
        if !uploaded.is_empty() {
            tracing::info!(count = uploaded.len(), "Uploaded missing input images");
        }

        let client_id = uuid::Uuid::new_v4().to_string();
        let submitted = self.api.submit_workflow(&workflow, &client_id).await?;
        tracing::info!(
            client_id = %client_id,
            prompt_id = %submitted.prompt_id,
            queue_position = submitted.number,
            affinity = submitted.affinity.is_some(),
            "Generation started",
        );

        let affinity = submitted.affinity.as_ref();
        let record = match wait_for_completion(
            &self.api,
            &submitted.prompt_id,
            affinity,
            &self.config.poll,
            cancel,
        )
        .await
        {
            Ok(record) => record,
            Err(e) => {
                if matches!(e, PollError::TimedOut { .. } | PollError::Cancelled { .. }) {
                    self.abandon(&submitted.prompt_id, affinity).await;
                }
                return Err(e.into());
            }
        };

        let outputs = self.collect_outputs(&record, affinity).await?;

        let report = InvocationReport {
            client_id,
            prompt_id: submitted.prompt_id,
            outputs,
            elapsed: started.elapsed(),
        };
        tracing::info!(
            client_id = %report.client_id,
            prompt_id = %report.prompt_id,
            output_nodes = report.outputs.len(),
            images = report.image_count(),
            time_spent_secs = report.elapsed.as_secs_f64(),
            "Inference finished",
        );
        Ok(report)
    }

    /// Best-effort removal of an abandoned prompt from the server queue.
    async fn abandon(&self, prompt_id: &str, affinity: Option<&AffinityCookie>) {
        if !self.config.cancel_on_abort {
            return;
        }
        match self.api.cancel_execution(prompt_id, affinity).await {
            Ok(()) => tracing::info!(prompt_id, "Removed abandoned prompt from queue"),
            Err(e) => tracing::warn!(prompt_id, error = %e, "Failed to remove prompt from queue"),
        }
    }

    async fn collect_outputs(
        &self,
        record: &HistoryRecord,
        affinity: Option<&AffinityCookie>,
    ) -> Result<BTreeMap<String, Vec<OutputImage>>, InvokeError> {
        let fetch = self.config.should_fetch_images();
        let upload = match (&self.store, &self.config.s3_bucket) {
            (Some(store), Some(bucket)) => Some((store.as_ref(), bucket.as_str())),
            _ => None,
        };

        let mut outputs = BTreeMap::new();
        for (node_id, images) in output_images(record) {
            let mut results = Vec::with_capacity(images.len());
            for descriptor in images {
                tracing::info!(
                    node_id = %node_id,
                    filename = %descriptor.filename,
                    subfolder = %descriptor.subfolder,
                    "Output image",
                );

                let mut output = OutputImage {
                    descriptor,
                    data: None,
                    object_key: None,
                };
                if fetch {
                    let data = self.api.get_image(&output.descriptor, affinity).await?;
                    if let Some((store, bucket)) = upload {
                        let filename = &output.descriptor.filename;
                        let key = object_key(filename, self.config.s3_key_prefix.as_deref());
                        upload_png(store, filename, data.clone(), bucket, &key).await?;
                        output.object_key = Some(key);
                    }
                    output.data = Some(data);
                }
                results.push(output);
            }
            outputs.insert(node_id, results);
        }
        Ok(outputs)
    }
}
