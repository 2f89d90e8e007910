// Bounded fan-out of colorization work.
//
// Every item of a batch runs on its own task. Blocking decode/encode/file
// work goes through the `WorkerPool`; calls to the colorizer are capped
// process-wide by a semaphore whose permit is held only around the call.

use crate::colorizer::Colorizer;
use crate::image_codec;
use crate::worker_pool::WorkerPool;
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ItemError {
    #[error("could not decode input image: {0}")]
    DecodeFailure(String),
    #[error("colorization failed: {0}")]
    TransformFailure(String),
    #[error("could not write result: {0}")]
    EncodeFailure(String),
}

impl ItemError {
    fn kind(&self) -> &'static str {
        match self {
            ItemError::DecodeFailure(_) => "decode",
            ItemError::TransformFailure(_) => "transform",
            ItemError::EncodeFailure(_) => "encode",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("failed to process any of {attempted} image(s)")]
pub struct NoItemsSucceeded {
    pub attempted: usize,
}

/// One input file and the result path reserved for it.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub index: u64,
    pub input: PathBuf,
    pub output: PathBuf,
}

#[derive(Debug)]
pub struct ProcessingOutcome {
    pub index: u64,
    pub result: Result<PathBuf, ItemError>,
}

impl ProcessingOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug, Default)]
pub struct BatchReport {
    /// Ordered by index.
    pub outcomes: Vec<ProcessingOutcome>,
}

impl BatchReport {
    pub fn processed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn ensure_any_succeeded(self) -> Result<Self, NoItemsSucceeded> {
        if self.processed_count() == 0 {
            Err(NoItemsSucceeded {
                attempted: self.outcomes.len(),
            })
        } else {
            Ok(self)
        }
    }
}

#[derive(Clone)]
pub struct ProcessingPipeline {
    colorizer: Arc<dyn Colorizer>,
    workers: WorkerPool,
    call_limit: Arc<Semaphore>,
    call_timeout: Duration,
}

impl ProcessingPipeline {
    pub fn new(
        colorizer: Arc<dyn Colorizer>,
        workers: WorkerPool,
        max_concurrent_calls: usize,
        call_timeout: Duration,
    ) -> Self {
        Self {
            colorizer,
            workers,
            call_limit: Arc::new(Semaphore::new(max_concurrent_calls.max(1))),
            call_timeout,
        }
    }

    pub async fn process_batch(&self, session: &str, items: Vec<WorkItem>) -> BatchReport {
        let handles: Vec<_> = items
            .into_iter()
            .map(|item| {
                let pipeline = self.clone();
                let session = session.to_string();
                let index = item.index;
                let handle = tokio::spawn(async move { pipeline.process_item(&session, item).await });
                (index, handle)
            })
            .collect();

        let mut outcomes = Vec::with_capacity(handles.len());
        for (index, handle) in handles {
            let result = handle
                .await
                .unwrap_or_else(|err| Err(ItemError::TransformFailure(format!("task failed: {}", err))));

            match &result {
                Ok(path) => {
                    tracing::info!(session, item = index, "Processed {}", path.display());
                    metrics::counter!("colorize_items_total", "outcome" => "success").increment(1);
                }
                Err(err) => {
                    tracing::warn!(session, item = index, "Item failed: {}", err);
                    metrics::counter!("colorize_items_total", "outcome" => err.kind()).increment(1);
                }
            }
            outcomes.push(ProcessingOutcome { index, result });
        }

        outcomes.sort_by_key(|o| o.index);
        BatchReport { outcomes }
    }

    async fn process_item(&self, session: &str, item: WorkItem) -> Result<PathBuf, ItemError> {
        let WorkItem { index, input, output } = item;
        tracing::debug!(session, item = index, "Decoding {}", input.display());

        let png = self
            .workers
            .run(move || {
                let data = std::fs::read(&input).map_err(|e| ItemError::DecodeFailure(e.to_string()))?;
                image_codec::normalize_to_png(&data, None)
                    .map_err(|e| ItemError::DecodeFailure(e.to_string()))
            })
            .await
            .map_err(|e| ItemError::DecodeFailure(e.to_string()))??;

        let colorized = self.call_colorizer(png).await?;

        self.workers
            .run(move || -> Result<PathBuf, ItemError> {
                let image = image_codec::decode_image(&colorized, None)
                    .map_err(|e| ItemError::TransformFailure(e.to_string()))?;
                let png = image_codec::encode_png(&image)
                    .map_err(|e| ItemError::EncodeFailure(e.to_string()))?;
                image_codec::write_png_atomically(&output, &png)
                    .map_err(|e| ItemError::EncodeFailure(e.to_string()))?;
                Ok(output)
            })
            .await
            .map_err(|e| ItemError::EncodeFailure(e.to_string()))?
    }

    /// Colorizes a single in-memory image and returns the result as PNG.
    pub async fn colorize_bytes(&self, data: Bytes, media_type: Option<String>) -> Result<Vec<u8>, ItemError> {
        let png = self
            .workers
            .run(move || {
                image_codec::normalize_to_png(&data, media_type.as_deref())
                    .map_err(|e| ItemError::DecodeFailure(e.to_string()))
            })
            .await
            .map_err(|e| ItemError::DecodeFailure(e.to_string()))??;

        let colorized = self.call_colorizer(png).await?;

        self.workers
            .run(move || {
                let image = image_codec::decode_image(&colorized, None)
                    .map_err(|e| ItemError::TransformFailure(e.to_string()))?;
                image_codec::encode_png(&image).map_err(|e| ItemError::EncodeFailure(e.to_string()))
            })
            .await
            .map_err(|e| ItemError::EncodeFailure(e.to_string()))?
    }

    async fn call_colorizer(&self, png: Vec<u8>) -> Result<Bytes, ItemError> {
        let _permit = self
            .call_limit
            .acquire()
            .await
            .map_err(|_| ItemError::TransformFailure("pipeline is shut down".to_string()))?;

        let started = Instant::now();
        let result = tokio::time::timeout(self.call_timeout, self.colorizer.colorize(png)).await;
        metrics::histogram!("colorize_seconds").record(started.elapsed().as_secs_f64());

        match result {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(err)) => Err(ItemError::TransformFailure(err.to_string())),
            Err(_) => Err(ItemError::TransformFailure(format!(
                "timed out after {:?}",
                self.call_timeout
            ))),
        }
    }
}
