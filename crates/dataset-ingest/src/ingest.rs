// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! End-to-end ingestion of a classified, split selection.
//!
//! Each image moves through a fixed sequence of stages:
//!
//! ```text
//! Pending → UploadingOriginal → (DecodingSize ∥ UploadingLabel)
//!         → GeneratingThumbnail → Enqueued → Done
//! ```
//!
//! Files run in parallel lanes bounded by [`IngestConfig::concurrency`], but
//! each file's own stages are strictly sequential. The cancellation token is
//! checked before every transition: an in-flight network call is allowed to
//! finish, but no further stage starts and no new file is claimed.
//!
//! Failure to upload an original or to insert metadata halts the batch and
//! surfaces as [`Error::IngestFailed`] naming the stage. Thumbnail and label
//! upload failures only degrade the affected record.

use crate::{
    ClassTable, Error, FileEntry, ImageRecord, IngestConfig, MetadataStore, ObjectStore,
    ProcessingStatus, STEP_IMAGES_TABLE, Stage, StoredObject,
    classify::{InputFile, classify},
    labels::{self, ImageSize, LabelOutcome},
    limiter::run_all_while,
    manifest::{self, DatasetManifest},
    paths::{StepPaths, file_stem},
    persist::PersistenceQueue,
    split::{self, SplitMode, SplitPlan},
    thumbnail::{ImageCodec, ImageCrateCodec, ThumbnailGenerator},
    url_cache::SecureUrlCache,
};
use async_trait::async_trait;
use log::{debug, error, info, trace, warn};
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
};
use tokio::{sync::mpsc::Sender, time::Instant};
use tokio_util::sync::CancellationToken;

pub const PROGRESS_RUNNING: &str = "Uploading images";
pub const PROGRESS_COMPLETE: &str = "Upload complete";
/// Message of the final report of a cancelled run. Its `current` is the
/// number of files that completed before cancellation took effect.
pub const PROGRESS_CANCELLED: &str = "Upload cancelled";

/// Progress of an ingestion run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    /// Files fully processed and handed to the persistence queue.
    pub current: usize,
    /// Files in the run.
    pub total: usize,
    pub message: String,
}

impl Progress {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            self.current as f64 / self.total as f64 * 100.0
        }
    }
}

/// Receiver of progress updates.
///
/// Throttled reports are delivered synchronously from the processing lanes,
/// so [`ProgressSink::report`] must return quickly and may drop updates.
/// The initial and final reports of a run go through
/// [`ProgressSink::report_forced`], which must deliver them.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    fn report(&self, progress: Progress);

    async fn report_forced(&self, progress: Progress) {
        self.report(progress)
    }
}

/// Throttled reports are dropped while the channel is full. Forced reports
/// wait for capacity, so the receiver must keep draining.
#[async_trait]
impl ProgressSink for Sender<Progress> {
    fn report(&self, progress: Progress) {
        if let Err(err) = self.try_send(progress) {
            trace!("Dropped progress update: {}", err);
        }
    }

    async fn report_forced(&self, progress: Progress) {
        if let Err(err) = self.send(progress).await {
            trace!("Progress receiver closed: {}", err);
        }
    }
}

#[async_trait]
impl ProgressSink for Box<dyn Fn(Progress) + Send + Sync> {
    fn report(&self, progress: Progress) {
        self(progress)
    }
}

/// Per-file pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStage {
    Pending,
    UploadingOriginal,
    DecodingSize,
    UploadingLabel,
    GeneratingThumbnail,
    Enqueued,
    Done,
    Cancelled,
}

impl std::fmt::Display for FileStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FileStage::Pending => "pending",
            FileStage::UploadingOriginal => "uploading original",
            FileStage::DecodingSize => "decoding size",
            FileStage::UploadingLabel => "uploading label",
            FileStage::GeneratingThumbnail => "generating thumbnail",
            FileStage::Enqueued => "enqueued",
            FileStage::Done => "done",
            FileStage::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

/// Everything needed to ingest one selection into a step.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub project_id: String,
    pub step_id: String,
    pub images: Vec<FileEntry>,
    pub labels: Vec<FileEntry>,
    /// Explicit class manifest. When present, no dataset manifest is
    /// synthesized.
    pub class_manifest: Option<FileEntry>,
    /// Class names used when no manifest is given or it yields nothing.
    pub default_classes: Vec<String>,
    pub plan: SplitPlan,
}

/// Outcome of an ingestion run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestSummary {
    pub total: usize,
    /// Planned file count per split group.
    pub groups: BTreeMap<String, usize>,
    pub originals_uploaded: usize,
    pub labels_uploaded: usize,
    pub thumbnails_generated: usize,
    pub records_persisted: usize,
    pub manifest: Option<StoredObject>,
    pub cancelled: bool,
}

/// Limits progress reports to one per interval; forced reports always pass.
struct ProgressThrottle {
    interval: std::time::Duration,
    last: Mutex<Option<Instant>>,
}

impl ProgressThrottle {
    fn allow(&self, force: bool) -> bool {
        let now = Instant::now();
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let due = match *last {
            Some(previous) => now.duration_since(previous) >= self.interval,
            None => true,
        };
        if due || force {
            *last = Some(now);
        }
        due || force
    }
}

enum FileOutcome {
    Enqueued,
    Cancelled,
}

/// Shared state of one run.
struct RunContext<'a> {
    step_id: &'a str,
    paths: StepPaths,
    classes: ClassTable,
    groups: HashMap<&'a str, &'a str>,
    labels: HashMap<String, &'a FileEntry>,
    queue: PersistenceQueue,
    cancel: &'a CancellationToken,
    progress: Option<&'a dyn ProgressSink>,
    throttle: ProgressThrottle,
    total: usize,
    completed: AtomicUsize,
    originals: AtomicUsize,
    labels_uploaded: AtomicUsize,
    thumbnails: AtomicUsize,
    fatal: Mutex<Option<Error>>,
}

impl RunContext<'_> {
    fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn failed(&self) -> bool {
        self.queue.has_failed()
            || self
                .fatal
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_some()
    }

    fn fail(&self, err: Error) {
        error!("{}", err);
        let mut fatal = self.fatal.lock().unwrap_or_else(PoisonError::into_inner);
        if fatal.is_none() {
            *fatal = Some(err);
        }
    }

    async fn report(&self, current: usize, force: bool) {
        self.report_with(current, force, PROGRESS_RUNNING).await
    }

    async fn report_with(&self, current: usize, force: bool, message: &str) {
        let Some(sink) = self.progress else {
            return;
        };
        if !self.throttle.allow(force) {
            return;
        }
        let progress = Progress {
            current,
            total: self.total,
            message: message.to_string(),
        };
        if force {
            sink.report_forced(progress).await;
        } else {
            sink.report(progress);
        }
    }
}

fn stage(image: &FileEntry, stage: FileStage) {
    trace!("{} -> {}", image.storage_name, stage);
}

fn content_type(bytes: &[u8]) -> &'static str {
    infer::get(bytes)
        .map(|t| t.mime_type())
        .unwrap_or("application/octet-stream")
}

/// Drives selections through upload, decode, thumbnail and persistence.
pub struct Ingestor {
    store: Arc<dyn ObjectStore>,
    db: Arc<dyn MetadataStore>,
    config: IngestConfig,
    url_cache: SecureUrlCache,
    thumbnails: ThumbnailGenerator,
}

impl std::fmt::Debug for Ingestor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ingestor")
            .field("config", &self.config)
            .field("url_cache", &self.url_cache)
            .finish()
    }
}

impl Ingestor {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        db: Arc<dyn MetadataStore>,
        config: IngestConfig,
    ) -> Self {
        let url_cache = SecureUrlCache::new(
            store.clone(),
            config.url_cache_capacity,
            config.url_cache_buffer(),
            config.url_issue_concurrency,
        );
        let thumbnails = ThumbnailGenerator::new(
            store.clone(),
            url_cache.clone(),
            Arc::new(ImageCrateCodec::default()),
            config.thumbnail_size,
            config.signed_url_ttl_secs,
        );
        Self {
            store,
            db,
            config,
            url_cache,
            thumbnails,
        }
    }

    /// Replace the codec used for thumbnails.
    pub fn with_codec(mut self, codec: Arc<dyn ImageCodec>) -> Self {
        self.thumbnails = ThumbnailGenerator::new(
            self.store.clone(),
            self.url_cache.clone(),
            codec,
            self.config.thumbnail_size,
            self.config.signed_url_ttl_secs,
        );
        self
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn url_cache(&self) -> &SecureUrlCache {
        &self.url_cache
    }

    /// Classify raw inputs, plan the split and run the pipeline.
    #[allow(clippy::too_many_arguments)]
    pub async fn ingest_files(
        &self,
        project_id: &str,
        step_id: &str,
        inputs: Vec<InputFile>,
        mode: &SplitMode,
        default_classes: &[String],
        cancel: &CancellationToken,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<IngestSummary, Error> {
        let classified = classify(inputs);
        let plan = split::plan(&classified.images, mode);
        let request = IngestRequest {
            project_id: project_id.to_string(),
            step_id: step_id.to_string(),
            images: classified.images,
            labels: classified.labels,
            class_manifest: classified.class_manifest,
            default_classes: default_classes.to_vec(),
            plan,
        };
        self.run(&request, cancel, progress).await
    }

    /// Ingest every image of `request`.
    ///
    /// Returns a summary once all lanes have settled and the persistence
    /// queue has drained. Cancellation is not an error: the summary reports
    /// it and no manifest is written.
    pub async fn run(
        &self,
        request: &IngestRequest,
        cancel: &CancellationToken,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<IngestSummary, Error> {
        let groups = request.plan.assignments();
        if let Some(missing) = request
            .images
            .iter()
            .find(|image| !groups.contains_key(image.id.as_str()))
        {
            return Err(Error::InvalidParameters(format!(
                "{} is not assigned to a split group",
                missing.original_name
            )));
        }

        let mut labels = HashMap::new();
        for label in &request.labels {
            labels
                .entry(file_stem(&label.original_name).to_lowercase())
                .or_insert(label);
        }

        let ctx = RunContext {
            step_id: &request.step_id,
            paths: StepPaths::new(&request.project_id, &request.step_id),
            classes: manifest::resolve(request.class_manifest.as_ref(), &request.default_classes),
            groups,
            labels,
            queue: PersistenceQueue::new(
                self.db.clone(),
                STEP_IMAGES_TABLE,
                self.config.batch_size,
            ),
            cancel,
            progress,
            throttle: ProgressThrottle {
                interval: self.config.progress_interval(),
                last: Mutex::new(None),
            },
            total: request.images.len(),
            completed: AtomicUsize::new(0),
            originals: AtomicUsize::new(0),
            labels_uploaded: AtomicUsize::new(0),
            thumbnails: AtomicUsize::new(0),
            fatal: Mutex::new(None),
        };

        info!(
            "Ingesting {} images into {} ({} classes, {} label files)",
            ctx.total,
            ctx.paths.root(),
            ctx.classes.len(),
            request.labels.len()
        );
        ctx.report(0, true).await;

        {
            let ctx = &ctx;
            run_all_while(
                request.images.iter().collect(),
                self.config.concurrency,
                move |image| async move {
                    match self.process(ctx, image).await {
                        Ok(FileOutcome::Enqueued) => {
                            let done = ctx.completed.fetch_add(1, Ordering::SeqCst) + 1;
                            ctx.report(done, false).await;
                        }
                        Ok(FileOutcome::Cancelled) => stage(image, FileStage::Cancelled),
                        Err(err) => ctx.fail(err),
                    }
                },
                || !ctx.cancelled() && !ctx.failed(),
            )
            .await;
        }

        let flushed = ctx.queue.flush().await;
        let mut fatal = ctx
            .fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Err(err) = flushed {
            if fatal.is_none() {
                fatal = Some(Error::IngestFailed {
                    stage: Stage::InsertMetadata,
                    message: err.to_string(),
                });
            }
        }
        if let Some(err) = fatal {
            return Err(err);
        }

        let completed = ctx.completed.load(Ordering::SeqCst);
        let cancelled = ctx.cancelled();
        let message = if cancelled {
            PROGRESS_CANCELLED
        } else {
            PROGRESS_COMPLETE
        };
        ctx.report_with(completed, true, message).await;

        let mut summary = IngestSummary {
            total: ctx.total,
            groups: request
                .plan
                .groups()
                .iter()
                .map(|g| (g.name.clone(), g.ids.len()))
                .collect(),
            originals_uploaded: ctx.originals.load(Ordering::SeqCst),
            labels_uploaded: ctx.labels_uploaded.load(Ordering::SeqCst),
            thumbnails_generated: ctx.thumbnails.load(Ordering::SeqCst),
            records_persisted: ctx.queue.persisted(),
            manifest: None,
            cancelled,
        };

        if cancelled {
            info!("Ingestion cancelled after {} of {} images", completed, ctx.total);
            return Ok(summary);
        }

        if request.class_manifest.is_none() {
            summary.manifest = Some(self.upload_manifest(&ctx, &request.plan).await?);
        }

        info!(
            "Ingested {} images ({} records, {} thumbnails)",
            completed, summary.records_persisted, summary.thumbnails_generated
        );
        Ok(summary)
    }

    async fn upload_manifest(
        &self,
        ctx: &RunContext<'_>,
        plan: &SplitPlan,
    ) -> Result<StoredObject, Error> {
        let manifest = DatasetManifest {
            root: ctx.paths.root().to_string(),
            groups: plan.group_names(),
            classes: ctx.classes.clone(),
        };
        let path = ctx.paths.manifest(DatasetManifest::FILE_NAME);
        debug!("Uploading dataset manifest to {}", path);
        self.store
            .upload(
                &self.config.bucket,
                &path,
                manifest.render().as_bytes(),
                DatasetManifest::CONTENT_TYPE,
            )
            .await
            .map_err(|err| Error::IngestFailed {
                stage: Stage::UploadManifest,
                message: err.to_string(),
            })
    }

    async fn process(
        &self,
        ctx: &RunContext<'_>,
        image: &FileEntry,
    ) -> Result<FileOutcome, Error> {
        let bucket = self.config.bucket.as_str();
        let group = ctx
            .groups
            .get(image.id.as_str())
            .copied()
            .unwrap_or(split::UNTAGGED);
        let stem = file_stem(&image.storage_name).to_string();

        stage(image, FileStage::Pending);
        if ctx.cancelled() {
            return Ok(FileOutcome::Cancelled);
        }

        stage(image, FileStage::UploadingOriginal);
        let original = self
            .store
            .upload(
                bucket,
                &ctx.paths.image(group, &image.storage_name),
                image.bytes(),
                content_type(image.bytes()),
            )
            .await
            .map_err(|err| Error::IngestFailed {
                stage: Stage::UploadOriginal,
                message: format!("{}: {}", image.original_name, err),
            })?;
        ctx.originals.fetch_add(1, Ordering::SeqCst);
        if ctx.cancelled() {
            return Ok(FileOutcome::Cancelled);
        }

        let label = ctx
            .labels
            .get(&file_stem(&image.original_name).to_lowercase())
            .copied();
        let ((annotations, no_annotations_needed), ()) = tokio::join!(
            self.decode_labels(ctx, image, label),
            self.upload_label(ctx, group, &stem, label)
        );
        if ctx.cancelled() {
            return Ok(FileOutcome::Cancelled);
        }

        stage(image, FileStage::GeneratingThumbnail);
        let mut thumbnail_url = original.public_url.clone();
        if let Some(thumbnail) = self
            .thumbnails
            .generate(bucket, &original.path, &original.public_url)
            .await
        {
            if ctx.cancelled() {
                return Ok(FileOutcome::Cancelled);
            }
            let path = ctx.paths.thumbnail(group, &stem, thumbnail.extension);
            match self
                .store
                .upload(bucket, &path, &thumbnail.bytes, thumbnail.content_type)
                .await
            {
                Ok(stored) => {
                    thumbnail_url = stored.public_url;
                    ctx.thumbnails.fetch_add(1, Ordering::SeqCst);
                }
                Err(err) => warn!("Thumbnail upload failed for {}: {}", image.original_name, err),
            }
        }
        if ctx.cancelled() {
            return Ok(FileOutcome::Cancelled);
        }

        stage(image, FileStage::Enqueued);
        ctx.queue.enqueue(ImageRecord {
            step_id: ctx.step_id.to_string(),
            image_url: original.public_url.clone(),
            thumbnail_url,
            display_url: original.public_url,
            image_name: image.original_name.clone(),
            file_size: image.size(),
            image_group: group.to_string(),
            processing_status: ProcessingStatus::Completed,
            no_annotations_needed,
            annotations,
        });
        stage(image, FileStage::Done);
        Ok(FileOutcome::Enqueued)
    }

    /// Decode the image's label file, if any, into annotations and the
    /// intentionally-empty flag.
    async fn decode_labels(
        &self,
        ctx: &RunContext<'_>,
        image: &FileEntry,
        label: Option<&FileEntry>,
    ) -> (Option<Vec<labels::AnnotationShape>>, bool) {
        let Some(label) = label else {
            return (None, false);
        };
        let text = String::from_utf8_lossy(label.bytes());
        if text.trim().is_empty() {
            return (None, true);
        }

        stage(image, FileStage::DecodingSize);
        let size = match imagesize::blob_size(image.bytes()) {
            Ok(size) => ImageSize::new(size.width as u32, size.height as u32),
            Err(err) => {
                warn!(
                    "Cannot read dimensions of {}; skipping its labels: {}",
                    image.original_name, err
                );
                return (None, false);
            }
        };

        match labels::interpret(&text, size, &ctx.classes) {
            LabelOutcome::Shapes(shapes) => (Some(shapes), false),
            LabelOutcome::Empty => (None, true),
            LabelOutcome::Unparsed => {
                warn!("No annotations decoded from {}", label.original_name);
                (None, false)
            }
        }
    }

    async fn upload_label(
        &self,
        ctx: &RunContext<'_>,
        group: &str,
        stem: &str,
        label: Option<&FileEntry>,
    ) {
        let Some(label) = label else {
            return;
        };
        trace!("{} -> {}", label.original_name, FileStage::UploadingLabel);
        let path = ctx.paths.label(group, stem);
        match self
            .store
            .upload(&self.config.bucket, &path, label.bytes(), "text/plain")
            .await
        {
            Ok(_) => {
                ctx.labels_uploaded.fetch_add(1, Ordering::SeqCst);
            }
            Err(err) => warn!("Label upload failed for {}: {}", label.original_name, err),
        }
    }
}
