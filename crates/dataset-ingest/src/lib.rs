// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! # Dataset Ingest
//!
//! Turns a user selection of images, archives, label files and class
//! manifests into a split image dataset in object storage, with one metadata
//! record per image in a backing database.
//!
//! ## Features
//!
//! - **Classification**: ZIP archives are expanded in memory and inputs are
//!   sorted into images, labels and a class manifest with stable ids
//! - **Split planning**: randomized Training/Validation/holdout partitions
//!   that always cover every file exactly once
//! - **Label decoding**: normalized bounding boxes and polygons converted to
//!   pixel space
//! - **Bounded concurrency**: uploads, thumbnails and URL issuance run under
//!   explicit limits with cooperative cancellation
//! - **Ordered persistence**: records are inserted in batches that reach the
//!   database in enqueue order
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dataset_ingest::{
//!     IngestConfig, Ingestor, InputFile, MemoryMetadataStore, MemoryObjectStore, SplitMode,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), dataset_ingest::Error> {
//! let store = Arc::new(MemoryObjectStore::new());
//! let db = Arc::new(MemoryMetadataStore::new());
//! let ingestor = Ingestor::new(store, db, IngestConfig::from_env()?);
//!
//! let inputs = vec![InputFile::from_path("images/0001.jpg")?];
//! let summary = ingestor
//!     .ingest_files(
//!         "project",
//!         "step",
//!         inputs,
//!         &SplitMode::Auto,
//!         &[],
//!         &CancellationToken::new(),
//!         None,
//!     )
//!     .await?;
//! println!("{} records persisted", summary.records_persisted);
//! # Ok(())
//! # }
//! ```

mod classify;
mod config;
mod error;
mod ingest;
mod labels;
mod limiter;
mod manifest;
mod paths;
mod persist;
mod record;
mod split;
mod storage;
mod thumbnail;
mod url_cache;

pub use crate::{
    classify::{
        ClassifiedFiles, FileEntry, FileKind, IMAGE_EXTENSIONS, InputFile, MAX_ARCHIVE_ENTRY_BYTES,
        classify, classify_kind, expand_archive,
    },
    config::{IngestConfig, default_concurrency},
    error::{Error, Stage},
    ingest::{
        FileStage, IngestRequest, IngestSummary, Ingestor, PROGRESS_CANCELLED, PROGRESS_COMPLETE,
        PROGRESS_RUNNING, Progress, ProgressSink,
    },
    labels::{
        AnnotationShape, AnnotationStatus, Geometry, ImageSize, LabelOutcome, Point,
        decode as decode_labels, interpret as interpret_labels,
    },
    limiter::{ConcurrencyLimiter, run_all, run_all_while},
    manifest::{
        ClassTable, DatasetManifest, MAX_CLASS_INDEX, ManifestDocument, resolve as resolve_classes,
    },
    paths::{StepPaths, sanitize_path_component},
    persist::PersistenceQueue,
    record::{ImageRecord, ProcessingStatus, STEP_IMAGES_TABLE},
    split::{
        DEFAULT_OTHER_GROUP, SplitGroup, SplitMode, SplitPlan, TRAINING, UNTAGGED, VALIDATION,
        plan as plan_split, plan_with_rng as plan_split_with_rng,
    },
    storage::{
        ImageTransform, JsonlMetadataStore, LocalObjectStore, MemoryMetadataStore,
        MemoryObjectStore, MetadataStore, ObjectStore, ResizeMode, RetrievalOptions,
        StoredObject,
    },
    thumbnail::{
        ImageCodec, ImageCrateCodec, Raster, Thumbnail, ThumbnailFormat, ThumbnailGenerator,
        cover_crop,
    },
    url_cache::{SecureUrlCache, cache_key},
};
