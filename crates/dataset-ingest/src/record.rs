// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

use crate::labels::AnnotationShape;
use serde::{Deserialize, Serialize};

/// Table receiving one row per ingested image.
pub const STEP_IMAGES_TABLE: &str = "step_images";

/// Processing state of an ingested image row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Metadata row describing one ingested image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub step_id: String,
    /// Public URL of the uploaded original.
    pub image_url: String,
    /// Public URL of the thumbnail, or of the original when no thumbnail
    /// could be generated.
    pub thumbnail_url: String,
    pub display_url: String,
    /// Name the image was selected under, before sanitization.
    pub image_name: String,
    pub file_size: u64,
    pub image_group: String,
    pub processing_status: ProcessingStatus,
    /// Set when an empty label file declared that the image has nothing to
    /// annotate.
    pub no_annotations_needed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Vec<AnnotationShape>>,
}
