// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Decoding of normalized-coordinate label files.
//!
//! Each non-blank line holds a class index followed by coordinates normalized
//! to `[0, 1]`:
//!
//! - `class cx cy w h`: a center-anchored bounding box.
//! - `class x1 y1 x2 y2 x3 y3 ...`: a polygon with at least three vertices.
//!
//! Shapes are produced in pixel space, so the natural size of the image must
//! be known before decoding.

use crate::ClassTable;
use log::warn;
use serde::{Deserialize, Serialize};

/// Natural pixel dimensions of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Polygon vertex in pixel space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// Pixel-space geometry of one annotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Geometry {
    /// Axis-aligned box anchored at its top-left corner.
    Bbox {
        x: f64,
        y: f64,
        width: f64,
        height: f64,
    },
    /// Ordered vertex list with at least three points.
    Polygon { points: Vec<Point> },
}

/// Review status attached to decoded annotations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnotationStatus {
    /// Imported ground truth.
    #[default]
    Approved,
    Pending,
    Rejected,
}

/// A decoded annotation with its resolved class name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationShape {
    #[serde(flatten)]
    pub geometry: Geometry,
    pub class: String,
    #[serde(default)]
    pub status: AnnotationStatus,
}

/// Result of interpreting a whole label file.
#[derive(Debug, Clone, PartialEq)]
pub enum LabelOutcome {
    /// At least one shape was decoded.
    Shapes(Vec<AnnotationShape>),
    /// The file is blank: the image intentionally has no annotations.
    Empty,
    /// The file has content but no line decoded to a shape.
    Unparsed,
}

/// Decode every valid line of `text` into pixel-space shapes.
///
/// Lines with fewer than five fields, a non-numeric field, or a coordinate
/// count that is neither four nor an even number of at least six are
/// skipped with a warning. Coordinates are clamped to `[0, 1]` before
/// conversion and boxes are clipped to the image bounds.
pub fn decode(text: &str, size: ImageSize, classes: &ClassTable) -> Vec<AnnotationShape> {
    let width = size.width as f64;
    let height = size.height as f64;

    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .filter_map(|(idx, line)| {
            let shape = decode_line(line, width, height, classes);
            if shape.is_none() {
                warn!("Skipping malformed label line {}: {:?}", idx + 1, line.trim());
            }
            shape
        })
        .collect()
}

/// Decode `text` and classify the result as shapes, an explicit empty
/// declaration, or unparseable content.
pub fn interpret(text: &str, size: ImageSize, classes: &ClassTable) -> LabelOutcome {
    if text.trim().is_empty() {
        return LabelOutcome::Empty;
    }

    let shapes = decode(text, size, classes);
    if shapes.is_empty() {
        warn!("Label content produced no annotations; leaving image unannotated");
        LabelOutcome::Unparsed
    } else {
        LabelOutcome::Shapes(shapes)
    }
}

fn parse_fields(line: &str) -> Option<Vec<f64>> {
    line.split_whitespace()
        .map(|field| field.parse::<f64>().ok().filter(|v| v.is_finite()))
        .collect()
}

fn decode_line(
    line: &str,
    width: f64,
    height: f64,
    classes: &ClassTable,
) -> Option<AnnotationShape> {
    let fields = parse_fields(line)?;
    if fields.len() < 5 {
        return None;
    }

    let class = classes.name_for(fields[0]);
    let coords: Vec<f64> = fields[1..].iter().map(|v| v.clamp(0.0, 1.0)).collect();

    let geometry = match coords.len() {
        4 => {
            let (cx, cy, w, h) = (coords[0], coords[1], coords[2], coords[3]);
            let x = (cx - w / 2.0) * width;
            let y = (cy - h / 2.0) * height;
            let left = x.clamp(0.0, width);
            let top = y.clamp(0.0, height);
            Geometry::Bbox {
                x: left,
                y: top,
                width: ((x + w * width).min(width) - left).max(0.0),
                height: ((y + h * height).min(height) - top).max(0.0),
            }
        }
        n if n >= 6 && n % 2 == 0 => {
            let points: Vec<Point> = coords
                .chunks_exact(2)
                .map(|pair| Point {
                    x: pair[0] * width,
                    y: pair[1] * height,
                })
                .collect();
            if points.len() < 3 {
                return None;
            }
            Geometry::Polygon { points }
        }
        _ => return None,
    };

    Some(AnnotationShape {
        geometry,
        class,
        status: AnnotationStatus::default(),
    })
}
