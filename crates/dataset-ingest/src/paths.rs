// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Deterministic object paths for a step's dataset tree.
//!
//! ```text
//! {project}/{step}/
//! ├── data.yaml
//! ├── images/{split}/{safe_name}
//! ├── labels/{split}/{stem}.txt
//! └── thumbnails/{split}/{stem}.{ext}
//! ```

use std::path::Path;

/// Replace characters that are unsafe in object paths.
///
/// Only the final path component survives; empty names become `unnamed`.
pub fn sanitize_path_component(name: &str) -> String {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return "unnamed".to_string();
    }

    let component = trimmed.rsplit(['/', '\\']).next().unwrap_or(trimmed);

    let sanitized: String = component
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '#' | '%' => '_',
            c if c.is_control() => '_',
            _ => c,
        })
        .collect();

    if sanitized.is_empty() || sanitized == "." || sanitized == ".." {
        "unnamed".to_string()
    } else {
        sanitized
    }
}

/// Directory name for a split group (whitespace becomes `_`).
pub fn split_dir(group: &str) -> String {
    sanitize_path_component(group)
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect()
}

/// Base name of `name` without its final extension.
pub fn file_stem(name: &str) -> &str {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    Path::new(base)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(base)
}

/// Lowercased final extension of `name`, if any.
pub fn extension(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
}

/// Object paths below `{project}/{step}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepPaths {
    root: String,
}

impl StepPaths {
    pub fn new(project_id: &str, step_id: &str) -> Self {
        Self {
            root: format!(
                "{}/{}",
                sanitize_path_component(project_id),
                sanitize_path_component(step_id)
            ),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn image(&self, split: &str, storage_name: &str) -> String {
        format!(
            "{}/images/{}/{}",
            self.root,
            split_dir(split),
            sanitize_path_component(storage_name)
        )
    }

    pub fn label(&self, split: &str, stem: &str) -> String {
        format!(
            "{}/labels/{}/{}.txt",
            self.root,
            split_dir(split),
            sanitize_path_component(stem)
        )
    }

    pub fn thumbnail(&self, split: &str, stem: &str, extension: &str) -> String {
        format!(
            "{}/thumbnails/{}/{}.{}",
            self.root,
            split_dir(split),
            sanitize_path_component(stem),
            extension
        )
    }

    pub fn manifest(&self, file_name: &str) -> String {
        format!("{}/{}", self.root, file_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_path_component() {
        assert_eq!(sanitize_path_component("a/b/c.png"), "c.png");
        assert_eq!(sanitize_path_component("what?.png"), "what_.png");
        assert_eq!(sanitize_path_component("   "), "unnamed");
        assert_eq!(sanitize_path_component(".."), "unnamed");
    }

    #[test]
    fn test_stem_and_extension() {
        assert_eq!(file_stem("dir/IMG_001.JPG"), "IMG_001");
        assert_eq!(file_stem("archive.tar.gz"), "archive.tar");
        assert_eq!(extension("IMG_001.JPG"), Some("jpg".to_string()));
        assert_eq!(extension("README"), None);
    }

    #[test]
    fn test_step_paths_layout() {
        let paths = StepPaths::new("proj", "step");
        assert_eq!(
            paths.image("Training", "a.png"),
            "proj/step/images/Training/a.png"
        );
        assert_eq!(paths.label("Hold Out", "a"), "proj/step/labels/Hold_Out/a.txt");
        assert_eq!(
            paths.thumbnail("Validation", "a", "webp"),
            "proj/step/thumbnails/Validation/a.webp"
        );
        assert_eq!(paths.manifest("data.yaml"), "proj/step/data.yaml");
    }
}
