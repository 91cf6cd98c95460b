// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Classification of user-selected files.
//!
//! Selected inputs are sorted into images, label files and at most one class
//! manifest. ZIP archives are expanded in memory and contribute their image
//! entries; everything else inside an archive is dropped.
//!
//! Every resulting [`FileEntry`] carries a stable id derived from where it
//! came from, so classifying the same selection twice yields the same ids.

use crate::{
    Error,
    manifest::is_structured_name,
    paths::{extension, sanitize_path_component},
};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use sha2::{Digest as _, Sha256};
use std::{
    collections::HashSet,
    io::{Cursor, Read},
    path::{Component, Path},
    sync::Arc,
};

/// Image file extensions accepted by the classifier.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "webp", "gif", "tif", "tiff"];

/// Extensions of compressed containers that are recognised but not expanded.
const UNSUPPORTED_ARCHIVES: &[&str] = &["gz", "tgz", "tar", "7z", "rar", "bz2", "xz"];

const ZIP_MEDIA_TYPES: &[&str] = &["application/zip", "application/x-zip-compressed"];

/// Largest uncompressed archive entry that is expanded.
pub const MAX_ARCHIVE_ENTRY_BYTES: u64 = 512 * 1024 * 1024;

/// Preallocation cap; the declared size of an entry is not trusted beyond it.
const ENTRY_PREALLOC_BYTES: u64 = 16 * 1024 * 1024;

/// A raw file selected by the user.
#[derive(Debug, Clone)]
pub struct InputFile {
    pub name: String,
    /// Declared media type, when the selection source provides one.
    pub media_type: Option<String>,
    pub bytes: Vec<u8>,
    pub modified: Option<DateTime<Utc>>,
}

impl InputFile {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            media_type: None,
            bytes,
            modified: None,
        }
    }

    pub fn with_media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = Some(media_type.into());
        self
    }

    pub fn with_modified(mut self, modified: DateTime<Utc>) -> Self {
        self.modified = Some(modified);
        self
    }

    /// Read a file from disk, recording its modification time.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let modified = path
            .metadata()?
            .modified()
            .ok()
            .map(DateTime::<Utc>::from);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| Error::InvalidParameters(format!("Not a file: {:?}", path)))?;

        Ok(Self {
            name,
            media_type: None,
            bytes,
            modified,
        })
    }
}

/// One candidate file for the pipeline.
///
/// `storage_name` differs from `original_name` for archive entries, where the
/// in-archive path segments are joined so entries sharing a base name do not
/// collide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub id: String,
    pub original_name: String,
    pub storage_name: String,
    bytes: Arc<[u8]>,
}

fn stable_id(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

impl FileEntry {
    /// Entry for a directly selected file, identified by name, size and
    /// modification time.
    pub fn from_direct(name: &str, bytes: Vec<u8>, modified: Option<DateTime<Utc>>) -> Self {
        let stamp = modified.map(|m| m.timestamp_millis()).unwrap_or_default();
        let size = bytes.len().to_string();
        let stamp = stamp.to_string();
        let id = stable_id(&[name, size.as_str(), stamp.as_str()]);
        Self {
            id,
            original_name: name.to_string(),
            storage_name: sanitize_path_component(name),
            bytes: bytes.into(),
        }
    }

    /// Entry extracted from an archive, identified by archive name, archive
    /// timestamp, in-archive path and size.
    fn from_archive(
        archive: &str,
        archive_stamp: i64,
        entry_path: &str,
        segments: &[String],
        bytes: Vec<u8>,
    ) -> Self {
        let stamp = archive_stamp.to_string();
        let size = bytes.len().to_string();
        let id = stable_id(&[archive, stamp.as_str(), entry_path, size.as_str()]);
        let original_name = segments.last().cloned().unwrap_or_default();
        let storage_name = sanitize_path_component(&segments.join("_"));
        Self {
            id,
            original_name,
            storage_name,
            bytes: bytes.into(),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Category assigned to an input file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Image,
    Archive,
    Label,
    ClassManifest,
    Unsupported,
}

fn is_flat_manifest_name(name: &str) -> bool {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name).to_lowercase();
    base == "classes.txt" || base.ends_with(".names")
}

/// Decide what an input file is from its media type (declared or sniffed)
/// and its name.
pub fn classify_kind(file: &InputFile) -> FileKind {
    let media_type = file
        .media_type
        .clone()
        .or_else(|| infer::get(&file.bytes).map(|t| t.mime_type().to_string()))
        .unwrap_or_default()
        .to_lowercase();
    let ext = extension(&file.name).unwrap_or_default();

    if ZIP_MEDIA_TYPES.contains(&media_type.as_str()) || ext == "zip" {
        FileKind::Archive
    } else if media_type.starts_with("image/") || IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        FileKind::Image
    } else if is_structured_name(&file.name) || is_flat_manifest_name(&file.name) {
        FileKind::ClassManifest
    } else if ext == "txt" {
        FileKind::Label
    } else {
        FileKind::Unsupported
    }
}

/// Result of classifying a selection.
#[derive(Debug, Clone, Default)]
pub struct ClassifiedFiles {
    pub images: Vec<FileEntry>,
    pub labels: Vec<FileEntry>,
    pub class_manifest: Option<FileEntry>,
}

impl ClassifiedFiles {
    /// Fold a later classification into this one.
    ///
    /// Images and labels whose ids are already present are skipped and the
    /// first class manifest wins.
    pub fn merge(&mut self, other: ClassifiedFiles) {
        let mut seen: HashSet<String> = self
            .images
            .iter()
            .chain(self.labels.iter())
            .map(|e| e.id.clone())
            .collect();
        for image in other.images {
            if seen.insert(image.id.clone()) {
                self.images.push(image);
            }
        }
        for label in other.labels {
            if seen.insert(label.id.clone()) {
                self.labels.push(label);
            }
        }
        if self.class_manifest.is_none() {
            self.class_manifest = other.class_manifest;
        }
    }
}

/// Classify a selection into images, labels and an optional class manifest.
///
/// Unreadable archives and archive entries are logged and skipped.
pub fn classify(inputs: Vec<InputFile>) -> ClassifiedFiles {
    let mut result = ClassifiedFiles::default();
    let mut seen = HashSet::new();

    for input in inputs {
        match classify_kind(&input) {
            FileKind::Image => {
                let entry = FileEntry::from_direct(&input.name, input.bytes, input.modified);
                if seen.insert(entry.id.clone()) {
                    result.images.push(entry);
                }
            }
            FileKind::Archive => match expand_archive(&input) {
                Ok(entries) => {
                    for entry in entries {
                        if seen.insert(entry.id.clone()) {
                            result.images.push(entry);
                        }
                    }
                }
                Err(err) => warn!("Skipping unreadable archive {}: {}", input.name, err),
            },
            FileKind::Label => {
                let entry = FileEntry::from_direct(&input.name, input.bytes, input.modified);
                if seen.insert(entry.id.clone()) {
                    result.labels.push(entry);
                }
            }
            FileKind::ClassManifest => {
                if result.class_manifest.is_none() {
                    result.class_manifest =
                        Some(FileEntry::from_direct(&input.name, input.bytes, input.modified));
                } else {
                    debug!("Ignoring additional class manifest {}", input.name);
                }
            }
            FileKind::Unsupported => {
                let ext = extension(&input.name).unwrap_or_default();
                if UNSUPPORTED_ARCHIVES.contains(&ext.as_str()) {
                    warn!("Only ZIP archives are expanded; skipping {}", input.name);
                } else {
                    debug!("Skipping unrecognised file {}", input.name);
                }
            }
        }
    }

    debug!(
        "Classified {} images, {} labels, manifest: {}",
        result.images.len(),
        result.labels.len(),
        result.class_manifest.is_some()
    );
    result
}

fn is_image_name(name: &str) -> bool {
    extension(name).is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// Expand the image entries of a ZIP archive held in memory.
pub fn expand_archive(input: &InputFile) -> Result<Vec<FileEntry>, Error> {
    let mut archive = zip::ZipArchive::new(Cursor::new(input.bytes.as_slice()))?;
    let stamp = input
        .modified
        .map(|m| m.timestamp_millis())
        .unwrap_or_default();
    let mut entries = Vec::new();

    for i in 0..archive.len() {
        let mut entry = match archive.by_index(i) {
            Ok(entry) => entry,
            Err(err) => {
                warn!("Skipping unreadable entry {} in {}: {}", i, input.name, err);
                continue;
            }
        };
        if entry.is_dir() {
            continue;
        }

        let Some(path) = entry.enclosed_name() else {
            warn!("Skipping unsafe entry path {:?} in {}", entry.name(), input.name);
            continue;
        };
        let segments: Vec<String> = path
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().to_string()),
                _ => None,
            })
            .collect();
        let Some(base) = segments.last() else {
            continue;
        };
        if segments.iter().any(|s| s == "__MACOSX") || base.starts_with("._") {
            continue;
        }
        if !is_image_name(base) {
            continue;
        }

        let entry_path = segments.join("/");
        let declared = entry.size();
        let bytes = match read_entry(&mut entry, declared, MAX_ARCHIVE_ENTRY_BYTES) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("Skipping entry {} in {}: {}", entry_path, input.name, err);
                continue;
            }
        };

        entries.push(FileEntry::from_archive(
            &input.name,
            stamp,
            &entry_path,
            &segments,
            bytes,
        ));
    }

    debug!("Expanded {} images from {}", entries.len(), input.name);
    Ok(entries)
}

/// Read at most `limit` bytes of an entry whose header claims `declared`.
fn read_entry<R: Read>(reader: R, declared: u64, limit: u64) -> Result<Vec<u8>, Error> {
    if declared > limit {
        return Err(Error::UnsupportedFormat(format!(
            "entry of {} bytes exceeds the {} byte limit",
            declared, limit
        )));
    }
    let mut bytes = Vec::with_capacity(declared.min(ENTRY_PREALLOC_BYTES) as usize);
    reader.take(limit + 1).read_to_end(&mut bytes)?;
    if bytes.len() as u64 > limit {
        return Err(Error::UnsupportedFormat(format!(
            "entry expands beyond the {} byte limit",
            limit
        )));
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use zip::write::SimpleFileOptions;

    fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in entries {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_classify_kinds() {
        let inputs = vec![
            InputFile::new("a.JPG", vec![1, 2, 3]),
            InputFile::new("scan", vec![0; 4]).with_media_type("image/png"),
            InputFile::new("a.txt", b"0 0.5 0.5 0.1 0.1".to_vec()),
            InputFile::new("classes.txt", b"cat\n".to_vec()),
            InputFile::new("data.yaml", b"names: [dog]".to_vec()),
            InputFile::new("notes.pdf", vec![9]),
        ];
        let result = classify(inputs);
        assert_eq!(result.images.len(), 2);
        assert_eq!(result.labels.len(), 1);
        assert_eq!(result.labels[0].original_name, "a.txt");
        assert_eq!(
            result.class_manifest.map(|m| m.original_name),
            Some("classes.txt".to_string())
        );
    }

    #[test]
    fn test_sniffed_png_without_extension() {
        let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];
        let file = InputFile::new("upload", png.to_vec());
        assert_eq!(classify_kind(&file), FileKind::Image);
    }

    #[test]
    fn test_archive_expansion_keeps_images_only() {
        let zip = build_zip(&[
            ("train/cat/img.jpg", b"one"),
            ("train/dog/img.jpg", b"two"),
            ("train/readme.md", b"docs"),
            ("labels/img.txt", b"0 0.5 0.5 1 1"),
            ("__MACOSX/train/._img.jpg", b"fork"),
        ]);
        let result = classify(vec![InputFile::new("set.zip", zip)]);
        let names: Vec<_> = result.images.iter().map(|e| e.storage_name.clone()).collect();
        assert_eq!(names, ["train_cat_img.jpg", "train_dog_img.jpg"]);
        assert!(result.images.iter().all(|e| e.original_name == "img.jpg"));
        assert_ne!(result.images[0].id, result.images[1].id);
        assert!(result.labels.is_empty());
    }

    #[test]
    fn test_archive_classification_is_idempotent() {
        let zip = build_zip(&[("a.png", b"aa"), ("b/c.png", b"ccc")]);
        let modified = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let input = InputFile::new("set.zip", zip).with_modified(modified);

        let first = classify(vec![input.clone()]);
        let second = classify(vec![input]);
        let ids = |c: &ClassifiedFiles| c.images.iter().map(|e| e.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&first), ids(&second));

        let mut merged = first.clone();
        merged.merge(second);
        assert_eq!(merged.images.len(), 2);
    }

    #[test]
    fn test_duplicate_direct_selection_is_deduplicated() {
        let file = InputFile::new("a.png", vec![1, 2]);
        let result = classify(vec![file.clone(), file]);
        assert_eq!(result.images.len(), 1);
    }

    #[test]
    fn test_entry_reads_do_not_trust_declared_size() {
        let data = vec![7u8; 64];

        let bytes = read_entry(data.as_slice(), u64::MAX >> 1, u64::MAX >> 1).unwrap();
        assert_eq!(bytes, data);

        assert!(matches!(
            read_entry(data.as_slice(), u64::MAX, 1024),
            Err(Error::UnsupportedFormat(_))
        ));
        // A header understating the size is caught while reading.
        assert!(matches!(
            read_entry(data.as_slice(), 8, 32),
            Err(Error::UnsupportedFormat(_))
        ));
        assert_eq!(read_entry(data.as_slice(), 8, 64).unwrap().len(), 64);
    }

    #[test]
    fn test_unreadable_archive_is_skipped() {
        let result = classify(vec![
            InputFile::new("broken.zip", b"not a zip".to_vec()),
            InputFile::new("a.png", vec![1]),
        ]);
        assert_eq!(result.images.len(), 1);
    }
}
